//! Standalone nukleus proxy process.
//!
//! Wires the Key Store, Realm Registry, and Token Verifier from
//! `nukleus-auth` into a `nukleus_proxy::Proxy`, and drives its
//! expiry/challenge timer with `tokio::time`. The router and wire codec a
//! real deployment would sit behind are out of scope here: this binary
//! plays both roles with a single simulated stream so the pipeline can be
//! observed end to end.

#[macro_use]
extern crate tracing;

use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Context as _;
use base64::Engine as _;
use camino::Utf8PathBuf;
use jsonwebtoken::{encode, EncodingKey, Header as JwtHeader};
use nukleus_auth::{extract_bearer, KeyStore, Realms, TokenVerifier};
use nukleus_config::Config;
use nukleus_log::StaticLogConfig;
use nukleus_proxy::{Clock, FrameSink, Proxy, SignalingExecutor};
use nukleus_task::ShutdownHandle;
use nukleus_wire::{AffinityId, Authorization, BeginFrame, Capabilities, DataFrame, HttpExtension, RouteId, StreamId, StreamRef, WindowFrame};
use serde_json::json;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

struct ProxydLogConfig;

impl StaticLogConfig for ProxydLogConfig {
    const MAX_BYTES_PER_LOG_FILE: u64 = 10 * 1024 * 1024;
    const MAX_LOG_FILES: usize = 10;
    const LOG_FILE_PREFIX: &'static str = "nukleus-proxyd";
}

/// A `FrameSink` that logs every emitted frame instead of writing it to a
/// real wire codec.
struct ConsoleFrameSink;

impl FrameSink for ConsoleFrameSink {
    fn do_begin(
        &mut self,
        stream: StreamRef,
        trace: u64,
        authorization: Authorization,
        affinity: AffinityId,
        extension: HttpExtension,
        capabilities: Capabilities,
    ) {
        info!(%stream, trace, %authorization, affinity = affinity.0, ?extension, ?capabilities, "BEGIN");
    }

    fn do_data(
        &mut self,
        stream: StreamRef,
        trace: u64,
        _padding: u16,
        authorization: Authorization,
        _group_id: u32,
        payload: Vec<u8>,
        _extension: HttpExtension,
    ) {
        info!(%stream, trace, %authorization, bytes = payload.len(), "DATA");
    }

    fn do_end(&mut self, stream: StreamRef, trace: u64, authorization: Authorization, _extension: HttpExtension) {
        info!(%stream, trace, %authorization, "END");
    }

    fn do_abort(&mut self, stream: StreamRef, trace: u64, authorization: Authorization) {
        info!(%stream, trace, %authorization, "ABORT");
    }

    fn do_window(&mut self, stream: StreamRef, credit: u32, _padding: u16, _group_id: u32, capabilities: Capabilities) {
        debug!(%stream, credit, ?capabilities, "WINDOW");
    }

    fn do_reset(&mut self, stream: StreamRef) {
        info!(%stream, "RESET");
    }

    fn do_signal(&mut self, stream: StreamRef, signal_id: u32, _trace: u64, extension: HttpExtension) {
        info!(%stream, signal_id, ?extension, "SIGNAL");
    }

    fn clear_throttle(&mut self, accept_initial_id: StreamId) {
        debug!(%accept_initial_id, "clear_throttle");
    }
}

/// Schedules `GRANT_VALIDATION` signals with `tokio::time::sleep`, feeding
/// fired streams back into the main loop over an unbounded channel.
struct TokioSignalingExecutor {
    fire_tx: mpsc::UnboundedSender<StreamRef>,
}

impl SignalingExecutor for TokioSignalingExecutor {
    type TimerHandle = JoinHandle<()>;

    fn schedule(&mut self, stream: StreamRef, signal_id: u32, deadline_millis: i64) -> Self::TimerHandle {
        let tx = self.fire_tx.clone();
        let delay_ms = deadline_millis.saturating_sub(now_millis()).max(0);
        let delay_ms = u64::try_from(delay_ms).unwrap_or(0);
        trace!(%stream, signal_id, delay_ms, "scheduling timer");
        tokio::task::spawn_local(async move {
            tokio::time::sleep(tokio::time::Duration::from_millis(delay_ms)).await;
            let _ = tx.send(stream);
        })
    }

    fn cancel(&mut self, handle: Self::TimerHandle) {
        handle.abort();
    }
}

struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> i64 {
        now_millis()
    }
}

fn now_millis() -> i64 {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock is after the epoch")
        .as_millis();
    i64::try_from(millis).unwrap_or(i64::MAX)
}

/// Mints a demo HS256 JWT and a matching single-key JWK set, used only when
/// no on-disk key store is configured, so the binary is runnable with zero
/// setup.
fn demo_key_store_and_token(challenge_claim_name: &str) -> anyhow::Result<(KeyStore, String)> {
    const KID: &str = "demo";
    let secret = b"nukleus-proxyd-demo-secret-change-me";
    let secret_b64 = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(secret);

    let jwk_set = json!({
        "keys": [{
            "kty": "oct",
            "kid": KID,
            "alg": "HS256",
            "k": secret_b64,
        }]
    });
    let key_store = KeyStore::from_json(&jwk_set.to_string()).context("building the demo key store")?;

    let now = now_millis() / 1000;
    let mut claims = serde_json::Map::new();
    claims.insert("iss".to_owned(), json!("nukleus-proxyd-demo"));
    claims.insert("aud".to_owned(), json!("nukleus-proxyd-demo"));
    claims.insert("sub".to_owned(), json!("demo-subject"));
    claims.insert("scope".to_owned(), json!("read write"));
    claims.insert("exp".to_owned(), json!(now + 8));
    claims.insert("nbf".to_owned(), json!(now));
    claims.insert(challenge_claim_name.to_owned(), json!(now + 4));
    let claims = serde_json::Value::Object(claims);
    let mut header = JwtHeader::new(jsonwebtoken::Algorithm::HS256);
    header.kid = Some(KID.to_owned());
    let token = encode(&header, &claims, &EncodingKey::from_secret(secret)).context("minting the demo token")?;

    Ok((key_store, token))
}

fn stream(route: u64, id: u64) -> StreamRef {
    StreamRef {
        route_id: RouteId(route),
        stream_id: StreamId(id),
    }
}

async fn run(config_path: Utf8PathBuf) -> anyhow::Result<()> {
    let config = Config::load(&config_path).context("loading configuration")?;

    let _logger_guard = nukleus_log::init::<ProxydLogConfig>(&config.log_file, &config.log_filter, None)
        .context("initializing logging")?;

    info!(%config_path, "Starting nukleus-proxyd");

    let mut key_store = KeyStore::from_path(config.keys.as_std_path()).context("loading JWK set")?;
    let mut realms = Realms::new();
    for seed in &config.realms {
        let auth = realms.resolve(&seed.name, &seed.issuer, &seed.audience, &seed.scopes);
        info!(realm = seed.name, %auth, "Pre-resolved realm from configuration");
    }

    let demo_token = if key_store.is_empty() {
        warn!("No configured key store; minting a throwaway demo key and token");
        let (demo_store, token) = demo_key_store_and_token(&config.challenge_claim_name())?;
        key_store = demo_store;
        token
    } else {
        anyhow::bail!("a configured key store requires a real bearer token; this demo only mints one for the default key store");
    };

    let verifier = TokenVerifier::new(config.challenge_claim_name());

    let (shutdown_handle, mut shutdown_signal) = ShutdownHandle::new();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        shutdown_handle.signal();
    });

    let local = tokio::task::LocalSet::new();
    local
        .run_until(async move {
            let (fire_tx, mut fire_rx) = mpsc::unbounded_channel::<StreamRef>();

            let mut proxy: Proxy<JoinHandle<()>> = Proxy::new();
            let mut sink = ConsoleFrameSink;
            let mut exec = TokioSignalingExecutor { fire_tx };
            let clock = SystemClock;

            let accept_initial = stream(1, 1);
            let connect_initial = stream(2, 1);
            let connect_reply = stream(2, 2);
            let accept_reply = stream(1, 2);

            let extension = HttpExtension::new().with_header("authorization", format!("Bearer {demo_token}"));
            let begin = BeginFrame {
                stream: accept_initial,
                trace: 1,
                authorization: Authorization::NONE,
                affinity: AffinityId(1),
                extension,
                capabilities: Capabilities::CHALLENGE,
            };

            let bearer = extract_bearer(&begin.extension);
            let verified = bearer.as_deref().and_then(|token| verifier.verify(&key_store, token));

            let (realm_index, subject, authorization, expires_at_millis, challenge_delta_millis) = match &verified {
                Some(verified) => {
                    let auth = realms.lookup(&verified.realm_name, &verified.claims);
                    let expires_at_millis = if config.expire_in_flight_requests {
                        verified.claims.expires_at_millis.unwrap_or(nukleus_proxy::NEVER)
                    } else {
                        nukleus_proxy::NEVER
                    };
                    let challenge_delta_millis = match (verified.claims.challenge_after_millis, verified.claims.expires_at_millis)
                    {
                        (Some(ca), Some(exp)) if exp > ca => exp - ca,
                        _ => 0,
                    };
                    (
                        auth.realm_index(),
                        verified.claims.subject.clone(),
                        auth,
                        expires_at_millis,
                        challenge_delta_millis,
                    )
                }
                None => (None, None, begin.authorization, nukleus_proxy::NEVER, 0),
            };

            proxy.open(
                &begin,
                connect_initial,
                connect_reply,
                accept_reply,
                realm_index,
                subject.as_deref(),
                authorization,
                expires_at_millis,
                challenge_delta_millis,
                &mut sink,
                &mut exec,
            );

            // Simulate the downstream's own BEGIN completing the reply half.
            let downstream_begin = BeginFrame {
                stream: connect_reply,
                trace: 1,
                authorization,
                affinity: AffinityId(1),
                extension: HttpExtension::new(),
                capabilities: Capabilities::CHALLENGE,
            };
            proxy.new_reply_stream(&downstream_begin, &mut sink);

            proxy.on_data(
                DataFrame {
                    stream: accept_initial,
                    trace: 2,
                    padding: 0,
                    authorization: Authorization::NONE,
                    group_id: 0,
                    payload: b"hello from the accept side".to_vec(),
                    extension: HttpExtension::new(),
                },
                &mut sink,
            );

            // WINDOW travels in the reverse direction, addressed to the half's target;
            // exercises the `by_target` routing path alongside the `by_source` one above.
            proxy.on_window(
                WindowFrame {
                    stream: connect_initial,
                    credit: 65_536,
                    padding: 0,
                    group_id: 0,
                    capabilities: Capabilities::CHALLENGE,
                },
                &mut sink,
            );

            info!(live_grants = proxy.live_grant_count(), "Proxy pair opened, waiting for expiry/challenge or Ctrl-C");

            loop {
                tokio::select! {
                    Some(fired) = fire_rx.recv() => {
                        proxy.on_timer_fire(fired, &mut sink, &mut exec, &clock);
                        if proxy.live_grant_count() == 0 {
                            info!("Demo stream torn down, exiting");
                            break;
                        }
                    }
                    () = shutdown_signal.wait() => {
                        info!("Shutdown requested");
                        break;
                    }
                }
            }

            Ok(())
        })
        .await
}

fn parse_config_path() -> anyhow::Result<Utf8PathBuf> {
    let mut args = std::env::args().skip(1);
    let mut config_path = Utf8PathBuf::from("nukleus.json");

    while let Some(arg) = args.next() {
        if arg == "--config-path" {
            let value = args.next().context("--config-path expects a value")?;
            config_path = Utf8PathBuf::from(value);
        } else if arg == "--help" || arg == "-h" {
            println!("usage: nukleus-proxyd [--config-path <path>]");
            std::process::exit(0);
        } else {
            anyhow::bail!("unrecognized argument: {arg}");
        }
    }

    Ok(config_path)
}

fn main() -> anyhow::Result<()> {
    let config_path = parse_config_path()?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building the tokio runtime")?
        .block_on(run(config_path))
}
