//! Configuration for a standalone nukleus proxy process: the recognized
//! options from the core spec (§6) plus the ambient process-level options
//! every standalone binary in this stack carries (log file/level).

#[macro_use]
extern crate tracing;

use std::fs;

use anyhow::Context as _;
use camino::{Utf8Path, Utf8PathBuf};
use serde::Deserialize;

fn default_true() -> bool {
    true
}

fn default_keys_path() -> Utf8PathBuf {
    Utf8PathBuf::from("keys.jwk")
}

fn default_log_file() -> Utf8PathBuf {
    Utf8PathBuf::from("nukleus-proxyd.log")
}

fn default_log_filter() -> String {
    "info".to_owned()
}

/// A realm to pre-resolve at startup, so its bit assignment is deterministic
/// across restarts instead of depending on first-sight-at-runtime order.
#[derive(Debug, Clone, Deserialize)]
pub struct RealmSeed {
    pub name: String,
    pub issuer: String,
    pub audience: String,
    #[serde(default)]
    pub scopes: Vec<String>,
}

/// Deserialized, on-disk shape. Every field is optional so a minimal (or
/// empty) config file falls back to the documented defaults.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// If `false`, every grant's `expiresAt` is forced to [`nukleus_proxy::NEVER`]
    /// regardless of the verified token's `exp`.
    pub expire_in_flight_requests: bool,

    /// Prefix concatenated with `caf` to look up the challenge-delta claim
    /// (e.g. `"https://example.com/"` for claim `https://example.com/caf`).
    pub challenge_delta_claim_namespace: String,

    /// JWK set file location.
    pub keys: Utf8PathBuf,

    /// Rolling log file path/prefix.
    pub log_file: Utf8PathBuf,

    /// `tracing_subscriber::EnvFilter` directive string.
    pub log_filter: String,

    /// Realms to pre-resolve against the Realm Registry at startup.
    pub realms: Vec<RealmSeed>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            expire_in_flight_requests: default_true(),
            challenge_delta_claim_namespace: String::new(),
            keys: default_keys_path(),
            log_file: default_log_file(),
            log_filter: default_log_filter(),
            realms: Vec::new(),
        }
    }
}

impl Config {
    /// Loads a config from a JSON or TOML file (by extension); a missing
    /// file yields the default configuration.
    pub fn load(path: &Utf8Path) -> anyhow::Result<Self> {
        let contents = match fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                debug!(%path, "No config file found, using defaults");
                return Ok(Self::default());
            }
            Err(error) => return Err(error).with_context(|| format!("couldn't read config file at {path}")),
        };

        let config = match path.extension() {
            Some("toml") => toml::from_str(&contents).with_context(|| format!("invalid TOML config at {path}"))?,
            _ => serde_json::from_str(&contents).with_context(|| format!("invalid JSON config at {path}"))?,
        };

        info!(%path, "Loaded configuration");

        Ok(config)
    }

    /// The challenge-delta numeric-date claim name to read off a verified token.
    pub fn challenge_claim_name(&self) -> String {
        format!("{}caf", self.challenge_delta_claim_namespace)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let config = Config::load(Utf8Path::new("/nonexistent/nukleus.json")).unwrap();
        assert!(config.expire_in_flight_requests);
        assert_eq!(config.keys, Utf8PathBuf::from("keys.jwk"));
    }

    #[test]
    fn challenge_claim_name_concatenates_namespace() {
        let mut config = Config::default();
        config.challenge_delta_claim_namespace = "https://example.com/".to_owned();
        assert_eq!(config.challenge_claim_name(), "https://example.com/caf");
    }

    #[test]
    fn json_overrides_are_applied() {
        let json = r#"{"expire_in_flight_requests":false,"keys":"/etc/nukleus/keys.jwk"}"#;
        let config: Config = serde_json::from_str(json).unwrap();
        assert!(!config.expire_in_flight_requests);
        assert_eq!(config.keys, Utf8PathBuf::from("/etc/nukleus/keys.jwk"));
    }
}
