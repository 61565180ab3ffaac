//! Bearer extraction and JWS validation.

use std::sync::OnceLock;

use jsonwebtoken::{decode, decode_header, Algorithm, Validation};
use nukleus_wire::HttpExtension;
use regex::Regex;
use serde_json::Value;

use crate::key_store::KeyStore;

/// Claims pulled off a verified token, relevant to realm/scope resolution
/// and to the proxy pair's expiry/challenge timer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedClaims {
    pub issuer: String,
    pub audience: String,
    pub subject: Option<String>,
    pub scopes: Vec<String>,
    pub expires_at_millis: Option<i64>,
    pub not_before_millis: Option<i64>,
    pub challenge_after_millis: Option<i64>,
}

/// A verified token: the realm name (the `kid` header) plus its claims.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedToken {
    pub realm_name: String,
    pub claims: VerifiedClaims,
}

fn access_token_query_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?:\?|.*?&)access_token=([^&#]+)(?:&.*)?").expect("valid regex"))
}

/// Extracts the bearer token from an HTTP BEGIN extension.
///
/// The `authorization` header takes precedence over the `access_token` query
/// parameter on `:path`, as a natural consequence of checking it second.
pub fn extract_bearer(extension: &HttpExtension) -> Option<String> {
    let mut token = None;

    if let Some(path) = extension.get(":path") {
        if let Some(captures) = access_token_query_re().captures(path) {
            token = captures.get(1).map(|m| m.as_str().to_owned());
        }
    }

    if let Some(header) = extension.get("authorization") {
        if let Some(rest) = header.strip_prefix("Bearer ") {
            token = Some(rest.to_owned());
        }
    }

    token
}

#[derive(Debug, thiserror::Error)]
enum VerifyError {
    #[error("malformed JWS header")]
    Header(#[from] jsonwebtoken::errors::Error),
    #[error("no key for kid {0:?}")]
    UnknownKid(Option<String>),
    #[error("token algorithm does not match key algorithm")]
    AlgMismatch,
    #[error("signature verification or claims check failed")]
    Rejected,
    #[error("token carries no kid")]
    MissingKid,
}

/// Validates bearer tokens against a [`KeyStore`].
///
/// `challenge_claim_name` is the full claim name used to look up the
/// challenge-after numeric date (`<challengeDeltaClaimNamespace>caf` by
/// default, per the core spec's configuration options).
pub struct TokenVerifier {
    challenge_claim_name: String,
}

impl TokenVerifier {
    pub fn new(challenge_claim_name: impl Into<String>) -> Self {
        Self {
            challenge_claim_name: challenge_claim_name.into(),
        }
    }

    /// Validates the JWS compact serialization `token` against `key_store`.
    ///
    /// Per the core spec, any parse/verify failure is treated as "not
    /// verified": the caller falls back to pass-through authorization
    /// rather than propagating an error.
    pub fn verify(&self, key_store: &KeyStore, token: &str) -> Option<VerifiedToken> {
        match self.verify_impl(key_store, token) {
            Ok(verified) => Some(verified),
            Err(error) => {
                debug!(%error, "Token not verified, falling back to pass-through authorization");
                None
            }
        }
    }

    fn verify_impl(&self, key_store: &KeyStore, token: &str) -> Result<VerifiedToken, VerifyError> {
        let header = decode_header(token)?;
        let kid = header.kid.clone();

        let key = kid
            .as_deref()
            .and_then(|kid| key_store.get(kid))
            .ok_or_else(|| VerifyError::UnknownKid(kid.clone()))?;

        if key.alg != alg_name(header.alg) {
            return Err(VerifyError::AlgMismatch);
        }

        let mut validation = Validation::new(header.alg);
        validation.validate_exp = true;
        validation.validate_nbf = true;
        validation.validate_aud = false;
        validation.required_spec_claims.clear();

        let data = decode::<Value>(token, &key.decoding_key, &validation).map_err(|_| VerifyError::Rejected)?;
        let claims = data.claims;

        let issuer = claims.get("iss").and_then(Value::as_str).unwrap_or_default().to_owned();
        let audience = claims.get("aud").and_then(Value::as_str).unwrap_or_default().to_owned();
        let subject = claims.get("sub").and_then(Value::as_str).map(str::to_owned);
        let scopes = claims
            .get("scope")
            .and_then(Value::as_str)
            .map(|s| s.split(' ').filter(|s| !s.is_empty()).map(str::to_owned).collect())
            .unwrap_or_default();
        let expires_at_millis = claims.get("exp").and_then(Value::as_i64).map(|secs| secs * 1000);
        let not_before_millis = claims.get("nbf").and_then(Value::as_i64).map(|secs| secs * 1000);
        let challenge_after_millis = claims
            .get(self.challenge_claim_name.as_str())
            .and_then(Value::as_i64)
            .map(|secs| secs * 1000);

        let kid = kid.ok_or(VerifyError::MissingKid)?;

        Ok(VerifiedToken {
            realm_name: kid,
            claims: VerifiedClaims {
                issuer,
                audience,
                subject,
                scopes,
                expires_at_millis,
                not_before_millis,
                challenge_after_millis,
            },
        })
    }
}

fn alg_name(alg: Algorithm) -> &'static str {
    match alg {
        Algorithm::HS256 => "HS256",
        Algorithm::HS384 => "HS384",
        Algorithm::HS512 => "HS512",
        Algorithm::RS256 => "RS256",
        Algorithm::RS384 => "RS384",
        Algorithm::RS512 => "RS512",
        Algorithm::PS256 => "PS256",
        Algorithm::PS384 => "PS384",
        Algorithm::PS512 => "PS512",
        Algorithm::ES256 => "ES256",
        Algorithm::ES384 => "ES384",
        Algorithm::EdDSA => "EdDSA",
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[test]
    fn extract_bearer_prefers_authorization_header() {
        let ext = HttpExtension::new()
            .with_header(":path", "/ws?access_token=from-query")
            .with_header("authorization", "Bearer from-header");
        assert_eq!(extract_bearer(&ext).as_deref(), Some("from-header"));
    }

    #[test]
    fn extract_bearer_falls_back_to_query() {
        let ext = HttpExtension::new().with_header(":path", "/ws?access_token=from-query&x=1");
        assert_eq!(extract_bearer(&ext).as_deref(), Some("from-query"));
    }

    #[test]
    fn extract_bearer_absent_is_none() {
        let ext = HttpExtension::new().with_header(":path", "/ws");
        assert_eq!(extract_bearer(&ext), None);
    }

    const KID: &str = "K1";
    const SECRET: &[u8] = b"table-driven-test-secret-value";

    fn store() -> KeyStore {
        let jwk_set = serde_json::json!({
            "keys": [{"kty": "oct", "kid": KID, "alg": "HS256", "k": base64url(SECRET)}]
        });
        KeyStore::from_json(&jwk_set.to_string()).unwrap()
    }

    fn base64url(bytes: &[u8]) -> String {
        use base64::Engine as _;
        base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
    }

    fn sign(kid: Option<&str>, alg: Algorithm, secret: &[u8], exp_offset_secs: i64) -> String {
        let mut header = jsonwebtoken::Header::new(alg);
        header.kid = kid.map(str::to_owned);
        let now = 1_700_000_000;
        let claims = serde_json::json!({
            "iss": "issuer",
            "aud": "audience",
            "sub": "subject",
            "scope": "read write",
            "exp": now + exp_offset_secs,
        });
        jsonwebtoken::encode(&header, &claims, &jsonwebtoken::EncodingKey::from_secret(secret)).unwrap()
    }

    #[rstest]
    #[case::valid(Some(KID), Algorithm::HS256, SECRET, 60, true)]
    #[case::expired(Some(KID), Algorithm::HS256, SECRET, -60, false)]
    #[case::missing_kid(None, Algorithm::HS256, SECRET, 60, false)]
    #[case::unknown_kid(Some("does-not-exist"), Algorithm::HS256, SECRET, 60, false)]
    #[case::alg_mismatch(Some(KID), Algorithm::HS384, SECRET, 60, false)]
    #[case::wrong_secret(Some(KID), Algorithm::HS256, b"a-totally-different-secret", 60, false)]
    fn verify_rejects_every_malformed_shape(
        #[case] kid: Option<&str>,
        #[case] alg: Algorithm,
        #[case] secret: &[u8],
        #[case] exp_offset_secs: i64,
        #[case] expect_verified: bool,
    ) {
        let key_store = store();
        let verifier = TokenVerifier::new("caf");
        let token = sign(kid, alg, secret, exp_offset_secs);

        let verified = verifier.verify(&key_store, &token);
        assert_eq!(verified.is_some(), expect_verified);
    }
}
