//! JWK set loading: parse once at startup, index keys by `kid`.

use std::collections::HashMap;
use std::path::Path;

use jsonwebtoken::DecodingKey;
use serde_json::Value;

/// An immutable, loaded JWK entry.
pub struct Key {
    pub kid: String,
    pub alg: String,
    pub(crate) decoding_key: DecodingKey,
}

#[derive(Debug, thiserror::Error)]
pub enum KeyStoreError {
    #[error("malformed JWK set JSON")]
    Malformed(#[from] serde_json::Error),
    #[error("failed to read key file")]
    Io(#[from] std::io::Error),
    #[error("JWK set is not a JSON object with a `keys` array")]
    NotAKeySet,
    #[error("key at index {index} is missing `kid`")]
    MissingKid { index: usize },
    #[error("key {kid:?} is missing `alg`")]
    MissingAlg { kid: String },
    #[error("duplicate kid {kid:?}")]
    DuplicateKid { kid: String },
    #[error("key {kid:?} could not be turned into a decoding key")]
    BadKeyMaterial { kid: String, source: jsonwebtoken::errors::Error },
}

/// Immutable, process-lifetime `kid -> Key` map, safe for concurrent read.
#[derive(Default)]
pub struct KeyStore {
    keys: HashMap<String, Key>,
}

impl KeyStore {
    /// Loads a JWK set from its JSON text.
    ///
    /// Fails the build on: missing `kid`, missing `alg`, duplicate `kid`, or
    /// malformed JWK JSON.
    pub fn from_json(json: &str) -> Result<Self, KeyStoreError> {
        let root: Value = serde_json::from_str(json)?;
        let entries = root.get("keys").and_then(Value::as_array).ok_or(KeyStoreError::NotAKeySet)?;

        let mut keys = HashMap::with_capacity(entries.len());

        for (index, entry) in entries.iter().enumerate() {
            let kid = entry
                .get("kid")
                .and_then(Value::as_str)
                .ok_or(KeyStoreError::MissingKid { index })?
                .to_owned();

            let alg = entry
                .get("alg")
                .and_then(Value::as_str)
                .ok_or_else(|| KeyStoreError::MissingAlg { kid: kid.clone() })?
                .to_owned();

            if keys.contains_key(&kid) {
                return Err(KeyStoreError::DuplicateKid { kid });
            }

            let jwk: jsonwebtoken::jwk::Jwk =
                serde_json::from_value(entry.clone()).map_err(KeyStoreError::Malformed)?;
            let decoding_key =
                DecodingKey::from_jwk(&jwk).map_err(|source| KeyStoreError::BadKeyMaterial { kid: kid.clone(), source })?;

            keys.insert(kid.clone(), Key { kid, alg, decoding_key });
        }

        info!(kid_count = keys.len(), "Loaded JWK set");

        Ok(Self { keys })
    }

    /// Loads a JWK set from a filesystem path. A missing file is tolerated
    /// and yields an empty key store.
    pub fn from_path(path: &Path) -> Result<Self, KeyStoreError> {
        match std::fs::read_to_string(path) {
            Ok(contents) => Self::from_json(&contents),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(error) => Err(KeyStoreError::Io(error)),
        }
    }

    pub fn get(&self, kid: &str) -> Option<&Key> {
        self.keys.get(kid)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rsa_jwk_set(kid: &str, second: Option<&str>) -> String {
        // A syntactically valid RSA JWK; values are not a real key pair, only
        // `from_json`'s own rejection paths are exercised here (signature
        // verification is covered by the verifier's own tests with real keys).
        let one = format!(
            r#"{{"kty":"RSA","kid":"{kid}","alg":"RS256","n":"AQAB","e":"AQAB"}}"#
        );
        let keys = match second {
            Some(kid2) => format!(
                r#"{one}, {{"kty":"RSA","kid":"{kid2}","alg":"RS256","n":"AQAB","e":"AQAB"}}"#
            ),
            None => one,
        };
        format!(r#"{{"keys":[{keys}]}}"#)
    }

    #[test]
    fn missing_file_yields_empty_store() {
        let store = KeyStore::from_path(Path::new("/nonexistent/keys.jwk")).unwrap();
        assert!(store.is_empty());
    }

    #[test]
    fn missing_kid_is_rejected() {
        let json = r#"{"keys":[{"kty":"RSA","alg":"RS256","n":"AQAB","e":"AQAB"}]}"#;
        let err = KeyStore::from_json(json).unwrap_err();
        assert!(matches!(err, KeyStoreError::MissingKid { index: 0 }));
    }

    #[test]
    fn missing_alg_is_rejected() {
        let json = r#"{"keys":[{"kty":"RSA","kid":"k1","n":"AQAB","e":"AQAB"}]}"#;
        let err = KeyStore::from_json(json).unwrap_err();
        assert!(matches!(err, KeyStoreError::MissingAlg { kid } if kid == "k1"));
    }

    #[test]
    fn duplicate_kid_is_rejected() {
        let json = rsa_jwk_set("K", Some("K"));
        let err = KeyStore::from_json(&json).unwrap_err();
        assert!(matches!(err, KeyStoreError::DuplicateKid { kid } if kid == "K"));
    }
}
