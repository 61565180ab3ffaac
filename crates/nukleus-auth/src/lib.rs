//! Key Store, Realm Registry, and Token Verifier: the authorization triad
//! consumed by a proxy pair before it opens a forwarding stream.

#[macro_use]
extern crate tracing;

mod key_store;
mod realm;
mod verifier;

pub use key_store::{Key, KeyStore, KeyStoreError};
pub use realm::{Realm, RealmInfo, Realms};
pub use verifier::{extract_bearer, TokenVerifier, VerifiedClaims, VerifiedToken};

pub use nukleus_wire::{Authorization, MAX_REALMS, MAX_SCOPES_PER_REALM, REALM_MASK, SCOPE_MASK};
