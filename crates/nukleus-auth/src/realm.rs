//! Realm/scope authorization registry: packs realm identity and per-realm
//! scope set into a single 64-bit [`Authorization`] word, with bijective
//! resolve/lookup.

use std::collections::HashMap;

use nukleus_wire::{Authorization, MAX_REALMS, MAX_SCOPES_PER_REALM};

use crate::verifier::VerifiedClaims;

/// One `(issuer, audience)` binding within a [`Realm`], holding its own
/// realm bit and scope-bit assignments.
#[derive(Debug, Clone)]
pub struct RealmInfo {
    pub issuer: String,
    pub audience: String,
    realm_bit: u32,
    scope_bits: HashMap<String, u64>,
    next_scope_bit: u32,
}

impl RealmInfo {
    fn new(issuer: String, audience: String, realm_bit: u32) -> Self {
        Self {
            issuer,
            audience,
            realm_bit,
            scope_bits: HashMap::new(),
            next_scope_bit: 0,
        }
    }

    fn realm_id(&self) -> u64 {
        1u64 << (48 + self.realm_bit)
    }

    /// Interns `scope`, assigning a fresh bit on first sight. Returns `None`
    /// when the per-realm scope space (48 bits) is saturated.
    fn supply_scope_bit(&mut self, scope: &str) -> Option<u64> {
        if let Some(bit) = self.scope_bits.get(scope) {
            return Some(*bit);
        }
        if self.next_scope_bit >= MAX_SCOPES_PER_REALM {
            return None;
        }
        let bit = 1u64 << self.next_scope_bit;
        self.scope_bits.insert(scope.to_owned(), bit);
        self.next_scope_bit += 1;
        Some(bit)
    }

    /// Looks up an already-assigned scope bit, contributing `0` for unknown
    /// scopes (lookup never creates new scope bits).
    fn existing_scope_bit(&self, scope: &str) -> u64 {
        self.scope_bits.get(scope).copied().unwrap_or(0)
    }

    fn matches(&self, issuer: &str, audience: &str) -> bool {
        self.issuer == issuer && self.audience == audience
    }
}

/// A named trust domain; may hold multiple [`RealmInfo`]s, distinguished by
/// `(issuer, audience)`, each allocated a distinct realm bit.
#[derive(Debug, Clone, Default)]
pub struct Realm {
    pub name: String,
    infos: Vec<RealmInfo>,
}

impl Realm {
    fn new(name: String) -> Self {
        Self { name, infos: Vec::new() }
    }

    fn find_info(&self, issuer: &str, audience: &str) -> Option<&RealmInfo> {
        self.infos.iter().find(|info| info.matches(issuer, audience))
    }

    fn find_info_mut(&mut self, issuer: &str, audience: &str) -> Option<&mut RealmInfo> {
        self.infos.iter_mut().find(|info| info.matches(issuer, audience))
    }
}

/// Process-wide realm/scope bit registry.
///
/// `resolve` and `lookup` are the only two entry points that create or read
/// authorization words; `unresolve` reverses a `resolve`. Bits are never
/// reclaimed once assigned (matching the "first-seen" allocation the core
/// spec describes as a monotonic counter, not a free-list).
#[derive(Debug, Default)]
pub struct Realms {
    realms: HashMap<String, Realm>,
    next_realm_bit: u32,
}

impl Realms {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolves `(realm_name, issuer, audience, scopes)` into an authorization word.
    ///
    /// Returns [`Authorization::NONE`] when the realm space (16 bits) or this
    /// realm's scope space (48 bits) would be saturated by the request.
    pub fn resolve(&mut self, realm_name: &str, issuer: &str, audience: &str, scopes: &[String]) -> Authorization {
        let realm = self.realms.get(realm_name);
        let info = realm.and_then(|r| r.find_info(issuer, audience));

        let would_need_new_scopes = match info {
            Some(info) => scopes.iter().filter(|s| !info.scope_bits.contains_key(s.as_str())).count(),
            None => scopes.len(),
        };
        let existing_scope_count = info.map(|info| info.scope_bits.len()).unwrap_or(0);
        if u64::try_from(existing_scope_count + would_need_new_scopes).unwrap_or(u64::MAX) > u64::from(MAX_SCOPES_PER_REALM) {
            return Authorization::NONE;
        }

        if info.is_none() && self.next_realm_bit >= MAX_REALMS {
            return Authorization::NONE;
        }

        let realm_entry = self
            .realms
            .entry(realm_name.to_owned())
            .or_insert_with(|| Realm::new(realm_name.to_owned()));

        if realm_entry.find_info(issuer, audience).is_none() {
            let bit = self.next_realm_bit;
            self.next_realm_bit += 1;
            realm_entry
                .infos
                .push(RealmInfo::new(issuer.to_owned(), audience.to_owned(), bit));
        }

        let info = realm_entry
            .find_info_mut(issuer, audience)
            .expect("just inserted or already present");

        let mut authorization = info.realm_id();
        for scope in scopes {
            match info.supply_scope_bit(scope) {
                Some(bit) => authorization |= bit,
                None => return Authorization::NONE,
            }
        }

        Authorization::new(authorization)
    }

    /// Looks up the authorization carried by an already-verified token.
    ///
    /// The realm is selected by the token's `kid` header (acting as realm
    /// name); unknown scopes contribute `0` and are never created here.
    pub fn lookup(&self, realm_name: &str, claims: &VerifiedClaims) -> Authorization {
        let Some(realm) = self.realms.get(realm_name) else {
            return Authorization::NONE;
        };
        let Some(info) = realm.find_info(&claims.issuer, &claims.audience) else {
            return Authorization::NONE;
        };

        let mut authorization = info.realm_id();
        for scope in &claims.scopes {
            authorization |= info.existing_scope_bit(scope);
        }

        Authorization::new(authorization)
    }

    /// Reverses a `resolve`: removes the `RealmInfo` holding the single
    /// realm bit of `authorization`, and the containing realm if left empty.
    ///
    /// Returns `false` if `authorization` carries more than one realm bit,
    /// or no `RealmInfo` is found for it (including on a repeated call).
    pub fn unresolve(&mut self, authorization: Authorization) -> bool {
        if !authorization.is_valid() {
            return false;
        }
        let Some(bit) = authorization.realm_index() else {
            return false;
        };

        let mut removed = false;
        let mut empty_realms = Vec::new();
        for (name, realm) in self.realms.iter_mut() {
            if let Some(idx) = realm.infos.iter().position(|info| info.realm_bit == bit) {
                realm.infos.remove(idx);
                removed = true;
                if realm.infos.is_empty() {
                    empty_realms.push(name.clone());
                }
                break;
            }
        }
        for name in empty_realms {
            self.realms.remove(&name);
        }

        removed
    }
}
