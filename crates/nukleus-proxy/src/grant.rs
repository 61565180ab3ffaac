//! Per-realm, per-affinity, per-subject shared [`AccessGrant`], reference
//! counted across the half-streams (and sibling streams) that hold it.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::{Rc, Weak};

use nukleus_auth::Authorization;
use nukleus_wire::{AffinityId, MAX_REALMS};
use smol_str::SmolStr;

/// Sentinel for "never expires" (`expireInFlightRequests = false`).
pub const NEVER: i64 = i64::MAX;

type Cleaner = Box<dyn FnOnce(Option<SmolStr>)>;

/// Shared authorization state for a subject on a given affinity.
pub struct AccessGrant {
    subject: Option<SmolStr>,
    authorization: Authorization,
    expires_at_millis: i64,
    challenge_delta_millis: i64,
    ref_count: u32,
    cleaner: Option<Cleaner>,
}

impl AccessGrant {
    fn new(subject: Option<SmolStr>, cleaner: Cleaner) -> Self {
        Self {
            subject,
            authorization: Authorization::NONE,
            expires_at_millis: NEVER,
            challenge_delta_millis: 0,
            ref_count: 0,
            cleaner: Some(cleaner),
        }
    }

    pub fn subject(&self) -> Option<&str> {
        self.subject.as_deref()
    }

    pub fn authorization(&self) -> Authorization {
        self.authorization
    }

    pub fn expires_at_millis(&self) -> i64 {
        self.expires_at_millis
    }

    pub fn challenge_delta_millis(&self) -> i64 {
        self.challenge_delta_millis
    }

    pub fn ref_count(&self) -> u32 {
        self.ref_count
    }

    /// Increments the reference count. The cleaner must still be installed
    /// (a released grant must never be acquired again).
    pub fn acquire(&mut self) {
        assert!(self.cleaner.is_some(), "acquire() on a released AccessGrant");
        self.ref_count += 1;
    }

    /// Decrements the reference count; at zero, invokes the cleaner (which
    /// removes this grant from its table slot) and poisons further use.
    ///
    /// Returns `true` iff this call brought the grant to zero references.
    pub fn release(&mut self) -> bool {
        assert!(self.ref_count > 0, "release() on an AccessGrant with no outstanding references");
        self.ref_count -= 1;
        if self.ref_count == 0 {
            if let Some(cleaner) = self.cleaner.take() {
                cleaner(self.subject.clone());
            }
            true
        } else {
            false
        }
    }

    /// Reauthorizes this grant with a newly verified token's claims.
    ///
    /// On the first binding (`ref_count == 0`), fields are set
    /// unconditionally and `false` is returned. Otherwise the update is
    /// applied only if monotonic: the existing authorization must be a
    /// subset of the new one, and the new expiry must be strictly later.
    /// `expiresAt`/`challengeDelta` are updated on a monotonic reauth, but
    /// `authorization`/`subject` are left untouched (a reauth never
    /// downgrades privileges already granted to in-flight streams).
    pub fn reauthorize(&mut self, new_auth: Authorization, new_expires_at_millis: i64, new_challenge_delta_millis: i64) -> bool {
        if self.ref_count == 0 {
            self.authorization = new_auth;
            self.expires_at_millis = new_expires_at_millis;
            self.challenge_delta_millis = new_challenge_delta_millis;
            return false;
        }

        let is_monotonic = new_auth.contains(self.authorization) && new_expires_at_millis > self.expires_at_millis;
        if is_monotonic {
            self.expires_at_millis = new_expires_at_millis;
            self.challenge_delta_millis = new_challenge_delta_millis;
        }
        is_monotonic
    }
}

type SubjectMap = Rc<RefCell<HashMap<SmolStr, Rc<RefCell<AccessGrant>>>>>;

/// `array[16] of mapping<affinityId, mapping<internedSubject, AccessGrant>>`,
/// indexed by realm bit position.
pub struct GrantTable {
    per_realm: Vec<HashMap<AffinityId, SubjectMap>>,
}

impl Default for GrantTable {
    fn default() -> Self {
        Self {
            per_realm: (0..MAX_REALMS).map(|_| HashMap::new()).collect(),
        }
    }
}

impl GrantTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the shared grant for `(realm_index, affinity, subject)`,
    /// creating it with `ref_count == 0` on first sight.
    ///
    /// An anonymous (`subject = None`) grant gets a no-op cleaner and is
    /// never inserted into the table — it is never shared.
    pub fn supply_grant(&mut self, realm_index: u32, affinity: AffinityId, subject: Option<&str>) -> Rc<RefCell<AccessGrant>> {
        let Some(subject) = subject else {
            return Rc::new(RefCell::new(AccessGrant::new(None, Box::new(|_| {}))));
        };

        let subject = SmolStr::new(subject);
        let realm_slot = &mut self.per_realm[realm_index as usize];
        let subject_map = realm_slot
            .entry(affinity)
            .or_insert_with(|| Rc::new(RefCell::new(HashMap::new())))
            .clone();

        if let Some(existing) = subject_map.borrow().get(&subject) {
            return existing.clone();
        }

        let weak_map: Weak<RefCell<HashMap<SmolStr, Rc<RefCell<AccessGrant>>>>> = Rc::downgrade(&subject_map);
        let cleaner_subject = subject.clone();
        let cleaner: Cleaner = Box::new(move |_| {
            if let Some(map) = weak_map.upgrade() {
                map.borrow_mut().remove(&cleaner_subject);
            }
        });

        let grant = Rc::new(RefCell::new(AccessGrant::new(Some(subject.clone()), cleaner)));
        subject_map.borrow_mut().insert(subject, grant.clone());
        grant
    }

    /// Number of live (subject-keyed) grants across the whole table.
    /// Test-only visibility into the invariant that a released grant leaves
    /// no trace in the table (core spec §8, properties 3/4).
    pub fn live_grant_count(&self) -> usize {
        self.per_realm
            .iter()
            .flat_map(|affinities| affinities.values())
            .map(|subjects| subjects.borrow().len())
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn auth(bits: u64) -> Authorization {
        Authorization::new(bits)
    }

    #[test]
    fn anonymous_grant_is_never_shared() {
        let mut table = GrantTable::new();
        let a = table.supply_grant(0, AffinityId(1), None);
        let b = table.supply_grant(0, AffinityId(1), None);
        assert!(!Rc::ptr_eq(&a, &b));
        assert_eq!(table.live_grant_count(), 0);
    }

    #[test]
    fn same_subject_and_affinity_share_one_grant() {
        let mut table = GrantTable::new();
        let a = table.supply_grant(0, AffinityId(1), Some("alice"));
        let b = table.supply_grant(0, AffinityId(1), Some("alice"));
        assert!(Rc::ptr_eq(&a, &b));
        assert_eq!(table.live_grant_count(), 1);
    }

    #[test]
    fn different_affinity_gets_distinct_grant() {
        let mut table = GrantTable::new();
        let a = table.supply_grant(0, AffinityId(1), Some("alice"));
        let b = table.supply_grant(0, AffinityId(2), Some("alice"));
        assert!(!Rc::ptr_eq(&a, &b));
    }

    #[test]
    fn ref_count_tracks_live_halves_and_cleans_up_at_zero() {
        let mut table = GrantTable::new();
        let grant = table.supply_grant(0, AffinityId(1), Some("alice"));
        grant.borrow_mut().reauthorize(auth(1 << 48), 1_000, 0);
        grant.borrow_mut().acquire();
        grant.borrow_mut().acquire();
        assert_eq!(grant.borrow().ref_count(), 2);
        assert_eq!(table.live_grant_count(), 1);

        assert!(!grant.borrow_mut().release());
        assert_eq!(table.live_grant_count(), 1);

        assert!(grant.borrow_mut().release());
        assert_eq!(table.live_grant_count(), 0);

        let fresh = table.supply_grant(0, AffinityId(1), Some("alice"));
        assert!(!Rc::ptr_eq(&grant, &fresh));
    }

    #[test]
    fn reauthorize_first_binding_is_unconditional() {
        let grant = Rc::new(RefCell::new(AccessGrant::new(Some(SmolStr::new("alice")), Box::new(|_| {}))));
        let extended = grant.borrow_mut().reauthorize(auth(1 << 48), 5_000, 100);
        assert!(!extended);
        assert_eq!(grant.borrow().expires_at_millis(), 5_000);
    }

    #[test]
    fn reauthorize_rejects_non_monotonic_authorization() {
        let grant = Rc::new(RefCell::new(AccessGrant::new(Some(SmolStr::new("alice")), Box::new(|_| {}))));
        grant.borrow_mut().reauthorize(auth((1 << 48) | 0b11), 1_000, 0);
        grant.borrow_mut().acquire();

        // New authorization drops a bit the existing grant has: not a superset.
        let extended = grant.borrow_mut().reauthorize(auth((1 << 48) | 0b01), 2_000, 0);
        assert!(!extended);
        assert_eq!(grant.borrow().expires_at_millis(), 1_000);
    }

    #[test]
    fn reauthorize_extends_on_monotonic_superset_and_later_expiry() {
        let grant = Rc::new(RefCell::new(AccessGrant::new(Some(SmolStr::new("alice")), Box::new(|_| {}))));
        grant.borrow_mut().reauthorize(auth((1 << 48) | 0b01), 1_000, 0);
        grant.borrow_mut().acquire();

        let extended = grant.borrow_mut().reauthorize(auth((1 << 48) | 0b11), 2_000, 50);
        assert!(extended);
        assert_eq!(grant.borrow().expires_at_millis(), 2_000);
        assert_eq!(grant.borrow().challenge_delta_millis(), 50);
    }
}
