//! Per-key chain protocol state.
//!
//! A keyholder tracks the in-flight window for one `(region, key)` pair:
//! updates pending in the chain, updates blocked behind a fresh write,
//! and chain messages deferred until their predecessor arrives. The
//! table stripes locks over keyholders; the map's own mutex only guards
//! insert, lookup, and remove.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use tessera_core::{EntityId, Nonce, RegionId, Version};
use xxhash_rust::xxh3::xxh3_64;

pub const DEFAULT_LOCK_STRIPES: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KeyPair {
    pub region: RegionId,
    pub key: Vec<u8>,
}

impl KeyPair {
    pub fn new(region: RegionId, key: impl Into<Vec<u8>>) -> Self {
        Self {
            region,
            key: key.into(),
        }
    }
}

/// One update travelling through the chain.
#[derive(Debug, Clone)]
pub struct PendingOp {
    pub has_value: bool,
    pub value: Vec<Vec<u8>>,
    pub prev: RegionId,
    pub this_old: RegionId,
    pub this_new: RegionId,
    pub next: RegionId,
    pub fresh: bool,
    pub mayack: bool,
    pub acked: bool,
    pub ondisk: bool,
    pub client: Option<(EntityId, Nonce)>,
}

impl PendingOp {
    pub fn new(has_value: bool, value: Vec<Vec<u8>>) -> Self {
        Self {
            has_value,
            value,
            prev: RegionId::default(),
            this_old: RegionId::default(),
            this_new: RegionId::default(),
            next: RegionId::default(),
            fresh: false,
            mayack: false,
            acked: false,
            ondisk: false,
            client: None,
        }
    }

    pub fn with_client(has_value: bool, value: Vec<Vec<u8>>, client: EntityId, nonce: Nonce) -> Self {
        Self {
            client: Some((client, nonce)),
            ..Self::new(has_value, value)
        }
    }
}

/// A chain message that arrived before its predecessor.
#[derive(Debug, Clone)]
pub struct DeferredOp {
    pub has_value: bool,
    pub value: Vec<Vec<u8>>,
    pub from: EntityId,
}

#[derive(Debug, Default)]
pub struct Keyholder {
    pub pending: BTreeMap<Version, PendingOp>,
    pub blocked: BTreeMap<Version, PendingOp>,
    pub deferred: BTreeMap<Version, DeferredOp>,
}

impl Keyholder {
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty() && self.blocked.is_empty() && self.deferred.is_empty()
    }

    /// The most recent version this holder knows in memory, preferring
    /// blocked over pending.
    pub fn latest(&self) -> Option<(Version, &PendingOp)> {
        self.blocked
            .last_key_value()
            .or_else(|| self.pending.last_key_value())
            .map(|(v, op)| (*v, op))
    }

    pub fn oldest_pending_version(&self) -> Option<Version> {
        self.pending.first_key_value().map(|(v, _)| *v)
    }
}

pub struct KeyholderTable {
    stripes: Vec<Mutex<()>>,
    map: Mutex<HashMap<KeyPair, Arc<Mutex<Keyholder>>>>,
}

impl KeyholderTable {
    pub fn new(stripes: usize) -> Self {
        Self {
            stripes: (0..stripes.max(1)).map(|_| Mutex::new(())).collect(),
            map: Mutex::new(HashMap::new()),
        }
    }

    fn stripe_index(&self, kp: &KeyPair) -> usize {
        let region_hash = xxh3_64(&kp.region.to_bytes());
        let key_hash = xxh3_64(&kp.key);
        ((region_hash ^ key_hash) % self.stripes.len() as u64) as usize
    }

    /// Serialize all work on one `(region, key)`. Two pairs on the same
    /// stripe serialize with each other too; that is the deal.
    pub fn lock(&self, kp: &KeyPair) -> MutexGuard<'_, ()> {
        let stripe = &self.stripes[self.stripe_index(kp)];
        stripe.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn get_or_create(&self, kp: &KeyPair) -> Arc<Mutex<Keyholder>> {
        let mut map = self.map.lock().unwrap_or_else(|e| e.into_inner());
        map.entry(kp.clone())
            .or_insert_with(|| Arc::new(Mutex::new(Keyholder::default())))
            .clone()
    }

    pub fn get(&self, kp: &KeyPair) -> Option<Arc<Mutex<Keyholder>>> {
        let map = self.map.lock().unwrap_or_else(|e| e.into_inner());
        map.get(kp).cloned()
    }

    pub fn remove(&self, kp: &KeyPair) {
        let mut map = self.map.lock().unwrap_or_else(|e| e.into_inner());
        map.remove(kp);
    }

    /// Snapshot of live key pairs, for the retransmission sweep.
    pub fn pairs(&self) -> Vec<KeyPair> {
        let map = self.map.lock().unwrap_or_else(|e| e.into_inner());
        map.keys().cloned().collect()
    }

    /// Visit every keyholder outside its stripe lock; used only during
    /// reconfiguration, which owns the world.
    pub fn for_each(&self, mut f: impl FnMut(&KeyPair, &mut Keyholder) -> bool) {
        let mut map = self.map.lock().unwrap_or_else(|e| e.into_inner());
        map.retain(|kp, kh| {
            let mut kh = kh.lock().unwrap_or_else(|e| e.into_inner());
            f(kp, &mut kh)
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_core::SpaceId;

    fn kp(key: &[u8]) -> KeyPair {
        KeyPair::new(RegionId::new(SpaceId(1), 0, 0, 0), key)
    }

    #[test]
    fn keyholders_are_created_lazily_and_removed() {
        let table = KeyholderTable::new(4);
        assert!(table.get(&kp(b"a")).is_none());

        let kh = table.get_or_create(&kp(b"a"));
        assert!(kh.lock().unwrap().is_empty());
        assert!(table.get(&kp(b"a")).is_some());

        table.remove(&kp(b"a"));
        assert!(table.get(&kp(b"a")).is_none());
    }

    #[test]
    fn same_pair_maps_to_the_same_stripe() {
        let table = KeyholderTable::new(8);
        assert_eq!(table.stripe_index(&kp(b"x")), table.stripe_index(&kp(b"x")));
    }

    #[test]
    fn latest_prefers_blocked_over_pending() {
        let mut kh = Keyholder::default();
        kh.pending.insert(3, PendingOp::new(true, vec![b"p".to_vec()]));
        kh.blocked.insert(5, PendingOp::new(true, vec![b"b".to_vec()]));

        let (version, op) = kh.latest().unwrap();
        assert_eq!(version, 5);
        assert_eq!(op.value[0], b"b");
    }

    #[test]
    fn for_each_can_drop_holders() {
        let table = KeyholderTable::new(2);
        table.get_or_create(&kp(b"keep"));
        table.get_or_create(&kp(b"drop"));

        table.for_each(|kp, _| kp.key == b"keep");

        assert!(table.get(&kp(b"keep")).is_some());
        assert!(table.get(&kp(b"drop")).is_none());
    }
}
