//! Bounded LRU object store with byte-size accounting.

use std::collections::{BTreeMap, HashMap};

use crate::protocol::{GetResult, Status};
use crate::ring::{Cksum, HashRing, Key};

/// Counters describing the store's activity so far. Owned by the store and
/// read through it; there is no global collector.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub hits: u64,
    pub misses: u64,
    pub insertions: u64,
    pub replacements: u64,
    pub removals: u64,
    pub evictions: u64,
    pub cleaned: u64,
}

/// One cached object and its metadata. Replacing an object resets all of
/// its metadata.
#[derive(Debug, Clone)]
struct CacheEntry {
    /// The object's bytes.
    value: Vec<u8>,

    /// Free-form annotation attached by the writer, e.g. which frontend
    /// produced the object.
    #[allow(dead_code)]
    annotation: Option<String>,

    /// Writer-supplied checksum over the value bytes, stored verbatim
    /// and handed back on lookups.
    cksum: Option<Cksum>,

    /// Lookups served since insertion.
    accesses: u64,

    /// Recency tick of the last touch; indexes into the recency order.
    tick: u64,
}

/// Bounded LRU store. Capacity is counted in value bytes; inserting past
/// capacity evicts least-recently-used objects first. A single object
/// larger than the whole capacity is still admitted (alone).
pub struct LruStore {
    /// Objects by key.
    entries: HashMap<Key, CacheEntry>,

    /// Recency order: tick -> key, oldest tick first.
    order: BTreeMap<u64, Key>,

    /// Monotonic recency tick counter.
    tick: u64,

    /// Sum of stored value sizes in bytes.
    cur_bytes: usize,

    /// Capacity in value bytes.
    max_bytes: usize,

    /// Activity counters.
    stats: StoreStats,
}

impl LruStore {
    pub fn new(max_bytes: usize) -> Self {
        LruStore {
            entries: HashMap::new(),
            order: BTreeMap::new(),
            tick: 0,
            cur_bytes: 0,
            max_bytes,
            stats: StoreStats::default(),
        }
    }

    /// Number of stored objects.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Current total of stored value bytes.
    pub fn cur_bytes(&self) -> usize {
        self.cur_bytes
    }

    /// Activity counters so far.
    pub fn stats(&self) -> &StoreStats {
        &self.stats
    }

    /// Looks up an object and its stored checksum, counting and
    /// refreshing the object's recency on hit.
    pub fn get(&mut self, key: &Key) -> Option<(&[u8], Option<Cksum>)> {
        self.tick += 1;
        let tick = self.tick;
        if let Some(entry) = self.entries.get_mut(key) {
            self.order.remove(&entry.tick);
            self.order.insert(tick, *key);
            entry.tick = tick;
            entry.accesses += 1;
            self.stats.hits += 1;
            Some((&entry.value, entry.cksum))
        } else {
            self.stats.misses += 1;
            None
        }
    }

    /// Looks up many objects in request order.
    pub fn mget(&mut self, keys: &[Key]) -> Vec<GetResult> {
        keys.iter()
            .map(|key| match self.get(key) {
                Some((value, cksum)) => GetResult {
                    status: Status::Ok,
                    value: Some(value.to_vec()),
                    cksum,
                },
                None => GetResult::miss(Status::NotFound),
            })
            .collect()
    }

    /// Inserts or replaces an object, evicting LRU objects as needed to
    /// respect capacity. Replacement resets the object's metadata.
    pub fn put(
        &mut self,
        key: Key,
        value: Vec<u8>,
        annotation: Option<String>,
        cksum: Option<Cksum>,
    ) -> Status {
        let size = value.len();
        let replaced = self.delete(&key);

        // evict oldest first until the new object fits; an oversized
        // object into an empty store is admitted as-is
        while self.cur_bytes > 0 && self.cur_bytes + size > self.max_bytes {
            self.evict_oldest();
        }

        self.tick += 1;
        self.order.insert(self.tick, key);
        self.entries.insert(
            key,
            CacheEntry {
                value,
                annotation,
                cksum,
                accesses: 0,
                tick: self.tick,
            },
        );
        self.cur_bytes += size;

        if replaced {
            self.stats.replacements += 1;
            Status::Replaced
        } else {
            self.stats.insertions += 1;
            Status::Inserted
        }
    }

    /// Removes an object by key.
    pub fn remove(&mut self, key: &Key) -> bool {
        if self.delete(key) {
            self.stats.removals += 1;
            true
        } else {
            false
        }
    }

    /// Evicts every object whose ring owner is no longer `me`. A no-op on
    /// an empty ring (nothing is known about ownership yet). Returns how
    /// many objects were dropped.
    pub fn clean(&mut self, ring: &HashRing<String>, me: &str) -> usize {
        if ring.is_empty() {
            return 0;
        }
        let doomed: Vec<Key> = self
            .entries
            .keys()
            .filter(|key| {
                ring.owner_of(key).map_or(false, |owner| owner != me)
            })
            .copied()
            .collect();
        for key in &doomed {
            self.delete(key);
            self.stats.cleaned += 1;
        }
        doomed.len()
    }

    /// Removes an entry and fixes the accounting, without touching stats.
    fn delete(&mut self, key: &Key) -> bool {
        if let Some(entry) = self.entries.remove(key) {
            self.order.remove(&entry.tick);
            self.cur_bytes -= entry.value.len();
            true
        } else {
            false
        }
    }

    fn evict_oldest(&mut self) {
        if let Some((_, key)) = self.order.pop_first() {
            if let Some(entry) = self.entries.remove(&key) {
                self.cur_bytes -= entry.value.len();
                self.stats.evictions += 1;
            }
        }
    }
}

#[cfg(test)]
mod store_tests {
    use super::*;
    use crate::ring::KEY_SIZE;

    fn pos(byte: u8) -> Key {
        let mut bytes = [0u8; KEY_SIZE];
        bytes[0] = byte;
        Key::from_bytes(bytes)
    }

    #[test]
    fn insert_replace_statuses() {
        let mut store = LruStore::new(1000);
        let key = Key::of_name("obj");
        assert_eq!(
            store.put(key, b"one".to_vec(), None, None),
            Status::Inserted
        );
        assert_eq!(
            store.put(key, b"two!".to_vec(), None, None),
            Status::Replaced
        );
        assert_eq!(store.len(), 1);
        assert_eq!(store.cur_bytes(), 4);
        assert_eq!(store.get(&key), Some((&b"two!"[..], None)));
        assert_eq!(store.stats().insertions, 1);
        assert_eq!(store.stats().replacements, 1);
    }

    #[test]
    fn capacity_eviction() {
        // 100-byte store: A (60 bytes) then B (50 bytes) evicts A
        let mut store = LruStore::new(100);
        let a = Key::of_name("A");
        let b = Key::of_name("B");
        store.put(a, vec![0u8; 60], None, None);
        store.put(b, vec![0u8; 50], None, None);
        assert_eq!(store.get(&a), None);
        assert!(store.get(&b).is_some());
        assert_eq!(store.cur_bytes(), 50);
        assert_eq!(store.stats().evictions, 1);
    }

    #[test]
    fn lru_order_respects_touches() {
        let mut store = LruStore::new(100);
        let a = Key::of_name("A");
        let b = Key::of_name("B");
        let c = Key::of_name("C");
        store.put(a, vec![0u8; 40], None, None);
        store.put(b, vec![0u8; 40], None, None);
        // touching A makes B the eviction victim
        assert!(store.get(&a).is_some());
        store.put(c, vec![0u8; 40], None, None);
        assert!(store.get(&a).is_some());
        assert_eq!(store.get(&b), None);
        assert!(store.get(&c).is_some());
    }

    #[test]
    fn oversized_object_admitted_alone() {
        let mut store = LruStore::new(100);
        let x = Key::of_name("X");
        assert_eq!(
            store.put(x, vec![0u8; 150], None, None),
            Status::Inserted
        );
        assert_eq!(store.cur_bytes(), 150);
        // the next insert pushes the oversized object out
        let y = Key::of_name("Y");
        store.put(y, vec![0u8; 10], None, None);
        assert_eq!(store.get(&x), None);
        assert!(store.get(&y).is_some());
        assert_eq!(store.cur_bytes(), 10);
    }

    #[test]
    fn remove_accounting() {
        let mut store = LruStore::new(100);
        let key = Key::of_name("obj");
        store.put(key, vec![0u8; 30], None, None);
        assert!(store.remove(&key));
        assert!(!store.remove(&key));
        assert_eq!(store.cur_bytes(), 0);
        assert!(store.is_empty());
        assert_eq!(store.stats().removals, 1);
    }

    #[test]
    fn mget_in_request_order() {
        let mut store = LruStore::new(100);
        let a = Key::of_name("A");
        let b = Key::of_name("B");
        store.put(a, b"aa".to_vec(), None, None);
        let results = store.mget(&[b, a]);
        assert_eq!(results[0], GetResult::miss(Status::NotFound));
        assert_eq!(
            results[1],
            GetResult {
                status: Status::Ok,
                value: Some(b"aa".to_vec()),
                cksum: None,
            }
        );
    }

    #[test]
    fn checksum_carried_through() {
        let mut store = LruStore::new(100);
        let key = Key::of_name("obj");
        let cksum = Cksum::digest(b"bytes");
        store.put(key, b"bytes".to_vec(), None, Some(cksum));

        let (value, got) = store.get(&key).unwrap();
        assert!(got.unwrap().verify(value));

        let results = store.mget(&[key]);
        assert_eq!(results[0].cksum, Some(cksum));

        // replacing without a checksum resets the metadata
        store.put(key, b"fresh".to_vec(), None, None);
        assert_eq!(store.get(&key), Some((&b"fresh"[..], None)));
    }

    #[test]
    fn clean_drops_migrated_objects() {
        let mut store = LruStore::new(1000);
        // ring: positions 10 (mine) and 20 (other's)
        let mut ring: HashRing<String> = HashRing::new();
        ring.insert(pos(10), "me:41000".into());
        ring.insert(pos(20), "other:41001".into());

        store.put(pos(5), b"mine".to_vec(), None, None); // -> pos(10)
        store.put(pos(15), b"theirs".to_vec(), None, None); // -> pos(20)
        store.put(pos(25), b"wraps".to_vec(), None, None); // wrap -> pos(10)

        assert_eq!(store.clean(&ring, "me:41000"), 1);
        assert!(store.get(&pos(5)).is_some());
        assert_eq!(store.get(&pos(15)), None);
        assert!(store.get(&pos(25)).is_some());
        assert_eq!(store.stats().cleaned, 1);
    }

    #[test]
    fn clean_noop_on_empty_ring() {
        let mut store = LruStore::new(1000);
        store.put(pos(5), b"keep".to_vec(), None, None);
        let ring: HashRing<String> = HashRing::new();
        assert_eq!(store.clean(&ring, "me:41000"), 0);
        assert_eq!(store.len(), 1);
    }
}
