//! Consistent-hash ring mapping keys to owning nodes.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::hash::Hash;

use crate::ring::key::Key;

/// A consistent-hash ring: an ordered map from ring positions to owners.
/// Each node typically occupies multiple positions (virtual nodes). A data
/// key belongs to its successor node, i.e. the node at the smallest ring
/// position >= the key, wrapping around to the smallest position overall.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HashRing<O> {
    /// Ring positions to owner values, kept in key order.
    nodes: BTreeMap<Key, O>,
}

impl<O> Default for HashRing<O> {
    fn default() -> Self {
        HashRing {
            nodes: BTreeMap::new(),
        }
    }
}

impl<O> HashRing<O>
where
    O: Clone + Eq + fmt::Display,
{
    /// Creates an empty ring.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of ring positions (not distinct owners).
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Removes all positions.
    pub fn clear(&mut self) {
        self.nodes.clear();
    }

    /// Inserts a position owned by `owner`, returning the previous owner of
    /// that exact position if there was one.
    pub fn insert(&mut self, key: Key, owner: O) -> Option<O> {
        self.nodes.insert(key, owner)
    }

    /// Removes an exact position from the ring.
    pub fn remove(&mut self, key: &Key) -> Option<O> {
        self.nodes.remove(key)
    }

    /// Removes all positions owned by `owner`, returning how many were
    /// removed.
    pub fn remove_owner(&mut self, owner: &O) -> usize {
        let before = self.nodes.len();
        self.nodes.retain(|_, o| o != owner);
        before - self.nodes.len()
    }

    /// Finds the successor position of `key`: the smallest ring position
    /// >= `key`, wrapping around to the smallest position overall. Returns
    /// `None` only on an empty ring.
    pub fn successor(&self, key: &Key) -> Option<(&Key, &O)> {
        self.nodes
            .range(*key..)
            .next()
            .or_else(|| self.nodes.iter().next())
    }

    /// The owner responsible for `key` under consistent hashing.
    pub fn owner_of(&self, key: &Key) -> Option<&O> {
        self.successor(key).map(|(_, owner)| owner)
    }

    /// Iterates positions in ring order.
    pub fn iter(&self) -> impl Iterator<Item = (&Key, &O)> {
        self.nodes.iter()
    }
}

/// One slave's share of a multi-get: the keys asked of it and, for each,
/// the position of that key in the caller's original key list.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MgetBatch {
    pub keys: Vec<Key>,
    pub positions: Vec<usize>,
}

/// Groups a multi-get key list into per-owner batches. Keys that no node
/// owns (empty ring) appear in no batch.
pub fn group_by_owner<O>(
    ring: &HashRing<O>,
    keys: &[Key],
) -> HashMap<O, MgetBatch>
where
    O: Clone + Eq + Hash + fmt::Display,
{
    let mut batches: HashMap<O, MgetBatch> = HashMap::new();
    for (pos, key) in keys.iter().enumerate() {
        if let Some(owner) = ring.owner_of(key) {
            let batch = batches.entry(owner.clone()).or_default();
            batch.keys.push(*key);
            batch.positions.push(pos);
        }
    }
    batches
}
