//! Follower-side mirror of the master's membership snapshot.

use std::collections::HashSet;

use crate::protocol::SystemState;
use crate::ring::{HashRing, Key};
use crate::utils::DsdcError;

/// Locally cached system state, refreshed by fingerprint-compare polling
/// against a master. Slaves and smart clients each embed one and drive it
/// from their own event loops.
#[derive(Debug)]
pub struct StateCache {
    /// Ring positions to owning slave identities (`host:port`).
    ring: HashRing<String>,

    /// Primary lock server identity, if any.
    lock_server: Option<String>,

    /// Fingerprint of the last applied snapshot; all-zeroes forces the
    /// next poll to fetch a full snapshot.
    state_fp: Key,

    /// Consecutive polls that came back "unchanged".
    unchanged_polls: u32,

    /// After this many consecutive unchanged polls, zero the fingerprint
    /// so the next poll re-fetches everything. 0 disables the floor.
    max_unchanged: u32,
}

impl StateCache {
    pub fn new(max_unchanged: u32) -> Self {
        StateCache {
            ring: HashRing::new(),
            lock_server: None,
            state_fp: Key::zero(),
            unchanged_polls: 0,
            max_unchanged,
        }
    }

    /// Fingerprint to present in the next `GetState` poll.
    pub fn fingerprint(&self) -> Key {
        self.state_fp
    }

    /// Applies one poll result. `Some` rebuilds the local mirror and
    /// returns true; `None` (snapshot unchanged) counts toward the forced
    /// full-refresh floor and returns false.
    pub fn apply(
        &mut self,
        state: Option<&SystemState>,
    ) -> Result<bool, DsdcError> {
        match state {
            Some(state) => {
                self.rebuild(state);
                self.state_fp = state.content_hash()?;
                self.unchanged_polls = 0;
                Ok(true)
            }
            None => {
                self.unchanged_polls += 1;
                if self.max_unchanged > 0
                    && self.unchanged_polls >= self.max_unchanged
                {
                    // guard against a silently diverged mirror
                    self.state_fp = Key::zero();
                    self.unchanged_polls = 0;
                }
                Ok(false)
            }
        }
    }

    fn rebuild(&mut self, state: &SystemState) {
        self.ring.clear();
        for slave in &state.slaves {
            let id = slave.id();
            for key in &slave.keys {
                self.ring.insert(*key, id.clone());
            }
        }
        self.lock_server = state.lock_server.as_ref().map(|ls| ls.id());
    }

    pub fn ring(&self) -> &HashRing<String> {
        &self.ring
    }

    pub fn lock_server(&self) -> Option<&str> {
        self.lock_server.as_deref()
    }

    /// Identities of all nodes the current mirror refers to, for pruning
    /// pooled connections to departed nodes.
    pub fn peer_ids(&self) -> HashSet<String> {
        let mut ids: HashSet<String> =
            self.ring.iter().map(|(_, owner)| owner.clone()).collect();
        if let Some(ls) = &self.lock_server {
            ids.insert(ls.clone());
        }
        ids
    }
}
