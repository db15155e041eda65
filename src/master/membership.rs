//! Membership bookkeeping: registrations, heartbeats, lazy death reaping,
//! and the memoized system-state snapshot. Pure state, no I/O.

use std::collections::{HashMap, VecDeque};

use tokio::time::{Duration, Instant};

use crate::net::ConnId;
use crate::protocol::{SlaveInfo, Status, SystemState};
use crate::ring::{HashRing, Key};
use crate::utils::DsdcError;

/// One registered node's record.
#[derive(Debug, Clone)]
struct PeerRecord {
    /// The node's advertised identity and ring positions.
    info: SlaveInfo,

    /// True if registered as a lock server.
    lock_server: bool,

    /// When this node last proved liveness.
    last_beat: Instant,
}

/// Outcome of routing a key (or checking a particular node).
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum RouteTarget {
    /// No slave owns any portion of the ring.
    NoNode,

    /// The owning node has stopped heartbeating; it has now been reaped.
    Dead,

    /// The owning node, to forward to.
    Slave(SlaveInfo),
}

/// The master's registry of data slaves and lock servers.
pub(crate) struct Membership {
    /// Registered nodes by their registration connection.
    peers: HashMap<ConnId, PeerRecord>,

    /// Ring positions to registration connections.
    ring: HashRing<ConnId>,

    /// Lock servers in registration order; front is the primary, the rest
    /// are backups promoted in order.
    lock_servers: VecDeque<ConnId>,

    /// Memoized snapshot and its fingerprint. Registration always clears
    /// this; node removal clears it only under `invalidate_on_remove`.
    snapshot: Option<(SystemState, Key)>,

    /// A node missing heartbeats for longer than this is dead.
    dead_after: Duration,

    /// Also invalidate the memoized snapshot when a node is removed.
    invalidate_on_remove: bool,
}

impl Membership {
    pub(crate) fn new(dead_after: Duration, invalidate_on_remove: bool) -> Self {
        Membership {
            peers: HashMap::new(),
            ring: HashRing::new(),
            lock_servers: VecDeque::new(),
            snapshot: None,
            dead_after,
            invalidate_on_remove,
        }
    }

    /// Number of registered nodes (slaves plus lock servers).
    pub(crate) fn len(&self) -> usize {
        self.peers.len()
    }

    /// Borrows the key -> registration-connection ring.
    pub(crate) fn ring(&self) -> &HashRing<ConnId> {
        &self.ring
    }

    /// Handles a registration on connection `conn`. A second registration
    /// on the same live connection is refused.
    pub(crate) fn register(
        &mut self,
        conn: ConnId,
        info: SlaveInfo,
        lock_server: bool,
    ) -> Status {
        if self.peers.contains_key(&conn) {
            return Status::AlreadyRegistered;
        }

        if lock_server {
            self.lock_servers.push_back(conn);
        } else {
            for key in &info.keys {
                self.ring.insert(*key, conn);
            }
        }
        self.peers.insert(
            conn,
            PeerRecord {
                info,
                lock_server,
                last_beat: Instant::now(),
            },
        );

        // a fresh registration always invalidates the memoized snapshot
        self.snapshot = None;
        Status::Ok
    }

    /// Refreshes the liveness timestamp of a registered node.
    pub(crate) fn heartbeat(&mut self, conn: ConnId) -> Status {
        match self.peers.get_mut(&conn) {
            Some(record) => {
                record.last_beat = Instant::now();
                Status::Ok
            }
            // unknown connection; sender should re-register
            None => Status::NotFound,
        }
    }

    /// Removes a node and all its ring positions. Idempotent.
    pub(crate) fn remove(&mut self, conn: ConnId) -> Option<SlaveInfo> {
        let record = self.peers.remove(&conn)?;
        if record.lock_server {
            self.lock_servers.retain(|c| *c != conn);
        } else {
            self.ring.remove_owner(&conn);
        }
        if self.invalidate_on_remove {
            self.snapshot = None;
        }
        Some(record.info)
    }

    fn is_dead(&self, conn: ConnId) -> bool {
        match self.peers.get(&conn) {
            Some(record) => record.last_beat.elapsed() > self.dead_after,
            None => true,
        }
    }

    /// Routes a key to its owning slave, reaping the owner if it turns out
    /// dead at this touch.
    pub(crate) fn route(&mut self, key: &Key) -> RouteTarget {
        match self.ring.successor(key) {
            None => RouteTarget::NoNode,
            Some((_, conn)) => {
                let conn = *conn;
                self.check(conn)
            }
        }
    }

    /// Checks liveness of one registered node, reaping it if dead.
    pub(crate) fn check(&mut self, conn: ConnId) -> RouteTarget {
        if self.is_dead(conn) {
            self.remove(conn);
            return RouteTarget::Dead;
        }
        RouteTarget::Slave(self.peers[&conn].info.clone())
    }

    /// The current primary lock server, promoting past dead ones.
    pub(crate) fn primary_lock_server(&mut self) -> Option<SlaveInfo> {
        while let Some(&front) = self.lock_servers.front() {
            if self.is_dead(front) {
                self.remove(front);
                continue;
            }
            return Some(self.peers[&front].info.clone());
        }
        None
    }

    /// Identities of all currently-live data slaves.
    pub(crate) fn live_slaves(&mut self) -> Vec<SlaveInfo> {
        let conns: Vec<ConnId> = self
            .peers
            .iter()
            .filter(|(_, r)| !r.lock_server)
            .map(|(c, _)| *c)
            .collect();
        let mut infos = vec![];
        for conn in conns {
            if let RouteTarget::Slave(info) = self.check(conn) {
                infos.push(info);
            }
        }
        infos
    }

    /// Answers a snapshot poll: reaps all dead nodes, (re)memoizes the
    /// snapshot if needed, and returns it only when its fingerprint
    /// differs from the caller's.
    pub(crate) fn get_state(
        &mut self,
        fingerprint: &Key,
    ) -> Result<Option<SystemState>, DsdcError> {
        let dead: Vec<ConnId> = self
            .peers
            .keys()
            .copied()
            .filter(|c| self.is_dead(*c))
            .collect();
        for conn in dead {
            self.remove(conn);
        }

        if self.snapshot.is_none() {
            let state = self.compute_state();
            let hash = state.content_hash()?;
            self.snapshot = Some((state, hash));
        }

        let (state, hash) = self.snapshot.as_ref().unwrap();
        if hash == fingerprint {
            Ok(None)
        } else {
            Ok(Some(state.clone()))
        }
    }

    /// Builds a snapshot from current registrations. Slaves appear in
    /// registration order (connection IDs are monotonic), keeping the
    /// snapshot bytes deterministic for a given membership.
    fn compute_state(&self) -> SystemState {
        let mut conns: Vec<ConnId> = self
            .peers
            .iter()
            .filter(|(_, r)| !r.lock_server)
            .map(|(c, _)| *c)
            .collect();
        conns.sort_unstable();
        let slaves = conns
            .into_iter()
            .map(|c| self.peers[&c].info.clone())
            .collect();
        let lock_server = self
            .lock_servers
            .front()
            .map(|c| self.peers[c].info.clone());
        SystemState {
            slaves,
            lock_server,
        }
    }
}
