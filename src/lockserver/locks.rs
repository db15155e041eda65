//! The lock table: advisory read/write locks with FIFO waiter queues and
//! holder expiry. Pure state; all I/O and timing live in the owning loop.

use std::collections::{HashMap, VecDeque};

use tokio::time::{Duration, Instant};

use crate::net::ConnId;
use crate::protocol::{HolderId, RequestId};
use crate::ring::Key;

/// Identifies one queued acquire awaiting its deferred reply.
pub(crate) type WaiterToken = (ConnId, RequestId);

/// Outcome of an acquire attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Acquire {
    /// Granted immediately; reply now.
    Granted(HolderId),

    /// Busy and the caller chose not to block.
    Busy,

    /// Queued; the grant reply is deferred until a drain reaches it.
    Queued,
}

/// One deferred grant produced by a queue drain; the owner replies to
/// `token` with the new `holder`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Grant {
    pub key: Key,
    pub token: WaiterToken,
    pub holder: HolderId,
}

/// One live hold on a lock.
#[derive(Debug, Clone, Copy)]
struct Hold {
    holder: HolderId,
    expires_at: Instant,
}

/// One queued acquire.
#[derive(Debug, Clone, Copy)]
struct Waiter {
    token: WaiterToken,
    writer: bool,
    timeout: Duration,
}

/// State of one locked key: at most one writer, any number of readers,
/// and a FIFO queue of blocked acquirers.
#[derive(Debug, Default)]
struct Lock {
    writer: Option<Hold>,
    readers: HashMap<HolderId, Hold>,
    waiters: VecDeque<Waiter>,
}

impl Lock {
    fn quiescent(&self) -> bool {
        self.writer.is_none()
            && self.readers.is_empty()
            && self.waiters.is_empty()
    }
}

/// The table of all currently interesting keys. Quiescent keys are swept
/// out by every mutating method; the per-key state machine never deletes
/// itself.
pub(crate) struct LockTable {
    locks: HashMap<Key, Lock>,

    /// Next hold ID to grant. Starts at 1; 0 is never a valid holder.
    next_holder: HolderId,
}

impl LockTable {
    pub(crate) fn new() -> Self {
        LockTable {
            locks: HashMap::new(),
            next_holder: 1,
        }
    }

    /// Number of keys with live holds or waiters.
    pub(crate) fn len(&self) -> usize {
        self.locks.len()
    }

    fn alloc_holder(next_holder: &mut HolderId) -> HolderId {
        let id = *next_holder;
        *next_holder += 1;
        id
    }

    /// Attempts to acquire `key`. An immediate grant requires (reader and
    /// no writer) or (writer and fully free), regardless of queued
    /// waiters, so a reader joins an already-read-held lock even while
    /// writers wait. Blocking only changes the failure outcome: enqueue
    /// instead of `Busy`.
    pub(crate) fn acquire(
        &mut self,
        key: Key,
        writer: bool,
        block: bool,
        timeout: Duration,
        token: WaiterToken,
    ) -> Acquire {
        let lock = self.locks.entry(key).or_default();
        let compatible = if writer {
            lock.writer.is_none() && lock.readers.is_empty()
        } else {
            lock.writer.is_none()
        };

        if compatible {
            let holder = Self::alloc_holder(&mut self.next_holder);
            let hold = Hold {
                holder,
                expires_at: Instant::now() + timeout,
            };
            if writer {
                lock.writer = Some(hold);
            } else {
                lock.readers.insert(holder, hold);
            }
            Acquire::Granted(holder)
        } else if block {
            lock.waiters.push_back(Waiter {
                token,
                writer,
                timeout,
            });
            Acquire::Queued
        } else {
            Acquire::Busy
        }
    }

    /// Releases the hold `holder` on `key`. Returns `None` (and mutates
    /// nothing) if there is no such hold; otherwise the grants produced by
    /// draining the queue.
    pub(crate) fn release(
        &mut self,
        key: Key,
        holder: HolderId,
    ) -> Option<Vec<Grant>> {
        let lock = self.locks.get_mut(&key)?;
        if lock.writer.map(|h| h.holder) == Some(holder) {
            lock.writer = None;
        } else if lock.readers.remove(&holder).is_none() {
            return None;
        }

        let grants =
            Self::drain(key, lock, &mut self.next_holder, Instant::now());
        if lock.quiescent() {
            self.locks.remove(&key);
        }
        Some(grants)
    }

    /// Force-releases every hold that expired at or before `now`, then
    /// drains the affected queues.
    pub(crate) fn expire_due(&mut self, now: Instant) -> Vec<Grant> {
        let mut grants = Vec::new();
        let mut quiescent = Vec::new();
        for (&key, lock) in self.locks.iter_mut() {
            if lock.writer.is_some_and(|h| h.expires_at <= now) {
                lock.writer = None;
            }
            lock.readers.retain(|_, h| h.expires_at > now);
            grants.extend(Self::drain(
                key,
                lock,
                &mut self.next_holder,
                now,
            ));
            if lock.quiescent() {
                quiescent.push(key);
            }
        }
        for key in quiescent {
            self.locks.remove(&key);
        }
        grants
    }

    /// Earliest hold expiry across the whole table, if any hold is live.
    pub(crate) fn next_expiry(&self) -> Option<Instant> {
        self.locks
            .values()
            .flat_map(|lock| {
                lock.writer
                    .iter()
                    .chain(lock.readers.values())
                    .map(|h| h.expires_at)
            })
            .min()
    }

    /// Drops every waiter queued by `conn` (their deferred replies can no
    /// longer be delivered). Holds granted to that connection stay; only
    /// expiry reclaims those. Removing a waiter can unblock others, so
    /// this also drains.
    pub(crate) fn cancel_conn(&mut self, conn: ConnId) -> Vec<Grant> {
        let mut grants = Vec::new();
        let mut quiescent = Vec::new();
        for (&key, lock) in self.locks.iter_mut() {
            lock.waiters.retain(|w| w.token.0 != conn);
            grants.extend(Self::drain(
                key,
                lock,
                &mut self.next_holder,
                Instant::now(),
            ));
            if lock.quiescent() {
                quiescent.push(key);
            }
        }
        for key in quiescent {
            self.locks.remove(&key);
        }
        grants
    }

    /// Grants as many queued waiters as compatibility allows: a writer at
    /// the head is granted alone once the lock is fully free; otherwise
    /// every queued reader is granted as one batch (including readers
    /// queued behind waiting writers), with writers keeping their order.
    fn drain(
        key: Key,
        lock: &mut Lock,
        next_holder: &mut HolderId,
        now: Instant,
    ) -> Vec<Grant> {
        let mut grants = Vec::new();
        if lock.writer.is_some() {
            return grants;
        }

        if let Some(head) = lock.waiters.front() {
            if head.writer {
                if lock.readers.is_empty() {
                    // sole writer takes the lock
                    let w = lock.waiters.pop_front().unwrap();
                    let holder = Self::alloc_holder(next_holder);
                    lock.writer = Some(Hold {
                        holder,
                        expires_at: now + w.timeout,
                    });
                    grants.push(Grant {
                        key,
                        token: w.token,
                        holder,
                    });
                }
                return grants;
            }
        }

        let mut kept = VecDeque::new();
        while let Some(w) = lock.waiters.pop_front() {
            if w.writer {
                kept.push_back(w);
            } else {
                let holder = Self::alloc_holder(next_holder);
                lock.readers.insert(
                    holder,
                    Hold {
                        holder,
                        expires_at: now + w.timeout,
                    },
                );
                grants.push(Grant {
                    key,
                    token: w.token,
                    holder,
                });
            }
        }
        lock.waiters = kept;
        grants
    }
}
