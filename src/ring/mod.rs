//! Consistent-hash ring primitives shared by all DSDC roles.

mod key;
mod hashring;
mod statecache;

pub use key::{Cksum, Key, KEY_SIZE};
pub use hashring::{group_by_owner, HashRing, MgetBatch};
pub use statecache::StateCache;
