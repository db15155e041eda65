//! DSDC data slave role: one bounded LRU shard of the cache.

mod store;
mod slave;

pub use store::{LruStore, StoreStats};
pub use slave::{Slave, SlaveConfig};
