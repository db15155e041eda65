//! DSDC lock-server role: advisory read/write locks over cache keys.

mod locks;
mod lockserver;

/// Default lifetime of a granted hold in millisecs, when the acquirer
/// does not override it. Expired holds are force-released.
pub const DEFAULT_LOCK_TIMEOUT_MS: u64 = 10_000;

pub use lockserver::{LockServer, LockServerConfig};
