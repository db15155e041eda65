//! DSDC: a distributed in-memory key/value cache.
//!
//! A deployment consists of one or more master processes that track
//! membership and hand out routing snapshots, data slave processes that
//! each serve a bounded LRU cache shard, optional lock server processes
//! for advisory read/write locks, and smart clients that mirror the
//! master's hash ring locally to talk to slaves directly.

#[macro_use]
pub mod utils;

pub mod ring;

pub mod protocol;

pub mod net;

pub mod master;

pub mod slave;

pub mod lockserver;

pub mod client;

pub use crate::utils::{
    logger_init, parse_host_port, DsdcError, Timer, ME,
};

pub use crate::ring::{Cksum, HashRing, Key, StateCache, KEY_SIZE};

pub use crate::protocol::{
    ApiReply, ApiRequest, GetResult, HolderId, RequestId, SlaveInfo, Status,
    SystemState,
};

pub use crate::net::{ConnId, ConnPool, PeerConn, RpcEvent, RpcServer};

pub use crate::master::{Master, MasterConfig};

pub use crate::slave::{LruStore, Slave, SlaveConfig, StoreStats};

pub use crate::lockserver::{LockServer, LockServerConfig};

pub use crate::client::{ClientConfig, DsdcClient};
