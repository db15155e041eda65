//! Framed TCP plumbing: outbound peer connections and the inbound RPC
//! service shared by all server roles.

mod conn;
mod server;

pub use conn::{ConnPool, PeerConn};
pub use server::{ConnId, RpcEvent, RpcServer};
