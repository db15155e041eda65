//! Outbound peer connections and a lazily-populated connection pool.

use std::collections::{HashMap, HashSet};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::{self, Duration};

use crate::protocol::{ApiReply, ApiRequest, RequestId};
use crate::utils::DsdcError;

/// One established outbound connection to a DSDC node, with a per-
/// connection request ID counter and a synchronous `rpc()` helper.
pub struct PeerConn {
    /// Peer identity as `host:port`.
    peer: String,

    /// Read-half split of the TCP connection stream.
    conn_read: OwnedReadHalf,

    /// Write-half split of the TCP connection stream.
    conn_write: OwnedWriteHalf,

    /// Next request ID to hand out on this connection.
    next_req: RequestId,
}

impl PeerConn {
    /// Connects to the given node.
    pub async fn connect(
        hostname: &str,
        port: u16,
    ) -> Result<Self, DsdcError> {
        let stream = TcpStream::connect((hostname, port)).await?;
        stream.set_nodelay(true)?;
        let (conn_read, conn_write) = stream.into_split();
        Ok(PeerConn {
            peer: format!("{}:{}", hostname, port),
            conn_read,
            conn_write,
            next_req: 0,
        })
    }

    /// Peer identity as `host:port`.
    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Hands out the next request ID on this connection.
    pub fn next_id(&mut self) -> RequestId {
        self.next_req += 1;
        self.next_req
    }

    /// Sends a request to the connected node.
    pub async fn send_req(
        &mut self,
        req: &ApiRequest,
    ) -> Result<(), DsdcError> {
        let req_bytes = rmp_serde::encode::to_vec(req)?;
        self.conn_write.write_u64(req_bytes.len() as u64).await?; // length first
        self.conn_write.write_all(&req_bytes[..]).await?;
        Ok(())
    }

    /// Receives the next reply from the connected node.
    pub async fn recv_reply(&mut self) -> Result<ApiReply, DsdcError> {
        let reply_len = self.conn_read.read_u64().await?;
        let mut reply_buf: Vec<u8> = vec![0; reply_len as usize];
        self.conn_read.read_exact(&mut reply_buf[..]).await?;
        let reply = rmp_serde::decode::from_slice(&reply_buf)?;
        Ok(reply)
    }

    /// Sends a request and waits (up to `timeout`) for the reply carrying
    /// the matching request ID. Replies with other IDs, e.g. leftovers of
    /// an earlier call that timed out, are discarded.
    pub async fn rpc(
        &mut self,
        req: ApiRequest,
        timeout: Duration,
    ) -> Result<ApiReply, DsdcError> {
        let id = match req.id() {
            Some(id) => id,
            None => return Err(DsdcError::msg("request expects no reply")),
        };
        self.send_req(&req).await?;
        let reply = time::timeout(timeout, async {
            loop {
                let reply = self.recv_reply().await?;
                if reply.id() == Some(id) {
                    return Ok::<ApiReply, DsdcError>(reply);
                }
            }
        })
        .await??;
        Ok(reply)
    }

    /// Announces a graceful disconnect and waits for the acknowledgement.
    pub async fn leave(&mut self) -> Result<(), DsdcError> {
        self.send_req(&ApiRequest::Leave).await?;
        loop {
            if self.recv_reply().await? == ApiReply::Leave {
                return Ok(());
            }
        }
    }
}

/// Pool of outbound connections keyed by peer identity. Connections are
/// established on first checkout, discarded by the caller upon RPC errors,
/// and pruned when a membership snapshot drops their node.
pub struct ConnPool {
    conns: HashMap<String, PeerConn>,
}

impl ConnPool {
    pub fn new() -> Self {
        ConnPool {
            conns: HashMap::new(),
        }
    }

    /// Number of pooled connections.
    pub fn len(&self) -> usize {
        self.conns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conns.is_empty()
    }

    /// Borrows the pooled connection to the given node, establishing it
    /// first (bounded by `timeout`) if not yet pooled.
    pub async fn checkout(
        &mut self,
        hostname: &str,
        port: u16,
        timeout: Duration,
    ) -> Result<&mut PeerConn, DsdcError> {
        let id = format!("{}:{}", hostname, port);
        if !self.conns.contains_key(&id) {
            let conn =
                time::timeout(timeout, PeerConn::connect(hostname, port))
                    .await??;
            pf_debug!("pooled new connection to '{}'", id);
            self.conns.insert(id.clone(), conn);
        }
        Ok(self.conns.get_mut(&id).unwrap())
    }

    /// Drops the pooled connection to the given node, if any. The caller
    /// does this after an RPC error so the next checkout reconnects.
    pub fn discard(&mut self, peer: &str) -> bool {
        self.conns.remove(peer).is_some()
    }

    /// Drops pooled connections to all nodes not in `keep`.
    pub fn prune(&mut self, keep: &HashSet<String>) {
        self.conns.retain(|peer, _| keep.contains(peer));
    }
}

impl Default for ConnPool {
    fn default() -> Self {
        Self::new()
    }
}

// Socket-level tests are done together with `net::server`.
