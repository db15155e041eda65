//! Master main event loop implementation.

use std::net::SocketAddr;

use serde::Deserialize;
use tokio::sync::watch;
use tokio::time::{self, Duration};

use crate::master::membership::{Membership, RouteTarget};
use crate::net::{ConnId, ConnPool, PeerConn, RpcEvent, RpcServer};
use crate::protocol::{
    ApiReply, ApiRequest, GetResult, RequestId, SlaveInfo, Status,
};
use crate::ring::{group_by_owner, Key};
use crate::utils::DsdcError;

/// Configuration parameters of the master role.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct MasterConfig {
    /// Expected interval between node heartbeats in millisecs.
    pub heartbeat_interval_ms: u64,

    /// A node missing this many consecutive heartbeats is dead.
    pub missed_beats: u32,

    /// Invalidate the memoized snapshot on node removal too, not just on
    /// registration.
    pub invalidate_on_remove: bool,

    /// Timeout of forwarded RPCs in millisecs.
    pub rpc_timeout_ms: u64,
}

impl Default for MasterConfig {
    fn default() -> Self {
        MasterConfig {
            heartbeat_interval_ms: 2000,
            missed_beats: 10,
            invalidate_on_remove: false,
            rpc_timeout_ms: 5000,
        }
    }
}

impl MasterConfig {
    /// Overlays the defaults with fields parsed from a TOML string.
    pub fn parsed(config_str: Option<&str>) -> Result<Self, DsdcError> {
        parsed_config!(config_str => MasterConfig;
                       heartbeat_interval_ms, missed_beats,
                       invalidate_on_remove, rpc_timeout_ms)
    }
}

/// The master role: tracks membership and forwards dumb clients' data and
/// lock operations to the owning nodes.
pub struct Master {
    /// Configuration parameters struct.
    config: MasterConfig,

    /// Inbound RPC service.
    rpc: RpcServer,

    /// Membership registry.
    members: Membership,

    /// Pooled outbound connections to slaves, for forwarding.
    pool: ConnPool,
}

impl Master {
    /// Creates a new master and binds its listener.
    pub async fn new_and_setup(
        addr: SocketAddr,
        config: MasterConfig,
    ) -> Result<Self, DsdcError> {
        if config.heartbeat_interval_ms == 0 || config.missed_beats == 0 {
            return logged_err!("invalid heartbeat config");
        }
        let rpc = RpcServer::new_and_setup(addr).await?;
        let dead_after = Duration::from_millis(
            config.heartbeat_interval_ms * config.missed_beats as u64,
        );
        let members = Membership::new(dead_after, config.invalidate_on_remove);
        Ok(Master {
            config,
            rpc,
            members,
            pool: ConnPool::new(),
        })
    }

    /// Main event loop. Runs until termination is signaled.
    pub async fn run(
        &mut self,
        mut rx_term: watch::Receiver<bool>,
    ) -> Result<(), DsdcError> {
        loop {
            tokio::select! {
                // receives an RPC event
                event = self.rpc.recv() => {
                    match event? {
                        RpcEvent::Request(conn, req) => {
                            if let Err(e) =
                                self.handle_request(conn, req).await
                            {
                                pf_error!("error handling request: {}", e);
                            }
                        }
                        RpcEvent::Closed(conn) => {
                            if let Some(info) = self.members.remove(conn) {
                                pf_info!("node '{}' disconnected", info.id());
                            }
                        }
                    }
                },

                // receives termination signal
                _ = rx_term.changed() => {
                    pf_warn!("termination signaled, exiting");
                    break;
                }
            }
        }
        Ok(())
    }

    fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.config.rpc_timeout_ms)
    }

    /// Dispatches one client or node request.
    async fn handle_request(
        &mut self,
        conn: ConnId,
        req: ApiRequest,
    ) -> Result<(), DsdcError> {
        match req {
            ApiRequest::Register {
                id,
                info,
                lock_server,
            } => {
                let peer = info.id();
                let status = self.members.register(conn, info, lock_server);
                if status == Status::Ok {
                    pf_info!(
                        "registered {} '{}' on connection {}",
                        if lock_server { "lock server" } else { "slave" },
                        peer,
                        conn
                    );
                }
                self.rpc.send_reply(ApiReply::Register { id, status }, conn)
            }

            ApiRequest::Heartbeat { id } => {
                let status = self.members.heartbeat(conn);
                self.rpc
                    .send_reply(ApiReply::Heartbeat { id, status }, conn)
            }

            ApiRequest::GetState { id, fingerprint } => {
                let state = self.members.get_state(&fingerprint)?;
                self.rpc.send_reply(ApiReply::GetState { id, state }, conn)
            }

            ApiRequest::Get { id, key } => {
                self.forward_get(conn, id, key).await
            }

            ApiRequest::Put {
                id,
                key,
                value,
                annotation,
                cksum,
            } => {
                self.forward_put(conn, id, key, value, annotation, cksum)
                    .await
            }

            ApiRequest::Remove { id, key } => {
                self.forward_remove(conn, id, key).await
            }

            ApiRequest::MGet { id, keys } => {
                self.forward_mget(conn, id, keys).await
            }

            ApiRequest::LockAcquire {
                id,
                key,
                writer,
                block,
                timeout_ms,
            } => self.forward_lock_acquire(
                conn, id, key, writer, block, timeout_ms,
            ),

            ApiRequest::LockRelease { id, key, holder } => {
                self.forward_lock_release(conn, id, key, holder)
            }

            ApiRequest::NewNode { id, info } => {
                self.broadcast_newnode(conn, id, info).await
            }

            // graceful leaves are consumed by the servant threads
            ApiRequest::Leave => Ok(()),
        }
    }

    /// Performs one forwarded RPC against a slave through the pool,
    /// discarding the pooled connection on error.
    async fn slave_rpc(
        &mut self,
        info: &SlaveInfo,
        make: impl FnOnce(RequestId) -> ApiRequest,
    ) -> Result<ApiReply, DsdcError> {
        let timeout = self.rpc_timeout();
        let peer = info.id();
        let result = async {
            let conn = self
                .pool
                .checkout(&info.hostname, info.port, timeout)
                .await?;
            let req = make(conn.next_id());
            conn.rpc(req, timeout).await
        }
        .await;
        if let Err(e) = &result {
            pf_warn!("forwarded rpc to '{}' failed: {}", peer, e);
            self.pool.discard(&peer);
        }
        result
    }

    async fn forward_get(
        &mut self,
        conn: ConnId,
        id: RequestId,
        key: Key,
    ) -> Result<(), DsdcError> {
        let reply = match self.members.route(&key) {
            RouteTarget::NoNode => (Status::NoNode, None, None),
            RouteTarget::Dead => (Status::Dead, None, None),
            RouteTarget::Slave(info) => {
                match self
                    .slave_rpc(&info, |rid| ApiRequest::Get { id: rid, key })
                    .await
                {
                    Ok(ApiReply::Get {
                        status,
                        value,
                        cksum,
                        ..
                    }) => (status, value, cksum),
                    _ => (Status::RpcError, None, None),
                }
            }
        };
        self.rpc.send_reply(
            ApiReply::Get {
                id,
                status: reply.0,
                value: reply.1,
                cksum: reply.2,
            },
            conn,
        )
    }

    #[allow(clippy::too_many_arguments)]
    async fn forward_put(
        &mut self,
        conn: ConnId,
        id: RequestId,
        key: Key,
        value: Vec<u8>,
        annotation: Option<String>,
        cksum: Option<Key>,
    ) -> Result<(), DsdcError> {
        let status = match self.members.route(&key) {
            RouteTarget::NoNode => Status::NoNode,
            RouteTarget::Dead => Status::Dead,
            RouteTarget::Slave(info) => {
                match self
                    .slave_rpc(&info, |rid| ApiRequest::Put {
                        id: rid,
                        key,
                        value,
                        annotation,
                        cksum,
                    })
                    .await
                {
                    Ok(ApiReply::Put { status, .. }) => status,
                    _ => Status::RpcError,
                }
            }
        };
        self.rpc.send_reply(ApiReply::Put { id, status }, conn)
    }

    async fn forward_remove(
        &mut self,
        conn: ConnId,
        id: RequestId,
        key: Key,
    ) -> Result<(), DsdcError> {
        let status = match self.members.route(&key) {
            RouteTarget::NoNode => Status::NoNode,
            RouteTarget::Dead => Status::Dead,
            RouteTarget::Slave(info) => {
                match self
                    .slave_rpc(&info, |rid| ApiRequest::Remove {
                        id: rid,
                        key,
                    })
                    .await
                {
                    Ok(ApiReply::Remove { status, .. }) => status,
                    _ => Status::RpcError,
                }
            }
        };
        self.rpc.send_reply(ApiReply::Remove { id, status }, conn)
    }

    /// Forwards a multi-get by grouping keys per owning slave; a failure
    /// against one slave poisons only that slave's share of the results.
    async fn forward_mget(
        &mut self,
        conn: ConnId,
        id: RequestId,
        keys: Vec<Key>,
    ) -> Result<(), DsdcError> {
        let mut results =
            vec![GetResult::miss(Status::NoNode); keys.len()];
        let batches = group_by_owner(self.members.ring(), &keys);
        for (owner, batch) in batches {
            let batch_status = match self.members.check(owner) {
                RouteTarget::NoNode => Status::NoNode,
                RouteTarget::Dead => Status::Dead,
                RouteTarget::Slave(info) => {
                    let batch_keys = batch.keys.clone();
                    match self
                        .slave_rpc(&info, |rid| ApiRequest::MGet {
                            id: rid,
                            keys: batch_keys,
                        })
                        .await
                    {
                        Ok(ApiReply::MGet {
                            results: sub_results,
                            ..
                        }) if sub_results.len() == batch.positions.len() => {
                            for (pos, result) in batch
                                .positions
                                .iter()
                                .zip(sub_results.into_iter())
                            {
                                results[*pos] = result;
                            }
                            continue;
                        }
                        _ => Status::RpcError,
                    }
                }
            };
            for pos in &batch.positions {
                results[*pos] = GetResult::miss(batch_status);
            }
        }
        self.rpc.send_reply(ApiReply::MGet { id, results }, conn)
    }

    /// Forwards a lock acquire to the primary lock server from a detached
    /// task, so a blocking acquire does not stall the master's loop. The
    /// reply is pushed straight into the requesting connection's reply
    /// channel when the grant (or refusal) comes back.
    fn forward_lock_acquire(
        &mut self,
        conn: ConnId,
        id: RequestId,
        key: Key,
        writer: bool,
        block: bool,
        timeout_ms: Option<u64>,
    ) -> Result<(), DsdcError> {
        let refused = move |status| ApiReply::LockAcquire {
            id,
            status,
            holder: None,
        };
        let primary = match self.members.primary_lock_server() {
            Some(info) => info,
            None => {
                return self.rpc.send_reply(refused(Status::NoNode), conn)
            }
        };
        let tx_reply = match self.rpc.reply_sender(conn) {
            Some(tx) => tx,
            None => return Ok(()), // requester already gone
        };

        let rpc_timeout = self.rpc_timeout();
        // a blocking acquire may legitimately wait out the full lock
        // timeout before being granted
        let wait = if block {
            rpc_timeout
                + Duration::from_millis(timeout_ms.unwrap_or(
                    crate::lockserver::DEFAULT_LOCK_TIMEOUT_MS,
                ))
        } else {
            rpc_timeout
        };

        tokio::spawn(async move {
            let reply = match time::timeout(
                rpc_timeout,
                PeerConn::connect(&primary.hostname, primary.port),
            )
            .await
            {
                Ok(Ok(mut lconn)) => {
                    let rid = lconn.next_id();
                    match lconn
                        .rpc(
                            ApiRequest::LockAcquire {
                                id: rid,
                                key,
                                writer,
                                block,
                                timeout_ms,
                            },
                            wait,
                        )
                        .await
                    {
                        Ok(ApiReply::LockAcquire {
                            status, holder, ..
                        }) => ApiReply::LockAcquire { id, status, holder },
                        _ => refused(Status::RpcError),
                    }
                }
                _ => refused(Status::RpcError),
            };
            // requester may have disconnected in the meantime
            let _ = tx_reply.send(reply);
        });
        Ok(())
    }

    /// Forwards a lock release the same detached way.
    fn forward_lock_release(
        &mut self,
        conn: ConnId,
        id: RequestId,
        key: Key,
        holder: u64,
    ) -> Result<(), DsdcError> {
        let refused = move |status| ApiReply::LockRelease { id, status };
        let primary = match self.members.primary_lock_server() {
            Some(info) => info,
            None => {
                return self.rpc.send_reply(refused(Status::NoNode), conn)
            }
        };
        let tx_reply = match self.rpc.reply_sender(conn) {
            Some(tx) => tx,
            None => return Ok(()),
        };

        let rpc_timeout = self.rpc_timeout();
        tokio::spawn(async move {
            let reply = match time::timeout(
                rpc_timeout,
                PeerConn::connect(&primary.hostname, primary.port),
            )
            .await
            {
                Ok(Ok(mut lconn)) => {
                    let rid = lconn.next_id();
                    match lconn
                        .rpc(
                            ApiRequest::LockRelease {
                                id: rid,
                                key,
                                holder,
                            },
                            rpc_timeout,
                        )
                        .await
                    {
                        Ok(ApiReply::LockRelease { status, .. }) => {
                            ApiReply::LockRelease { id, status }
                        }
                        _ => refused(Status::RpcError),
                    }
                }
                _ => refused(Status::RpcError),
            };
            let _ = tx_reply.send(reply);
        });
        Ok(())
    }

    /// Relays a new-node announcement to all live slaves, best effort.
    async fn broadcast_newnode(
        &mut self,
        conn: ConnId,
        id: RequestId,
        info: SlaveInfo,
    ) -> Result<(), DsdcError> {
        for slave in self.members.live_slaves() {
            let info = info.clone();
            if let Err(e) = self
                .slave_rpc(&slave, |rid| ApiRequest::NewNode {
                    id: rid,
                    info,
                })
                .await
            {
                pf_warn!(
                    "newnode relay to '{}' failed: {}",
                    slave.id(),
                    e
                );
            }
        }
        self.rpc.send_reply(
            ApiReply::NewNode {
                id,
                status: Status::Ok,
            },
            conn,
        )
    }
}
