//! Lock server main event loop implementation.

use std::collections::VecDeque;
use std::net::SocketAddr;

use serde::Deserialize;
use tokio::sync::watch;
use tokio::time::{self, Duration, Instant};

use crate::client::MasterLink;
use crate::lockserver::locks::{Acquire, Grant, LockTable};
use crate::lockserver::DEFAULT_LOCK_TIMEOUT_MS;
use crate::net::{ConnId, RpcEvent, RpcServer};
use crate::protocol::{ApiReply, ApiRequest, SlaveInfo, Status};
use crate::utils::{DsdcError, Timer};

/// Configuration parameters of the lock-server role.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct LockServerConfig {
    /// Hostname to advertise to masters.
    pub hostname: String,

    /// Interval between heartbeats to each master in millisecs.
    pub heartbeat_interval_ms: u64,

    /// Fixed wait between reconnect attempts to a down master in
    /// millisecs.
    pub retry_wait_ms: u64,

    /// Timeout of RPCs to masters in millisecs.
    pub rpc_timeout_ms: u64,

    /// Hold lifetime granted to acquirers that do not name one, in
    /// millisecs.
    pub lock_timeout_ms: u64,
}

impl Default for LockServerConfig {
    fn default() -> Self {
        LockServerConfig {
            hostname: "127.0.0.1".into(),
            heartbeat_interval_ms: 2000,
            retry_wait_ms: 10_000,
            rpc_timeout_ms: 5000,
            lock_timeout_ms: DEFAULT_LOCK_TIMEOUT_MS,
        }
    }
}

impl LockServerConfig {
    /// Overlays the defaults with fields parsed from a TOML string.
    pub fn parsed(config_str: Option<&str>) -> Result<Self, DsdcError> {
        parsed_config!(config_str => LockServerConfig;
                       hostname, heartbeat_interval_ms, retry_wait_ms,
                       rpc_timeout_ms, lock_timeout_ms)
    }
}

/// The lock-server role: grants advisory read/write locks over cache
/// keys. Registers with every configured master claiming zero ring
/// positions.
pub struct LockServer {
    /// Configuration parameters struct.
    config: LockServerConfig,

    /// Inbound RPC service.
    rpc: RpcServer,

    /// All lock state.
    table: LockTable,

    /// My advertised identity (no ring positions).
    me: SlaveInfo,

    /// Links to all configured masters.
    links: Vec<MasterLink>,

    /// Fires at the earliest pending hold expiry.
    expiry_timer: Timer,
}

impl LockServer {
    /// Creates a new lock server and binds its listener.
    pub async fn new_and_setup(
        listen_addr: SocketAddr,
        masters: Vec<(String, u16)>,
        config: LockServerConfig,
    ) -> Result<Self, DsdcError> {
        if masters.is_empty() {
            return logged_err!("no masters given");
        }
        if config.lock_timeout_ms == 0 {
            return logged_err!(
                "invalid lock_timeout_ms {}",
                config.lock_timeout_ms
            );
        }

        let rpc = RpcServer::new_and_setup(listen_addr).await?;
        let me = SlaveInfo {
            hostname: config.hostname.clone(),
            port: listen_addr.port(),
            keys: vec![],
        };
        let links = masters
            .into_iter()
            .map(|(host, port)| MasterLink::new(host, port))
            .collect();

        Ok(LockServer {
            config,
            rpc,
            table: LockTable::new(),
            me,
            links,
            expiry_timer: Timer::new(),
        })
    }

    /// Main event loop. Runs until termination is signaled.
    pub async fn run(
        &mut self,
        mut rx_term: watch::Receiver<bool>,
    ) -> Result<(), DsdcError> {
        let mut hb_interval = time::interval(Duration::from_millis(
            self.config.heartbeat_interval_ms,
        ));

        loop {
            tokio::select! {
                // receives an RPC event
                event = self.rpc.recv() => {
                    match event? {
                        RpcEvent::Request(conn, req) => {
                            if let Err(e) = self.handle_request(conn, req) {
                                pf_error!("error handling request: {}", e);
                            }
                        }
                        RpcEvent::Closed(conn) => {
                            let grants = self.table.cancel_conn(conn);
                            self.deliver_grants(grants);
                            self.rearm_expiry();
                        }
                    }
                },

                // a granted hold reached its expiry
                _ = self.expiry_timer.timeout() => {
                    let grants = self.table.expire_due(Instant::now());
                    if !grants.is_empty() {
                        pf_debug!(
                            "expiry drained {} waiting acquires",
                            grants.len()
                        );
                    }
                    self.deliver_grants(grants);
                    self.rearm_expiry();
                },

                // time to heartbeat the masters (and retry down links)
                _ = hb_interval.tick() => {
                    self.master_tick().await;
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

    /// Serves one lock request.
    fn handle_request(
        &mut self,
        conn: ConnId,
        req: ApiRequest,
    ) -> Result<(), DsdcError> {
        match req {
            ApiRequest::LockAcquire {
                id,
                key,
                writer,
                block,
                timeout_ms,
            } => {
                let timeout = Duration::from_millis(
                    timeout_ms.unwrap_or(self.config.lock_timeout_ms),
                );
                let reply = match self
                    .table
                    .acquire(key, writer, block, timeout, (conn, id))
                {
                    Acquire::Granted(holder) => Some(ApiReply::LockAcquire {
                        id,
                        status: Status::Ok,
                        holder: Some(holder),
                    }),
                    Acquire::Busy => Some(ApiReply::LockAcquire {
                        id,
                        status: Status::Locked,
                        holder: None,
                    }),
                    // the grant reply comes later from a queue drain
                    Acquire::Queued => None,
                };
                if let Some(reply) = reply {
                    self.rpc.send_reply(reply, conn)?;
                }
                self.rearm_expiry();
                Ok(())
            }

            ApiRequest::LockRelease { id, key, holder } => {
                match self.table.release(key, holder) {
                    Some(grants) => {
                        self.rpc.send_reply(
                            ApiReply::LockRelease {
                                id,
                                status: Status::Ok,
                            },
                            conn,
                        )?;
                        self.deliver_grants(grants);
                    }
                    None => {
                        self.rpc.send_reply(
                            ApiReply::LockRelease {
                                id,
                                status: Status::NotFound,
                            },
                            conn,
                        )?;
                    }
                }
                self.rearm_expiry();
                Ok(())
            }

            ApiRequest::Leave => Ok(()),

            // not a cache node; everything else is refused
            req => match req.id() {
                Some(id) => {
                    self.rpc.send_reply(ApiReply::Unsupported { id }, conn)
                }
                None => Ok(()),
            },
        }
    }

    /// Replies to drained waiters. A grant that can no longer be
    /// delivered is released on the spot, which may drain further.
    fn deliver_grants(&mut self, grants: Vec<Grant>) {
        let mut queue = VecDeque::from(grants);
        while let Some(grant) = queue.pop_front() {
            let (conn, id) = grant.token;
            let reply = ApiReply::LockAcquire {
                id,
                status: Status::Ok,
                holder: Some(grant.holder),
            };
            if self.rpc.send_reply(reply, conn).is_err() {
                pf_warn!(
                    "grant to closed conn {} dropped; releasing hold {}",
                    conn,
                    grant.holder
                );
                if let Some(more) =
                    self.table.release(grant.key, grant.holder)
                {
                    queue.extend(more);
                }
            }
        }
    }

    /// Points the expiry timer at the earliest pending hold expiry.
    fn rearm_expiry(&mut self) {
        match self.table.next_expiry() {
            Some(ddl) => self.expiry_timer.kickoff_until(ddl),
            None => self.expiry_timer.cancel(),
        }
    }

    /// Heartbeats ready master links and revives due down links.
    async fn master_tick(&mut self) {
        let timeout = Duration::from_millis(self.config.rpc_timeout_ms);
        let retry_wait = Duration::from_millis(self.config.retry_wait_ms);
        for link in self.links.iter_mut() {
            let link_id = link.id();
            if link.is_ready() {
                if let Err(e) = link.heartbeat(timeout).await {
                    pf_warn!(
                        "heartbeat to master '{}' failed: {}",
                        link_id,
                        e
                    );
                }
            } else if link.retry_due(retry_wait) {
                match link.connect_register(&self.me, true, timeout).await {
                    Ok(()) => {
                        pf_info!("registered with master '{}'", link_id)
                    }
                    Err(e) => {
                        pf_warn!(
                            "cannot register with master '{}': {}",
                            link_id,
                            e
                        )
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod lockserver_tests {
    use super::*;
    use crate::master::{Master, MasterConfig};
    use crate::net::PeerConn;
    use crate::ring::Key;
    use std::sync::Arc;
    use tokio::sync::Barrier;

    const RPC_TIMEOUT: Duration = Duration::from_secs(5);

    fn test_config() -> LockServerConfig {
        LockServerConfig {
            heartbeat_interval_ms: 50,
            retry_wait_ms: 50,
            ..LockServerConfig::default()
        }
    }

    async fn spawn_pair(
        master_port: u16,
        lock_port: u16,
    ) -> Result<(), DsdcError> {
        let barrier = Arc::new(Barrier::new(3));
        let barrier2 = barrier.clone();
        let barrier3 = barrier.clone();
        tokio::spawn(async move {
            let mut master = Master::new_and_setup(
                format!("127.0.0.1:{}", master_port).parse()?,
                MasterConfig::default(),
            )
            .await?;
            barrier2.wait().await;
            let (_tx_term, rx_term) = watch::channel(false);
            master.run(rx_term).await
        });
        tokio::spawn(async move {
            let mut server = LockServer::new_and_setup(
                format!("127.0.0.1:{}", lock_port).parse()?,
                vec![("127.0.0.1".into(), master_port)],
                test_config(),
            )
            .await?;
            barrier3.wait().await;
            let (_tx_term, rx_term) = watch::channel(false);
            server.run(rx_term).await
        });
        barrier.wait().await;
        // give the lock server a couple of ticks to register
        time::sleep(Duration::from_millis(300)).await;
        Ok(())
    }

    async fn acquire(
        conn: &mut PeerConn,
        key: Key,
        writer: bool,
        block: bool,
        timeout_ms: Option<u64>,
    ) -> Result<(Status, Option<u64>), DsdcError> {
        let id = conn.next_id();
        match conn
            .rpc(
                ApiRequest::LockAcquire {
                    id,
                    key,
                    writer,
                    block,
                    timeout_ms,
                },
                RPC_TIMEOUT,
            )
            .await?
        {
            ApiReply::LockAcquire { status, holder, .. } => {
                Ok((status, holder))
            }
            other => panic!("unexpected reply {:?}", other),
        }
    }

    async fn release(
        conn: &mut PeerConn,
        key: Key,
        holder: u64,
    ) -> Result<Status, DsdcError> {
        let id = conn.next_id();
        match conn
            .rpc(ApiRequest::LockRelease { id, key, holder }, RPC_TIMEOUT)
            .await?
        {
            ApiReply::LockRelease { status, .. } => Ok(status),
            other => panic!("unexpected reply {:?}", other),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 3)]
    async fn acquire_release_over_wire() -> Result<(), DsdcError> {
        spawn_pair(56709, 56710).await?;

        // the master's snapshot lists the lock server as primary
        let mut cli = PeerConn::connect("127.0.0.1", 56709).await?;
        let id = cli.next_id();
        let reply = cli
            .rpc(
                ApiRequest::GetState {
                    id,
                    fingerprint: Key::zero(),
                },
                RPC_TIMEOUT,
            )
            .await?;
        match reply {
            ApiReply::GetState {
                state: Some(state), ..
            } => {
                assert_eq!(
                    state.lock_server.unwrap().id(),
                    "127.0.0.1:56710"
                );
                assert!(state.slaves.is_empty());
            }
            other => panic!("unexpected reply {:?}", other),
        }

        let mut conn = PeerConn::connect("127.0.0.1", 56710).await?;
        let key = Key::of_name("row17");

        let (status, holder) =
            acquire(&mut conn, key, true, false, None).await?;
        assert_eq!(status, Status::Ok);
        let holder = holder.unwrap();
        assert!(holder >= 1);

        // busy for another writer, and for a reader
        let (status, none) =
            acquire(&mut conn, key, true, false, None).await?;
        assert_eq!((status, none), (Status::Locked, None));
        let (status, _) = acquire(&mut conn, key, false, false, None).await?;
        assert_eq!(status, Status::Locked);

        // wrong holder releases nothing
        assert_eq!(
            release(&mut conn, key, holder + 999).await?,
            Status::NotFound
        );
        assert_eq!(release(&mut conn, key, holder).await?, Status::Ok);

        // free again; readers now share
        let (status, r1) = acquire(&mut conn, key, false, false, None).await?;
        assert_eq!(status, Status::Ok);
        let (status, _r2) =
            acquire(&mut conn, key, false, false, None).await?;
        assert_eq!(status, Status::Ok);
        assert_eq!(release(&mut conn, key, r1.unwrap()).await?, Status::Ok);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 3)]
    async fn blocking_grant_arrives_after_release(
    ) -> Result<(), DsdcError> {
        spawn_pair(56719, 56720).await?;

        let mut holder_conn = PeerConn::connect("127.0.0.1", 56720).await?;
        let mut waiter_conn = PeerConn::connect("127.0.0.1", 56720).await?;
        let key = Key::of_name("contended");

        let (status, holder) =
            acquire(&mut holder_conn, key, true, false, None).await?;
        assert_eq!(status, Status::Ok);
        let holder = holder.unwrap();

        // the blocking acquire gets no reply yet
        let wait_id = waiter_conn.next_id();
        waiter_conn
            .send_req(&ApiRequest::LockAcquire {
                id: wait_id,
                key,
                writer: true,
                block: true,
                timeout_ms: None,
            })
            .await?;
        time::sleep(Duration::from_millis(100)).await;

        assert_eq!(
            release(&mut holder_conn, key, holder).await?,
            Status::Ok
        );

        // now the deferred grant lands
        let reply = time::timeout(RPC_TIMEOUT, waiter_conn.recv_reply())
            .await??;
        match reply {
            ApiReply::LockAcquire {
                id,
                status: Status::Ok,
                holder: Some(granted),
            } => {
                assert_eq!(id, wait_id);
                assert!(granted > holder);
            }
            other => panic!("unexpected reply {:?}", other),
        }
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 3)]
    async fn expired_hold_reclaimed() -> Result<(), DsdcError> {
        spawn_pair(56729, 56730).await?;

        let mut conn = PeerConn::connect("127.0.0.1", 56730).await?;
        let key = Key::of_name("leaky");

        // a hold with a short lifetime, never released
        let (status, _) =
            acquire(&mut conn, key, true, false, Some(200)).await?;
        assert_eq!(status, Status::Ok);

        // a blocking writer is granted once the hold expires
        let wait_id = conn.next_id();
        conn.send_req(&ApiRequest::LockAcquire {
            id: wait_id,
            key,
            writer: true,
            block: true,
            timeout_ms: None,
        })
        .await?;
        let reply =
            time::timeout(Duration::from_secs(5), conn.recv_reply())
                .await??;
        match reply {
            ApiReply::LockAcquire {
                id,
                status: Status::Ok,
                holder: Some(_),
            } => assert_eq!(id, wait_id),
            other => panic!("unexpected reply {:?}", other),
        }
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 3)]
    async fn cache_ops_refused() -> Result<(), DsdcError> {
        spawn_pair(56739, 56740).await?;
        let mut conn = PeerConn::connect("127.0.0.1", 56740).await?;
        let id = conn.next_id();
        let reply = conn
            .rpc(
                ApiRequest::Get {
                    id,
                    key: Key::of_name("k"),
                },
                RPC_TIMEOUT,
            )
            .await?;
        assert_eq!(reply, ApiReply::Unsupported { id });
        Ok(())
    }
}
