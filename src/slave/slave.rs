//! Data slave main event loop implementation.

use std::net::SocketAddr;
use std::process;

use serde::Deserialize;
use tokio::sync::watch;
use tokio::time::{self, Duration};

use crate::client::MasterLink;
use crate::net::{ConnId, RpcEvent, RpcServer};
use crate::protocol::{ApiReply, ApiRequest, SlaveInfo, Status};
use crate::ring::{Key, StateCache};
use crate::slave::store::LruStore;
use crate::utils::DsdcError;

/// Configuration parameters of the data slave role.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct SlaveConfig {
    /// Hostname to advertise to masters (how peers will reach me).
    pub hostname: String,

    /// Number of virtual ring positions to claim.
    pub nnodes: u32,

    /// Cache capacity in value bytes.
    pub max_bytes: usize,

    /// Never evict objects on ring changes.
    pub no_clean: bool,

    /// Force a cleanup pass after this many consecutive unchanged
    /// snapshot polls (0 disables).
    pub clean_interval: u32,

    /// Interval between heartbeats to each master in millisecs.
    pub heartbeat_interval_ms: u64,

    /// Interval between snapshot polls in millisecs.
    pub refresh_interval_ms: u64,

    /// Fixed wait between reconnect attempts to a down master in
    /// millisecs.
    pub retry_wait_ms: u64,

    /// Timeout of RPCs to masters in millisecs.
    pub rpc_timeout_ms: u64,
}

impl Default for SlaveConfig {
    fn default() -> Self {
        SlaveConfig {
            hostname: "127.0.0.1".into(),
            nnodes: 5,
            max_bytes: 16 * 1024 * 1024,
            no_clean: false,
            clean_interval: 120,
            heartbeat_interval_ms: 2000,
            refresh_interval_ms: 10_000,
            retry_wait_ms: 10_000,
            rpc_timeout_ms: 5000,
        }
    }
}

impl SlaveConfig {
    /// Overlays the defaults with fields parsed from a TOML string.
    pub fn parsed(config_str: Option<&str>) -> Result<Self, DsdcError> {
        parsed_config!(config_str => SlaveConfig;
                       hostname, nnodes, max_bytes, no_clean,
                       clean_interval, heartbeat_interval_ms,
                       refresh_interval_ms, retry_wait_ms, rpc_timeout_ms)
    }
}

/// The data slave role: serves one LRU shard, registered with every
/// configured master.
pub struct Slave {
    /// Configuration parameters struct.
    config: SlaveConfig,

    /// Inbound RPC service.
    rpc: RpcServer,

    /// The LRU object shard.
    store: LruStore,

    /// My advertised identity and claimed ring positions.
    me: SlaveInfo,

    /// Links to all configured masters.
    links: Vec<MasterLink>,

    /// Local mirror of the membership snapshot (for cleanup decisions).
    state: StateCache,

    /// Consecutive unchanged snapshot polls since the last cleanup.
    polls_since_clean: u32,
}

impl Slave {
    /// Creates a new data slave: binds the listener and claims fresh ring
    /// positions.
    pub async fn new_and_setup(
        listen_addr: SocketAddr,
        masters: Vec<(String, u16)>,
        config: SlaveConfig,
    ) -> Result<Self, DsdcError> {
        if masters.is_empty() {
            return logged_err!("no masters given");
        }
        if config.nnodes == 0 {
            return logged_err!("invalid nnodes {}", config.nnodes);
        }

        let rpc = RpcServer::new_and_setup(listen_addr).await?;
        let me = SlaveInfo {
            hostname: config.hostname.clone(),
            port: listen_addr.port(),
            keys: Self::gen_ring_keys(
                &config.hostname,
                listen_addr.port(),
                config.nnodes,
            ),
        };
        pf_info!(
            "slave '{}' claiming {} ring positions",
            me.id(),
            me.keys.len()
        );

        let links = masters
            .into_iter()
            .map(|(host, port)| MasterLink::new(host, port))
            .collect();
        let store = LruStore::new(config.max_bytes);

        Ok(Slave {
            config,
            rpc,
            store,
            me,
            links,
            // cleanup pacing is driven by `clean_interval` instead of the
            // cache's own forced-refresh floor
            state: StateCache::new(0),
            polls_since_clean: 0,
        })
    }

    /// Generates this process's ring positions. Salted so that a restart
    /// claims fresh positions instead of colliding with its own stale
    /// registration.
    fn gen_ring_keys(hostname: &str, port: u16, nnodes: u32) -> Vec<Key> {
        let salt: u64 = rand::random();
        (0..nnodes)
            .map(|i| {
                Key::of_name(&format!(
                    "{}:{}:{}:{}:{}",
                    hostname,
                    port,
                    process::id(),
                    salt,
                    i
                ))
            })
            .collect()
    }

    /// Main event loop. Runs until termination is signaled.
    pub async fn run(
        &mut self,
        mut rx_term: watch::Receiver<bool>,
    ) -> Result<(), DsdcError> {
        let mut hb_interval = time::interval(Duration::from_millis(
            self.config.heartbeat_interval_ms,
        ));
        let mut refresh_interval = time::interval(Duration::from_millis(
            self.config.refresh_interval_ms,
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
                        RpcEvent::Closed(_) => {}
                    }
                },

                // time to heartbeat the masters
                _ = hb_interval.tick() => {
                    self.heartbeat_masters().await;
                },

                // time to poll the membership snapshot
                _ = refresh_interval.tick() => {
                    self.refresh().await;
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

    /// Serves one cache request.
    fn handle_request(
        &mut self,
        conn: ConnId,
        req: ApiRequest,
    ) -> Result<(), DsdcError> {
        let reply = match req {
            ApiRequest::Get { id, key } => match self.store.get(&key) {
                Some((value, cksum)) => ApiReply::Get {
                    id,
                    status: Status::Ok,
                    value: Some(value.to_vec()),
                    cksum,
                },
                None => ApiReply::Get {
                    id,
                    status: Status::NotFound,
                    value: None,
                    cksum: None,
                },
            },

            ApiRequest::MGet { id, keys } => ApiReply::MGet {
                id,
                results: self.store.mget(&keys),
            },

            ApiRequest::Put {
                id,
                key,
                value,
                annotation,
                cksum,
            } => ApiReply::Put {
                id,
                status: self.store.put(key, value, annotation, cksum),
            },

            ApiRequest::Remove { id, key } => ApiReply::Remove {
                id,
                status: if self.store.remove(&key) {
                    Status::Ok
                } else {
                    Status::NotFound
                },
            },

            // accepted for forward compatibility; data movement toward
            // arriving nodes is not performed
            ApiRequest::NewNode { id, info } => {
                pf_debug!("newnode notice for '{}'", info.id());
                ApiReply::NewNode {
                    id,
                    status: Status::Ok,
                }
            }

            ApiRequest::Leave => return Ok(()),

            // not a master; registration, state, and lock ops are not
            // served here
            req => match req.id() {
                Some(id) => ApiReply::Unsupported { id },
                None => return Ok(()),
            },
        };
        self.rpc.send_reply(reply, conn)
    }

    /// Heartbeats every ready master link.
    async fn heartbeat_masters(&mut self) {
        let timeout = self.rpc_timeout();
        for link in self.links.iter_mut().filter(|l| l.is_ready()) {
            let link_id = link.id();
            if let Err(e) = link.heartbeat(timeout).await {
                pf_warn!("heartbeat to master '{}' failed: {}", link_id, e);
            }
        }
    }

    /// One refresh round: revive due links, then poll the snapshot from
    /// the first ready master and react to changes.
    async fn refresh(&mut self) {
        let timeout = self.rpc_timeout();
        let retry_wait = Duration::from_millis(self.config.retry_wait_ms);

        for link in self.links.iter_mut() {
            if link.retry_due(retry_wait) {
                let link_id = link.id();
                match link
                    .connect_register(&self.me, false, timeout)
                    .await
                {
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

        let fingerprint = self.state.fingerprint();
        let poll = match self.links.iter_mut().find(|l| l.is_ready()) {
            Some(link) => {
                let link_id = link.id();
                match link.get_state(fingerprint, timeout).await {
                    Ok(state) => state,
                    Err(e) => {
                        pf_warn!(
                            "state poll from master '{}' failed: {}",
                            link_id,
                            e
                        );
                        return;
                    }
                }
            }
            None => {
                pf_warn!("no masters reachable");
                return;
            }
        };

        let changed = match self.state.apply(poll.as_ref()) {
            Ok(changed) => changed,
            Err(e) => {
                pf_error!("error applying snapshot: {}", e);
                return;
            }
        };

        if changed {
            pf_info!(
                "membership changed: {} ring positions known",
                self.state.ring().len()
            );
            self.polls_since_clean = 0;
            self.clean_store();
        } else {
            self.polls_since_clean += 1;
            if self.config.clean_interval > 0
                && self.polls_since_clean >= self.config.clean_interval
            {
                self.polls_since_clean = 0;
                self.clean_store();
            }
        }
    }

    fn clean_store(&mut self) {
        if self.config.no_clean {
            return;
        }
        let cleaned = self.store.clean(self.state.ring(), &self.me.id());
        if cleaned > 0 {
            pf_info!("cleaned {} objects now owned elsewhere", cleaned);
        }
    }
}

#[cfg(test)]
mod slave_tests {
    use super::*;
    use crate::master::{Master, MasterConfig};
    use crate::net::PeerConn;
    use crate::ring::StateCache;
    use std::sync::Arc;
    use tokio::sync::Barrier;

    fn test_config() -> SlaveConfig {
        SlaveConfig {
            heartbeat_interval_ms: 50,
            refresh_interval_ms: 50,
            retry_wait_ms: 50,
            rpc_timeout_ms: 2000,
            ..SlaveConfig::default()
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 3)]
    async fn serves_cache_and_registers() -> Result<(), DsdcError> {
        let barrier = Arc::new(Barrier::new(3));
        let barrier2 = barrier.clone();
        let barrier3 = barrier.clone();
        tokio::spawn(async move {
            let mut master = Master::new_and_setup(
                "127.0.0.1:55710".parse()?,
                MasterConfig::default(),
            )
            .await?;
            barrier2.wait().await;
            let (_tx_term, rx_term) = watch::channel(false);
            master.run(rx_term).await
        });
        tokio::spawn(async move {
            let mut slave = Slave::new_and_setup(
                "127.0.0.1:55711".parse()?,
                vec![("127.0.0.1".into(), 55710)],
                test_config(),
            )
            .await?;
            barrier3.wait().await;
            let (_tx_term, rx_term) = watch::channel(false);
            slave.run(rx_term).await
        });
        barrier.wait().await;

        // give the slave a couple of refresh ticks to register
        time::sleep(Duration::from_millis(300)).await;

        // the master's snapshot now lists the slave
        let mut cli = PeerConn::connect("127.0.0.1", 55710).await?;
        let id = cli.next_id();
        let reply = cli
            .rpc(
                ApiRequest::GetState {
                    id,
                    fingerprint: Key::zero(),
                },
                Duration::from_secs(5),
            )
            .await?;
        let state = match reply {
            ApiReply::GetState {
                state: Some(state), ..
            } => state,
            other => panic!("unexpected reply {:?}", other),
        };
        assert_eq!(state.slaves.len(), 1);
        assert_eq!(state.slaves[0].id(), "127.0.0.1:55711");
        assert_eq!(state.slaves[0].keys.len(), 5);

        // smart-client style: talk to the slave directly
        let mut conn = PeerConn::connect("127.0.0.1", 55711).await?;
        let key = Key::of_name("hello");
        let id = conn.next_id();
        let reply = conn
            .rpc(
                ApiRequest::Put {
                    id,
                    key,
                    value: b"world".to_vec(),
                    annotation: None,
                    cksum: Some(Key::digest(b"world")),
                },
                Duration::from_secs(5),
            )
            .await?;
        assert_eq!(
            reply,
            ApiReply::Put {
                id,
                status: Status::Inserted,
            }
        );
        let id = conn.next_id();
        let reply = conn
            .rpc(ApiRequest::Get { id, key }, Duration::from_secs(5))
            .await?;
        assert_eq!(
            reply,
            ApiReply::Get {
                id,
                status: Status::Ok,
                value: Some(b"world".to_vec()),
                cksum: Some(Key::digest(b"world")),
            }
        );

        // mget mixes hits and misses in order
        let id = conn.next_id();
        let reply = conn
            .rpc(
                ApiRequest::MGet {
                    id,
                    keys: vec![Key::of_name("nope"), key],
                },
                Duration::from_secs(5),
            )
            .await?;
        match reply {
            ApiReply::MGet { results, .. } => {
                assert_eq!(results[0].status, Status::NotFound);
                assert_eq!(results[1].status, Status::Ok);
            }
            other => panic!("unexpected reply {:?}", other),
        }

        // ops a slave does not serve get refused
        let id = conn.next_id();
        let reply = conn
            .rpc(
                ApiRequest::GetState {
                    id,
                    fingerprint: Key::zero(),
                },
                Duration::from_secs(5),
            )
            .await?;
        assert_eq!(reply, ApiReply::Unsupported { id });
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn setup_validations() {
        assert!(Slave::new_and_setup(
            "127.0.0.1:55720".parse().unwrap(),
            vec![],
            test_config(),
        )
        .await
        .is_err());
        assert!(Slave::new_and_setup(
            "127.0.0.1:55721".parse().unwrap(),
            vec![("127.0.0.1".into(), 40100)],
            SlaveConfig {
                nnodes: 0,
                ..test_config()
            },
        )
        .await
        .is_err());
    }

    #[test]
    fn config_overlay_parses() -> Result<(), DsdcError> {
        let config = SlaveConfig::parsed(Some(
            "nnodes = 8\nmax_bytes = 1048576\nno_clean = true",
        ))?;
        assert_eq!(config.nnodes, 8);
        assert_eq!(config.max_bytes, 1024 * 1024);
        assert!(config.no_clean);
        assert_eq!(config.clean_interval, 120);
        Ok(())
    }

    #[test]
    fn ring_keys_unique_per_process_run() {
        let keys = Slave::gen_ring_keys("h", 41000, 5);
        let other = Slave::gen_ring_keys("h", 41000, 5);
        assert_eq!(keys.len(), 5);
        // salted, so a regenerated claim does not collide
        assert_ne!(keys, other);
    }

    #[test]
    fn statecache_floor_disabled_for_slaves() {
        // slaves pace cleanup themselves; the cache floor stays off
        let mut cache = StateCache::new(0);
        for _ in 0..10_000 {
            assert!(!cache.apply(None).unwrap());
        }
        assert!(cache.fingerprint().is_zero()); // still the initial zero
    }
}
