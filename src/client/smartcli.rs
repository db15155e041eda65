//! The smart client: routes cache operations to owning slaves using a
//! locally mirrored ring, with an optional proxied ("safe") path through
//! the masters for callers that prefer one round trip of indirection.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::time::{self, Duration, Instant};

use crate::lockserver::DEFAULT_LOCK_TIMEOUT_MS;
use crate::net::{ConnPool, PeerConn};
use crate::protocol::{
    ApiReply, ApiRequest, GetResult, HolderId, RequestId, Status,
};
use crate::ring::{group_by_owner, Cksum, Key, StateCache};
use crate::utils::{parse_host_port, DsdcError};

/// Configuration parameters of the smart client.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct ClientConfig {
    /// Re-poll the membership snapshot after this many millisecs.
    pub refresh_interval_ms: u64,

    /// Zero the snapshot fingerprint after this many consecutive
    /// unchanged polls, forcing a full re-fetch (0 disables).
    pub max_unchanged_refreshes: u32,

    /// Timeout of individual RPCs in millisecs.
    pub rpc_timeout_ms: u64,

    /// Largest object accepted for a put, checked before any network
    /// I/O.
    pub max_obj_size: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            refresh_interval_ms: 10_000,
            max_unchanged_refreshes: 120,
            rpc_timeout_ms: 5000,
            max_obj_size: 1024 * 1024,
        }
    }
}

impl ClientConfig {
    /// Overlays the defaults with fields parsed from a TOML string.
    pub fn parsed(config_str: Option<&str>) -> Result<Self, DsdcError> {
        parsed_config!(config_str => ClientConfig;
                       refresh_interval_ms, max_unchanged_refreshes,
                       rpc_timeout_ms, max_obj_size)
    }
}

/// Smart DSDC client. Holds a sticky primary master (failing over
/// round-robin on errors), a mirror of the membership snapshot, and a
/// pool of direct connections to slaves and the lock server.
pub struct DsdcClient {
    /// Configuration parameters struct.
    config: ClientConfig,

    /// Known masters as `(hostname, port)`.
    masters: Vec<(String, u16)>,

    /// Established master connections, slot-aligned with `masters`.
    master_conns: Vec<Option<PeerConn>>,

    /// Index of the current sticky primary master.
    primary: usize,

    /// Local mirror of the membership snapshot.
    state: StateCache,

    /// Pooled direct connections to slaves and the lock server.
    pool: ConnPool,

    /// When the snapshot was last polled (successfully or not).
    last_refresh: Option<Instant>,
}

impl DsdcClient {
    /// Creates a new smart client over the given master list.
    pub fn new(
        masters: Vec<(String, u16)>,
        config: ClientConfig,
    ) -> Result<Self, DsdcError> {
        if masters.is_empty() {
            return logged_err!("no masters given");
        }
        let master_conns = masters.iter().map(|_| None).collect();
        let state = StateCache::new(config.max_unchanged_refreshes);
        Ok(DsdcClient {
            config,
            masters,
            master_conns,
            primary: 0,
            state,
            pool: ConnPool::new(),
            last_refresh: None,
        })
    }

    fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.config.rpc_timeout_ms)
    }

    /// Forces a snapshot poll from the masters, pruning pooled
    /// connections to departed nodes on change. Returns true if the
    /// snapshot changed.
    pub async fn refresh(&mut self) -> Result<bool, DsdcError> {
        self.last_refresh = Some(Instant::now());
        let fingerprint = self.state.fingerprint();
        let timeout = self.rpc_timeout();
        let reply = self
            .master_rpc(
                |id| ApiRequest::GetState { id, fingerprint },
                timeout,
            )
            .await?;
        let state = match reply {
            ApiReply::GetState { state, .. } => state,
            _ => return logged_err!("unexpected get-state reply"),
        };
        let changed = self.state.apply(state.as_ref())?;
        if changed {
            pf_debug!(
                "snapshot changed: {} ring positions, lock server {:?}",
                self.state.ring().len(),
                self.state.lock_server()
            );
            self.pool.prune(&self.state.peer_ids());
        }
        Ok(changed)
    }

    /// Refreshes if the refresh interval has elapsed (or no poll has
    /// happened yet). A failed periodic refresh only fails the caller
    /// when no usable snapshot exists at all.
    async fn maybe_refresh(&mut self) -> Result<(), DsdcError> {
        let due = match self.last_refresh {
            None => true,
            Some(at) => {
                at.elapsed()
                    >= Duration::from_millis(self.config.refresh_interval_ms)
            }
        };
        if !due {
            return Ok(());
        }
        match self.refresh().await {
            Ok(_) => Ok(()),
            Err(e) if self.state.ring().is_empty() => Err(e),
            Err(e) => {
                pf_warn!("snapshot refresh failed, using stale: {}", e);
                Ok(())
            }
        }
    }

    /// Issues one RPC against the sticky primary master, failing over
    /// round-robin through the remaining masters on transport errors.
    async fn master_rpc(
        &mut self,
        make: impl Fn(RequestId) -> ApiRequest,
        timeout: Duration,
    ) -> Result<ApiReply, DsdcError> {
        let connect_timeout = self.rpc_timeout();
        for attempt in 0..self.masters.len() {
            let idx = (self.primary + attempt) % self.masters.len();
            if self.master_conns[idx].is_none() {
                let (hostname, port) = self.masters[idx].clone();
                match time::timeout(
                    connect_timeout,
                    PeerConn::connect(&hostname, port),
                )
                .await
                {
                    Ok(Ok(conn)) => self.master_conns[idx] = Some(conn),
                    Ok(Err(e)) => {
                        pf_warn!(
                            "cannot connect to master '{}:{}': {}",
                            hostname,
                            port,
                            e
                        );
                        continue;
                    }
                    Err(_) => {
                        pf_warn!(
                            "connect to master '{}:{}' timed out",
                            hostname,
                            port
                        );
                        continue;
                    }
                }
            }
            if let Some(conn) = self.master_conns[idx].as_mut() {
                let id = conn.next_id();
                match conn.rpc(make(id), timeout).await {
                    Ok(reply) => {
                        if self.primary != idx {
                            pf_info!(
                                "failed over to master '{}'",
                                conn.peer()
                            );
                            self.primary = idx;
                        }
                        return Ok(reply);
                    }
                    Err(e) => {
                        pf_warn!(
                            "rpc to master '{}' failed: {}",
                            conn.peer(),
                            e
                        );
                        self.master_conns[idx] = None;
                    }
                }
            }
        }
        logged_err!("no masters reachable")
    }

    /// Issues one RPC directly to a pooled node connection, discarding
    /// the connection on transport errors.
    async fn node_rpc(
        &mut self,
        peer: &str,
        make: impl Fn(RequestId) -> ApiRequest,
        timeout: Duration,
    ) -> Result<ApiReply, DsdcError> {
        let (hostname, port) = parse_host_port(peer)?;
        let conn = self
            .pool
            .checkout(&hostname, port, self.rpc_timeout())
            .await?;
        let id = conn.next_id();
        match conn.rpc(make(id), timeout).await {
            Ok(reply) => Ok(reply),
            Err(e) => {
                self.pool.discard(peer);
                Err(e)
            }
        }
    }

    /// The ring owner of `key`, if a snapshot with slaves is mirrored.
    fn owner_of(&self, key: &Key) -> Option<String> {
        self.state.ring().owner_of(key).cloned()
    }

    /// Looks up one object. With `safe`, the operation is proxied through
    /// a master instead of going directly to the owning slave.
    pub async fn get(
        &mut self,
        key: &Key,
        safe: bool,
    ) -> Result<GetResult, DsdcError> {
        self.maybe_refresh().await?;
        let timeout = self.rpc_timeout();
        if safe || self.state.ring().is_empty() {
            match self
                .master_rpc(|id| ApiRequest::Get { id, key: *key }, timeout)
                .await?
            {
                ApiReply::Get {
                    status,
                    value,
                    cksum,
                    ..
                } => Ok(GetResult {
                    status,
                    value,
                    cksum,
                }),
                _ => Ok(GetResult::miss(Status::RpcError)),
            }
        } else {
            let owner = match self.owner_of(key) {
                Some(owner) => owner,
                None => return Ok(GetResult::miss(Status::NoNode)),
            };
            match self
                .node_rpc(&owner, |id| ApiRequest::Get { id, key: *key }, timeout)
                .await
            {
                Ok(ApiReply::Get {
                    status,
                    value,
                    cksum,
                    ..
                }) => Ok(GetResult {
                    status,
                    value,
                    cksum,
                }),
                Ok(_) => Ok(GetResult::miss(Status::RpcError)),
                Err(_) => Ok(GetResult::miss(Status::RpcError)),
            }
        }
    }

    /// Inserts or replaces one object. Objects over `max_obj_size` are
    /// refused before any network I/O.
    pub async fn put(
        &mut self,
        key: Key,
        value: Vec<u8>,
        annotation: Option<String>,
        cksum: Option<Cksum>,
        safe: bool,
    ) -> Result<Status, DsdcError> {
        if value.len() > self.config.max_obj_size {
            return Ok(Status::TooBig);
        }
        self.maybe_refresh().await?;
        let timeout = self.rpc_timeout();
        let make = |id| ApiRequest::Put {
            id,
            key,
            value: value.clone(),
            annotation: annotation.clone(),
            cksum,
        };
        if safe || self.state.ring().is_empty() {
            match self.master_rpc(make, timeout).await? {
                ApiReply::Put { status, .. } => Ok(status),
                _ => Ok(Status::RpcError),
            }
        } else {
            let owner = match self.owner_of(&key) {
                Some(owner) => owner,
                None => return Ok(Status::NoNode),
            };
            match self.node_rpc(&owner, make, timeout).await {
                Ok(ApiReply::Put { status, .. }) => Ok(status),
                Ok(_) => Ok(Status::RpcError),
                Err(_) => Ok(Status::RpcError),
            }
        }
    }

    /// Removes one object.
    pub async fn remove(
        &mut self,
        key: &Key,
        safe: bool,
    ) -> Result<Status, DsdcError> {
        self.maybe_refresh().await?;
        let timeout = self.rpc_timeout();
        let make = |id| ApiRequest::Remove { id, key: *key };
        if safe || self.state.ring().is_empty() {
            match self.master_rpc(make, timeout).await? {
                ApiReply::Remove { status, .. } => Ok(status),
                _ => Ok(Status::RpcError),
            }
        } else {
            let owner = match self.owner_of(key) {
                Some(owner) => owner,
                None => return Ok(Status::NoNode),
            };
            match self.node_rpc(&owner, make, timeout).await {
                Ok(ApiReply::Remove { status, .. }) => Ok(status),
                Ok(_) => Ok(Status::RpcError),
                Err(_) => Ok(Status::RpcError),
            }
        }
    }

    /// Looks up many objects, grouped into one MGET per owning slave.
    /// Results come back in input order; a slave's failure poisons only
    /// its own batch (with RpcError), never the whole call.
    pub async fn mget(
        &mut self,
        keys: &[Key],
    ) -> Result<Vec<GetResult>, DsdcError> {
        if keys.is_empty() {
            return Ok(vec![]);
        }
        self.maybe_refresh().await?;
        let timeout = self.rpc_timeout();

        if self.state.ring().is_empty() {
            // no snapshot; let a master fan out on our behalf
            let reply = self
                .master_rpc(
                    |id| ApiRequest::MGet {
                        id,
                        keys: keys.to_vec(),
                    },
                    timeout,
                )
                .await?;
            return match reply {
                ApiReply::MGet { results, .. }
                    if results.len() == keys.len() =>
                {
                    Ok(results)
                }
                _ => Ok(vec![GetResult::miss(Status::RpcError); keys.len()]),
            };
        }

        let mut results = vec![GetResult::miss(Status::NoNode); keys.len()];
        for (owner, batch) in group_by_owner(self.state.ring(), keys) {
            let batch_keys = batch.keys.clone();
            let outcome = self
                .node_rpc(
                    &owner,
                    |id| ApiRequest::MGet {
                        id,
                        keys: batch_keys.clone(),
                    },
                    timeout,
                )
                .await;
            match outcome {
                Ok(ApiReply::MGet { results: got, .. })
                    if got.len() == batch.keys.len() =>
                {
                    for (&pos, res) in batch.positions.iter().zip(got) {
                        results[pos] = res;
                    }
                }
                _ => {
                    pf_warn!("mget batch to '{}' failed", owner);
                    for &pos in &batch.positions {
                        results[pos] = GetResult::miss(Status::RpcError);
                    }
                }
            }
        }
        Ok(results)
    }

    /// Acquires an advisory lock on `key`, directly against the lock
    /// server from the snapshot (or proxied with `safe`). Blocking
    /// acquires wait out the hold lifetime plus one RPC timeout.
    pub async fn lock_acquire(
        &mut self,
        key: Key,
        writer: bool,
        block: bool,
        timeout_ms: Option<u64>,
        safe: bool,
    ) -> Result<(Status, Option<HolderId>), DsdcError> {
        self.maybe_refresh().await?;
        let wait = Duration::from_millis(
            self.config.rpc_timeout_ms
                + if block {
                    timeout_ms.unwrap_or(DEFAULT_LOCK_TIMEOUT_MS)
                } else {
                    0
                },
        );
        let make = |id| ApiRequest::LockAcquire {
            id,
            key,
            writer,
            block,
            timeout_ms,
        };
        let server = if safe {
            None
        } else {
            self.state.lock_server().map(str::to_owned)
        };
        match server {
            // no direct route; let a master relay to its primary
            None => match self.master_rpc(make, wait).await? {
                ApiReply::LockAcquire { status, holder, .. } => {
                    Ok((status, holder))
                }
                _ => Ok((Status::RpcError, None)),
            },
            Some(server) => match self.node_rpc(&server, make, wait).await {
                Ok(ApiReply::LockAcquire { status, holder, .. }) => {
                    Ok((status, holder))
                }
                Ok(_) => Ok((Status::RpcError, None)),
                Err(_) => Ok((Status::RpcError, None)),
            }
        }
    }

    /// Releases a lock hold previously granted as `holder`.
    pub async fn lock_release(
        &mut self,
        key: Key,
        holder: HolderId,
        safe: bool,
    ) -> Result<Status, DsdcError> {
        self.maybe_refresh().await?;
        let timeout = self.rpc_timeout();
        let make = |id| ApiRequest::LockRelease { id, key, holder };
        let server = if safe {
            None
        } else {
            self.state.lock_server().map(str::to_owned)
        };
        match server {
            None => match self.master_rpc(make, timeout).await? {
                ApiReply::LockRelease { status, .. } => Ok(status),
                _ => Ok(Status::RpcError),
            },
            Some(server) => match self.node_rpc(&server, make, timeout).await
            {
                Ok(ApiReply::LockRelease { status, .. }) => Ok(status),
                Ok(_) => Ok(Status::RpcError),
                Err(_) => Ok(Status::RpcError),
            },
        }
    }

    /// Serializes `obj`, computes its checksum, and puts the bytes. A
    /// serialization failure is reported as `EncodeError` with nothing
    /// sent.
    pub async fn put_obj<T: Serialize>(
        &mut self,
        key: Key,
        obj: &T,
        annotation: Option<String>,
        safe: bool,
    ) -> Result<Status, DsdcError> {
        let bytes = match rmp_serde::encode::to_vec(obj) {
            Ok(bytes) => bytes,
            Err(e) => {
                pf_warn!("object encode failed: {}", e);
                return Ok(Status::EncodeError);
            }
        };
        let cksum = Cksum::digest(&bytes);
        self.put(key, bytes, annotation, Some(cksum), safe).await
    }

    /// Gets an object and deserializes it into `T`. Bytes that fail their
    /// stored checksum, or that do not decode, are reported as
    /// `DecodeError`.
    pub async fn get_obj<T: DeserializeOwned>(
        &mut self,
        key: &Key,
        safe: bool,
    ) -> Result<(Status, Option<T>), DsdcError> {
        let result = self.get(key, safe).await?;
        match result.value {
            Some(bytes) => {
                if let Some(cksum) = result.cksum {
                    if !cksum.verify(&bytes) {
                        pf_warn!("object failed checksum validation");
                        return Ok((Status::DecodeError, None));
                    }
                }
                match rmp_serde::decode::from_slice(&bytes) {
                    Ok(obj) => Ok((result.status, Some(obj))),
                    Err(e) => {
                        pf_warn!("object decode failed: {}", e);
                        Ok((Status::DecodeError, None))
                    }
                }
            }
            None => Ok((result.status, None)),
        }
    }

    /// Gracefully closes the established master connections.
    pub async fn leave(&mut self) {
        for conn in self.master_conns.iter_mut().flatten() {
            let _ = conn.leave().await;
        }
        self.master_conns.iter_mut().for_each(|slot| *slot = None);
    }
}

#[cfg(test)]
mod smartcli_tests {
    use super::*;
    use crate::lockserver::{LockServer, LockServerConfig};
    use crate::master::{Master, MasterConfig};
    use crate::slave::{Slave, SlaveConfig};
    use std::sync::Arc;
    use tokio::sync::{watch, Barrier};

    fn test_config() -> ClientConfig {
        ClientConfig {
            refresh_interval_ms: 50,
            ..ClientConfig::default()
        }
    }

    /// Spawns a full master + slave + lock-server stack on consecutive
    /// ports starting at `base`.
    async fn spawn_stack(base: u16) -> Result<(), DsdcError> {
        let barrier = Arc::new(Barrier::new(4));
        let barrier2 = barrier.clone();
        let barrier3 = barrier.clone();
        let barrier4 = barrier.clone();
        tokio::spawn(async move {
            let mut master = Master::new_and_setup(
                format!("127.0.0.1:{}", base).parse()?,
                MasterConfig::default(),
            )
            .await?;
            barrier2.wait().await;
            let (_tx_term, rx_term) = watch::channel(false);
            master.run(rx_term).await
        });
        tokio::spawn(async move {
            let mut slave = Slave::new_and_setup(
                format!("127.0.0.1:{}", base + 1).parse()?,
                vec![("127.0.0.1".into(), base)],
                SlaveConfig {
                    heartbeat_interval_ms: 50,
                    refresh_interval_ms: 50,
                    retry_wait_ms: 50,
                    ..SlaveConfig::default()
                },
            )
            .await?;
            barrier3.wait().await;
            let (_tx_term, rx_term) = watch::channel(false);
            slave.run(rx_term).await
        });
        tokio::spawn(async move {
            let mut lockserver = LockServer::new_and_setup(
                format!("127.0.0.1:{}", base + 2).parse()?,
                vec![("127.0.0.1".into(), base)],
                LockServerConfig {
                    heartbeat_interval_ms: 50,
                    retry_wait_ms: 50,
                    ..LockServerConfig::default()
                },
            )
            .await?;
            barrier4.wait().await;
            let (_tx_term, rx_term) = watch::channel(false);
            lockserver.run(rx_term).await
        });
        barrier.wait().await;
        // give both nodes a couple of ticks to register
        tokio::time::sleep(Duration::from_millis(400)).await;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn direct_cache_ops() -> Result<(), DsdcError> {
        spawn_stack(57720).await?;
        let mut cli = DsdcClient::new(
            vec![("127.0.0.1".into(), 57720)],
            test_config(),
        )?;
        assert!(cli.refresh().await?);

        let key = Key::of_name("greeting");
        assert_eq!(
            cli.put(key, b"hello".to_vec(), None, None, false).await?,
            Status::Inserted
        );
        assert_eq!(
            cli.put(key, b"hello again".to_vec(), None, None, false)
                .await?,
            Status::Replaced
        );
        let got = cli.get(&key, false).await?;
        assert_eq!(got.status, Status::Ok);
        assert_eq!(got.value.as_deref(), Some(&b"hello again"[..]));

        assert_eq!(
            cli.get(&Key::of_name("absent"), false).await?.status,
            Status::NotFound
        );
        assert_eq!(cli.remove(&key, false).await?, Status::Ok);
        assert_eq!(cli.remove(&key, false).await?, Status::NotFound);
        cli.leave().await;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn proxied_cache_ops() -> Result<(), DsdcError> {
        spawn_stack(57730).await?;
        let mut cli = DsdcClient::new(
            vec![("127.0.0.1".into(), 57730)],
            test_config(),
        )?;

        let key = Key::of_name("via-master");
        assert_eq!(
            cli.put(key, b"proxied".to_vec(), None, None, true).await?,
            Status::Inserted
        );
        // fast path sees the object the safe path wrote
        let got = cli.get(&key, false).await?;
        assert_eq!(got.status, Status::Ok);
        assert_eq!(got.value.as_deref(), Some(&b"proxied"[..]));
        assert_eq!(cli.remove(&key, true).await?, Status::Ok);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn mget_mixed_results() -> Result<(), DsdcError> {
        spawn_stack(57740).await?;
        let mut cli = DsdcClient::new(
            vec![("127.0.0.1".into(), 57740)],
            test_config(),
        )?;

        let a = Key::of_name("a");
        let b = Key::of_name("b");
        let c = Key::of_name("c");
        cli.put(a, b"aa".to_vec(), None, None, false).await?;
        cli.put(c, b"cc".to_vec(), None, None, false).await?;

        let results = cli.mget(&[a, b, c]).await?;
        assert_eq!(results.len(), 3);
        assert_eq!(results[0].value.as_deref(), Some(&b"aa"[..]));
        assert_eq!(results[1].status, Status::NotFound);
        assert_eq!(results[2].value.as_deref(), Some(&b"cc"[..]));
        assert!(cli.mget(&[]).await?.is_empty());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn lock_roundtrip() -> Result<(), DsdcError> {
        spawn_stack(57750).await?;
        let mut cli = DsdcClient::new(
            vec![("127.0.0.1".into(), 57750)],
            test_config(),
        )?;

        let key = Key::of_name("critical");
        let (status, holder) =
            cli.lock_acquire(key, true, false, None, false).await?;
        assert_eq!(status, Status::Ok);
        let holder = holder.unwrap();

        let (status, _) =
            cli.lock_acquire(key, true, false, None, false).await?;
        assert_eq!(status, Status::Locked);

        // proxied release works against the same lock server
        assert_eq!(
            cli.lock_release(key, holder, true).await?,
            Status::Ok
        );
        let (status, holder) =
            cli.lock_acquire(key, false, false, None, true).await?;
        assert_eq!(status, Status::Ok);
        assert_eq!(
            cli.lock_release(key, holder.unwrap(), false).await?,
            Status::Ok
        );
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn typed_objects_roundtrip() -> Result<(), DsdcError> {
        spawn_stack(57760).await?;
        let mut cli = DsdcClient::new(
            vec![("127.0.0.1".into(), 57760)],
            test_config(),
        )?;

        let key = Key::of_name("profile");
        let profile = vec!["max".to_string(), "webcache".to_string()];
        assert_eq!(
            cli.put_obj(key, &profile, Some("profiles".into()), false)
                .await?,
            Status::Inserted
        );
        let (status, back): (_, Option<Vec<String>>) =
            cli.get_obj(&key, false).await?;
        assert_eq!(status, Status::Ok);
        assert_eq!(back, Some(profile));

        // garbled stored bytes surface as a decode error
        cli.put(key, b"\xc1not msgpack".to_vec(), None, None, false)
            .await?;
        let (status, none): (_, Option<Vec<String>>) =
            cli.get_obj(&key, false).await?;
        assert_eq!(status, Status::DecodeError);
        assert_eq!(none, None);

        // decodable bytes that fail their stored checksum also do
        let bytes = rmp_serde::encode::to_vec(&vec!["ok".to_string()])?;
        let wrong = Cksum::digest(b"some other bytes");
        cli.put(key, bytes, None, Some(wrong), false).await?;
        let (status, none): (_, Option<Vec<String>>) =
            cli.get_obj(&key, false).await?;
        assert_eq!(status, Status::DecodeError);
        assert_eq!(none, None);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn too_big_never_touches_network() -> Result<(), DsdcError> {
        // no stack at all; the check fires before any I/O
        let mut cli = DsdcClient::new(
            vec![("127.0.0.1".into(), 1)],
            ClientConfig {
                max_obj_size: 16,
                ..test_config()
            },
        )?;
        assert_eq!(
            cli.put(Key::of_name("big"), vec![0u8; 17], None, None, false)
                .await?,
            Status::TooBig
        );
        Ok(())
    }

    #[test]
    fn empty_master_list_refused() {
        assert!(DsdcClient::new(vec![], ClientConfig::default()).is_err());
    }
}
