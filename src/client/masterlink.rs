//! Link to one master: connect, register, heartbeat, and snapshot polls.
//! Slaves and lock servers behave as clients toward their masters; this
//! state machine is the client side of that relationship.

use tokio::time::{self, Duration, Instant};

use crate::net::PeerConn;
use crate::protocol::{ApiReply, ApiRequest, SlaveInfo, Status, SystemState};
use crate::ring::Key;
use crate::utils::DsdcError;

/// Health of one master link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LinkStatus {
    /// Not connected; reconnect after the retry wait elapses.
    Down,

    /// Connected and registered.
    Ready,
}

/// One node's connection to one of its masters. Any failure sends the
/// link back to `Down`; the owner retries `connect_register()` on its own
/// schedule (a fixed retry wait, forever).
pub struct MasterLink {
    /// Master's hostname.
    hostname: String,

    /// Master's port.
    port: u16,

    /// Established connection while ready.
    conn: Option<PeerConn>,

    /// Current link health.
    status: LinkStatus,

    /// When the link went down; `None` means never attempted yet, which
    /// is always due for a (re)connect.
    down_since: Option<Instant>,
}

impl MasterLink {
    pub fn new(hostname: String, port: u16) -> Self {
        MasterLink {
            hostname,
            port,
            conn: None,
            status: LinkStatus::Down,
            down_since: None,
        }
    }

    /// Master identity as `host:port`.
    pub fn id(&self) -> String {
        format!("{}:{}", self.hostname, self.port)
    }

    pub fn is_ready(&self) -> bool {
        self.status == LinkStatus::Ready
    }

    /// True if the link is down and due for a reconnect attempt.
    pub fn retry_due(&self, retry_wait: Duration) -> bool {
        match (self.status, self.down_since) {
            (LinkStatus::Ready, _) => false,
            (LinkStatus::Down, None) => true,
            (LinkStatus::Down, Some(since)) => since.elapsed() >= retry_wait,
        }
    }

    /// Tears the link down; the next attempt waits out the retry wait.
    pub fn mark_down(&mut self) {
        self.conn = None;
        self.status = LinkStatus::Down;
        self.down_since = Some(Instant::now());
    }

    /// Connects to the master and registers `me` on the fresh connection.
    pub async fn connect_register(
        &mut self,
        me: &SlaveInfo,
        lock_server: bool,
        timeout: Duration,
    ) -> Result<(), DsdcError> {
        match self.try_connect_register(me, lock_server, timeout).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.mark_down();
                Err(e)
            }
        }
    }

    async fn try_connect_register(
        &mut self,
        me: &SlaveInfo,
        lock_server: bool,
        timeout: Duration,
    ) -> Result<(), DsdcError> {
        let mut conn = time::timeout(
            timeout,
            PeerConn::connect(&self.hostname, self.port),
        )
        .await??;
        let id = conn.next_id();
        let reply = conn
            .rpc(
                ApiRequest::Register {
                    id,
                    info: me.clone(),
                    lock_server,
                },
                timeout,
            )
            .await?;
        match reply {
            ApiReply::Register {
                status: Status::Ok, ..
            } => {
                self.conn = Some(conn);
                self.status = LinkStatus::Ready;
                self.down_since = None;
                Ok(())
            }
            ApiReply::Register { status, .. } => Err(DsdcError::msg(
                format!("registration refused: {:?}", status),
            )),
            _ => Err(DsdcError::msg("unexpected registration reply")),
        }
    }

    /// Proves liveness to the master. A refused heartbeat (e.g. the master
    /// restarted and lost the registration) also downs the link, so the
    /// owner re-registers on its retry schedule.
    pub async fn heartbeat(
        &mut self,
        timeout: Duration,
    ) -> Result<(), DsdcError> {
        match self.try_heartbeat(timeout).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.mark_down();
                Err(e)
            }
        }
    }

    async fn try_heartbeat(
        &mut self,
        timeout: Duration,
    ) -> Result<(), DsdcError> {
        let conn = self
            .conn
            .as_mut()
            .ok_or_else(|| DsdcError::msg("link not connected"))?;
        let id = conn.next_id();
        match conn.rpc(ApiRequest::Heartbeat { id }, timeout).await? {
            ApiReply::Heartbeat {
                status: Status::Ok, ..
            } => Ok(()),
            ApiReply::Heartbeat { status, .. } => Err(DsdcError::msg(
                format!("heartbeat refused: {:?}", status),
            )),
            _ => Err(DsdcError::msg("unexpected heartbeat reply")),
        }
    }

    /// Polls the master's snapshot; `Ok(None)` means unchanged relative to
    /// `fingerprint`.
    pub async fn get_state(
        &mut self,
        fingerprint: Key,
        timeout: Duration,
    ) -> Result<Option<SystemState>, DsdcError> {
        match self.try_get_state(fingerprint, timeout).await {
            Ok(state) => Ok(state),
            Err(e) => {
                self.mark_down();
                Err(e)
            }
        }
    }

    async fn try_get_state(
        &mut self,
        fingerprint: Key,
        timeout: Duration,
    ) -> Result<Option<SystemState>, DsdcError> {
        let conn = self
            .conn
            .as_mut()
            .ok_or_else(|| DsdcError::msg("link not connected"))?;
        let id = conn.next_id();
        match conn
            .rpc(ApiRequest::GetState { id, fingerprint }, timeout)
            .await?
        {
            ApiReply::GetState { state, .. } => Ok(state),
            _ => Err(DsdcError::msg("unexpected get-state reply")),
        }
    }
}

#[cfg(test)]
mod masterlink_tests {
    use super::*;
    use crate::master::{Master, MasterConfig};
    use std::sync::Arc;
    use tokio::sync::{watch, Barrier};

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn register_heartbeat_poll() -> Result<(), DsdcError> {
        let barrier = Arc::new(Barrier::new(2));
        let barrier2 = barrier.clone();
        tokio::spawn(async move {
            let mut master = Master::new_and_setup(
                "127.0.0.1:57710".parse()?,
                MasterConfig::default(),
            )
            .await?;
            barrier2.wait().await;
            let (_tx_term, rx_term) = watch::channel(false);
            master.run(rx_term).await
        });
        barrier.wait().await;

        let me = SlaveInfo {
            hostname: "127.0.0.1".into(),
            port: 41000,
            keys: vec![Key::of_name("n0"), Key::of_name("n1")],
        };
        let mut link = MasterLink::new("127.0.0.1".into(), 57710);
        assert!(!link.is_ready());
        assert!(link.retry_due(Duration::from_secs(10)));

        let timeout = Duration::from_secs(5);
        link.connect_register(&me, false, timeout).await?;
        assert!(link.is_ready());
        link.heartbeat(timeout).await?;

        let state = link.get_state(Key::zero(), timeout).await?.unwrap();
        assert_eq!(state.slaves, vec![me]);
        let fp = state.content_hash()?;
        assert_eq!(link.get_state(fp, timeout).await?, None);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn unreachable_master_downs_link() {
        // nothing listens on this port
        let me = SlaveInfo {
            hostname: "127.0.0.1".into(),
            port: 41000,
            keys: vec![],
        };
        let mut link = MasterLink::new("127.0.0.1".into(), 57719);
        let result = link
            .connect_register(&me, false, Duration::from_millis(500))
            .await;
        assert!(result.is_err());
        assert!(!link.is_ready());
        // freshly downed, so not due yet under a long retry wait
        assert!(!link.retry_due(Duration::from_secs(60)));
        assert!(link.retry_due(Duration::ZERO));
    }
}
