//! Wire-level request/reply types shared by every DSDC role.
//!
//! All messages travel length-prefix framed with MessagePack payloads (see
//! `utils::safetcp`). Every request carries a caller-chosen `RequestId`
//! which the responder echoes back verbatim, so a single connection can
//! have replies arrive out of order (e.g. deferred blocking lock grants).

use serde::{Deserialize, Serialize};

use crate::ring::{Cksum, Key};
use crate::utils::DsdcError;

/// Per-connection request identifier, echoed in the matching reply.
pub type RequestId = u64;

/// Identifier of one granted lock hold, unique within a lock server's
/// lifetime.
pub type HolderId = u64;

/// Status codes carried in replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status {
    /// Operation succeeded.
    Ok,
    /// Key not present (get/remove/mget), or no such hold (lock release).
    NotFound,
    /// Put created a fresh entry.
    Inserted,
    /// Put replaced an existing entry.
    Replaced,
    /// This connection has already registered.
    AlreadyRegistered,
    /// No slave currently owns any portion of the ring.
    NoNode,
    /// The owning node is registered but has stopped heartbeating.
    Dead,
    /// Forwarding to the owning node failed at the RPC layer.
    RpcError,
    /// Non-blocking lock acquire found the lock busy.
    Locked,
    /// Object exceeds the maximum transferable size.
    TooBig,
    /// Client-side serialization of the object failed; nothing was sent.
    EncodeError,
    /// The stored bytes failed to deserialize into the requested type.
    DecodeError,
    /// The receiving role does not serve this operation.
    Unsupported,
}

/// A slave's (or lock server's) self-description: where to reach it and
/// which ring positions it claims. Lock servers claim no positions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlaveInfo {
    /// Hostname (or address literal) the node advertises.
    pub hostname: String,

    /// TCP port the node listens on.
    pub port: u16,

    /// Ring positions claimed (empty for lock servers).
    pub keys: Vec<Key>,
}

impl SlaveInfo {
    /// Canonical `host:port` identity string.
    pub fn id(&self) -> String {
        format!("{}:{}", self.hostname, self.port)
    }
}

/// A complete membership snapshot as handed out by the master: all live
/// data slaves plus the primary lock server, if any.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemState {
    /// Registered data slaves, in stable (registration-connection) order.
    pub slaves: Vec<SlaveInfo>,

    /// Primary lock server, if one is registered.
    pub lock_server: Option<SlaveInfo>,
}

impl SystemState {
    /// Digest of the serialized snapshot, used as its fingerprint in
    /// `GetState` polls.
    pub fn content_hash(&self) -> Result<Key, DsdcError> {
        let bytes = rmp_serde::encode::to_vec(self)?;
        Ok(Key::digest(&bytes))
    }
}

/// Result of one key's lookup within a multi-get.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetResult {
    pub status: Status,
    pub value: Option<Vec<u8>>,
    /// The checksum stored with the object at put time, if any.
    pub cksum: Option<Cksum>,
}

impl GetResult {
    pub fn miss(status: Status) -> Self {
        GetResult {
            status,
            value: None,
            cksum: None,
        }
    }
}

/// Requests clients (and masters, when forwarding) send to DSDC nodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ApiRequest {
    /// Node announcing itself to a master.
    Register {
        id: RequestId,
        info: SlaveInfo,
        lock_server: bool,
    },

    /// Registered node proving liveness to a master.
    Heartbeat { id: RequestId },

    /// Fetch the membership snapshot if it differs from `fingerprint`.
    GetState { id: RequestId, fingerprint: Key },

    /// Look up one object.
    Get { id: RequestId, key: Key },

    /// Look up many objects in one round trip.
    MGet { id: RequestId, keys: Vec<Key> },

    /// Insert or replace one object.
    Put {
        id: RequestId,
        key: Key,
        value: Vec<u8>,
        annotation: Option<String>,
        cksum: Option<Cksum>,
    },

    /// Remove one object.
    Remove { id: RequestId, key: Key },

    /// Acquire an advisory lock. With `block`, the reply may be deferred
    /// until the lock is granted.
    LockAcquire {
        id: RequestId,
        key: Key,
        writer: bool,
        block: bool,
        timeout_ms: Option<u64>,
    },

    /// Release a lock hold previously granted as `holder`.
    LockRelease {
        id: RequestId,
        key: Key,
        holder: HolderId,
    },

    /// Advance notice of a node about to join the ring.
    NewNode { id: RequestId, info: SlaveInfo },

    /// Client-initiated graceful disconnect.
    Leave,
}

impl ApiRequest {
    /// The request's echo ID, if it expects a matched reply.
    pub fn id(&self) -> Option<RequestId> {
        match self {
            ApiRequest::Register { id, .. }
            | ApiRequest::Heartbeat { id }
            | ApiRequest::GetState { id, .. }
            | ApiRequest::Get { id, .. }
            | ApiRequest::MGet { id, .. }
            | ApiRequest::Put { id, .. }
            | ApiRequest::Remove { id, .. }
            | ApiRequest::LockAcquire { id, .. }
            | ApiRequest::LockRelease { id, .. }
            | ApiRequest::NewNode { id, .. } => Some(*id),
            ApiRequest::Leave => None,
        }
    }
}

/// Replies mirroring `ApiRequest` variants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ApiReply {
    Register {
        id: RequestId,
        status: Status,
    },

    Heartbeat {
        id: RequestId,
        status: Status,
    },

    /// `state` is `None` when the caller's fingerprint is already current.
    GetState {
        id: RequestId,
        state: Option<SystemState>,
    },

    Get {
        id: RequestId,
        status: Status,
        value: Option<Vec<u8>>,
        /// Checksum stored alongside the object, echoed for validation.
        cksum: Option<Cksum>,
    },

    /// Per-key results in the same order as the request's key list.
    MGet {
        id: RequestId,
        results: Vec<GetResult>,
    },

    Put {
        id: RequestId,
        status: Status,
    },

    Remove {
        id: RequestId,
        status: Status,
    },

    /// `holder` is set iff `status` grants the lock.
    LockAcquire {
        id: RequestId,
        status: Status,
        holder: Option<HolderId>,
    },

    LockRelease {
        id: RequestId,
        status: Status,
    },

    NewNode {
        id: RequestId,
        status: Status,
    },

    /// The receiving role does not serve the request's operation.
    Unsupported {
        id: RequestId,
    },

    /// Acknowledgement of a graceful disconnect.
    Leave,
}

impl ApiReply {
    /// The echoed request ID, if any.
    pub fn id(&self) -> Option<RequestId> {
        match self {
            ApiReply::Register { id, .. }
            | ApiReply::Heartbeat { id, .. }
            | ApiReply::GetState { id, .. }
            | ApiReply::Get { id, .. }
            | ApiReply::MGet { id, .. }
            | ApiReply::Put { id, .. }
            | ApiReply::Remove { id, .. }
            | ApiReply::LockAcquire { id, .. }
            | ApiReply::LockRelease { id, .. }
            | ApiReply::NewNode { id, .. }
            | ApiReply::Unsupported { id } => Some(*id),
            ApiReply::Leave => None,
        }
    }
}

#[cfg(test)]
mod protocol_tests {
    use super::*;

    fn sample_state() -> SystemState {
        SystemState {
            slaves: vec![SlaveInfo {
                hostname: "127.0.0.1".into(),
                port: 41000,
                keys: vec![Key::of_name("n0"), Key::of_name("n1")],
            }],
            lock_server: None,
        }
    }

    #[test]
    fn request_ids_echo() {
        let req = ApiRequest::Get {
            id: 7,
            key: Key::of_name("k"),
        };
        assert_eq!(req.id(), Some(7));
        assert_eq!(ApiRequest::Leave.id(), None);
        let reply = ApiReply::Get {
            id: 7,
            status: Status::NotFound,
            value: None,
            cksum: None,
        };
        assert_eq!(reply.id(), Some(7));
    }

    #[test]
    fn content_hash_stable() -> Result<(), DsdcError> {
        let state = sample_state();
        assert_eq!(state.content_hash()?, state.content_hash()?);
        let mut other = sample_state();
        other.slaves[0].port += 1;
        assert_ne!(state.content_hash()?, other.content_hash()?);
        Ok(())
    }

    #[test]
    fn wire_roundtrip() -> Result<(), DsdcError> {
        let req = ApiRequest::Put {
            id: 42,
            key: Key::of_name("obj"),
            value: b"payload".to_vec(),
            annotation: Some("webcache".into()),
            cksum: Some(Cksum::digest(b"payload")),
        };
        let bytes = rmp_serde::encode::to_vec(&req)?;
        let back: ApiRequest = rmp_serde::decode::from_slice(&bytes)?;
        assert_eq!(back, req);
        Ok(())
    }
}
