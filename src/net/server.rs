//! Inbound RPC service: one acceptor task plus a servant task per accepted
//! connection, surfacing requests and disconnects as a single event stream.

use std::net::SocketAddr;

use bytes::BytesMut;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::protocol::{ApiReply, ApiRequest};
use crate::utils::{
    safe_tcp_read, safe_tcp_write, tcp_bind_with_retry, DsdcError,
};

/// Server-assigned stable identifier of one accepted connection. IDs are
/// handed out monotonically and never reused within a process lifetime.
pub type ConnId = u64;

/// Events surfaced to the owning role's main loop.
#[derive(Debug, PartialEq, Eq)]
pub enum RpcEvent {
    /// A request arrived on the identified connection.
    Request(ConnId, ApiRequest),

    /// The identified connection has gone away (graceful or not). Any
    /// state keyed on it, e.g. registrations or queued lock waiters,
    /// should be dropped.
    Closed(ConnId),
}

/// The inbound RPC service module shared by master, slave, and lock server
/// roles.
pub struct RpcServer {
    /// Receiver side of the event channel.
    rx_event: mpsc::UnboundedReceiver<RpcEvent>,

    /// Map from connection ID -> sender side of its reply channel, shared
    /// with the acceptor thread.
    tx_replies: flashmap::ReadHandle<ConnId, mpsc::UnboundedSender<ApiReply>>,

    /// Join handle of the acceptor thread.
    _acceptor_handle: JoinHandle<()>,

    /// Map from connection ID -> servant thread join handles, shared with
    /// the acceptor thread.
    _servant_handles: flashmap::ReadHandle<ConnId, JoinHandle<()>>,
}

// RpcServer public API implementation
impl RpcServer {
    /// Creates the RPC service: binds the listener and spawns the acceptor
    /// thread.
    pub async fn new_and_setup(
        addr: SocketAddr,
    ) -> Result<Self, DsdcError> {
        let listener = tcp_bind_with_retry(addr, 10).await?;

        let (tx_event, rx_event) = mpsc::unbounded_channel();
        let (tx_exit, rx_exit) = mpsc::unbounded_channel();

        let (tx_replies_write, tx_replies_read) =
            flashmap::new::<ConnId, mpsc::UnboundedSender<ApiReply>>();
        let (servant_handles_write, servant_handles_read) =
            flashmap::new::<ConnId, JoinHandle<()>>();

        let acceptor_handle = tokio::spawn(Self::acceptor_thread(
            listener,
            tx_event,
            tx_exit,
            rx_exit,
            tx_replies_write,
            servant_handles_write,
        ));

        Ok(RpcServer {
            rx_event,
            tx_replies: tx_replies_read,
            _acceptor_handle: acceptor_handle,
            _servant_handles: servant_handles_read,
        })
    }

    /// Waits for the next RPC event. Typically used as a branch of the
    /// owning role's `tokio::select!` loop.
    pub async fn recv(&mut self) -> Result<RpcEvent, DsdcError> {
        match self.rx_event.recv().await {
            Some(event) => Ok(event),
            None => logged_err!("event channel has been closed"),
        }
    }

    /// Sends a reply back through the identified connection.
    pub fn send_reply(
        &mut self,
        reply: ApiReply,
        conn: ConnId,
    ) -> Result<(), DsdcError> {
        let tx_replies_guard = self.tx_replies.guard();
        match tx_replies_guard.get(&conn) {
            Some(tx_reply) => {
                tx_reply.send(reply)?;
                Ok(())
            }
            None => {
                logged_err!("connection {} not found among active", conn)
            }
        }
    }

    /// Clones the identified connection's reply sender, for replying from
    /// a detached task (e.g. deferred lock grants or forwarded RPCs).
    pub fn reply_sender(
        &self,
        conn: ConnId,
    ) -> Option<mpsc::UnboundedSender<ApiReply>> {
        self.tx_replies.guard().get(&conn).cloned()
    }
}

// RpcServer acceptor thread implementation
impl RpcServer {
    /// Connection acceptor thread function.
    async fn acceptor_thread(
        listener: TcpListener,
        tx_event: mpsc::UnboundedSender<RpcEvent>,
        tx_exit: mpsc::UnboundedSender<ConnId>,
        mut rx_exit: mpsc::UnboundedReceiver<ConnId>,
        mut tx_replies: flashmap::WriteHandle<
            ConnId,
            mpsc::UnboundedSender<ApiReply>,
        >,
        mut servant_handles: flashmap::WriteHandle<ConnId, JoinHandle<()>>,
    ) {
        pf_debug!("acceptor thread spawned");

        let local_addr = listener.local_addr().unwrap();
        pf_info!("accepting connections on '{}'", local_addr);

        let mut next_conn: ConnId = 0;
        loop {
            tokio::select! {
                // accepts a new connection
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, addr)) => {
                            let id = next_conn;
                            next_conn += 1;
                            pf_debug!("accepted connection {} from '{}'",
                                      id, addr);

                            let (tx_reply, rx_reply) =
                                mpsc::unbounded_channel();
                            let mut tx_replies_guard = tx_replies.guard();
                            tx_replies_guard.insert(id, tx_reply);
                            tx_replies_guard.publish();

                            let servant_handle =
                                tokio::spawn(Self::servant_thread(
                                    id,
                                    addr,
                                    stream,
                                    tx_event.clone(),
                                    rx_reply,
                                    tx_exit.clone(),
                                ));
                            let mut servant_handles_guard =
                                servant_handles.guard();
                            servant_handles_guard.insert(id, servant_handle);
                            servant_handles_guard.publish();
                        }
                        Err(e) => {
                            pf_warn!("error accepting connection: {}", e);
                        }
                    }
                },

                // a servant thread has exitted
                id = rx_exit.recv() => {
                    match id {
                        Some(id) => {
                            let mut tx_replies_guard = tx_replies.guard();
                            tx_replies_guard.remove(id);
                            tx_replies_guard.publish();
                            let mut servant_handles_guard =
                                servant_handles.guard();
                            servant_handles_guard.remove(id);
                            servant_handles_guard.publish();

                            if let Err(e) =
                                tx_event.send(RpcEvent::Closed(id))
                            {
                                pf_error!("error sending to tx_event: {}", e);
                            }
                        }
                        None => break, // channel gets closed
                    }
                }
            }
        }

        // pf_debug!("acceptor thread exitted");
    }
}

// RpcServer servant thread implementation
impl RpcServer {
    /// Reads a request from given TcpStream.
    async fn read_req(
        read_buf: &mut BytesMut,
        conn_read: &mut OwnedReadHalf,
    ) -> Result<ApiRequest, DsdcError> {
        safe_tcp_read(read_buf, conn_read).await
    }

    /// Writes a reply through given TcpStream.
    fn write_reply(
        write_buf: &mut BytesMut,
        write_buf_cursor: &mut usize,
        conn_write: &OwnedWriteHalf,
        reply: Option<&ApiReply>,
    ) -> Result<bool, DsdcError> {
        safe_tcp_write(write_buf, write_buf_cursor, conn_write, reply)
    }

    /// Per-connection request listener and reply sender thread function.
    async fn servant_thread(
        id: ConnId,
        addr: SocketAddr,
        conn: TcpStream,
        tx_event: mpsc::UnboundedSender<RpcEvent>,
        mut rx_reply: mpsc::UnboundedReceiver<ApiReply>,
        tx_exit: mpsc::UnboundedSender<ConnId>,
    ) {
        pf_debug!("servant thread for {} ({}) spawned", id, addr);

        let (mut conn_read, conn_write) = conn.into_split();
        let mut read_buf = BytesMut::new();
        let mut write_buf = BytesMut::new();
        let mut write_buf_cursor = 0;

        let mut retrying = false;
        loop {
            tokio::select! {
                // gets a reply to send back
                reply = rx_reply.recv(), if !retrying => {
                    match reply {
                        Some(reply) => {
                            match Self::write_reply(
                                &mut write_buf,
                                &mut write_buf_cursor,
                                &conn_write,
                                Some(&reply),
                            ) {
                                Ok(true) => {}
                                Ok(false) => {
                                    pf_debug!("should start retrying reply \
                                               send -> {}", id);
                                    retrying = true;
                                }
                                Err(e) => {
                                    pf_error!("error replying -> {}: {}",
                                              id, e);
                                    break;
                                }
                            }
                        }
                        None => break, // channel gets closed
                    }
                },

                // retrying last unsuccessful reply send
                _ = conn_write.writable(), if retrying => {
                    match Self::write_reply(
                        &mut write_buf,
                        &mut write_buf_cursor,
                        &conn_write,
                        None,
                    ) {
                        Ok(true) => {
                            pf_debug!("finished retrying reply send -> {}",
                                      id);
                            retrying = false;
                        }
                        Ok(false) => {
                            pf_debug!("still should retry reply send -> {}",
                                      id);
                        }
                        Err(e) => {
                            pf_error!("error retrying reply -> {}: {}",
                                      id, e);
                            break;
                        }
                    }
                },

                // receives a request
                req = Self::read_req(&mut read_buf, &mut conn_read) => {
                    match req {
                        // peer leaving, acknowledge and break
                        Ok(ApiRequest::Leave) => {
                            if !retrying {
                                if let Err(e) = Self::write_reply(
                                    &mut write_buf,
                                    &mut write_buf_cursor,
                                    &conn_write,
                                    Some(&ApiReply::Leave),
                                ) {
                                    pf_debug!("error ack'ing leave of {}: {}",
                                              id, e);
                                }
                            }
                            pf_debug!("connection {} has left", id);
                            break;
                        }

                        Ok(req) => {
                            if let Err(e) = tx_event.send(
                                RpcEvent::Request(id, req),
                            ) {
                                pf_error!("error sending to tx_event \
                                           for {}: {}", id, e);
                                break;
                            }
                        }

                        Err(_e) => {
                            // probably the peer exitted ungracefully
                            break;
                        }
                    }
                }
            }
        }

        if let Err(e) = tx_exit.send(id) {
            pf_error!("error sending exit of {}: {}", id, e);
        }
        pf_debug!("servant thread for {} ({}) exitted", id, addr);
    }
}

#[cfg(test)]
mod server_tests {
    use super::*;
    use crate::net::conn::PeerConn;
    use crate::protocol::Status;
    use crate::ring::Key;
    use std::sync::Arc;
    use tokio::sync::Barrier;
    use tokio::time::Duration;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn req_reply_roundtrip() -> Result<(), DsdcError> {
        let barrier = Arc::new(Barrier::new(2));
        let barrier2 = barrier.clone();
        tokio::spawn(async move {
            // server-side
            let mut server =
                RpcServer::new_and_setup("127.0.0.1:52710".parse()?).await?;
            barrier2.wait().await;
            loop {
                match server.recv().await? {
                    RpcEvent::Request(
                        conn,
                        ApiRequest::Get { id, key },
                    ) => {
                        assert_eq!(key, Key::of_name("roundtrip"));
                        server.send_reply(
                            ApiReply::Get {
                                id,
                                status: Status::NotFound,
                                value: None,
                                cksum: None,
                            },
                            conn,
                        )?;
                    }
                    RpcEvent::Closed(_) => break,
                    event => panic!("unexpected event {:?}", event),
                }
            }
            Ok::<(), DsdcError>(())
        });
        // client-side
        barrier.wait().await;
        let mut conn = PeerConn::connect("127.0.0.1", 52710).await?;
        let id = conn.next_id();
        let reply = conn
            .rpc(
                ApiRequest::Get {
                    id,
                    key: Key::of_name("roundtrip"),
                },
                Duration::from_secs(5),
            )
            .await?;
        assert_eq!(
            reply,
            ApiReply::Get {
                id,
                status: Status::NotFound,
                value: None,
                cksum: None,
            }
        );
        conn.leave().await?;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn out_of_order_replies() -> Result<(), DsdcError> {
        let barrier = Arc::new(Barrier::new(2));
        let barrier2 = barrier.clone();
        tokio::spawn(async move {
            // server-side: collect two requests, then reply in reverse order
            let mut server =
                RpcServer::new_and_setup("127.0.0.1:52720".parse()?).await?;
            barrier2.wait().await;
            let mut pending = vec![];
            while pending.len() < 2 {
                if let RpcEvent::Request(
                    conn,
                    ApiRequest::Heartbeat { id },
                ) = server.recv().await?
                {
                    pending.push((conn, id));
                }
            }
            for (conn, id) in pending.into_iter().rev() {
                server.send_reply(
                    ApiReply::Heartbeat {
                        id,
                        status: Status::Ok,
                    },
                    conn,
                )?;
            }
            Ok::<(), DsdcError>(())
        });
        // client-side
        barrier.wait().await;
        let mut conn = PeerConn::connect("127.0.0.1", 52720).await?;
        let id1 = conn.next_id();
        conn.send_req(&ApiRequest::Heartbeat { id: id1 }).await?;
        let id2 = conn.next_id();
        conn.send_req(&ApiRequest::Heartbeat { id: id2 }).await?;
        // replies arrive reversed; matching is by echoed request ID
        let first = conn.recv_reply().await?;
        let second = conn.recv_reply().await?;
        assert_eq!(first.id(), Some(id2));
        assert_eq!(second.id(), Some(id1));
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn closed_event_on_drop() -> Result<(), DsdcError> {
        let barrier = Arc::new(Barrier::new(2));
        let barrier2 = barrier.clone();
        let handle = tokio::spawn(async move {
            // server-side
            let mut server =
                RpcServer::new_and_setup("127.0.0.1:52730".parse()?).await?;
            barrier2.wait().await;
            let first = server.recv().await?;
            let conn = match first {
                RpcEvent::Request(conn, ApiRequest::Heartbeat { id }) => {
                    server.send_reply(
                        ApiReply::Heartbeat {
                            id,
                            status: Status::Ok,
                        },
                        conn,
                    )?;
                    conn
                }
                event => panic!("unexpected event {:?}", event),
            };
            // ungraceful client drop still surfaces as a Closed event
            assert_eq!(server.recv().await?, RpcEvent::Closed(conn));
            Ok::<(), DsdcError>(())
        });
        // client-side
        barrier.wait().await;
        {
            let mut conn = PeerConn::connect("127.0.0.1", 52730).await?;
            let id = conn.next_id();
            conn.rpc(
                ApiRequest::Heartbeat { id },
                Duration::from_secs(5),
            )
            .await?;
            // drop the connection without a leave
        }
        handle.await.unwrap()?;
        Ok(())
    }
}
