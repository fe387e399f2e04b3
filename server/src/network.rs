//! Server network layer: accept loop and per-connection session handlers
//!
//! One task runs per accepted connection for the connection's lifetime. The
//! handler reads with a bounded timeout so it can observe the shutdown flag
//! even on an idle connection, walks every complete frame in each read, and
//! dispatches by message type against the shared [`Registry`].
//!
//! Frames split across two reads are not reassembled: only complete frames
//! inside a single read are processed and the trailing partial bytes are
//! dropped.

use crate::registry::{Endpoint, LeaveError, RegisterError, Registry};
use log::{debug, error, info, warn};
use shared::{Decoded, Message, ReplyCode, MAX_FRAME_BATCH};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration};

/// How long a blocking read waits before re-checking the shutdown flag.
/// Shutdown latency is bounded by this tick, not instant.
pub const READ_TIMEOUT: Duration = Duration::from_secs(1);

/// Handle for requesting a graceful server shutdown from another task.
#[derive(Clone)]
pub struct ShutdownHandle {
    running: Arc<AtomicBool>,
    shutdown: Arc<Notify>,
}

impl ShutdownHandle {
    /// Flags the server and every session handler to stop. Handlers notice
    /// at their next read timeout; the accept loop wakes immediately.
    pub fn shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.shutdown.notify_waiters();
    }
}

/// The routing server: a listener, the shared registry, and the accept loop
/// that spawns one session handler per connection.
pub struct Server {
    listener: TcpListener,
    registry: Arc<Registry>,
    max_clients: usize,
    connections: Arc<AtomicUsize>,
    running: Arc<AtomicBool>,
    shutdown: Arc<Notify>,
}

impl Server {
    /// Binds the listener. `max_clients` caps live connections; further
    /// connection attempts are closed immediately.
    pub async fn bind(addr: &str, max_clients: usize) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        info!("listening on {}", listener.local_addr()?);
        info!("max clients: {}", max_clients);

        Ok(Server {
            listener,
            registry: Arc::new(Registry::new()),
            max_clients,
            connections: Arc::new(AtomicUsize::new(0)),
            running: Arc::new(AtomicBool::new(true)),
            shutdown: Arc::new(Notify::new()),
        })
    }

    /// Address the listener actually bound to (useful with port 0).
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Handle that triggers a graceful shutdown of [`Server::run`].
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            running: self.running.clone(),
            shutdown: self.shutdown.clone(),
        }
    }

    /// Accepts connections until shutdown, then joins every session handler.
    ///
    /// A transport error on one connection never stops the server; only a
    /// failing accept on the listener itself is logged and retried.
    pub async fn run(self) -> io::Result<()> {
        let mut handlers: Vec<JoinHandle<()>> = Vec::new();

        while self.running.load(Ordering::SeqCst) {
            tokio::select! {
                _ = self.shutdown.notified() => break,
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            handlers.retain(|handler| !handler.is_finished());
                            if self.connections.load(Ordering::SeqCst) >= self.max_clients {
                                info!("connection from {} rejected, server full", peer);
                                drop(stream);
                                continue;
                            }
                            info!("connection accepted from {}", peer);
                            handlers.push(self.spawn_session(stream, peer));
                        }
                        Err(e) => error!("accept failed: {}", e),
                    }
                }
            }
        }

        info!(
            "shutting down, waiting for {} session handler(s)",
            handlers.iter().filter(|handler| !handler.is_finished()).count()
        );
        for handler in handlers {
            if let Err(e) = handler.await {
                error!("session handler panicked: {}", e);
            }
        }
        info!("server stopped");
        Ok(())
    }

    fn spawn_session(&self, stream: TcpStream, peer: SocketAddr) -> JoinHandle<()> {
        self.connections.fetch_add(1, Ordering::SeqCst);

        let (reader, writer) = stream.into_split();
        let session = SessionHandler {
            registry: self.registry.clone(),
            endpoint: Endpoint::new(peer, Box::new(writer)),
            running: self.running.clone(),
            peer,
        };
        let connections = self.connections.clone();

        tokio::spawn(async move {
            session.run(reader).await;
            connections.fetch_sub(1, Ordering::SeqCst);
        })
    }
}

/// State of one connection's handler: the shared registry, this
/// connection's endpoint (carrying its write lock), and the global
/// shutdown flag.
struct SessionHandler {
    registry: Arc<Registry>,
    endpoint: Arc<Endpoint>,
    running: Arc<AtomicBool>,
    peer: SocketAddr,
}

impl SessionHandler {
    /// Read loop for one connection. Exits on remote close, on a read
    /// error other than the polling timeout, or when shutdown is flagged;
    /// always unregisters the endpoint on the way out.
    async fn run<R: AsyncRead + Unpin>(self, mut reader: R) {
        let mut buffer = vec![0u8; MAX_FRAME_BATCH];
        debug!("session handler for {} started", self.peer);

        while self.running.load(Ordering::SeqCst) {
            let read = match timeout(READ_TIMEOUT, reader.read(&mut buffer)).await {
                // Timeout is a normal polling tick, not an error.
                Err(_) => continue,
                Ok(Ok(0)) => {
                    info!("{} disconnected", self.peer);
                    break;
                }
                Ok(Ok(n)) => n,
                Ok(Err(e)) => {
                    error!("read from {} failed: {}", self.peer, e);
                    break;
                }
            };

            debug!("received {} bytes from {}", read, self.peer);
            self.process_batch(&buffer[..read]).await;
        }

        self.registry.unregister_endpoint(self.endpoint.id());
        debug!("session handler for {} stopped", self.peer);
    }

    /// Walks every complete frame in one read's worth of bytes.
    async fn process_batch(&self, batch: &[u8]) {
        let mut offset = 0;
        while offset < batch.len() {
            match shared::decode(&batch[offset..]) {
                Ok(Decoded::Frame { message, consumed }) => {
                    let raw = &batch[offset..offset + consumed];
                    self.dispatch(message, raw).await;
                    offset += consumed;
                }
                Ok(Decoded::Incomplete) => {
                    warn!(
                        "dropping {} trailing bytes from {} (partial frame)",
                        batch.len() - offset,
                        self.peer
                    );
                    break;
                }
                Err(e) => {
                    // The declared length cannot be trusted, so there is no
                    // way to find the next frame boundary in this batch.
                    warn!("framing error from {}: {}", self.peer, e);
                    break;
                }
            }
        }
    }

    /// Dispatches one decoded message. Every request produces exactly one
    /// REPLY to the sender; NONE, REPLY, and unrecognized frames produce
    /// none.
    async fn dispatch(&self, message: Message, raw: &[u8]) {
        match message {
            Message::None => {
                debug!("ignoring NONE frame from {}", self.peer);
            }
            Message::Connect { ident } => {
                info!("CONNECT {} from {}", ident, self.peer);
                let code = match self.registry.register_client(ident, self.endpoint.clone()) {
                    Ok(()) => ReplyCode::Ok,
                    Err(RegisterError::DuplicateId) => ReplyCode::DuplicateId,
                };
                self.reply(code).await;
            }
            Message::Disconnect { ident } => {
                info!("DISCONNECT {} from {}", ident, self.peer);
                self.registry.unregister_client(ident);
                self.reply(ReplyCode::Ok).await;
            }
            Message::Send { src, dst, .. } => {
                info!("SEND from {} to {} ({} bytes)", src, dst, raw.len());
                let code = self.route(dst, raw).await;
                self.reply(code).await;
            }
            Message::Join { src, room } => {
                info!("JOIN room {} from {}", room, src);
                self.registry.join_room(room, src);
                self.reply(ReplyCode::Ok).await;
            }
            Message::Leave { src, room } => {
                info!("LEAVE room {} from {}", room, src);
                let code = match self.registry.leave_room(room, src) {
                    Ok(()) => ReplyCode::Ok,
                    Err(LeaveError::RoomNotFound) => ReplyCode::RoomNotFound,
                    Err(LeaveError::NotInRoom) => ReplyCode::NotInRoom,
                };
                self.reply(code).await;
            }
            Message::Reply { code } => {
                debug!("ignoring REPLY ({:?}) from {}", code, self.peer);
            }
            Message::Unknown { msg_type, length } => {
                warn!(
                    "unknown message type {} ({} bytes) from {}",
                    msg_type, length, self.peer
                );
            }
        }
    }

    /// Resolves `dst` as a client identifier first, then as a room, and
    /// forwards the original frame bytes unchanged to each target through
    /// its write lock.
    async fn route(&self, dst: u32, raw: &[u8]) -> ReplyCode {
        if let Some(target) = self.registry.lookup_client(dst) {
            return match target.write_frame(raw).await {
                Ok(()) => ReplyCode::Ok,
                Err(e) => {
                    warn!("forward to client {} failed: {}", dst, e);
                    ReplyCode::SendFailed
                }
            };
        }

        let members = match self.registry.room_members(dst) {
            Some(members) => members,
            None => {
                debug!("destination {} not found", dst);
                return ReplyCode::DstNotFound;
            }
        };

        for member in members {
            // Members without a live registration are skipped, not an error.
            let target = match self.registry.lookup_client(member) {
                Some(target) => target,
                None => continue,
            };
            if let Err(e) = target.write_frame(raw).await {
                warn!("forward to room {} member {} failed: {}", dst, member, e);
                return ReplyCode::SendFailed;
            }
        }
        ReplyCode::Ok
    }

    async fn reply(&self, code: ReplyCode) {
        if let Err(e) = self.endpoint.write_frame(&shared::encode_reply(code)).await {
            error!("reply to {} failed: {}", self.peer, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::{encode_connect, encode_disconnect, encode_join, encode_leave, encode_send};
    use tokio::io::{duplex, AsyncWriteExt, DuplexStream};
    use tokio::time::sleep;

    fn test_addr() -> SocketAddr {
        "127.0.0.1:8888".parse().unwrap()
    }

    /// Wires a session handler to an in-memory stream. The returned duplex
    /// end plays the client: write requests into it, read frames out of it.
    fn spawn_session(registry: Arc<Registry>) -> (DuplexStream, Arc<Endpoint>) {
        let (client_side, server_side) = duplex(MAX_FRAME_BATCH);
        let (read_half, write_half) = tokio::io::split(server_side);
        let endpoint = Endpoint::new(test_addr(), Box::new(write_half));
        let session = SessionHandler {
            registry,
            endpoint: endpoint.clone(),
            running: Arc::new(AtomicBool::new(true)),
            peer: test_addr(),
        };
        tokio::spawn(session.run(read_half));
        (client_side, endpoint)
    }

    async fn read_message(stream: &mut DuplexStream) -> Message {
        let mut buf = vec![0u8; MAX_FRAME_BATCH];
        let n = stream.read(&mut buf).await.unwrap();
        match shared::decode(&buf[..n]).unwrap() {
            Decoded::Frame { message, .. } => message,
            Decoded::Incomplete => panic!("expected a complete frame"),
        }
    }

    async fn read_reply(stream: &mut DuplexStream) -> ReplyCode {
        match read_message(stream).await {
            Message::Reply { code } => code,
            other => panic!("expected REPLY, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_connect_then_duplicate() {
        let registry = Arc::new(Registry::new());
        let (mut first, _) = spawn_session(registry.clone());
        let (mut second, _) = spawn_session(registry.clone());

        first.write_all(&encode_connect(5)).await.unwrap();
        assert_eq!(read_reply(&mut first).await, ReplyCode::Ok);

        second.write_all(&encode_connect(5)).await.unwrap();
        assert_eq!(read_reply(&mut second).await, ReplyCode::DuplicateId);

        assert_eq!(registry.client_count(), 1);
    }

    #[tokio::test]
    async fn test_send_forwards_original_frame_bytes() {
        let registry = Arc::new(Registry::new());
        let (mut sender, _) = spawn_session(registry.clone());
        let (mut receiver, _) = spawn_session(registry.clone());

        receiver.write_all(&encode_connect(2)).await.unwrap();
        assert_eq!(read_reply(&mut receiver).await, ReplyCode::Ok);

        let frame = encode_send(1, 2, 0, b"hi");
        sender.write_all(&frame).await.unwrap();
        assert_eq!(read_reply(&mut sender).await, ReplyCode::Ok);

        let mut buf = vec![0u8; MAX_FRAME_BATCH];
        let n = receiver.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], frame.as_slice(), "forwarded bytes must be unchanged");
    }

    #[tokio::test]
    async fn test_send_to_unknown_destination() {
        let registry = Arc::new(Registry::new());
        let (mut sender, _) = spawn_session(registry);

        sender.write_all(&encode_send(1, 999, 0, b"x")).await.unwrap();
        assert_eq!(read_reply(&mut sender).await, ReplyCode::DstNotFound);
    }

    #[tokio::test]
    async fn test_disconnect_then_send_fails() {
        let registry = Arc::new(Registry::new());
        let (mut peer, _) = spawn_session(registry.clone());
        let (mut sender, _) = spawn_session(registry.clone());

        peer.write_all(&encode_connect(1)).await.unwrap();
        assert_eq!(read_reply(&mut peer).await, ReplyCode::Ok);

        peer.write_all(&encode_disconnect(1)).await.unwrap();
        assert_eq!(read_reply(&mut peer).await, ReplyCode::Ok);

        sender.write_all(&encode_send(9, 1, 0, b"x")).await.unwrap();
        assert_eq!(read_reply(&mut sender).await, ReplyCode::DstNotFound);
    }

    #[tokio::test]
    async fn test_room_broadcast_skips_stale_members() {
        let registry = Arc::new(Registry::new());
        let (mut member, _) = spawn_session(registry.clone());
        let (mut sender, _) = spawn_session(registry.clone());

        member.write_all(&encode_connect(1)).await.unwrap();
        assert_eq!(read_reply(&mut member).await, ReplyCode::Ok);
        member.write_all(&encode_join(1, 50)).await.unwrap();
        assert_eq!(read_reply(&mut member).await, ReplyCode::Ok);

        // A member with no live registration is skipped at delivery time.
        registry.join_room(50, 99);

        let frame = encode_send(7, 50, 0, b"room");
        sender.write_all(&frame).await.unwrap();
        assert_eq!(read_reply(&mut sender).await, ReplyCode::Ok);

        let mut buf = vec![0u8; MAX_FRAME_BATCH];
        let n = member.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], frame.as_slice());
    }

    #[tokio::test]
    async fn test_leave_semantics() {
        let registry = Arc::new(Registry::new());
        let (mut client, _) = spawn_session(registry);

        client.write_all(&encode_leave(1, 50)).await.unwrap();
        assert_eq!(read_reply(&mut client).await, ReplyCode::RoomNotFound);

        client.write_all(&encode_join(1, 50)).await.unwrap();
        assert_eq!(read_reply(&mut client).await, ReplyCode::Ok);

        client.write_all(&encode_leave(2, 50)).await.unwrap();
        assert_eq!(read_reply(&mut client).await, ReplyCode::NotInRoom);

        client.write_all(&encode_leave(1, 50)).await.unwrap();
        assert_eq!(read_reply(&mut client).await, ReplyCode::Ok);
    }

    #[tokio::test]
    async fn test_batched_requests_get_batched_replies() {
        let registry = Arc::new(Registry::new());
        let (mut client, _) = spawn_session(registry);

        let mut batch = Vec::new();
        batch.extend_from_slice(&encode_connect(1));
        batch.extend_from_slice(&encode_join(1, 50));
        batch.extend_from_slice(&encode_leave(1, 50));
        client.write_all(&batch).await.unwrap();

        let mut collected = Vec::new();
        let mut buf = vec![0u8; MAX_FRAME_BATCH];
        while collected.len() < 3 * shared::REPLY_FRAME_LEN {
            let n = client.read(&mut buf).await.unwrap();
            collected.extend_from_slice(&buf[..n]);
        }

        let mut offset = 0;
        let mut codes = Vec::new();
        while offset < collected.len() {
            match shared::decode(&collected[offset..]).unwrap() {
                Decoded::Frame {
                    message: Message::Reply { code },
                    consumed,
                } => {
                    codes.push(code);
                    offset += consumed;
                }
                other => panic!("expected REPLY, got {:?}", other),
            }
        }
        assert_eq!(codes, vec![ReplyCode::Ok, ReplyCode::Ok, ReplyCode::Ok]);
    }

    #[tokio::test]
    async fn test_partial_frame_is_dropped() {
        let registry = Arc::new(Registry::new());
        let (mut client, _) = spawn_session(registry.clone());

        // Only the first half of a SEND; the handler reads it, finds no
        // complete frame, and drops the bytes.
        let frame = encode_send(1, 2, 0, b"split across reads");
        client.write_all(&frame[..10]).await.unwrap();
        sleep(Duration::from_millis(100)).await;

        // The next read starts clean, so a complete request still works.
        client.write_all(&encode_connect(3)).await.unwrap();
        assert_eq!(read_reply(&mut client).await, ReplyCode::Ok);
        assert!(registry.lookup_client(3).is_some());
    }

    #[tokio::test]
    async fn test_unknown_type_gets_no_reply() {
        let registry = Arc::new(Registry::new());
        let (mut client, _) = spawn_session(registry);

        // Unassigned type 4, header-only frame, then a CONNECT. The only
        // reply on the wire must be the CONNECT's.
        let mut batch = Vec::new();
        batch.extend_from_slice(&4u32.to_le_bytes());
        batch.extend_from_slice(&8u32.to_le_bytes());
        batch.extend_from_slice(&encode_connect(5));
        client.write_all(&batch).await.unwrap();

        assert_eq!(read_reply(&mut client).await, ReplyCode::Ok);
    }

    #[tokio::test]
    async fn test_shutdown_flag_stops_handler() {
        let registry = Arc::new(Registry::new());
        let (client_side, server_side) = duplex(MAX_FRAME_BATCH);
        let (read_half, write_half) = tokio::io::split(server_side);
        let endpoint = Endpoint::new(test_addr(), Box::new(write_half));
        let running = Arc::new(AtomicBool::new(true));
        let session = SessionHandler {
            registry: registry.clone(),
            endpoint: endpoint.clone(),
            running: running.clone(),
            peer: test_addr(),
        };
        let handle = tokio::spawn(session.run(read_half));

        running.store(false, Ordering::SeqCst);
        tokio::time::timeout(Duration::from_secs(3), handle)
            .await
            .expect("handler must stop within a timeout tick")
            .unwrap();
        drop(client_side);
    }
}
