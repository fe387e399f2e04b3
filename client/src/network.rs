//! Client session: interactive command loop and background receiver
//!
//! Two tasks share one connection. The foreground command loop parses user
//! input, writes one request frame, and then blocks until the receiver has
//! seen the matching REPLY: the protocol carries no request ids, so exactly
//! one request may be outstanding at a time. The background receiver reads
//! with a bounded timeout (to notice the stop flag promptly), decodes every
//! complete frame per read, displays traffic, and wakes the command loop.

use crate::commands::{self, Command};
use log::{debug, error, info, warn};
use shared::{Decoded, Message, ReplyCode, MAX_FRAME_BATCH};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration};

/// How long a blocking read waits before re-checking the stop flag.
pub const READ_TIMEOUT: Duration = Duration::from_secs(1);

/// One client connection: the write half, the identifier used as `src` in
/// outgoing frames, and the rendezvous state shared with the receiver.
pub struct Client {
    ident: u32,
    writer: tokio::net::tcp::OwnedWriteHalf,
    running: Arc<AtomicBool>,
    awaiting_reply: Arc<AtomicBool>,
    reply_signal: Arc<Notify>,
    receiver: JoinHandle<()>,
}

impl Client {
    /// Connects to the server and starts the background receiver.
    pub async fn connect(addr: &str, ident: u32) -> io::Result<Self> {
        info!("connecting to {}...", addr);
        let stream = TcpStream::connect(addr).await?;
        info!("connected as ident {}", ident);

        let (reader, writer) = stream.into_split();
        let running = Arc::new(AtomicBool::new(true));
        let awaiting_reply = Arc::new(AtomicBool::new(false));
        let reply_signal = Arc::new(Notify::new());

        let receiver = tokio::spawn(receiver_loop(
            reader,
            ident,
            running.clone(),
            awaiting_reply.clone(),
            reply_signal.clone(),
        ));

        Ok(Client {
            ident,
            writer,
            running,
            awaiting_reply,
            reply_signal,
            receiver,
        })
    }

    /// Writes one request frame, then blocks until the receiver observes
    /// the matching REPLY or the connection is lost.
    pub async fn request(&mut self, frame: &[u8]) -> io::Result<()> {
        self.awaiting_reply.store(true, Ordering::SeqCst);
        if let Err(e) = self.writer.write_all(frame).await {
            self.awaiting_reply.store(false, Ordering::SeqCst);
            return Err(e);
        }
        self.wait_for_reply().await;
        Ok(())
    }

    /// Parks the command loop until the receiver clears the awaiting flag.
    /// Re-checks on a timeout tick so a dead receiver cannot strand us.
    async fn wait_for_reply(&self) {
        while self.awaiting_reply.load(Ordering::SeqCst) {
            if !self.running.load(Ordering::SeqCst) {
                warn!("connection lost while waiting for a reply");
                return;
            }
            let _ = timeout(READ_TIMEOUT, self.reply_signal.notified()).await;
        }
    }

    /// Interactive loop over stdin until `exit`, end of input, or
    /// connection loss.
    pub async fn run(mut self) -> io::Result<()> {
        info!("commands: send <dst> <text> | join <room> | leave <room> | connect | disconnect | exit");

        let mut lines = BufReader::new(tokio::io::stdin()).lines();

        while self.running.load(Ordering::SeqCst) {
            let line = match lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(e) => {
                    error!("reading input failed: {}", e);
                    break;
                }
            };

            let command = match commands::parse(&line) {
                Ok(Some(command)) => command,
                Ok(None) => continue,
                Err(e) => {
                    warn!("{}", e);
                    continue;
                }
            };

            let frame = match command.to_frame(self.ident) {
                Some(frame) => frame,
                // `exit` is local: stop the loop instead of sending.
                None => break,
            };

            if let Err(e) = self.request(&frame).await {
                error!("send to server failed: {}", e);
                break;
            }

            if command == Command::Disconnect {
                info!("identifier unregistered; `connect` re-registers it");
            }
        }

        self.close().await;
        Ok(())
    }

    /// Signals the receiver to stop, waits for it, and closes the
    /// transport.
    pub async fn close(mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Err(e) = (&mut self.receiver).await {
            error!("receiver task panicked: {}", e);
        }
        let _ = self.writer.shutdown().await;
        info!("disconnected from server");
    }
}

/// Background receiver loop. Shares the single-read framing policy with
/// the server: only complete frames within one read are processed and
/// trailing partial bytes are dropped.
async fn receiver_loop<R: AsyncRead + Unpin>(
    mut reader: R,
    ident: u32,
    running: Arc<AtomicBool>,
    awaiting_reply: Arc<AtomicBool>,
    reply_signal: Arc<Notify>,
) {
    let mut buffer = vec![0u8; MAX_FRAME_BATCH];

    while running.load(Ordering::SeqCst) {
        let read = match timeout(READ_TIMEOUT, reader.read(&mut buffer)).await {
            // Timeout is a normal polling tick, not an error.
            Err(_) => continue,
            Ok(Ok(0)) => {
                info!("server disconnected");
                break;
            }
            Ok(Ok(n)) => n,
            Ok(Err(e)) => {
                error!("recv failed: {}", e);
                break;
            }
        };

        debug!("received {} bytes from server", read);

        let mut offset = 0;
        while offset < read {
            match shared::decode(&buffer[offset..read]) {
                Ok(Decoded::Frame { message, consumed }) => {
                    handle_message(&message, ident, &awaiting_reply, &reply_signal);
                    offset += consumed;
                }
                Ok(Decoded::Incomplete) => {
                    warn!("dropping {} trailing bytes (partial frame)", read - offset);
                    break;
                }
                Err(e) => {
                    warn!("framing error from server: {}", e);
                    break;
                }
            }
        }
    }

    // Unblock a command loop still parked on a reply that will never come.
    running.store(false, Ordering::SeqCst);
    awaiting_reply.store(false, Ordering::SeqCst);
    reply_signal.notify_waiters();
}

/// Displays one received message and performs the reply rendezvous.
fn handle_message(
    message: &Message,
    ident: u32,
    awaiting_reply: &AtomicBool,
    reply_signal: &Notify,
) {
    match message {
        Message::None => {}
        Message::Connect { ident } => info!("received CONNECT for {}", ident),
        Message::Disconnect { ident } => info!("received DISCONNECT for {}", ident),
        Message::Send {
            src, dst, payload, ..
        } => {
            if *src == ident && *dst == ident {
                // Own message routed back to ourselves; not shown.
                debug!("suppressed echo of self-addressed message");
            } else {
                info!("message from {}: {}", src, String::from_utf8_lossy(payload));
            }
        }
        Message::Join { src, room } => info!("received JOIN of {} to room {}", src, room),
        Message::Leave { src, room } => info!("received LEAVE of {} from room {}", src, room),
        Message::Reply { code } => {
            display_reply(*code);
            if awaiting_reply.swap(false, Ordering::SeqCst) {
                // notify_one stores a permit, so a reply that lands before
                // the command loop parks still wakes it.
                reply_signal.notify_one();
            }
        }
        Message::Unknown { msg_type, .. } => {
            warn!("received unknown message type {}", msg_type)
        }
    }
}

fn display_reply(code: ReplyCode) {
    match code {
        ReplyCode::Ok => info!("server replied: ok"),
        ReplyCode::None => info!("server replied: (none)"),
        other => warn!("server replied: {:?}", other),
    }
}
