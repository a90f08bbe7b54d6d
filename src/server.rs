//! Transport frontend: HTTP health check plus the WebSocket upgrade path.
//!
//! Per connection the handshake moves through
//! `Received → Authorizing → Admitted | Rejected`:
//!
//! ```text
//! TCP accept ──► peek request head
//!     │
//!     ├── plain HTTP ──────────────► 200 "okay", close
//!     │
//!     └── upgrade request
//!            │  authorize (pre-handshake)
//!            ├── rejected ─────────► raw 401 JSON + CORS, close
//!            └── admitted
//!                   │  WebSocket handshake
//!                   │  authorize again (post-handshake re-check)
//!                   ├── rejected ──► close frame 4000 "authentication failed"
//!                   └── admitted ──► sync loop on the room's doc
//! ```
//!
//! Authorization runs *before* the handshake so a rejected caller never
//! sees a word of sync traffic and no handshake work is wasted on it. The
//! post-handshake re-check is the same idempotent operation; it only
//! exists for the narrow window in which room state could change between
//! the two calls.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;

use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{ReadTxn, StateVector, Transact, Update};

use crate::auth::{AuthError, Authorizer};
use crate::config::ServerConfig;
use crate::protocol::{MessageType, SyncMessage};
use crate::registry::{ConnectionGuard, Room};
use crate::shutdown::ShutdownSignal;

/// Room name when the request path has no usable segment.
const DEFAULT_ROOM: &str = "default";

/// Maximum bytes of request head we are willing to buffer.
const MAX_HEAD_BYTES: usize = 8 * 1024;

/// Application close code for a post-handshake authorization failure,
/// distinct from any protocol error so clients can tell auth from desync.
const CLOSE_AUTH_FAILED: u16 = 4000;

const HEALTH_RESPONSE: &str = "HTTP/1.1 200 OK\r\n\
Content-Type: text/plain\r\n\
Content-Length: 4\r\n\
Connection: close\r\n\
\r\n\
okay";

const UNAUTHORIZED_BODY: &str = r#"{"error": "Unauthorized: Invalid password for room"}"#;

/// The gateway server: accepts TCP, answers health checks, admits
/// WebSocket connections into rooms.
pub struct RelayServer {
    config: ServerConfig,
    listener: TcpListener,
    authorizer: Arc<Authorizer>,
}

impl RelayServer {
    /// Bind the configured address.
    ///
    /// A bind failure is a startup fault: the caller must exit rather than
    /// serve requests it cannot authenticate.
    pub async fn bind(
        config: ServerConfig,
        authorizer: Arc<Authorizer>,
    ) -> Result<Self, std::io::Error> {
        let listener = TcpListener::bind(config.bind_addr()).await?;
        Ok(Self {
            config,
            listener,
            authorizer,
        })
    }

    /// The address actually bound (useful when the port was 0).
    pub fn local_addr(&self) -> Result<SocketAddr, std::io::Error> {
        self.listener.local_addr()
    }

    /// Accept connections until shutdown triggers.
    ///
    /// On shutdown the listener stops accepting, then all connection tasks
    /// are awaited — they observe the same signal and close their sockets —
    /// so by the time this returns no task can queue further appends.
    pub async fn run(self, mut shutdown: ShutdownSignal) {
        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    let (stream, addr) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            log::warn!("Accept failed: {e}");
                            continue;
                        }
                    };
                    log::debug!("New TCP connection from {addr}");

                    let authorizer = self.authorizer.clone();
                    let signal = shutdown.clone();
                    connections.spawn(async move {
                        if let Err(e) = handle_connection(stream, addr, authorizer, signal).await {
                            log::debug!("Connection from {addr} ended with error: {e}");
                        }
                    });
                }
                _ = shutdown.recv() => {
                    log::info!("Shutdown: no longer accepting connections");
                    break;
                }
            }
        }

        // Listener is dropped with self after the loop; wait for open
        // connections to observe the signal and finish.
        drop(self.listener);
        while connections.join_next().await.is_some() {}
        log::info!("All connections closed");
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }
}

/// Parsed request line plus the one header we care about.
#[derive(Debug, PartialEq)]
struct RequestHead {
    path: String,
    query: Option<String>,
    is_upgrade: bool,
}

impl RequestHead {
    /// Parse the head from raw bytes. Returns None for anything that does
    /// not look like an HTTP request.
    fn parse(head: &[u8]) -> Option<RequestHead> {
        let text = std::str::from_utf8(head).ok()?;
        let mut lines = text.split("\r\n");

        let request_line = lines.next()?;
        let mut parts = request_line.split_whitespace();
        let _method = parts.next()?;
        let target = parts.next()?;
        parts.next()?; // HTTP version

        let (path, query) = match target.split_once('?') {
            Some((p, q)) => (p.to_string(), Some(q.to_string())),
            None => (target.to_string(), None),
        };

        let mut is_upgrade = false;
        for line in lines {
            if line.is_empty() {
                break;
            }
            if let Some((name, value)) = line.split_once(':') {
                if name.trim().eq_ignore_ascii_case("upgrade")
                    && value.trim().eq_ignore_ascii_case("websocket")
                {
                    is_upgrade = true;
                }
            }
        }

        Some(RequestHead {
            path,
            query,
            is_upgrade,
        })
    }

    /// Room name: the literal final path segment; a trailing slash or bare
    /// `/` means the default room, not the segment before the slash.
    fn room_name(&self) -> &str {
        match self.path.rsplit('/').next() {
            Some(segment) if !segment.is_empty() => segment,
            _ => DEFAULT_ROOM,
        }
    }

    /// `password` query parameter, percent-decoded; missing or bare means
    /// the empty string.
    fn password(&self) -> String {
        let Some(query) = &self.query else {
            return String::new();
        };
        for pair in query.split('&') {
            match pair.split_once('=') {
                Some(("password", value)) => return decode_query_value(value),
                None if pair == "password" => return String::new(),
                _ => {}
            }
        }
        String::new()
    }
}

/// Decode a query-string value: `+` is a space, `%XX` is a byte. A
/// malformed escape passes through literally rather than failing the
/// request.
fn decode_query_value(raw: &str) -> String {
    fn hex(b: u8) -> Option<u8> {
        match b {
            b'0'..=b'9' => Some(b - b'0'),
            b'a'..=b'f' => Some(b - b'a' + 10),
            b'A'..=b'F' => Some(b - b'A' + 10),
            _ => None,
        }
    }

    let bytes = raw.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b'%' => {
                let pair = bytes
                    .get(i + 1)
                    .copied()
                    .and_then(hex)
                    .zip(bytes.get(i + 2).copied().and_then(hex));
                match pair {
                    Some((hi, lo)) => {
                        out.push(hi << 4 | lo);
                        i += 3;
                    }
                    None => {
                        out.push(b'%');
                        i += 1;
                    }
                }
            }
            other => {
                out.push(other);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Peek the request head without consuming it, so the WebSocket handshake
/// can still read the full request afterwards.
async fn peek_request_head(stream: &TcpStream) -> Result<Vec<u8>, std::io::Error> {
    let mut buf = vec![0u8; MAX_HEAD_BYTES];
    // The head almost always arrives in the first segment; poll briefly for
    // stragglers rather than consuming bytes the handshake will need.
    for _ in 0..200 {
        let n = stream.peek(&mut buf).await?;
        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "connection closed before request head",
            ));
        }
        if buf[..n].windows(4).any(|w| w == b"\r\n\r\n") || n == buf.len() {
            return Ok(buf[..n].to_vec());
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    Err(std::io::Error::new(
        std::io::ErrorKind::TimedOut,
        "request head incomplete",
    ))
}

/// Serve one TCP connection end to end.
async fn handle_connection(
    mut stream: TcpStream,
    addr: SocketAddr,
    authorizer: Arc<Authorizer>,
    shutdown: ShutdownSignal,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let head_bytes = peek_request_head(&stream).await?;
    let Some(head) = RequestHead::parse(&head_bytes) else {
        log::debug!("Malformed request from {addr}");
        return Ok(());
    };

    // Plain HTTP: health check, regardless of path.
    if !head.is_upgrade {
        stream.write_all(HEALTH_RESPONSE.as_bytes()).await?;
        stream.shutdown().await?;
        return Ok(());
    }

    let room_name = head.room_name().to_string();
    let password = head.password();

    // Pre-handshake authorization: a rejected caller never gets a
    // completed handshake, let alone sync traffic.
    let room = match authorizer.authorize(&room_name, &password, addr).await {
        Ok(room) => room,
        Err(e) => {
            if let AuthError::StoreUnavailable { .. } = e {
                log::error!("Failing closed for {addr} on room {room_name}: {e}");
            }
            write_unauthorized(&mut stream).await?;
            return Ok(());
        }
    };

    let mut ws_stream = tokio_tungstenite::accept_async(stream).await?;
    log::info!("Connection established for room {room_name}");

    // Post-handshake re-check of the same operation (TOCTOU guard).
    if let Err(e) = authorizer.authorize(&room_name, &password, addr).await {
        log::info!("Post-handshake rejection for {addr} on room {room_name}: {e}");
        let frame = CloseFrame {
            code: CloseCode::Library(CLOSE_AUTH_FAILED),
            reason: "authentication failed".into(),
        };
        ws_stream.send(Message::Close(Some(frame))).await?;
        return Ok(());
    }

    sync_loop(ws_stream, addr, room, shutdown).await
}

/// Raw 401 with JSON body and permissive CORS headers, no handshake.
async fn write_unauthorized(stream: &mut TcpStream) -> Result<(), std::io::Error> {
    let response = format!(
        "HTTP/1.1 401 Unauthorized\r\n\
         Content-Type: application/json\r\n\
         Access-Control-Allow-Origin: *\r\n\
         Access-Control-Allow-Credentials: true\r\n\
         Access-Control-Allow-Headers: Content-Type, Authorization\r\n\
         Access-Control-Allow-Methods: GET, POST, PUT, DELETE, OPTIONS\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\
         \r\n\
         {}",
        UNAUTHORIZED_BODY.len(),
        UNAUTHORIZED_BODY
    );
    stream.write_all(response.as_bytes()).await?;
    stream.shutdown().await
}

/// Relay sync messages between one admitted socket and its room.
async fn sync_loop(
    ws_stream: tokio_tungstenite::WebSocketStream<TcpStream>,
    addr: SocketAddr,
    room: Arc<Room>,
    mut shutdown: ShutdownSignal,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    // Subscribe before counting in, so no broadcast frame is missed. The
    // guard counts the connection out on every exit path, the `?` returns
    // on a failed send included.
    let mut broadcast_rx = room.broadcast().subscribe();
    let (_guard, open) = ConnectionGuard::open(&room, addr);
    log::info!(
        "Peer {addr} joined room {} ({open} open connections)",
        room.name()
    );

    let mut peer_id: Option<Uuid> = None;

    loop {
        tokio::select! {
            msg = ws_receiver.next() => {
                match msg {
                    Some(Ok(Message::Binary(data))) => {
                        let bytes: Vec<u8> = data.into();
                        let sync_msg = match SyncMessage::decode(&bytes) {
                            Ok(m) => m,
                            Err(e) => {
                                log::warn!("Failed to decode frame from {addr}: {e}");
                                continue;
                            }
                        };
                        if peer_id.is_none() {
                            peer_id = Some(sync_msg.peer_id);
                        }

                        match sync_msg.msg_type {
                            MessageType::SyncStep1 => {
                                // Client sent its state vector; answer with the diff
                                let diff = {
                                    let txn = room.doc().transact();
                                    match StateVector::decode_v1(&sync_msg.payload) {
                                        Ok(remote_sv) => Some(txn.encode_diff_v1(&remote_sv)),
                                        Err(e) => {
                                            log::warn!(
                                                "Bad state vector from {addr} for room {}: {e}",
                                                room.name()
                                            );
                                            None
                                        }
                                    }
                                };
                                if let Some(diff) = diff {
                                    let response =
                                        SyncMessage::sync_step2(Uuid::nil(), room.name(), diff);
                                    ws_sender
                                        .send(Message::Binary(response.encode()?.into()))
                                        .await?;
                                }
                            }

                            MessageType::Update => {
                                // Apply to the authoritative doc first; the
                                // persistence subscription queues the append
                                // from inside the commit.
                                match Update::decode_v1(&sync_msg.payload) {
                                    Ok(update) => {
                                        let mut txn = room.doc().transact_mut();
                                        if let Err(e) = txn.apply_update(update) {
                                            log::warn!(
                                                "Rejected update from {addr} for room {}: {e}",
                                                room.name()
                                            );
                                            continue;
                                        }
                                    }
                                    Err(e) => {
                                        log::warn!(
                                            "Undecodable update from {addr} for room {}: {e}",
                                            room.name()
                                        );
                                        continue;
                                    }
                                }
                                // Fan out to the rest of the room
                                let _ = room.broadcast().broadcast(&sync_msg);
                            }

                            MessageType::Ping => {
                                let pong =
                                    SyncMessage::pong(sync_msg.peer_id, room.name());
                                ws_sender
                                    .send(Message::Binary(pong.encode()?.into()))
                                    .await?;
                            }

                            MessageType::SyncStep2 | MessageType::Pong => {
                                log::debug!(
                                    "Ignoring server-bound {:?} from {addr}",
                                    sync_msg.msg_type
                                );
                            }
                        }
                    }

                    Some(Ok(Message::Close(_))) | None => {
                        break;
                    }

                    Some(Ok(Message::Ping(data))) => {
                        ws_sender.send(Message::Pong(data)).await?;
                    }

                    Some(Err(e)) => {
                        log::debug!("WebSocket error from {addr}: {e}");
                        break;
                    }

                    _ => {}
                }
            }

            frame = broadcast_rx.recv() => {
                match frame {
                    Ok(data) => {
                        // Don't echo the sender's own updates back
                        if let Ok(msg) = SyncMessage::decode(&data) {
                            if Some(msg.peer_id) == peer_id {
                                continue;
                            }
                        }
                        ws_sender.send(Message::Binary(data.to_vec().into())).await?;
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        log::warn!(
                            "Peer {addr} in room {} lagged by {n} frames",
                            room.name()
                        );
                    }
                    Err(_) => break,
                }
            }

            _ = shutdown.recv() => {
                log::debug!("Closing {addr} for shutdown");
                let _ = ws_sender.send(Message::Close(None)).await;
                break;
            }
        }
    }

    Ok(())
}
