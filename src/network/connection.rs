//! Per-connection protocol state machine.
//!
//! Each accepted socket gets its own task running [`handle_client`]. The
//! receive loop never blocks on image I/O: decoded frames are handed to the
//! session store, which queues the image bytes for background writing and
//! performs only the small ordering-critical metadata appends inline.

use crate::error::AppResult;
use crate::network::protocol::{classify, ControlCommand, MessageKind, ServerMessage, StatusBody};
use crate::network::server::ServerContext;
use crate::packet::parse_frame_packet;
use crate::unix_now;
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Acknowledgement cadence: one ack per this many decoded frames.
const ACK_EVERY: u64 = 10;

/// Per-connection state. A connection never owns the session; it only tracks
/// its own streaming/paused flags and frame counter.
#[derive(Debug)]
pub struct ClientConnection {
    pub id: String,
    pub connected_at: f64,
    pub is_streaming: bool,
    pub is_paused: bool,
    pub frames_received: u64,
    pub last_frame_time: f64,
}

impl ClientConnection {
    fn new(id: String) -> Self {
        Self {
            id,
            connected_at: unix_now(),
            is_streaming: false,
            is_paused: false,
            frames_received: 0,
            last_frame_time: 0.0,
        }
    }
}

/// Drive one client connection until it disconnects or the server shuts
/// down. Protocol errors are replied to and never close the connection;
/// undecodable frames are logged and dropped without a reply.
pub async fn handle_client(
    stream: TcpStream,
    addr: SocketAddr,
    ctx: Arc<ServerContext>,
    mut shutdown: broadcast::Receiver<()>,
) {
    let uuid = Uuid::new_v4().simple().to_string();
    let client_id = format!("client_{}", &uuid[..8]);
    info!(client = %client_id, %addr, "client connected");

    ctx.register(client_id.clone(), addr).await;

    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let mut conn = ClientConnection::new(client_id);

    let welcome = ServerMessage::welcome(conn.id.clone(), unix_now());
    if let Err(e) = send_message(&mut write_half, &welcome).await {
        warn!(client = %conn.id, "failed to send welcome: {e}");
    }

    let mut line = String::new();
    loop {
        line.clear();
        tokio::select! {
            _ = shutdown.recv() => {
                let notice = ServerMessage::Status(StatusBody {
                    message: Some("Server shutting down".to_string()),
                    ..StatusBody::default()
                });
                let _ = send_message(&mut write_half, &notice).await;
                break;
            }
            read = reader.read_line(&mut line) => match read {
                Ok(0) => {
                    info!(client = %conn.id, "client disconnected");
                    break;
                }
                Ok(n) if n > ctx.settings.max_message_bytes => {
                    let reply = ServerMessage::error(format!(
                        "message exceeds {} bytes",
                        ctx.settings.max_message_bytes
                    ));
                    if let Err(e) = send_message(&mut write_half, &reply).await {
                        warn!(client = %conn.id, "failed to send reply: {e}");
                        break;
                    }
                }
                Ok(_) => {
                    let raw = line.trim();
                    if raw.is_empty() {
                        continue;
                    }
                    process_message(&mut conn, raw, &ctx, &mut write_half).await;
                }
                Err(e) => {
                    warn!(client = %conn.id, "read error: {e}");
                    break;
                }
            }
        }
    }

    ctx.unregister(&conn.id).await;
    let active = ctx.client_count().await;
    info!(
        client = %conn.id,
        frames = conn.frames_received,
        active = active,
        "client removed"
    );
}

async fn process_message(
    conn: &mut ClientConnection,
    raw: &str,
    ctx: &Arc<ServerContext>,
    out: &mut OwnedWriteHalf,
) {
    let received_at = unix_now();

    let message: Value = match serde_json::from_str(raw) {
        Ok(value) => value,
        Err(e) => {
            reply(conn, out, &ServerMessage::error(format!("Invalid JSON: {e}"))).await;
            return;
        }
    };

    match classify(&message) {
        MessageKind::Frame => handle_frame(conn, &message, received_at, ctx, out).await,
        MessageKind::Control => handle_control(conn, &message, ctx, out).await,
        MessageKind::Unknown => {
            debug!(client = %conn.id, "ignoring message with unknown type");
        }
    }
}

async fn handle_frame(
    conn: &mut ClientConnection,
    message: &Value,
    received_at: f64,
    ctx: &Arc<ServerContext>,
    out: &mut OwnedWriteHalf,
) {
    // Paused connections drop data silently: not buffered, not nacked.
    if conn.is_paused {
        return;
    }

    if !conn.is_streaming {
        conn.is_streaming = true;
        if ctx.store.current_session().await.is_none() {
            if let Err(e) = ctx.store.create(None).await {
                warn!(client = %conn.id, "failed to create session: {e}");
                return;
            }
        }
    }

    let packet = match parse_frame_packet(message, received_at) {
        Ok(packet) => packet,
        Err(e) => {
            // Decode errors drop the frame without a reply; only protocol
            // errors are reported back.
            warn!(client = %conn.id, "dropping undecodable frame: {e}");
            return;
        }
    };

    if !ctx.store.append(packet).await {
        debug!(client = %conn.id, "store rejected frame");
    }

    conn.frames_received += 1;
    conn.last_frame_time = received_at;

    if conn.frames_received % ACK_EVERY == 0 {
        let stats = ctx.store.stats().await;
        reply(
            conn,
            out,
            &ServerMessage::frame_ack(conn.frames_received, stats),
        )
        .await;
    }
}

async fn handle_control(
    conn: &mut ClientConnection,
    message: &Value,
    ctx: &Arc<ServerContext>,
    out: &mut OwnedWriteHalf,
) {
    let name = message
        .get("command")
        .and_then(Value::as_str)
        .unwrap_or_default();
    let Some(command) = ControlCommand::parse(name) else {
        reply(
            conn,
            out,
            &ServerMessage::error(format!("Unknown command: {name}")),
        )
        .await;
        return;
    };

    match command {
        ControlCommand::StartSession => {
            let requested = message
                .get("session_id")
                .and_then(Value::as_str)
                .map(str::to_owned);
            match ctx.store.create(requested).await {
                Ok(session_id) => {
                    conn.is_streaming = true;
                    conn.is_paused = false;
                    reply(
                        conn,
                        out,
                        &ServerMessage::Status(StatusBody {
                            command: Some(command.as_str()),
                            session_id: Some(session_id),
                            message: Some("Session started".to_string()),
                            ..StatusBody::default()
                        }),
                    )
                    .await;
                }
                Err(e) => {
                    reply(
                        conn,
                        out,
                        &ServerMessage::error(format!("Failed to start session: {e}")),
                    )
                    .await;
                }
            }
        }
        ControlCommand::EndSession => {
            let stats = ctx.store.end().await;
            conn.is_streaming = false;
            reply(
                conn,
                out,
                &ServerMessage::Status(StatusBody {
                    command: Some(command.as_str()),
                    stats,
                    message: Some("Session ended".to_string()),
                    ..StatusBody::default()
                }),
            )
            .await;
        }
        ControlCommand::Pause => {
            conn.is_paused = true;
            reply(
                conn,
                out,
                &ServerMessage::Status(StatusBody {
                    command: Some(command.as_str()),
                    message: Some("Streaming paused".to_string()),
                    ..StatusBody::default()
                }),
            )
            .await;
        }
        ControlCommand::Resume => {
            conn.is_paused = false;
            reply(
                conn,
                out,
                &ServerMessage::Status(StatusBody {
                    command: Some(command.as_str()),
                    message: Some("Streaming resumed".to_string()),
                    ..StatusBody::default()
                }),
            )
            .await;
        }
        ControlCommand::GetStatus => {
            let stats = ctx.store.stats().await;
            let session = ctx.store.current_session().await;
            let clients = ctx.client_count().await;
            reply(
                conn,
                out,
                &ServerMessage::Status(StatusBody {
                    command: Some(command.as_str()),
                    stats,
                    clients: Some(clients),
                    session: Some(session),
                    ..StatusBody::default()
                }),
            )
            .await;
        }
        ControlCommand::Ping => {
            let client_time = message
                .get("client_time")
                .and_then(Value::as_f64)
                .unwrap_or(0.0);
            reply(conn, out, &ServerMessage::pong(unix_now(), client_time)).await;
        }
    }
}

async fn reply(conn: &ClientConnection, out: &mut OwnedWriteHalf, message: &ServerMessage) {
    if let Err(e) = send_message(out, message).await {
        warn!(client = %conn.id, "failed to send reply: {e}");
    }
}

async fn send_message(out: &mut OwnedWriteHalf, message: &ServerMessage) -> AppResult<()> {
    let mut payload = serde_json::to_vec(message)?;
    payload.push(b'\n');
    out.write_all(&payload).await?;
    Ok(())
}
