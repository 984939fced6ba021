//! Per-connection driver between a client socket and the buffer.
//!
//! Each accepted connection gets one handler task running a line-oriented
//! dialogue: log records are validated, parsed, enriched and enqueued;
//! `CMD:` lines route to a small control sub-protocol. The enqueue path is
//! non-blocking, so a saturated buffer turns into an error reply instead of
//! a stalled client.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::buffer::CircularBuffer;
use crate::parser;

const READ_TIMEOUT: Duration = Duration::from_secs(30);
const HELP_REPLY: &str = "OK:COMMANDS:PING,STATS,BUFFER_STATS,DISCONNECT,HELP";

pub struct ConnectionHandler {
    stream: TcpStream,
    peer: SocketAddr,
    client_id: String,
    buffer: Arc<CircularBuffer>,
}

impl ConnectionHandler {
    #[must_use]
    pub fn new(stream: TcpStream, peer: SocketAddr, buffer: Arc<CircularBuffer>) -> Self {
        let client_id = format!(
            "{}:{}-{}",
            peer.ip(),
            peer.port(),
            Utc::now().timestamp_millis()
        );
        ConnectionHandler {
            stream,
            peer,
            client_id,
            buffer,
        }
    }

    #[must_use]
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Runs the read loop until the client disconnects, the read times out,
    /// or the server shuts down. The socket is released on every exit path.
    pub async fn run(self, cancel: CancellationToken) {
        let ConnectionHandler {
            stream,
            peer,
            client_id,
            buffer,
        } = self;

        if let Err(err) = enable_keepalive(&stream) {
            debug!("could not enable keep-alive for {client_id}: {err}");
        }

        info!("client connected: {client_id}");
        let connected_at = Instant::now();
        let mut messages_received: u64 = 0;
        let mut messages_rejected: u64 = 0;

        let (read_half, mut write_half) = stream.into_split();
        let mut lines = BufReader::new(read_half).lines();

        if write_line(&mut write_half, &format!("OK:CONNECTED:{client_id}"))
            .await
            .is_err()
        {
            info!("client disconnected: {client_id} (greeting failed)");
            return;
        }

        let peer_ip = peer.ip().to_string();
        let disconnect_reason = loop {
            let next = tokio::select! {
                read = tokio::time::timeout(READ_TIMEOUT, lines.next_line()) => read,
                () = cancel.cancelled() => break "server shutdown",
            };
            let line = match next {
                Err(_) => break "read timeout",
                Ok(Ok(Some(line))) => line,
                Ok(Ok(None)) => break "connection closed by client",
                Ok(Err(err)) => {
                    warn!("read error from {client_id}: {err}");
                    break "read error";
                }
            };

            let (reply, disconnect) = handle_line(
                &line,
                &buffer,
                &peer_ip,
                &client_id,
                connected_at,
                &mut messages_received,
                &mut messages_rejected,
            );
            if write_line(&mut write_half, &reply).await.is_err() {
                break "write error";
            }
            if disconnect {
                break "client requested disconnect";
            }
        };

        info!(
            "client disconnected: {client_id} ({disconnect_reason}) - uptime: {}s, messages: {messages_received}, rejected: {messages_rejected}",
            connected_at.elapsed().as_secs()
        );
    }
}

/// Dispatches one received line and produces the reply to send back, plus
/// whether the connection should close afterwards.
fn handle_line(
    line: &str,
    buffer: &CircularBuffer,
    peer_ip: &str,
    client_id: &str,
    connected_at: Instant,
    messages_received: &mut u64,
    messages_rejected: &mut u64,
) -> (String, bool) {
    if line.trim().is_empty() {
        return ("ERROR:EMPTY_MESSAGE".to_string(), false);
    }

    *messages_received += 1;

    if let Some(command) = line.strip_prefix("CMD:") {
        return handle_command(
            command,
            buffer,
            connected_at,
            *messages_received,
            *messages_rejected,
        );
    }

    if !parser::is_valid_line(line) {
        *messages_rejected += 1;
        return ("ERROR:INVALID_MESSAGE_FORMAT".to_string(), false);
    }

    let mut record = match parser::parse_line(line) {
        Ok(record) => record,
        Err(_) => {
            *messages_rejected += 1;
            return ("ERROR:PARSE_FAILED".to_string(), false);
        }
    };
    parser::enrich_for_client(&mut record, peer_ip, client_id);

    let id = record.id;
    if buffer.enqueue(record) {
        (format!("OK:QUEUED:{id}"), false)
    } else {
        *messages_rejected += 1;
        ("ERROR:BUFFER_FULL:BACKPRESSURE_ACTIVE".to_string(), false)
    }
}

fn handle_command(
    command: &str,
    buffer: &CircularBuffer,
    connected_at: Instant,
    messages_received: u64,
    messages_rejected: u64,
) -> (String, bool) {
    let name = command
        .split(':')
        .next()
        .unwrap_or_default()
        .to_ascii_uppercase();
    match name.as_str() {
        "PING" => ("OK:PONG".to_string(), false),
        "STATS" => {
            let uptime = connected_at.elapsed();
            let rate = if uptime.as_secs_f64() > 0.0 {
                messages_received as f64 / uptime.as_secs_f64()
            } else {
                0.0
            };
            (
                format!(
                    "OK:STATS:Messages:{messages_received},Rejected:{messages_rejected},Rate:{rate:.2}/s,Uptime:{}s",
                    uptime.as_secs()
                ),
                false,
            )
        }
        "BUFFER_STATS" => (format!("OK:BUFFER_STATS:{}", buffer.stats()), false),
        "DISCONNECT" => ("OK:DISCONNECTING".to_string(), true),
        "HELP" => (HELP_REPLY.to_string(), false),
        _ => (format!("ERROR:UNKNOWN_COMMAND:{name}"), false),
    }
}

async fn write_line(write_half: &mut OwnedWriteHalf, line: &str) -> std::io::Result<()> {
    write_half.write_all(line.as_bytes()).await?;
    write_half.write_all(b"\n").await
}

fn enable_keepalive(stream: &TcpStream) -> std::io::Result<()> {
    socket2::SockRef::from(stream).set_keepalive(true)
}
