//! RELP connection handler
//!
//! One handler per connection, driving the per-connection state machine:
//!
//! ```text
//! INIT ──open──▶ OPEN ──syslog*──▶ OPEN ──close──▶ CLOSED
//!   │                 │
//!   └─anything else──▶ protocol error: count, log, tear down
//! ```
//!
//! The reader parses frames, enforces txnr monotonicity and feeds syslog
//! payloads into the raw ring. A peer task, the response cooker, drains the
//! forwarder's completion queues and answers the client in strict txnr
//! order, whatever order the completions arrived in.

use std::collections::HashSet;
use std::sync::Arc;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::Mutex;
use tokio_util::codec::Decoder;
use tokio_util::sync::CancellationToken;

use skewer_model::{ConnId, RawTcpMessage, SyslogConfig};
use skewer_streaming::service::{Connection, IoStream, StreamHandler};

use crate::frame::{RelpCodec, RelpFrame, RelpFrameError, response_line};
use crate::service::RelpShared;

/// Per-connection RELP protocol logic
pub struct RelpHandler {
    pub(crate) shared: Arc<RelpShared>,
}

type SharedWriter = Arc<Mutex<WriteHalf<IoStream>>>;

impl StreamHandler for RelpHandler {
    fn handle(
        self: Arc<Self>,
        conn: Connection,
        config: Arc<SyslogConfig>,
        shutdown: CancellationToken,
    ) -> impl Future<Output = ()> + Send {
        async move { handle_connection(&self.shared, conn, config, shutdown).await }
    }
}

async fn handle_connection(
    shared: &Arc<RelpShared>,
    conn: Connection,
    config: Arc<SyslogConfig>,
    shutdown: CancellationToken,
) {
    let conn_id = shared.forwarder.add_conn();
    let client = conn.client;
    let local_port = conn.local_port;
    let path = conn.unix_socket_path;

    // the ring input disappears while the service stops; late connections
    // just close
    let raw_tx = shared.raw_tx.lock().clone();

    let (mut reader, write_half) = tokio::io::split(conn.stream);
    let writer: SharedWriter = Arc::new(Mutex::new(write_half));

    let cooker = tokio::spawn(response_cooker(
        Arc::clone(shared),
        Arc::clone(&writer),
        conn_id,
        client.clone(),
    ));

    let mut codec = RelpCodec::new(shared.max_message_size);
    let mut buf = BytesMut::with_capacity(8192);
    let mut relp_open = false;
    let mut previous: Option<u64> = None;

    loop {
        // the idle deadline rearms on every successful frame read
        let next = tokio::select! {
            _ = shutdown.cancelled() => break,
            frame = read_with_deadline(&mut reader, &mut codec, &mut buf, &config) => frame,
        };

        let frame = match next {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                tracing::info!(client = %client, "end of RELP stream");
                break;
            }
            Err(ReadOutcome::Idle) => {
                tracing::info!(client = %client, "RELP connection idle, closing");
                break;
            }
            Err(ReadOutcome::Framing(e)) => {
                tracing::warn!(client = %client, error = %e, "RELP framing error");
                shared.metrics.protocol_error();
                break;
            }
        };

        if previous.is_some_and(|p| frame.txnr <= p) {
            tracing::warn!(client = %client, txnr = frame.txnr, "TXNR did not increase");
            shared.metrics.protocol_error();
            break;
        }
        previous = Some(frame.txnr);

        match frame.command.as_str() {
            "open" => {
                if relp_open {
                    tracing::warn!(client = %client, "received open command twice");
                    shared.metrics.protocol_error();
                    break;
                }
                // echo the offered capabilities back
                let body = format!("200 OK\n{}", String::from_utf8_lossy(&frame.data));
                if write_line(&writer, &response_line(frame.txnr, &body)).await.is_err() {
                    break;
                }
                relp_open = true;
                tracing::info!(client = %client, "received 'open' command");
            }
            "close" => {
                if !relp_open {
                    tracing::warn!(client = %client, "received close command before open");
                    shared.metrics.protocol_error();
                    break;
                }
                let answer = format!("{} rsp 0\n0 serverclose 0\n", frame.txnr);
                let _ = write_line(&writer, &answer).await;
                tracing::info!(client = %client, "received 'close' command");
                break;
            }
            "syslog" => {
                if !relp_open {
                    tracing::warn!(client = %client, "received syslog command before open");
                    shared.metrics.protocol_error();
                    break;
                }
                shared.forwarder.received(conn_id, frame.txnr);
                if frame.data.is_empty() {
                    shared.forwarder.forward_succ(conn_id, frame.txnr);
                    continue;
                }
                let Some(raw_tx) = &raw_tx else { break };

                let mut message = shared.pool.rent();
                message.extend_from_slice(&frame.data);
                let raw = RawTcpMessage {
                    message,
                    client: client.clone(),
                    local_port,
                    unix_socket_path: path.clone(),
                    format: config.format,
                    encoding: config.encoding,
                    dont_parse_sd: config.dont_parse_sd,
                    conf_id: config.conf_id,
                    conn_id,
                    txnr: frame.txnr,
                };
                shared.metrics.message_received();
                if let Err(e) = raw_tx.send(raw).await {
                    // ring disposed: the service is stopping
                    shared.pool.give_back(e.0.message);
                    break;
                }
            }
            other => {
                tracing::warn!(client = %client, command = other, "unknown RELP command");
                shared.metrics.protocol_error();
                break;
            }
        }
    }

    shared.forwarder.remove_conn(conn_id);
    let _ = cooker.await;
}

enum ReadOutcome {
    Idle,
    Framing(RelpFrameError),
}

async fn read_with_deadline(
    reader: &mut ReadHalf<IoStream>,
    codec: &mut RelpCodec,
    buf: &mut BytesMut,
    config: &SyslogConfig,
) -> Result<Option<RelpFrame>, ReadOutcome> {
    let read = read_frame(reader, codec, buf);
    if config.timeout.is_zero() {
        read.await.map_err(ReadOutcome::Framing)
    } else {
        match tokio::time::timeout(config.timeout, read).await {
            Ok(result) => result.map_err(ReadOutcome::Framing),
            Err(_) => Err(ReadOutcome::Idle),
        }
    }
}

/// Pull bytes until the codec yields a frame; `None` on clean EOF
async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
    codec: &mut RelpCodec,
    buf: &mut BytesMut,
) -> Result<Option<RelpFrame>, RelpFrameError> {
    loop {
        if let Some(frame) = codec.decode(buf)? {
            return Ok(Some(frame));
        }
        if reader.read_buf(buf).await? == 0 {
            return Ok(None);
        }
    }
}

async fn write_line<W: AsyncWrite + Unpin>(
    writer: &Arc<Mutex<W>>,
    line: &str,
) -> std::io::Result<()> {
    let mut guard = writer.lock().await;
    let result = guard.write_all(line.as_bytes()).await;
    if let Err(e) = &result {
        tracing::debug!(error = %e, "RELP response write failed");
    }
    result
}

/// Drains success/failure completions and answers the client in strict
/// txnr order: only the smallest in-flight txnr may ever be emitted, so
/// completions that arrive early wait in the local sets.
pub(crate) async fn response_cooker<W: AsyncWrite + Send + Unpin>(
    shared: Arc<RelpShared>,
    writer: Arc<Mutex<W>>,
    conn_id: ConnId,
    client: String,
) {
    let mut successes: HashSet<u64> = HashSet::new();
    let mut failures: HashSet<u64> = HashSet::new();

    while shared.forwarder.wait(conn_id).await {
        if let Some(txnr) = shared.forwarder.get_succ(conn_id) {
            successes.insert(txnr);
        } else if let Some(txnr) = shared.forwarder.get_fail(conn_id) {
            failures.insert(txnr);
        }

        while let Some(next) = shared.forwarder.next_to_commit(conn_id) {
            let line = if successes.remove(&next) {
                shared.relp_metrics.answer_200();
                response_line(next, "200 OK")
            } else if failures.remove(&next) {
                shared.relp_metrics.answer_500();
                response_line(next, "500 KO")
            } else {
                // the next-in-line outcome has not arrived yet
                break;
            };
            if write_line(&writer, &line).await.is_err() {
                tracing::debug!(client = %client, "response cooker stopping on write error");
                return;
            }
            shared.forwarder.committed(conn_id, next);
        }
    }
}

#[cfg(test)]
#[path = "handler_test.rs"]
mod handler_test;
