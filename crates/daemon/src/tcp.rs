//! Plain TCP syslog service
//!
//! Accepts stream connections carrying syslog messages with either
//! LF-delimited or RFC 6587 octet-counted framing, parses them and stashes
//! the result. Unlike RELP there are no acknowledgements: a message is
//! gone once read.

use std::sync::Arc;

use bytes::{Buf, Bytes, BytesMut};
use tokio::io::AsyncReadExt;
use tokio_util::codec::Decoder;
use tokio_util::sync::CancellationToken;

use skewer_binder::BinderClient;
use skewer_model::{
    Format, ListenerInfo, ParsedMessage, ParsersEnv, Stasher, SyslogConfig, TcpUdpParsedMessage,
};
use skewer_streaming::service::{Connection, StreamHandler};
use skewer_streaming::{BufferPool, ServiceMetrics, ServiceMetricsSnapshot, ServiceStatus,
    StreamingService};

/// Frame splitter for plain TCP syslog
///
/// Messages starting with `<` use LF framing; anything else is taken as
/// octet counting (`LEN SP PAYLOAD`). The `lf-delimited` format forces LF
/// framing for opaque lines.
pub struct TcpCodec {
    format: Format,
    max_message_size: usize,
}

#[derive(Debug, thiserror::Error)]
pub enum TcpFrameError {
    #[error("octet count is not a number")]
    BadCount,

    #[error("frame of {size} bytes exceeds the {limit} byte limit")]
    TooLarge { size: usize, limit: usize },

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl TcpCodec {
    pub fn new(format: Format, max_message_size: usize) -> Self {
        Self {
            format,
            max_message_size,
        }
    }

    fn lf_framing(&self, first: u8) -> bool {
        self.format == Format::LfDelimited || first == b'<'
    }
}

fn is_sep(b: u8) -> bool {
    matches!(b, b' ' | b'\r' | b'\n')
}

fn trimmed(payload: &[u8]) -> Bytes {
    let start = payload
        .iter()
        .position(|&b| !is_sep(b))
        .unwrap_or(payload.len());
    let end = payload
        .iter()
        .rposition(|&b| !is_sep(b))
        .map(|i| i + 1)
        .unwrap_or(start);
    Bytes::copy_from_slice(&payload[start..end])
}

impl Decoder for TcpCodec {
    type Item = Bytes;
    type Error = TcpFrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, TcpFrameError> {
        match src.iter().position(|&b| !is_sep(b)) {
            Some(0) => {}
            Some(n) => src.advance(n),
            None => {
                src.clear();
                return Ok(None);
            }
        }

        if self.lf_framing(src[0]) {
            let Some(lf) = src.iter().position(|&b| b == b'\n') else {
                if src.len() > self.max_message_size {
                    return Err(TcpFrameError::TooLarge {
                        size: src.len(),
                        limit: self.max_message_size,
                    });
                }
                return Ok(None);
            };
            let frame = trimmed(&src[..lf]);
            src.advance(lf + 1);
            Ok(Some(frame))
        } else {
            // octet counting: LEN SP PAYLOAD
            let Some(sep) = src.iter().position(|&b| b == b' ' || b == b'\n') else {
                return Ok(None);
            };
            let count: usize = std::str::from_utf8(&src[..sep])
                .ok()
                .and_then(|s| s.parse().ok())
                .ok_or(TcpFrameError::BadCount)?;
            if count > self.max_message_size {
                return Err(TcpFrameError::TooLarge {
                    size: count,
                    limit: self.max_message_size,
                });
            }
            let total = sep + 1 + count;
            if src.len() < total {
                src.reserve(total - src.len());
                return Ok(None);
            }
            let frame = trimmed(&src[sep + 1..total]);
            src.advance(total);
            Ok(Some(frame))
        }
    }
}

struct TcpShared {
    stasher: Arc<dyn Stasher>,
    metrics: Arc<ServiceMetrics>,
    max_message_size: usize,
}

/// Per-connection logic: split, parse, stash
pub struct TcpHandler {
    shared: Arc<TcpShared>,
}

impl StreamHandler for TcpHandler {
    fn handle(
        self: Arc<Self>,
        conn: Connection,
        config: Arc<SyslogConfig>,
        shutdown: CancellationToken,
    ) -> impl Future<Output = ()> + Send {
        async move {
            let shared = &self.shared;
            let env = ParsersEnv::new();
            let mut codec = TcpCodec::new(config.format, shared.max_message_size);
            let mut buf = BytesMut::with_capacity(8192);
            let mut stream = conn.stream;

            loop {
                let frame = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    frame = next_tcp_frame(&mut stream, &mut codec, &mut buf, &config) => frame,
                };
                let frame = match frame {
                    Ok(Some(frame)) => frame,
                    Ok(None) => {
                        tracing::info!(client = %conn.client, "end of TCP client connection");
                        break;
                    }
                    Err(e) => {
                        tracing::debug!(client = %conn.client, error = %e, "TCP framing error");
                        shared.metrics.protocol_error();
                        break;
                    }
                };
                if frame.is_empty() {
                    continue;
                }
                shared.metrics.message_received();

                match env.parse(config.format, &frame, config.encoding, config.dont_parse_sd) {
                    Ok(fields) if fields.is_empty() => {}
                    Ok(fields) => {
                        let parsed = TcpUdpParsedMessage {
                            parsed: ParsedMessage {
                                fields,
                                client: conn.client.clone(),
                                local_port: conn.local_port,
                                unix_socket_path: conn.unix_socket_path.clone(),
                            },
                            conf_id: config.conf_id,
                            uid: Some(ulid::Ulid::new()),
                            ..Default::default()
                        };
                        if let Err(e) = shared.stasher.stash(parsed) {
                            tracing::warn!(client = %conn.client, error = %e, "stash error");
                        }
                    }
                    Err(e) => {
                        shared.metrics.parsing_error();
                        tracing::info!(
                            client = %conn.client,
                            format = %config.format,
                            error = %e,
                            "parsing error"
                        );
                    }
                }
            }
        }
    }
}

enum TcpReadError {
    Frame(TcpFrameError),
    Idle,
}

impl std::fmt::Display for TcpReadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TcpReadError::Frame(e) => e.fmt(f),
            TcpReadError::Idle => f.write_str("connection idle"),
        }
    }
}

async fn next_tcp_frame(
    stream: &mut skewer_streaming::IoStream,
    codec: &mut TcpCodec,
    buf: &mut BytesMut,
    config: &SyslogConfig,
) -> Result<Option<Bytes>, TcpReadError> {
    let read = async {
        loop {
            if let Some(frame) = codec.decode(buf).map_err(TcpReadError::Frame)? {
                return Ok(Some(frame));
            }
            let n = stream
                .read_buf(buf)
                .await
                .map_err(|e| TcpReadError::Frame(TcpFrameError::Io(e)))?;
            if n == 0 {
                return Ok(None);
            }
        }
    };
    if config.timeout.is_zero() {
        read.await
    } else {
        match tokio::time::timeout(config.timeout, read).await {
            Ok(result) => result,
            Err(_) => Err(TcpReadError::Idle),
        }
    }
}

/// The TCP syslog service
pub struct TcpService {
    streaming: StreamingService<TcpHandler>,
    status: tokio::sync::Mutex<ServiceStatus>,
}

impl TcpService {
    pub fn new(
        stasher: Arc<dyn Stasher>,
        binder: Option<Arc<BinderClient>>,
        max_message_size: usize,
    ) -> Self {
        let metrics = Arc::new(ServiceMetrics::new());
        let handler = Arc::new(TcpHandler {
            shared: Arc::new(TcpShared {
                stasher,
                metrics: Arc::clone(&metrics),
                max_message_size,
            }),
        });
        let pool = Arc::new(BufferPool::new(16, max_message_size));
        Self {
            streaming: StreamingService::new("tcp", handler, binder, pool, metrics),
            status: tokio::sync::Mutex::new(ServiceStatus::Stopped),
        }
    }

    pub fn set_conf(&self, configs: &[SyslogConfig]) {
        self.streaming.set_conf(configs);
    }

    pub async fn start(&self) -> Vec<ListenerInfo> {
        let mut status = self.status.lock().await;
        if *status != ServiceStatus::Stopped {
            return Vec::new();
        }
        let infos = self.streaming.init_listeners().await;
        if infos.is_empty() {
            tracing::debug!("TCP service not started: no listener");
            return infos;
        }
        self.streaming.listen();
        *status = ServiceStatus::Started;
        tracing::info!(nb_services = infos.len(), "listening on TCP");
        infos
    }

    pub async fn stop(&self) {
        let mut status = self.status.lock().await;
        if *status != ServiceStatus::Started {
            return;
        }
        self.streaming.reset_listeners().await;
        *status = ServiceStatus::Stopped;
        tracing::debug!("TCP service has stopped");
    }

    pub fn metrics_snapshot(&self) -> ServiceMetricsSnapshot {
        self.streaming.metrics().snapshot()
    }
}

#[cfg(test)]
#[path = "tcp_test.rs"]
mod tcp_test;
