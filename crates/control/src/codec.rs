//! Plugin stdio framing and message kinds
//!
//! Every message on a plugin's stdin/stdout is one length-delimited frame
//! (u32 big-endian prefix) whose payload is `command` or `command SP body`.
//! Listener infos and metrics travel as JSON, stashed syslog messages as
//! msgpack. A frame that does not decode is fatal for the child.

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

use skewer_model::{BaseConfig, ListenerInfo, TcpUdpParsedMessage};

/// Frames larger than this are nonsensical on the control channel
const MAX_CONTROL_FRAME: usize = 16 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    #[error("i/o error on the control channel: {0}")]
    Io(#[from] std::io::Error),

    #[error("unexpected message from plugin: {0}")]
    UnexpectedMessage(String),

    #[error("malformed {command} body: {reason}")]
    MalformedBody { command: &'static str, reason: String },

    #[error("unexpected end of plugin before it was initialized")]
    UnexpectedEnd,

    #[error("plugin failed to start before timeout")]
    StartTimeout,

    #[error("plugin '{0}' has not been created")]
    NotCreated(String),

    #[error("plugin already started: {0}")]
    AlreadyStarted(String),

    #[error("plugin reported a start error: {0}")]
    StartError(String),

    #[error("plugin reported a configuration error: {0}")]
    ConfError(String),

    #[error("no listener")]
    NoListener,
}

/// The length-delimited codec both sides frame with
pub struct ControlCodec(LengthDelimitedCodec);

impl ControlCodec {
    pub fn new() -> Self {
        Self(
            LengthDelimitedCodec::builder()
                .max_frame_length(MAX_CONTROL_FRAME)
                .new_codec(),
        )
    }
}

impl Default for ControlCodec {
    fn default() -> Self {
        Self::new()
    }
}

/// Read one frame; `None` on EOF between frames
pub async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
    codec: &mut ControlCodec,
    buf: &mut BytesMut,
) -> Result<Option<BytesMut>, ControlError> {
    loop {
        if let Some(frame) = codec.0.decode(buf)? {
            return Ok(Some(frame));
        }
        if reader.read_buf(buf).await? == 0 {
            if buf.is_empty() {
                return Ok(None);
            }
            return Err(ControlError::UnexpectedMessage("truncated frame".into()));
        }
    }
}

/// Frame and write one payload
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    codec: &mut ControlCodec,
    payload: Bytes,
) -> Result<(), ControlError> {
    let mut out = BytesMut::with_capacity(payload.len() + 4);
    codec.0.encode(payload, &mut out)?;
    writer.write_all(&out).await?;
    writer.flush().await?;
    Ok(())
}

fn split_command(frame: &[u8]) -> (&[u8], &[u8]) {
    match frame.iter().position(|&b| b == b' ') {
        Some(pos) => (&frame[..pos], &frame[pos + 1..]),
        None => (frame, &[][..]),
    }
}

fn with_body(command: &str, body: &[u8]) -> Bytes {
    let mut out = Vec::with_capacity(command.len() + 1 + body.len());
    out.extend_from_slice(command.as_bytes());
    if !body.is_empty() {
        out.push(b' ');
        out.extend_from_slice(body);
    }
    Bytes::from(out)
}

/// Supervisor → child commands
#[derive(Debug, Clone, PartialEq)]
pub enum ParentCommand {
    Conf(BaseConfig),
    Start,
    Stop,
    Shutdown,
    GatherMetrics,
}

impl ParentCommand {
    pub fn encode(&self) -> Result<Bytes, ControlError> {
        Ok(match self {
            ParentCommand::Conf(conf) => {
                let body = serde_json::to_vec(conf).map_err(|e| ControlError::MalformedBody {
                    command: "conf",
                    reason: e.to_string(),
                })?;
                with_body("conf", &body)
            }
            ParentCommand::Start => Bytes::from_static(b"start"),
            ParentCommand::Stop => Bytes::from_static(b"stop"),
            ParentCommand::Shutdown => Bytes::from_static(b"shutdown"),
            ParentCommand::GatherMetrics => Bytes::from_static(b"gathermetrics"),
        })
    }

    pub fn decode(frame: &[u8]) -> Result<ParentCommand, ControlError> {
        let (command, body) = split_command(frame);
        match command {
            b"conf" => {
                let conf =
                    serde_json::from_slice(body).map_err(|e| ControlError::MalformedBody {
                        command: "conf",
                        reason: e.to_string(),
                    })?;
                Ok(ParentCommand::Conf(conf))
            }
            b"start" => Ok(ParentCommand::Start),
            b"stop" => Ok(ParentCommand::Stop),
            b"shutdown" => Ok(ParentCommand::Shutdown),
            b"gathermetrics" => Ok(ParentCommand::GatherMetrics),
            other => Err(ControlError::UnexpectedMessage(
                String::from_utf8_lossy(other).into_owned(),
            )),
        }
    }
}

/// Child → supervisor messages
#[derive(Debug, Clone, PartialEq)]
pub enum ChildMessage {
    /// First-time initialisation done; unblocks `Start`
    Started(Vec<ListenerInfo>),
    StartError(String),
    ConfError(String),
    NoListenerError,
    /// Dynamic listener re-announcement
    Infos(Vec<ListenerInfo>),
    /// A parsed message to be stashed; only valid after `Started`
    Syslog(TcpUdpParsedMessage),
    Metrics(serde_json::Value),
    /// Clean halt of this start cycle
    Stopped,
    /// The child will exit; the supervisor waits for EOF
    Shutdown,
}

impl ChildMessage {
    pub fn encode(&self) -> Result<Bytes, ControlError> {
        let malformed = |command, e: &dyn std::fmt::Display| ControlError::MalformedBody {
            command,
            reason: e.to_string(),
        };
        Ok(match self {
            ChildMessage::Started(infos) => with_body(
                "started",
                &serde_json::to_vec(infos).map_err(|e| malformed("started", &e))?,
            ),
            ChildMessage::StartError(text) => with_body("starterror", text.as_bytes()),
            ChildMessage::ConfError(text) => with_body("conferror", text.as_bytes()),
            ChildMessage::NoListenerError => Bytes::from_static(b"nolistenererror"),
            ChildMessage::Infos(infos) => with_body(
                "infos",
                &serde_json::to_vec(infos).map_err(|e| malformed("infos", &e))?,
            ),
            ChildMessage::Syslog(msg) => with_body(
                "syslog",
                &rmp_serde::to_vec(msg).map_err(|e| malformed("syslog", &e))?,
            ),
            ChildMessage::Metrics(value) => with_body(
                "metrics",
                &serde_json::to_vec(value).map_err(|e| malformed("metrics", &e))?,
            ),
            ChildMessage::Stopped => Bytes::from_static(b"stopped"),
            ChildMessage::Shutdown => Bytes::from_static(b"shutdown"),
        })
    }

    pub fn decode(frame: &[u8]) -> Result<ChildMessage, ControlError> {
        let (command, body) = split_command(frame);
        let malformed = |command, e: &dyn std::fmt::Display| ControlError::MalformedBody {
            command,
            reason: e.to_string(),
        };
        match command {
            b"started" => Ok(ChildMessage::Started(
                serde_json::from_slice(body).map_err(|e| malformed("started", &e))?,
            )),
            b"starterror" => Ok(ChildMessage::StartError(
                String::from_utf8_lossy(body).into_owned(),
            )),
            b"conferror" => Ok(ChildMessage::ConfError(
                String::from_utf8_lossy(body).into_owned(),
            )),
            b"nolistenererror" => Ok(ChildMessage::NoListenerError),
            b"infos" => Ok(ChildMessage::Infos(
                serde_json::from_slice(body).map_err(|e| malformed("infos", &e))?,
            )),
            b"syslog" => Ok(ChildMessage::Syslog(
                rmp_serde::from_slice(body).map_err(|e| malformed("syslog", &e))?,
            )),
            b"metrics" => Ok(ChildMessage::Metrics(
                serde_json::from_slice(body).map_err(|e| malformed("metrics", &e))?,
            )),
            b"stopped" => Ok(ChildMessage::Stopped),
            b"shutdown" => Ok(ChildMessage::Shutdown),
            other => Err(ControlError::UnexpectedMessage(
                String::from_utf8_lossy(other).into_owned(),
            )),
        }
    }
}

#[cfg(test)]
#[path = "codec_test.rs"]
mod codec_test;
