//! RELP frame codec
//!
//! Wire format: `TXNR SP COMMAND SP DATALEN (SP DATA)? LF` where `DATALEN`
//! is the byte length of `DATA`. The decoder:
//!
//! 1. trims leading whitespace,
//! 2. waits for three whitespace-terminated header tokens,
//! 3. parses `TXNR` and `DATALEN` as decimals; non-numeric header fields are
//!    a framing error, fatal for the connection,
//! 4. claims the frame only once the full payload and its trailing LF have
//!    arrived.
//!
//! Payloads are trimmed of surrounding whitespace, matching what RELP
//! senders actually put on the wire.

use bytes::{Buf, Bytes, BytesMut};
use tokio_util::codec::Decoder;

use skewer_model::TxNr;

/// One decoded RELP frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelpFrame {
    pub txnr: TxNr,
    pub command: String,
    pub data: Bytes,
}

#[derive(Debug, thiserror::Error)]
pub enum RelpFrameError {
    #[error("transaction number is not a number")]
    BadTxnr,

    #[error("data length is not a number")]
    BadDatalen,

    #[error("frame of {size} bytes exceeds the {limit} byte limit")]
    TooLarge { size: usize, limit: usize },

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Streaming decoder for RELP frames
pub struct RelpCodec {
    max_frame_size: usize,
}

impl RelpCodec {
    pub fn new(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }
}

fn is_sep(b: u8) -> bool {
    matches!(b, b' ' | b'\r' | b'\n')
}

/// Next whitespace-terminated token at or after `from`.
/// `None` until its trailing separator has arrived.
fn next_token(buf: &[u8], from: usize) -> Option<(usize, usize)> {
    let start = (from..buf.len()).find(|&i| !is_sep(buf[i]))?;
    let end = (start..buf.len()).find(|&i| is_sep(buf[i]))?;
    Some((start, end))
}

impl Decoder for RelpCodec {
    type Item = RelpFrame;
    type Error = RelpFrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<RelpFrame>, RelpFrameError> {
        // leading whitespace between frames carries nothing
        match src.iter().position(|&b| !is_sep(b)) {
            Some(0) => {}
            Some(n) => src.advance(n),
            None => {
                src.clear();
                return Ok(None);
            }
        }

        let Some((t0s, t0e)) = next_token(src, 0) else {
            return Ok(None);
        };
        let Some((t1s, t1e)) = next_token(src, t0e) else {
            return Ok(None);
        };
        let Some((t2s, t2e)) = next_token(src, t1e) else {
            return Ok(None);
        };

        let txnr: TxNr = std::str::from_utf8(&src[t0s..t0e])
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or(RelpFrameError::BadTxnr)?;
        let command = String::from_utf8_lossy(&src[t1s..t1e]).into_owned();
        let datalen: usize = std::str::from_utf8(&src[t2s..t2e])
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or(RelpFrameError::BadDatalen)?;

        if datalen > self.max_frame_size {
            return Err(RelpFrameError::TooLarge {
                size: datalen,
                limit: self.max_frame_size,
            });
        }

        // the separator after DATALEN is part of the header
        let header_end = t2e + 1;

        if datalen == 0 {
            src.advance(header_end);
            return Ok(Some(RelpFrame {
                txnr,
                command,
                data: Bytes::new(),
            }));
        }

        // wait for the full payload plus its trailing LF
        let total = header_end + datalen + 1;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        let payload = &src[header_end..header_end + datalen];
        let trim_start = payload
            .iter()
            .position(|&b| !is_sep(b))
            .unwrap_or(payload.len());
        let trim_end = payload
            .iter()
            .rposition(|&b| !is_sep(b))
            .map(|i| i + 1)
            .unwrap_or(trim_start);
        let data = Bytes::copy_from_slice(&payload[trim_start..trim_end]);
        src.advance(total);

        Ok(Some(RelpFrame {
            txnr,
            command,
            data,
        }))
    }
}

/// Render a response line: `TXNR rsp DATALEN BODY LF`
pub(crate) fn response_line(txnr: TxNr, body: &str) -> String {
    format!("{} rsp {} {}\n", txnr, body.len(), body)
}

#[cfg(test)]
#[path = "frame_test.rs"]
mod frame_test;
