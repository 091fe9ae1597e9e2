//! Raw and parsed message envelopes
//!
//! `RawTcpMessage` is the pooled frame that travels from a connection handler
//! to a parser worker; `TcpUdpParsedMessage` is the value object that travels
//! from a parser worker to a destination or to the store.

use bytes::BytesMut;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::config::{Encoding, Format};
use crate::ids::{ConfId, ConnId, TxNr};
use crate::syslog::SyslogMessage;

/// A raw frame read from a stream connection
///
/// The payload buffer is rented from the service's buffer pool and must be
/// returned once parsing completes, whatever the outcome. Anything a later
/// stage wants to keep must be copied out first.
#[derive(Debug)]
pub struct RawTcpMessage {
    /// Rented payload buffer
    pub message: BytesMut,

    pub client: String,
    pub local_port: u16,
    pub unix_socket_path: String,

    pub format: Format,
    pub encoding: Encoding,
    pub dont_parse_sd: bool,

    pub conf_id: ConfId,
    pub conn_id: ConnId,
    pub txnr: TxNr,
}

/// Origin metadata attached to every parsed message
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParsedMessage {
    pub fields: SyslogMessage,
    pub client: String,
    pub local_port: u16,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub unix_socket_path: String,
}

/// A parsed message with its transaction bookkeeping
///
/// `uid` is populated only on the store path, where every stashed message
/// needs a stable identifier.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TcpUdpParsedMessage {
    pub parsed: ParsedMessage,
    pub txnr: TxNr,
    pub conf_id: ConfId,
    pub conn_id: ConnId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<Ulid>,
}

/// Listening endpoint advertised by a service after it starts
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ListenerInfo {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub bind_addr: String,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub port: u16,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub unix_socket_path: String,
    pub protocol: String,
}

fn is_zero(port: &u16) -> bool {
    *port == 0
}

impl ListenerInfo {
    /// Endpoint for a TCP/UDP listener
    pub fn net(protocol: &str, bind_addr: &str, port: u16) -> Self {
        Self {
            bind_addr: bind_addr.into(),
            port,
            protocol: protocol.into(),
            ..Default::default()
        }
    }

    /// Endpoint for a unix-domain listener
    pub fn unix(protocol: &str, path: &str) -> Self {
        Self {
            unix_socket_path: path.into(),
            protocol: protocol.into(),
            ..Default::default()
        }
    }
}
