//! Skewer - Message model
//!
//! Shared value types that flow between the network services, the parser
//! workers, the destinations and the store: syslog messages, raw pooled
//! frames, parsed messages, listener announcements and the syslog/kafka
//! configuration records that drive them.
//!
//! # Design Principles
//!
//! - **Value objects**: parsed messages are cheap to clone and carry no
//!   references into network buffers
//! - **Pooled raw frames**: `RawTcpMessage` wraps a rented `BytesMut` whose
//!   backing storage is reused; downstream stages copy what they keep
//! - **Serde everywhere**: configs travel as JSON over the plugin control
//!   channel, parsed messages as JSON to Kafka and msgpack to the store

pub mod config;
pub mod filter;
pub mod parser;
pub mod syslog;

mod ids;
mod message;
mod stash;

pub use config::{BaseConfig, Encoding, Format, KafkaDestConfig, SyslogConfig};
pub use filter::{FilterEnv, FilterResult};
pub use ids::{ConfId, ConnId, TxNr};
pub use message::{ListenerInfo, ParsedMessage, RawTcpMessage, TcpUdpParsedMessage};
pub use parser::{ParseError, ParsersEnv};
pub use stash::{Reporter, StashError, Stasher};
pub use syslog::SyslogMessage;
