//! Skewer - RELP service
//!
//! Reliable Event Logging Protocol ingestion: framed syslog over TCP with
//! per-transaction acknowledgements. The engine fans raw frames from the
//! connection handlers into a parser pool, routes parsed messages either
//! straight to Kafka or to the store, and cooks the resulting out-of-order
//! completions back into strictly txnr-ordered responses per connection.
//!
//! # Pipeline
//!
//! ```text
//! client ──▶ handler ──▶ raw ring ──▶ parser pool ──▶ parsed queue ──▶ kafka
//!    ▲                                     │ (store mode)               │
//!    │                                     ▼                            ▼
//!    └──── response cooker ◀──────── ack forwarder ◀─────── delivery events
//! ```

mod forwarder;
mod frame;
mod handler;
mod kafka;
mod parse;
mod service;

pub use forwarder::AckForwarder;
pub use frame::{RelpCodec, RelpFrame, RelpFrameError};
pub use handler::RelpHandler;
pub use kafka::{AckMeta, DeliveryEvent, RelpProducer, is_fatal_kafka_error};
pub use service::{
    RelpConf, RelpMetrics, RelpMetricsSnapshot, RelpService, RelpServiceError, RelpServiceImpl,
};
