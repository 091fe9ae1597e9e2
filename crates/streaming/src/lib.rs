//! Skewer - Streaming service base
//!
//! Shared machinery for the stream-oriented syslog services (TCP, RELP):
//! multi-listener lifecycle with privileged-binder fallback, connection
//! bookkeeping, pooled receive buffers and the service status model.
//!
//! # Design
//!
//! - **One accept loop per listener**, one handler task per connection,
//!   all tracked by a `TaskTracker` and torn down through a single
//!   `CancellationToken`
//! - **Binder fallback**: a bind refused with `PermissionDenied` is retried
//!   through the privileged binder when one was inherited
//! - **Per-listener failure isolation**: a listener that cannot bind is
//!   logged and skipped; the others come up

pub mod pool;
pub mod service;
pub mod status;

pub use pool::BufferPool;
pub use service::{Connection, IoStream, StreamHandler, StreamingService};
pub use status::{ServiceMetrics, ServiceMetricsSnapshot, ServiceStatus};
