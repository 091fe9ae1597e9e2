//! Service status model and metrics
//!
//! Every network service moves through the same statuses. `Waiting` is the
//! transient state after a recoverable failure; the service wrapper retries
//! `start` after a fixed backoff. `FinalStopped` is terminal and closes the
//! status channel.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Lifecycle status of a network service
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceStatus {
    Stopped,
    Started,
    /// Recoverable failure; the wrapper restarts after a backoff
    Waiting,
    /// Terminal; the status channel closes after this
    FinalStopped,
}

/// Counters shared by the stream services
#[derive(Debug, Default)]
pub struct ServiceMetrics {
    pub connections_active: AtomicU64,
    pub connections_total: AtomicU64,
    pub incoming_messages: AtomicU64,
    pub parsing_errors: AtomicU64,
    pub protocol_errors: AtomicU64,
    pub accept_errors: AtomicU64,
}

impl ServiceMetrics {
    pub const fn new() -> Self {
        Self {
            connections_active: AtomicU64::new(0),
            connections_total: AtomicU64::new(0),
            incoming_messages: AtomicU64::new(0),
            parsing_errors: AtomicU64::new(0),
            protocol_errors: AtomicU64::new(0),
            accept_errors: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn connection_opened(&self) {
        self.connections_active.fetch_add(1, Ordering::Relaxed);
        self.connections_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn connection_closed(&self) {
        self.connections_active.fetch_sub(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn message_received(&self) {
        self.incoming_messages.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn parsing_error(&self) {
        self.parsing_errors.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn protocol_error(&self) {
        self.protocol_errors.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn accept_error(&self) {
        self.accept_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Point-in-time snapshot, also the `gathermetrics` reply body
    pub fn snapshot(&self) -> ServiceMetricsSnapshot {
        ServiceMetricsSnapshot {
            connections_active: self.connections_active.load(Ordering::Relaxed),
            connections_total: self.connections_total.load(Ordering::Relaxed),
            incoming_messages: self.incoming_messages.load(Ordering::Relaxed),
            parsing_errors: self.parsing_errors.load(Ordering::Relaxed),
            protocol_errors: self.protocol_errors.load(Ordering::Relaxed),
            accept_errors: self.accept_errors.load(Ordering::Relaxed),
        }
    }
}

/// Serializable snapshot of [`ServiceMetrics`]
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct ServiceMetricsSnapshot {
    pub connections_active: u64,
    pub connections_total: u64,
    pub incoming_messages: u64,
    pub parsing_errors: u64,
    pub protocol_errors: u64,
    pub accept_errors: u64,
}
