//! Store and reporting seams
//!
//! `Stasher` is the persistent store as the services see it: a sink that
//! either accepts a parsed message or fails, fatally or not. `Reporter` is
//! how a child worker announces its listening endpoints to the supervisor.

use crate::message::{ListenerInfo, TcpUdpParsedMessage};

/// Failure to stash a message
///
/// Non-fatal errors fail the one message; fatal errors halt the service and
/// put it in the waiting/retry state.
#[derive(Debug, thiserror::Error)]
pub enum StashError {
    #[error("fatal store error: {0}")]
    Fatal(String),

    #[error("store error: {0}")]
    NonFatal(String),
}

impl StashError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, StashError::Fatal(_))
    }
}

/// Black-box persistent store
pub trait Stasher: Send + Sync {
    fn stash(&self, msg: TcpUdpParsedMessage) -> Result<(), StashError>;
}

/// Listener announcement channel back to the supervisor
pub trait Reporter: Send + Sync {
    fn report(&self, infos: &[ListenerInfo]) -> std::io::Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatality() {
        assert!(StashError::Fatal("disk gone".into()).is_fatal());
        assert!(!StashError::NonFatal("queue full".into()).is_fatal());
    }
}
