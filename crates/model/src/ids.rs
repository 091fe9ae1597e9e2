//! Identifier types
//!
//! ULIDs identify configuration records, sessions and stored messages.
//! Connection ids and transaction numbers are plain integers: connection ids
//! are process-local and monotonic (never reused), transaction numbers are
//! chosen by the RELP client and must increase strictly per connection.

use std::fmt;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Identifier of an immutable syslog configuration record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConfId(Ulid);

impl ConfId {
    /// Generate a fresh id
    pub fn new() -> Self {
        Self(Ulid::new())
    }

    /// The nil id, used before a config has been registered
    pub const fn nil() -> Self {
        Self(Ulid::nil())
    }
}

impl Default for ConfId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConfId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Process-local connection identifier, monotonically allocated, never reused
pub type ConnId = u64;

/// RELP transaction number, strictly increasing per connection
pub type TxNr = u64;
