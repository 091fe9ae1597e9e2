//! Syslog message fields
//!
//! The decoded form shared by every parser. Timestamps are kept as UTC
//! datetimes and serialised as RFC 3339, which is what the Kafka destination
//! and the store expect.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A fully decoded syslog message
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyslogMessage {
    /// Raw priority value (`facility * 8 + severity`)
    pub priority: u8,

    /// Facility extracted from the priority
    pub facility: u8,

    /// Severity extracted from the priority
    pub severity: u8,

    /// Protocol version (1 for RFC 5424, 0 for RFC 3164)
    pub version: u8,

    /// Timestamp claimed by the sender
    pub time_reported: Option<DateTime<Utc>>,

    /// Timestamp at which this daemon first saw the message
    pub time_generated: Option<DateTime<Utc>>,

    pub hostname: String,
    pub appname: String,
    pub procid: String,
    pub msgid: String,

    /// Raw STRUCTURED-DATA section, kept verbatim
    pub structured: String,

    /// Free-form message text
    pub message: String,

    /// Structured-data parameters flattened as `sdid.param` keys
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub properties: HashMap<String, String>,
}

impl SyslogMessage {
    /// Split a raw priority value into its facility and severity parts
    pub fn set_priority(&mut self, priority: u8) {
        self.priority = priority;
        self.facility = priority >> 3;
        self.severity = priority & 0x7;
    }

    /// A message is empty when no parser managed to extract anything useful.
    /// Empty messages are dropped without being counted as parse errors.
    pub fn is_empty(&self) -> bool {
        self.message.is_empty() && self.hostname.is_empty() && self.appname.is_empty()
    }

    /// The timestamp used for Kafka record timestamps: reported when the
    /// sender supplied one, generated otherwise.
    pub fn effective_time(&self) -> DateTime<Utc> {
        self.time_reported
            .or(self.time_generated)
            .unwrap_or_else(Utc::now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_split() {
        let mut msg = SyslogMessage::default();
        msg.set_priority(165);
        assert_eq!(msg.facility, 20);
        assert_eq!(msg.severity, 5);
    }

    #[test]
    fn emptiness() {
        let mut msg = SyslogMessage::default();
        assert!(msg.is_empty());
        msg.message = "something".into();
        assert!(!msg.is_empty());
    }
}
