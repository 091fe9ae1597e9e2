//! Message filtering and routing hooks
//!
//! Each syslog config names four hooks that decide, per message, the Kafka
//! topic, partition key, partition number and whether the message passes at
//! all. The scripted hook engine lives outside this daemon; the environment
//! here evaluates the template fallbacks and the built-in static filters,
//! which is what the hooks resolve to when no script engine is attached.
//!
//! Destinations cache one environment per `ConfId` since configs are
//! immutable.

use std::sync::atomic::{AtomicBool, Ordering};

use crate::config::SyslogConfig;
use crate::syslog::SyslogMessage;

/// Outcome of the filter hook
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterResult {
    /// Forward to the destination
    Pass,
    /// Silently discarded by policy
    Dropped,
    /// Refused; the sender gets a failure
    Rejected,
}

/// Per-config evaluation environment for the four routing hooks
#[derive(Debug)]
pub struct FilterEnv {
    filter_func: String,
    topic_tmpl: String,
    partition_tmpl: String,
    partition_number_func: String,
    warned_unknown_filter: AtomicBool,
}

impl FilterEnv {
    pub fn new(config: &SyslogConfig) -> Self {
        Self {
            filter_func: config.filter_func.clone(),
            topic_tmpl: config.topic_tmpl.clone(),
            partition_tmpl: config.partition_tmpl.clone(),
            partition_number_func: config.partition_number_func.clone(),
            warned_unknown_filter: AtomicBool::new(false),
        }
    }

    /// Kafka topic for this message; empty means the message cannot be routed
    pub fn topic(&self, fields: &SyslogMessage) -> String {
        render_template(&self.topic_tmpl, fields)
    }

    /// Partition key for this message
    pub fn partition_key(&self, fields: &SyslogMessage) -> String {
        render_template(&self.partition_tmpl, fields)
    }

    /// Explicit partition number, when the hook pins one
    pub fn partition_number(&self, _fields: &SyslogMessage) -> Option<i32> {
        self.partition_number_func.parse().ok()
    }

    /// Run the filter hook
    pub fn filter(&self, _fields: &SyslogMessage) -> FilterResult {
        match self.filter_func.as_str() {
            "" | "pass" => FilterResult::Pass,
            "drop" => FilterResult::Dropped,
            "reject" => FilterResult::Rejected,
            other => {
                if !self.warned_unknown_filter.swap(true, Ordering::Relaxed) {
                    tracing::warn!(filter = other, "unknown filter hook, passing messages");
                }
                FilterResult::Pass
            }
        }
    }
}

/// Substitute `{field}` placeholders with message fields
fn render_template(tmpl: &str, fields: &SyslogMessage) -> String {
    let mut out = String::with_capacity(tmpl.len());
    let mut rest = tmpl;
    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let Some(close) = rest[open..].find('}') else {
            out.push_str(&rest[open..]);
            return out;
        };
        let name = &rest[open + 1..open + close];
        match name {
            "appname" => out.push_str(&fields.appname),
            "hostname" => out.push_str(&fields.hostname),
            "msgid" => out.push_str(&fields.msgid),
            "procid" => out.push_str(&fields.procid),
            "facility" => out.push_str(&fields.facility.to_string()),
            "severity" => out.push_str(&fields.severity.to_string()),
            // unknown placeholders render as nothing
            _ => {}
        }
        rest = &rest[open + close + 1..];
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SyslogConfig;

    fn fields() -> SyslogMessage {
        SyslogMessage {
            appname: "nginx".into(),
            hostname: "web1".into(),
            facility: 20,
            severity: 5,
            ..Default::default()
        }
    }

    #[test]
    fn topic_template_substitution() {
        let env = FilterEnv::new(&SyslogConfig::default());
        assert_eq!(env.topic(&fields()), "rsyslog-nginx");
        assert_eq!(env.partition_key(&fields()), "mypk-web1");
    }

    #[test]
    fn empty_template_yields_empty_topic() {
        let config = SyslogConfig {
            topic_tmpl: String::new(),
            ..Default::default()
        };
        let env = FilterEnv::new(&config);
        assert_eq!(env.topic(&fields()), "");
    }

    #[test]
    fn unknown_placeholder_renders_empty() {
        let config = SyslogConfig {
            topic_tmpl: "logs-{nope}-{severity}".into(),
            ..Default::default()
        };
        let env = FilterEnv::new(&config);
        assert_eq!(env.topic(&fields()), "logs--5");
    }

    #[test]
    fn static_filters() {
        let mut config = SyslogConfig::default();
        assert_eq!(FilterEnv::new(&config).filter(&fields()), FilterResult::Pass);

        config.filter_func = "drop".into();
        assert_eq!(
            FilterEnv::new(&config).filter(&fields()),
            FilterResult::Dropped
        );

        config.filter_func = "reject".into();
        assert_eq!(
            FilterEnv::new(&config).filter(&fields()),
            FilterResult::Rejected
        );

        config.filter_func = "no-such-hook".into();
        assert_eq!(FilterEnv::new(&config).filter(&fields()), FilterResult::Pass);
    }

    #[test]
    fn partition_number_from_hook() {
        let config = SyslogConfig {
            partition_number_func: "3".into(),
            ..Default::default()
        };
        assert_eq!(FilterEnv::new(&config).partition_number(&fields()), Some(3));
        assert_eq!(
            FilterEnv::new(&SyslogConfig::default()).partition_number(&fields()),
            None
        );
    }
}
