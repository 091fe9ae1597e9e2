//! Service configuration records
//!
//! A `SyslogConfig` describes one listening endpoint and how to interpret the
//! messages arriving on it. Records are immutable once registered and are
//! looked up by `ConfId` by the parser and destination stages.
//!
//! Configs are deserialised from TOML at the CLI and travel to child workers
//! as JSON over the plugin control channel.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::ids::ConfId;

/// Syslog wire format expected on an endpoint
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Format {
    Rfc5424,
    Rfc3164,
    Json,
    /// Sniff RFC 5424 vs RFC 3164 per message
    #[default]
    Auto,
    /// Opaque lines, no syslog header
    LfDelimited,
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Format::Rfc5424 => "rfc5424",
            Format::Rfc3164 => "rfc3164",
            Format::Json => "json",
            Format::Auto => "auto",
            Format::LfDelimited => "lf-delimited",
        };
        f.write_str(s)
    }
}

/// Text encoding of incoming payloads
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Encoding {
    #[default]
    Utf8,
    Latin1,
}

/// Configuration of one syslog listening endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyslogConfig {
    /// Stable identifier, generated at load time
    pub conf_id: ConfId,

    /// `tcp`, `udp` or `relp`
    pub protocol: String,

    /// Bind address for network listeners
    pub bind_addr: String,

    /// Listen port for network listeners (0 = unix socket only)
    pub port: u16,

    /// Unix socket path; takes precedence over `bind_addr`/`port` when set
    pub unix_socket_path: String,

    pub format: Format,
    pub encoding: Encoding,

    /// Keep the STRUCTURED-DATA section raw instead of decoding parameters
    pub dont_parse_sd: bool,

    /// Per-connection idle deadline, rearmed after every frame (0 = none)
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,

    /// Filter hook: decides whether a message passes to the destination
    pub filter_func: String,

    /// Topic hook and template fallback
    pub topic_func: String,
    pub topic_tmpl: String,

    /// Partition-key hook and template fallback
    pub partition_func: String,
    pub partition_tmpl: String,

    /// Partition-number hook
    pub partition_number_func: String,
}

impl Default for SyslogConfig {
    fn default() -> Self {
        Self {
            conf_id: ConfId::nil(),
            protocol: "relp".into(),
            bind_addr: "127.0.0.1".into(),
            port: 2514,
            unix_socket_path: String::new(),
            format: Format::Auto,
            encoding: Encoding::Utf8,
            dont_parse_sd: false,
            timeout: Duration::from_secs(60),
            filter_func: String::new(),
            topic_func: String::new(),
            topic_tmpl: "rsyslog-{appname}".into(),
            partition_func: String::new(),
            partition_tmpl: "mypk-{hostname}".into(),
            partition_number_func: String::new(),
        }
    }
}

impl SyslogConfig {
    /// The `host:port` string to bind, for network endpoints
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind_addr, self.port)
    }

    /// Whether this endpoint listens on a unix socket
    pub fn is_unix(&self) -> bool {
        !self.unix_socket_path.is_empty()
    }
}

/// Kafka destination settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KafkaDestConfig {
    /// Bootstrap broker list
    pub brokers: Vec<String>,

    pub client_id: String,

    /// Producer-side delivery timeout
    #[serde(with = "humantime_serde")]
    pub delivery_timeout: Duration,

    /// librdkafka compression codec
    pub compression: String,
}

impl Default for KafkaDestConfig {
    fn default() -> Self {
        Self {
            brokers: vec!["127.0.0.1:9092".into()],
            client_id: "skewer".into(),
            delivery_timeout: Duration::from_secs(30),
            compression: "none".into(),
        }
    }
}

/// Everything a child worker needs, sent as one `conf` control message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BaseConfig {
    pub syslog: Vec<SyslogConfig>,
    pub kafka: KafkaDestConfig,

    /// Capacity of the raw-frame ring
    pub queue_size: usize,

    /// Maximum message size, also the pooled buffer capacity
    pub max_message_size: usize,

    /// RELP messages go straight to Kafka when true, through the store
    /// when false
    pub direct_relp: bool,
}

impl Default for BaseConfig {
    fn default() -> Self {
        Self {
            syslog: Vec::new(),
            kafka: KafkaDestConfig::default(),
            queue_size: 0,
            max_message_size: 0,
            direct_relp: true,
        }
    }
}

impl BaseConfig {
    /// Effective ring capacity (config may leave it at 0)
    pub fn effective_queue_size(&self) -> usize {
        if self.queue_size == 0 { 10000 } else { self.queue_size }
    }

    /// Effective maximum message size
    pub fn effective_max_message_size(&self) -> usize {
        if self.max_message_size == 0 {
            132000
        } else {
            self.max_message_size
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_serde_names() {
        assert_eq!(
            serde_json::to_string(&Format::LfDelimited).unwrap(),
            "\"lf-delimited\""
        );
        let f: Format = serde_json::from_str("\"rfc5424\"").unwrap();
        assert_eq!(f, Format::Rfc5424);
    }

    #[test]
    fn syslog_config_defaults() {
        let c = SyslogConfig::default();
        assert_eq!(c.format, Format::Auto);
        assert_eq!(c.timeout, Duration::from_secs(60));
        assert_eq!(c.listen_addr(), "127.0.0.1:2514");
        assert!(!c.is_unix());
    }

    #[test]
    fn base_config_effective_sizes() {
        let c = BaseConfig::default();
        assert_eq!(c.effective_queue_size(), 10000);
        assert_eq!(c.effective_max_message_size(), 132000);
    }

    #[test]
    fn config_roundtrips_through_json() {
        let mut c = BaseConfig::default();
        c.syslog.push(SyslogConfig {
            conf_id: ConfId::new(),
            protocol: "relp".into(),
            port: 1514,
            ..Default::default()
        });
        let json = serde_json::to_string(&c).unwrap();
        let back: BaseConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.syslog.len(), 1);
        assert_eq!(back.syslog[0].conf_id, c.syslog[0].conf_id);
        assert_eq!(back.syslog[0].port, 1514);
    }
}
