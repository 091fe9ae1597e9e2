//! Syslog parsers
//!
//! One parser per wire format (RFC 3164, RFC 5424, JSON, auto-sniffing,
//! LF-delimited opaque lines), selected per message by the configured
//! `Format`. Payload bytes are decoded according to the configured
//! `Encoding` before parsing.
//!
//! Parsers are deliberately tolerant: a missing timestamp or tag degrades to
//! empty fields rather than an error, because real-world 3164 traffic is
//! wildly inconsistent. Only structurally hopeless input is an error.

use chrono::{DateTime, Datelike, NaiveDate, Utc};

use crate::config::{Encoding, Format};
use crate::syslog::SyslogMessage;

/// Parse failure, counted per protocol/client/format by the caller
#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("payload is not valid UTF-8")]
    Utf8(#[from] std::str::Utf8Error),

    #[error("invalid priority header")]
    Priority,

    #[error("malformed {format} message: {reason}")]
    Malformed {
        format: Format,
        reason: &'static str,
    },

    #[error("invalid JSON payload: {0}")]
    Json(#[from] serde_json::Error),
}

/// Parser selection environment
///
/// Stateless today; it exists so services construct their parsing context
/// once per worker, mirroring how destinations cache filter environments.
#[derive(Debug, Default, Clone)]
pub struct ParsersEnv;

impl ParsersEnv {
    pub fn new() -> Self {
        Self
    }

    /// Decode and parse one raw payload
    pub fn parse(
        &self,
        format: Format,
        raw: &[u8],
        encoding: Encoding,
        dont_parse_sd: bool,
    ) -> Result<SyslogMessage, ParseError> {
        let text = decode(raw, encoding)?;
        let text = text.trim_matches(['\u{feff}', ' ', '\r', '\n']);

        match format {
            Format::Rfc3164 => parse_rfc3164(text),
            Format::Rfc5424 => parse_rfc5424(text, dont_parse_sd),
            Format::Json => parse_json(text),
            Format::Auto => {
                if looks_like_rfc5424(text) {
                    parse_rfc5424(text, dont_parse_sd)
                } else {
                    parse_rfc3164(text)
                }
            }
            Format::LfDelimited => Ok(parse_opaque(text)),
        }
    }
}

fn decode(raw: &[u8], encoding: Encoding) -> Result<String, ParseError> {
    match encoding {
        Encoding::Utf8 => Ok(std::str::from_utf8(raw)?.to_owned()),
        // latin1 maps each byte to the identically numbered codepoint
        Encoding::Latin1 => Ok(raw.iter().map(|&b| b as char).collect()),
    }
}

/// `<PRI>` header; at most 3 digits, value ≤ 191
fn parse_priority(text: &str) -> Result<(u8, &str), ParseError> {
    let rest = text.strip_prefix('<').ok_or(ParseError::Priority)?;
    let end = rest.find('>').ok_or(ParseError::Priority)?;
    if end == 0 || end > 3 {
        return Err(ParseError::Priority);
    }
    let pri: u8 = rest[..end].parse().map_err(|_| ParseError::Priority)?;
    if pri > 191 {
        return Err(ParseError::Priority);
    }
    Ok((pri, &rest[end + 1..]))
}

fn looks_like_rfc5424(text: &str) -> bool {
    // after the priority, RFC 5424 always carries "1 "
    let Ok((_, rest)) = parse_priority(text) else {
        return false;
    };
    rest.starts_with("1 ")
}

fn parse_rfc3164(text: &str) -> Result<SyslogMessage, ParseError> {
    let (pri, rest) = parse_priority(text)?;

    let mut msg = SyslogMessage {
        time_generated: Some(Utc::now()),
        ..Default::default()
    };
    msg.set_priority(pri);

    let mut tokens = rest.split_whitespace();
    let (month, day, time) = match (tokens.next(), tokens.next(), tokens.next()) {
        (Some(m), Some(d), Some(t)) => (m, d, t),
        // too short for a header: everything is message text
        _ => {
            msg.message = rest.trim().to_owned();
            return Ok(msg);
        }
    };

    match parse_bsd_timestamp(month, day, time) {
        Some(ts) => {
            msg.time_reported = Some(ts);
            msg.hostname = tokens.next().unwrap_or_default().to_owned();
            let content = tokens.collect::<Vec<_>>().join(" ");
            let (appname, procid, message) = split_tag(&content);
            msg.appname = appname;
            msg.procid = procid;
            msg.message = message;
        }
        // no timestamp: RFC 3164 says to keep the whole thing as message
        None => msg.message = rest.trim().to_owned(),
    }

    Ok(msg)
}

/// `Mmm dd hh:mm:ss`, year taken from the receiving clock
fn parse_bsd_timestamp(month: &str, day: &str, time: &str) -> Option<DateTime<Utc>> {
    let month = match month {
        "Jan" => 1,
        "Feb" => 2,
        "Mar" => 3,
        "Apr" => 4,
        "May" => 5,
        "Jun" => 6,
        "Jul" => 7,
        "Aug" => 8,
        "Sep" => 9,
        "Oct" => 10,
        "Nov" => 11,
        "Dec" => 12,
        _ => return None,
    };
    let day: u32 = day.parse().ok()?;
    let mut parts = time.split(':');
    let hour: u32 = parts.next()?.parse().ok()?;
    let min: u32 = parts.next()?.parse().ok()?;
    let sec: u32 = parts.next()?.parse().ok()?;

    let date = NaiveDate::from_ymd_opt(Utc::now().year(), month, day)?;
    let dt = date.and_hms_opt(hour, min, sec)?;
    Some(DateTime::from_naive_utc_and_offset(dt, Utc))
}

/// `TAG[pid]: message` → (appname, procid, message)
fn split_tag(content: &str) -> (String, String, String) {
    // the tag is at most 32 chars and never contains a space
    let tag_end = content
        .find(|c: char| c == ':' || c == ' ')
        .unwrap_or(content.len());
    if tag_end == 0 || tag_end > 32 || !content[tag_end..].starts_with(':') {
        return (String::new(), String::new(), content.trim().to_owned());
    }

    let tag = &content[..tag_end];
    let message = content[tag_end + 1..].trim().to_owned();
    match tag.find('[') {
        Some(open) if tag.ends_with(']') => (
            tag[..open].to_owned(),
            tag[open + 1..tag.len() - 1].to_owned(),
            message,
        ),
        _ => (tag.to_owned(), String::new(), message),
    }
}

fn malformed(reason: &'static str) -> ParseError {
    ParseError::Malformed {
        format: Format::Rfc5424,
        reason,
    }
}

fn parse_rfc5424(text: &str, dont_parse_sd: bool) -> Result<SyslogMessage, ParseError> {
    let (pri, rest) = parse_priority(text)?;
    let rest = rest
        .strip_prefix("1 ")
        .ok_or_else(|| malformed("unsupported version"))?;

    let mut msg = SyslogMessage {
        version: 1,
        time_generated: Some(Utc::now()),
        ..Default::default()
    };
    msg.set_priority(pri);

    let mut tokens = rest.splitn(6, ' ');
    let timestamp = tokens.next().ok_or_else(|| malformed("missing timestamp"))?;
    if timestamp != "-" {
        msg.time_reported = Some(
            DateTime::parse_from_rfc3339(timestamp)
                .map_err(|_| malformed("bad timestamp"))?
                .with_timezone(&Utc),
        );
    }
    msg.hostname = nil_token(tokens.next().ok_or_else(|| malformed("missing hostname"))?);
    msg.appname = nil_token(tokens.next().ok_or_else(|| malformed("missing appname"))?);
    msg.procid = nil_token(tokens.next().ok_or_else(|| malformed("missing procid"))?);
    msg.msgid = nil_token(tokens.next().ok_or_else(|| malformed("missing msgid"))?);

    let rest = tokens.next().unwrap_or("");
    let (sd, message) =
        split_structured_data(rest).ok_or_else(|| malformed("bad structured data"))?;
    if sd != "-" {
        msg.structured = sd.to_owned();
        if !dont_parse_sd {
            parse_sd_params(sd, &mut msg);
        }
    }
    let message = message.trim_start();
    msg.message = message.strip_prefix('\u{feff}').unwrap_or(message).to_owned();

    Ok(msg)
}

fn nil_token(token: &str) -> String {
    if token == "-" { String::new() } else { token.to_owned() }
}

/// Split `STRUCTURED-DATA (SP MSG)?`, honouring quotes and escapes inside
/// SD-ELEMENT brackets
fn split_structured_data(rest: &str) -> Option<(&str, &str)> {
    if rest.is_empty() || rest == "-" {
        return Some(("-", ""));
    }
    if let Some(stripped) = rest.strip_prefix("- ") {
        return Some(("-", stripped));
    }
    if !rest.starts_with('[') {
        return None;
    }

    let bytes = rest.as_bytes();
    let mut i = 0;
    let mut in_quotes = false;
    let mut escaped = false;
    let mut depth = 0usize;
    while i < bytes.len() {
        let b = bytes[i];
        if escaped {
            escaped = false;
        } else if in_quotes {
            match b {
                b'\\' => escaped = true,
                b'"' => in_quotes = false,
                _ => {}
            }
        } else {
            match b {
                b'"' => in_quotes = true,
                b'[' => depth += 1,
                b']' => {
                    depth -= 1;
                    // end of the SD section unless another element follows
                    if depth == 0 && i + 1 < bytes.len() && bytes[i + 1] != b'[' {
                        return Some((&rest[..=i], &rest[i + 1..]));
                    }
                }
                _ => {}
            }
        }
        i += 1;
    }
    if depth == 0 { Some((rest, "")) } else { None }
}

/// Flatten SD parameters as `sdid.param` properties
fn parse_sd_params(sd: &str, msg: &mut SyslogMessage) {
    for element in sd.split_inclusive(']') {
        let Some(inner) = element
            .trim_start_matches('[')
            .strip_suffix(']')
        else {
            continue;
        };
        let mut parts = inner.splitn(2, ' ');
        let Some(sdid) = parts.next() else { continue };
        let Some(params) = parts.next() else { continue };

        let mut rest = params;
        while let Some(eq) = rest.find('=') {
            let name = rest[..eq].trim().to_owned();
            let after = &rest[eq + 1..];
            let Some(stripped) = after.strip_prefix('"') else { break };
            let Some(end) = find_unescaped_quote(stripped) else { break };
            let value = stripped[..end].replace("\\\"", "\"").replace("\\\\", "\\");
            msg.properties.insert(format!("{sdid}.{name}"), value);
            rest = stripped[end + 1..].trim_start();
        }
    }
}

fn find_unescaped_quote(s: &str) -> Option<usize> {
    let bytes = s.as_bytes();
    let mut escaped = false;
    for (i, &b) in bytes.iter().enumerate() {
        if escaped {
            escaped = false;
        } else if b == b'\\' {
            escaped = true;
        } else if b == b'"' {
            return Some(i);
        }
    }
    None
}

fn parse_json(text: &str) -> Result<SyslogMessage, ParseError> {
    let mut msg: SyslogMessage = serde_json::from_str(text)?;
    if msg.time_generated.is_none() {
        msg.time_generated = Some(Utc::now());
    }
    Ok(msg)
}

fn parse_opaque(text: &str) -> SyslogMessage {
    SyslogMessage {
        time_generated: Some(Utc::now()),
        message: text.trim().to_owned(),
        ..Default::default()
    }
}

#[cfg(test)]
#[path = "parser_test.rs"]
mod parser_test;
