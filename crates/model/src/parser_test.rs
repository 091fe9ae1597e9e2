//! Tests for the syslog parsers

use chrono::{Datelike, Timelike};

use crate::config::{Encoding, Format};
use crate::parser::{ParseError, ParsersEnv};

fn parse(format: Format, text: &str) -> Result<crate::SyslogMessage, ParseError> {
    ParsersEnv::new().parse(format, text.as_bytes(), Encoding::Utf8, false)
}

#[test]
fn rfc3164_full_message() {
    let msg = parse(
        Format::Rfc3164,
        "<34>Oct 11 22:14:15 mymachine su[42]: 'su root' failed for lonvick on /dev/pts/8",
    )
    .unwrap();

    assert_eq!(msg.priority, 34);
    assert_eq!(msg.facility, 4);
    assert_eq!(msg.severity, 2);
    assert_eq!(msg.hostname, "mymachine");
    assert_eq!(msg.appname, "su");
    assert_eq!(msg.procid, "42");
    assert!(msg.message.starts_with("'su root' failed"));

    let ts = msg.time_reported.unwrap();
    assert_eq!(ts.month(), 10);
    assert_eq!(ts.day(), 11);
    assert_eq!(ts.hour(), 22);
}

#[test]
fn rfc3164_without_tag() {
    let msg = parse(Format::Rfc3164, "<13>Oct 11 22:14:15 x").unwrap();
    assert_eq!(msg.hostname, "x");
    assert!(msg.appname.is_empty());
    assert!(msg.message.is_empty());
    assert!(!msg.is_empty());
}

#[test]
fn rfc3164_without_timestamp_keeps_text_as_message() {
    let msg = parse(Format::Rfc3164, "<13>something went wrong").unwrap();
    assert!(msg.time_reported.is_none());
    assert_eq!(msg.message, "something went wrong");
}

#[test]
fn rfc3164_rejects_missing_priority() {
    assert!(matches!(
        parse(Format::Rfc3164, "Oct 11 22:14:15 host msg"),
        Err(ParseError::Priority)
    ));
}

#[test]
fn rfc5424_full_message() {
    let msg = parse(
        Format::Rfc5424,
        "<165>1 2003-10-11T22:14:15.003Z mymachine.example.com evntslog 1234 ID47 \
         [exampleSDID@32473 iut=\"3\" eventSource=\"Application\"] An application event",
    )
    .unwrap();

    assert_eq!(msg.priority, 165);
    assert_eq!(msg.version, 1);
    assert_eq!(msg.hostname, "mymachine.example.com");
    assert_eq!(msg.appname, "evntslog");
    assert_eq!(msg.procid, "1234");
    assert_eq!(msg.msgid, "ID47");
    assert_eq!(msg.message, "An application event");
    assert_eq!(
        msg.properties.get("exampleSDID@32473.eventSource").unwrap(),
        "Application"
    );
    assert_eq!(msg.time_reported.unwrap().minute(), 14);
}

#[test]
fn rfc5424_nil_fields() {
    let msg = parse(Format::Rfc5424, "<34>1 - - - - - -").unwrap();
    assert!(msg.hostname.is_empty());
    assert!(msg.appname.is_empty());
    assert!(msg.time_reported.is_none());
    assert!(msg.structured.is_empty());
}

#[test]
fn rfc5424_dont_parse_sd_keeps_raw_section() {
    let raw = "<34>1 - host app - - [a b=\"c\"] hello";
    let msg = ParsersEnv::new()
        .parse(Format::Rfc5424, raw.as_bytes(), Encoding::Utf8, true)
        .unwrap();
    assert_eq!(msg.structured, "[a b=\"c\"]");
    assert!(msg.properties.is_empty());
    assert_eq!(msg.message, "hello");
}

#[test]
fn rfc5424_escaped_quotes_in_sd() {
    let msg = parse(Format::Rfc5424, "<34>1 - h a - - [x p=\"va \\\"l\\\" ue\"] m").unwrap();
    assert_eq!(msg.properties.get("x.p").unwrap(), "va \"l\" ue");
    assert_eq!(msg.message, "m");
}

#[test]
fn auto_sniffs_both_formats() {
    let m5424 = parse(Format::Auto, "<34>1 - host app - - - modern").unwrap();
    assert_eq!(m5424.version, 1);

    let m3164 = parse(Format::Auto, "<34>Oct 11 22:14:15 host legacy").unwrap();
    assert_eq!(m3164.version, 0);
    assert_eq!(m3164.hostname, "host");
}

#[test]
fn json_format_roundtrip() {
    let msg = parse(
        Format::Json,
        r#"{"priority":13,"facility":1,"severity":5,"version":0,"hostname":"h","appname":"a","procid":"","msgid":"","structured":"","message":"from json"}"#,
    )
    .unwrap();
    assert_eq!(msg.message, "from json");
    assert_eq!(msg.hostname, "h");
    assert!(msg.time_generated.is_some());
}

#[test]
fn json_format_rejects_garbage() {
    assert!(matches!(
        parse(Format::Json, "not json at all"),
        Err(ParseError::Json(_))
    ));
}

#[test]
fn lf_delimited_is_opaque() {
    let msg = parse(Format::LfDelimited, "anything at all, <no> header").unwrap();
    assert_eq!(msg.message, "anything at all, <no> header");
    assert_eq!(msg.priority, 0);
}

#[test]
fn latin1_decoding() {
    let raw: &[u8] = b"<13>caf\xe9";
    let msg = ParsersEnv::new()
        .parse(Format::Rfc3164, raw, Encoding::Latin1, false)
        .unwrap();
    assert_eq!(msg.message, "café");
}

#[test]
fn invalid_utf8_is_an_error() {
    let raw: &[u8] = b"<13>caf\xe9";
    assert!(matches!(
        ParsersEnv::new().parse(Format::Rfc3164, raw, Encoding::Utf8, false),
        Err(ParseError::Utf8(_))
    ));
}

#[test]
fn priority_bounds() {
    assert!(parse(Format::Rfc3164, "<192>Oct 11 22:14:15 h m").is_err());
    assert!(parse(Format::Rfc3164, "<>Oct 11 22:14:15 h m").is_err());
    assert!(parse(Format::Rfc3164, "<1234>Oct 11 22:14:15 h m").is_err());
}
