//! Tests for the RELP frame codec

use bytes::BytesMut;
use tokio_util::codec::Decoder;

use crate::frame::{RelpCodec, RelpFrame, RelpFrameError};

fn codec() -> RelpCodec {
    RelpCodec::new(132000)
}

fn feed(codec: &mut RelpCodec, buf: &mut BytesMut, bytes: &[u8]) -> Option<RelpFrame> {
    buf.extend_from_slice(bytes);
    codec.decode(buf).unwrap()
}

#[test]
fn open_frame() {
    let mut codec = codec();
    let mut buf = BytesMut::new();
    let data = b"relp_version=0\nrelp_software=test\ncommands=syslog";
    let wire = format!("1 open {} {}\n", data.len(), String::from_utf8_lossy(data));

    let frame = feed(&mut codec, &mut buf, wire.as_bytes()).expect("complete frame");
    assert_eq!(frame.txnr, 1);
    assert_eq!(frame.command, "open");
    assert_eq!(&frame.data[..], &data[..]);
    assert!(buf.is_empty(), "frame fully consumed");
}

#[test]
fn zero_datalen_completes_at_first_lf() {
    let mut codec = codec();
    let mut buf = BytesMut::new();

    let frame = feed(&mut codec, &mut buf, b"3 close 0\n").expect("complete frame");
    assert_eq!(frame.txnr, 3);
    assert_eq!(frame.command, "close");
    assert!(frame.data.is_empty());
    assert!(buf.is_empty());
}

#[test]
fn waits_for_missing_header_tokens() {
    let mut codec = codec();
    let mut buf = BytesMut::new();

    assert!(feed(&mut codec, &mut buf, b"2 sys").is_none());
    assert!(feed(&mut codec, &mut buf, b"log 1").is_none());
    // datalen token is not terminated yet: could still grow
    assert!(feed(&mut codec, &mut buf, b"2").is_none());
    let frame = feed(&mut codec, &mut buf, b" test message\n").expect("complete");
    assert_eq!(frame.txnr, 2);
    assert_eq!(frame.command, "syslog");
    assert_eq!(&frame.data[..], b"test message");
}

#[test]
fn does_not_claim_frame_before_full_payload() {
    let mut codec = codec();
    let mut buf = BytesMut::new();

    // payload is 12 bytes; deliver exactly up to the boundary, no trailer
    assert!(feed(&mut codec, &mut buf, b"2 syslog 12 hello world!").is_none());
    // the trailing LF completes it
    let frame = feed(&mut codec, &mut buf, b"\n").expect("complete");
    assert_eq!(&frame.data[..], b"hello world!");
}

#[test]
fn leading_whitespace_is_trimmed() {
    let mut codec = codec();
    let mut buf = BytesMut::new();

    let frame = feed(&mut codec, &mut buf, b"\r\n  5 syslog 3 abc\n").expect("complete");
    assert_eq!(frame.txnr, 5);
    assert_eq!(&frame.data[..], b"abc");
}

#[test]
fn consecutive_frames_in_one_buffer() {
    let mut codec = codec();
    let mut buf = BytesMut::new();
    buf.extend_from_slice(b"1 syslog 3 one\n2 syslog 3 two\n");

    let first = codec.decode(&mut buf).unwrap().expect("first frame");
    assert_eq!(first.txnr, 1);
    assert_eq!(&first.data[..], b"one");

    let second = codec.decode(&mut buf).unwrap().expect("second frame");
    assert_eq!(second.txnr, 2);
    assert_eq!(&second.data[..], b"two");
    assert!(codec.decode(&mut buf).unwrap().is_none());
}

#[test]
fn non_numeric_txnr_is_a_framing_error() {
    let mut codec = codec();
    let mut buf = BytesMut::new();
    buf.extend_from_slice(b"abc syslog 3 foo\n");
    assert!(matches!(
        codec.decode(&mut buf),
        Err(RelpFrameError::BadTxnr)
    ));
}

#[test]
fn non_numeric_datalen_is_a_framing_error() {
    let mut codec = codec();
    let mut buf = BytesMut::new();
    buf.extend_from_slice(b"1 syslog many foo\n");
    assert!(matches!(
        codec.decode(&mut buf),
        Err(RelpFrameError::BadDatalen)
    ));
}

#[test]
fn oversized_datalen_is_rejected() {
    let mut codec = RelpCodec::new(64);
    let mut buf = BytesMut::new();
    buf.extend_from_slice(b"1 syslog 65 x\n");
    assert!(matches!(
        codec.decode(&mut buf),
        Err(RelpFrameError::TooLarge { size: 65, limit: 64 })
    ));
}

#[test]
fn splitter_inverts_the_framer() {
    // frame → bytes → frame is the identity on valid frames
    let mut codec = codec();
    let mut buf = BytesMut::new();

    for (txnr, command, data) in [
        (1u64, "open", &b"relp_version=0"[..]),
        (2, "syslog", b"<13>Oct 11 22:14:15 host app: hi"),
        (3, "syslog", b"x"),
        (4, "close", b""),
    ] {
        let wire = if data.is_empty() {
            format!("{txnr} {command} 0\n")
        } else {
            format!(
                "{txnr} {command} {} {}\n",
                data.len(),
                String::from_utf8_lossy(data)
            )
        };
        let frame = feed(&mut codec, &mut buf, wire.as_bytes()).expect("complete");
        assert_eq!(frame.txnr, txnr);
        assert_eq!(frame.command, command);
        assert_eq!(&frame.data[..], data);
    }
}
