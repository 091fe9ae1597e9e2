//! Tests for the TCP syslog service

use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio_util::codec::Decoder;

use skewer_model::{Format, StashError, Stasher, SyslogConfig, TcpUdpParsedMessage};

use crate::tcp::{TcpCodec, TcpFrameError, TcpService};

#[derive(Default)]
struct RecordingStasher {
    stashed: std::sync::Mutex<Vec<TcpUdpParsedMessage>>,
}

impl Stasher for RecordingStasher {
    fn stash(&self, msg: TcpUdpParsedMessage) -> Result<(), StashError> {
        self.stashed.lock().unwrap().push(msg);
        Ok(())
    }
}

#[test]
fn lf_framing_for_priority_headers() {
    let mut codec = TcpCodec::new(Format::Auto, 8192);
    let mut buf = BytesMut::from(&b"<13>Oct 11 22:14:15 host one\n<14>two\n"[..]);

    let first = codec.decode(&mut buf).unwrap().unwrap();
    assert_eq!(&first[..], b"<13>Oct 11 22:14:15 host one");
    let second = codec.decode(&mut buf).unwrap().unwrap();
    assert_eq!(&second[..], b"<14>two");
    assert!(codec.decode(&mut buf).unwrap().is_none());
}

#[test]
fn octet_counting_framing() {
    let mut codec = TcpCodec::new(Format::Auto, 8192);
    let mut buf = BytesMut::from(&b"8 <13>msg1"[..]);

    let frame = codec.decode(&mut buf).unwrap().unwrap();
    assert_eq!(&frame[..], b"<13>msg1");

    // partial payload: wait for the rest
    buf.extend_from_slice(b"10 <13>ab");
    assert!(codec.decode(&mut buf).unwrap().is_none());
    buf.extend_from_slice(b"cdefg");
    let frame = codec.decode(&mut buf).unwrap().unwrap();
    assert_eq!(&frame[..], b"<13>abcdefg");
}

#[test]
fn lf_delimited_format_never_octet_counts() {
    let mut codec = TcpCodec::new(Format::LfDelimited, 8192);
    let mut buf = BytesMut::from(&b"12 this is not a count\n"[..]);
    let frame = codec.decode(&mut buf).unwrap().unwrap();
    assert_eq!(&frame[..], b"12 this is not a count");
}

#[test]
fn bad_octet_count_is_an_error() {
    let mut codec = TcpCodec::new(Format::Auto, 8192);
    let mut buf = BytesMut::from(&b"nonsense framing\n"[..]);
    assert!(matches!(
        codec.decode(&mut buf),
        Err(TcpFrameError::BadCount)
    ));
}

#[test]
fn oversized_frames_are_rejected() {
    let mut codec = TcpCodec::new(Format::Auto, 16);
    let mut buf = BytesMut::from(&b"900 x"[..]);
    assert!(matches!(
        codec.decode(&mut buf),
        Err(TcpFrameError::TooLarge { size: 900, .. })
    ));
}

#[tokio::test]
async fn messages_are_parsed_and_stashed() {
    let stasher = Arc::new(RecordingStasher::default());
    let service = TcpService::new(stasher.clone(), None, 8192);
    service.set_conf(&[SyslogConfig {
        protocol: "tcp".into(),
        bind_addr: "127.0.0.1".into(),
        port: 0,
        format: Format::Auto,
        timeout: Duration::from_secs(5),
        ..Default::default()
    }]);

    let infos = service.start().await;
    assert_eq!(infos.len(), 1);
    let port = infos[0].port;

    let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    stream
        .write_all(b"<34>Oct 11 22:14:15 mymachine su: 'su root' failed\n")
        .await
        .unwrap();
    stream.flush().await.unwrap();
    drop(stream);

    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            if !stasher.stashed.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("message should be stashed");

    let stashed = stasher.stashed.lock().unwrap();
    assert_eq!(stashed[0].parsed.fields.hostname, "mymachine");
    assert_eq!(stashed[0].parsed.fields.appname, "su");
    assert!(stashed[0].uid.is_some(), "store path must carry a uid");
    drop(stashed);

    assert_eq!(service.metrics_snapshot().incoming_messages, 1);
    service.stop().await;
}
