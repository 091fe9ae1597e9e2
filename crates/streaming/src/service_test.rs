//! Tests for the streaming service base

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UnixStream};
use tokio_util::sync::CancellationToken;

use skewer_model::SyslogConfig;

use crate::pool::BufferPool;
use crate::service::{Connection, StreamHandler, StreamingService};

/// Writes every byte back, until shutdown or EOF
struct EchoHandler;

impl StreamHandler for EchoHandler {
    fn handle(
        self: Arc<Self>,
        conn: Connection,
        _config: Arc<SyslogConfig>,
        shutdown: CancellationToken,
    ) -> impl Future<Output = ()> + Send {
        async move {
            let (mut reader, mut writer) = tokio::io::split(conn.stream);
            tokio::select! {
                _ = shutdown.cancelled() => {}
                _ = tokio::io::copy(&mut reader, &mut writer) => {}
            }
        }
    }
}

fn service(configs: &[SyslogConfig]) -> StreamingService<EchoHandler> {
    let pool = Arc::new(BufferPool::new(4, 1024));
    let metrics = Arc::new(crate::status::ServiceMetrics::new());
    let svc = StreamingService::new("tcp", Arc::new(EchoHandler), None, pool, metrics);
    svc.set_conf(configs);
    svc
}

#[test]
fn set_conf_keeps_matching_protocols_only() {
    let svc = service(&[
        SyslogConfig {
            protocol: "tcp".into(),
            ..Default::default()
        },
        SyslogConfig {
            protocol: "relp".into(),
            ..Default::default()
        },
    ]);
    assert_eq!(svc.configs().len(), 1);
    assert_eq!(svc.configs()[0].protocol, "tcp");
}

#[tokio::test]
async fn tcp_listener_accepts_and_handles() {
    let svc = service(&[SyslogConfig {
        protocol: "tcp".into(),
        bind_addr: "127.0.0.1".into(),
        port: 0,
        ..Default::default()
    }]);

    let infos = svc.init_listeners().await;
    assert_eq!(infos.len(), 1);
    let port = infos[0].port;
    assert_ne!(port, 0, "info should carry the real bound port");
    svc.listen();

    let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    stream.write_all(b"round trip").await.unwrap();
    let mut buf = [0u8; 10];
    stream.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"round trip");
    drop(stream);

    tokio::time::timeout(Duration::from_secs(2), svc.reset_listeners())
        .await
        .expect("reset should complete");

    assert_eq!(svc.metrics().snapshot().connections_total, 1);
    assert!(TcpStream::connect(("127.0.0.1", port)).await.is_err());
}

#[tokio::test]
async fn unix_listener_roundtrip_and_unlink() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("stream.sock");

    let pool = Arc::new(BufferPool::new(4, 1024));
    let metrics = Arc::new(crate::status::ServiceMetrics::new());
    let svc = StreamingService::new("tcp", Arc::new(EchoHandler), None, pool, metrics);
    svc.set_conf(&[SyslogConfig {
        protocol: "tcp".into(),
        unix_socket_path: path.display().to_string(),
        ..Default::default()
    }]);

    let infos = svc.init_listeners().await;
    assert_eq!(infos.len(), 1);
    assert_eq!(infos[0].unix_socket_path, path.display().to_string());
    svc.listen();

    let mut stream = UnixStream::connect(&path).await.unwrap();
    stream.write_all(b"over unix").await.unwrap();
    let mut buf = [0u8; 9];
    stream.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"over unix");
    drop(stream);

    tokio::time::timeout(Duration::from_secs(2), svc.reset_listeners())
        .await
        .expect("reset should complete");
    assert!(!path.exists(), "socket path should be unlinked on reset");
}

#[tokio::test]
async fn bind_failures_skip_listener_but_keep_others() {
    let svc = service(&[
        SyslogConfig {
            protocol: "tcp".into(),
            bind_addr: "203.0.113.7".into(), // TEST-NET, not routable here
            port: 1,
            ..Default::default()
        },
        SyslogConfig {
            protocol: "tcp".into(),
            bind_addr: "127.0.0.1".into(),
            port: 0,
            ..Default::default()
        },
    ]);

    let infos = svc.init_listeners().await;
    assert_eq!(infos.len(), 1);
    assert_eq!(infos[0].bind_addr, "127.0.0.1");
    svc.reset_listeners().await;
}

#[tokio::test]
async fn reset_terminates_open_connections() {
    let svc = Arc::new(service(&[SyslogConfig {
        protocol: "tcp".into(),
        bind_addr: "127.0.0.1".into(),
        port: 0,
        ..Default::default()
    }]));

    let infos = svc.init_listeners().await;
    let port = infos[0].port;
    svc.listen();

    let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    stream.write_all(b"x").await.unwrap();
    let mut buf = [0u8; 1];
    stream.read_exact(&mut buf).await.unwrap();

    // reset while the connection is open: handler must observe shutdown
    tokio::time::timeout(Duration::from_secs(2), svc.reset_listeners())
        .await
        .expect("reset must not hang on live connections");

    // the peer sees EOF shortly after
    let n = tokio::time::timeout(Duration::from_secs(2), stream.read(&mut buf))
        .await
        .expect("peer should see the close")
        .unwrap();
    assert_eq!(n, 0);
}
