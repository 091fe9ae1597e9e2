//! Tests for the binder server
//!
//! These drive the real control protocol over a socketpair, with real
//! sockets, the way a child worker does.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream, UdpSocket};

use crate::fd_channel::FdChannel;
use crate::server::BinderServer;

fn free_port() -> u16 {
    let probe = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = probe.local_addr().unwrap().port();
    drop(probe);
    port
}

#[test]
fn stream_listen_confirm_and_pass_connection() {
    let (parent, mut child) = FdChannel::pair().unwrap();
    let server = BinderServer::spawn(parent).unwrap();

    let port = free_port();
    let addr = format!("tcp:127.0.0.1:{port}");

    child.send(&format!("listen {addr}"), None).unwrap();
    let (line, fd) = child.recv_line().unwrap().unwrap();
    assert_eq!(line, format!("confirmlisten {addr}"));
    assert!(fd.is_none());

    // a client connect makes the binder pass the accepted fd over
    let mut remote = TcpStream::connect(("127.0.0.1", port)).unwrap();
    let (line, fd) = child.recv_line().unwrap().unwrap();
    let parts: Vec<&str> = line.split(' ').collect();
    assert_eq!(parts[0], "newconn");
    assert_eq!(parts[1].len(), 26, "connection uid should be a ulid");
    assert_eq!(parts[2], addr);

    // the passed fd is the accepted end of the client connection
    let mut conn = TcpStream::from(fd.expect("newconn must carry the fd"));
    remote.write_all(b"hello binder").unwrap();
    let mut buf = [0u8; 12];
    conn.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"hello binder");

    child.send(&format!("stoplisten {addr}"), None).unwrap();
    let (line, _) = child.recv_line().unwrap().unwrap();
    assert_eq!(line, format!("stopped {addr}"));

    // the listener is really gone
    assert!(TcpStream::connect(("127.0.0.1", port)).is_err());

    child.send("byebye", None).unwrap();
    server.join().unwrap();
}

#[test]
fn unix_listen_chmods_and_unlinks() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("binder.sock");
    let addr = format!("unix:{}", path.display());

    let (parent, mut child) = FdChannel::pair().unwrap();
    let server = BinderServer::spawn(parent).unwrap();

    child.send(&format!("listen {addr}"), None).unwrap();
    let (line, _) = child.recv_line().unwrap().unwrap();
    assert_eq!(line, format!("confirmlisten {addr}"));

    use std::os::unix::fs::PermissionsExt;
    let mode = std::fs::metadata(&path).unwrap().permissions().mode();
    assert_eq!(mode & 0o777, 0o777);

    child.send(&format!("stoplisten {addr}"), None).unwrap();
    let (line, _) = child.recv_line().unwrap().unwrap();
    assert_eq!(line, format!("stopped {addr}"));
    assert!(!path.exists(), "socket path should be unlinked");

    child.send("byebye", None).unwrap();
    server.join().unwrap();
}

#[test]
fn packet_socket_fd_arrives_immediately() {
    let (parent, mut child) = FdChannel::pair().unwrap();
    let server = BinderServer::spawn(parent).unwrap();

    child.send("listen udp:127.0.0.1:0", None).unwrap();
    let (line, fd) = child.recv_line().unwrap().unwrap();
    assert!(line.starts_with("newconn "));
    assert!(line.ends_with(" udp:127.0.0.1:0"));

    let socket = UdpSocket::from(fd.expect("packet newconn must carry the fd"));
    let bound = socket.local_addr().unwrap();

    let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
    sender.send_to(b"datagram", bound).unwrap();
    let mut buf = [0u8; 16];
    let (n, _) = socket.recv_from(&mut buf).unwrap();
    assert_eq!(&buf[..n], b"datagram");

    child.send("byebye", None).unwrap();
    server.join().unwrap();
}

#[test]
fn bind_failure_reports_error() {
    let (parent, mut child) = FdChannel::pair().unwrap();
    let server = BinderServer::spawn(parent).unwrap();

    // nothing resolvable to bind here
    child.send("listen tcp:999.999.999.999:1", None).unwrap();
    let (line, _) = child.recv_line().unwrap().unwrap();
    assert!(line.starts_with("error tcp:999.999.999.999:1 "));

    child.send("listen nonsense", None).unwrap();
    let (line, _) = child.recv_line().unwrap().unwrap();
    assert!(line.starts_with("error nonsense "));

    child.send("byebye", None).unwrap();
    server.join().unwrap();
}

#[test]
fn failing_one_listener_leaves_others_running() {
    let (parent, mut child) = FdChannel::pair().unwrap();
    let server = BinderServer::spawn(parent).unwrap();

    let port = free_port();
    let good = format!("tcp:127.0.0.1:{port}");
    child
        .send(&format!("listen bogus:addr {good}"), None)
        .unwrap();

    let (line, _) = child.recv_line().unwrap().unwrap();
    assert!(line.starts_with("error bogus:addr "));
    let (line, _) = child.recv_line().unwrap().unwrap();
    assert_eq!(line, format!("confirmlisten {good}"));

    // the good listener accepts despite its sibling failing
    let _conn = TcpStream::connect(("127.0.0.1", port)).unwrap();
    let (line, fd) = child.recv_line().unwrap().unwrap();
    assert!(line.starts_with("newconn "));
    assert!(fd.is_some());

    child.send("reset", None).unwrap();
    child.send("byebye", None).unwrap();
    server.join().unwrap();
}
