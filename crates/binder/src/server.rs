//! Binder server
//!
//! One server instance runs per child worker, on the supervisor side of the
//! child's control socketpair. It owns every privileged listener and every
//! accepted-but-passed connection for that child, keyed by ULID, so a child
//! can ask for any of them to be closed later. Closing is idempotent.

use std::collections::HashMap;
use std::net::TcpListener;
use std::os::fd::{AsFd, AsRawFd, RawFd};
use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::{UnixDatagram, UnixListener};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;

use parking_lot::Mutex;
use ulid::Ulid;

use crate::fd_channel::{FdChannel, FdSender};
use crate::{is_packet_net, is_stream_net, split_addr};

/// Privileged bind-and-pass service for one child worker
pub struct BinderServer;

/// A connection or packet socket retained after its fd was passed
enum Held {
    Tcp(std::net::TcpStream),
    Unix(std::os::unix::net::UnixStream),
    Udp(std::net::UdpSocket),
    Unixgram(UnixDatagram, Option<PathBuf>),
}

struct ListenerHandle {
    fd: RawFd,
    stopping: Arc<AtomicBool>,
    unlink: Option<PathBuf>,
    thread: JoinHandle<()>,
}

type ConnMap = Arc<Mutex<HashMap<String, Held>>>;

impl BinderServer {
    /// Serve one child on a dedicated thread. Failing to spawn the thread
    /// only loses this child's binder channel, never the daemon.
    pub fn spawn(channel: FdChannel) -> std::io::Result<JoinHandle<()>> {
        std::thread::Builder::new()
            .name("binder".into())
            .spawn(move || Self::run(channel))
    }

    /// Serve until the child says `byebye` or its end of the channel closes
    pub fn run(mut channel: FdChannel) {
        let sender = match channel.sender() {
            Ok(s) => Arc::new(Mutex::new(s)),
            Err(e) => {
                tracing::error!(error = %e, "binder channel unusable");
                return;
            }
        };

        let conns: ConnMap = Arc::new(Mutex::new(HashMap::new()));
        let mut listeners: HashMap<String, ListenerHandle> = HashMap::new();

        loop {
            let line = match channel.recv_line() {
                Ok(Some((line, _fd))) => line,
                Ok(None) => break,
                Err(e) => {
                    tracing::debug!(error = %e, "binder channel read error");
                    break;
                }
            };

            let (command, args) = line.split_once(' ').unwrap_or((line.as_str(), ""));
            tracing::debug!(command, args, "binder request");

            match command {
                "listen" => {
                    for addr in args.split_whitespace() {
                        handle_listen(addr, &sender, &conns, &mut listeners);
                    }
                }
                "closeconn" => close_conn(&conns, args),
                "stoplisten" => {
                    if let Some(handle) = listeners.remove(args) {
                        stop_listener(handle);
                    }
                    send_reply(&sender, &format!("stopped {args}"));
                }
                "reset" => {
                    for (_, handle) in listeners.drain() {
                        stop_listener(handle);
                    }
                    close_all(&conns);
                }
                "byebye" => break,
                _ => tracing::warn!(command, "unknown binder command"),
            }
        }

        for (_, handle) in listeners.drain() {
            stop_listener(handle);
        }
        close_all(&conns);
        tracing::debug!("binder handler finished");
    }
}

fn send_reply(sender: &Arc<Mutex<FdSender>>, text: &str) {
    if let Err(e) = sender.lock().send(text, None) {
        tracing::warn!(error = %e, "binder reply failed");
    }
}

fn handle_listen(
    addr: &str,
    sender: &Arc<Mutex<FdSender>>,
    conns: &ConnMap,
    listeners: &mut HashMap<String, ListenerHandle>,
) {
    let Some((net, spec)) = split_addr(addr) else {
        send_reply(sender, &format!("error {addr} malformed address"));
        return;
    };

    if is_stream_net(net) {
        match bind_stream(net, spec)
            .and_then(|(listener, unlink)| {
                spawn_accept_loop(addr.to_owned(), listener, unlink, sender, conns)
            }) {
            Ok(handle) => {
                send_reply(sender, &format!("confirmlisten {addr}"));
                listeners.insert(addr.to_owned(), handle);
            }
            Err(e) => {
                tracing::warn!(addr, error = %e, "binder listen error");
                send_reply(sender, &format!("error {addr} {e}"));
            }
        }
    } else if is_packet_net(net) {
        match bind_packet(net, spec) {
            Ok(held) => {
                let uid = Ulid::new().to_string();
                let fd = match &held {
                    Held::Udp(s) => s.as_raw_fd(),
                    Held::Unixgram(s, _) => s.as_raw_fd(),
                    _ => unreachable!(),
                };
                let borrowed = unsafe { std::os::fd::BorrowedFd::borrow_raw(fd) };
                tracing::debug!(uid, addr, "passing packet socket to child");
                if let Err(e) = sender
                    .lock()
                    .send(&format!("newconn {uid} {addr}"), Some(borrowed))
                {
                    tracing::warn!(addr, error = %e, "failed to pass packet socket");
                } else {
                    conns.lock().insert(uid, held);
                }
            }
            Err(e) => {
                tracing::warn!(addr, error = %e, "binder packet bind error");
                send_reply(sender, &format!("error {addr} {e}"));
            }
        }
    } else {
        send_reply(sender, &format!("error {addr} unsupported network {net}"));
    }
}

enum StreamListenerSocket {
    Tcp(TcpListener),
    Unix(UnixListener),
}

fn bind_stream(
    net: &str,
    spec: &str,
) -> std::io::Result<(StreamListenerSocket, Option<PathBuf>)> {
    match net {
        "unix" | "unixpacket" => {
            let listener = UnixListener::bind(spec)?;
            let _ = std::fs::set_permissions(spec, std::fs::Permissions::from_mode(0o777));
            Ok((StreamListenerSocket::Unix(listener), Some(spec.into())))
        }
        _ => Ok((StreamListenerSocket::Tcp(TcpListener::bind(spec)?), None)),
    }
}

fn bind_packet(net: &str, spec: &str) -> std::io::Result<Held> {
    match net {
        "unixgram" => {
            let socket = UnixDatagram::bind(spec)?;
            let _ = std::fs::set_permissions(spec, std::fs::Permissions::from_mode(0o777));
            let sref = socket2::SockRef::from(&socket);
            let _ = sref.set_recv_buffer_size(65536);
            let _ = sref.set_send_buffer_size(65536);
            Ok(Held::Unixgram(socket, Some(spec.into())))
        }
        _ => {
            let socket = std::net::UdpSocket::bind(spec)?;
            let sref = socket2::SockRef::from(&socket);
            let _ = sref.set_recv_buffer_size(65535);
            let _ = sref.set_send_buffer_size(65535);
            Ok(Held::Udp(socket))
        }
    }
}

fn spawn_accept_loop(
    addr: String,
    listener: StreamListenerSocket,
    unlink: Option<PathBuf>,
    sender: &Arc<Mutex<FdSender>>,
    conns: &ConnMap,
) -> std::io::Result<ListenerHandle> {
    let fd = match &listener {
        StreamListenerSocket::Tcp(l) => l.as_raw_fd(),
        StreamListenerSocket::Unix(l) => l.as_raw_fd(),
    };
    let stopping = Arc::new(AtomicBool::new(false));
    let sender = Arc::clone(sender);
    let conns = Arc::clone(conns);
    let flag = Arc::clone(&stopping);
    let taddr = addr.clone();

    let spawned = std::thread::Builder::new()
        .name(format!("binder-accept {addr}"))
        .spawn(move || {
            loop {
                let held = match &listener {
                    StreamListenerSocket::Tcp(l) => l.accept().map(|(s, _)| Held::Tcp(s)),
                    StreamListenerSocket::Unix(l) => l.accept().map(|(s, _)| Held::Unix(s)),
                };
                match held {
                    Ok(held) => {
                        let uid = Ulid::new().to_string();
                        let fd = match &held {
                            Held::Tcp(s) => s.as_fd().as_raw_fd(),
                            Held::Unix(s) => s.as_fd().as_raw_fd(),
                            _ => unreachable!(),
                        };
                        let borrowed = unsafe { std::os::fd::BorrowedFd::borrow_raw(fd) };
                        tracing::debug!(uid, addr = %taddr, "new accepted connection");
                        if let Err(e) = sender
                            .lock()
                            .send(&format!("newconn {uid} {taddr}"), Some(borrowed))
                        {
                            tracing::warn!(error = %e, "failed to pass connection to child");
                        } else {
                            conns.lock().insert(uid, held);
                        }
                    }
                    Err(e) => {
                        // an accept error ends this listener only
                        if !flag.load(Ordering::Relaxed) {
                            tracing::warn!(addr = %taddr, error = %e, "accept error");
                        }
                        break;
                    }
                }
            }
        });
    let thread = match spawned {
        Ok(thread) => thread,
        Err(e) => {
            // the dropped closure closed the listener; its path remains
            if let Some(path) = unlink {
                let _ = std::fs::remove_file(path);
            }
            return Err(e);
        }
    };

    Ok(ListenerHandle {
        fd,
        stopping,
        unlink,
        thread,
    })
}

fn stop_listener(handle: ListenerHandle) {
    handle.stopping.store(true, Ordering::Relaxed);
    // unblocks the accept thread, which owns the actual close
    let _ = nix::sys::socket::shutdown(handle.fd, nix::sys::socket::Shutdown::Both);
    let _ = handle.thread.join();
    if let Some(path) = handle.unlink {
        let _ = std::fs::remove_file(path);
    }
}

fn close_conn(conns: &ConnMap, uid: &str) {
    if let Some(held) = conns.lock().remove(uid)
        && let Held::Unixgram(_, Some(path)) = &held
    {
        let _ = std::fs::remove_file(path);
    }
}

fn close_all(conns: &ConnMap) {
    for (_, held) in conns.lock().drain() {
        if let Held::Unixgram(_, Some(path)) = &held {
            let _ = std::fs::remove_file(path);
        }
    }
}

#[cfg(test)]
#[path = "server_test.rs"]
mod server_test;
