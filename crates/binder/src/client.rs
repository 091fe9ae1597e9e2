//! Binder client
//!
//! The child-side view of the binder channel. Children ask the privileged
//! parent to bind addresses they cannot bind themselves, then receive
//! accepted connections (or packet sockets) as file descriptors tagged with
//! ULIDs. A dedicated reader thread demultiplexes the channel into per-call
//! wakeups and per-listener connection queues, so the rest of the client is
//! async-friendly.

use std::collections::HashMap;
use std::os::fd::OwnedFd;
use std::os::unix::net::UnixStream;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};

use crate::fd_channel::{FdChannel, FdSender};
use crate::{BINDER_FD, HAS_BINDER_ENV};

#[derive(Debug, thiserror::Error)]
pub enum BinderError {
    /// The binder refused the request (`error ADDR MESSAGE`)
    #[error("binder refused {addr}: {message}")]
    Refused { addr: String, message: String },

    #[error("binder channel closed")]
    ChannelClosed,

    #[error("binder i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Accepted connections for one address the binder listens on
pub struct BinderListener {
    addr: String,
    rx: mpsc::UnboundedReceiver<(String, OwnedFd)>,
    client: Arc<BinderClient>,
}

impl BinderListener {
    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Next accepted connection: its binder UID and its descriptor.
    /// `None` once the binder is gone.
    pub async fn accept(&mut self) -> Option<(String, OwnedFd)> {
        self.rx.recv().await
    }
}

impl Drop for BinderListener {
    fn drop(&mut self) {
        self.client.send_line(&format!("stoplisten {}", self.addr));
        self.client.state.stream_conns.lock().remove(&self.addr);
    }
}

#[derive(Default)]
struct ClientState {
    /// listen confirmations, keyed by address
    pending_listen: Mutex<HashMap<String, oneshot::Sender<Result<(), BinderError>>>>,
    /// newconn routing for stream listeners, keyed by address
    stream_conns: Mutex<HashMap<String, mpsc::UnboundedSender<(String, OwnedFd)>>>,
    /// one-shot newconn routing for packet sockets, keyed by address
    packet_waiters: Mutex<HashMap<String, oneshot::Sender<OwnedFd>>>,
}

/// Client side of the binder control channel
pub struct BinderClient {
    sender: Mutex<FdSender>,
    state: Arc<ClientState>,
}

impl BinderClient {
    /// Wrap the channel inherited from the supervisor, if any
    pub fn from_env() -> std::io::Result<Option<Arc<BinderClient>>> {
        if std::env::var_os(HAS_BINDER_ENV).is_none() {
            return Ok(None);
        }
        let channel = unsafe { FdChannel::from_raw_fd(BINDER_FD) };
        Ok(Some(Self::start(channel)?))
    }

    pub fn new(stream: UnixStream) -> std::io::Result<Arc<BinderClient>> {
        Self::start(FdChannel::from_stream(stream))
    }

    fn start(mut channel: FdChannel) -> std::io::Result<Arc<BinderClient>> {
        let sender = channel.sender()?;
        let state = Arc::new(ClientState::default());
        let client = Arc::new(BinderClient {
            sender: Mutex::new(sender),
            state: Arc::clone(&state),
        });

        std::thread::Builder::new()
            .name("binder-client".into())
            .spawn(move || reader_loop(&mut channel, &state))?;

        Ok(client)
    }

    /// Ask the binder to listen on a stream address (`tcp:...`, `unix:...`)
    pub async fn listen_stream(
        self: &Arc<Self>,
        addr: &str,
    ) -> Result<BinderListener, BinderError> {
        let (confirm_tx, confirm_rx) = oneshot::channel();
        let (conn_tx, conn_rx) = mpsc::unbounded_channel();
        self.state
            .pending_listen
            .lock()
            .insert(addr.to_owned(), confirm_tx);
        self.state
            .stream_conns
            .lock()
            .insert(addr.to_owned(), conn_tx);

        self.send_line(&format!("listen {addr}"));

        match confirm_rx.await {
            Ok(Ok(())) => Ok(BinderListener {
                addr: addr.to_owned(),
                rx: conn_rx,
                client: Arc::clone(self),
            }),
            Ok(Err(e)) => {
                self.state.stream_conns.lock().remove(addr);
                Err(e)
            }
            Err(_) => {
                self.state.stream_conns.lock().remove(addr);
                Err(BinderError::ChannelClosed)
            }
        }
    }

    /// Ask the binder for a bound packet socket (`udp:...`, `unixgram:...`)
    pub async fn listen_packet(self: &Arc<Self>, addr: &str) -> Result<OwnedFd, BinderError> {
        let (confirm_tx, confirm_rx) = oneshot::channel();
        let (fd_tx, fd_rx) = oneshot::channel();
        self.state
            .pending_listen
            .lock()
            .insert(addr.to_owned(), confirm_tx);
        self.state.packet_waiters.lock().insert(addr.to_owned(), fd_tx);

        self.send_line(&format!("listen {addr}"));

        tokio::select! {
            fd = fd_rx => {
                self.state.pending_listen.lock().remove(addr);
                fd.map_err(|_| BinderError::ChannelClosed)
            }
            confirm = confirm_rx => {
                self.state.packet_waiters.lock().remove(addr);
                match confirm {
                    // packet sockets answer with the fd, not a confirmation
                    Ok(Ok(())) => Err(BinderError::ChannelClosed),
                    Ok(Err(e)) => Err(e),
                    Err(_) => Err(BinderError::ChannelClosed),
                }
            }
        }
    }

    /// Close one passed connection on the binder side
    pub fn close_conn(&self, uid: &str) {
        self.send_line(&format!("closeconn {uid}"));
    }

    /// Close every listener and connection the binder holds for us
    pub fn reset(&self) {
        self.send_line("reset");
    }

    /// Terminate the binder handler for this child
    pub fn byebye(&self) {
        self.send_line("byebye");
    }

    fn send_line(&self, line: &str) {
        if let Err(e) = self.sender.lock().send(line, None) {
            tracing::debug!(error = %e, line, "binder send failed");
        }
    }
}

fn reader_loop(channel: &mut FdChannel, state: &ClientState) {
    loop {
        let (line, fd) = match channel.recv_line() {
            Ok(Some(v)) => v,
            Ok(None) => break,
            Err(e) => {
                tracing::debug!(error = %e, "binder client channel error");
                break;
            }
        };

        let mut parts = line.splitn(3, ' ');
        match (parts.next(), parts.next(), parts.next()) {
            (Some("confirmlisten"), Some(addr), _) => {
                if let Some(tx) = state.pending_listen.lock().remove(addr) {
                    let _ = tx.send(Ok(()));
                }
            }
            (Some("error"), Some(addr), message) => {
                if let Some(tx) = state.pending_listen.lock().remove(addr) {
                    let _ = tx.send(Err(BinderError::Refused {
                        addr: addr.to_owned(),
                        message: message.unwrap_or("bind failed").to_owned(),
                    }));
                }
            }
            (Some("newconn"), Some(uid), Some(addr)) => {
                let Some(fd) = fd else {
                    tracing::warn!(uid, addr, "newconn without descriptor");
                    continue;
                };
                if let Some(tx) = state.packet_waiters.lock().remove(addr) {
                    let _ = tx.send(fd);
                } else if let Some(tx) = state.stream_conns.lock().get(addr) {
                    let _ = tx.send((uid.to_owned(), fd));
                } else {
                    tracing::debug!(uid, addr, "connection for unknown listener, dropping");
                }
            }
            (Some("stopped"), Some(_addr), _) => {}
            _ => tracing::debug!(line, "unexpected binder reply"),
        }
    }

    // wake everything still waiting
    state.pending_listen.lock().clear();
    state.stream_conns.lock().clear();
    state.packet_waiters.lock().clear();
}
