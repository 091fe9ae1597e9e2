//! Streaming service base
//!
//! Owns the listeners of a stream-oriented service, spawns one accept loop
//! per listener and one handler task per accepted connection, and tears the
//! whole set down through a cancellation token. Binding goes directly
//! through the kernel first and falls back to the privileged binder on
//! `PermissionDenied`.

use std::io;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream, UnixListener, UnixStream};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use skewer_binder::{BinderClient, BinderListener};
use skewer_model::{ListenerInfo, SyslogConfig};

use crate::pool::BufferPool;
use crate::status::ServiceMetrics;

/// A stream from either address family
pub enum IoStream {
    Tcp(TcpStream),
    Unix(UnixStream),
}

impl AsyncRead for IoStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            IoStream::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            IoStream::Unix(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for IoStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            IoStream::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            IoStream::Unix(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            IoStream::Tcp(s) => Pin::new(s).poll_flush(cx),
            IoStream::Unix(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            IoStream::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            IoStream::Unix(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

/// Asks the binder to drop its copy of a passed connection when the handler
/// is done with it
struct BinderConnGuard {
    client: Arc<BinderClient>,
    uid: String,
}

impl Drop for BinderConnGuard {
    fn drop(&mut self) {
        self.client.close_conn(&self.uid);
    }
}

/// An accepted connection with its origin metadata
pub struct Connection {
    pub stream: IoStream,
    pub client: String,
    pub local_port: u16,
    pub unix_socket_path: String,
    _binder_guard: Option<BinderConnGuard>,
}

/// Per-connection protocol logic of a stream service
pub trait StreamHandler: Send + Sync + 'static {
    fn handle(
        self: Arc<Self>,
        conn: Connection,
        config: Arc<SyslogConfig>,
        shutdown: CancellationToken,
    ) -> impl Future<Output = ()> + Send;
}

enum BoundListener {
    Tcp(TcpListener),
    Unix(UnixListener, PathBuf),
    Binder(BinderListener, Arc<BinderClient>),
}

struct Bound {
    listener: BoundListener,
    config: Arc<SyslogConfig>,
    info: ListenerInfo,
}

/// Listener lifecycle and connection bookkeeping for one service
pub struct StreamingService<H: StreamHandler> {
    protocol: &'static str,
    handler: Arc<H>,
    binder: Option<Arc<BinderClient>>,
    pool: Arc<BufferPool>,
    metrics: Arc<ServiceMetrics>,
    configs: Mutex<Vec<Arc<SyslogConfig>>>,
    bound: Mutex<Vec<Bound>>,
    unix_paths: Mutex<Vec<PathBuf>>,
    cancel: Mutex<CancellationToken>,
    tracker: TaskTracker,
}

impl<H: StreamHandler> StreamingService<H> {
    pub fn new(
        protocol: &'static str,
        handler: Arc<H>,
        binder: Option<Arc<BinderClient>>,
        pool: Arc<BufferPool>,
        metrics: Arc<ServiceMetrics>,
    ) -> Self {
        Self {
            protocol,
            handler,
            binder,
            pool,
            metrics,
            configs: Mutex::new(Vec::new()),
            bound: Mutex::new(Vec::new()),
            unix_paths: Mutex::new(Vec::new()),
            cancel: Mutex::new(CancellationToken::new()),
            tracker: TaskTracker::new(),
        }
    }

    /// Install the endpoint configs this service should listen on.
    /// Only configs whose `protocol` matches are kept.
    pub fn set_conf(&self, configs: &[SyslogConfig]) {
        *self.configs.lock() = configs
            .iter()
            .filter(|c| c.protocol == self.protocol)
            .cloned()
            .map(Arc::new)
            .collect();
    }

    pub fn metrics(&self) -> &Arc<ServiceMetrics> {
        &self.metrics
    }

    pub fn pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }

    pub fn configs(&self) -> Vec<Arc<SyslogConfig>> {
        self.configs.lock().clone()
    }

    #[inline]
    pub fn add_connection(&self) {
        self.metrics.connection_opened();
    }

    #[inline]
    pub fn remove_connection(&self) {
        self.metrics.connection_closed();
    }

    /// Bind every configured endpoint. Failures are logged and skipped; the
    /// returned infos describe the listeners that actually came up.
    pub async fn init_listeners(&self) -> Vec<ListenerInfo> {
        let mut infos = Vec::new();
        for config in &self.configs() {
            match self.bind_one(config).await {
                Ok(bound) => {
                    tracing::debug!(
                        protocol = self.protocol,
                        bind_addr = %config.bind_addr,
                        port = bound.info.port,
                        unix_socket_path = %config.unix_socket_path,
                        format = %config.format,
                        "listener ready"
                    );
                    infos.push(bound.info.clone());
                    if let BoundListener::Unix(_, path) = &bound.listener {
                        self.unix_paths.lock().push(path.clone());
                    }
                    self.bound.lock().push(bound);
                }
                Err(e) => {
                    tracing::warn!(
                        protocol = self.protocol,
                        bind_addr = %config.bind_addr,
                        port = config.port,
                        unix_socket_path = %config.unix_socket_path,
                        error = %e,
                        "listener skipped"
                    );
                }
            }
        }
        infos
    }

    async fn bind_one(&self, config: &Arc<SyslogConfig>) -> io::Result<Bound> {
        if config.is_unix() {
            let path = PathBuf::from(&config.unix_socket_path);
            match UnixListener::bind(&path) {
                Ok(listener) => Ok(Bound {
                    listener: BoundListener::Unix(listener, path),
                    config: Arc::clone(config),
                    info: ListenerInfo::unix(self.protocol, &config.unix_socket_path),
                }),
                Err(e) if e.kind() == io::ErrorKind::PermissionDenied => {
                    self.bind_through_binder(config, &format!("unix:{}", config.unix_socket_path))
                        .await
                        .ok_or(e)
                }
                Err(e) => Err(e),
            }
        } else {
            let addr = config.listen_addr();
            match TcpListener::bind(&addr).await {
                Ok(listener) => {
                    let port = listener.local_addr().map(|a| a.port()).unwrap_or(config.port);
                    Ok(Bound {
                        listener: BoundListener::Tcp(listener),
                        config: Arc::clone(config),
                        info: ListenerInfo::net(self.protocol, &config.bind_addr, port),
                    })
                }
                Err(e) if e.kind() == io::ErrorKind::PermissionDenied => {
                    self.bind_through_binder(config, &format!("tcp:{addr}"))
                        .await
                        .ok_or(e)
                }
                Err(e) => Err(e),
            }
        }
    }

    async fn bind_through_binder(&self, config: &Arc<SyslogConfig>, addr: &str) -> Option<Bound> {
        let binder = self.binder.as_ref()?;
        tracing::info!(addr, "bind refused, retrying through the binder");
        match binder.listen_stream(addr).await {
            Ok(listener) => {
                let info = if config.is_unix() {
                    ListenerInfo::unix(self.protocol, &config.unix_socket_path)
                } else {
                    ListenerInfo::net(self.protocol, &config.bind_addr, config.port)
                };
                Some(Bound {
                    listener: BoundListener::Binder(listener, Arc::clone(binder)),
                    config: Arc::clone(config),
                    info,
                })
            }
            Err(e) => {
                tracing::warn!(addr, error = %e, "binder bind failed");
                None
            }
        }
    }

    /// Spawn the accept loops for every bound listener
    pub fn listen(&self) {
        let cancel = self.cancel.lock().clone();
        for bound in self.bound.lock().drain(..) {
            let task = AcceptLoop {
                protocol: self.protocol,
                handler: Arc::clone(&self.handler),
                metrics: Arc::clone(&self.metrics),
                tracker: self.tracker.clone(),
                cancel: cancel.child_token(),
            };
            self.tracker.spawn(task.run(bound));
        }
    }

    /// Close all listeners, let handlers drain, join everything
    pub async fn reset_listeners(&self) {
        let token = {
            let mut guard = self.cancel.lock();
            std::mem::replace(&mut *guard, CancellationToken::new())
        };
        token.cancel();
        self.bound.lock().clear();

        self.tracker.close();
        self.tracker.wait().await;
        self.tracker.reopen();

        for path in self.unix_paths.lock().drain(..) {
            let _ = std::fs::remove_file(path);
        }
    }
}

struct AcceptLoop<H: StreamHandler> {
    protocol: &'static str,
    handler: Arc<H>,
    metrics: Arc<ServiceMetrics>,
    tracker: TaskTracker,
    cancel: CancellationToken,
}

impl<H: StreamHandler> AcceptLoop<H> {
    async fn run(self, mut bound: Bound) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                accepted = accept_one(&mut bound.listener, &bound.config) => match accepted {
                    Ok(conn) => {
                        self.metrics.connection_opened();
                        tracing::info!(
                            protocol = self.protocol,
                            client = %conn.client,
                            local_port = conn.local_port,
                            unix_socket_path = %conn.unix_socket_path,
                            "new client connection"
                        );
                        let handler = Arc::clone(&self.handler);
                        let config = Arc::clone(&bound.config);
                        let metrics = Arc::clone(&self.metrics);
                        let shutdown = self.cancel.clone();
                        self.tracker.spawn(async move {
                            handler.handle(conn, config, shutdown).await;
                            metrics.connection_closed();
                        });
                    }
                    Err(e) => {
                        // this listener is finished; its siblings keep going
                        if !self.cancel.is_cancelled() {
                            tracing::warn!(protocol = self.protocol, error = %e, "accept error");
                            self.metrics.accept_error();
                        }
                        break;
                    }
                }
            }
        }
        if let BoundListener::Unix(_, path) = &bound.listener {
            let _ = std::fs::remove_file(path);
        }
    }
}

async fn accept_one(
    listener: &mut BoundListener,
    config: &Arc<SyslogConfig>,
) -> io::Result<Connection> {
    match listener {
        BoundListener::Tcp(l) => {
            let (stream, peer) = l.accept().await?;
            tune_tcp_socket(&stream);
            let local_port = stream.local_addr().map(|a| a.port()).unwrap_or(config.port);
            Ok(Connection {
                stream: IoStream::Tcp(stream),
                client: peer.ip().to_string(),
                local_port,
                unix_socket_path: String::new(),
                _binder_guard: None,
            })
        }
        BoundListener::Unix(l, path) => {
            let (stream, _) = l.accept().await?;
            Ok(Connection {
                stream: IoStream::Unix(stream),
                client: "localhost".into(),
                local_port: 0,
                unix_socket_path: path.display().to_string(),
                _binder_guard: None,
            })
        }
        BoundListener::Binder(l, client) => {
            let (uid, fd) = l
                .accept()
                .await
                .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "binder gone"))?;
            let guard = BinderConnGuard {
                client: Arc::clone(client),
                uid,
            };
            if config.is_unix() {
                let std_stream = std::os::unix::net::UnixStream::from(fd);
                std_stream.set_nonblocking(true)?;
                Ok(Connection {
                    stream: IoStream::Unix(UnixStream::from_std(std_stream)?),
                    client: "localhost".into(),
                    local_port: 0,
                    unix_socket_path: config.unix_socket_path.clone(),
                    _binder_guard: Some(guard),
                })
            } else {
                let std_stream = std::net::TcpStream::from(fd);
                std_stream.set_nonblocking(true)?;
                let client_addr = std_stream
                    .peer_addr()
                    .map(|a| a.ip().to_string())
                    .unwrap_or_else(|_| "unknown".into());
                tune_tcp_socket(&std_stream);
                Ok(Connection {
                    stream: IoStream::Tcp(TcpStream::from_std(std_stream)?),
                    client: client_addr,
                    local_port: config.port,
                    unix_socket_path: String::new(),
                    _binder_guard: Some(guard),
                })
            }
        }
    }
}

/// Socket options for accepted TCP connections
fn tune_tcp_socket<S: std::os::fd::AsFd>(stream: &S) {
    let sock = socket2::SockRef::from(stream);
    if let Err(e) = sock.set_nodelay(true) {
        tracing::warn!(error = %e, "failed to set TCP_NODELAY");
    }
    if let Err(e) = sock.set_recv_buffer_size(256 * 1024) {
        tracing::warn!(error = %e, "failed to set SO_RCVBUF");
    }
    if let Err(e) = sock.set_send_buffer_size(256 * 1024) {
        tracing::warn!(error = %e, "failed to set SO_SNDBUF");
    }
}

#[cfg(test)]
#[path = "service_test.rs"]
mod service_test;
