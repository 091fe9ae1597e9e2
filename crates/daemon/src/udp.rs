//! UDP syslog service
//!
//! One packet socket per configured endpoint (UDP or unixgram), one
//! datagram per message. Datagrams are parsed in the receive task and
//! stashed; there is no framing and no acknowledgement.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::net::{UdpSocket, UnixDatagram};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use skewer_binder::BinderClient;
use skewer_model::{
    ListenerInfo, ParsedMessage, ParsersEnv, Stasher, SyslogConfig, TcpUdpParsedMessage,
};
use skewer_streaming::{ServiceMetrics, ServiceMetricsSnapshot, ServiceStatus};

/// Receive buffer for one datagram
const DATAGRAM_SIZE: usize = 65536;

enum PacketSocket {
    Udp(UdpSocket),
    Unixgram(UnixDatagram),
}

/// The UDP syslog service
pub struct UdpService {
    stasher: Arc<dyn Stasher>,
    binder: Option<Arc<BinderClient>>,
    metrics: Arc<ServiceMetrics>,
    configs: parking_lot::Mutex<Vec<Arc<SyslogConfig>>>,
    status: tokio::sync::Mutex<ServiceStatus>,
    cancel: parking_lot::Mutex<CancellationToken>,
    tracker: TaskTracker,
    unix_paths: parking_lot::Mutex<Vec<PathBuf>>,
}

impl UdpService {
    pub fn new(stasher: Arc<dyn Stasher>, binder: Option<Arc<BinderClient>>) -> Self {
        Self {
            stasher,
            binder,
            metrics: Arc::new(ServiceMetrics::new()),
            configs: parking_lot::Mutex::new(Vec::new()),
            status: tokio::sync::Mutex::new(ServiceStatus::Stopped),
            cancel: parking_lot::Mutex::new(CancellationToken::new()),
            tracker: TaskTracker::new(),
            unix_paths: parking_lot::Mutex::new(Vec::new()),
        }
    }

    pub fn set_conf(&self, configs: &[SyslogConfig]) {
        *self.configs.lock() = configs
            .iter()
            .filter(|c| c.protocol == "udp")
            .cloned()
            .map(Arc::new)
            .collect();
    }

    pub fn metrics_snapshot(&self) -> ServiceMetricsSnapshot {
        self.metrics.snapshot()
    }

    pub async fn start(&self) -> Vec<ListenerInfo> {
        let mut status = self.status.lock().await;
        if *status != ServiceStatus::Stopped {
            return Vec::new();
        }

        let cancel = self.cancel.lock().clone();
        let mut infos = Vec::new();
        let configs = self.configs.lock().clone();
        for config in configs {
            match self.bind_one(&config).await {
                Ok((socket, info)) => {
                    if let PacketSocket::Unixgram(_) = &socket {
                        self.unix_paths
                            .lock()
                            .push(PathBuf::from(&config.unix_socket_path));
                    }
                    infos.push(info);
                    self.tracker.spawn(recv_loop(
                        socket,
                        Arc::clone(&config),
                        Arc::clone(&self.stasher),
                        Arc::clone(&self.metrics),
                        cancel.child_token(),
                    ));
                }
                Err(e) => {
                    tracing::warn!(
                        bind_addr = %config.bind_addr,
                        port = config.port,
                        unix_socket_path = %config.unix_socket_path,
                        error = %e,
                        "UDP listener skipped"
                    );
                }
            }
        }

        if infos.is_empty() {
            tracing::debug!("the UDP service has not been started: no listening port");
            return infos;
        }
        *status = ServiceStatus::Started;
        tracing::info!(nb_services = infos.len(), "listening on UDP");
        infos
    }

    async fn bind_one(
        &self,
        config: &Arc<SyslogConfig>,
    ) -> std::io::Result<(PacketSocket, ListenerInfo)> {
        if config.is_unix() {
            let path = &config.unix_socket_path;
            match UnixDatagram::bind(path) {
                Ok(socket) => Ok((
                    PacketSocket::Unixgram(socket),
                    ListenerInfo::unix("udp", path),
                )),
                Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
                    let socket = self.packet_through_binder(&format!("unixgram:{path}")).await?;
                    let socket = {
                        let std_socket = std::os::unix::net::UnixDatagram::from(socket);
                        std_socket.set_nonblocking(true)?;
                        UnixDatagram::from_std(std_socket)?
                    };
                    Ok((
                        PacketSocket::Unixgram(socket),
                        ListenerInfo::unix("udp", path),
                    ))
                }
                Err(e) => Err(e),
            }
        } else {
            let addr = config.listen_addr();
            match UdpSocket::bind(&addr).await {
                Ok(socket) => {
                    let port = socket.local_addr().map(|a| a.port()).unwrap_or(config.port);
                    Ok((
                        PacketSocket::Udp(socket),
                        ListenerInfo::net("udp", &config.bind_addr, port),
                    ))
                }
                Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
                    let socket = self.packet_through_binder(&format!("udp:{addr}")).await?;
                    let socket = {
                        let std_socket = std::net::UdpSocket::from(socket);
                        std_socket.set_nonblocking(true)?;
                        UdpSocket::from_std(std_socket)?
                    };
                    Ok((
                        PacketSocket::Udp(socket),
                        ListenerInfo::net("udp", &config.bind_addr, config.port),
                    ))
                }
                Err(e) => Err(e),
            }
        }
    }

    async fn packet_through_binder(&self, addr: &str) -> std::io::Result<std::os::fd::OwnedFd> {
        let Some(binder) = &self.binder else {
            return Err(std::io::Error::from(std::io::ErrorKind::PermissionDenied));
        };
        tracing::info!(addr, "bind refused, retrying through the binder");
        binder
            .listen_packet(addr)
            .await
            .map_err(std::io::Error::other)
    }

    pub async fn stop(&self) {
        let mut status = self.status.lock().await;
        if *status != ServiceStatus::Started {
            return;
        }
        let token = {
            let mut guard = self.cancel.lock();
            std::mem::replace(&mut *guard, CancellationToken::new())
        };
        token.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        self.tracker.reopen();
        for path in self.unix_paths.lock().drain(..) {
            let _ = std::fs::remove_file(path);
        }
        *status = ServiceStatus::Stopped;
        tracing::debug!("UDP service has stopped");
    }
}

async fn recv_loop(
    socket: PacketSocket,
    config: Arc<SyslogConfig>,
    stasher: Arc<dyn Stasher>,
    metrics: Arc<ServiceMetrics>,
    cancel: CancellationToken,
) {
    let env = ParsersEnv::new();
    let mut buf = vec![0u8; DATAGRAM_SIZE];
    let local_port = match &socket {
        PacketSocket::Udp(s) => s.local_addr().map(|a| a.port()).unwrap_or(config.port),
        PacketSocket::Unixgram(_) => 0,
    };

    loop {
        let received = tokio::select! {
            _ = cancel.cancelled() => break,
            received = async {
                match &socket {
                    PacketSocket::Udp(s) => s
                        .recv_from(&mut buf)
                        .await
                        .map(|(n, peer)| (n, peer.ip().to_string())),
                    PacketSocket::Unixgram(s) => {
                        s.recv(&mut buf).await.map(|n| (n, "localhost".to_owned()))
                    }
                }
            } => received,
        };

        let (size, client) = match received {
            Ok(received) => received,
            Err(e) => {
                tracing::debug!(error = %e, "error reading UDP");
                break;
            }
        };
        metrics.message_received();

        match env.parse(config.format, &buf[..size], config.encoding, config.dont_parse_sd) {
            Ok(fields) if fields.is_empty() => {}
            Ok(fields) => {
                let parsed = TcpUdpParsedMessage {
                    parsed: ParsedMessage {
                        fields,
                        client,
                        local_port,
                        unix_socket_path: config.unix_socket_path.clone(),
                    },
                    conf_id: config.conf_id,
                    uid: Some(ulid::Ulid::new()),
                    ..Default::default()
                };
                if let Err(e) = stasher.stash(parsed) {
                    tracing::warn!(error = %e, "stash error");
                }
            }
            Err(e) => {
                metrics.parsing_error();
                tracing::info!(client = %client, error = %e, "parsing error");
            }
        }
    }
}
