//! Child worker entry points
//!
//! A child is this executable re-invoked as `confined-<name>` (or `<name>`
//! without isolation). Each service type gets an adapter bridging its
//! service object onto the control runtime's `ChildService` surface.

use std::os::fd::{FromRawFd, RawFd};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::BytesMut;
use tokio_util::sync::CancellationToken;

use skewer_binder::BinderClient;
use skewer_control::{
    ChildReporter, ChildService, ChildStasher, ControlCodec, STORE_PATH_ENV, child_fds,
    child_output, run_child,
};
use skewer_model::{BaseConfig, ListenerInfo};
use skewer_relp::{RelpConf, RelpService};

use crate::services::ServiceType;
use crate::tcp::TcpService;
use crate::udp::UdpService;

/// Run one child worker to completion
pub async fn run(typ: ServiceType) -> anyhow::Result<()> {
    let fds = child_fds();
    init_child_logging(fds.logger);
    tracing::debug!(name = typ.name(), ?fds, "child worker starting");

    let binder = BinderClient::from_env()?;
    let (output, output_rx) = child_output();

    match typ {
        ServiceType::Relp => {
            let reporter = ChildReporter::new(output.clone());
            let stasher = ChildStasher::new(output.clone());
            let service = RelpChildService {
                reporter: Arc::clone(&reporter),
                relp: RelpService::new(reporter, Some(stasher as _), binder),
            };
            run_child(service, output, output_rx).await?;
        }
        ServiceType::Tcp => {
            let stasher = ChildStasher::new(output.clone());
            let service = TcpChildService {
                stasher,
                binder,
                tcp: None,
            };
            run_child(service, output, output_rx).await?;
        }
        ServiceType::Udp => {
            let stasher = ChildStasher::new(output.clone());
            let service = UdpChildService {
                udp: UdpService::new(stasher, binder),
            };
            run_child(service, output, output_rx).await?;
        }
        ServiceType::Store => {
            let pipe = fds
                .pipe
                .ok_or_else(|| anyhow::anyhow!("store child needs the message pipe"))?;
            let dir = std::env::var_os(STORE_PATH_ENV)
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("/var/lib/skewer"));
            let service = StoreChildService::new(pipe, dir);
            run_child(service, output, output_rx).await?;
        }
    }

    Ok(())
}

/// Children log to the inherited logger descriptor when present, stderr
/// otherwise
fn init_child_logging(logger_fd: Option<RawFd>) {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match logger_fd {
        Some(fd) => {
            let file = unsafe { std::fs::File::from_raw_fd(fd) };
            tracing_subscriber::registry()
                .with(fmt::layer().with_ansi(false).with_writer(Arc::new(file)))
                .with(filter)
                .init();
        }
        None => {
            tracing_subscriber::registry()
                .with(fmt::layer().with_ansi(false).with_writer(std::io::stderr))
                .with(filter)
                .init();
        }
    }
}

/// RELP worker: the engine restarts itself through its status machine, so
/// `start` waits for the first listener report instead of a return value
struct RelpChildService {
    relp: RelpService,
    reporter: Arc<ChildReporter>,
}

impl ChildService for RelpChildService {
    fn set_conf(&mut self, conf: BaseConfig) -> Result<(), String> {
        self.relp.set_conf(RelpConf {
            syslog: conf.syslog.clone(),
            kafka: conf.kafka.clone(),
            direct: conf.direct_relp,
            queue_size: conf.effective_queue_size(),
            max_message_size: conf.effective_max_message_size(),
        });
        Ok(())
    }

    async fn start(&mut self, test: bool) -> Result<Vec<ListenerInfo>, String> {
        let first_report = self.reporter.subscribe_next();
        self.relp.start(test).await;
        match tokio::time::timeout(Duration::from_secs(2), first_report).await {
            Ok(Ok(infos)) => Ok(infos),
            _ => Err("the RELP service did not report its listeners".into()),
        }
    }

    async fn stop(&mut self) {
        self.relp.stop().await;
    }

    async fn shutdown(&mut self) {
        self.relp.shutdown().await;
    }

    async fn gather(&mut self) -> serde_json::Value {
        serde_json::to_value(self.relp.gather().await).unwrap_or(serde_json::Value::Null)
    }
}

/// TCP worker; the service object is rebuilt on reconfiguration so the
/// message size cap takes effect
struct TcpChildService {
    stasher: Arc<ChildStasher>,
    binder: Option<Arc<BinderClient>>,
    tcp: Option<TcpService>,
}

impl ChildService for TcpChildService {
    fn set_conf(&mut self, conf: BaseConfig) -> Result<(), String> {
        let service = TcpService::new(
            Arc::clone(&self.stasher) as _,
            self.binder.clone(),
            conf.effective_max_message_size(),
        );
        service.set_conf(&conf.syslog);
        self.tcp = Some(service);
        Ok(())
    }

    async fn start(&mut self, _test: bool) -> Result<Vec<ListenerInfo>, String> {
        match &self.tcp {
            Some(service) => Ok(service.start().await),
            None => Err("no configuration received".into()),
        }
    }

    async fn stop(&mut self) {
        if let Some(service) = &self.tcp {
            service.stop().await;
        }
    }

    async fn shutdown(&mut self) {
        self.stop().await;
    }

    async fn gather(&mut self) -> serde_json::Value {
        match &self.tcp {
            Some(service) => {
                serde_json::to_value(service.metrics_snapshot()).unwrap_or(serde_json::Value::Null)
            }
            None => serde_json::Value::Null,
        }
    }
}

/// UDP worker
struct UdpChildService {
    udp: UdpService,
}

impl ChildService for UdpChildService {
    fn set_conf(&mut self, conf: BaseConfig) -> Result<(), String> {
        self.udp.set_conf(&conf.syslog);
        Ok(())
    }

    async fn start(&mut self, _test: bool) -> Result<Vec<ListenerInfo>, String> {
        Ok(self.udp.start().await)
    }

    async fn stop(&mut self) {
        self.udp.stop().await;
    }

    async fn shutdown(&mut self) {
        self.udp.stop().await;
    }

    async fn gather(&mut self) -> serde_json::Value {
        serde_json::to_value(self.udp.metrics_snapshot()).unwrap_or(serde_json::Value::Null)
    }
}

/// Store worker: drains the inherited message pipe into the session's
/// message log. The storage engine behind it is not this daemon's concern;
/// the pipe protocol and lifecycle are.
struct StoreChildService {
    pipe: Option<RawFd>,
    dir: PathBuf,
    received: Arc<AtomicU64>,
    cancel: CancellationToken,
    drainer: Option<tokio::task::JoinHandle<()>>,
}

impl StoreChildService {
    fn new(pipe: RawFd, dir: PathBuf) -> Self {
        Self {
            pipe: Some(pipe),
            dir,
            received: Arc::new(AtomicU64::new(0)),
            cancel: CancellationToken::new(),
            drainer: None,
        }
    }
}

impl ChildService for StoreChildService {
    fn set_conf(&mut self, _conf: BaseConfig) -> Result<(), String> {
        Ok(())
    }

    async fn start(&mut self, _test: bool) -> Result<Vec<ListenerInfo>, String> {
        let Some(pipe) = self.pipe.take() else {
            // the pipe is a one-shot resource; a restart reuses the drainer
            return Ok(Vec::new());
        };
        std::fs::create_dir_all(&self.dir).map_err(|e| e.to_string())?;
        let log_path = self.dir.join("messages.log");
        let log = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .map_err(|e| e.to_string())?;

        let pipe = unsafe { std::fs::File::from_raw_fd(pipe) };
        let received = Arc::clone(&self.received);
        let cancel = self.cancel.clone();
        self.drainer = Some(tokio::spawn(async move {
            let mut pipe = tokio::fs::File::from_std(pipe);
            let mut log = tokio::fs::File::from_std(log);
            let mut codec = ControlCodec::new();
            let mut buf = BytesMut::with_capacity(8192);
            loop {
                let frame = tokio::select! {
                    _ = cancel.cancelled() => break,
                    frame = skewer_control::read_frame(&mut pipe, &mut codec, &mut buf) => frame,
                };
                match frame {
                    Ok(Some(frame)) => {
                        received.fetch_add(1, Ordering::Relaxed);
                        if let Err(e) =
                            skewer_control::write_frame(&mut log, &mut codec, frame.freeze()).await
                        {
                            tracing::error!(error = %e, "failed to persist a message");
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        tracing::error!(error = %e, "message pipe broken");
                        break;
                    }
                }
            }
        }));

        tracing::info!(dir = %self.dir.display(), "store is draining the message pipe");
        Ok(Vec::new())
    }

    async fn stop(&mut self) {
        // the drainer follows the pipe, not the stop cycle
    }

    async fn shutdown(&mut self) {
        self.cancel.cancel();
        if let Some(drainer) = self.drainer.take() {
            let _ = drainer.await;
        }
    }

    async fn gather(&mut self) -> serde_json::Value {
        serde_json::json!({ "messages_received": self.received.load(Ordering::Relaxed) })
    }

    fn expects_listeners(&self) -> bool {
        false
    }
}
