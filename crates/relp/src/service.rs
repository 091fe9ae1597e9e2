//! RELP service lifecycle
//!
//! `RelpServiceImpl` owns one start/stop cycle of the engine: listeners,
//! the raw ring, the parser pool, the fan-out and delivery workers. The
//! `RelpService` wrapper drives it through the status machine: a `Stopped`
//! status triggers a (re)start with the latest config, `Waiting` retries
//! after a fixed backoff, `FinalStopped` ends the cycle and reports an empty
//! listener set.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use crossfire::MAsyncTx;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::task::TaskTracker;

use skewer_binder::BinderClient;
use skewer_model::{
    ConfId, KafkaDestConfig, ListenerInfo, RawTcpMessage, Reporter, Stasher, SyslogConfig,
};
use skewer_streaming::{BufferPool, ServiceMetrics, ServiceMetricsSnapshot, ServiceStatus,
    StreamingService};

use crate::forwarder::AckForwarder;
use crate::handler::RelpHandler;
use crate::kafka::{RelpProducer, delivery_loop, fanout_loop};
use crate::parse::{ParsedSink, parse_loop};

/// Backoff before a waiting service is restarted
const WAITING_BACKOFF: Duration = Duration::from_secs(30);

/// Buffers pre-allocated in the receive pool; the pool grows on demand
const POOL_PREALLOC: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum RelpServiceError {
    #[error("the service has been definitely stopped")]
    DefinitelyStopped,

    #[error("the service is not stopped")]
    NotStopped,

    #[error("store mode requires a stasher")]
    NoStasher,

    #[error("kafka producer error: {0}")]
    Kafka(#[from] rdkafka::error::KafkaError),
}

/// Internal worker-to-service signals
pub(crate) enum ServiceEvent {
    /// Unrecoverable destination failure; stop and enter `Waiting`
    Fatal(String),
}

/// RELP-specific counters, on top of the shared service metrics
#[derive(Debug, Default)]
pub struct RelpMetrics {
    answers_200: std::sync::atomic::AtomicU64,
    answers_500: std::sync::atomic::AtomicU64,
    kafka_acks: std::sync::atomic::AtomicU64,
    kafka_nacks: std::sync::atomic::AtomicU64,
    filter_passing: std::sync::atomic::AtomicU64,
    filter_dropped: std::sync::atomic::AtomicU64,
    filter_rejected: std::sync::atomic::AtomicU64,
}

macro_rules! counter {
    ($inc:ident, $field:ident) => {
        #[inline]
        pub fn $inc(&self) {
            self.$field.fetch_add(1, Ordering::Relaxed);
        }
    };
}

impl RelpMetrics {
    counter!(answer_200, answers_200);
    counter!(answer_500, answers_500);
    counter!(kafka_ack, kafka_acks);
    counter!(kafka_nack, kafka_nacks);
    counter!(filter_passing, filter_passing);
    counter!(filter_dropped, filter_dropped);
    counter!(filter_rejected, filter_rejected);

    pub fn snapshot(&self, base: ServiceMetricsSnapshot) -> RelpMetricsSnapshot {
        RelpMetricsSnapshot {
            base,
            answers_200: self.answers_200.load(Ordering::Relaxed),
            answers_500: self.answers_500.load(Ordering::Relaxed),
            kafka_acks: self.kafka_acks.load(Ordering::Relaxed),
            kafka_nacks: self.kafka_nacks.load(Ordering::Relaxed),
            filter_passing: self.filter_passing.load(Ordering::Relaxed),
            filter_dropped: self.filter_dropped.load(Ordering::Relaxed),
            filter_rejected: self.filter_rejected.load(Ordering::Relaxed),
        }
    }
}

/// Serializable RELP metrics, the `gathermetrics` reply body
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct RelpMetricsSnapshot {
    #[serde(flatten)]
    pub base: ServiceMetricsSnapshot,
    pub answers_200: u64,
    pub answers_500: u64,
    pub kafka_acks: u64,
    pub kafka_nacks: u64,
    pub filter_passing: u64,
    pub filter_dropped: u64,
    pub filter_rejected: u64,
}

/// State shared between the connection handlers and the pipeline workers
pub(crate) struct RelpShared {
    pub forwarder: AckForwarder,
    pub pool: Arc<BufferPool>,
    pub metrics: Arc<ServiceMetrics>,
    pub relp_metrics: Arc<RelpMetrics>,
    /// Input of the raw ring; absent while the service is stopped
    pub raw_tx: parking_lot::Mutex<Option<MAsyncTx<RawTcpMessage>>>,
    pub max_message_size: usize,
}

/// Config snapshot the service runs with
#[derive(Debug, Clone)]
pub struct RelpConf {
    pub syslog: Vec<SyslogConfig>,
    pub kafka: KafkaDestConfig,
    /// Direct-to-Kafka when true, through the store when false
    pub direct: bool,
    pub queue_size: usize,
    pub max_message_size: usize,
}

impl Default for RelpConf {
    fn default() -> Self {
        Self {
            syslog: Vec::new(),
            kafka: KafkaDestConfig::default(),
            direct: true,
            queue_size: 10000,
            max_message_size: 132000,
        }
    }
}

/// One start/stop cycle of the RELP engine
pub struct RelpServiceImpl {
    streaming: StreamingService<RelpHandler>,
    shared: Arc<RelpShared>,
    direct: bool,
    stasher: Option<Arc<dyn Stasher>>,
    kafka_conf: parking_lot::Mutex<KafkaDestConfig>,
    queue_size: AtomicUsize,
    status: tokio::sync::Mutex<ServiceStatus>,
    status_tx: parking_lot::Mutex<Option<mpsc::UnboundedSender<ServiceStatus>>>,
    status_rx: parking_lot::Mutex<Option<mpsc::UnboundedReceiver<ServiceStatus>>>,
    workers: TaskTracker,
}

impl RelpServiceImpl {
    pub fn new(
        conf: &RelpConf,
        stasher: Option<Arc<dyn Stasher>>,
        binder: Option<Arc<BinderClient>>,
    ) -> Self {
        let pool = Arc::new(BufferPool::new(POOL_PREALLOC, conf.max_message_size));
        let metrics = Arc::new(ServiceMetrics::new());
        let shared = Arc::new(RelpShared {
            forwarder: AckForwarder::new(),
            pool: Arc::clone(&pool),
            metrics: Arc::clone(&metrics),
            relp_metrics: Arc::new(RelpMetrics::default()),
            raw_tx: parking_lot::Mutex::new(None),
            max_message_size: conf.max_message_size,
        });
        let handler = Arc::new(RelpHandler {
            shared: Arc::clone(&shared),
        });
        let streaming = StreamingService::new("relp", handler, binder, pool, metrics);
        streaming.set_conf(&conf.syslog);

        let (status_tx, status_rx) = mpsc::unbounded_channel();
        Self {
            streaming,
            shared,
            direct: conf.direct,
            stasher,
            kafka_conf: parking_lot::Mutex::new(conf.kafka.clone()),
            queue_size: AtomicUsize::new(conf.queue_size.max(1)),
            status: tokio::sync::Mutex::new(ServiceStatus::Stopped),
            status_tx: parking_lot::Mutex::new(Some(status_tx)),
            status_rx: parking_lot::Mutex::new(Some(status_rx)),
            workers: TaskTracker::new(),
        }
    }

    /// The status stream; taken once by the service wrapper
    pub fn take_status_rx(&self) -> Option<mpsc::UnboundedReceiver<ServiceStatus>> {
        self.status_rx.lock().take()
    }

    /// Re-apply the latest config before a restart
    pub fn apply_conf(&self, conf: &RelpConf) {
        self.streaming.set_conf(&conf.syslog);
        *self.kafka_conf.lock() = conf.kafka.clone();
        self.queue_size.store(conf.queue_size.max(1), Ordering::Relaxed);
    }

    fn send_status(&self, status: ServiceStatus) {
        if let Some(tx) = self.status_tx.lock().as_ref() {
            let _ = tx.send(status);
        }
    }

    fn close_status(&self) {
        self.status_tx.lock().take();
    }

    /// Nudge the wrapper into its first start
    pub fn trigger(&self) {
        self.send_status(ServiceStatus::Stopped);
    }

    pub fn metrics_snapshot(&self) -> RelpMetricsSnapshot {
        self.shared
            .relp_metrics
            .snapshot(self.shared.metrics.snapshot())
    }

    /// Pool diagnostics, used to assert buffers do not leak
    pub fn pool_outstanding(&self) -> u64 {
        self.shared.pool.outstanding()
    }

    pub async fn start(
        self: &Arc<Self>,
        test: bool,
    ) -> Result<Vec<ListenerInfo>, RelpServiceError> {
        let mut status = self.status.lock().await;
        match *status {
            ServiceStatus::FinalStopped => return Err(RelpServiceError::DefinitelyStopped),
            ServiceStatus::Stopped | ServiceStatus::Waiting => {}
            _ => return Err(RelpServiceError::NotStopped),
        }
        let store_stasher = match (self.direct, &self.stasher) {
            (true, _) => None,
            (false, Some(stasher)) => Some(Arc::clone(stasher)),
            (false, None) => return Err(RelpServiceError::NoStasher),
        };

        let infos = self.streaming.init_listeners().await;
        if infos.is_empty() {
            tracing::debug!("RELP service not started: no listener");
            return Ok(infos);
        }

        let mut producer = None;
        let mut delivery_rx = None;
        if !test && self.direct {
            let kafka_conf = self.kafka_conf.lock().clone();
            match RelpProducer::new(&kafka_conf) {
                Ok((p, rx)) => {
                    producer = Some(p);
                    delivery_rx = Some(rx);
                }
                Err(e) => {
                    self.streaming.reset_listeners().await;
                    return Err(e.into());
                }
            }
        }

        tracing::info!(nb_services = infos.len(), "listening on RELP");

        let queue_size = self.queue_size.load(Ordering::Relaxed);
        let (raw_tx, raw_rx) = crossfire::mpmc::bounded_async(queue_size);
        *self.shared.raw_tx.lock() = Some(raw_tx);

        let configs: Arc<HashMap<ConfId, Arc<SyslogConfig>>> = Arc::new(
            self.streaming
                .configs()
                .iter()
                .map(|c| (c.conf_id, Arc::clone(c)))
                .collect(),
        );

        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let parallelism = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);

        if self.direct {
            let (parsed_tx, parsed_rx) = crossfire::mpmc::bounded_async(queue_size);
            for _ in 0..parallelism {
                self.workers.spawn(parse_loop(
                    Arc::clone(&self.shared),
                    raw_rx.clone(),
                    ParsedSink::Direct(parsed_tx.clone()),
                    events_tx.clone(),
                ));
            }
            self.workers.spawn(fanout_loop(
                Arc::clone(&self.shared),
                parsed_rx,
                configs,
                producer,
                test,
            ));
            if let Some(rx) = delivery_rx {
                self.workers
                    .spawn(delivery_loop(Arc::clone(&self.shared), rx, events_tx.clone()));
            }
        } else if let Some(stasher) = store_stasher {
            for _ in 0..parallelism {
                self.workers.spawn(parse_loop(
                    Arc::clone(&self.shared),
                    raw_rx.clone(),
                    ParsedSink::Store(Arc::clone(&stasher)),
                    events_tx.clone(),
                ));
            }
        }
        drop(events_tx);
        drop(raw_rx);

        // fatal destination errors halt the service into Waiting; detached
        // so stopping can join the workers without waiting on itself
        let this = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(event) = events_rx.recv().await {
                let ServiceEvent::Fatal(reason) = event;
                tracing::warn!(reason, "fatal destination error, stopping the RELP service");
                this.stop_and_wait().await;
                break;
            }
        });

        *status = ServiceStatus::Started;
        self.send_status(ServiceStatus::Started);
        self.streaming.listen();
        Ok(infos)
    }

    pub async fn stop(self: &Arc<Self>) {
        self.do_stop(false, false).await;
    }

    pub async fn final_stop(self: &Arc<Self>) {
        self.do_stop(true, false).await;
    }

    pub async fn stop_and_wait(self: &Arc<Self>) {
        self.do_stop(false, true).await;
    }

    /// Leave `Waiting` and ask the wrapper for a restart
    pub async fn end_wait(&self) {
        let mut status = self.status.lock().await;
        if *status != ServiceStatus::Waiting {
            return;
        }
        *status = ServiceStatus::Stopped;
        self.send_status(ServiceStatus::Stopped);
    }

    async fn do_stop(self: &Arc<Self>, finality: bool, wait: bool) {
        let mut status = self.status.lock().await;

        if finality
            && matches!(
                *status,
                ServiceStatus::Waiting | ServiceStatus::Stopped | ServiceStatus::FinalStopped
            )
        {
            if *status != ServiceStatus::FinalStopped {
                *status = ServiceStatus::FinalStopped;
                self.send_status(ServiceStatus::FinalStopped);
                self.close_status();
            }
            return;
        }

        if matches!(
            *status,
            ServiceStatus::Stopped | ServiceStatus::FinalStopped | ServiceStatus::Waiting
        ) {
            if *status == ServiceStatus::Stopped && wait {
                *status = ServiceStatus::Waiting;
                self.send_status(ServiceStatus::Waiting);
            }
            return;
        }

        // stop an actually started service, in dependency order:
        // listeners first, then the ring, then the workers
        self.streaming.reset_listeners().await;
        self.shared.raw_tx.lock().take();
        self.workers.close();
        self.workers.wait().await;
        self.workers.reopen();
        self.shared.forwarder.remove_all();

        if finality {
            *status = ServiceStatus::FinalStopped;
            self.send_status(ServiceStatus::FinalStopped);
            self.close_status();
        } else if wait {
            *status = ServiceStatus::Waiting;
            self.send_status(ServiceStatus::Waiting);
        } else {
            *status = ServiceStatus::Stopped;
            self.send_status(ServiceStatus::Stopped);
        }
    }
}

/// The RELP service as the rest of the daemon sees it
pub struct RelpService {
    reporter: Arc<dyn Reporter>,
    stasher: Option<Arc<dyn Stasher>>,
    binder: Option<Arc<BinderClient>>,
    conf: Arc<parking_lot::Mutex<RelpConf>>,
    current: tokio::sync::Mutex<Option<Arc<RelpServiceImpl>>>,
    watchers: TaskTracker,
}

impl RelpService {
    pub fn new(
        reporter: Arc<dyn Reporter>,
        stasher: Option<Arc<dyn Stasher>>,
        binder: Option<Arc<BinderClient>>,
    ) -> Self {
        Self {
            reporter,
            stasher,
            binder,
            conf: Arc::new(parking_lot::Mutex::new(RelpConf::default())),
            current: tokio::sync::Mutex::new(None),
            watchers: TaskTracker::new(),
        }
    }

    pub fn set_conf(&self, conf: RelpConf) {
        *self.conf.lock() = conf;
    }

    /// Bring the service up and keep it up: restarts follow the status
    /// machine until `stop` is called.
    pub async fn start(&self, test: bool) {
        let conf = self.conf.lock().clone();
        let service = Arc::new(RelpServiceImpl::new(
            &conf,
            self.stasher.clone(),
            self.binder.clone(),
        ));
        let Some(mut status_rx) = service.take_status_rx() else {
            return;
        };
        *self.current.lock().await = Some(Arc::clone(&service));

        let reporter = Arc::clone(&self.reporter);
        let conf = Arc::clone(&self.conf);
        let watched = Arc::clone(&service);
        self.watchers.spawn(async move {
            while let Some(state) = status_rx.recv().await {
                match state {
                    ServiceStatus::FinalStopped => {
                        tracing::debug!("the RELP service has been definitely halted");
                        let _ = reporter.report(&[]);
                        return;
                    }
                    ServiceStatus::Stopped => {
                        tracing::debug!("the RELP service is stopped");
                        watched.apply_conf(&conf.lock().clone());
                        match watched.start(test).await {
                            Ok(infos) => {
                                let _ = reporter.report(&infos);
                            }
                            Err(e) => {
                                let _ = reporter.report(&[]);
                                tracing::warn!(error = %e, "the RELP service has failed to start");
                                watched.stop_and_wait().await;
                            }
                        }
                    }
                    ServiceStatus::Waiting => {
                        tracing::debug!("RELP waiting");
                        let waiting = Arc::clone(&watched);
                        tokio::spawn(async move {
                            tokio::time::sleep(WAITING_BACKOFF).await;
                            waiting.end_wait().await;
                        });
                    }
                    ServiceStatus::Started => {
                        tracing::debug!("the RELP service has been started");
                    }
                }
            }
        });

        service.trigger();
    }

    /// Definitive stop; joins the status watcher
    pub async fn stop(&self) {
        if let Some(service) = self.current.lock().await.take() {
            service.final_stop().await;
        }
        self.watchers.close();
        self.watchers.wait().await;
        self.watchers.reopen();
    }

    pub async fn shutdown(&self) {
        self.stop().await;
    }

    pub async fn gather(&self) -> RelpMetricsSnapshot {
        match self.current.lock().await.as_ref() {
            Some(service) => service.metrics_snapshot(),
            None => RelpMetricsSnapshot::default(),
        }
    }
}

#[cfg(test)]
#[path = "service_test.rs"]
mod service_test;
