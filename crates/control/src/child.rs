//! Child-side runtime
//!
//! A confined worker reads parent commands from stdin and answers on
//! stdout, both length-delimited. All stdout traffic funnels through one
//! writer task so the service, its reporter and the command loop never
//! interleave frames.

use std::os::fd::RawFd;
use std::sync::Arc;

use bytes::BytesMut;
use tokio::sync::{mpsc, oneshot};

use skewer_model::{BaseConfig, ListenerInfo, Reporter, StashError, Stasher, TcpUdpParsedMessage};

use crate::codec::{ChildMessage, ControlCodec, ParentCommand, read_frame, write_frame};
use crate::{HAS_LOGGER_ENV, HAS_PIPE_ENV, TEST_ENV};

/// Descriptor numbers inherited from the supervisor
///
/// Present descriptors are assigned sequentially from 3, binder first,
/// then logger, then the message pipe; the `SKEWER_HAS_*` flags say which
/// are present.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChildFds {
    pub binder: Option<RawFd>,
    pub logger: Option<RawFd>,
    pub pipe: Option<RawFd>,
}

/// Compute the inherited descriptor numbers from the environment
pub fn child_fds() -> ChildFds {
    let mut fds = ChildFds::default();
    let mut next: RawFd = 3;
    if std::env::var_os(skewer_binder::HAS_BINDER_ENV).is_some() {
        fds.binder = Some(next);
        next += 1;
    }
    if std::env::var_os(HAS_LOGGER_ENV).is_some() {
        fds.logger = Some(next);
        next += 1;
    }
    if std::env::var_os(HAS_PIPE_ENV).is_some() {
        fds.pipe = Some(next);
    }
    fds
}

/// Whether the supervisor asked for test mode
pub fn is_test_mode() -> bool {
    std::env::var_os(TEST_ENV).is_some()
}

/// Handle for writing frames to the supervisor
#[derive(Clone)]
pub struct ChildOutput {
    tx: mpsc::UnboundedSender<ChildMessage>,
}

impl ChildOutput {
    pub fn send(&self, msg: ChildMessage) {
        let _ = self.tx.send(msg);
    }
}

/// Create the stdout funnel: a handle for senders and the receiver the
/// runtime's writer task drains
pub fn child_output() -> (ChildOutput, mpsc::UnboundedReceiver<ChildMessage>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (ChildOutput { tx }, rx)
}

/// Reporter that turns listener announcements into control frames
///
/// The first report of a start cycle is intercepted and handed to whoever
/// subscribed (the `started` handshake); later reports go out as `infos`
/// re-announcements.
pub struct ChildReporter {
    out: ChildOutput,
    first: parking_lot::Mutex<Option<oneshot::Sender<Vec<ListenerInfo>>>>,
}

impl ChildReporter {
    pub fn new(out: ChildOutput) -> Arc<Self> {
        Arc::new(Self {
            out,
            first: parking_lot::Mutex::new(None),
        })
    }

    /// The next report resolves this receiver instead of emitting `infos`
    pub fn subscribe_next(&self) -> oneshot::Receiver<Vec<ListenerInfo>> {
        let (tx, rx) = oneshot::channel();
        *self.first.lock() = Some(tx);
        rx
    }
}

impl Reporter for ChildReporter {
    fn report(&self, infos: &[ListenerInfo]) -> std::io::Result<()> {
        if let Some(tx) = self.first.lock().take() {
            let _ = tx.send(infos.to_vec());
        } else {
            self.out.send(ChildMessage::Infos(infos.to_vec()));
        }
        Ok(())
    }
}

/// Stasher that ships messages to the supervisor as `syslog` frames
pub struct ChildStasher {
    out: ChildOutput,
}

impl ChildStasher {
    pub fn new(out: ChildOutput) -> Arc<Self> {
        Arc::new(Self { out })
    }
}

impl Stasher for ChildStasher {
    fn stash(&self, msg: TcpUdpParsedMessage) -> Result<(), StashError> {
        self.out.send(ChildMessage::Syslog(msg));
        Ok(())
    }
}

/// The service half a child worker exposes to the runtime
pub trait ChildService: Send {
    fn set_conf(&mut self, conf: BaseConfig) -> Result<(), String>;
    fn start(&mut self, test: bool) -> impl Future<Output = Result<Vec<ListenerInfo>, String>> + Send;
    fn stop(&mut self) -> impl Future<Output = ()> + Send;
    fn shutdown(&mut self) -> impl Future<Output = ()> + Send;
    fn gather(&mut self) -> impl Future<Output = serde_json::Value> + Send;

    /// Services without listening endpoints (the store) override this so an
    /// empty info set is not an error
    fn expects_listeners(&self) -> bool {
        true
    }
}

/// Command loop of a child worker; returns when the supervisor says
/// `shutdown` or goes away
pub async fn run_child<S: ChildService>(
    mut service: S,
    output: ChildOutput,
    mut output_rx: mpsc::UnboundedReceiver<ChildMessage>,
) -> std::io::Result<()> {
    let test = is_test_mode();

    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        let mut codec = ControlCodec::new();
        while let Some(msg) = output_rx.recv().await {
            match msg.encode() {
                Ok(payload) => {
                    if write_frame(&mut stdout, &mut codec, payload).await.is_err() {
                        break;
                    }
                }
                Err(e) => tracing::warn!(error = %e, "failed to encode a control frame"),
            }
        }
    });

    let mut stdin = tokio::io::stdin();
    let mut codec = ControlCodec::new();
    let mut buf = BytesMut::with_capacity(4096);

    loop {
        let frame = match read_frame(&mut stdin, &mut codec, &mut buf).await {
            Ok(Some(frame)) => frame,
            // supervisor is gone; nothing left to serve
            Ok(None) => {
                service.shutdown().await;
                break;
            }
            Err(e) => {
                tracing::error!(error = %e, "control channel broken, exiting");
                service.shutdown().await;
                break;
            }
        };
        let command = match ParentCommand::decode(&frame) {
            Ok(command) => command,
            Err(e) => {
                tracing::error!(error = %e, "unknown parent command, exiting");
                service.shutdown().await;
                break;
            }
        };

        match command {
            ParentCommand::Conf(conf) => {
                if let Err(reason) = service.set_conf(conf) {
                    output.send(ChildMessage::ConfError(reason));
                }
            }
            ParentCommand::Start => match service.start(test).await {
                Ok(infos) if infos.is_empty() && service.expects_listeners() => {
                    output.send(ChildMessage::NoListenerError)
                }
                Ok(infos) => output.send(ChildMessage::Started(infos)),
                Err(reason) => output.send(ChildMessage::StartError(reason)),
            },
            ParentCommand::Stop => {
                service.stop().await;
                output.send(ChildMessage::Stopped);
            }
            ParentCommand::Shutdown => {
                service.shutdown().await;
                output.send(ChildMessage::Shutdown);
                break;
            }
            ParentCommand::GatherMetrics => {
                output.send(ChildMessage::Metrics(service.gather().await));
            }
        }
    }

    drop(output);
    // let the writer drain everything, the supervisor waits for our EOF
    drop(service);
    let _ = writer.await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fd_numbers_follow_presence_order() {
        // computed directly, not from the process environment, to keep the
        // test hermetic
        fn layout(binder: bool, logger: bool, pipe: bool) -> ChildFds {
            let mut fds = ChildFds::default();
            let mut next: RawFd = 3;
            if binder {
                fds.binder = Some(next);
                next += 1;
            }
            if logger {
                fds.logger = Some(next);
                next += 1;
            }
            if pipe {
                fds.pipe = Some(next);
            }
            fds
        }

        assert_eq!(
            layout(true, true, true),
            ChildFds {
                binder: Some(3),
                logger: Some(4),
                pipe: Some(5)
            }
        );
        assert_eq!(
            layout(false, true, false),
            ChildFds {
                binder: None,
                logger: Some(3),
                pipe: None
            }
        );
        assert_eq!(
            layout(true, false, true),
            ChildFds {
                binder: Some(3),
                logger: None,
                pipe: Some(4)
            }
        );
    }

    #[tokio::test]
    async fn reporter_first_report_is_intercepted() {
        let (out, mut rx) = child_output();
        let reporter = ChildReporter::new(out);

        let first = reporter.subscribe_next();
        let infos = vec![ListenerInfo::net("relp", "127.0.0.1", 2514)];
        reporter.report(&infos).unwrap();
        assert_eq!(first.await.unwrap(), infos);

        // later reports become infos frames
        reporter.report(&infos).unwrap();
        match rx.recv().await.unwrap() {
            ChildMessage::Infos(got) => assert_eq!(got, infos),
            other => panic!("expected infos, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn child_stasher_emits_syslog_frames() {
        let (out, mut rx) = child_output();
        let stasher = ChildStasher::new(out);

        let mut msg = TcpUdpParsedMessage::default();
        msg.parsed.fields.message = "to the store".into();
        stasher.stash(msg.clone()).unwrap();

        match rx.recv().await.unwrap() {
            ChildMessage::Syslog(got) => assert_eq!(got, msg),
            other => panic!("expected syslog, got {other:?}"),
        }
    }
}
