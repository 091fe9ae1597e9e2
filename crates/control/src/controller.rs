//! Plugin controller
//!
//! Supervisor-side lifecycle of one child worker:
//!
//! ```text
//! NEW ──create──▶ CREATED ──start──▶ STARTED ──stop/shutdown──▶ STOPPED
//!                    │                                              │
//!                    ├──child exit─────▶ reaped ◀──kill on timeout──┘
//!                    └──start error────▶ shutdown
//! ```
//!
//! The child is the daemon's own executable, re-invoked as
//! `confined-<name>` with inherited descriptors mapped to fixed numbers
//! (binder first at 3, then logger, then message pipe) and the matching
//! `SKEWER_HAS_*` environment flags. Spawning tries a user namespace first
//! and falls back to a plain process when namespaces are unavailable.
//!
//! One listen loop per child reads its stdout for the whole process
//! lifetime; a `stopped` message ends the current start cycle, EOF or a
//! malformed frame ends the child.

use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::AsyncRead;
use tokio::process::{Child, ChildStdin};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use skewer_binder::HAS_BINDER_ENV;
use skewer_model::{BaseConfig, ListenerInfo, Stasher};

use crate::codec::{ChildMessage, ControlCodec, ControlError, ParentCommand, read_frame,
    write_frame};
use crate::{HAS_LOGGER_ENV, HAS_PIPE_ENV, TEST_ENV};

/// How long `Start` waits for the child's `started` handshake
const START_TIMEOUT: Duration = Duration::from_secs(3);

/// How long `Gather` waits for a metrics reply
const GATHER_TIMEOUT: Duration = Duration::from_secs(2);

type StartTx = oneshot::Sender<Result<Vec<ListenerInfo>, ControlError>>;

/// Environment variable carrying the store's data directory
pub const STORE_PATH_ENV: &str = "SKEWER_STORE_PATH";

/// Environment variable carrying the configuration directory
pub const CONF_DIR_ENV: &str = "SKEWER_CONF_DIR";

struct SpawnEnv<'a> {
    test: bool,
    dumpable: bool,
    store_path: Option<&'a std::path::Path>,
    conf_dir: Option<&'a std::path::Path>,
}

/// Shared state between the controller, its listen loop and its reaper,
/// recreated on every `create`
pub(crate) struct ChildLink {
    pub(crate) name: String,
    pub(crate) stasher: Option<Arc<dyn Stasher>>,
    pub(crate) started: AtomicBool,
    /// Start handshake of the current cycle
    pub(crate) start_slot: parking_lot::Mutex<Option<StartTx>>,
    /// Pending metrics request, if any
    pub(crate) metrics_slot: parking_lot::Mutex<Option<oneshot::Sender<serde_json::Value>>>,
    /// Cancelled when the current start cycle has ended
    pub(crate) stop_done: parking_lot::Mutex<CancellationToken>,
    /// Cancelling asks the reaper to kill the child
    pub(crate) kill_token: CancellationToken,
    /// Cancelled by the reaper once the child exited
    pub(crate) process_done: CancellationToken,
}

impl ChildLink {
    pub(crate) fn new(name: String, stasher: Option<Arc<dyn Stasher>>) -> Self {
        // waits on a cycle that never ran must not hang
        let stop_done = CancellationToken::new();
        stop_done.cancel();
        Self {
            name,
            stasher,
            started: AtomicBool::new(false),
            start_slot: parking_lot::Mutex::new(None),
            metrics_slot: parking_lot::Mutex::new(None),
            stop_done: parking_lot::Mutex::new(stop_done),
            kill_token: CancellationToken::new(),
            process_done: CancellationToken::new(),
        }
    }

    fn fail_start(&self, error: ControlError) {
        if let Some(tx) = self.start_slot.lock().take() {
            let _ = tx.send(Err(error));
        }
    }
}

/// Launches and supervises one confined child service
pub struct PluginController {
    name: String,
    conf: parking_lot::Mutex<BaseConfig>,
    /// Where `syslog` messages from the child are stashed
    stasher: Option<Arc<dyn Stasher>>,

    binder_fd: Option<OwnedFd>,
    logger_fd: Option<OwnedFd>,
    pipe_fd: Option<OwnedFd>,

    created: AtomicBool,
    link: parking_lot::Mutex<Arc<ChildLink>>,
    stdin: tokio::sync::Mutex<Option<(ChildStdin, ControlCodec)>>,
    exit_code: Arc<AtomicI32>,
}

impl PluginController {
    pub fn new(
        name: impl Into<String>,
        stasher: Option<Arc<dyn Stasher>>,
        binder_fd: Option<OwnedFd>,
        logger_fd: Option<OwnedFd>,
        message_pipe: Option<OwnedFd>,
    ) -> Self {
        let name = name.into();
        let link = Arc::new(ChildLink::new(name.clone(), stasher.clone()));
        Self {
            name,
            conf: parking_lot::Mutex::new(BaseConfig::default()),
            stasher,
            binder_fd,
            logger_fd,
            pipe_fd: message_pipe,
            created: AtomicBool::new(false),
            link: parking_lot::Mutex::new(link),
            stdin: tokio::sync::Mutex::new(None),
            exit_code: Arc::new(AtomicI32::new(0)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_conf(&self, conf: BaseConfig) {
        *self.conf.lock() = conf;
    }

    /// Exit code of the reaped child; meaningful once the process is done
    pub fn exit_code(&self) -> i32 {
        self.exit_code.load(Ordering::Relaxed)
    }

    /// Token observers can use to learn the child process has exited
    pub fn process_done(&self) -> CancellationToken {
        self.link.lock().process_done.clone()
    }

    /// Spawn the child process. Idempotent while the child lives.
    pub async fn create(
        &self,
        test: bool,
        dumpable: bool,
        store_path: Option<&std::path::Path>,
        conf_dir: Option<&std::path::Path>,
    ) -> Result<(), ControlError> {
        if self.created.load(Ordering::Acquire) {
            return Ok(());
        }

        let link = Arc::new(ChildLink::new(self.name.clone(), self.stasher.clone()));
        *self.link.lock() = Arc::clone(&link);
        self.exit_code.store(0, Ordering::Relaxed);

        let spawn = SpawnEnv {
            test,
            dumpable,
            store_path,
            conf_dir,
        };

        // user namespace first, plain spawn as the fallback
        let mut child = match self.spawn_child(&spawn, true) {
            Ok(child) => child,
            Err(e) => {
                tracing::warn!(
                    name = %self.name,
                    error = %e,
                    "starting plugin in user namespace failed"
                );
                self.spawn_child(&spawn, false)?
            }
        };

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| ControlError::Io(std::io::Error::other("child stdin unavailable")))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ControlError::Io(std::io::Error::other("child stdout unavailable")))?;
        *self.stdin.lock().await = Some((stdin, ControlCodec::new()));
        self.created.store(true, Ordering::Release);

        tokio::spawn(listen_loop(Arc::clone(&link), stdout));

        // reaper: records the exit code, closes process_done, kills on demand
        let exit_code = Arc::clone(&self.exit_code);
        tokio::spawn(async move {
            tokio::select! {
                status = child.wait() => {
                    record_exit(&link.name, status, &exit_code);
                }
                _ = link.kill_token.cancelled() => {
                    tracing::warn!(name = %link.name, "killing plugin child");
                    let _ = child.start_kill();
                    let status = child.wait().await;
                    record_exit(&link.name, status, &exit_code);
                }
            }
            link.process_done.cancel();
        });
        Ok(())
    }

    fn spawn_child(&self, spawn: &SpawnEnv<'_>, namespaced: bool) -> Result<Child, ControlError> {
        use std::os::unix::process::CommandExt;

        let exe = std::env::current_exe().map_err(ControlError::Io)?;
        let argv0 = if namespaced {
            format!("confined-{}", self.name)
        } else {
            self.name.clone()
        };

        let mut cmd = std::process::Command::new(&exe);
        cmd.arg0(argv0)
            .env_clear()
            .env("PATH", "/bin:/usr/bin")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());

        let mut targets: Vec<(RawFd, RawFd)> = Vec::new();
        let mut next_fd: RawFd = 3;
        if let Some(fd) = &self.binder_fd {
            targets.push((fd.as_raw_fd(), next_fd));
            next_fd += 1;
            cmd.env(HAS_BINDER_ENV, "TRUE");
        }
        if let Some(fd) = &self.logger_fd {
            targets.push((fd.as_raw_fd(), next_fd));
            next_fd += 1;
            cmd.env(HAS_LOGGER_ENV, "TRUE");
        }
        if let Some(fd) = &self.pipe_fd {
            targets.push((fd.as_raw_fd(), next_fd));
            cmd.env(HAS_PIPE_ENV, "TRUE");
        }
        if spawn.test {
            cmd.env(TEST_ENV, "TRUE");
        }
        if let Some(path) = spawn.store_path {
            cmd.env(STORE_PATH_ENV, path);
        }
        if let Some(path) = spawn.conf_dir {
            cmd.env(CONF_DIR_ENV, path);
        }

        let dumpable = spawn.dumpable;
        unsafe {
            cmd.pre_exec(move || {
                for &(src, tgt) in &targets {
                    if src == tgt {
                        // inherited as-is; just clear close-on-exec
                        nix::fcntl::fcntl(
                            src,
                            nix::fcntl::FcntlArg::F_SETFD(nix::fcntl::FdFlag::empty()),
                        )?;
                    } else {
                        nix::unistd::dup2(src, tgt)?;
                    }
                }
                if !dumpable {
                    let _ = nix::sys::resource::setrlimit(
                        nix::sys::resource::Resource::RLIMIT_CORE,
                        0,
                        0,
                    );
                }
                #[cfg(target_os = "linux")]
                if namespaced {
                    nix::sched::unshare(nix::sched::CloneFlags::CLONE_NEWUSER)?;
                }
                Ok(())
            });
        }

        #[cfg(not(target_os = "linux"))]
        if namespaced {
            return Err(ControlError::Io(std::io::Error::other(
                "user namespaces are only available on linux",
            )));
        }

        let child = tokio::process::Command::from(cmd)
            .kill_on_drop(false)
            .spawn()
            .map_err(ControlError::Io)?;
        Ok(child)
    }

    async fn write(&self, command: ParentCommand) -> Result<(), ControlError> {
        let mut guard = self.stdin.lock().await;
        let Some((stdin, codec)) = guard.as_mut() else {
            return Err(ControlError::Io(std::io::Error::other("stdin is gone")));
        };
        write_frame(stdin, codec, command.encode()?).await
    }

    /// Send config and `start`, then wait for the child's handshake
    pub async fn start(&self) -> Result<Vec<ListenerInfo>, ControlError> {
        if !self.created.load(Ordering::Acquire) {
            return Err(ControlError::NotCreated(self.name.clone()));
        }
        let link = self.link.lock().clone();
        if link.started.load(Ordering::Acquire) {
            return Err(ControlError::AlreadyStarted(self.name.clone()));
        }

        let stop_done = CancellationToken::new();
        *link.stop_done.lock() = stop_done;
        let (start_tx, start_rx) = oneshot::channel();
        *link.start_slot.lock() = Some(start_tx);

        let conf = self.conf.lock().clone();
        self.write(ParentCommand::Conf(conf)).await?;
        self.write(ParentCommand::Start).await?;

        let outcome = match tokio::time::timeout(START_TIMEOUT, start_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ControlError::UnexpectedEnd),
            Err(_) => Err(ControlError::StartTimeout),
        };

        match outcome {
            Ok(infos) => {
                link.started.store(true, Ordering::Release);
                Ok(infos)
            }
            Err(e) => {
                self.shutdown(Duration::from_secs(3)).await;
                Err(e)
            }
        }
    }

    /// Ask the child to halt its service; waits for the cycle to end
    pub async fn stop(&self) {
        if !self.created.load(Ordering::Acquire) {
            return;
        }
        let link = self.link.lock().clone();
        let stop_done = link.stop_done.lock().clone();
        if link.process_done.is_cancelled() || stop_done.is_cancelled() {
            return;
        }
        match self.write(ParentCommand::Stop).await {
            Ok(()) => stop_done.cancelled().await,
            Err(e) => tracing::warn!(name = %self.name, error = %e, "error writing stop to plugin"),
        }
    }

    /// Ask the child to exit; kill it after `kill_timeout`
    pub async fn shutdown(&self, kill_timeout: Duration) {
        if !self.created.load(Ordering::Acquire) {
            return;
        }
        let link = self.link.lock().clone();
        let stop_done = link.stop_done.lock().clone();

        if !link.process_done.is_cancelled() {
            let mut kill_timeout = kill_timeout;
            if let Err(e) = self.write(ParentCommand::Shutdown).await {
                tracing::warn!(
                    name = %self.name,
                    error = %e,
                    "error writing shutdown to plugin stdin, killing brutally"
                );
                kill_timeout = Duration::from_secs(1);
            }
            if kill_timeout.is_zero() {
                link.process_done.cancelled().await;
            } else if tokio::time::timeout(kill_timeout, link.process_done.cancelled())
                .await
                .is_err()
            {
                tracing::warn!(name = %self.name, "plugin failed to shutdown before timeout");
                link.kill_token.cancel();
                link.process_done.cancelled().await;
            }
        }

        stop_done.cancelled().await;
        self.created.store(false, Ordering::Release);
        link.started.store(false, Ordering::Release);
        *self.stdin.lock().await = None;
    }

    /// Collect metrics from the child; null on any failure or timeout
    pub async fn gather(&self) -> serde_json::Value {
        let link = self.link.lock().clone();
        if link.process_done.is_cancelled() || !link.started.load(Ordering::Acquire) {
            return serde_json::Value::Null;
        }

        let (tx, rx) = oneshot::channel();
        *link.metrics_slot.lock() = Some(tx);
        if self.write(ParentCommand::GatherMetrics).await.is_err() {
            return serde_json::Value::Null;
        }
        match tokio::time::timeout(GATHER_TIMEOUT, rx).await {
            Ok(Ok(value)) => value,
            _ => serde_json::Value::Null,
        }
    }
}

fn record_exit(
    name: &str,
    status: std::io::Result<std::process::ExitStatus>,
    exit_code: &AtomicI32,
) {
    match status {
        Ok(status) => {
            let code = status.code().unwrap_or(-1);
            exit_code.store(code, Ordering::Relaxed);
            if status.success() {
                tracing::debug!(name, "plugin process has exited without reporting error");
            } else {
                tracing::error!(name, code, "plugin process has shut down with error");
            }
        }
        Err(e) => {
            exit_code.store(-1, Ordering::Relaxed);
            tracing::error!(name, error = %e, "plugin process exit could not be interpreted");
        }
    }
}

/// Reads child messages for the lifetime of the process. A `stopped`
/// message ends the current start cycle; EOF or a protocol violation ends
/// the child (with a kill when it misbehaved).
pub(crate) async fn listen_loop<R: AsyncRead + Unpin + Send + 'static>(
    link: Arc<ChildLink>,
    mut stdout: R,
) {
    let mut codec = ControlCodec::new();
    let mut buf = BytesMut::with_capacity(4096);
    let mut initialized = false;
    let mut kill = false;

    loop {
        let message = match read_frame(&mut stdout, &mut codec, &mut buf).await {
            Ok(Some(frame)) => ChildMessage::decode(&frame),
            Ok(None) => {
                // child stdout closed: the process is exiting; wait for the
                // reaper before deciding anything
                link.process_done.cancelled().await;
                break;
            }
            Err(e) => Err(e),
        };
        let message = match message {
            Ok(message) => message,
            Err(e) => {
                tracing::error!(name = %link.name, error = %e, "plugin control protocol error");
                link.fail_start(ControlError::UnexpectedEnd);
                kill = true;
                break;
            }
        };

        match message {
            ChildMessage::Started(infos) => {
                initialized = true;
                if let Some(tx) = link.start_slot.lock().take() {
                    let _ = tx.send(Ok(infos));
                }
            }
            ChildMessage::StartError(text) => link.fail_start(ControlError::StartError(text)),
            ChildMessage::ConfError(text) => link.fail_start(ControlError::ConfError(text)),
            ChildMessage::NoListenerError => link.fail_start(ControlError::NoListener),
            ChildMessage::Infos(infos) => {
                tracing::info!(name = %link.name, ?infos, "plugin reported listener infos");
            }
            ChildMessage::Syslog(msg) => {
                if !initialized {
                    tracing::error!(
                        name = %link.name,
                        "plugin sent a syslog message before being initialized"
                    );
                    link.fail_start(ControlError::UnexpectedEnd);
                    kill = true;
                    break;
                }
                if let Some(stasher) = &link.stasher
                    && let Err(e) = stasher.stash(msg)
                {
                    tracing::warn!(name = %link.name, error = %e, "failed to stash plugin message");
                }
            }
            ChildMessage::Metrics(value) => {
                if let Some(tx) = link.metrics_slot.lock().take() {
                    let _ = tx.send(value);
                }
            }
            ChildMessage::Stopped => {
                // clean end of this start cycle; the process lives on
                tracing::debug!(name = %link.name, "plugin has stopped normally");
                initialized = false;
                link.started.store(false, Ordering::Release);
                link.stop_done.lock().cancel();
            }
            ChildMessage::Shutdown => {
                // the child will exit; keep reading until EOF
            }
        }
    }

    tracing::debug!(name = %link.name, "plugin controller listen loop is stopping");
    link.fail_start(ControlError::UnexpectedEnd);
    link.started.store(false, Ordering::Release);

    if kill && !link.process_done.is_cancelled() {
        link.kill_token.cancel();
        link.process_done.cancelled().await;
    }
    link.stop_done.lock().cancel();
}

#[cfg(test)]
#[path = "controller_test.rs"]
mod controller_test;
