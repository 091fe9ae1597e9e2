//! Supervisor
//!
//! The privileged parent process: owns the binder, the secret ring and one
//! plugin controller per configured service. Children run unprivileged;
//! everything privileged they need goes through the binder channel each of
//! them inherits.

use std::os::fd::OwnedFd;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;

use skewer_binder::{BinderServer, FdChannel};
use skewer_control::{PluginController, StorePlugin};
use skewer_kring::{MemRing, Ring};
use skewer_model::{BaseConfig, ConfId};

use crate::services::{NETWORK_SERVICES, ServiceType};

/// How long children get to exit cleanly before being killed
const KILL_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct ServeArgs {
    pub config: PathBuf,
    pub store_path: PathBuf,
    pub test: bool,
    pub dumpable: bool,
}

/// Load the daemon config; a missing file means defaults
pub fn load_config(path: &std::path::Path) -> anyhow::Result<BaseConfig> {
    let mut conf: BaseConfig = match std::fs::read_to_string(path) {
        Ok(text) => toml::from_str(&text)
            .with_context(|| format!("parsing {}", path.display()))?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::warn!(path = %path.display(), "no configuration file, using defaults");
            BaseConfig::default()
        }
        Err(e) => return Err(e).with_context(|| format!("reading {}", path.display())),
    };

    // configs are identified by their id everywhere downstream
    for syslog in &mut conf.syslog {
        if syslog.conf_id == ConfId::nil() {
            syslog.conf_id = ConfId::new();
        }
    }
    Ok(conf)
}

/// Run the supervisor until SIGINT/SIGTERM
pub async fn run(args: ServeArgs) -> anyhow::Result<()> {
    let conf = load_config(&args.config)?;
    let ring = MemRing::new(skewer_kring::new_creds());
    tracing::info!(session = %ring.session_id(), "starting skewer session");

    // the store comes first: every other service stashes into it
    let (pipe_read, pipe_write) = nix::unistd::pipe().context("creating the store pipe")?;
    let store_controller = Arc::new(PluginController::new(
        ServiceType::Store.name(),
        None,
        None,
        None,
        Some(pipe_read),
    ));
    store_controller.set_conf(conf.clone());
    store_controller
        .create(args.test, args.dumpable, Some(args.store_path.as_path()), None)
        .await
        .context("creating the store child")?;
    let store = StorePlugin::new(Arc::clone(&store_controller), pipe_write);
    store_controller
        .start()
        .await
        .context("starting the store child")?;

    let mut controllers: Vec<Arc<PluginController>> = Vec::new();
    for typ in NETWORK_SERVICES {
        if !conf.syslog.iter().any(|c| c.protocol == typ.protocol()) {
            tracing::debug!(service = typ.name(), "no endpoint configured, not launching");
            continue;
        }

        // each child gets its own binder channel; the parent end is served
        // by a dedicated binder thread
        let (parent_end, child_end) = FdChannel::pair().context("creating a binder channel")?;
        if let Err(e) = BinderServer::spawn(parent_end) {
            tracing::error!(service = typ.name(), error = %e, "could not spawn the binder");
            continue;
        }
        let binder_fd = OwnedFd::from(child_end.into_stream());

        let controller = Arc::new(PluginController::new(
            typ.name(),
            Some(Arc::clone(&store) as _),
            Some(binder_fd),
            None,
            None,
        ));
        controller.set_conf(conf.clone());
        if let Err(e) = controller.create(args.test, args.dumpable, None, None).await {
            tracing::error!(service = typ.name(), error = %e, "could not create the worker");
            continue;
        }
        match controller.start().await {
            Ok(infos) => {
                tracing::info!(service = typ.name(), ?infos, "worker started");
                controllers.push(controller);
            }
            Err(e) => {
                tracing::error!(service = typ.name(), error = %e, "worker failed to start");
            }
        }
    }

    wait_for_shutdown_signal().await;
    tracing::info!("shutting down");

    for controller in &controllers {
        controller.shutdown(KILL_TIMEOUT).await;
    }
    store.shutdown(KILL_TIMEOUT).await;
    ring.destroy();
    Ok(())
}

async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    let mut term = match signal(SignalKind::terminate()) {
        Ok(term) => term,
        Err(e) => {
            tracing::warn!(error = %e, "cannot listen for SIGTERM");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term.recv() => {}
    }
}
