//! someip-tunnel daemon.
//!
//! Hosts the RPC runtime and one tunnel at a time. The tunnel is rebuilt
//! whenever the gateway announces a new generation on the
//! `LifetimeFromGateway` cell; each fresh tunnel is announced back on
//! `LifetimeToGateway`.
//!
//! Usage: `someip-tunnel [CONFIG.json]` (also `TUNNEL_CONFIG`).

mod config;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use someip_tunnel::bridge::Bridge;
use someip_tunnel::ipc::shm::{GenerationCell, ShmTransport};
use someip_tunnel::rpc::local::LocalRuntime;
use someip_tunnel::supervisor::{Supervisor, Tunnel};
use someip_tunnel::{BridgeError, logging};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::DaemonConfig;

/// How often the lifetime watcher re-checks for cancellation.
const LIFETIME_POLL: Duration = Duration::from_millis(250);

fn config_path() -> Option<PathBuf> {
    std::env::args_os()
        .nth(1)
        .or_else(|| std::env::var_os("TUNNEL_CONFIG"))
        .map(PathBuf::from)
}

/// Forwards generation changes from the shared cell into `tx` until
/// cancelled or nobody listens anymore. `last` is the value `tx` was
/// created with, so nothing published since then is skipped.
fn watch_lifetime(
    cell: GenerationCell,
    mut last: u64,
    tx: watch::Sender<u64>,
    cancel: CancellationToken,
) {
    while !cancel.is_cancelled() {
        let Some(generation) = cell.wait_changed(last, LIFETIME_POLL) else {
            continue;
        };
        last = generation;
        info!(cell = cell.name(), generation, "Gateway generation changed");
        if tx.send(generation).is_err() {
            break;
        }
    }
}

async fn shutdown_signal() -> anyhow::Result<()> {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut terminate =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .context("failed to install SIGTERM handler")?;
        tokio::select! {
            result = ctrl_c => {
                result.context("failed to install Ctrl+C handler")?;
                info!("Received SIGINT, shutting down...");
            }
            _ = terminate.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.context("failed to install Ctrl+C handler")?;
        info!("Received SIGINT, shutting down...");
    }

    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init_tracing();

    let path = config_path();
    let config = DaemonConfig::load(path.as_deref()).context("failed to load configuration")?;
    info!(
        config = ?path,
        shm_dir = %config.shm_dir.display(),
        app = %config.tunnel.app_name,
        "Starting someip-tunnel"
    );

    let from_gateway = GenerationCell::open(&config.shm_dir, &config.lifetime_from_gateway)
        .context("failed to open gateway lifetime cell")?;
    let to_gateway = GenerationCell::open(&config.shm_dir, &config.lifetime_to_gateway)
        .context("failed to open tunnel lifetime cell")?;

    let cancel = CancellationToken::new();
    let initial = from_gateway.load();
    let (generation_tx, generation_rx) = watch::channel(initial);
    let watcher = {
        let cancel = cancel.clone();
        std::thread::Builder::new()
            .name("lifetime-watch".to_string())
            .spawn(move || watch_lifetime(from_gateway, initial, generation_tx, cancel))
            .context("failed to spawn lifetime watcher")?
    };

    let runtime = LocalRuntime::new();
    let transport = Arc::new(ShmTransport::new(&config.shm_dir));
    let tunnel_config = config.tunnel.clone();
    let factory = move |generation: u64| -> Result<Box<dyn Tunnel>, BridgeError> {
        info!(generation, "Starting new tunnel instance");
        let app = runtime.create_application(tunnel_config.app_name.clone());
        let bridge = Bridge::new(app, transport.clone(), tunnel_config.clone());
        bridge.init()?;
        Ok(Box::new(bridge.spawn()?))
    };
    let notifier = move |generation: u64| {
        let announced = to_gateway.bump();
        info!(generation, announced, "Tunnel ready, notifying gateway");
    };

    info!("Entering gateway wait loop");
    let supervisor =
        tokio::spawn(Supervisor::new(factory, notifier).run(generation_rx, cancel.clone()));

    let signal = shutdown_signal().await;
    cancel.cancel();
    supervisor
        .await
        .context("supervisor task panicked")?
        .context("supervisor failed")?;
    if watcher.join().is_err() {
        tracing::error!("Lifetime watcher panicked");
    }
    signal?;

    info!("someip-tunnel stopped");
    Ok(())
}
