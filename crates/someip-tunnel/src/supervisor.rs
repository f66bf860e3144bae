//! Lifetime supervisor - rebuilds the tunnel when the peer restarts.
//!
//! The peer publishes a generation value (its process id) whenever it
//! starts. A changed generation means every correlation entry and
//! advertisement of the current tunnel is stale, so the supervisor stops the
//! tunnel and builds a fresh one, then reports readiness back to the peer.
//!
//! Generation 0 means no peer has announced itself yet.
//!
//! Tunnel start and stop block, so both run on the blocking pool.

use std::sync::Arc;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::bridge::{BridgeError, RunningBridge};

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("tunnel task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// A started tunnel that can be stopped.
pub trait Tunnel: Send {
    fn stop(self: Box<Self>) -> Result<(), BridgeError>;
}

impl Tunnel for RunningBridge {
    fn stop(self: Box<Self>) -> Result<(), BridgeError> {
        RunningBridge::stop(*self)
    }
}

/// Builds and starts a tunnel for one peer generation.
pub trait TunnelFactory: Send + Sync + 'static {
    fn create(&self, generation: u64) -> Result<Box<dyn Tunnel>, BridgeError>;
}

impl<F> TunnelFactory for F
where
    F: Fn(u64) -> Result<Box<dyn Tunnel>, BridgeError> + Send + Sync + 'static,
{
    fn create(&self, generation: u64) -> Result<Box<dyn Tunnel>, BridgeError> {
        self(generation)
    }
}

/// Tells the peer a tunnel is ready for it.
pub trait ReadinessNotifier: Send + Sync + 'static {
    fn tunnel_ready(&self, generation: u64);
}

impl<F> ReadinessNotifier for F
where
    F: Fn(u64) + Send + Sync + 'static,
{
    fn tunnel_ready(&self, generation: u64) {
        self(generation)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Idle,
    TunnelActive { generation: u64 },
}

pub struct Supervisor {
    factory: Arc<dyn TunnelFactory>,
    notifier: Arc<dyn ReadinessNotifier>,
    active: Option<(u64, Box<dyn Tunnel>)>,
}

impl Supervisor {
    pub fn new(
        factory: impl TunnelFactory,
        notifier: impl ReadinessNotifier,
    ) -> Self {
        Self {
            factory: Arc::new(factory),
            notifier: Arc::new(notifier),
            active: None,
        }
    }

    pub fn state(&self) -> SupervisorState {
        match &self.active {
            Some((generation, _)) => SupervisorState::TunnelActive {
                generation: *generation,
            },
            None => SupervisorState::Idle,
        }
    }

    /// Follows `generations` until `cancel` fires or the sender goes away,
    /// then stops the active tunnel.
    pub async fn run(
        mut self,
        mut generations: watch::Receiver<u64>,
        cancel: CancellationToken,
    ) -> Result<(), SupervisorError> {
        let initial = *generations.borrow_and_update();
        self.handle_generation(initial).await?;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("Supervisor cancelled");
                    break;
                }
                changed = generations.changed() => {
                    if changed.is_err() {
                        tracing::warn!("Generation source closed");
                        break;
                    }
                    let generation = *generations.borrow_and_update();
                    self.handle_generation(generation).await?;
                }
            }
        }

        self.stop_active().await
    }

    /// Brings the tunnel in line with `generation`.
    pub async fn handle_generation(&mut self, generation: u64) -> Result<(), SupervisorError> {
        match self.state() {
            SupervisorState::TunnelActive { generation: current } if current == generation => {
                return Ok(());
            }
            SupervisorState::Idle if generation == 0 => return Ok(()),
            _ => {}
        }

        if self.active.is_some() {
            tracing::info!(generation, "Peer restarted, rebuilding tunnel");
            self.stop_active().await?;
        }
        if generation == 0 {
            return Ok(());
        }

        let factory = Arc::clone(&self.factory);
        match tokio::task::spawn_blocking(move || factory.create(generation)).await? {
            Ok(tunnel) => {
                self.active = Some((generation, tunnel));
                tracing::info!(generation, "Tunnel active");
                self.notifier.tunnel_ready(generation);
            }
            Err(e) => {
                tracing::error!(generation, error = %e, "Failed to create tunnel");
            }
        }
        Ok(())
    }

    async fn stop_active(&mut self) -> Result<(), SupervisorError> {
        let Some((generation, tunnel)) = self.active.take() else {
            return Ok(());
        };
        if let Err(e) = tokio::task::spawn_blocking(move || tunnel.stop()).await? {
            tracing::warn!(generation, error = %e, "Tunnel stopped with error");
        } else {
            tracing::debug!(generation, "Tunnel stopped");
        }
        Ok(())
    }
}
