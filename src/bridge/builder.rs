use std::any::Any;
use std::sync::Arc;

use tokio::runtime::Builder as RuntimeBuilder;
use tokio::sync::watch;

use crate::camera::CameraClient;
use crate::config::BridgeConfig;
use crate::error::{Error, Result};
use crate::health::HealthState;

use super::orchestrator::Orchestrator;

/// Entry point: couples a configuration with the camera collaborator that
/// will provide the doorbell leg.
pub struct DoorbellBridgeBuilder<C> {
    config: BridgeConfig,
    camera: C,
}

impl<C> DoorbellBridgeBuilder<C>
where
    C: CameraClient,
{
    pub fn new(config: BridgeConfig, camera: C) -> Self {
        Self { config, camera }
    }

    pub fn build(self) -> Result<BridgeRuntime<C>> {
        validate(&self.config)?;
        Ok(BridgeRuntime {
            config: Arc::new(self.config),
            camera: Arc::new(self.camera),
            health: HealthState::new(),
        })
    }
}

fn validate(config: &BridgeConfig) -> Result<()> {
    if config.sip.domain.trim().is_empty() {
        return Err(Error::configuration("SIP domain must be configured"));
    }
    if config.sip.username.trim().is_empty() {
        return Err(Error::configuration("SIP username must be configured"));
    }
    if config.sip.extension.trim().is_empty() {
        return Err(Error::configuration("SIP extension must be configured"));
    }
    if config.timers.registration_refresh_secs == 0 {
        return Err(Error::configuration(
            "registration refresh interval must be non-zero",
        ));
    }
    if config.tones.ffmpeg_bin.trim().is_empty() {
        return Err(Error::configuration("ringback encoder binary must be set"));
    }
    Ok(())
}

#[derive(Debug)]
pub struct BridgeRuntime<C: CameraClient> {
    config: Arc<BridgeConfig>,
    camera: Arc<C>,
    health: HealthState,
}

impl<C> BridgeRuntime<C>
where
    C: CameraClient,
{
    /// Spawn the worker thread that owns the bridge runtime. All sockets and
    /// collaborators are initialized on that thread; startup failures come
    /// back through the handle's `wait`/`shutdown` result.
    pub fn start(self) -> BridgeHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let health = self.health.clone();
        let orchestrator = Orchestrator::new(self.config, self.camera, self.health);

        let worker: std::thread::JoinHandle<Result<()>> = std::thread::spawn(move || {
            let runtime = RuntimeBuilder::new_multi_thread()
                .enable_all()
                .build()
                .map_err(Error::Transport)?;

            let mut shutdown = ShutdownSignal::new(shutdown_rx);
            runtime.block_on(orchestrator.run(&mut shutdown))
        });

        BridgeHandle {
            shutdown_tx,
            worker,
            health,
        }
    }
}

pub struct BridgeHandle {
    shutdown_tx: watch::Sender<bool>,
    worker: std::thread::JoinHandle<Result<()>>,
    health: HealthState,
}

impl BridgeHandle {
    /// Ask the worker to stop without waiting for it.
    pub fn signal_shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Observe the worker's health snapshot from outside the runtime.
    pub fn health(&self) -> HealthState {
        self.health.clone()
    }

    /// Wait for the worker to finish on its own.
    pub async fn wait(self) -> Result<()> {
        let Self {
            shutdown_tx: _,
            worker,
            health: _,
        } = self;
        Self::join(worker).await
    }

    /// Stop the worker and wait for it.
    pub async fn shutdown(self) -> Result<()> {
        let Self {
            shutdown_tx,
            worker,
            health: _,
        } = self;
        let _ = shutdown_tx.send(true);
        Self::join(worker).await
    }

    async fn join(worker: std::thread::JoinHandle<Result<()>>) -> Result<()> {
        let handle = tokio::task::spawn_blocking(move || Self::join_worker(worker));
        match handle.await {
            Ok(result) => result,
            Err(join_error) => Err(Error::Media(format!(
                "bridge worker task panicked: {join_error}"
            ))),
        }
    }

    fn join_worker(worker: std::thread::JoinHandle<Result<()>>) -> Result<()> {
        match worker.join() {
            Ok(result) => result,
            Err(panic) => Err(Error::Media(format!(
                "bridge worker panicked: {}",
                Self::panic_message(panic),
            ))),
        }
    }

    fn panic_message(panic: Box<dyn Any + Send + 'static>) -> String {
        match panic.downcast::<String>() {
            Ok(msg) => *msg,
            Err(panic) => match panic.downcast::<&'static str>() {
                Ok(msg) => (*msg).to_string(),
                Err(_) => "unknown panic payload".to_string(),
            },
        }
    }
}

/// Wakes at most once, when the bridge has been asked to stop.
pub struct ShutdownSignal {
    inner: watch::Receiver<bool>,
}

impl ShutdownSignal {
    fn new(inner: watch::Receiver<bool>) -> Self {
        Self { inner }
    }

    pub async fn recv(&mut self) {
        loop {
            if *self.inner.borrow() {
                return;
            }
            // A dropped sender counts as a stop request.
            if self.inner.changed().await.is_err() {
                return;
            }
        }
    }
}
