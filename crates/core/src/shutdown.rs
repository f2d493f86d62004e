//! Graceful shutdown handling for the composition root (§4.O, §5).
//!
//! Components register themselves with a priority; shutdown runs in stages,
//! each stage shutting down components within a priority band, so "stop
//! accepting connections" always completes before "drain executor" begins.

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, Notify, RwLock};
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};

/// Maximum time to wait for the whole shutdown sequence.
pub const GRACEFUL_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Delay between shutdown stages, giving in-flight work a chance to settle.
pub const SHUTDOWN_STAGE_DELAY: Duration = Duration::from_millis(100);

#[derive(Error, Debug)]
pub enum ShutdownError {
    #[error("shutdown timeout exceeded")]
    Timeout,

    #[error("component failed to shut down: {0}")]
    ComponentError(String),

    #[error("shutdown already in progress")]
    AlreadyInProgress,
}

/// Ordered shutdown stages matching the composition root's sequence in
/// SPEC_FULL.md §4.O: stop accepting connections, stop periodic operations,
/// drain the executor, close the recovery store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ShutdownStage {
    Prepare,
    StopAcceptingConnections,
    StopPeriodicOperations,
    DrainExecutor,
    CloseRecoveryStore,
    Complete,
}

impl std::fmt::Display for ShutdownStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ShutdownStage::Prepare => "preparing for shutdown",
            ShutdownStage::StopAcceptingConnections => "stopping new connections",
            ShutdownStage::StopPeriodicOperations => "stopping periodic operations",
            ShutdownStage::DrainExecutor => "draining executor",
            ShutdownStage::CloseRecoveryStore => "closing recovery store",
            ShutdownStage::Complete => "shutdown complete",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone)]
pub enum ShutdownEvent {
    Initiated {
        reason: String,
    },
    StageStarted {
        stage: ShutdownStage,
    },
    StageCompleted {
        stage: ShutdownStage,
        duration: Duration,
    },
    Completed {
        total_duration: Duration,
    },
    Failed {
        error: String,
    },
}

/// A component that can be shut down gracefully.
#[async_trait::async_trait]
pub trait Shutdown: Send + Sync {
    fn name(&self) -> &str;

    async fn shutdown(&self) -> Result<(), ShutdownError>;

    async fn can_shutdown(&self) -> bool {
        true
    }

    /// Priority band (lower shuts down earlier). Bands line up with
    /// [`ShutdownStage`]: 0..20 accept loop, 20..40 periodic operations,
    /// 40..60 executor, 60..80 recovery store, 80.. everything else.
    fn shutdown_priority(&self) -> u32 {
        100
    }
}

pub struct ShutdownCoordinator {
    current_stage: Arc<RwLock<Option<ShutdownStage>>>,
    shutdown_notify: Arc<Notify>,
    event_sender: broadcast::Sender<ShutdownEvent>,
    components: Arc<RwLock<Vec<Arc<dyn Shutdown>>>>,
    is_shutting_down: Arc<RwLock<bool>>,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        let (event_sender, _) = broadcast::channel(100);
        Self {
            current_stage: Arc::new(RwLock::new(None)),
            shutdown_notify: Arc::new(Notify::new()),
            event_sender,
            components: Arc::new(RwLock::new(Vec::new())),
            is_shutting_down: Arc::new(RwLock::new(false)),
        }
    }

    pub async fn register_component(&self, component: Arc<dyn Shutdown>) {
        info!(component = component.name(), "registering for shutdown");
        let mut components = self.components.write().await;
        components.push(component);
        components.sort_by_key(|c| c.shutdown_priority());
    }

    pub fn subscribe_to_events(&self) -> broadcast::Receiver<ShutdownEvent> {
        self.event_sender.subscribe()
    }

    /// Returns a handle that resolves once shutdown has been initiated.
    /// The reactor's accept loop and every periodic Operation await this.
    pub fn get_shutdown_signal(&self) -> Arc<Notify> {
        Arc::clone(&self.shutdown_notify)
    }

    pub async fn initiate_shutdown(&self, reason: String) -> Result<(), ShutdownError> {
        {
            let mut is_shutting_down = self.is_shutting_down.write().await;
            if *is_shutting_down {
                return Err(ShutdownError::AlreadyInProgress);
            }
            *is_shutting_down = true;
        }

        info!(reason = reason.as_str(), "initiating graceful shutdown");
        let start = std::time::Instant::now();
        let _ = self.event_sender.send(ShutdownEvent::Initiated { reason });
        self.shutdown_notify.notify_waiters();

        match timeout(GRACEFUL_SHUTDOWN_TIMEOUT, self.execute_shutdown_sequence()).await {
            Ok(Ok(())) => {
                let duration = start.elapsed();
                info!(?duration, "graceful shutdown completed");
                let _ = self
                    .event_sender
                    .send(ShutdownEvent::Completed { total_duration: duration });
                Ok(())
            }
            Ok(Err(e)) => {
                error!(error = %e, "shutdown failed");
                let _ = self.event_sender.send(ShutdownEvent::Failed { error: e.to_string() });
                Err(e)
            }
            Err(_) => {
                error!("shutdown timeout exceeded");
                let _ = self.event_sender.send(ShutdownEvent::Failed {
                    error: "timeout exceeded".to_string(),
                });
                Err(ShutdownError::Timeout)
            }
        }
    }

    async fn execute_shutdown_sequence(&self) -> Result<(), ShutdownError> {
        let stages = [
            ShutdownStage::Prepare,
            ShutdownStage::StopAcceptingConnections,
            ShutdownStage::StopPeriodicOperations,
            ShutdownStage::DrainExecutor,
            ShutdownStage::CloseRecoveryStore,
            ShutdownStage::Complete,
        ];

        for stage in stages {
            self.execute_shutdown_stage(stage).await?;
            if stage != ShutdownStage::Complete {
                sleep(SHUTDOWN_STAGE_DELAY).await;
            }
        }
        Ok(())
    }

    async fn execute_shutdown_stage(&self, stage: ShutdownStage) -> Result<(), ShutdownError> {
        info!(%stage, "shutdown stage");
        *self.current_stage.write().await = Some(stage);
        let stage_start = std::time::Instant::now();
        let _ = self.event_sender.send(ShutdownEvent::StageStarted { stage });

        let priority_range = match stage {
            ShutdownStage::Prepare => {
                debug!("preparing components for shutdown");
                0..0
            }
            ShutdownStage::StopAcceptingConnections => 0..20,
            ShutdownStage::StopPeriodicOperations => 20..40,
            ShutdownStage::DrainExecutor => 40..60,
            ShutdownStage::CloseRecoveryStore => 60..80,
            ShutdownStage::Complete => 80..u32::MAX,
        };
        self.shutdown_components_by_priority(priority_range).await?;

        let duration = stage_start.elapsed();
        let _ = self
            .event_sender
            .send(ShutdownEvent::StageCompleted { stage, duration });
        Ok(())
    }

    async fn shutdown_components_by_priority(
        &self,
        priority_range: std::ops::Range<u32>,
    ) -> Result<(), ShutdownError> {
        let components = self.components.read().await;

        for component in components.iter() {
            let priority = component.shutdown_priority();
            if !priority_range.contains(&priority) {
                continue;
            }

            debug!(component = component.name(), priority, "shutting down");
            if !component.can_shutdown().await {
                warn!(component = component.name(), "not ready, waiting");
                for _ in 0..10 {
                    sleep(Duration::from_millis(100)).await;
                    if component.can_shutdown().await {
                        break;
                    }
                }
            }

            if let Err(e) = component.shutdown().await {
                error!(component = component.name(), error = %e, "component shutdown failed");
                return Err(ShutdownError::ComponentError(format!(
                    "{}: {e}",
                    component.name()
                )));
            }
            debug!(component = component.name(), "shut down");
        }
        Ok(())
    }

    pub async fn current_stage(&self) -> Option<ShutdownStage> {
        *self.current_stage.read().await
    }

    pub async fn is_shutting_down(&self) -> bool {
        *self.is_shutting_down.read().await
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

/// Installs OS signal handlers that drive [`ShutdownCoordinator`].
pub struct SignalHandler {
    shutdown_coordinator: Arc<ShutdownCoordinator>,
}

impl SignalHandler {
    pub fn new(shutdown_coordinator: Arc<ShutdownCoordinator>) -> Self {
        Self { shutdown_coordinator }
    }

    pub async fn start(self) {
        tokio::spawn(async move {
            self.handle_signals().await;
        });
    }

    #[cfg(unix)]
    async fn handle_signals(&self) {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = signal(SignalKind::terminate()).expect("install SIGTERM handler");
        let mut sigint = signal(SignalKind::interrupt()).expect("install SIGINT handler");

        tokio::select! {
            _ = sigterm.recv() => {
                info!("received SIGTERM");
                let _ = self.shutdown_coordinator.initiate_shutdown("SIGTERM".into()).await;
            }
            _ = sigint.recv() => {
                info!("received SIGINT");
                let _ = self.shutdown_coordinator.initiate_shutdown("SIGINT".into()).await;
            }
        }
    }

    #[cfg(windows)]
    async fn handle_signals(&self) {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("received Ctrl+C");
                let _ = self
                    .shutdown_coordinator
                    .initiate_shutdown("Ctrl+C".into())
                    .await;
            }
            Err(e) => error!(error = %e, "failed to listen for Ctrl+C"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct TestComponent {
        name: String,
        priority: u32,
    }

    #[async_trait::async_trait]
    impl Shutdown for TestComponent {
        fn name(&self) -> &str {
            &self.name
        }

        async fn shutdown(&self) -> Result<(), ShutdownError> {
            Ok(())
        }

        fn shutdown_priority(&self) -> u32 {
            self.priority
        }
    }

    #[tokio::test]
    async fn shutdown_runs_all_stages_and_emits_events() {
        let coordinator = ShutdownCoordinator::new();
        coordinator
            .register_component(Arc::new(TestComponent {
                name: "reactor".into(),
                priority: 10,
            }))
            .await;
        coordinator
            .register_component(Arc::new(TestComponent {
                name: "recovery-store".into(),
                priority: 70,
            }))
            .await;

        let mut events = coordinator.subscribe_to_events();
        let result = coordinator.initiate_shutdown("test".into()).await;
        assert!(result.is_ok());
        assert!(coordinator.is_shutting_down().await);

        let mut saw_completed = false;
        while let Ok(event) = events.try_recv() {
            if matches!(event, ShutdownEvent::Completed { .. }) {
                saw_completed = true;
            }
        }
        assert!(saw_completed);
    }

    #[tokio::test]
    async fn double_shutdown_is_rejected() {
        let coordinator = ShutdownCoordinator::new();
        coordinator.initiate_shutdown("first".into()).await.unwrap();
        let second = coordinator.initiate_shutdown("second".into()).await;
        assert!(matches!(second, Err(ShutdownError::AlreadyInProgress)));
    }

    #[tokio::test]
    async fn shutdown_signal_wakes_waiters() {
        let coordinator = ShutdownCoordinator::new();
        let signal = coordinator.get_shutdown_signal();
        let waiter = tokio::spawn(async move {
            signal.notified().await;
            true
        });
        coordinator.initiate_shutdown("test".into()).await.unwrap();
        assert!(waiter.await.unwrap());
    }
}
