//! Background maintenance for long-lived gateways.
//!
//! A generic `BackgroundWorker<R>` feeds tasks from an mpsc channel to a
//! [`BackgroundRunnable`] and calls its tick hook on a fixed interval.
//! [`MaintenanceRunnable`] is the gateway's runnable: each tick processes
//! due unloads, demotes idle fast paths, and purges expired cache entries.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::router::Gateway;

// ---------------------------------------------------------------------------
// BackgroundRunnable trait
// ---------------------------------------------------------------------------

/// Task handler driven by a [`BackgroundWorker`].
#[async_trait]
pub trait BackgroundRunnable: Send + 'static {
    type Task: Send + 'static;

    async fn run(&mut self, task: Self::Task);

    /// Called on every tick interval. Default is a no-op.
    async fn on_tick(&mut self) {}

    /// Called once after the last task. Default is a no-op.
    async fn shutdown(&mut self) {}
}

// ---------------------------------------------------------------------------
// BackgroundWorker
// ---------------------------------------------------------------------------

/// Handle to a spawned worker task.
///
/// Stopping closes the channel; tasks already queued are still run before
/// `shutdown` is called.
pub struct BackgroundWorker<R: BackgroundRunnable> {
    tx: Option<mpsc::Sender<R::Task>>,
    handle: Option<tokio::task::JoinHandle<()>>,
}

impl<R: BackgroundRunnable> BackgroundWorker<R> {
    /// Spawns the worker. Must be called from within a tokio runtime.
    pub fn start(mut runnable: R, tick_interval: Duration) -> Self {
        let (tx, mut rx) = mpsc::channel::<R::Task>(256);

        let handle = tokio::spawn(async move {
            let mut ticks = tokio::time::interval(tick_interval.max(Duration::from_millis(1)));
            // The first tick completes immediately.
            ticks.tick().await;

            loop {
                tokio::select! {
                    task = rx.recv() => match task {
                        Some(task) => runnable.run(task).await,
                        None => break,
                    },
                    _ = ticks.tick() => runnable.on_tick().await,
                }
            }

            runnable.shutdown().await;
        });

        Self {
            tx: Some(tx),
            handle: Some(handle),
        }
    }

    /// Queues a task.
    ///
    /// # Errors
    ///
    /// Returns an error if the worker has been stopped.
    pub async fn submit(&self, task: R::Task) -> anyhow::Result<()> {
        match &self.tx {
            Some(tx) => tx
                .send(task)
                .await
                .map_err(|_| anyhow::anyhow!("worker channel closed")),
            None => Err(anyhow::anyhow!("worker not running")),
        }
    }

    /// Drains queued tasks, runs `shutdown`, and waits for the worker to end.
    pub async fn stop(&mut self) {
        self.tx.take();
        if let Some(handle) = self.handle.take() {
            if let Err(err) = handle.await {
                tracing::error!(error = %err, "background worker panicked");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Gateway maintenance
// ---------------------------------------------------------------------------

/// On-demand maintenance requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MaintenanceTask {
    /// Run a full maintenance pass now.
    Tick,
    /// Check the memory estimate and unload idle modules if it is too high.
    CheckMemoryPressure,
    /// Drop every cached result owned by the named module.
    InvalidateModule(String),
}

pub struct MaintenanceRunnable {
    gateway: Arc<Gateway>,
}

impl MaintenanceRunnable {
    #[must_use]
    pub fn new(gateway: Arc<Gateway>) -> Self {
        Self { gateway }
    }

    fn tick(&self) {
        let report = self.gateway.tick();
        if report.unloaded > 0 || !report.demoted.is_empty() || report.expired > 0 {
            tracing::debug!(
                unloaded = report.unloaded,
                demoted = report.demoted.len(),
                expired = report.expired,
                "maintenance pass"
            );
        }
    }
}

#[async_trait]
impl BackgroundRunnable for MaintenanceRunnable {
    type Task = MaintenanceTask;

    async fn run(&mut self, task: MaintenanceTask) {
        match task {
            MaintenanceTask::Tick => self.tick(),
            MaintenanceTask::CheckMemoryPressure => {
                let unloaded = self.gateway.check_memory_pressure();
                tracing::debug!(unloaded = unloaded.len(), "memory check");
            }
            MaintenanceTask::InvalidateModule(module) => {
                self.gateway.invalidate_module(&module);
            }
        }
    }

    async fn on_tick(&mut self) {
        self.tick();
    }

    async fn shutdown(&mut self) {
        tracing::debug!("maintenance worker stopped");
    }
}

/// Starts maintenance for `gateway` on a `tick_interval` schedule.
pub fn spawn_maintenance(
    gateway: Arc<Gateway>,
    tick_interval: Duration,
) -> BackgroundWorker<MaintenanceRunnable> {
    BackgroundWorker::start(MaintenanceRunnable::new(gateway), tick_interval)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
