//! Coordinated teardown of a daemon's long-running tasks
//!
//! Both daemons run a handful of named tasks (accept loops, the HTTP admin
//! server, lookup peers). Each one is registered here; `shutdown()` flips
//! the watch signal, then joins the tasks against a shared deadline and
//! aborts whatever refuses to stop. Pending and in-flight messages live
//! only in memory and are dropped with their pumps, which is the documented
//! contract.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::constants::SHUTDOWN_TIMEOUT_SECS;

struct NamedTask {
    name: &'static str,
    handle: JoinHandle<()>,
}

/// Shutdown coordinator shared by every task of a daemon.
#[derive(Clone)]
pub struct ShutdownService {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
    tasks: Arc<Mutex<Vec<NamedTask>>>,
}

impl ShutdownService {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            tx: Arc::new(tx),
            rx,
            tasks: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Track a task to be joined during shutdown. The name shows up in the
    /// teardown log, so stragglers can be identified.
    pub async fn register(&self, name: &'static str, handle: JoinHandle<()>) {
        self.tasks.lock().await.push(NamedTask { name, handle });
    }

    /// Subscribe to the shutdown signal.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.rx.clone()
    }

    /// Flip the shutdown signal.
    pub fn trigger(&self) {
        let _ = self.tx.send(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Signal every task to stop, then join them against one deadline.
    ///
    /// A task that outlives the deadline is aborted and reported by name;
    /// everything it still held in memory is gone at that point anyway.
    pub async fn shutdown(&self) {
        self.trigger();

        let tasks = std::mem::take(&mut *self.tasks.lock().await);
        tracing::info!(count = tasks.len(), "Stopping background tasks");

        let deadline = Instant::now() + Duration::from_secs(SHUTDOWN_TIMEOUT_SECS);
        let mut aborted = 0usize;
        for task in tasks {
            let mut handle = task.handle;
            let remaining = deadline.saturating_duration_since(Instant::now());
            match tokio::time::timeout(remaining, &mut handle).await {
                Ok(_) => tracing::debug!(task = task.name, "Task stopped"),
                Err(_) => {
                    handle.abort();
                    aborted += 1;
                    tracing::warn!(task = task.name, "Task did not stop in time, aborted");
                }
            }
        }

        if aborted > 0 {
            tracing::warn!(aborted, "Shutdown finished with aborted tasks");
        } else {
            tracing::info!("Shutdown complete");
        }
    }

    /// Wait for the shutdown signal.
    ///
    /// Returns an owned future usable with axum's graceful shutdown.
    pub fn wait(&self) -> impl std::future::Future<Output = ()> + Send + 'static {
        let mut rx = self.rx.clone();
        async move {
            let _ = rx.wait_for(|&v| v).await;
        }
    }

    /// Trigger shutdown on Ctrl+C or SIGTERM.
    pub fn install_signal_handlers(&self) {
        let service = self.clone();
        tokio::spawn(async move {
            wait_for_signal().await;
            tracing::info!("Shutdown signal received");
            service.trigger();
        });
    }
}

impl Default for ShutdownService {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    match signal(SignalKind::terminate()) {
        Ok(mut terminate) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = terminate.recv() => {}
            }
        }
        Err(e) => {
            tracing::warn!(error = %e, "Failed to install SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_trigger_flips_signal() {
        let shutdown = ShutdownService::new();
        assert!(!shutdown.is_triggered());
        shutdown.trigger();
        assert!(shutdown.is_triggered());
        assert!(*shutdown.subscribe().borrow());
    }

    #[tokio::test]
    async fn test_wait_completes_after_trigger() {
        let shutdown = ShutdownService::new();
        let waiting = tokio::spawn(shutdown.wait());

        tokio::task::yield_now().await;
        shutdown.trigger();

        tokio::time::timeout(Duration::from_millis(100), waiting)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_joins_cooperative_tasks() {
        let shutdown = ShutdownService::new();

        let mut rx = shutdown.subscribe();
        shutdown
            .register(
                "cooperative",
                tokio::spawn(async move {
                    let _ = rx.wait_for(|&v| v).await;
                }),
            )
            .await;

        tokio::time::timeout(Duration::from_secs(1), shutdown.shutdown())
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_aborts_stuck_task() {
        let shutdown = ShutdownService::new();

        shutdown
            .register(
                "stuck",
                tokio::spawn(async {
                    std::future::pending::<()>().await;
                }),
            )
            .await;

        // with paused time the deadline elapses instantly and the stuck
        // task is aborted instead of hanging the teardown
        shutdown.shutdown().await;
        assert!(shutdown.is_triggered());
    }
}
