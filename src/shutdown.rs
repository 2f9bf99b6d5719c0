//! Graceful Shutdown Handling
//!
//! The [`CancellationController`] owns the root cancellation token for every
//! service loop it spawns. On SIGTERM, SIGINT or SIGHUP (Ctrl+C elsewhere) it
//! cancels them all and waits for each one to finish its cleanup path.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::anyhow;
use tokio::signal;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::context::ServiceContext;
use crate::metrics::Metrics;
use crate::Result;

struct ManagedTask {
    name: String,
    handle: JoinHandle<Result<()>>,
}

/// Outcome of one shutdown pass
#[derive(Debug, Default)]
pub struct ShutdownReport {
    /// Tasks that returned `Ok`
    pub completed: Vec<String>,
    /// Tasks that returned an error or panicked
    pub failed: Vec<(String, anyhow::Error)>,
    /// Tasks still running at the deadline, aborted
    pub aborted: Vec<String>,
}

impl ShutdownReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty() && self.aborted.is_empty()
    }

    pub fn total(&self) -> usize {
        self.completed.len() + self.failed.len() + self.aborted.len()
    }
}

/// Process-wide shutdown coordinator
pub struct CancellationController {
    root: CancellationToken,
    metrics: Arc<Metrics>,
    tasks: Mutex<Vec<ManagedTask>>,
    shutting_down: AtomicBool,
    failed: CancellationToken,
    completed: CancellationToken,
    timeout: Duration,
}

impl CancellationController {
    /// Create a controller; `timeout` bounds how long shutdown waits for all tasks
    pub fn new(timeout: Duration, metrics: Arc<Metrics>) -> Self {
        Self {
            root: CancellationToken::new(),
            metrics,
            tasks: Mutex::new(Vec::new()),
            shutting_down: AtomicBool::new(false),
            failed: CancellationToken::new(),
            completed: CancellationToken::new(),
            timeout,
        }
    }

    /// Context for a new service, cancelled when shutdown starts
    pub fn context(&self) -> ServiceContext {
        ServiceContext::new(self.root.child_token(), Arc::clone(&self.metrics))
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// Spawn a service loop and track it for shutdown
    pub fn spawn<F>(&self, name: impl Into<String>, task: F)
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        let name = name.into();
        if self.is_shutting_down() {
            warn!("Task '{}' spawned while shutting down", name);
        }

        let failed = self.failed.clone();
        let task_name = name.clone();
        let handle = tokio::spawn(async move {
            debug!("Starting task: {}", task_name);
            let result = task.await;
            match &result {
                Ok(()) => debug!("Task completed: {}", task_name),
                Err(e) => {
                    error!("Task '{}' failed: {:#}", task_name, e);
                    failed.cancel();
                }
            }
            result
        });

        self.lock_tasks().push(ManagedTask { name, handle });
    }

    /// Names of the tasks currently tracked
    pub fn task_names(&self) -> Vec<String> {
        self.lock_tasks().iter().map(|t| t.name.clone()).collect()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Resolves once any tracked task has returned an error
    pub async fn wait_for_failure(&self) {
        self.failed.cancelled().await
    }

    /// Resolves once a shutdown pass has finished
    pub async fn wait_for_completion(&self) {
        self.completed.cancelled().await
    }

    /// Wait for SIGTERM, SIGINT or SIGHUP and return which one arrived
    pub async fn listen_for_signals(&self) -> Result<&'static str> {
        info!("Starting shutdown signal listener");

        #[cfg(unix)]
        {
            use signal::unix::{signal as unix_signal, SignalKind};

            let mut sigterm = unix_signal(SignalKind::terminate())?;
            let mut sigint = unix_signal(SignalKind::interrupt())?;
            let mut sighup = unix_signal(SignalKind::hangup())?;

            let received = tokio::select! {
                _ = sigterm.recv() => "SIGTERM",
                _ = sigint.recv() => "SIGINT",
                _ = sighup.recv() => "SIGHUP",
            };
            info!("Received {}, initiating graceful shutdown", received);
            Ok(received)
        }

        #[cfg(not(unix))]
        {
            signal::ctrl_c().await?;
            info!("Received Ctrl+C, initiating graceful shutdown");
            Ok("Ctrl+C")
        }
    }

    /// Cancel every tracked task and wait for all of them.
    ///
    /// A failing task does not stop the others from being awaited. Calling
    /// this again while (or after) a pass runs returns an empty report.
    pub async fn shutdown(&self) -> ShutdownReport {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            info!("Shutdown already in progress");
            return ShutdownReport::default();
        }

        info!("Shutdown: scheduling cancellation for all running tasks...");
        let tasks = std::mem::take(&mut *self.lock_tasks());
        for task in &tasks {
            info!(" - {}", task.name);
        }
        self.root.cancel();
        info!("Shutdown: requested cancellation for {} tasks", tasks.len());

        let deadline = Instant::now() + self.timeout;
        let mut report = ShutdownReport::default();

        for ManagedTask { name, mut handle } in tasks {
            match tokio::time::timeout_at(deadline, &mut handle).await {
                Ok(Ok(Ok(()))) => report.completed.push(name),
                Ok(Ok(Err(e))) => report.failed.push((name, e)),
                Ok(Err(join_error)) => {
                    error!("Task '{}' did not finish cleanly: {}", name, join_error);
                    report
                        .failed
                        .push((name, anyhow!("task join failed: {}", join_error)));
                }
                Err(_) => {
                    warn!(
                        "Task '{}' still running after {:?}, aborting",
                        name, self.timeout
                    );
                    handle.abort();
                    report.aborted.push(name);
                }
            }
        }

        info!(
            "Shutdown: {} tasks finished ({} failed, {} aborted)",
            report.total(),
            report.failed.len(),
            report.aborted.len()
        );
        self.completed.cancel();
        report
    }

    fn lock_tasks(&self) -> std::sync::MutexGuard<'_, Vec<ManagedTask>> {
        self.tasks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::sleep;

    fn controller(timeout: Duration) -> CancellationController {
        CancellationController::new(timeout, Arc::new(Metrics::new().unwrap()))
    }

    #[tokio::test]
    async fn test_shutdown_cancels_and_awaits_tasks() {
        let controller = controller(Duration::from_secs(5));
        for i in 0..3 {
            let token = controller.context().cancel_token().clone();
            controller.spawn(format!("worker-{}", i), async move {
                token.cancelled().await;
                sleep(Duration::from_millis(20)).await;
                Ok(())
            });
        }
        assert_eq!(controller.task_names().len(), 3);

        let report = controller.shutdown().await;
        assert_eq!(report.completed.len(), 3);
        assert!(report.is_clean());
        assert!(controller.task_names().is_empty());
    }

    #[tokio::test]
    async fn test_failure_does_not_block_others() {
        let controller = controller(Duration::from_secs(5));

        controller.spawn("broken", async { Err(anyhow!("boom")) });
        let token = controller.context().cancel_token().clone();
        controller.spawn("healthy", async move {
            token.cancelled().await;
            Ok(())
        });

        tokio::time::timeout(Duration::from_secs(1), controller.wait_for_failure())
            .await
            .unwrap();

        let report = controller.shutdown().await;
        assert_eq!(report.completed, vec!["healthy".to_string()]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, "broken");
    }

    #[tokio::test]
    async fn test_second_shutdown_is_noop() {
        let controller = controller(Duration::from_secs(5));
        let token = controller.context().cancel_token().clone();
        controller.spawn("worker", async move {
            token.cancelled().await;
            Ok(())
        });

        let first = controller.shutdown().await;
        let second = controller.shutdown().await;
        assert_eq!(first.total(), 1);
        assert_eq!(second.total(), 0);
        assert!(controller.is_shutting_down());
    }

    #[tokio::test]
    async fn test_stuck_task_is_aborted_at_deadline() {
        let controller = controller(Duration::from_millis(100));
        controller.spawn("stubborn", async {
            sleep(Duration::from_secs(60)).await;
            Ok(())
        });

        let report = controller.shutdown().await;
        assert_eq!(report.aborted, vec!["stubborn".to_string()]);
        assert!(!report.is_clean());

        tokio::time::timeout(Duration::from_secs(1), controller.wait_for_completion())
            .await
            .unwrap();
    }
}
