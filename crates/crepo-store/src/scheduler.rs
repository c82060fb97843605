use std::io;
use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::{Builder, Runtime};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// How long [`TaskScheduler::shutdown`] waits for running jobs.
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Runs the repository's background jobs on a dedicated tokio runtime.
///
/// Jobs are blocking closures. Each registered task sleeps for its period,
/// runs the job on the blocking pool, and repeats until shutdown.
pub struct TaskScheduler {
    runtime: Option<Runtime>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<String>,
}

impl TaskScheduler {
    pub fn new(worker_threads: usize) -> io::Result<Self> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(worker_threads.max(1))
            .thread_name("crepo-scheduler")
            .enable_time()
            .build()?;
        let (shutdown_tx, _) = watch::channel(false);
        Ok(Self {
            runtime: Some(runtime),
            shutdown_tx,
            tasks: Vec::new(),
        })
    }

    /// Run `job` repeatedly, waiting `period` after each run completes.
    pub fn schedule_with_fixed_delay<F>(&mut self, name: impl Into<String>, period: Duration, job: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        let name = name.into();
        let Some(runtime) = &self.runtime else {
            warn!(task = %name, "scheduler already shut down; task not started");
            return;
        };
        let mut shutdown = self.shutdown_tx.subscribe();
        let job = Arc::new(job);
        let task = name.clone();
        let period = period.max(Duration::from_millis(1));

        runtime.spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(period) => {}
                    _ = shutdown.changed() => break,
                }
                if *shutdown.borrow() {
                    break;
                }
                let job = Arc::clone(&job);
                if let Err(e) = tokio::task::spawn_blocking(move || job()).await {
                    warn!(task = %task, error = %e, "scheduled task panicked");
                }
            }
            debug!(task = %task, "scheduled task stopped");
        });
        debug!(task = %name, period_ms = period.as_millis() as u64, "scheduled task");
        self.tasks.push(name);
    }

    pub fn task_names(&self) -> &[String] {
        &self.tasks
    }

    fn is_running(&self) -> bool {
        self.runtime.is_some()
    }

    /// Stop every task and tear down the runtime. Idempotent.
    pub fn shutdown(&mut self) {
        let Some(runtime) = self.runtime.take() else {
            return;
        };
        let _ = self.shutdown_tx.send(true);
        runtime.shutdown_timeout(SHUTDOWN_TIMEOUT);
        info!(tasks = self.tasks.len(), "background tasks stopped");
    }
}

impl Drop for TaskScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for TaskScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskScheduler")
            .field("tasks", &self.tasks)
            .field("running", &self.is_running())
            .finish()
    }
}
