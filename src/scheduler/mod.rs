//! Background maintenance loops.
//!
//! Every registered task gets its own loop on the tokio runtime. The first run
//! happens right after registration, so work left over from bootstrap (frozen
//! memrowsets, orphaned blocks) is picked up without waiting a full period.
//! After that:
//!
//! - a run that made progress is followed by another run straight away, so a
//!   backlog of flushes or compactions drains without idling between steps;
//! - an idle run waits the task's interval;
//! - a failed run is retried after a backoff that doubles from
//!   [`MIN_INTERVAL`] up to the task's interval.
//!
//! Shutdown is signalled to every loop. A loop finishes the run in progress,
//! since tablet work cannot be interrupted halfway, and then exits.

pub mod tasks;

use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::error::Result;
use crate::Error;

pub use tasks::{BackgroundLimits, CompactionTask, DeltaCompactionTask, FlushTask, OrphanGcTask};

/// Shortest wait between runs, and the first retry delay after a failure.
pub const MIN_INTERVAL: Duration = Duration::from_millis(1);

/// What a run left behind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// Nothing more to do before the next period.
    Idle,
    /// The run did some work and more may be waiting.
    Progress,
}

/// Per-run information handed to a task.
#[derive(Debug, Clone, Copy)]
pub struct Context {
    pub run_id: u64,
    /// Failed runs in a row before this one.
    pub failures: u32,
}

#[async_trait::async_trait]
pub trait BackgroundTask: Send + Sync {
    fn name(&self) -> &'static str;

    /// Wait between idle runs.
    fn interval(&self) -> Duration;

    async fn execute(&self, ctx: Context) -> Result<RunOutcome>;
}

/// Delay before retrying a task that failed `failures` times in a row.
pub fn retry_backoff(interval: Duration, failures: u32) -> Duration {
    let cap = interval.max(MIN_INTERVAL);
    MIN_INTERVAL
        .saturating_mul(1u32 << failures.saturating_sub(1).min(20))
        .min(cap)
}

struct Registered {
    name: &'static str,
    handle: JoinHandle<()>,
}

/// Owns the loops of all registered tasks.
pub struct Scheduler {
    tasks: Mutex<Vec<Registered>>,
    shutdown_tx: watch::Sender<bool>,
}

impl Scheduler {
    pub fn new() -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            tasks: Mutex::new(Vec::new()),
            shutdown_tx,
        }
    }

    /// Starts the loop for `task`. Must be called within a tokio runtime.
    pub fn register<T: BackgroundTask + 'static>(&self, task: Arc<T>) -> Result<&Self> {
        let name = task.name();
        let handle = tokio::spawn(run_loop(task, self.shutdown_tx.subscribe()));
        self.tasks.lock()?.push(Registered { name, handle });
        tracing::debug!(task = name, "Registered background task");
        Ok(self)
    }

    pub fn num_tasks(&self) -> Result<usize> {
        Ok(self.tasks.lock()?.len())
    }

    /// Stops every loop and waits for runs in progress to finish.
    pub async fn shutdown(self) -> Result<()> {
        self.shutdown_tx.send_replace(true);

        let mut failed = Vec::new();
        for task in self.tasks.into_inner()? {
            if let Err(e) = task.handle.await {
                tracing::error!(task = task.name, error = %e, "Background task panicked");
                failed.push(task.name);
            }
        }
        if !failed.is_empty() {
            return Err(Error::IllegalState(format!(
                "background tasks {:?} did not stop cleanly",
                failed
            )));
        }
        Ok(())
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

async fn run_loop<T: BackgroundTask>(task: Arc<T>, mut shutdown: watch::Receiver<bool>) {
    let name = task.name();
    let interval = task.interval().max(MIN_INTERVAL);
    let mut run_id = 0u64;
    let mut failures = 0u32;
    let mut delay = Duration::ZERO;

    loop {
        if *shutdown.borrow() {
            break;
        }
        if !delay.is_zero() {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                // A closed channel means the scheduler is gone.
                _ = shutdown.changed() => break,
            }
        } else {
            tokio::task::yield_now().await;
        }

        run_id += 1;
        delay = match task.execute(Context { run_id, failures }).await {
            Ok(RunOutcome::Progress) => {
                failures = 0;
                Duration::ZERO
            }
            Ok(RunOutcome::Idle) => {
                failures = 0;
                interval
            }
            Err(e) => {
                failures = failures.saturating_add(1);
                let backoff = retry_backoff(interval, failures);
                tracing::warn!(
                    task = name,
                    run = run_id,
                    failures,
                    retry_in = ?backoff,
                    error = %e,
                    "Background run failed"
                );
                backoff
            }
        };
    }

    tracing::info!(task = name, runs = run_id, "Background task stopped");
}
