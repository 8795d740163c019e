//! Background maintenance of a tablet.
//!
//! Tablet work is blocking I/O, so every run moves to the blocking pool.
//! Flushes and compactions each take a permit from their own semaphore, which
//! bounds how many run at once across all tablets sharing the semaphores.

use std::{sync::Arc, time::Duration};

use tokio::sync::Semaphore;

use crate::{
    error::Result,
    scheduler::{BackgroundTask, Context, RunOutcome, Scheduler},
    tablet::{CompactFlags, DeltaCompactionType, Tablet},
    Error,
};

/// Semaphores bounding concurrent background work.
#[derive(Clone)]
pub struct BackgroundLimits {
    flushes: Arc<Semaphore>,
    compactions: Arc<Semaphore>,
}

impl BackgroundLimits {
    pub fn new(max_flushes: usize, max_compactions: usize) -> Self {
        Self {
            flushes: Arc::new(Semaphore::new(max_flushes.max(1))),
            compactions: Arc::new(Semaphore::new(max_compactions.max(1))),
        }
    }
}

impl Scheduler {
    /// Registers flush, compaction, delta compaction and orphan GC tasks for
    /// `tablet`, with limits taken from its configuration.
    pub fn register_tablet(&self, tablet: &Arc<Tablet>) -> Result<&Self> {
        let config = &tablet.config().scheduler;
        let limits = BackgroundLimits::new(
            config.max_background_flushes,
            config.max_background_compactions,
        );
        self.register_tablet_with_limits(tablet, &limits)
    }

    pub fn register_tablet_with_limits(
        &self,
        tablet: &Arc<Tablet>,
        limits: &BackgroundLimits,
    ) -> Result<&Self> {
        self.register(Arc::new(FlushTask::new(tablet.clone(), limits.clone())))?
            .register(Arc::new(CompactionTask::new(tablet.clone(), limits.clone())))?
            .register(Arc::new(DeltaCompactionTask::new(tablet.clone(), limits.clone())))?
            .register(Arc::new(OrphanGcTask::new(tablet.clone())))
    }
}

/// Runs `f` on the blocking pool.
async fn run_blocking<T, F>(tablet: &Arc<Tablet>, f: F) -> Result<T>
where
    F: FnOnce(&Tablet) -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    let tablet = tablet.clone();
    tokio::task::spawn_blocking(move || f(&tablet))
        .await
        .map_err(|e| Error::Aborted(format!("background run did not finish: {}", e)))?
}

async fn acquire(
    semaphore: &Arc<Semaphore>,
) -> Result<tokio::sync::OwnedSemaphorePermit> {
    semaphore
        .clone()
        .acquire_owned()
        .await
        .map_err(|_| Error::Aborted("background limits closed".into()))
}

/// A tablet going away is not a failure of the task.
fn ignore_shutdown(result: Result<RunOutcome>) -> Result<RunOutcome> {
    match result {
        Err(e) if e.is_shutdown_in_progress() => Ok(RunOutcome::Idle),
        other => other,
    }
}

fn progress_if(did_work: bool) -> RunOutcome {
    if did_work {
        RunOutcome::Progress
    } else {
        RunOutcome::Idle
    }
}

/// Corruption found while compacting means the on-disk state cannot be
/// trusted any more.
fn abort_on_corruption<T>(task: &'static str, result: Result<T>) -> Result<T> {
    if let Err(e) = &result {
        if e.is_corruption() {
            tracing::error!(task, error = %e, "Corruption found by background compaction, aborting");
            std::process::abort();
        }
    }
    result
}

pub struct FlushTask {
    tablet: Arc<Tablet>,
    limits: BackgroundLimits,
}

impl FlushTask {
    pub fn new(tablet: Arc<Tablet>, limits: BackgroundLimits) -> Self {
        Self { tablet, limits }
    }
}

#[async_trait::async_trait]
impl BackgroundTask for FlushTask {
    fn name(&self) -> &'static str {
        "memrowset-flush"
    }

    fn interval(&self) -> Duration {
        self.tablet.config().scheduler.flush_interval
    }

    async fn execute(&self, ctx: Context) -> Result<RunOutcome> {
        let _permit = acquire(&self.limits.flushes).await?;
        let result = run_blocking(&self.tablet, |tablet| {
            if tablet.flush_if_needed()? {
                return Ok(RunOutcome::Progress);
            }
            // Frozen memrowsets left by an async flush or a failed attempt
            // are retried here.
            if tablet.has_frozen_memrowsets()? {
                return Ok(progress_if(tablet.flush_frozen_memrowsets()? > 0));
            }
            Ok(RunOutcome::Idle)
        })
        .await;
        if ctx.failures > 0 && result.is_ok() {
            tracing::info!(task = self.name(), failures = ctx.failures, "Flush recovered");
        }
        tracing::trace!(task = self.name(), run = ctx.run_id, outcome = ?result.as_ref().ok(), "Flush check done");
        ignore_shutdown(result)
    }
}

pub struct CompactionTask {
    tablet: Arc<Tablet>,
    limits: BackgroundLimits,
}

impl CompactionTask {
    pub fn new(tablet: Arc<Tablet>, limits: BackgroundLimits) -> Self {
        Self { tablet, limits }
    }
}

#[async_trait::async_trait]
impl BackgroundTask for CompactionTask {
    fn name(&self) -> &'static str {
        "rowset-compaction"
    }

    fn interval(&self) -> Duration {
        self.tablet.config().scheduler.compaction_interval
    }

    async fn execute(&self, _ctx: Context) -> Result<RunOutcome> {
        if self.tablet.config().compaction.disable_compactions {
            return Ok(RunOutcome::Idle);
        }
        let _permit = acquire(&self.limits.compactions).await?;
        let result = run_blocking(&self.tablet, |tablet| {
            Ok(progress_if(tablet.compact(CompactFlags::NONE)? > 0))
        })
        .await;
        ignore_shutdown(abort_on_corruption(self.name(), result))
    }
}

/// Which delta compaction a rowset needs, judged from its redo blocks and
/// base size.
pub fn delta_compaction_kind(
    num_redo_blocks: usize,
    redo_size: u64,
    base_size: u64,
    trigger: usize,
) -> Option<DeltaCompactionType> {
    if num_redo_blocks == 0 {
        return None;
    }
    // Folding pays off once the deltas are a sizable share of the base.
    if redo_size.saturating_mul(2) >= base_size {
        return Some(DeltaCompactionType::Major);
    }
    if num_redo_blocks >= trigger.max(2) {
        return Some(DeltaCompactionType::Minor);
    }
    None
}

pub struct DeltaCompactionTask {
    tablet: Arc<Tablet>,
    limits: BackgroundLimits,
}

impl DeltaCompactionTask {
    pub fn new(tablet: Arc<Tablet>, limits: BackgroundLimits) -> Self {
        Self { tablet, limits }
    }

    fn pick(&self) -> Result<Option<DeltaCompactionType>> {
        let trigger = self.tablet.config().compaction.delta_compaction_trigger;
        let components = self.tablet.components()?;
        let worst = components
            .rowsets
            .rowsets()
            .iter()
            .max_by_key(|r| (r.num_redo_blocks(), r.redo_size()));
        Ok(worst.and_then(|r| {
            delta_compaction_kind(r.num_redo_blocks(), r.redo_size(), r.base_size(), trigger)
        }))
    }
}

#[async_trait::async_trait]
impl BackgroundTask for DeltaCompactionTask {
    fn name(&self) -> &'static str {
        "delta-compaction"
    }

    fn interval(&self) -> Duration {
        self.tablet.config().scheduler.delta_compaction_interval
    }

    async fn execute(&self, _ctx: Context) -> Result<RunOutcome> {
        if self.tablet.config().compaction.disable_compactions {
            return Ok(RunOutcome::Idle);
        }
        let Some(kind) = self.pick()? else {
            return Ok(RunOutcome::Idle);
        };
        let _permit = acquire(&self.limits.compactions).await?;
        let result = run_blocking(&self.tablet, move |tablet| {
            Ok(progress_if(tablet.compact_worst_deltas(kind)?.is_some()))
        })
        .await;
        ignore_shutdown(abort_on_corruption(self.name(), result))
    }
}

pub struct OrphanGcTask {
    tablet: Arc<Tablet>,
}

impl OrphanGcTask {
    pub fn new(tablet: Arc<Tablet>) -> Self {
        Self { tablet }
    }
}

#[async_trait::async_trait]
impl BackgroundTask for OrphanGcTask {
    fn name(&self) -> &'static str {
        "orphan-gc"
    }

    fn interval(&self) -> Duration {
        self.tablet.config().scheduler.orphan_gc_interval
    }

    async fn execute(&self, ctx: Context) -> Result<RunOutcome> {
        let result = run_blocking(&self.tablet, |tablet| tablet.delete_orphaned_blocks()).await;
        let result = result.map(|deleted| {
            if deleted > 0 {
                tracing::debug!(task = self.name(), run = ctx.run_id, deleted, "Deleted orphaned blocks");
            }
            // Orphans only appear through other work.
            RunOutcome::Idle
        });
        ignore_shutdown(result)
    }
}
