//! A tablet: one shard of documents with its in-memory and on-disk state.
//!
//! Writes land in the active memrowset. Flush freezes it and writes it out,
//! either as a new rowset or as redo delta blocks of existing rowsets covering
//! the same documents. Compactions merge rowsets and fold deltas, garbage
//! collecting history no reader can observe any more.
//!
//! The set of components readers see is an immutable `TabletComponents`
//! value behind a reader/writer lock. The lock is only held long enough to
//! clone or replace the `Arc`, never across I/O, so a long scan cannot block
//! a swap and a pending swap cannot queue readers behind a long scan.
//!
//! Every on-disk change is committed to the tablet metadata before the new
//! components become visible, and blocks that fall out of use are only deleted
//! after that commit, by `delete_orphaned_blocks`.

pub mod compaction;
pub mod components;
pub mod diskrowset;
pub mod flush;
pub mod hooks;
pub mod iterator;
pub mod memrowset;
pub mod metadata;
pub mod mvcc;
pub mod rowset_metadata;
pub mod rowset_writer;

#[cfg(test)]
mod tests;

use std::fmt;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock};

pub use compaction::{CompactFlags, CompactionPolicy, DeltaCompactionType, UniversalCompactionPolicy};
pub use components::{RowSetTree, TabletComponents};
pub use flush::FlushMode;
pub use hooks::{CompactionFaultHooks, FlushCompactCommonHooks, FlushFaultHooks, NoopHooks};
pub use iterator::{RowIterator, RowIteratorOptions};
pub use mvcc::{MvccManager, MvccSnapshot};

use crate::block::BlockManager;
use crate::clock::SharedClock;
use crate::config::TabletConfig;
use crate::docdb::{
    resolve, DocKey, DocReader, DocWriteBatch, LockManager, ResolvedValue, SeekOptimizer, SubDocKey,
    SubDocument,
};
use crate::error::Result;
use crate::flock::FileLock;
use crate::hybrid_time::HybridTime;
use crate::rate_limiter::RateLimiter;
use crate::Error;
use diskrowset::DiskRowSet;
use memrowset::MemRowSet;
use metadata::{MetadataEdit, TabletMetadata};
use rowset_metadata::{RowSetClaim, RowSetMetadata};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TabletState {
    Initialized,
    Bootstrapping,
    Open,
    Shutdown,
}

impl fmt::Display for TabletState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TabletState::Initialized => "INITIALIZED",
            TabletState::Bootstrapping => "BOOTSTRAPPING",
            TabletState::Open => "OPEN",
            TabletState::Shutdown => "SHUTDOWN",
        };
        f.write_str(name)
    }
}

/// Resources that only exist while the tablet is open.
struct TabletStorage {
    blocks: BlockManager,
    metadata: Arc<TabletMetadata>,
    _lock: FileLock,
}

/// Counts operations that started before a shutdown request, so shutdown can
/// wait for them before releasing storage.
#[derive(Default)]
struct PendingOps {
    count: Mutex<usize>,
    drained: Condvar,
}

pub(crate) struct PendingOpGuard<'a> {
    ops: &'a PendingOps,
}

impl Drop for PendingOpGuard<'_> {
    fn drop(&mut self) {
        let mut count = match self.ops.count.lock() {
            Ok(count) => count,
            Err(poisoned) => poisoned.into_inner(),
        };
        *count -= 1;
        if *count == 0 {
            self.ops.drained.notify_all();
        }
    }
}

struct Hooks {
    flush: Arc<dyn FlushFaultHooks>,
    compaction: Arc<dyn CompactionFaultHooks>,
    common: Arc<dyn FlushCompactCommonHooks>,
}

pub struct Tablet {
    config: TabletConfig,
    state: Mutex<TabletState>,
    shutdown_requested: AtomicBool,
    pending_ops: PendingOps,
    storage: RwLock<Option<Arc<TabletStorage>>>,

    mvcc: Arc<MvccManager>,
    lock_manager: LockManager,
    components: RwLock<Arc<TabletComponents>>,
    next_memrowset_id: AtomicU64,
    /// Oldest read time history is still kept for. Raised by compactions.
    history_cutoff: Mutex<HybridTime>,

    flush_lock: Mutex<()>,
    compact_select_lock: Mutex<()>,
    checkpoint_lock: Mutex<()>,
    orphan_gc_lock: Mutex<()>,

    policy: Box<dyn CompactionPolicy>,
    hooks: RwLock<Hooks>,
}

impl Tablet {
    pub fn new(config: TabletConfig, clock: SharedClock) -> Self {
        let noop = Arc::new(NoopHooks);
        Self {
            config,
            state: Mutex::new(TabletState::Initialized),
            shutdown_requested: AtomicBool::new(false),
            pending_ops: PendingOps::default(),
            storage: RwLock::new(None),
            mvcc: Arc::new(MvccManager::new(clock)),
            lock_manager: LockManager::new(),
            components: RwLock::new(Arc::new(TabletComponents::new(
                Arc::new(MemRowSet::new(0)),
                Arc::new(RowSetTree::default()),
            ))),
            next_memrowset_id: AtomicU64::new(1),
            history_cutoff: Mutex::new(HybridTime::MIN),
            flush_lock: Mutex::new(()),
            compact_select_lock: Mutex::new(()),
            checkpoint_lock: Mutex::new(()),
            orphan_gc_lock: Mutex::new(()),
            policy: Box::new(UniversalCompactionPolicy),
            hooks: RwLock::new(Hooks {
                flush: noop.clone(),
                compaction: noop.clone(),
                common: noop,
            }),
        }
    }

    /// Replaces the policy merge compactions pick rowsets with.
    pub fn with_compaction_policy(mut self, policy: Box<dyn CompactionPolicy>) -> Self {
        self.policy = policy;
        self
    }

    pub fn config(&self) -> &TabletConfig {
        &self.config
    }

    pub fn mvcc(&self) -> &Arc<MvccManager> {
        &self.mvcc
    }

    pub fn state(&self) -> Result<TabletState> {
        Ok(*self.state.lock()?)
    }

    /// Loads the tablet from its directory: replays the metadata log, opens
    /// every rowset and deletes block files no rowset references.
    pub fn open(&self) -> Result<()> {
        {
            let mut state = self.state.lock()?;
            if *state != TabletState::Initialized {
                return Err(Error::IllegalState(format!(
                    "cannot open tablet in state {}",
                    *state
                )));
            }
            *state = TabletState::Bootstrapping;
        }

        if let Err(e) = self.load() {
            tracing::warn!(dir = %self.config.dir.display(), error = %e, "Failed to open tablet");
            *self.state.lock()? = TabletState::Initialized;
            return Err(e);
        }
        Ok(())
    }

    fn load(&self) -> Result<()> {
        let dir = &self.config.dir;
        fs::create_dir_all(dir)?;
        let lock = FileLock::lock_dir(dir)?;
        let rate_limiter = Arc::new(RateLimiter::new(
            self.config.compact_flush_rate_limit_bytes_per_sec,
        ));
        let blocks = BlockManager::open(dir, rate_limiter)?;
        let metadata = Arc::new(TabletMetadata::open(dir, self.config.metadata_snapshot_interval)?);
        let state = metadata.state()?;

        // Anything on disk that no rowset references is either an orphan
        // whose deletion was interrupted or the output of an operation that
        // never committed.
        let live = state.live_blocks();
        let mut removed = 0;
        for id in blocks.list_blocks()? {
            if !live.contains(&id) {
                blocks.delete_block(id)?;
                removed += 1;
            }
        }
        for id in &live {
            blocks.reserve_id(*id);
        }
        if !state.orphaned_blocks.is_empty() {
            metadata.commit(MetadataEdit::DeleteOrphans {
                blocks: state.orphaned_blocks.iter().copied().collect(),
            })?;
        }

        let mut rowsets = Vec::with_capacity(state.rowsets.len());
        let mut last_dms_id = 0;
        for record in state.rowsets.values() {
            last_dms_id = last_dms_id.max(record.last_durable_redo_dms_id);
            let rowset_metadata = Arc::new(RowSetMetadata::new(metadata.clone(), record.clone()));
            rowsets.push(Arc::new(DiskRowSet::open(rowset_metadata, &blocks)?));
        }

        let memrowset_id = last_dms_id + 1;
        self.next_memrowset_id.store(memrowset_id + 1, Ordering::SeqCst);
        *self.components.write()? = Arc::new(TabletComponents::new(
            Arc::new(MemRowSet::new(memrowset_id)),
            Arc::new(RowSetTree::new(rowsets)),
        ));
        *self.storage.write()? = Some(Arc::new(TabletStorage {
            blocks,
            metadata,
            _lock: lock,
        }));

        tracing::info!(
            dir = %dir.display(),
            rowsets = state.rowsets.len(),
            removed_blocks = removed,
            "Opened tablet"
        );
        Ok(())
    }

    pub fn mark_finished_bootstrapping(&self) -> Result<()> {
        let mut state = self.state.lock()?;
        if *state != TabletState::Bootstrapping {
            return Err(Error::IllegalState(format!(
                "cannot finish bootstrapping in state {}",
                *state
            )));
        }
        *state = TabletState::Open;
        tracing::info!(dir = %self.config.dir.display(), "Tablet open");
        Ok(())
    }

    /// Makes new operations fail with `ShutdownInProgress`. Operations already
    /// running are not interrupted.
    pub fn set_shutdown_requested(&self) {
        self.shutdown_requested.store(true, Ordering::SeqCst);
    }

    pub fn is_shutdown_requested(&self) -> bool {
        self.shutdown_requested.load(Ordering::SeqCst)
    }

    /// Rejects new operations, waits for running ones and releases the
    /// tablet's storage. Calling it again is a no-op.
    pub fn shutdown(&self) -> Result<()> {
        self.set_shutdown_requested();
        {
            let mut count = self.pending_ops.count.lock()?;
            while *count > 0 {
                count = self.pending_ops.drained.wait(count)?;
            }
        }

        let mut state = self.state.lock()?;
        if *state == TabletState::Shutdown {
            return Ok(());
        }
        *state = TabletState::Shutdown;
        self.storage.write()?.take();
        tracing::info!(dir = %self.config.dir.display(), "Tablet shut down");
        Ok(())
    }

    /// Registers an operation. Fails once shutdown was requested or before
    /// the tablet was opened.
    pub(crate) fn start_op(&self) -> Result<PendingOpGuard<'_>> {
        let mut count = self.pending_ops.count.lock()?;
        if self.is_shutdown_requested() {
            return Err(Error::ShutdownInProgress(format!(
                "tablet {} is shutting down",
                self.config.dir.display()
            )));
        }
        match *self.state.lock()? {
            TabletState::Bootstrapping | TabletState::Open => {}
            state => {
                return Err(Error::IllegalState(format!(
                    "tablet is not open: {}",
                    state
                )))
            }
        }
        *count += 1;
        Ok(PendingOpGuard {
            ops: &self.pending_ops,
        })
    }

    fn storage(&self) -> Result<Arc<TabletStorage>> {
        self.storage
            .read()?
            .clone()
            .ok_or_else(|| Error::IllegalState("tablet storage is not open".into()))
    }

    /// The current components. The lock is held only to clone the `Arc`.
    pub fn components(&self) -> Result<Arc<TabletComponents>> {
        Ok(self.components.read()?.clone())
    }

    fn seek_optimizer(&self) -> SeekOptimizer {
        SeekOptimizer::new(self.config.max_nexts_to_avoid_seek, self.config.trace_seeks)
    }

    /// Applies `batch` atomically and returns its write time.
    ///
    /// Per-key locks are taken before the write time is assigned, so writes to
    /// the same key get times in lock order.
    pub fn apply_write_batch(&self, batch: &DocWriteBatch) -> Result<HybridTime> {
        let _op = self.start_op()?;
        if batch.is_empty() {
            return Err(Error::InvalidArgument("empty write batch".into()));
        }
        let _locks = match self.config.lock_timeout {
            Some(timeout) => self.lock_manager.lock_with_timeout(batch.lock_keys(), timeout)?,
            None => self.lock_manager.lock(batch.lock_keys())?,
        };

        // Capture the memrowset and the write time together, so a flush that
        // swaps the memrowset afterwards waits for this write.
        let (components, hybrid_time) = {
            let components = self.components.read()?;
            let hybrid_time = self.mvcc.start_write()?;
            (components.clone(), hybrid_time)
        };

        let pairs = match batch.to_stored_pairs(hybrid_time, self.config.default_ttl) {
            Ok(pairs) => pairs,
            Err(e) => {
                self.mvcc.abort(hybrid_time)?;
                return Err(e);
            }
        };
        for (key, value) in pairs {
            components.memrowset.insert(key, value);
        }
        self.mvcc.commit(hybrid_time)?;

        tracing::trace!(ops = batch.len(), %hybrid_time, "Applied write batch");
        Ok(hybrid_time)
    }

    /// Checks that history at `snapshot` is still kept and pins it for as long
    /// as the returned read point lives.
    fn register_snapshot(&self, snapshot: Option<MvccSnapshot>) -> Result<(MvccSnapshot, mvcc::ScopedReadPoint)> {
        let cutoff = self.history_cutoff.lock()?;
        let snapshot = match snapshot {
            Some(snapshot) => snapshot,
            None => self.mvcc.take_snapshot()?,
        };
        if snapshot.read_time() < *cutoff {
            return Err(Error::InvalidArgument(format!(
                "snapshot {} is older than the history cutoff {}",
                snapshot.read_time(),
                *cutoff
            )));
        }
        let read_point = self.mvcc.register_read_point(snapshot.read_time())?;
        Ok((snapshot, read_point))
    }

    /// An iterator over every document visible at the requested snapshot,
    /// or at the current safe time.
    pub fn new_row_iterator(&self, options: RowIteratorOptions) -> Result<RowIterator> {
        let _op = self.start_op()?;
        if let Some(id) = options.transaction_id {
            return Err(Error::InvalidArgument(format!(
                "transactional reads are not supported (transaction {})",
                id
            )));
        }
        let (snapshot, read_point) = self.register_snapshot(options.snapshot)?;
        let components = self.components()?;
        RowIterator::new(
            components,
            self.seek_optimizer(),
            snapshot,
            options.projection,
            read_point,
        )
    }

    /// The document `doc_key` as of `snapshot`, or the current safe time.
    pub fn read_document(&self, doc_key: &DocKey, snapshot: Option<MvccSnapshot>) -> Result<Option<SubDocument>> {
        let _op = self.start_op()?;
        let (snapshot, _read_point) = self.register_snapshot(snapshot)?;
        let key = doc_key.encode();
        let components = self.components()?;
        let mut iter = components.new_point_iterator(&key);
        DocReader::new(&mut iter, self.seek_optimizer(), snapshot.read_time()).read_subdocument(&key, None)
    }

    /// The newest version of `key` or of its first descendant visible at
    /// `snapshot`. Overwrites of `key`'s ancestors are not consulted; use
    /// `read_document` for that.
    pub fn get(&self, key: &SubDocKey, snapshot: Option<MvccSnapshot>) -> Result<Option<ResolvedValue>> {
        let _op = self.start_op()?;
        let (snapshot, _read_point) = self.register_snapshot(snapshot)?;
        let encoded = key.encode_without_hybrid_time();
        let components = self.components()?;
        let mut iter = components.new_point_iterator(&key.doc_key().encode());
        resolve(&mut iter, &self.seek_optimizer(), &encoded, snapshot.read_time())
    }

    /// Raises the history cutoff to what the current readers and the
    /// retention window allow, and returns it.
    pub(crate) fn advance_history_cutoff(&self) -> Result<HybridTime> {
        let mut cutoff = self.history_cutoff.lock()?;
        let oldest = self.mvcc.oldest_read_point()?;
        let candidate = oldest.sub_physical(self.config.history_retention);
        *cutoff = (*cutoff).max(candidate);
        Ok(*cutoff)
    }

    /// Oldest read time the tablet still serves.
    pub fn history_cutoff(&self) -> Result<HybridTime> {
        Ok(*self.history_cutoff.lock()?)
    }

    /// Deletes blocks that committed metadata no longer references. Returns
    /// how many were deleted.
    pub fn delete_orphaned_blocks(&self) -> Result<usize> {
        let _op = self.start_op()?;
        let _gc = self.orphan_gc_lock.lock()?;
        let storage = self.storage()?;

        let orphans: Vec<_> = storage.metadata.orphaned_blocks()?.into_iter().collect();
        if orphans.is_empty() {
            return Ok(0);
        }
        for id in &orphans {
            storage.blocks.delete_block(*id)?;
        }
        storage.metadata.commit(MetadataEdit::DeleteOrphans {
            blocks: orphans.clone(),
        })?;

        tracing::info!(blocks = orphans.len(), "Deleted orphaned blocks");
        Ok(orphans.len())
    }

    /// Writes a consistent copy of the tablet into `dir`, which must not
    /// exist yet. The copy opens as a tablet of its own.
    pub fn create_checkpoint(&self, dir: &Path) -> Result<()> {
        let _op = self.start_op()?;
        let _checkpoint = self.checkpoint_lock.lock()?;
        if dir.exists() {
            return Err(Error::InvalidArgument(format!(
                "checkpoint directory {} already exists",
                dir.display()
            )));
        }

        self.flush(FlushMode::Sync)?;

        // Blocks of the captured state stay on disk while linked.
        let _gc = self.orphan_gc_lock.lock()?;
        let storage = self.storage()?;
        fs::create_dir_all(dir)?;
        let state = storage.metadata.write_snapshot_to(dir)?;
        let live = state.live_blocks();
        for id in &live {
            storage.blocks.link_block_into(*id, dir)?;
        }

        tracing::info!(
            dir = %dir.display(),
            rowsets = state.rowsets.len(),
            blocks = live.len(),
            "Created checkpoint"
        );
        Ok(())
    }

    pub fn set_flush_hooks(&self, hooks: Arc<dyn FlushFaultHooks>) -> Result<()> {
        self.hooks.write()?.flush = hooks;
        Ok(())
    }

    pub fn set_compaction_hooks(&self, hooks: Arc<dyn CompactionFaultHooks>) -> Result<()> {
        self.hooks.write()?.compaction = hooks;
        Ok(())
    }

    pub fn set_flush_compact_common_hooks(&self, hooks: Arc<dyn FlushCompactCommonHooks>) -> Result<()> {
        self.hooks.write()?.common = hooks;
        Ok(())
    }

    fn flush_hooks(&self) -> Result<Arc<dyn FlushFaultHooks>> {
        Ok(self.hooks.read()?.flush.clone())
    }

    fn compaction_hooks(&self) -> Result<Arc<dyn CompactionFaultHooks>> {
        Ok(self.hooks.read()?.compaction.clone())
    }

    fn common_hooks(&self) -> Result<Arc<dyn FlushCompactCommonHooks>> {
        Ok(self.hooks.read()?.common.clone())
    }

    /// Claims `rowset` and returns its current version. Returns `None` if
    /// someone else holds it or it is no longer part of the tablet. While
    /// the claim is held nobody else can replace the rowset.
    fn claim_current(&self, rowset: &Arc<DiskRowSet>) -> Result<Option<(RowSetClaim, Arc<DiskRowSet>)>> {
        let Some(claim) = rowset.metadata().try_claim() else {
            return Ok(None);
        };
        match self.components()?.rowsets.get(rowset.id()) {
            Some(current) if Arc::ptr_eq(current.metadata(), rowset.metadata()) => {
                Ok(Some((claim, current.clone())))
            }
            _ => Ok(None),
        }
    }

    /// Publishes components derived from the current ones. Only the swap
    /// itself runs under the exclusive lock.
    fn swap_components<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&TabletComponents) -> Result<TabletComponents>,
    {
        let mut components = self.components.write()?;
        let next = f(&components)?;
        *components = Arc::new(next);
        Ok(())
    }

    /// Total on-disk size of the tablet's rowsets.
    pub fn on_disk_size(&self) -> Result<u64> {
        Ok(self.components()?.rowsets.total_size())
    }

    pub fn num_rowsets(&self) -> Result<usize> {
        Ok(self.components()?.rowsets.len())
    }

    pub fn memrowset_size(&self) -> Result<usize> {
        Ok(self.components()?.memrowset.size())
    }
}

impl fmt::Debug for Tablet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tablet")
            .field("dir", &self.config.dir)
            .field("shutdown_requested", &self.is_shutdown_requested())
            .finish()
    }
}
