use std::path::PathBuf;
use std::time::Duration;

/// Configuration for a tablet
#[derive(Debug, Clone)]
pub struct TabletConfig {
    /// Directory holding the tablet metadata log and its blocks
    pub dir: PathBuf,

    /// Sequential `next` steps tried before falling back to a seek (default: 8)
    pub max_nexts_to_avoid_seek: usize,

    /// Emit next/seek counts for every optimized seek at trace level (default: false)
    pub trace_seeks: bool,

    /// TTL applied to values written without one. `None` means never expire.
    pub default_ttl: Option<Duration>,

    /// MemRowSet size that triggers a background flush (default: 64MB)
    pub max_memrowset_size: usize,

    /// Target size of a data block inside a block file (default: 32KB)
    pub block_size: usize,

    /// Build a bloom filter over document keys for every rowset (default: true)
    pub use_bloom_filters: bool,

    /// Target false positive rate of rowset bloom filters (default: 0.01)
    pub bloom_false_positive_rate: f64,

    /// How far behind the oldest active reader history must be kept (default: 120s)
    pub history_retention: Duration,

    /// Route flushed entries that fall inside an existing rowset into a redo
    /// delta block of that rowset instead of a new rowset (default: true)
    pub flush_to_redo_deltas: bool,

    /// Combined flush/compaction write rate in bytes per second, 0 disables (default: 100MB)
    pub compact_flush_rate_limit_bytes_per_sec: u64,

    /// Metadata edits between rewrites of the metadata log (default: 100)
    pub metadata_snapshot_interval: u32,

    /// How long a write waits for its key locks before failing with
    /// `Aborted`. `None` waits indefinitely (default: None)
    pub lock_timeout: Option<Duration>,

    /// Compaction configuration
    pub compaction: CompactionConfig,

    /// Background task configuration
    pub scheduler: SchedulerConfig,
}

#[derive(Debug, Clone)]
pub struct CompactionConfig {
    /// Never pick rowsets for a merge compaction on its own (default: false)
    pub disable_compactions: bool,

    /// Number of rowsets that makes a merge compaction worth considering (default: 5)
    pub file_num_compaction_trigger: usize,

    /// Percentage slack allowed when accumulating similarly sized rowsets (default: 20)
    pub size_ratio: u32,

    /// Fewest rowsets merged by a size-ratio compaction (default: 4)
    pub min_merge_width: usize,

    /// Most rowsets merged by one compaction (default: unlimited)
    pub max_merge_width: usize,

    /// Rowsets larger than this are left out of size-ratio compactions (default: unlimited)
    pub max_file_size_for_compaction: u64,

    /// Redo delta blocks on one rowset that trigger a delta compaction (default: 4)
    pub delta_compaction_trigger: usize,
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// How often to check for flush opportunities (default: 1s)
    pub flush_interval: Duration,

    /// How often to check for compaction opportunities (default: 10s)
    pub compaction_interval: Duration,

    /// How often to check rowsets for delta compaction (default: 30s)
    pub delta_compaction_interval: Duration,

    /// How often to delete blocks orphaned by committed metadata (default: 30s)
    pub orphan_gc_interval: Duration,

    /// Concurrent background flushes (default: 1)
    pub max_background_flushes: usize,

    /// Concurrent background compactions of any kind (default: 4)
    pub max_background_compactions: usize,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            disable_compactions: false,
            file_num_compaction_trigger: 5,
            size_ratio: 20,
            min_merge_width: 4,
            max_merge_width: usize::MAX,
            max_file_size_for_compaction: u64::MAX,
            delta_compaction_trigger: 4,
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            flush_interval: Duration::from_secs(1),
            compaction_interval: Duration::from_secs(10),
            delta_compaction_interval: Duration::from_secs(30),
            orphan_gc_interval: Duration::from_secs(30),
            max_background_flushes: 1,
            max_background_compactions: 4,
        }
    }
}

impl Default for TabletConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./tablet"),
            max_nexts_to_avoid_seek: 8,
            trace_seeks: false,
            default_ttl: None,
            max_memrowset_size: 64 * 1024 * 1024, // 64MB
            block_size: 32 * 1024,                // 32KB
            use_bloom_filters: true,
            bloom_false_positive_rate: 0.01,
            history_retention: Duration::from_secs(120),
            flush_to_redo_deltas: true,
            compact_flush_rate_limit_bytes_per_sec: 100 * 1024 * 1024, // 100MB/s
            metadata_snapshot_interval: 100,
            lock_timeout: None,
            compaction: CompactionConfig::default(),
            scheduler: SchedulerConfig::default(),
        }
    }
}

impl TabletConfig {
    /// Create a new config with the given directory
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            ..Default::default()
        }
    }

    pub fn max_nexts_to_avoid_seek(mut self, n: usize) -> Self {
        self.max_nexts_to_avoid_seek = n;
        self
    }

    pub fn trace_seeks(mut self, enabled: bool) -> Self {
        self.trace_seeks = enabled;
        self
    }

    /// Set the TTL for values written without an explicit one
    pub fn default_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.default_ttl = ttl;
        self
    }

    pub fn max_memrowset_size(mut self, size: usize) -> Self {
        self.max_memrowset_size = size;
        self
    }

    pub fn block_size(mut self, size: usize) -> Self {
        self.block_size = size;
        self
    }

    pub fn use_bloom_filters(mut self, enabled: bool) -> Self {
        self.use_bloom_filters = enabled;
        self
    }

    pub fn bloom_false_positive_rate(mut self, rate: f64) -> Self {
        self.bloom_false_positive_rate = rate;
        self
    }

    pub fn history_retention(mut self, retention: Duration) -> Self {
        self.history_retention = retention;
        self
    }

    pub fn flush_to_redo_deltas(mut self, enabled: bool) -> Self {
        self.flush_to_redo_deltas = enabled;
        self
    }

    /// Set the flush/compaction write rate limit, 0 disables it
    pub fn compact_flush_rate_limit(mut self, bytes_per_sec: u64) -> Self {
        self.compact_flush_rate_limit_bytes_per_sec = bytes_per_sec;
        self
    }

    pub fn metadata_snapshot_interval(mut self, edits: u32) -> Self {
        self.metadata_snapshot_interval = edits;
        self
    }

    pub fn lock_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// Configure compaction settings
    pub fn compaction(mut self, config: CompactionConfig) -> Self {
        self.compaction = config;
        self
    }

    /// Configure background tasks
    pub fn scheduler(mut self, config: SchedulerConfig) -> Self {
        self.scheduler = config;
        self
    }
}

impl CompactionConfig {
    pub fn disable_compactions(mut self, disabled: bool) -> Self {
        self.disable_compactions = disabled;
        self
    }

    pub fn file_num_compaction_trigger(mut self, trigger: usize) -> Self {
        self.file_num_compaction_trigger = trigger;
        self
    }

    pub fn size_ratio(mut self, ratio: u32) -> Self {
        self.size_ratio = ratio;
        self
    }

    pub fn min_merge_width(mut self, width: usize) -> Self {
        self.min_merge_width = width;
        self
    }

    pub fn max_merge_width(mut self, width: usize) -> Self {
        self.max_merge_width = width;
        self
    }

    pub fn max_file_size_for_compaction(mut self, size: u64) -> Self {
        self.max_file_size_for_compaction = size;
        self
    }

    pub fn delta_compaction_trigger(mut self, blocks: usize) -> Self {
        self.delta_compaction_trigger = blocks;
        self
    }
}

impl SchedulerConfig {
    pub fn flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval;
        self
    }

    pub fn compaction_interval(mut self, interval: Duration) -> Self {
        self.compaction_interval = interval;
        self
    }

    pub fn delta_compaction_interval(mut self, interval: Duration) -> Self {
        self.delta_compaction_interval = interval;
        self
    }

    pub fn orphan_gc_interval(mut self, interval: Duration) -> Self {
        self.orphan_gc_interval = interval;
        self
    }

    pub fn max_background_flushes(mut self, n: usize) -> Self {
        self.max_background_flushes = n;
        self
    }

    pub fn max_background_compactions(mut self, n: usize) -> Self {
        self.max_background_compactions = n;
        self
    }
}
