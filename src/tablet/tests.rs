use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::*;
use crate::clock::ManualClock;
use crate::config::CompactionConfig;
use crate::docdb::{KvIterator, PrimitiveValue, Value};
use crate::hybrid_time::DocHybridTime;
use crate::tmpfs::TempDir;

fn ht(micros: u64) -> HybridTime {
    HybridTime::from_micros(micros)
}

fn open_at(config: TabletConfig, clock: &Arc<ManualClock>) -> Tablet {
    let tablet = Tablet::new(config, clock.clone() as SharedClock);
    tablet.open().unwrap();
    tablet.mark_finished_bootstrapping().unwrap();
    tablet
}

fn open(config: TabletConfig) -> (Tablet, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new(ht(1_000)));
    (open_at(config, &clock), clock)
}

fn col(row: &str, col: &str) -> SubDocKey {
    SubDocKey::new(DocKey::from_components([row]), vec![col.into()])
}

fn put(tablet: &Tablet, row: &str, column: &str, value: i64) -> HybridTime {
    let mut batch = DocWriteBatch::new();
    batch.set_primitive(col(row, column), value).unwrap();
    tablet.apply_write_batch(&batch).unwrap()
}

fn delete_row(tablet: &Tablet, row: &str) {
    let mut batch = DocWriteBatch::new();
    batch
        .delete(SubDocKey::new(DocKey::from_components([row]), vec![]))
        .unwrap();
    tablet.apply_write_batch(&batch).unwrap();
}

fn read_int(tablet: &Tablet, row: &str, column: &str) -> Option<i64> {
    let doc = tablet
        .read_document(&DocKey::from_components([row]), None)
        .unwrap()?;
    match doc.get(&column.into())?.as_primitive()? {
        PrimitiveValue::Int64(v) => Some(*v),
        other => panic!("unexpected value {}", other),
    }
}

fn scan_rows(tablet: &Tablet) -> Vec<DocKey> {
    tablet
        .new_row_iterator(RowIteratorOptions::new())
        .unwrap()
        .map(|row| row.unwrap().0)
        .collect()
}

fn count_entries(rowset: &DiskRowSet) -> usize {
    let mut iter = rowset.new_iterator();
    iter.seek_to_first().unwrap();
    let mut n = 0;
    while iter.valid() {
        n += 1;
        iter.next().unwrap();
    }
    n
}

/// Fails flushes and compactions right before their metadata commit.
#[derive(Default)]
struct FailBeforeCommit {
    fail: AtomicBool,
}

impl FlushCompactCommonHooks for FailBeforeCommit {
    fn post_write_snapshot(&self) -> Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(Error::Aborted("injected failure".into()));
        }
        Ok(())
    }
}

#[test]
fn test_write_then_read() {
    let dir = TempDir::new().unwrap();
    let (tablet, _clock) = open(TabletConfig::new(dir.path()));

    put(&tablet, "a", "x", 1);
    put(&tablet, "a", "y", 2);
    put(&tablet, "b", "x", 3);

    let doc = tablet
        .read_document(&DocKey::from_components(["a"]), None)
        .unwrap()
        .unwrap();
    assert_eq!(doc.num_children(), 2);
    assert_eq!(read_int(&tablet, "a", "y"), Some(2));
    assert_eq!(read_int(&tablet, "b", "x"), Some(3));
    assert!(tablet
        .read_document(&DocKey::from_components(["c"]), None)
        .unwrap()
        .is_none());

    let resolved = tablet.get(&col("a", "x"), None).unwrap().unwrap();
    assert_eq!(resolved.value, Value::new(1i64));
    assert_eq!(scan_rows(&tablet).len(), 2);
}

#[test]
fn test_later_write_in_batch_wins() {
    let dir = TempDir::new().unwrap();
    let (tablet, _clock) = open(TabletConfig::new(dir.path()));

    let mut batch = DocWriteBatch::new();
    batch.set_primitive(col("a", "x"), 1i64).unwrap();
    batch.set_primitive(col("a", "x"), 2i64).unwrap();
    tablet.apply_write_batch(&batch).unwrap();
    assert_eq!(read_int(&tablet, "a", "x"), Some(2));

    let err = tablet.apply_write_batch(&DocWriteBatch::new()).unwrap_err();
    assert!(matches!(err, Error::InvalidArgument(_)));
}

#[test]
fn test_expired_value_reads_as_tombstone_at_expiry() {
    let dir = TempDir::new().unwrap();
    let clock = Arc::new(ManualClock::new(ht(10)));
    let tablet = open_at(TabletConfig::new(dir.path()), &clock);

    let mut batch = DocWriteBatch::new();
    batch
        .set(col("a", "x"), Value::new(1i64).with_ttl(Duration::from_micros(5)))
        .unwrap();
    assert_eq!(tablet.apply_write_batch(&batch).unwrap(), ht(10));

    clock.set(ht(12));
    let at_12 = tablet.mvcc().snapshot_at(ht(12)).unwrap();
    let resolved = tablet.get(&col("a", "x"), Some(at_12)).unwrap().unwrap();
    assert_eq!(resolved.value, Value::new(1i64).with_ttl(Duration::from_micros(5)));

    // Still visible at exactly the expiry time.
    clock.set(ht(20));
    let at_15 = tablet.mvcc().snapshot_at(ht(15)).unwrap();
    assert!(!tablet.get(&col("a", "x"), Some(at_15)).unwrap().unwrap().value.is_tombstone());

    let at_20 = tablet.mvcc().snapshot_at(ht(20)).unwrap();
    let resolved = tablet.get(&col("a", "x"), Some(at_20)).unwrap().unwrap();
    assert!(resolved.value.is_tombstone());
    assert_eq!(resolved.doc_hybrid_time(), DocHybridTime::new(ht(15), 0));
    assert!(tablet
        .read_document(&DocKey::from_components(["a"]), Some(at_20))
        .unwrap()
        .is_none());
}

#[test]
fn test_default_ttl_applies_to_unexpiring_values() {
    let dir = TempDir::new().unwrap();
    let config = TabletConfig::new(dir.path()).default_ttl(Some(Duration::from_micros(5)));
    let clock = Arc::new(ManualClock::new(ht(10)));
    let tablet = open_at(config, &clock);

    put(&tablet, "a", "x", 1);
    clock.set(ht(30));
    assert_eq!(read_int(&tablet, "a", "x"), None);
}

#[test]
fn test_future_snapshot_rejected() {
    let dir = TempDir::new().unwrap();
    let (tablet, _clock) = open(TabletConfig::new(dir.path()));

    let err = tablet.mvcc().snapshot_at(ht(5_000)).unwrap_err();
    assert!(matches!(err, Error::InvalidArgument(_)));
}

#[test]
fn test_transactional_read_rejected() {
    let dir = TempDir::new().unwrap();
    let (tablet, _clock) = open(TabletConfig::new(dir.path()));

    let err = tablet
        .new_row_iterator(RowIteratorOptions::new().transaction_id(7))
        .err()
        .unwrap();
    assert!(matches!(err, Error::InvalidArgument(_)));
}

#[test]
fn test_reads_survive_flush_and_reopen() {
    let dir = TempDir::new().unwrap();
    let clock = Arc::new(ManualClock::new(ht(1_000)));
    {
        let tablet = open_at(TabletConfig::new(dir.path()), &clock);
        put(&tablet, "a", "x", 1);
        put(&tablet, "b", "x", 2);
        tablet.flush(FlushMode::Sync).unwrap();

        assert_eq!(tablet.num_rowsets().unwrap(), 1);
        assert_eq!(tablet.memrowset_size().unwrap(), 0);
        assert!(!tablet.has_frozen_memrowsets().unwrap());
        assert_eq!(read_int(&tablet, "a", "x"), Some(1));

        put(&tablet, "c", "x", 3);
        tablet.flush(FlushMode::Sync).unwrap();
        tablet.shutdown().unwrap();
    }

    let tablet = open_at(TabletConfig::new(dir.path()), &clock);
    assert_eq!(read_int(&tablet, "a", "x"), Some(1));
    assert_eq!(read_int(&tablet, "b", "x"), Some(2));
    assert_eq!(read_int(&tablet, "c", "x"), Some(3));
    assert_eq!(scan_rows(&tablet).len(), 3);
}

#[test]
fn test_async_flush_leaves_memrowset_frozen() {
    let dir = TempDir::new().unwrap();
    let (tablet, _clock) = open(TabletConfig::new(dir.path()));

    put(&tablet, "a", "x", 1);
    tablet.flush(FlushMode::Async).unwrap();
    assert!(tablet.has_frozen_memrowsets().unwrap());
    assert_eq!(read_int(&tablet, "a", "x"), Some(1));

    assert_eq!(tablet.flush_frozen_memrowsets().unwrap(), 1);
    assert!(!tablet.has_frozen_memrowsets().unwrap());
    assert_eq!(tablet.num_rowsets().unwrap(), 1);
}

#[test]
fn test_flush_if_needed() {
    let dir = TempDir::new().unwrap();
    let config = TabletConfig::new(dir.path()).max_memrowset_size(1);
    let (tablet, _clock) = open(config);

    assert!(!tablet.flush_if_needed().unwrap());
    put(&tablet, "a", "x", 1);
    assert!(tablet.flush_if_needed().unwrap());
    assert_eq!(tablet.num_rowsets().unwrap(), 1);
}

#[test]
fn test_flush_routes_covered_documents_to_redo_deltas() {
    let dir = TempDir::new().unwrap();
    let (tablet, _clock) = open(TabletConfig::new(dir.path()));

    put(&tablet, "a", "x", 1);
    put(&tablet, "c", "x", 1);
    tablet.flush(FlushMode::Sync).unwrap();

    put(&tablet, "b", "x", 2);
    put(&tablet, "d", "x", 2);
    tablet.flush(FlushMode::Sync).unwrap();

    // "b" falls inside the first rowset, "d" does not.
    let components = tablet.components().unwrap();
    assert_eq!(components.rowsets.len(), 2);
    assert_eq!(components.rowsets.rowsets()[0].num_redo_blocks(), 1);
    assert_eq!(components.rowsets.rowsets()[1].num_redo_blocks(), 0);
    assert_eq!(read_int(&tablet, "b", "x"), Some(2));
    assert_eq!(read_int(&tablet, "d", "x"), Some(2));
}

#[test]
fn test_flush_without_redo_routing_writes_new_rowsets() {
    let dir = TempDir::new().unwrap();
    let config = TabletConfig::new(dir.path()).flush_to_redo_deltas(false);
    let (tablet, _clock) = open(config);

    put(&tablet, "a", "x", 1);
    put(&tablet, "c", "x", 1);
    tablet.flush(FlushMode::Sync).unwrap();
    put(&tablet, "b", "x", 2);
    tablet.flush(FlushMode::Sync).unwrap();

    assert_eq!(tablet.num_rowsets().unwrap(), 2);
    assert_eq!(read_int(&tablet, "b", "x"), Some(2));
}

#[test]
fn test_failed_flush_keeps_memrowset_frozen() {
    let dir = TempDir::new().unwrap();
    let (tablet, _clock) = open(TabletConfig::new(dir.path()));
    let hooks = Arc::new(FailBeforeCommit::default());
    tablet.set_flush_compact_common_hooks(hooks.clone()).unwrap();

    put(&tablet, "a", "x", 1);
    hooks.fail.store(true, Ordering::SeqCst);
    let err = tablet.flush(FlushMode::Sync).unwrap_err();
    assert!(matches!(err, Error::Aborted(_)));

    assert!(tablet.has_frozen_memrowsets().unwrap());
    assert_eq!(tablet.num_rowsets().unwrap(), 0);
    assert_eq!(read_int(&tablet, "a", "x"), Some(1));
    let blocks = tablet.storage().unwrap().blocks.list_blocks().unwrap();
    assert!(blocks.is_empty());

    hooks.fail.store(false, Ordering::SeqCst);
    assert_eq!(tablet.flush_frozen_memrowsets().unwrap(), 1);
    assert!(!tablet.has_frozen_memrowsets().unwrap());
    assert_eq!(read_int(&tablet, "a", "x"), Some(1));
}

#[test]
fn test_failed_compaction_keeps_inputs() {
    let dir = TempDir::new().unwrap();
    let config = TabletConfig::new(dir.path()).flush_to_redo_deltas(false);
    let (tablet, _clock) = open(config);
    let hooks = Arc::new(FailBeforeCommit::default());
    tablet.set_flush_compact_common_hooks(hooks.clone()).unwrap();

    for row in ["a", "b"] {
        put(&tablet, row, "x", 1);
        tablet.flush(FlushMode::Sync).unwrap();
    }
    hooks.fail.store(true, Ordering::SeqCst);
    assert!(tablet.compact(CompactFlags::FORCE_COMPACT_ALL).is_err());

    assert_eq!(tablet.num_rowsets().unwrap(), 2);
    let components = tablet.components().unwrap();
    assert!(components.rowsets.rowsets().iter().all(|r| !r.metadata().is_claimed()));
    assert_eq!(scan_rows(&tablet).len(), 2);

    hooks.fail.store(false, Ordering::SeqCst);
    assert_eq!(tablet.compact(CompactFlags::FORCE_COMPACT_ALL).unwrap(), 2);
    assert_eq!(tablet.num_rowsets().unwrap(), 1);
}

#[test]
fn test_scan_is_consistent_across_flush_and_compaction() {
    let dir = TempDir::new().unwrap();
    let config = TabletConfig::new(dir.path())
        .history_retention(Duration::ZERO)
        .flush_to_redo_deltas(false);
    let (tablet, _clock) = open(config);

    for i in 0..10 {
        put(&tablet, &format!("row{:02}", i), "x", i);
        if i % 3 == 0 {
            tablet.flush(FlushMode::Sync).unwrap();
        }
    }

    let mut iter = tablet.new_row_iterator(RowIteratorOptions::new()).unwrap();
    let mut seen = Vec::new();
    for _ in 0..3 {
        seen.push(iter.next_row().unwrap().unwrap().0);
    }

    // Changes after the iterator's snapshot must not show up in it.
    put(&tablet, "row00", "x", 100);
    put(&tablet, "row99", "x", 99);
    delete_row(&tablet, "row05");
    tablet.flush(FlushMode::Sync).unwrap();
    tablet.compact(CompactFlags::FORCE_COMPACT_ALL).unwrap();
    assert_eq!(tablet.num_rowsets().unwrap(), 1);
    assert!(tablet.history_cutoff().unwrap() <= iter.snapshot().read_time());

    while let Some((doc_key, _)) = iter.next_row().unwrap() {
        seen.push(doc_key);
    }
    let expected: Vec<DocKey> = (0..10)
        .map(|i| DocKey::from_components([format!("row{:02}", i)]))
        .collect();
    assert_eq!(seen, expected);
    drop(iter);

    let now: Vec<DocKey> = scan_rows(&tablet);
    assert_eq!(now.len(), 10);
    assert!(!now.contains(&DocKey::from_components(["row05"])));
    assert_eq!(read_int(&tablet, "row00", "x"), Some(100));
}

#[test]
fn test_projection_limits_columns() {
    let dir = TempDir::new().unwrap();
    let (tablet, _clock) = open(TabletConfig::new(dir.path()));
    put(&tablet, "a", "x", 1);
    put(&tablet, "a", "y", 2);

    let rows: Vec<_> = tablet
        .new_row_iterator(RowIteratorOptions::new().projection(["y"]))
        .unwrap()
        .map(|row| row.unwrap().1)
        .collect();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].num_children(), 1);
    assert!(rows[0].get(&"y".into()).is_some());
}

#[test]
fn test_force_compaction_collects_history_and_tombstones() {
    let dir = TempDir::new().unwrap();
    let config = TabletConfig::new(dir.path())
        .history_retention(Duration::ZERO)
        .flush_to_redo_deltas(false);
    let (tablet, _clock) = open(config);

    let first_write = put(&tablet, "a", "x", 1);
    tablet.flush(FlushMode::Sync).unwrap();
    put(&tablet, "a", "x", 2);
    put(&tablet, "b", "x", 1);
    tablet.flush(FlushMode::Sync).unwrap();
    delete_row(&tablet, "b");
    tablet.flush(FlushMode::Sync).unwrap();
    assert_eq!(tablet.num_rowsets().unwrap(), 3);

    assert_eq!(tablet.compact(CompactFlags::FORCE_COMPACT_ALL).unwrap(), 3);
    let components = tablet.components().unwrap();
    assert_eq!(components.rowsets.len(), 1);
    // Only the newest version of a.x survives.
    assert_eq!(count_entries(&components.rowsets.rowsets()[0]), 1);
    assert_eq!(read_int(&tablet, "a", "x"), Some(2));
    assert_eq!(read_int(&tablet, "b", "x"), None);

    // History before the cutoff is gone and cannot be read any more.
    let old = tablet.mvcc().snapshot_at(first_write).unwrap();
    let err = tablet
        .read_document(&DocKey::from_components(["a"]), Some(old))
        .unwrap_err();
    assert!(matches!(err, Error::InvalidArgument(_)));

    assert!(tablet.delete_orphaned_blocks().unwrap() > 0);
    assert_eq!(tablet.delete_orphaned_blocks().unwrap(), 0);
}

#[test]
fn test_policy_compaction_needs_enough_rowsets() {
    let dir = TempDir::new().unwrap();
    let config = TabletConfig::new(dir.path())
        .flush_to_redo_deltas(false)
        .compaction(
            CompactionConfig::default()
                .file_num_compaction_trigger(3)
                .min_merge_width(2),
        );
    let (tablet, _clock) = open(config);

    for row in ["a", "b"] {
        put(&tablet, row, "x", 1);
        tablet.flush(FlushMode::Sync).unwrap();
    }
    assert_eq!(tablet.compact(CompactFlags::NONE).unwrap(), 0);

    put(&tablet, "c", "x", 1);
    tablet.flush(FlushMode::Sync).unwrap();
    assert_eq!(tablet.compact(CompactFlags::NONE).unwrap(), 3);
    assert_eq!(tablet.num_rowsets().unwrap(), 1);
    assert_eq!(scan_rows(&tablet).len(), 3);
}

#[test]
fn test_orphans_are_removed_on_reopen() {
    let dir = TempDir::new().unwrap();
    let clock = Arc::new(ManualClock::new(ht(1_000)));
    let config = TabletConfig::new(dir.path()).flush_to_redo_deltas(false);
    {
        let tablet = open_at(config.clone(), &clock);
        for row in ["a", "b"] {
            put(&tablet, row, "x", 1);
            tablet.flush(FlushMode::Sync).unwrap();
        }
        tablet.compact(CompactFlags::FORCE_COMPACT_ALL).unwrap();
        tablet.shutdown().unwrap();
    }

    let tablet = open_at(config, &clock);
    assert_eq!(tablet.delete_orphaned_blocks().unwrap(), 0);
    let storage = tablet.storage().unwrap();
    let live = storage.metadata.live_blocks().unwrap();
    assert_eq!(storage.blocks.list_blocks().unwrap(), live);
    assert_eq!(scan_rows(&tablet).len(), 2);
}

#[test]
fn test_delta_compactions() {
    let dir = TempDir::new().unwrap();
    let clock = Arc::new(ManualClock::new(ht(1_000)));
    let config = TabletConfig::new(dir.path()).history_retention(Duration::ZERO);
    let id = {
        let tablet = open_at(config.clone(), &clock);
        put(&tablet, "a", "x", 1);
        put(&tablet, "z", "x", 1);
        tablet.flush(FlushMode::Sync).unwrap();
        for row in ["m", "n"] {
            put(&tablet, row, "x", 2);
            tablet.flush(FlushMode::Sync).unwrap();
        }
        assert_eq!(tablet.num_rowsets().unwrap(), 1);
        let rowset = tablet.components().unwrap().rowsets.rowsets()[0].clone();
        assert_eq!(rowset.num_redo_blocks(), 2);

        let id = tablet
            .compact_worst_deltas(DeltaCompactionType::Minor)
            .unwrap()
            .unwrap();
        assert_eq!(id, rowset.id());
        let rowset = tablet.components().unwrap().rowsets.rowsets()[0].clone();
        assert_eq!(rowset.num_redo_blocks(), 1);
        assert_eq!(
            tablet.compact_worst_deltas(DeltaCompactionType::Minor).unwrap(),
            None
        );

        put(&tablet, "a", "x", 3);
        tablet.flush(FlushMode::Sync).unwrap();
        assert_eq!(
            tablet.compact_worst_deltas(DeltaCompactionType::Major).unwrap(),
            Some(id)
        );
        let rowset = tablet.components().unwrap().rowsets.rowsets()[0].clone();
        assert_eq!(rowset.num_redo_blocks(), 0);
        assert_eq!(rowset.num_undo_blocks(), 1);
        assert!(rowset.may_contain(&DocKey::from_components(["m"]).encode()));
        // No redo left to fold.
        assert_eq!(
            tablet.compact_worst_deltas(DeltaCompactionType::Major).unwrap(),
            None
        );

        assert_eq!(read_int(&tablet, "a", "x"), Some(3));
        assert_eq!(read_int(&tablet, "m", "x"), Some(2));
        tablet.shutdown().unwrap();
        id
    };

    let tablet = open_at(config, &clock);
    let rowset = tablet.components().unwrap().rowsets.rowsets()[0].clone();
    assert_eq!(rowset.id(), id);
    assert_eq!(rowset.num_redo_blocks(), 0);
    assert_eq!(read_int(&tablet, "a", "x"), Some(3));
    assert_eq!(read_int(&tablet, "n", "x"), Some(2));
    assert_eq!(scan_rows(&tablet).len(), 4);
}

#[test]
fn test_checkpoint_opens_as_tablet() {
    let dir = TempDir::new().unwrap();
    let clock = Arc::new(ManualClock::new(ht(1_000)));
    let tablet = open_at(TabletConfig::new(dir.path().join("source")), &clock);

    put(&tablet, "a", "x", 1);
    tablet.flush(FlushMode::Sync).unwrap();
    put(&tablet, "b", "x", 2);

    let target = dir.child("checkpoint");
    tablet.create_checkpoint(&target).unwrap();
    let err = tablet.create_checkpoint(&target).unwrap_err();
    assert!(matches!(err, Error::InvalidArgument(_)));

    // Later writes to the source stay out of the copy.
    put(&tablet, "c", "x", 3);
    tablet.flush(FlushMode::Sync).unwrap();

    let copy = open_at(TabletConfig::new(&target), &clock);
    assert_eq!(read_int(&copy, "a", "x"), Some(1));
    assert_eq!(read_int(&copy, "b", "x"), Some(2));
    assert_eq!(read_int(&copy, "c", "x"), None);
}

#[test]
fn test_lifecycle_states() {
    let dir = TempDir::new().unwrap();
    let clock = Arc::new(ManualClock::new(ht(1_000)));
    let tablet = Tablet::new(TabletConfig::new(dir.path()), clock.clone() as SharedClock);
    assert_eq!(tablet.state().unwrap(), TabletState::Initialized);

    let mut batch = DocWriteBatch::new();
    batch.set_primitive(col("a", "x"), 1i64).unwrap();
    let err = tablet.apply_write_batch(&batch).unwrap_err();
    assert!(matches!(err, Error::IllegalState(_)));
    assert!(matches!(
        tablet.mark_finished_bootstrapping().unwrap_err(),
        Error::IllegalState(_)
    ));

    tablet.open().unwrap();
    assert_eq!(tablet.state().unwrap(), TabletState::Bootstrapping);
    assert!(matches!(tablet.open().unwrap_err(), Error::IllegalState(_)));
    tablet.mark_finished_bootstrapping().unwrap();
    assert_eq!(tablet.state().unwrap(), TabletState::Open);
    tablet.apply_write_batch(&batch).unwrap();

    tablet.shutdown().unwrap();
    assert_eq!(tablet.state().unwrap(), TabletState::Shutdown);
    let err = tablet.apply_write_batch(&batch).unwrap_err();
    assert!(err.is_shutdown_in_progress());
    assert!(tablet.flush(FlushMode::Sync).unwrap_err().is_shutdown_in_progress());
    tablet.shutdown().unwrap();
}

#[test]
fn test_directory_is_locked_while_open() {
    let dir = TempDir::new().unwrap();
    let (tablet, clock) = open(TabletConfig::new(dir.path()));

    let second = Tablet::new(TabletConfig::new(dir.path()), clock.clone() as SharedClock);
    assert!(second.open().is_err());
    assert_eq!(second.state().unwrap(), TabletState::Initialized);

    tablet.shutdown().unwrap();
    second.open().unwrap();
}

#[test]
fn test_concurrent_writes_and_flushes() {
    let dir = TempDir::new().unwrap();
    let (tablet, _clock) = open(TabletConfig::new(dir.path()));

    std::thread::scope(|s| {
        for t in 0..4 {
            let tablet = &tablet;
            s.spawn(move || {
                for i in 0..50 {
                    put(tablet, &format!("t{}-{:03}", t, i), "x", i);
                }
            });
        }
        s.spawn(|| {
            for _ in 0..5 {
                tablet.flush(FlushMode::Sync).unwrap();
                std::thread::yield_now();
            }
        });
    });
    tablet.flush(FlushMode::Sync).unwrap();

    assert_eq!(scan_rows(&tablet).len(), 200);
    assert_eq!(read_int(&tablet, "t3-049", "x"), Some(49));
    assert_eq!(tablet.mvcc().num_in_flight().unwrap(), 0);
}

fn write_generation(tablet: &Tablet, rows: usize, generation: i64) {
    let mut batch = DocWriteBatch::new();
    for i in 0..rows {
        batch
            .set_primitive(col(&format!("r{:03}", i), "x"), generation)
            .unwrap();
    }
    tablet.apply_write_batch(&batch).unwrap();
}

fn scan_values(tablet: &Tablet, snapshot: MvccSnapshot) -> Vec<(DocKey, i64)> {
    tablet
        .new_row_iterator(RowIteratorOptions::new().snapshot(snapshot))
        .unwrap()
        .map(|row| {
            let (doc_key, doc) = row.unwrap();
            let value = match doc.get(&"x".into()).and_then(|v| v.as_primitive()) {
                Some(PrimitiveValue::Int64(v)) => *v,
                other => panic!("unexpected value {:?} in {:?}", other, doc_key),
            };
            (doc_key, value)
        })
        .collect()
}

#[test]
fn test_concurrent_scans_during_flush_and_compaction() {
    const ROWS: usize = 100;
    let dir = TempDir::new().unwrap();
    // Small blocks so every rowset spans many of them.
    let (tablet, _clock) = open(TabletConfig::new(dir.path()).block_size(128));
    write_generation(&tablet, ROWS, 0);
    tablet.flush(FlushMode::Sync).unwrap();

    let writing = AtomicBool::new(true);
    let scans = std::sync::atomic::AtomicUsize::new(0);
    std::thread::scope(|s| {
        s.spawn(|| {
            for generation in 1..=30 {
                write_generation(&tablet, ROWS, generation);
                if generation % 3 == 0 {
                    tablet.flush(FlushMode::Sync).unwrap();
                }
                if generation % 9 == 0 {
                    tablet.compact(CompactFlags::FORCE_COMPACT_ALL).unwrap();
                }
            }
            writing.store(false, Ordering::SeqCst);
        });
        for _ in 0..4 {
            s.spawn(|| loop {
                let done = !writing.load(Ordering::SeqCst);
                let snapshot = tablet.mvcc().take_snapshot().unwrap();
                let rows = scan_values(&tablet, snapshot);
                assert_eq!(rows.len(), ROWS);
                // Each generation is one batch, so a snapshot sees all of it
                // or none of it.
                let generation = rows[0].1;
                assert!(rows.iter().all(|(_, v)| *v == generation), "torn scan {:?}", rows);
                assert_eq!(scan_values(&tablet, snapshot), rows);
                scans.fetch_add(1, Ordering::SeqCst);
                if done {
                    break;
                }
            });
        }
    });

    assert!(scans.load(Ordering::SeqCst) >= 4);
    let rows = scan_values(&tablet, tablet.mvcc().take_snapshot().unwrap());
    assert!(rows.iter().all(|(_, v)| *v == 30));
}

#[test]
fn test_write_gives_up_on_held_locks_after_timeout() {
    let dir = TempDir::new().unwrap();
    let config = TabletConfig::new(dir.path()).lock_timeout(Some(Duration::from_millis(20)));
    let (tablet, _clock) = open(config);

    let mut batch = DocWriteBatch::new();
    batch.set_primitive(col("a", "x"), 1i64).unwrap();
    let held = tablet.lock_manager.lock(batch.lock_keys()).unwrap();
    let err = tablet.apply_write_batch(&batch).unwrap_err();
    assert!(matches!(err, Error::Aborted(_)));
    // The failed write never got a write time.
    assert_eq!(tablet.mvcc().num_in_flight().unwrap(), 0);
    assert_eq!(read_int(&tablet, "a", "x"), None);

    drop(held);
    tablet.apply_write_batch(&batch).unwrap();
    assert_eq!(tablet.lock_manager.num_locked(), 0);
    assert_eq!(read_int(&tablet, "a", "x"), Some(1));
}
