//! Compaction: dead space reclamation across closed segments
//!
//! Overwritten values and deleted keys leave dead records behind in closed
//! segments. Compaction copies only the records the key directory still
//! points at into fresh segments and then retires the old ones.
//!
//! Ordering for crash safety:
//! 1. Snapshot the closed segments (never the active one)
//! 2. Copy each live record's raw bytes, timestamp unchanged, into new
//!    segments with freshly allocated (higher) IDs
//! 3. durable_sync the outputs and register them for reads
//! 4. Swap directory entries, but only where the entry still equals the
//!    snapshot (a concurrent put or delete wins)
//! 5. Rotate the active segment if an output now has a higher ID
//! 6. For copied keys that were deleted meanwhile, append a fresh tombstone
//!    so no stale copy in an output outranks the last delete on disk
//! 7. Delete the old segment files (lowest ID first), sync the directory
//!
//! A crash anywhere leaves either the old segments, the new ones, or both
//! on disk; replay resolves duplicates by timestamp.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{debug, info};

use crate::config::CompactionConfig;
use crate::error::{CaskError, CaskResult};
use crate::format::{encode_record, Limits};
use crate::keydir::{KeyDir, KeyDirEntry};
use crate::manager::SegmentManager;
use crate::segment::{SegmentId, SegmentWriter};

/// Outcome of one compaction run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompactionResult {
    /// Closed segments that were rewritten and deleted
    pub segments_compacted: usize,
    /// New segments written
    pub segments_written: usize,
    /// Live records copied and swapped in
    pub records_migrated: u64,
    /// Records copied but not swapped because the key changed meanwhile
    pub records_skipped: u64,
    /// Tombstones re-appended for keys deleted during the run
    pub tombstones_written: u64,
    /// Size of the compacted segments before the run
    pub bytes_before: u64,
    /// Size of the output segments
    pub bytes_after: u64,
}

impl CompactionResult {
    /// Fraction of the input that was dead (0.0 = no waste, 1.0 = all waste).
    pub fn dead_space_ratio(&self) -> f64 {
        if self.bytes_before == 0 {
            return 0.0;
        }
        self.bytes_saved() as f64 / self.bytes_before as f64
    }

    /// Space saved in bytes.
    pub fn bytes_saved(&self) -> u64 {
        self.bytes_before.saturating_sub(self.bytes_after)
    }
}

/// Policy check: enough data on disk, and enough of it dead.
pub fn should_compact(policy: &CompactionConfig, disk_bytes: u64, live_bytes: u64) -> bool {
    if disk_bytes == 0 || disk_bytes < policy.min_bytes {
        return false;
    }
    let dead = disk_bytes.saturating_sub(live_bytes);
    dead as f64 / disk_bytes as f64 >= policy.trigger_ratio
}

struct Migrated {
    key: Vec<u8>,
    old: KeyDirEntry,
    new: KeyDirEntry,
}

/// Rewrites the closed segments of one store.
///
/// The caller must ensure only one `Compactor` runs at a time.
pub struct Compactor<'a> {
    manager: &'a SegmentManager,
    keydir: &'a KeyDir,
    max_datafile_size: u64,
    limits: Limits,
    /// Checked between keys; when set, the run is abandoned
    abandon: &'a AtomicBool,
}

impl<'a> Compactor<'a> {
    pub fn new(
        manager: &'a SegmentManager,
        keydir: &'a KeyDir,
        max_datafile_size: u64,
        limits: Limits,
        abandon: &'a AtomicBool,
    ) -> Self {
        Self { manager, keydir, max_datafile_size, limits, abandon }
    }

    pub fn run(&self) -> CaskResult<CompactionResult> {
        let snapshot = self.manager.closed_segments()?;
        if snapshot.is_empty() {
            debug!("no closed segments to compact");
            return Ok(CompactionResult::default());
        }

        let mut bytes_before = 0u64;
        for &id in &snapshot {
            if let Some(segment) = self.manager.segment(id) {
                bytes_before += segment.len()?;
            }
        }

        let live = self.live_entries(&snapshot);
        debug!(segments = snapshot.len(), live_records = live.len(), "compaction snapshot taken");

        let mut outputs: Vec<SegmentWriter> = Vec::new();
        let migrated = match self.copy_live(&live, &mut outputs) {
            Ok(migrated) => migrated,
            Err(e) => {
                for writer in outputs {
                    self.manager.discard_unregistered(writer);
                }
                return Err(e);
            }
        };

        self.install(&snapshot, bytes_before, outputs, migrated)
    }

    /// Directory entries pointing into `snapshot`, in file order.
    fn live_entries(&self, snapshot: &[SegmentId]) -> Vec<(Vec<u8>, KeyDirEntry)> {
        let in_snapshot: BTreeSet<SegmentId> = snapshot.iter().copied().collect();
        let mut live = self.keydir.entries_in(|id| in_snapshot.contains(&id));
        live.sort_unstable_by_key(|(_, e)| (e.segment_id, e.offset));
        live
    }

    /// Publish synced outputs, swap entries, and retire the snapshot.
    fn install(
        &self,
        snapshot: &[SegmentId],
        bytes_before: u64,
        outputs: Vec<SegmentWriter>,
        migrated: Vec<Migrated>,
    ) -> CaskResult<CompactionResult> {
        let mut bytes_after = 0u64;
        let mut output_ids = Vec::with_capacity(outputs.len());
        for writer in &outputs {
            bytes_after += writer.size();
            output_ids.push(writer.id());
        }
        drop(outputs);
        for &id in &output_ids {
            self.manager.register(id)?;
        }

        let mut result = CompactionResult {
            segments_compacted: snapshot.len(),
            segments_written: output_ids.len(),
            bytes_before,
            bytes_after,
            ..Default::default()
        };
        let mut skipped = Vec::new();
        for Migrated { key, old, new } in migrated {
            if self.keydir.replace_if(&key, &old, new) {
                result.records_migrated += 1;
            } else {
                result.records_skipped += 1;
                skipped.push(key);
            }
        }

        // The active segment must outrank every output before anything is
        // appended on behalf of the skipped keys below.
        if let Some(&highest) = output_ids.last() {
            self.manager.rotate_if_below(highest)?;
        }

        // A skipped key deleted meanwhile has its tombstone below the
        // outputs, and compactions unlink lower IDs first. Restate the
        // delete above the stale copy.
        for key in &skipped {
            if self.restate_delete(key)? {
                result.tombstones_written += 1;
            }
        }
        if result.tombstones_written > 0 {
            self.manager.sync()?;
        }

        self.manager.retire(snapshot)?;

        info!(
            segments = result.segments_compacted,
            written = result.segments_written,
            migrated = result.records_migrated,
            skipped = result.records_skipped,
            tombstones = result.tombstones_written,
            bytes_saved = result.bytes_saved(),
            "compaction finished"
        );
        Ok(result)
    }

    /// Append a tombstone for `key` if it is still absent. Returns false if
    /// the key was written again, since its newer record shadows the copy.
    fn restate_delete(&self, key: &[u8]) -> CaskResult<bool> {
        let keydir = self.keydir;
        let limits = self.limits;
        let mut present = false;
        let outcome = self.manager.append_with(
            |ts| {
                if keydir.contains(key) {
                    present = true;
                    return Err(CaskError::KeyNotFound);
                }
                encode_record(key, &[], ts, true, limits)
            },
            |_| (),
        );
        match outcome {
            Ok(()) => Ok(true),
            Err(_) if present => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Copy every live record into `outputs`, rolling over at the size
    /// limit. Outputs are synced before returning.
    fn copy_live(
        &self,
        live: &[(Vec<u8>, KeyDirEntry)],
        outputs: &mut Vec<SegmentWriter>,
    ) -> CaskResult<Vec<Migrated>> {
        let mut migrated = Vec::with_capacity(live.len());

        for (key, entry) in live {
            if self.abandon.load(Ordering::Acquire) {
                info!(copied = migrated.len(), "compaction abandoned");
                return Err(CaskError::Closed);
            }

            let segment = match self.manager.segment(entry.segment_id) {
                Some(segment) => segment,
                None => continue,
            };
            let raw = segment.read_raw(entry.offset, entry.len)?;

            let needs_new = outputs
                .last()
                .map_or(true, |w| w.size() >= self.max_datafile_size);
            if needs_new {
                if let Some(full) = outputs.last() {
                    full.sync()?;
                }
                let writer = self.manager.create_segment()?;
                debug!(segment_id = writer.id(), "compaction output started");
                outputs.push(writer);
            }
            let writer = match outputs.last_mut() {
                Some(writer) => writer,
                None => continue,
            };

            let offset = writer.append(&raw)?;
            migrated.push(Migrated {
                key: key.clone(),
                old: *entry,
                new: KeyDirEntry {
                    segment_id: writer.id(),
                    offset,
                    len: entry.len,
                    timestamp: entry.timestamp,
                },
            });
        }

        if let Some(last) = outputs.last() {
            last.sync()?;
        }
        Ok(migrated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RecoveryMode;
    use crate::recovery::recover;
    use crate::segment::list_segments;
    use tempfile::TempDir;

    const LIMITS: Limits = Limits { max_key_size: 64, max_value_size: 4096 };

    struct Fixture {
        _tmp: TempDir,
        manager: SegmentManager,
        keydir: KeyDir,
    }

    impl Fixture {
        fn new(max: u64) -> Self {
            let tmp = TempDir::new().unwrap();
            let manager = SegmentManager::open(tmp.path(), &[], None, 0, max, false).unwrap();
            Self { _tmp: tmp, manager, keydir: KeyDir::new() }
        }

        fn put(&self, key: &[u8], value: &[u8]) {
            let keydir = &self.keydir;
            self.manager
                .append_with(
                    |ts| encode_record(key, value, ts, false, LIMITS),
                    |a| {
                        keydir.insert(key, KeyDirEntry {
                            segment_id: a.segment_id,
                            offset: a.offset,
                            len: a.len,
                            timestamp: a.timestamp,
                        });
                    },
                )
                .unwrap();
        }

        fn delete(&self, key: &[u8]) {
            let keydir = &self.keydir;
            self.manager
                .append_with(
                    |ts| encode_record(key, b"", ts, true, LIMITS),
                    |_| {
                        keydir.remove(key);
                    },
                )
                .unwrap();
        }

        fn value(&self, key: &[u8]) -> Vec<u8> {
            let entry = self.keydir.get(key).unwrap();
            let segment = self.manager.segment(entry.segment_id).unwrap();
            segment.read_record(entry.offset, entry.len).unwrap().value
        }
    }

    #[test]
    fn test_compaction_keeps_latest_values() {
        let f = Fixture::new(64);
        for round in 0..5 {
            for key in [b"a", b"b", b"c"] {
                f.put(key, format!("value-{}", round).as_bytes());
            }
        }
        // Push the final values out of the active segment
        for key in [b"x", b"y", b"z"] {
            f.put(key, b"filler!");
        }
        let before_segments = f.manager.segment_count();
        let active_before = f.manager.active_id().unwrap();

        let abandon = AtomicBool::new(false);
        let result = Compactor::new(&f.manager, &f.keydir, 64, LIMITS, &abandon).run().unwrap();

        assert!(result.segments_compacted > 0);
        assert!(result.bytes_saved() > 0);
        assert_eq!(result.records_skipped, 0);
        assert!(f.manager.segment_count() < before_segments);
        for key in [b"a", b"b", b"c"] {
            assert_eq!(f.value(key), b"value-4");
        }
        // Active segment is again the highest
        let active = f.manager.active_id().unwrap();
        assert!(active > active_before);
        assert_eq!(*list_segments(f.manager.dir()).unwrap().last().unwrap(), active);
    }

    /// Runs a compaction with `between` called after the copy and before
    /// the swap, standing in for a concurrent writer.
    fn compact_with_interleaved<F: FnOnce()>(f: &Fixture, between: F) -> CompactionResult {
        let abandon = AtomicBool::new(false);
        let compactor = Compactor::new(&f.manager, &f.keydir, 64, LIMITS, &abandon);
        let snapshot = f.manager.closed_segments().unwrap();
        let live = compactor.live_entries(&snapshot);
        assert!(live.iter().any(|(k, _)| k == b"a"));

        let mut outputs = Vec::new();
        let migrated = compactor.copy_live(&live, &mut outputs).unwrap();
        between();
        compactor.install(&snapshot, 0, outputs, migrated).unwrap()
    }

    #[test]
    fn test_swap_skips_key_rewritten_during_copy() {
        let f = Fixture::new(64);
        for key in [b"a", b"b", b"c", b"d"] {
            f.put(key, b"original");
        }

        let result = compact_with_interleaved(&f, || f.put(b"a", b"rewritten"));
        assert_eq!(result.records_skipped, 1);
        assert!(result.records_migrated > 0);
        assert_eq!(result.tombstones_written, 0);
        assert_eq!(f.value(b"a"), b"rewritten");
        assert_eq!(f.value(b"b"), b"original");
    }

    #[test]
    fn test_delete_during_copy_restated_above_outputs() {
        let f = Fixture::new(64);
        for key in [b"a", b"b", b"c", b"d"] {
            f.put(key, b"original");
        }
        // Segment 0 holds a, b, c; the delete lands in segment 1, below the output
        let delete_segment = f.manager.active_id().unwrap();

        let result = compact_with_interleaved(&f, || f.delete(b"a"));
        assert_eq!(result.records_skipped, 1);
        assert_eq!(result.tombstones_written, 1);
        assert!(!f.keydir.contains(b"a"));

        // A later compaction may unlink the original tombstone before the
        // output holding the stale copy; the restated one must still win.
        let dir = f.manager.dir().to_path_buf();
        std::fs::remove_file(crate::segment::segment_path(&dir, delete_segment)).unwrap();
        let ids = list_segments(&dir).unwrap();
        let recovered = KeyDir::new();
        recover(&dir, &ids, &recovered, RecoveryMode::Strict, LIMITS).unwrap();
        assert!(!recovered.contains(b"a"));
        assert!(recovered.contains(b"b"));
        assert!(recovered.contains(b"c"));
    }

    #[test]
    fn test_nothing_to_compact_without_closed_segments() {
        let f = Fixture::new(1 << 20);
        f.put(b"k", b"v");
        let abandon = AtomicBool::new(false);
        let compactor = Compactor::new(&f.manager, &f.keydir, 1 << 20, LIMITS, &abandon);
        let result = compactor.run().unwrap();
        assert_eq!(result, CompactionResult::default());
    }

    #[test]
    fn test_abandoned_run_leaves_no_outputs() {
        let f = Fixture::new(32);
        for i in 0..10 {
            f.put(format!("k{}", i).as_bytes(), b"v");
        }
        let before = list_segments(f.manager.dir()).unwrap();

        let abandon = AtomicBool::new(true);
        let err = Compactor::new(&f.manager, &f.keydir, 32, LIMITS, &abandon).run().unwrap_err();
        assert!(matches!(err, CaskError::Closed));
        assert_eq!(list_segments(f.manager.dir()).unwrap(), before);
        assert_eq!(f.value(b"k3"), b"v");
    }

    #[test]
    fn test_policy() {
        let policy = CompactionConfig { trigger_ratio: 0.5, min_bytes: 1000, ..Default::default() };
        assert!(!should_compact(&policy, 0, 0));
        assert!(!should_compact(&policy, 999, 0));
        assert!(!should_compact(&policy, 2000, 1500));
        assert!(should_compact(&policy, 2000, 1000));
        assert!(should_compact(&policy, 2000, 0));
    }

    #[test]
    fn test_result_ratios() {
        let result = CompactionResult {
            bytes_before: 10_000,
            bytes_after: 6_000,
            ..Default::default()
        };
        assert_eq!(result.bytes_saved(), 4_000);
        assert!((result.dead_space_ratio() - 0.4).abs() < f64::EPSILON);
        assert_eq!(CompactionResult::default().dead_space_ratio(), 0.0);
    }
}
