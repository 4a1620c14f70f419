//! Segment manager
//!
//! Owns the set of segment files of one store:
//! - the active segment writer, behind the single append lock
//! - shared read handles for every live segment (active included)
//! - the segment ID counter used by both rotation and compaction
//!
//! Rotation rule: the size check happens before an append. An append that
//! pushes the active segment past `max_datafile_size` still completes in
//! that segment; the next append rotates. Records are never split.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::error::{io_err, CaskError, CaskResult};
use crate::platform::sync_dir;
use crate::segment::{SegmentFile, SegmentId, SegmentWriter};

/// Where an append landed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Appended {
    pub segment_id: SegmentId,
    pub offset: u64,
    pub len: u64,
    pub timestamp: u64,
}

pub struct SegmentManager {
    dir: PathBuf,
    /// Readable segments by ID
    segments: RwLock<BTreeMap<SegmentId, Arc<SegmentFile>>>,
    /// Active segment; the mutex is the append lock. `None` once closed.
    active: Mutex<Option<SegmentWriter>>,
    next_id: AtomicU64,
    /// Record timestamps; ticked under the append lock
    clock: Clock,
    max_datafile_size: u64,
    sync_writes: bool,
}

impl SegmentManager {
    /// Open the manager over already-discovered segment IDs (ascending).
    ///
    /// The highest ID is reopened as the active segment and cut back to
    /// `active_valid_len` (from recovery). With no segments, segment 0 is
    /// created. Timestamps handed out start above `clock_floor`.
    pub fn open(
        dir: &Path,
        ids: &[SegmentId],
        active_valid_len: Option<u64>,
        clock_floor: u64,
        max_datafile_size: u64,
        sync_writes: bool,
    ) -> CaskResult<Self> {
        let writer = match ids.last() {
            Some(&last) => {
                let valid_len = match active_valid_len {
                    Some(len) => len,
                    None => SegmentFile::open(dir, last)?.len()?,
                };
                SegmentWriter::open_append(dir, last, valid_len)?
            }
            None => {
                let writer = SegmentWriter::create(dir, 0)?;
                sync_dir(dir).map_err(io_err(dir, "failed to sync data directory"))?;
                writer
            }
        };

        let mut segments = BTreeMap::new();
        for &id in ids {
            segments.insert(id, Arc::new(SegmentFile::open(dir, id)?));
        }
        if ids.is_empty() {
            segments.insert(writer.id(), Arc::new(SegmentFile::open(dir, writer.id())?));
        }

        let next_id = writer.id() + 1;
        debug!(active = writer.id(), segments = segments.len(), "segment manager opened");

        Ok(Self {
            dir: dir.to_path_buf(),
            segments: RwLock::new(segments),
            active: Mutex::new(Some(writer)),
            next_id: AtomicU64::new(next_id),
            clock: Clock::starting_after(clock_floor),
            max_datafile_size,
            sync_writes,
        })
    }

    /// Append one record to the active segment.
    ///
    /// `encode` receives the record's timestamp and returns its bytes; it
    /// runs under the append lock, so timestamp order equals log order.
    /// `on_durable` runs, still under the lock, only after the write (and
    /// fsync, when enabled) succeeded. Any I/O failure is reported as
    /// `WriteFailed` and leaves no replayable bytes behind.
    pub fn append_with<E, F, T>(&self, encode: E, on_durable: F) -> CaskResult<T>
    where
        E: FnOnce(u64) -> CaskResult<Vec<u8>>,
        F: FnOnce(Appended) -> T,
    {
        let mut guard = self.active.lock();
        let writer = guard.as_mut().ok_or(CaskError::Closed)?;

        let timestamp = self.clock.tick();
        let bytes = encode(timestamp)?;

        if writer.is_poisoned() || writer.size() >= self.max_datafile_size {
            self.rotate_locked(writer).map_err(CaskError::into_write_failed)?;
        }

        let offset = writer.append(&bytes)?;
        if self.sync_writes {
            if let Err(e) = writer.sync() {
                if let Err(rollback) = writer.rollback_to(offset) {
                    warn!(
                        segment_id = writer.id(),
                        offset,
                        error = %rollback,
                        "rollback after failed sync"
                    );
                }
                return Err(e);
            }
        }

        Ok(on_durable(Appended {
            segment_id: writer.id(),
            offset,
            len: bytes.len() as u64,
            timestamp,
        }))
    }

    /// Seal the current active segment and start a new one.
    fn rotate_locked(&self, writer: &mut SegmentWriter) -> CaskResult<()> {
        if !writer.is_poisoned() {
            writer.sync()?;
        }
        let id = self.allocate_id();
        let next = SegmentWriter::create(&self.dir, id)?;
        let reader = Arc::new(SegmentFile::open(&self.dir, id)?);
        sync_dir(&self.dir).map_err(io_err(&self.dir, "failed to sync data directory"))?;

        self.segments.write().insert(id, reader);
        let sealed = std::mem::replace(writer, next);
        info!(sealed = sealed.id(), sealed_bytes = sealed.size(), active = id, "rotated segment");
        Ok(())
    }

    /// Rotate unless the active segment already has the highest ID.
    /// Compaction calls this after registering output segments.
    pub fn rotate_if_below(&self, id: SegmentId) -> CaskResult<()> {
        let mut guard = self.active.lock();
        let writer = guard.as_mut().ok_or(CaskError::Closed)?;
        if writer.id() < id {
            self.rotate_locked(writer)?;
        }
        Ok(())
    }

    /// Reserve a fresh segment ID.
    pub fn allocate_id(&self) -> SegmentId {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Create a writer for a segment that is not yet readable (compaction
    /// output). Call [`SegmentManager::register`] once it is complete.
    pub fn create_segment(&self) -> CaskResult<SegmentWriter> {
        SegmentWriter::create(&self.dir, self.allocate_id())
    }

    /// Make a finished segment visible to readers.
    pub fn register(&self, id: SegmentId) -> CaskResult<()> {
        let reader = Arc::new(SegmentFile::open(&self.dir, id)?);
        self.segments.write().insert(id, reader);
        Ok(())
    }

    /// Shared read handle for a segment, if it is still live.
    pub fn segment(&self, id: SegmentId) -> Option<Arc<SegmentFile>> {
        self.segments.read().get(&id).cloned()
    }

    /// ID of the active segment.
    pub fn active_id(&self) -> CaskResult<SegmentId> {
        let guard = self.active.lock();
        guard.as_ref().map(|w| w.id()).ok_or(CaskError::Closed)
    }

    /// Every live segment below the active one.
    pub fn closed_segments(&self) -> CaskResult<Vec<SegmentId>> {
        let active = self.active_id()?;
        Ok(self.segments.read().range(..active).map(|(&id, _)| id).collect())
    }

    /// IDs of all live segments, ascending.
    pub fn segment_ids(&self) -> Vec<SegmentId> {
        self.segments.read().keys().copied().collect()
    }

    pub fn segment_count(&self) -> usize {
        self.segments.read().len()
    }

    /// Sum of all live segment file sizes.
    pub fn total_size(&self) -> CaskResult<u64> {
        let handles: Vec<Arc<SegmentFile>> = self.segments.read().values().cloned().collect();
        let mut total = 0u64;
        for handle in handles {
            total += handle.len()?;
        }
        Ok(total)
    }

    /// Drop segments from the readable set and delete their files.
    /// Returns the number of bytes released.
    pub fn retire(&self, ids: &[SegmentId]) -> CaskResult<u64> {
        let removed: Vec<Arc<SegmentFile>> = {
            let mut segments = self.segments.write();
            ids.iter().filter_map(|id| segments.remove(id)).collect()
        };

        let mut freed = 0u64;
        for segment in removed {
            freed += segment.len().unwrap_or(0);
            let path = segment.path().to_path_buf();
            // Readers may still hold the Arc; unlinking is fine on unix.
            if let Err(e) = std::fs::remove_file(&path) {
                warn!(
                    segment_id = segment.id(),
                    path = %path.display(),
                    error = %e,
                    "failed to delete retired segment"
                );
            } else {
                debug!(segment_id = segment.id(), "deleted retired segment");
            }
        }
        sync_dir(&self.dir).map_err(io_err(&self.dir, "failed to sync data directory"))?;
        Ok(freed)
    }

    /// Delete a segment that was never registered (abandoned compaction output).
    pub fn discard_unregistered(&self, writer: SegmentWriter) {
        let path = writer.path().to_path_buf();
        let id = writer.id();
        drop(writer);
        if let Err(e) = std::fs::remove_file(&path) {
            warn!(segment_id = id, error = %e, "failed to delete abandoned segment");
        }
    }

    /// fsync the active segment.
    pub fn sync(&self) -> CaskResult<()> {
        let guard = self.active.lock();
        guard.as_ref().ok_or(CaskError::Closed)?.sync()
    }

    /// Sync and release every file handle. Idempotent.
    pub fn close(&self) -> CaskResult<()> {
        let writer = self.active.lock().take();
        let result = match &writer {
            Some(w) => w.sync(),
            None => Ok(()),
        };
        drop(writer);
        self.segments.write().clear();
        result
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::{encode_record, Limits};
    use crate::segment::list_segments;
    use tempfile::TempDir;

    const LIMITS: Limits = Limits { max_key_size: 64, max_value_size: 4096 };

    fn record(key: &[u8], value_len: usize) -> Vec<u8> {
        encode_record(key, &vec![b'x'; value_len], 1, false, LIMITS).unwrap()
    }

    fn append(manager: &SegmentManager, key: &[u8], value_len: usize) -> Appended {
        manager
            .append_with(|ts| encode_record(key, &vec![b'x'; value_len], ts, false, LIMITS), |a| a)
            .unwrap()
    }

    #[test]
    fn test_fresh_directory_creates_segment_zero() {
        let tmp = TempDir::new().unwrap();
        let manager = SegmentManager::open(tmp.path(), &[], None, 0, 1024, false).unwrap();
        assert_eq!(manager.active_id().unwrap(), 0);
        assert_eq!(list_segments(tmp.path()).unwrap(), vec![0]);
        assert!(manager.closed_segments().unwrap().is_empty());
    }

    #[test]
    fn test_rotation_happens_on_next_append() {
        let tmp = TempDir::new().unwrap();
        let manager = SegmentManager::open(tmp.path(), &[], None, 0, 100, false).unwrap();

        // 21 + 1 + 120 = 142 bytes: crosses the threshold but stays in segment 0
        let first = append(&manager, b"a", 120);
        assert_eq!((first.segment_id, first.offset, first.len), (0, 0, 142));

        // Segment 0 is now past the limit, so this append rotates first
        let second = append(&manager, b"b", 1);
        assert_eq!((second.segment_id, second.offset), (1, 0));
        assert!(second.timestamp > first.timestamp);
        assert_eq!(manager.closed_segments().unwrap(), vec![0]);
        assert_eq!(list_segments(tmp.path()).unwrap(), vec![0, 1]);
    }

    #[test]
    fn test_append_without_rotation_below_limit() {
        let tmp = TempDir::new().unwrap();
        let manager = SegmentManager::open(tmp.path(), &[], None, 0, 1 << 20, true).unwrap();
        let len = record(b"k", 10).len() as u64;
        for i in 0..5u64 {
            let appended = append(&manager, b"k", 10);
            assert_eq!(appended.segment_id, 0);
            assert_eq!(appended.offset, i * len);
        }
        assert_eq!(manager.total_size().unwrap(), 5 * len);
    }

    #[test]
    fn test_clock_floor_is_respected() {
        let tmp = TempDir::new().unwrap();
        let floor = u64::MAX / 2;
        let manager = SegmentManager::open(tmp.path(), &[], None, floor, 1024, false).unwrap();
        assert_eq!(append(&manager, b"k", 1).timestamp, floor + 1);
    }

    #[test]
    fn test_encode_failure_appends_nothing() {
        let tmp = TempDir::new().unwrap();
        let manager = SegmentManager::open(tmp.path(), &[], None, 0, 1024, false).unwrap();
        let result = manager.append_with(
            |ts| encode_record(&[0u8; 65], b"v", ts, false, LIMITS),
            |a| a,
        );
        assert!(matches!(result, Err(CaskError::KeyTooLarge { .. })));
        assert_eq!(manager.total_size().unwrap(), 0);
    }

    #[test]
    fn test_reopen_continues_highest_segment() {
        let tmp = TempDir::new().unwrap();
        {
            let manager = SegmentManager::open(tmp.path(), &[], None, 0, 50, false).unwrap();
            for key in [b"a", b"b", b"c"] {
                append(&manager, key, 40);
            }
            manager.close().unwrap();
        }
        let ids = list_segments(tmp.path()).unwrap();
        assert_eq!(ids, vec![0, 1, 2]);

        let manager = SegmentManager::open(tmp.path(), &ids, None, 0, 50, false).unwrap();
        assert_eq!(manager.active_id().unwrap(), 2);
        assert_eq!(append(&manager, b"d", 1).segment_id, 3);
    }

    #[test]
    fn test_retire_and_register() {
        let tmp = TempDir::new().unwrap();
        let manager = SegmentManager::open(tmp.path(), &[], None, 0, 10, false).unwrap();
        append(&manager, b"a", 5);
        append(&manager, b"b", 5);
        assert_eq!(manager.active_id().unwrap(), 1);

        let mut output = manager.create_segment().unwrap();
        output.append(&record(b"a", 5)).unwrap();
        let output_id = output.id();
        drop(output);
        manager.register(output_id).unwrap();
        assert!(manager.segment(output_id).is_some());

        let freed = manager.retire(&[0]).unwrap();
        assert!(freed > 0);
        assert!(manager.segment(0).is_none());
        assert_eq!(list_segments(tmp.path()).unwrap(), vec![1, output_id]);

        manager.rotate_if_below(output_id).unwrap();
        assert!(manager.active_id().unwrap() > output_id);
    }

    #[test]
    fn test_closed_manager_rejects_appends() {
        let tmp = TempDir::new().unwrap();
        let manager = SegmentManager::open(tmp.path(), &[], None, 0, 1024, false).unwrap();
        manager.close().unwrap();
        let result = manager.append_with(|ts| encode_record(b"k", b"v", ts, false, LIMITS), |a| a);
        assert!(matches!(result, Err(CaskError::Closed)));
        assert!(matches!(manager.active_id(), Err(CaskError::Closed)));
        manager.close().unwrap();
    }
}
