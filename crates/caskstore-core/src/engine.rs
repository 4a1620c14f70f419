//! Core storage engine: the public handle of CaskStore.
//!
//! `CaskEngine` ties the pieces together:
//! - **Write path**: encode, append to the active segment (fsync), then
//!   update the key directory, all under the append lock
//! - **Read path**: key directory lookup, then one positional read
//! - **Recovery**: replay every segment at open, before the handle exists
//! - **Compaction**: on demand via `compact()` or from a background thread
//!
//! All public methods take `&self`; the engine can be shared across
//! threads behind an `Arc`.

use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use fs2::FileExt;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::compaction::{should_compact, CompactionResult, Compactor};
use crate::config::Config;
use crate::error::{io_err, CaskError, CaskResult};
use crate::format::{encode_record, Limits};
use crate::keydir::{KeyDir, KeyDirEntry, Keys};
use crate::manager::SegmentManager;
use crate::recovery::recover;
use crate::scheduler::{spawn_compactor, CompactorHandle, Cycle};
use crate::segment::{list_segments, SegmentId};

/// Name of the advisory lock file inside the data directory
pub const LOCK_FILE: &str = "LOCK";

/// How many times a read re-resolves a key whose segment was retired
/// between lookup and read.
const READ_ATTEMPTS: usize = 3;

/// Point-in-time engine statistics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineStats {
    pub keys: usize,
    pub segments: usize,
    pub active_segment_id: SegmentId,
    /// Total size of all segment files
    pub disk_bytes: u64,
    /// Bytes of records the key directory points at
    pub live_bytes: u64,
    /// `disk_bytes - live_bytes`: reclaimable by compaction
    pub dead_bytes: u64,
}

struct Inner {
    path: PathBuf,
    config: Config,
    limits: Limits,
    keydir: Arc<KeyDir>,
    segments: SegmentManager,
    /// Set once by `close`; also tells a running compaction to abandon
    closed: AtomicBool,
    /// Held for the duration of a compaction run
    merge_lock: Mutex<()>,
    /// Exclusive advisory lock on the directory; released on close
    lock_file: Mutex<Option<File>>,
}

impl Inner {
    fn check_open(&self) -> CaskResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(CaskError::Closed);
        }
        Ok(())
    }

    fn needs_compaction(&self) -> CaskResult<bool> {
        self.check_open()?;
        let disk = self.segments.total_size()?;
        Ok(should_compact(&self.config.compaction, disk, self.keydir.live_bytes()))
    }

    fn compact(&self) -> CaskResult<CompactionResult> {
        self.check_open()?;
        let _merge = self.merge_lock.try_lock().ok_or(CaskError::CompactionInProgress)?;
        Compactor::new(
            &self.segments,
            &self.keydir,
            self.config.max_datafile_size,
            self.limits,
            &self.closed,
        )
        .run()
    }
}

/// Embedded log-structured key-value store.
pub struct CaskEngine {
    inner: Arc<Inner>,
    /// Background compactor (None if not started)
    compactor: Mutex<Option<CompactorHandle>>,
}

impl CaskEngine {
    /// Open or create a store in `path`.
    ///
    /// Validates `config`, takes the directory lock, replays every segment
    /// into the key directory, and reopens the highest segment for appends.
    /// Any failure is reported as `OpenFailed`.
    pub fn open<P: AsRef<Path>>(path: P, config: Config) -> CaskResult<Self> {
        let path = path.as_ref().to_path_buf();
        Self::open_at(&path, config).map_err(|e| CaskError::open_failed(&path, e))
    }

    fn open_at(path: &Path, config: Config) -> CaskResult<Self> {
        config.validate()?;
        fs::create_dir_all(path).map_err(io_err(path, "failed to create data directory"))?;
        let lock_file = acquire_lock(path)?;

        let ids = list_segments(path)?;
        let keydir = Arc::new(KeyDir::new());
        let report = recover(path, &ids, &keydir, config.recovery_mode, config.limits())?;

        let segments = SegmentManager::open(
            path,
            &ids,
            report.active_valid_len,
            report.max_timestamp,
            config.max_datafile_size,
            config.sync_writes,
        )?;

        info!(
            path = %path.display(),
            keys = keydir.len(),
            segments = segments.segment_count(),
            active = segments.active_id()?,
            "store opened"
        );

        Ok(Self {
            inner: Arc::new(Inner {
                path: path.to_path_buf(),
                limits: config.limits(),
                config,
                keydir,
                segments,
                closed: AtomicBool::new(false),
                merge_lock: Mutex::new(()),
                lock_file: Mutex::new(Some(lock_file)),
            }),
            compactor: Mutex::new(None),
        })
    }

    /// Store `value` under `key`.
    ///
    /// The record is durable (when `sync_writes` is on) before the key
    /// becomes visible. On failure the key directory is unchanged.
    pub fn put(&self, key: &[u8], value: &[u8]) -> CaskResult<()> {
        let inner = &self.inner;
        inner.check_open()?;
        // Reject oversized input before taking the append lock
        check_sizes(inner.limits, key, value)?;

        inner.segments.append_with(
            |ts| encode_record(key, value, ts, false, inner.limits),
            |appended| {
                inner.keydir.insert(key, KeyDirEntry {
                    segment_id: appended.segment_id,
                    offset: appended.offset,
                    len: appended.len,
                    timestamp: appended.timestamp,
                });
            },
        )
    }

    /// Fetch the value stored under `key`.
    pub fn get(&self, key: &[u8]) -> CaskResult<Vec<u8>> {
        let inner = &self.inner;
        inner.check_open()?;

        let mut last_error = None;
        for _ in 0..READ_ATTEMPTS {
            let entry = inner.keydir.get(key).ok_or(CaskError::KeyNotFound)?;
            let segment = match inner.segments.segment(entry.segment_id) {
                Some(segment) => segment,
                None => {
                    // Retired by compaction after the lookup
                    inner.check_open()?;
                    continue;
                }
            };

            match segment.read_record(entry.offset, entry.len) {
                Ok(record) if record.tombstone => {
                    return Err(CaskError::CorruptRecord {
                        segment_id: entry.segment_id,
                        offset: entry.offset,
                        reason: "key directory points at a tombstone".to_string(),
                    });
                }
                Ok(record) if record.key != key => {
                    return Err(CaskError::CorruptRecord {
                        segment_id: entry.segment_id,
                        offset: entry.offset,
                        reason: "record key does not match lookup key".to_string(),
                    });
                }
                Ok(record) => return Ok(record.value),
                Err(e) => {
                    if inner.keydir.get(key) == Some(entry) {
                        return Err(e);
                    }
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| CaskError::Io {
            path: Some(inner.path.clone()),
            kind: std::io::ErrorKind::NotFound,
            message: "segment for key was retired during read".to_string(),
        }))
    }

    /// Remove `key`. Fails with `KeyNotFound` if it is absent.
    ///
    /// The tombstone is appended (and synced) before the key disappears
    /// from the key directory.
    pub fn delete(&self, key: &[u8]) -> CaskResult<()> {
        let inner = &self.inner;
        inner.check_open()?;
        // No key over the limit was ever stored
        if key.len() > inner.limits.max_key_size {
            return Err(CaskError::KeyNotFound);
        }

        inner.segments.append_with(
            |ts| {
                // Under the append lock: no put or delete can slip in between
                if !inner.keydir.contains(key) {
                    return Err(CaskError::KeyNotFound);
                }
                encode_record(key, &[], ts, true, inner.limits)
            },
            |_| {
                inner.keydir.remove(key);
            },
        )
    }

    /// Whether `key` is present. Never touches disk.
    pub fn has(&self, key: &[u8]) -> CaskResult<bool> {
        self.inner.check_open()?;
        Ok(self.inner.keydir.contains(key))
    }

    /// Iterate over live keys, in no particular order.
    ///
    /// The iterator snapshots one shard of the key directory at a time,
    /// so it never blocks writers for long and sees a mix of before and
    /// after for keys written concurrently.
    pub fn keys(&self) -> CaskResult<Keys> {
        self.inner.check_open()?;
        Ok(self.inner.keydir.keys())
    }

    /// Number of live keys. O(1).
    pub fn len(&self) -> CaskResult<usize> {
        self.inner.check_open()?;
        Ok(self.inner.keydir.len())
    }

    /// Returns true if the store has no live keys.
    pub fn is_empty(&self) -> CaskResult<bool> {
        self.inner.check_open()?;
        Ok(self.inner.keydir.is_empty())
    }

    /// fsync the active segment.
    ///
    /// Only needed with `sync_writes` off: makes every write so far durable
    /// with one fsync.
    pub fn sync(&self) -> CaskResult<()> {
        self.inner.check_open()?;
        self.inner.segments.sync()
    }

    /// Rewrite closed segments, dropping dead records.
    ///
    /// Fails with `CompactionInProgress` if another compaction is running.
    pub fn compact(&self) -> CaskResult<CompactionResult> {
        self.inner.compact()
    }

    /// Whether the configured compaction policy would trigger now.
    pub fn needs_compaction(&self) -> CaskResult<bool> {
        self.inner.needs_compaction()
    }

    /// Start the background compactor. A no-op if it is already running.
    pub fn start_compactor(&self) -> CaskResult<()> {
        self.inner.check_open()?;
        let mut slot = self.compactor.lock();
        if slot.is_some() {
            return Ok(());
        }

        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let interval = self.inner.config.compaction.interval;
        let handle = spawn_compactor("caskstore-compactor", interval, move || {
            let inner = match weak.upgrade() {
                Some(inner) => inner,
                None => return Cycle::Stop,
            };
            compaction_cycle(&inner)
        })?;
        *slot = Some(handle);
        Ok(())
    }

    /// Stop the background compactor and wait for it to exit.
    pub fn stop_compactor(&self) {
        let handle = self.compactor.lock().take();
        if let Some(handle) = handle {
            handle.shutdown();
        }
    }

    /// Current statistics.
    pub fn stats(&self) -> CaskResult<EngineStats> {
        let inner = &self.inner;
        inner.check_open()?;
        let disk_bytes = inner.segments.total_size()?;
        let live_bytes = inner.keydir.live_bytes();
        Ok(EngineStats {
            keys: inner.keydir.len(),
            segments: inner.segments.segment_count(),
            active_segment_id: inner.segments.active_id()?,
            disk_bytes,
            live_bytes,
            dead_bytes: disk_bytes.saturating_sub(live_bytes),
        })
    }

    /// Data directory path.
    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// Sync and release the store. Every later call fails with `Closed`.
    /// Closing twice is a no-op.
    pub fn close(&self) -> CaskResult<()> {
        let inner = &self.inner;
        if inner.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        // The closed flag makes a running compaction abandon its run
        self.stop_compactor();
        let _merge = inner.merge_lock.lock();

        let result = inner.segments.close();
        if let Some(lock) = inner.lock_file.lock().take() {
            if let Err(e) = FileExt::unlock(&lock) {
                debug!(error = %e, "failed to release directory lock");
            }
        }

        info!(path = %inner.path.display(), keys = inner.keydir.len(), "store closed");
        result
    }
}

impl Drop for CaskEngine {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(path = %self.inner.path.display(), error = %e, "error closing store");
        }
    }
}

/// One scheduler tick: compact if the policy says so.
fn compaction_cycle(inner: &Inner) -> Cycle {
    let due = match inner.needs_compaction() {
        Ok(due) => due,
        Err(CaskError::Closed) => return Cycle::Stop,
        Err(e) => {
            warn!(error = %e, "compaction policy check failed");
            return Cycle::Continue;
        }
    };
    if !due {
        return Cycle::Continue;
    }

    match inner.compact() {
        Ok(result) => {
            debug!(bytes_saved = result.bytes_saved(), "background compaction done");
            Cycle::Continue
        }
        Err(CaskError::CompactionInProgress) => Cycle::Continue,
        Err(CaskError::Closed) => Cycle::Stop,
        Err(e) => {
            warn!(error = %e, "background compaction failed");
            Cycle::Continue
        }
    }
}

fn check_sizes(limits: Limits, key: &[u8], value: &[u8]) -> CaskResult<()> {
    if key.len() > limits.max_key_size {
        return Err(CaskError::KeyTooLarge { size: key.len(), max: limits.max_key_size });
    }
    if value.len() > limits.max_value_size {
        return Err(CaskError::ValueTooLarge { size: value.len(), max: limits.max_value_size });
    }
    Ok(())
}

fn acquire_lock(dir: &Path) -> CaskResult<File> {
    let path = dir.join(LOCK_FILE);
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .open(&path)
        .map_err(io_err(&path, "failed to open lock file"))?;
    file.try_lock_exclusive().map_err(|e| CaskError::Io {
        path: Some(path.clone()),
        kind: e.kind(),
        message: format!("data directory is locked by another engine: {}", e),
    })?;
    Ok(file)
}
