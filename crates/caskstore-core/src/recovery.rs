//! Startup recovery: rebuild the key directory from segment files
//!
//! Segments are replayed in ascending numeric ID order. Within a segment,
//! records are applied front to back until the first record that fails to
//! decode.
//!
//! Conflict rule for a key: a record applies when its timestamp is at least
//! the newest timestamp already seen for that key, whether that was a put
//! or a tombstone. Ties therefore go to the record replayed later. Keeping
//! the tombstone timestamps around (not just removing the key) is what
//! stops an older copy of a deleted key, rewritten into a higher-numbered
//! compaction output, from coming back.
//!
//! Damage handling:
//! - the damaged record reaches end of file: crash-truncated tail. Logged;
//!   for the active (highest) segment the tail is cut off at reopen.
//! - more data follows the damaged record in a closed segment: fails in
//!   `RecoveryMode::Strict`, logged and skipped in `RecoveryMode::Lenient`.
//! - more data follows it in the active segment: treated as a tail, since
//!   the active segment is the only one a crash can leave half-written.

use std::path::Path;

use hashbrown::HashMap;
use tracing::{debug, info, warn};

use crate::config::RecoveryMode;
use crate::error::CaskResult;
use crate::format::Limits;
use crate::keydir::{KeyDir, KeyDirEntry};
use crate::segment::{SegmentId, SegmentScanner};

/// Summary of one recovery pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub segments_replayed: usize,
    /// Records that changed the directory (puts and tombstones)
    pub records_applied: u64,
    /// Tombstone records seen, applied or not
    pub tombstones: u64,
    /// Segments whose tail was discarded
    pub truncated_segments: usize,
    /// Largest record timestamp on disk; seeds the engine clock
    pub max_timestamp: u64,
    /// Length of the valid prefix of the highest segment
    pub active_valid_len: Option<u64>,
}

/// Applies segment contents to a key directory.
pub struct Replayer<'a> {
    dir: &'a Path,
    keydir: &'a KeyDir,
    mode: RecoveryMode,
    limits: Limits,
    /// Newest tombstone timestamp per deleted key
    tombstones: HashMap<Vec<u8>, u64>,
    report: RecoveryReport,
}

impl<'a> Replayer<'a> {
    pub fn new(dir: &'a Path, keydir: &'a KeyDir, mode: RecoveryMode, limits: Limits) -> Self {
        Self {
            dir,
            keydir,
            mode,
            limits,
            tombstones: HashMap::new(),
            report: RecoveryReport::default(),
        }
    }

    /// Replay one segment. `is_active` marks the highest segment, the one
    /// that will be reopened for appends.
    pub fn replay_segment(&mut self, id: SegmentId, is_active: bool) -> CaskResult<()> {
        let mut scanner = SegmentScanner::open(self.dir, id, self.limits)?;

        while let Some(scanned) = scanner.next_record()? {
            let record = scanned.record;
            self.report.max_timestamp = self.report.max_timestamp.max(record.timestamp);

            let newest_put = self.keydir.get(&record.key).map(|e| e.timestamp);
            let newest_delete = self.tombstones.get(&record.key).copied();
            let newest = newest_put.into_iter().chain(newest_delete).max();
            let applies = newest.map_or(true, |ts| record.timestamp >= ts);

            if record.tombstone {
                self.report.tombstones += 1;
                if applies {
                    self.keydir.remove(&record.key);
                    self.tombstones.insert(record.key, record.timestamp);
                    self.report.records_applied += 1;
                }
            } else if applies {
                self.keydir.insert(&record.key, KeyDirEntry {
                    segment_id: id,
                    offset: scanned.offset,
                    len: scanned.len,
                    timestamp: record.timestamp,
                });
                self.report.records_applied += 1;
            }
        }

        if let Some(fault) = scanner.fault() {
            let error = fault.error.clone().into_cask(id, fault.offset);
            if fault.reaches_eof || is_active {
                warn!(
                    segment_id = id,
                    offset = fault.offset,
                    discarded = scanner.file_len() - fault.offset,
                    error = %error,
                    "discarding damaged segment tail"
                );
                self.report.truncated_segments += 1;
            } else {
                match self.mode {
                    RecoveryMode::Strict => return Err(error),
                    RecoveryMode::Lenient => {
                        warn!(
                            segment_id = id,
                            offset = fault.offset,
                            skipped = scanner.file_len() - fault.offset,
                            error = %error,
                            "skipping remainder of corrupt segment"
                        );
                        self.report.truncated_segments += 1;
                    }
                }
            }
        }

        if is_active {
            self.report.active_valid_len = Some(scanner.valid_len());
        }
        self.report.segments_replayed += 1;
        debug!(segment_id = id, valid_len = scanner.valid_len(), "replayed segment");
        Ok(())
    }

    pub fn finish(self) -> RecoveryReport {
        self.report
    }
}

/// Rebuild `keydir` from the segments `ids` (ascending) found in `dir`.
pub fn recover(
    dir: &Path,
    ids: &[SegmentId],
    keydir: &KeyDir,
    mode: RecoveryMode,
    limits: Limits,
) -> CaskResult<RecoveryReport> {
    let mut replayer = Replayer::new(dir, keydir, mode, limits);
    for (i, &id) in ids.iter().enumerate() {
        replayer.replay_segment(id, i + 1 == ids.len())?;
    }
    let report = replayer.finish();

    info!(
        segments = report.segments_replayed,
        records = report.records_applied,
        tombstones = report.tombstones,
        truncated = report.truncated_segments,
        keys = keydir.len(),
        "recovery complete"
    );
    Ok(report)
}
