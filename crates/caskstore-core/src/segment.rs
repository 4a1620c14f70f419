//! Segment files: naming, discovery, appending, and reading
//!
//! A segment is an append-only file of records named `{id:09}.data`. The
//! zero padding keeps string and numeric order aligned for humans, but
//! discovery always parses and sorts the IDs as integers.

use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, Read, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::{io_err, write_err, CaskError, CaskResult};
use crate::format::{
    decode_record, parse_header, verify_record, DecodeError, Limits, Record, HEADER_SIZE,
};
use crate::platform::{durable_sync, read_exact_at};

/// Numeric segment identifier; assigned in creation order, never reused
pub type SegmentId = u64;

/// File extension of segment files
pub const SEGMENT_EXT: &str = "data";

/// File name for a segment ID
pub fn segment_file_name(id: SegmentId) -> String {
    format!("{:09}.{}", id, SEGMENT_EXT)
}

/// Full path of a segment inside `dir`
pub fn segment_path(dir: &Path, id: SegmentId) -> PathBuf {
    dir.join(segment_file_name(id))
}

/// Parse a segment ID out of a file name.
///
/// Returns `Ok(None)` for files that are not segments (other extensions),
/// and `InvalidSegmentName` for `.data` files whose stem is not a number.
pub fn parse_segment_id(name: &str) -> CaskResult<Option<SegmentId>> {
    let stem = match name.strip_suffix(SEGMENT_EXT).and_then(|s| s.strip_suffix('.')) {
        Some(stem) => stem,
        None => return Ok(None),
    };
    if stem.is_empty() || !stem.bytes().all(|b| b.is_ascii_digit()) {
        return Err(CaskError::InvalidSegmentName { name: name.to_string() });
    }
    stem.parse::<SegmentId>()
        .map(Some)
        .map_err(|_| CaskError::InvalidSegmentName { name: name.to_string() })
}

/// List segment IDs in `dir`, sorted numerically ascending.
pub fn list_segments(dir: &Path) -> CaskResult<Vec<SegmentId>> {
    let mut ids = Vec::new();
    for entry in fs::read_dir(dir).map_err(io_err(dir, "failed to read data directory"))? {
        let entry = entry.map_err(io_err(dir, "failed to read directory entry"))?;
        let is_file = entry.file_type().map(|t| t.is_file()).unwrap_or(false);
        if !is_file {
            continue;
        }
        let name = entry.file_name();
        let name = match name.to_str() {
            Some(name) => name,
            None => {
                if Path::new(&name).extension().map_or(false, |ext| ext == SEGMENT_EXT) {
                    return Err(CaskError::InvalidSegmentName {
                        name: name.to_string_lossy().into_owned(),
                    });
                }
                continue;
            }
        };
        if let Some(id) = parse_segment_id(name)? {
            ids.push(id);
        }
    }
    ids.sort_unstable();
    Ok(ids)
}

/// Appends records to one segment file.
pub struct SegmentWriter {
    id: SegmentId,
    file: File,
    path: PathBuf,
    /// Logical end of valid data; every returned offset is below it
    size: u64,
    /// Set when a failed append could not be rolled back
    poisoned: bool,
}

impl SegmentWriter {
    /// Create a new, empty segment. Fails if the file already exists.
    pub fn create(dir: &Path, id: SegmentId) -> CaskResult<Self> {
        let path = segment_path(dir, id);
        let file = OpenOptions::new()
            .create_new(true)
            .append(true)
            .open(&path)
            .map_err(io_err(&path, "failed to create segment"))?;
        debug!(segment_id = id, path = %path.display(), "created segment");
        Ok(Self { id, file, path, size: 0, poisoned: false })
    }

    /// Reopen an existing segment for appending, discarding any bytes past
    /// `valid_len` (a torn tail found by recovery).
    pub fn open_append(dir: &Path, id: SegmentId, valid_len: u64) -> CaskResult<Self> {
        let path = segment_path(dir, id);
        let file = OpenOptions::new()
            .append(true)
            .open(&path)
            .map_err(io_err(&path, "failed to open segment for append"))?;

        let on_disk = file.metadata().map_err(io_err(&path, "failed to stat segment"))?.len();
        if on_disk > valid_len {
            warn!(
                segment_id = id,
                valid_len,
                discarded = on_disk - valid_len,
                "truncating torn tail of active segment"
            );
            file.set_len(valid_len).map_err(io_err(&path, "failed to truncate segment"))?;
            durable_sync(&file).map_err(io_err(&path, "failed to sync truncated segment"))?;
        }

        Ok(Self { id, file, path, size: valid_len.min(on_disk), poisoned: false })
    }

    /// Append one encoded record. Returns the offset it was written at.
    ///
    /// On failure the file is rolled back to its previous length so later
    /// offsets stay exact; if even that fails the writer is poisoned and
    /// must be rotated away from.
    pub fn append(&mut self, bytes: &[u8]) -> CaskResult<u64> {
        if self.poisoned {
            return Err(CaskError::WriteFailed {
                path: self.path.clone(),
                kind: std::io::ErrorKind::Other,
                message: "segment poisoned by an earlier failed append".to_string(),
            });
        }

        let offset = self.size;
        if let Err(e) = self.file.write_all(bytes) {
            if self.file.set_len(offset).is_err() {
                self.poisoned = true;
            }
            return Err(write_err(&self.path)(e));
        }
        self.size += bytes.len() as u64;
        Ok(offset)
    }

    /// Drop everything appended at or after `offset` (an append whose
    /// sync failed must not survive to be replayed).
    pub fn rollback_to(&mut self, offset: u64) -> CaskResult<()> {
        if let Err(e) = self.file.set_len(offset) {
            self.poisoned = true;
            return Err(write_err(&self.path)(e));
        }
        self.size = offset;
        Ok(())
    }

    /// Durably sync everything appended so far.
    pub fn sync(&self) -> CaskResult<()> {
        durable_sync(&self.file).map_err(write_err(&self.path))
    }

    pub fn id(&self) -> SegmentId {
        self.id
    }

    /// Current file size in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }
}

/// Read-only handle to a segment, shared between readers.
#[derive(Debug)]
pub struct SegmentFile {
    id: SegmentId,
    file: File,
    path: PathBuf,
}

impl SegmentFile {
    /// Open a segment for positional reads.
    pub fn open(dir: &Path, id: SegmentId) -> CaskResult<Self> {
        let path = segment_path(dir, id);
        let file = File::open(&path).map_err(io_err(&path, "failed to open segment"))?;
        Ok(Self { id, file, path })
    }

    pub fn id(&self) -> SegmentId {
        self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current on-disk length.
    pub fn len(&self) -> CaskResult<u64> {
        Ok(self.file.metadata().map_err(io_err(&self.path, "failed to stat segment"))?.len())
    }

    /// Read exactly `len` raw bytes of the record at `offset` and check
    /// that they frame one valid record of that length.
    pub fn read_raw(&self, offset: u64, len: u64) -> CaskResult<Vec<u8>> {
        let mut buf = vec![0u8; len as usize];
        read_exact_at(&self.file, &mut buf, offset).map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                CaskError::CorruptRecord {
                    segment_id: self.id,
                    offset,
                    reason: format!("record of {} bytes extends past end of segment", len),
                }
            } else {
                io_err(&self.path, "failed to read record")(e)
            }
        })?;

        let header = verify_record(&buf).map_err(|e| e.into_cask(self.id, offset))?;
        if header.record_len() != len {
            return Err(CaskError::CorruptRecord {
                segment_id: self.id,
                offset,
                reason: format!(
                    "record length {} does not match index length {}",
                    header.record_len(),
                    len
                ),
            });
        }
        Ok(buf)
    }

    /// Read and decode the record at `offset`.
    pub fn read_record(&self, offset: u64, len: u64) -> CaskResult<Record> {
        let raw = self.read_raw(offset, len)?;
        decode_record(&raw).map_err(|e| e.into_cask(self.id, offset))
    }
}

/// A record found by a sequential scan.
#[derive(Debug, Clone)]
pub struct ScannedRecord {
    pub offset: u64,
    pub len: u64,
    pub record: Record,
}

/// Where and why a scan stopped early.
#[derive(Debug, Clone)]
pub struct ScanFault {
    pub offset: u64,
    pub error: DecodeError,
    /// The damaged record extends to (or past) end-of-file, i.e. nothing
    /// valid could follow it: a torn tail rather than mid-file damage.
    pub reaches_eof: bool,
}

/// Sequentially decodes records from the start of a segment, stopping at
/// the first record that fails to decode.
///
/// Headers are checked against `limits` before their lengths are trusted,
/// so a damaged length field reads as corruption, not as a torn tail.
pub struct SegmentScanner {
    id: SegmentId,
    path: PathBuf,
    limits: Limits,
    reader: BufReader<File>,
    file_len: u64,
    offset: u64,
    fault: Option<ScanFault>,
}

impl SegmentScanner {
    pub fn open(dir: &Path, id: SegmentId, limits: Limits) -> CaskResult<Self> {
        let path = segment_path(dir, id);
        let file = File::open(&path).map_err(io_err(&path, "failed to open segment for scan"))?;
        let file_len = file.metadata().map_err(io_err(&path, "failed to stat segment"))?.len();
        Ok(Self {
            id,
            path,
            limits,
            reader: BufReader::with_capacity(64 * 1024, file),
            file_len,
            offset: 0,
            fault: None,
        })
    }

    pub fn id(&self) -> SegmentId {
        self.id
    }

    /// Offset just past the last valid record returned so far.
    pub fn valid_len(&self) -> u64 {
        self.offset
    }

    pub fn file_len(&self) -> u64 {
        self.file_len
    }

    /// Why the scan stopped, if it did not reach a clean end of file.
    pub fn fault(&self) -> Option<&ScanFault> {
        self.fault.as_ref()
    }

    fn stop(&mut self, error: DecodeError, end: u64) -> CaskResult<Option<ScannedRecord>> {
        self.fault = Some(ScanFault {
            offset: self.offset,
            error,
            reaches_eof: end >= self.file_len,
        });
        Ok(None)
    }

    /// Decode the next record. `Ok(None)` at end of file or at the first
    /// undecodable record (see [`SegmentScanner::fault`]).
    pub fn next_record(&mut self) -> CaskResult<Option<ScannedRecord>> {
        if self.fault.is_some() || self.offset >= self.file_len {
            return Ok(None);
        }

        let remaining = self.file_len - self.offset;
        if remaining < HEADER_SIZE as u64 {
            let error = DecodeError::Truncated { needed: HEADER_SIZE as u64, available: remaining };
            return self.stop(error, self.file_len);
        }

        let mut header_buf = [0u8; HEADER_SIZE];
        self.reader
            .read_exact(&mut header_buf)
            .map_err(io_err(&self.path, "failed to read record header"))?;
        let header = match parse_header(&header_buf) {
            Ok(header) => header,
            Err(error) => return self.stop(error, self.offset + HEADER_SIZE as u64),
        };
        if let Err(error) = self.limits.check_header(&header) {
            return self.stop(error, self.offset + HEADER_SIZE as u64);
        }

        let len = header.record_len();
        if len > remaining {
            let error = DecodeError::Truncated { needed: len, available: remaining };
            return self.stop(error, self.file_len);
        }

        let mut raw = Vec::with_capacity(len as usize);
        raw.extend_from_slice(&header_buf);
        raw.resize(len as usize, 0);
        self.reader
            .read_exact(&mut raw[HEADER_SIZE..])
            .map_err(io_err(&self.path, "failed to read record body"))?;

        match decode_record(&raw) {
            Ok(record) => {
                let offset = self.offset;
                self.offset += len;
                Ok(Some(ScannedRecord { offset, len, record }))
            }
            Err(error) => {
                let end = self.offset + len;
                self.stop(error, end)
            }
        }
    }
}
