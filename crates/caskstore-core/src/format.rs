//! Binary record format for CaskStore segment files
//!
//! Every record, live entry or tombstone, has the same layout:
//! RecordHeader (21 bytes) + key_bytes + value_bytes

use crate::error::{CaskError, CaskResult};
use crate::segment::SegmentId;

/// Header size in bytes
pub const HEADER_SIZE: usize = 21;

/// Tombstone flag in the flags byte
pub const FLAG_TOMBSTONE: u8 = 0x01;

/// All flag bits this version understands
const KNOWN_FLAGS: u8 = FLAG_TOMBSTONE;

/// Fixed-size header for each record
///
/// Layout (all little-endian):
///   [0..4]   checksum:  u32 - CRC32C of bytes [4..record_len]
///   [4..12]  timestamp: u64 - microseconds, strictly increasing per engine
///   [12]     flags:     u8  - bit 0 = tombstone
///   [13..17] key_len:   u32
///   [17..21] value_len: u32
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    pub checksum: u32,
    pub timestamp: u64,
    pub flags: u8,
    pub key_len: u32,
    pub value_len: u32,
}

impl RecordHeader {
    /// Serialize header to bytes for writing
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..4].copy_from_slice(&self.checksum.to_le_bytes());
        buf[4..12].copy_from_slice(&self.timestamp.to_le_bytes());
        buf[12] = self.flags;
        buf[13..17].copy_from_slice(&self.key_len.to_le_bytes());
        buf[17..21].copy_from_slice(&self.value_len.to_le_bytes());
        buf
    }

    /// Parse header from bytes
    pub fn from_bytes(buf: &[u8; HEADER_SIZE]) -> Self {
        Self {
            checksum: u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]),
            timestamp: u64::from_le_bytes([
                buf[4], buf[5], buf[6], buf[7], buf[8], buf[9], buf[10], buf[11],
            ]),
            flags: buf[12],
            key_len: u32::from_le_bytes([buf[13], buf[14], buf[15], buf[16]]),
            value_len: u32::from_le_bytes([buf[17], buf[18], buf[19], buf[20]]),
        }
    }

    /// Total on-disk length of the record this header describes
    pub fn record_len(&self) -> u64 {
        HEADER_SIZE as u64 + self.key_len as u64 + self.value_len as u64
    }

    pub fn is_tombstone(&self) -> bool {
        (self.flags & FLAG_TOMBSTONE) != 0
    }
}

/// A decoded record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub key: Vec<u8>,
    /// Empty for tombstones
    pub value: Vec<u8>,
    pub timestamp: u64,
    pub tombstone: bool,
}

/// Key and value size limits enforced at encode time
#[derive(Debug, Clone, Copy)]
pub struct Limits {
    pub max_key_size: usize,
    pub max_value_size: usize,
}

impl Limits {
    /// Reject header lengths that no record written under these limits has.
    pub fn check_header(&self, header: &RecordHeader) -> Result<(), DecodeError> {
        if header.key_len as u64 > self.max_key_size as u64 {
            return Err(DecodeError::Corrupt(format!(
                "key length {} exceeds limit {}",
                header.key_len, self.max_key_size
            )));
        }
        if header.value_len as u64 > self.max_value_size as u64 {
            return Err(DecodeError::Corrupt(format!(
                "value length {} exceeds limit {}",
                header.value_len, self.max_value_size
            )));
        }
        Ok(())
    }
}

/// Why a byte slice failed to decode as a record.
///
/// Kept separate from `CaskError` because the codec does not know which
/// segment or offset the bytes came from, and because recovery needs to
/// tell a torn tail apart from damaged bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Fewer bytes available than the header (or header lengths) require
    Truncated { needed: u64, available: u64 },
    /// Bytes are all there but do not form a valid record
    Corrupt(String),
}

impl DecodeError {
    /// Attach segment context.
    pub fn into_cask(self, segment_id: SegmentId, offset: u64) -> CaskError {
        let reason = match self {
            DecodeError::Truncated { needed, available } => {
                format!("truncated record: need {} bytes, {} available", needed, available)
            }
            DecodeError::Corrupt(reason) => reason,
        };
        CaskError::CorruptRecord { segment_id, offset, reason }
    }
}

fn checksum(body: &[u8]) -> u32 {
    crc32c::crc32c(body)
}

/// Serialize a record.
///
/// Sizes are validated BEFORE any allocation, so an oversized value never
/// gets buffered. Tombstones always carry an empty value.
pub fn encode_record(
    key: &[u8],
    value: &[u8],
    timestamp: u64,
    tombstone: bool,
    limits: Limits,
) -> CaskResult<Vec<u8>> {
    if key.len() > limits.max_key_size {
        return Err(CaskError::KeyTooLarge { size: key.len(), max: limits.max_key_size });
    }
    let value: &[u8] = if tombstone { &[] } else { value };
    if value.len() > limits.max_value_size {
        return Err(CaskError::ValueTooLarge { size: value.len(), max: limits.max_value_size });
    }

    let mut header = RecordHeader {
        checksum: 0,
        timestamp,
        flags: if tombstone { FLAG_TOMBSTONE } else { 0 },
        key_len: key.len() as u32,
        value_len: value.len() as u32,
    };

    let mut buffer = Vec::with_capacity(header.record_len() as usize);
    buffer.extend_from_slice(&header.to_bytes());
    buffer.extend_from_slice(key);
    buffer.extend_from_slice(value);

    header.checksum = checksum(&buffer[4..]);
    buffer[0..4].copy_from_slice(&header.checksum.to_le_bytes());

    Ok(buffer)
}

/// Parse just the header at the start of `data`.
pub fn parse_header(data: &[u8]) -> Result<RecordHeader, DecodeError> {
    if data.len() < HEADER_SIZE {
        return Err(DecodeError::Truncated {
            needed: HEADER_SIZE as u64,
            available: data.len() as u64,
        });
    }
    let mut buf = [0u8; HEADER_SIZE];
    buf.copy_from_slice(&data[..HEADER_SIZE]);
    let header = RecordHeader::from_bytes(&buf);

    if header.flags & !KNOWN_FLAGS != 0 {
        return Err(DecodeError::Corrupt(format!("unknown flag bits 0x{:02x}", header.flags)));
    }
    if header.is_tombstone() && header.value_len != 0 {
        return Err(DecodeError::Corrupt("tombstone with non-empty value".to_string()));
    }
    Ok(header)
}

/// Validate the record at the start of `data` without copying key or value.
pub fn verify_record(data: &[u8]) -> Result<RecordHeader, DecodeError> {
    let header = parse_header(data)?;
    let len = header.record_len();
    if (data.len() as u64) < len {
        return Err(DecodeError::Truncated { needed: len, available: data.len() as u64 });
    }

    let computed = checksum(&data[4..len as usize]);
    if computed != header.checksum {
        return Err(DecodeError::Corrupt(format!(
            "checksum mismatch: expected 0x{:08x}, got 0x{:08x}",
            header.checksum, computed
        )));
    }
    Ok(header)
}

/// Deserialize the record at the start of `data`, checksum first.
pub fn decode_record(data: &[u8]) -> Result<Record, DecodeError> {
    let header = verify_record(data)?;
    let key_end = HEADER_SIZE + header.key_len as usize;
    let value_end = key_end + header.value_len as usize;

    Ok(Record {
        key: data[HEADER_SIZE..key_end].to_vec(),
        value: data[key_end..value_end].to_vec(),
        timestamp: header.timestamp,
        tombstone: header.is_tombstone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const LIMITS: Limits = Limits { max_key_size: 32, max_value_size: 1024 };

    #[test]
    fn test_put_roundtrip() {
        let encoded = encode_record(b"test_key", b"test_value_data", 42, false, LIMITS).unwrap();
        assert_eq!(encoded.len(), HEADER_SIZE + 8 + 15);

        let record = decode_record(&encoded).unwrap();
        assert_eq!(record.key, b"test_key");
        assert_eq!(record.value, b"test_value_data");
        assert_eq!(record.timestamp, 42);
        assert!(!record.tombstone);
    }

    #[test]
    fn test_tombstone_roundtrip() {
        let encoded = encode_record(b"delete_me", b"ignored", 7, true, LIMITS).unwrap();
        let record = decode_record(&encoded).unwrap();

        assert_eq!(record.key, b"delete_me");
        assert!(record.value.is_empty());
        assert!(record.tombstone);
    }

    #[test]
    fn test_empty_key_and_value() {
        let encoded = encode_record(b"", b"", 0, false, LIMITS).unwrap();
        assert_eq!(encoded.len(), HEADER_SIZE);
        let record = decode_record(&encoded).unwrap();
        assert!(record.key.is_empty());
        assert!(record.value.is_empty());
    }

    #[test]
    fn test_oversized_key_rejected() {
        let key = vec![0u8; LIMITS.max_key_size + 1];
        let result = encode_record(&key, b"val", 1, false, LIMITS);
        assert!(matches!(result, Err(CaskError::KeyTooLarge { size: 33, max: 32 })));
    }

    #[test]
    fn test_oversized_value_rejected() {
        let value = vec![0u8; LIMITS.max_value_size + 1];
        let result = encode_record(b"k", &value, 1, false, LIMITS);
        assert!(matches!(result, Err(CaskError::ValueTooLarge { .. })));
    }

    #[test]
    fn test_limits_are_inclusive() {
        let key = vec![0x41u8; LIMITS.max_key_size];
        let value = vec![0x42u8; LIMITS.max_value_size];
        assert!(encode_record(&key, &value, 1, false, LIMITS).is_ok());
    }

    #[test]
    fn test_corrupted_payload_detected() {
        let mut data = encode_record(b"key", b"value", 1, false, LIMITS).unwrap();
        let last = data.len() - 1;
        data[last] ^= 0xFF;
        assert!(matches!(decode_record(&data), Err(DecodeError::Corrupt(_))));
    }

    #[test]
    fn test_corrupted_timestamp_detected() {
        let mut data = encode_record(b"key", b"value", 1, false, LIMITS).unwrap();
        data[5] ^= 0x01;
        assert!(matches!(decode_record(&data), Err(DecodeError::Corrupt(_))));
    }

    #[test]
    fn test_truncated_detected() {
        let data = encode_record(b"key", b"value", 1, false, LIMITS).unwrap();
        assert!(matches!(
            decode_record(&data[..10]),
            Err(DecodeError::Truncated { needed, .. }) if needed == HEADER_SIZE as u64
        ));
        assert!(matches!(
            decode_record(&data[..data.len() - 1]),
            Err(DecodeError::Truncated { .. })
        ));
    }

    #[test]
    fn test_unknown_flags_rejected() {
        let mut data = encode_record(b"key", b"value", 1, false, LIMITS).unwrap();
        data[12] = 0x80;
        assert!(matches!(parse_header(&data), Err(DecodeError::Corrupt(_))));
    }

    #[test]
    fn test_header_lengths_checked_against_limits() {
        let data = encode_record(b"key", b"value", 1, false, LIMITS).unwrap();
        let header = parse_header(&data).unwrap();
        assert!(LIMITS.check_header(&header).is_ok());

        let mut bad = data.clone();
        bad[20] ^= 0x10; // high byte of value_len
        let header = parse_header(&bad).unwrap();
        assert!(matches!(LIMITS.check_header(&header), Err(DecodeError::Corrupt(_))));

        let tight = Limits { max_key_size: 2, max_value_size: 1024 };
        let header = parse_header(&data).unwrap();
        assert!(matches!(tight.check_header(&header), Err(DecodeError::Corrupt(_))));
    }

    #[test]
    fn test_into_cask_carries_context() {
        let err = DecodeError::Corrupt("bad".into()).into_cask(3, 99);
        assert!(matches!(err, CaskError::CorruptRecord { segment_id: 3, offset: 99, .. }));
    }
}
