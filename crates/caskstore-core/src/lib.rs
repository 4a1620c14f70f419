//! CaskStore Core: embedded log-structured key-value engine
//!
//! Every write is appended to a segment file on disk; an in-memory key
//! directory maps each live key to the exact location of its newest record.
//!
//! # Architecture
//!
//! - **Write path**: append one checksummed record to the active segment,
//!   then point the key directory at it
//! - **Read path**: one key directory lookup and one positional read
//! - **Recovery**: replay all segments in ID order at open
//! - **Compaction**: rewrite closed segments without their dead records
//!
//! # On-disk layout
//!
//! A data directory holds `{id:09}.data` segment files and a `LOCK` file.
//! Segment IDs are assigned in creation order and never reused; the highest
//! ID is the active segment.

pub mod clock;
pub mod compaction;
pub mod config;
pub mod engine;
pub mod error;
pub mod format;
pub mod hash;
pub mod keydir;
pub mod manager;
pub mod platform;
pub mod recovery;
pub mod scheduler;
pub mod segment;

// Re-export key types for convenience
pub use compaction::CompactionResult;
pub use config::{CompactionConfig, Config, ConfigBuilder, RecoveryMode};
pub use engine::{CaskEngine, EngineStats};
pub use error::{CaskError, CaskResult};
pub use keydir::Keys;
pub use recovery::RecoveryReport;
pub use segment::SegmentId;
