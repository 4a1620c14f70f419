//! CaskStore CLI
//!
//! Opens a data directory, runs one command against it, and closes it.
//! Replies follow the conventions of the original daemon: `OK` for writes,
//! the raw value for `get` (nothing, and a failing exit status, when the
//! key is missing), `1`/`0` for `del` and `exists`.

use std::io::{self, Write};
use std::path::PathBuf;
use std::process::ExitCode;

use caskstore_core::config::DEFAULT_MAX_DATAFILE_SIZE;
use caskstore_core::{CaskEngine, CaskError, CaskResult, Config};
use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

/// CaskStore CLI
#[derive(Parser, Debug)]
#[command(name = "caskstore")]
#[command(about = "Run commands against a CaskStore data directory")]
#[command(version)]
struct Args {
    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Maximum datafile size in bytes
    #[arg(long, default_value_t = DEFAULT_MAX_DATAFILE_SIZE)]
    max_datafile_size: u64,

    /// Data directory
    path: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
enum Command {
    /// Set a key-value pair
    Set {
        /// The key to set
        key: String,

        /// The value to set
        value: String,
    },

    /// Get a value by key
    Get {
        /// The key to get
        key: String,
    },

    /// Delete a key
    Del {
        /// The key to delete
        key: String,
    },

    /// Check whether a key exists
    Exists {
        /// The key to check
        key: String,
    },

    /// List all keys
    Keys,

    /// Count live keys
    Len,

    /// Compact closed segments
    Merge,

    /// Show store statistics
    Stats,
}

/// Result of one command, before formatting.
#[derive(Debug, PartialEq, Eq)]
enum Reply {
    Ok,
    Bulk(Vec<u8>),
    /// Missing key
    Nil,
    Int(u64),
    Array(Vec<Vec<u8>>),
    Text(String),
}

fn execute(engine: &CaskEngine, command: &Command) -> CaskResult<Reply> {
    match command {
        Command::Set { key, value } => {
            engine.put(key.as_bytes(), value.as_bytes())?;
            Ok(Reply::Ok)
        }
        Command::Get { key } => match engine.get(key.as_bytes()) {
            Ok(value) => Ok(Reply::Bulk(value)),
            Err(CaskError::KeyNotFound) => Ok(Reply::Nil),
            Err(e) => Err(e),
        },
        Command::Del { key } => match engine.delete(key.as_bytes()) {
            Ok(()) => Ok(Reply::Int(1)),
            Err(CaskError::KeyNotFound) => Ok(Reply::Int(0)),
            Err(e) => Err(e),
        },
        Command::Exists { key } => Ok(Reply::Int(engine.has(key.as_bytes())? as u64)),
        Command::Keys => {
            let mut keys: Vec<Vec<u8>> = engine.keys()?.collect();
            keys.sort_unstable();
            Ok(Reply::Array(keys))
        }
        Command::Len => Ok(Reply::Int(engine.len()? as u64)),
        Command::Merge => {
            let result = engine.compact()?;
            Ok(Reply::Text(format!(
                "compacted {} segments into {}, {} bytes saved",
                result.segments_compacted,
                result.segments_written,
                result.bytes_saved()
            )))
        }
        Command::Stats => {
            let stats = engine.stats()?;
            let lines = [
                format!("keys: {}", stats.keys),
                format!("segments: {}", stats.segments),
                format!("active segment: {}", stats.active_segment_id),
                format!("disk bytes: {}", stats.disk_bytes),
                format!("live bytes: {}", stats.live_bytes),
                format!("dead bytes: {}", stats.dead_bytes),
            ];
            Ok(Reply::Text(lines.join("\n")))
        }
    }
}

fn write_reply<W: Write>(out: &mut W, reply: &Reply) -> io::Result<()> {
    match reply {
        Reply::Ok => writeln!(out, "OK"),
        Reply::Bulk(value) => {
            out.write_all(value)?;
            writeln!(out)
        }
        Reply::Nil => Ok(()),
        Reply::Int(n) => writeln!(out, "{}", n),
        Reply::Array(items) => {
            for item in items {
                out.write_all(item)?;
                writeln!(out)?;
            }
            Ok(())
        }
        Reply::Text(text) => writeln!(out, "{}", text),
    }
}

fn main() -> ExitCode {
    let args = Args::parse();

    // Initialize tracing/logging on stderr; stdout carries replies
    let default_level = if args.debug { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    fmt().with_env_filter(filter).with_writer(io::stderr).init();

    let config = Config::builder().max_datafile_size(args.max_datafile_size).build();
    let engine = match CaskEngine::open(&args.path, config) {
        Ok(engine) => engine,
        Err(e) => {
            error!(path = %args.path.display(), error = %e, "error opening database");
            return ExitCode::FAILURE;
        }
    };
    info!(path = %args.path.display(), command = ?args.command, "running command");

    let reply = match execute(&engine, &args.command) {
        Ok(reply) => reply,
        Err(e) => {
            error!(error = %e, "command failed");
            return ExitCode::FAILURE;
        }
    };

    let mut stdout = io::stdout().lock();
    if let Err(e) = write_reply(&mut stdout, &reply).and_then(|_| stdout.flush()) {
        error!(error = %e, "failed to write reply");
        return ExitCode::FAILURE;
    }

    if let Err(e) = engine.close() {
        error!(error = %e, "error closing database");
        return ExitCode::FAILURE;
    }

    if reply == Reply::Nil {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}
