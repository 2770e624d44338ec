//! Command-line definitions

use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "shelfctl")]
#[command(author, version, about = "Inspect and maintain shelf document and blob stores", long_about = None)]
pub struct Cli {
    /// Document store database file (overrides SHELF_DOC_DB)
    #[arg(long, global = true)]
    pub doc_db: Option<PathBuf>,

    /// Blob store database file (overrides SHELF_BLOB_DB)
    #[arg(long, global = true)]
    pub blob_db: Option<PathBuf>,

    /// Seconds to wait on a locked database (overrides SHELF_BUSY_TIMEOUT_SECS)
    #[arg(long, global = true)]
    pub busy_timeout_secs: Option<u64>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// JSON document operations
    Doc {
        #[command(subcommand)]
        command: DocCommands,
    },

    /// Binary blob operations
    Blob {
        #[command(subcommand)]
        command: BlobCommands,
    },

    /// Checkpoint the write-ahead log of both stores
    Flush {
        /// Also truncate the log file
        #[arg(long)]
        force: bool,
    },

    /// Rewrite both database files to reclaim free pages
    Compact,

    /// Apply a retention rule to one namespace
    Retain(RetainArgs),
}

#[derive(Subcommand)]
pub enum DocCommands {
    /// Write a JSON value; reads stdin when VALUE is omitted
    Put {
        namespace: String,
        key: String,
        value: Option<String>,
    },

    /// Print a document as JSON
    Get { namespace: String, key: String },

    /// List documents of a namespace, one JSON object per line
    Ls {
        namespace: String,
        #[command(flatten)]
        filter: FilterArgs,
        /// Print metadata only
        #[arg(long)]
        meta: bool,
    },

    /// Delete one key, or every key of the namespace in the time range
    Rm {
        namespace: String,
        key: Option<String>,
        #[command(flatten)]
        range: RangeArgs,
    },

    /// Count documents
    Count {
        namespace: Option<String>,
        /// SQL LIKE pattern on keys
        #[arg(long)]
        pattern: Option<String>,
    },
}

#[derive(Subcommand)]
pub enum BlobCommands {
    /// Store a file, or stdin when FILE is `-`
    Put {
        namespace: String,
        key: String,
        file: PathBuf,
        /// Byte count to read; required for stdin
        #[arg(long)]
        len: Option<u64>,
    },

    /// Write a payload to a file, or stdout when --out is omitted
    Get {
        namespace: String,
        key: String,
        #[arg(long, short)]
        out: Option<PathBuf>,
    },

    /// List blob metadata, one JSON object per line
    Ls {
        /// Namespace, or a LIKE pattern with --like
        namespace: Option<String>,
        /// Treat NAMESPACE as a LIKE pattern
        #[arg(long)]
        like: bool,
        #[command(flatten)]
        filter: FilterArgs,
    },

    /// Delete one key, or every key of the namespace in the time range
    Rm {
        namespace: String,
        key: Option<String>,
        #[command(flatten)]
        range: RangeArgs,
    },

    /// Count blobs
    Count {
        namespace: Option<String>,
        #[arg(long)]
        pattern: Option<String>,
    },
}

#[derive(Args, Debug, Default)]
pub struct RangeArgs {
    /// Only entries modified at or after this RFC 3339 timestamp
    #[arg(long, value_parser = parse_timestamp)]
    pub from: Option<DateTime<Utc>>,

    /// Only entries modified at or before this RFC 3339 timestamp
    #[arg(long, value_parser = parse_timestamp)]
    pub to: Option<DateTime<Utc>>,
}

#[derive(Args, Debug, Default)]
pub struct FilterArgs {
    /// SQL LIKE pattern on keys
    #[arg(long)]
    pub pattern: Option<String>,

    #[command(flatten)]
    pub range: RangeArgs,
}

#[derive(Args, Debug)]
pub struct RetainArgs {
    pub namespace: String,

    /// Apply to the blob store instead of the document store
    #[arg(long)]
    pub blobs: bool,

    /// SQL LIKE pattern restricting the rule to matching keys
    #[arg(long)]
    pub pattern: Option<String>,

    /// Delete entries created more than this many seconds ago
    #[arg(long)]
    pub max_age_secs: Option<u64>,

    /// Delete entries unchanged for more than this many seconds
    #[arg(long)]
    pub max_idle_secs: Option<u64>,

    /// Delete least recently modified entries until the namespace fits
    #[arg(long, conflicts_with_all = ["max_age_secs", "max_idle_secs"])]
    pub max_bytes: Option<u64>,

    /// Keep running, rescanning every --interval-secs until interrupted
    #[arg(long)]
    pub watch: bool,

    #[arg(long, default_value_t = 600)]
    pub interval_secs: u64,
}

pub fn parse_timestamp(s: &str) -> Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| format!("invalid timestamp {:?}: {}", s, e))
}
