//! revkv - command-line access to a local revisioned store.
//!
//! Every command opens the database, runs one operation, and prints the
//! result as JSON on stdout. Logs go to stderr and are filtered by `RUST_LOG`.
//!
//! ```bash
//! revkv --db ./data/revkv.db put config/a hello
//! revkv --db ./data/revkv.db list 'config/%' --limit 10
//! revkv --db ./data/revkv.db replay 'config/%' --from 1
//! ```

use std::path::PathBuf;

use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use clap::Parser;
use clap::Subcommand;
use revkv::CompactionReport;
use revkv::ListResult;
use revkv::Revision;
use revkv::RevisionedStore;
use revkv::StoreConfig;
use revkv::VersionedRecord;
use serde::Serialize;
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "revkv")]
#[command(about = "Revisioned multi-version key-value store", long_about = None)]
struct Args {
    /// TOML configuration file.
    #[arg(long, env = "REVKV_CONFIG")]
    config: Option<PathBuf>,

    /// Database file. Overrides the configured path.
    #[arg(long)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the current live record for a key.
    Get { key: String },

    /// List live records; a trailing `%` makes the key a prefix.
    List {
        key: String,
        /// Read the snapshot as of this revision (0 = latest).
        #[arg(long, default_value_t = 0)]
        revision: Revision,
        /// Maximum rows to scan, 0 for unbounded.
        #[arg(long, default_value_t = 0)]
        limit: i64,
        /// Continue after this key. Only valid with a positive --revision.
        #[arg(long, default_value = "")]
        after: String,
    },

    /// Write a new version of a key.
    Put {
        key: String,
        value: String,
        /// Only write if the key is currently at this revision.
        #[arg(long, default_value_t = 0)]
        expect: Revision,
        /// Lease in seconds for a new key.
        #[arg(long, default_value_t = 0)]
        ttl: i64,
    },

    /// Create a key that must not already exist.
    Create {
        key: String,
        value: String,
        #[arg(long, default_value_t = 0)]
        ttl: i64,
    },

    /// Delete a key by writing a tombstone.
    Delete {
        key: String,
        #[arg(long, default_value_t = 0)]
        expect: Revision,
    },

    /// Print every change to matching keys since a revision.
    Replay {
        key: String,
        #[arg(long, default_value_t = 0)]
        from: Revision,
    },

    /// Compact history once.
    Compact,

    /// Print the current revision.
    Revision,
}

/// JSON view of a record with the value rendered as text.
#[derive(Serialize)]
struct RecordOutput {
    key: String,
    value: String,
    revision: Revision,
    create_revision: Revision,
    old_revision: Revision,
    version: i64,
    ttl: i64,
    deleted: bool,
}

impl From<&VersionedRecord> for RecordOutput {
    fn from(record: &VersionedRecord) -> Self {
        Self {
            key: record.key.clone(),
            value: String::from_utf8_lossy(&record.value).into_owned(),
            revision: record.revision,
            create_revision: record.create_revision,
            old_revision: record.old_revision,
            version: record.version,
            ttl: record.ttl,
            deleted: record.is_deleted,
        }
    }
}

#[derive(Serialize)]
struct ListOutput {
    revision: Revision,
    records: Vec<RecordOutput>,
}

impl From<&ListResult> for ListOutput {
    fn from(result: &ListResult) -> Self {
        Self {
            revision: result.revision,
            records: result.records.iter().map(RecordOutput::from).collect(),
        }
    }
}

fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();

    let mut config = StoreConfig::load(args.config.as_deref()).context("failed to load configuration")?;
    if let Some(db) = args.db {
        config.path = db;
    }
    debug!(path = %config.path.display(), "opening store");
    let store = RevisionedStore::open(&config).context("failed to open store")?;

    let output = match args.command {
        Command::Get { key } => serde_json::to_value(store.get(&key)?.as_ref().map(RecordOutput::from))?,
        Command::List {
            key,
            revision,
            limit,
            after,
        } => {
            check_resume_args(revision, &after)?;
            serde_json::to_value(ListOutput::from(&store.list(revision, limit, &key, &after)?))?
        }
        Command::Put {
            key,
            value,
            expect,
            ttl,
        } => {
            let (previous, current) = store.update(&key, value.as_bytes(), expect, ttl)?;
            serde_json::json!({
                "previous": previous.as_ref().map(RecordOutput::from),
                "current": RecordOutput::from(&current),
            })
        }
        Command::Create { key, value, ttl } => {
            serde_json::to_value(RecordOutput::from(&store.create(&key, value.as_bytes(), ttl)?))?
        }
        Command::Delete { key, expect } => serde_json::to_value(RecordOutput::from(&store.delete(&key, expect)?))?,
        Command::Replay { key, from } => {
            let records: Vec<RecordOutput> = store.replay(&key, from)?.iter().map(RecordOutput::from).collect();
            serde_json::to_value(records)?
        }
        Command::Compact => {
            let report: CompactionReport = store.cleanup()?;
            serde_json::to_value(report)?
        }
        Command::Revision => serde_json::json!({ "revision": store.current_revision()? }),
    };

    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

/// A resume key is only honored on a snapshot listing; reject it otherwise.
fn check_resume_args(revision: Revision, after: &str) -> Result<()> {
    if !after.is_empty() && revision <= 0 {
        bail!("--after requires a positive --revision to page through");
    }
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();
}
