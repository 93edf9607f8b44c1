//! Multi-version key-value store over SQLite.
//!
//! Every mutation appends a row stamped with a globally increasing revision.
//! Readers can list the latest state, a historical snapshot, or resume a
//! paginated snapshot; writers use optimistic concurrency on the key's current
//! revision. A background task compacts superseded history.
//!
//! ```no_run
//! use revkv::{RevisionedStore, StoreConfig};
//!
//! # fn main() -> Result<(), revkv::StoreError> {
//! let store = RevisionedStore::open(&StoreConfig::with_path("/tmp/revkv.db"))?;
//! let (_, created) = store.update("config/a", b"1", 0, 0)?;
//! store.update("config/a", b"2", created.revision, 0)?;
//! let page = store.list(0, 100, "config/%", "")?;
//! assert_eq!(page.records.len(), 1);
//! # Ok(())
//! # }
//! ```

pub mod compaction;
pub mod config;
pub mod constants;
pub mod error;
pub mod notify;
pub mod query;
pub mod record;
pub mod revision;
pub mod store;
pub mod txn;

mod schema;

pub use compaction::spawn_compaction_task;
pub use config::CompactionConfig;
pub use config::ConcurrencyCheck;
pub use config::ConfigError;
pub use config::StoreConfig;
pub use error::StoreError;
pub use notify::BroadcastNotifier;
pub use notify::ChangeNotifier;
pub use notify::NotifyError;
pub use query::KeyPattern;
pub use query::ListQuery;
pub use record::Revision;
pub use record::VersionedRecord;
pub use store::now_unix_secs;
pub use store::CompactionReport;
pub use store::ListResult;
pub use store::RevisionedStore;
pub use txn::SqliteTransactionRunner;
pub use txn::TransactionRunner;
