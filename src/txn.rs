//! Transaction runner: the seam between the store and the SQL engine.
//!
//! Every read and write of the store goes through [`TransactionRunner::run`],
//! which executes a unit of work atomically and owns contention handling.
//! The unit of work may run more than once, so it must not have effects
//! outside the connection it is handed.

use std::path::Path;
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use rusqlite::Connection;
use rusqlite::TransactionBehavior;
use snafu::ResultExt;
use tracing::warn;

use crate::config::StoreConfig;
use crate::error::CreateDirectorySnafu;
use crate::error::OpenSnafu;
use crate::error::SqliteSnafu;
use crate::error::StoreError;
use crate::schema;

/// Executes units of work with all-or-nothing commit and isolated reads.
pub trait TransactionRunner: Send + Sync {
    /// Run `work` inside one transaction, committing if it returns `Ok`.
    ///
    /// `operation` names the unit of work for logs.
    fn run<T, F>(&self, operation: &'static str, work: F) -> Result<T, StoreError>
    where
        F: FnMut(&Connection) -> Result<T, StoreError>;
}

/// Runs transactions on a single SQLite connection.
///
/// Transactions start with `BEGIN IMMEDIATE`, which takes the write lock up
/// front and serializes revision allocation between connections. Lock
/// contention from other processes is retried with linear backoff.
#[derive(Debug)]
pub struct SqliteTransactionRunner {
    conn: Mutex<Connection>,
    path: Option<PathBuf>,
    max_busy_retries: u32,
    busy_backoff: Duration,
}

impl SqliteTransactionRunner {
    /// Open (creating if needed) the database at `config.path` and initialize the schema.
    pub fn open(config: &StoreConfig) -> Result<Self, StoreError> {
        let path = config.path.clone();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).context(CreateDirectorySnafu { path: parent })?;
        }
        let conn = Connection::open(&path).context(OpenSnafu { path: &path })?;
        Self::from_connection(conn, Some(path), config)
    }

    /// Private in-memory database, mostly for tests.
    pub fn open_in_memory(config: &StoreConfig) -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().context(OpenSnafu {
            path: PathBuf::from(":memory:"),
        })?;
        Self::from_connection(conn, None, config)
    }

    fn from_connection(conn: Connection, path: Option<PathBuf>, config: &StoreConfig) -> Result<Self, StoreError> {
        conn.busy_timeout(config.busy_timeout()).context(SqliteSnafu {
            operation: "set busy timeout",
        })?;
        schema::configure_connection(&conn)?;

        let runner = Self {
            conn: Mutex::new(conn),
            path,
            max_busy_retries: config.max_busy_retries,
            busy_backoff: config.busy_backoff(),
        };
        runner.run("initialize schema", |conn| schema::initialize(conn))?;
        Ok(runner)
    }

    /// Path of the database file, `None` for in-memory databases.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn run_once<T, F>(&self, work: &mut F) -> Result<T, StoreError>
    where
        F: FnMut(&Connection) -> Result<T, StoreError>,
    {
        let mut conn = self.conn.lock();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context(SqliteSnafu {
                operation: "begin transaction",
            })?;
        // Dropping `tx` on the error path rolls back.
        let value = work(&*tx)?;
        tx.commit().context(SqliteSnafu {
            operation: "commit transaction",
        })?;
        Ok(value)
    }
}

impl TransactionRunner for SqliteTransactionRunner {
    fn run<T, F>(&self, operation: &'static str, mut work: F) -> Result<T, StoreError>
    where
        F: FnMut(&Connection) -> Result<T, StoreError>,
    {
        let mut attempt: u32 = 0;
        loop {
            match self.run_once(&mut work) {
                Err(err) if err.is_busy() && attempt < self.max_busy_retries => {
                    attempt += 1;
                    warn!(operation, attempt, error = %err, "database busy, retrying transaction");
                    thread::sleep(self.busy_backoff * attempt);
                }
                result => return result,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use rusqlite::ffi;

    use super::*;
    use crate::revision::allocate_revision;
    use crate::revision::current_revision;

    fn runner() -> SqliteTransactionRunner {
        let config = StoreConfig {
            busy_backoff_ms: 0,
            ..StoreConfig::default()
        };
        SqliteTransactionRunner::open_in_memory(&config).unwrap()
    }

    fn busy() -> StoreError {
        StoreError::Sqlite {
            operation: "insert record",
            source: rusqlite::Error::SqliteFailure(ffi::Error::new(ffi::SQLITE_BUSY), None),
        }
    }

    #[test]
    fn commits_on_success() {
        let runner = runner();
        let allocated = runner.run("allocate", |conn| allocate_revision(conn)).unwrap();
        let current = runner.run("read", |conn| current_revision(conn)).unwrap();
        assert_eq!(allocated, current);
    }

    #[test]
    fn rolls_back_on_error() {
        let runner = runner();
        let before = runner.run("read", |conn| current_revision(conn)).unwrap();
        let result: Result<(), _> = runner.run("allocate then fail", |conn| {
            allocate_revision(conn)?;
            Err(StoreError::invariant("boom"))
        });
        assert!(result.unwrap_err().is_fatal());
        let after = runner.run("read", |conn| current_revision(conn)).unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn retries_busy_until_success() {
        let runner = runner();
        let attempts = Cell::new(0);
        let value = runner
            .run("flaky", |_| {
                attempts.set(attempts.get() + 1);
                if attempts.get() < 3 {
                    Err(busy())
                } else {
                    Ok(7)
                }
            })
            .unwrap();
        assert_eq!(value, 7);
        assert_eq!(attempts.get(), 3);
    }

    #[test]
    fn gives_up_after_max_retries() {
        let config = StoreConfig {
            max_busy_retries: 2,
            busy_backoff_ms: 0,
            ..StoreConfig::default()
        };
        let runner = SqliteTransactionRunner::open_in_memory(&config).unwrap();
        let attempts = Cell::new(0);
        let result: Result<(), _> = runner.run("always busy", |_| {
            attempts.set(attempts.get() + 1);
            Err(busy())
        });
        assert!(result.unwrap_err().is_busy());
        assert_eq!(attempts.get(), 3);
    }

    #[test]
    fn non_busy_errors_are_not_retried() {
        let runner = runner();
        let attempts = Cell::new(0);
        let result: Result<(), _> = runner.run("conflict", |_| {
            attempts.set(attempts.get() + 1);
            Err(StoreError::NotExists { key: "a".into() })
        });
        assert!(result.unwrap_err().is_conflict());
        assert_eq!(attempts.get(), 1);
    }

    #[test]
    fn open_creates_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let config = StoreConfig {
            path: dir.path().join("nested/deeper/state.db"),
            ..StoreConfig::default()
        };
        let runner = SqliteTransactionRunner::open(&config).unwrap();
        assert_eq!(runner.path(), Some(config.path.as_path()));
        assert!(config.path.exists());
    }
}
