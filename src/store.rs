//! The revisioned store: range queries, optimistic-concurrency mutation,
//! compaction and replay over an append-only SQLite log.
//!
//! # Model
//!
//! Each mutation appends one row stamped with a fresh global revision. A
//! key's current state is its highest-revision row; a tombstone there means
//! the key is deleted. Readers pick the row visible "as of" a revision, which
//! gives consistent historical snapshots without locking writers out.
//!
//! # Operations
//!
//! - `get` / `list`: four query shapes, see [`ListQuery`]
//! - `update` / `delete` / `create`: conditional writes, then notification
//! - `cleanup`: collapse every key's history to its latest live row
//! - `replay`: ordered change feed including tombstones
//! - `delete_expired`: TTL expiry, not called by any write path

use std::sync::Arc;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

use rusqlite::params;
use rusqlite::params_from_iter;
use rusqlite::types::Value;
use rusqlite::Connection;
use serde::Deserialize;
use serde::Serialize;
use snafu::ResultExt;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::config::ConcurrencyCheck;
use crate::config::StoreConfig;
use crate::error::NotifySnafu;
use crate::error::SqliteSnafu;
use crate::error::StoreError;
use crate::notify::ChangeNotifier;
use crate::query::KeyPattern;
use crate::query::ListQuery;
use crate::query::ReplayQuery;
use crate::record::Revision;
use crate::record::VersionedRecord;
use crate::record::RECORD_COLUMNS;
use crate::revision::allocate_revision;
use crate::revision::current_revision;
use crate::txn::SqliteTransactionRunner;
use crate::txn::TransactionRunner;

/// Records visible to a listing plus the revision the listing is consistent at.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListResult {
    /// Live records, ordered by key. Tombstones are never included.
    pub records: Vec<VersionedRecord>,
    /// Revision to resume from. Never lower than any scanned row, tombstones included.
    pub revision: Revision,
}

/// Outcome of one compaction sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompactionReport {
    /// Keys whose history was collapsed or erased.
    pub keys: u64,
    /// Rows physically removed.
    pub rows_deleted: u64,
}

/// Condition a write places on the key's current record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Precondition {
    /// Unconditional write.
    Any,
    /// Current record must exist at exactly this revision.
    Revision(Revision),
    /// No live record may exist.
    Absent,
}

impl Precondition {
    fn from_expected(expected_revision: Revision) -> Self {
        if expected_revision > 0 {
            Precondition::Revision(expected_revision)
        } else {
            Precondition::Any
        }
    }

    fn check(self, key: &str, current: Option<&VersionedRecord>) -> Result<(), StoreError> {
        match (self, current) {
            (Precondition::Any, _) => Ok(()),
            (Precondition::Revision(_), None) => Err(StoreError::NotExists { key: key.to_string() }),
            (Precondition::Revision(expected), Some(current)) if current.revision != expected => {
                Err(StoreError::RevisionMismatch {
                    key: key.to_string(),
                    expected,
                    current: current.revision,
                })
            }
            (Precondition::Revision(_), Some(_)) => Ok(()),
            (Precondition::Absent, Some(current)) => Err(StoreError::AlreadyExists {
                key: key.to_string(),
                revision: current.revision,
            }),
            (Precondition::Absent, None) => Ok(()),
        }
    }
}

/// Multi-version key-value store over a transactional SQL backend.
pub struct RevisionedStore<R = SqliteTransactionRunner> {
    runner: R,
    notifier: Option<Arc<dyn ChangeNotifier>>,
    concurrency_check: ConcurrencyCheck,
}

impl RevisionedStore<SqliteTransactionRunner> {
    /// Open the SQLite database named by `config`, creating and initializing it if needed.
    pub fn open(config: &StoreConfig) -> Result<Self, StoreError> {
        let runner = SqliteTransactionRunner::open(config)?;
        info!(
            path = %config.path.display(),
            concurrency_check = %config.concurrency_check,
            "opened revisioned store"
        );
        Ok(Self::with_runner(runner, config.concurrency_check))
    }

    /// Open a private in-memory store.
    pub fn open_in_memory(config: &StoreConfig) -> Result<Self, StoreError> {
        let runner = SqliteTransactionRunner::open_in_memory(config)?;
        Ok(Self::with_runner(runner, config.concurrency_check))
    }
}

impl<R: TransactionRunner> RevisionedStore<R> {
    pub fn with_runner(runner: R, concurrency_check: ConcurrencyCheck) -> Self {
        Self {
            runner,
            notifier: None,
            concurrency_check,
        }
    }

    /// Attach the observer invoked after every committed mutation.
    pub fn with_notifier(mut self, notifier: Arc<dyn ChangeNotifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn runner(&self) -> &R {
        &self.runner
    }

    pub fn concurrency_check(&self) -> ConcurrencyCheck {
        self.concurrency_check
    }

    /// Last revision allocated anywhere in the store.
    pub fn current_revision(&self) -> Result<Revision, StoreError> {
        self.runner.run("current revision", |conn| current_revision(conn))
    }

    // ========================================================================
    // Range queries
    // ========================================================================

    /// List records matching `key` (a trailing `%` makes it a prefix).
    ///
    /// - `as_of <= 0` reads the latest state; an exact key reads one record.
    /// - `as_of > 0` reads each key as it was at that revision.
    /// - a non-empty `resume_key` with `as_of > 0` continues after that key and
    ///   pins the reported revision to `as_of`.
    ///
    /// `limit <= 0` is unbounded. Otherwise `limit + 1` rows are scanned so the
    /// caller can tell a page was truncated; tombstones count toward that budget
    /// but are not returned.
    pub fn list(
        &self,
        as_of: Revision,
        limit: i64,
        key: &str,
        resume_key: &str,
    ) -> Result<ListResult, StoreError> {
        let query = ListQuery::plan(as_of, limit, key, resume_key);
        let (sql, params) = query.to_sql();

        let result = self.runner.run("list", |conn| {
            let mut revision = match query.pinned_revision() {
                Some(pinned) => pinned,
                None => current_revision(conn)?,
            };
            let mut records = Vec::new();
            for record in query_records(conn, &sql, &params)? {
                revision = revision.max(record.revision);
                if !record.is_deleted {
                    records.push(record);
                }
            }
            Ok(ListResult { records, revision })
        })?;

        debug!(
            key,
            as_of,
            limit,
            resume_key,
            returned = result.records.len(),
            revision = result.revision,
            "list"
        );
        Ok(result)
    }

    /// Current live record for `key`, `None` if absent or deleted.
    pub fn get(&self, key: &str) -> Result<Option<VersionedRecord>, StoreError> {
        Ok(self.list(0, 1, key, "")?.records.into_iter().next())
    }

    // ========================================================================
    // Mutations
    // ========================================================================

    /// Write a new version of `key`.
    ///
    /// With `expected_revision > 0` the write only succeeds if that is the
    /// key's current revision. `ttl` is relative seconds and only applies when
    /// the key starts a new lineage.
    ///
    /// Returns the replaced version (`None` for a new key) and the new one.
    pub fn update(
        &self,
        key: &str,
        value: &[u8],
        expected_revision: Revision,
        ttl: i64,
    ) -> Result<(Option<VersionedRecord>, VersionedRecord), StoreError> {
        let record = self.write(
            Precondition::from_expected(expected_revision),
            false,
            key,
            value.to_vec(),
            ttl,
        )?;
        Ok((record.previous(), record))
    }

    /// Write a tombstone for `key`. Deleting a prefix pattern is an invariant violation.
    pub fn delete(&self, key: &str, expected_revision: Revision) -> Result<VersionedRecord, StoreError> {
        if KeyPattern::parse(key).is_range() {
            return Err(StoreError::invariant(format!("can not delete range key '{key}'")));
        }
        self.write(Precondition::from_expected(expected_revision), true, key, Vec::new(), 0)
    }

    /// Create-only write: fails with `AlreadyExists` if `key` has a live record.
    pub fn create(&self, key: &str, value: &[u8], ttl: i64) -> Result<VersionedRecord, StoreError> {
        self.write(Precondition::Absent, false, key, value.to_vec(), ttl)
    }

    fn write(
        &self,
        precondition: Precondition,
        is_delete: bool,
        key: &str,
        value: Vec<u8>,
        ttl: i64,
    ) -> Result<VersionedRecord, StoreError> {
        let expires_at = if ttl > 0 { now_unix_secs().saturating_add(ttl) } else { 0 };

        let prior = match self.concurrency_check {
            ConcurrencyCheck::BestEffort => {
                let current = self.runner.run("read current", |conn| latest_live(conn, key))?;
                precondition.check(key, current.as_ref())?;
                Some(current)
            }
            ConcurrencyCheck::Strict => None,
        };

        let record = self.runner.run("write", |conn| {
            let current = match &prior {
                Some(current) => current.clone(),
                None => {
                    let current = latest_live(conn, key)?;
                    precondition.check(key, current.as_ref())?;
                    current
                }
            };
            let revision = allocate_revision(conn)?;
            let record =
                VersionedRecord::successor(key, value.clone(), revision, expires_at, current.as_ref(), is_delete);
            let id = insert_record(conn, &record)?;
            Ok(VersionedRecord { id, ..record })
        })?;

        debug!(
            key,
            revision = record.revision,
            version = record.version,
            is_deleted = record.is_deleted,
            "committed record"
        );

        if let Some(notifier) = &self.notifier {
            if let Err(source) = notifier.notify(&record) {
                warn!(
                    key,
                    revision = record.revision,
                    error = %source,
                    "change notification failed after commit"
                );
                return Err(source).context(NotifySnafu {
                    record: Box::new(record),
                });
            }
        }
        Ok(record)
    }

    // ========================================================================
    // Compaction
    // ========================================================================

    /// Collapse each key's history to its latest row and erase deleted keys.
    ///
    /// Safe to repeat; a second run on an unchanged store deletes nothing.
    pub fn cleanup(&self) -> Result<CompactionReport, StoreError> {
        let report = self.runner.run("cleanup", |conn| {
            let candidates = {
                let mut stmt = conn
                    .prepare_cached(
                        "SELECT COUNT(*) AS c, name, MAX(revision) FROM key_value \
                         GROUP BY name HAVING c > 1 OR (c = 1 AND del = 1)",
                    )
                    .context(SqliteSnafu {
                        operation: "prepare compaction scan",
                    })?;
                let rows = stmt
                    .query_map([], |row| Ok((row.get::<_, String>(1)?, row.get::<_, Revision>(2)?)))
                    .context(SqliteSnafu {
                        operation: "scan compaction candidates",
                    })?;
                rows.collect::<Result<Vec<_>, _>>().context(SqliteSnafu {
                    operation: "scan compaction candidates",
                })?
            };

            let mut stmt = conn
                .prepare_cached(
                    "DELETE FROM key_value WHERE name = ?1 AND (revision < ?2 OR (revision = ?2 AND del = 1))",
                )
                .context(SqliteSnafu {
                    operation: "prepare compaction delete",
                })?;
            let mut report = CompactionReport::default();
            for (name, max_revision) in &candidates {
                let deleted = stmt.execute(params![name, max_revision]).context(SqliteSnafu {
                    operation: "delete superseded records",
                })?;
                report.keys += 1;
                report.rows_deleted += deleted as u64;
            }
            Ok(report)
        })?;

        if report.rows_deleted > 0 {
            info!(keys = report.keys, rows_deleted = report.rows_deleted, "compacted history");
        } else {
            debug!("compaction: nothing to delete");
        }
        Ok(report)
    }

    /// Physically delete rows whose absolute TTL lies before `now` (unix seconds).
    ///
    /// No write path calls this; expiry is left to whoever drives the store,
    /// such as the background compaction task with `expire_ttl` enabled.
    pub fn delete_expired(&self, now: i64) -> Result<u64, StoreError> {
        let deleted = self.runner.run("delete expired", |conn| {
            conn.execute("DELETE FROM key_value WHERE ttl > 0 AND ttl < ?1", [now])
                .context(SqliteSnafu {
                    operation: "delete expired records",
                })
        })?;
        if deleted > 0 {
            info!(deleted, now, "deleted expired records");
        }
        Ok(deleted as u64)
    }

    // ========================================================================
    // Replay
    // ========================================================================

    /// Every row of the matching keys with `revision >= from_revision`,
    /// tombstones included, oldest first.
    pub fn replay(&self, key: &str, from_revision: Revision) -> Result<Vec<VersionedRecord>, StoreError> {
        let (sql, params) = ReplayQuery::new(key, from_revision).to_sql();
        let records = self.runner.run("replay", |conn| query_records(conn, &sql, &params))?;
        debug!(key, from_revision, returned = records.len(), "replay");
        Ok(records)
    }
}

fn query_records(conn: &Connection, sql: &str, params: &[Value]) -> Result<Vec<VersionedRecord>, StoreError> {
    let mut stmt = conn.prepare_cached(sql).context(SqliteSnafu {
        operation: "prepare record query",
    })?;
    let rows = stmt
        .query_map(params_from_iter(params.iter()), VersionedRecord::from_row)
        .context(SqliteSnafu {
            operation: "query records",
        })?;
    rows.collect::<Result<Vec<_>, _>>().context(SqliteSnafu {
        operation: "read record row",
    })
}

/// Latest row of exactly `key` if it is not a tombstone.
fn latest_live(conn: &Connection, key: &str) -> Result<Option<VersionedRecord>, StoreError> {
    let (sql, params) = ListQuery::Point { key }.to_sql();
    Ok(query_records(conn, &sql, &params)?
        .into_iter()
        .next()
        .filter(|record| !record.is_deleted))
}

fn insert_record(conn: &Connection, record: &VersionedRecord) -> Result<i64, StoreError> {
    let mut stmt = conn
        .prepare_cached(&format!(
            "INSERT INTO key_value ({RECORD_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"
        ))
        .context(SqliteSnafu {
            operation: "prepare insert",
        })?;
    stmt.execute(params![
        record.key,
        record.value,
        record.old_value,
        record.old_revision,
        record.create_revision,
        record.revision,
        record.ttl,
        record.version,
        record.is_deleted as i64,
    ])
    .context(SqliteSnafu {
        operation: "insert record",
    })?;
    Ok(conn.last_insert_rowid())
}

/// Seconds since the unix epoch.
pub fn now_unix_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
