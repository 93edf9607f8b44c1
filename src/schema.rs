//! Database schema for the revisioned store.
//!
//! Two tables: the append-only `key_value` log and the single-row `revision`
//! counter. Schema creation is idempotent and runs every time a store opens.

use rusqlite::Connection;
use snafu::ResultExt;
use tracing::info;

use crate::error::SqliteSnafu;
use crate::error::StoreError;
use crate::record::Revision;
use crate::revision::allocate_revision;

pub(crate) const CREATE_KEY_VALUE_TABLE: &str = "
    CREATE TABLE IF NOT EXISTS key_value (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL,
        value BLOB,
        old_value BLOB,
        old_revision INTEGER,
        create_revision INTEGER,
        revision INTEGER NOT NULL,
        ttl INTEGER,
        version INTEGER,
        del INTEGER
    );
    CREATE INDEX IF NOT EXISTS key_value_name_revision ON key_value (name, revision);
    CREATE UNIQUE INDEX IF NOT EXISTS key_value_revision ON key_value (revision);
    CREATE INDEX IF NOT EXISTS key_value_ttl ON key_value (ttl) WHERE ttl > 0;
";

/// AUTOINCREMENT is required: plain rowids restart at 1 once the table is empty.
pub(crate) const CREATE_REVISION_TABLE: &str = "
    CREATE TABLE IF NOT EXISTS revision (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        t TEXT
    );
";

/// WAL journaling with FULL synchronous commits.
pub(crate) fn configure_connection(conn: &Connection) -> Result<(), StoreError> {
    // WAL is reported back as "memory" for in-memory databases, which is fine.
    conn.pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))
        .context(SqliteSnafu {
            operation: "set journal mode",
        })?;
    conn.pragma_update(None, "synchronous", "FULL").context(SqliteSnafu {
        operation: "set synchronous mode",
    })?;
    Ok(())
}

/// Create tables and bootstrap the revision counter.
///
/// Returns the current revision after initialization.
pub(crate) fn initialize(conn: &Connection) -> Result<Revision, StoreError> {
    conn.execute_batch(CREATE_KEY_VALUE_TABLE).context(SqliteSnafu {
        operation: "create key_value table",
    })?;
    conn.execute_batch(CREATE_REVISION_TABLE).context(SqliteSnafu {
        operation: "create revision table",
    })?;

    let existing: Option<i64> = conn
        .query_row("SELECT MAX(id) FROM revision", [], |row| row.get(0))
        .context(SqliteSnafu {
            operation: "get current revision",
        })?;

    match existing {
        Some(revision) if revision > 0 => Ok(revision),
        _ => {
            // A database restored without its counter must never hand out a
            // revision that is already stamped on a record.
            let max_record: Option<i64> = conn
                .query_row("SELECT MAX(revision) FROM key_value", [], |row| row.get(0))
                .context(SqliteSnafu {
                    operation: "get max record revision",
                })?;
            if let Some(max_record) = max_record {
                let updated = conn
                    .execute(
                        "UPDATE sqlite_sequence SET seq = MAX(seq, ?1) WHERE name = 'revision'",
                        [max_record],
                    )
                    .context(SqliteSnafu {
                        operation: "seed revision sequence",
                    })?;
                if updated == 0 {
                    conn.execute("INSERT INTO sqlite_sequence (name, seq) VALUES ('revision', ?1)", [max_record])
                        .context(SqliteSnafu {
                            operation: "seed revision sequence",
                        })?;
                }
            }
            let revision = allocate_revision(conn)?;
            info!(revision, "initialized revision counter");
            Ok(revision)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::revision::current_revision;

    #[test]
    fn initialize_bootstraps_counter() {
        let conn = Connection::open_in_memory().unwrap();
        let revision = initialize(&conn).unwrap();
        assert_eq!(revision, 1);
        assert_eq!(current_revision(&conn).unwrap(), 1);
    }

    #[test]
    fn initialize_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        initialize(&conn).unwrap();
        allocate_revision(&conn).unwrap();
        assert_eq!(initialize(&conn).unwrap(), 2);
    }

    #[test]
    fn initialize_seeds_counter_above_existing_records() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(CREATE_KEY_VALUE_TABLE).unwrap();
        conn.execute_batch(CREATE_REVISION_TABLE).unwrap();
        conn.execute("INSERT INTO key_value (name, revision) VALUES ('a', 41)", []).unwrap();

        let revision = initialize(&conn).unwrap();
        assert_eq!(revision, 42);
    }
}
