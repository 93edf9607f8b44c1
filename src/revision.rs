//! Global revision counter.
//!
//! The `revision` table holds at most one row whose AUTOINCREMENT id is the
//! last allocated revision. Allocation deletes the row and inserts a fresh
//! one; `AUTOINCREMENT` never reissues an id, even after the row is gone, so
//! revisions are strictly increasing across the whole database.
//!
//! Both functions run on the caller's transaction. Allocation must share the
//! transaction that inserts the stamped record so the two commit together.

use rusqlite::Connection;
use snafu::ResultExt;

use crate::error::SqliteSnafu;
use crate::error::StoreError;
use crate::record::Revision;

/// Read the last allocated revision.
///
/// A missing row or a zero id means the counter was never initialized or has
/// been tampered with; both are invariant violations.
pub fn current_revision(conn: &Connection) -> Result<Revision, StoreError> {
    let revision: Option<i64> = conn
        .query_row("SELECT MAX(id) FROM revision", [], |row| row.get(0))
        .context(SqliteSnafu {
            operation: "get current revision",
        })?;

    match revision {
        Some(revision) if revision > 0 => Ok(revision),
        _ => Err(StoreError::invariant("current revision is 0")),
    }
}

/// Allocate the next global revision.
pub fn allocate_revision(conn: &Connection) -> Result<Revision, StoreError> {
    conn.execute("DELETE FROM revision", []).context(SqliteSnafu {
        operation: "clear revision counter",
    })?;
    conn.execute("INSERT INTO revision(t) VALUES (NULL)", []).context(SqliteSnafu {
        operation: "allocate revision",
    })?;
    Ok(conn.last_insert_rowid())
}
