//! Error types for revisioned store operations.
//!
//! Recoverable conditions (`NotExists`, `RevisionMismatch`, `AlreadyExists`)
//! never leave side effects behind. `InvariantViolation` reports corruption or
//! a programming error in the caller and must not be retried. `Notify` is the
//! one error returned after a mutation was durably committed.

use std::path::PathBuf;

use rusqlite::ErrorCode;
use snafu::Snafu;

use crate::notify::NotifyError;
use crate::record::Revision;
use crate::record::VersionedRecord;

/// Errors returned by [`RevisionedStore`](crate::RevisionedStore) operations.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum StoreError {
    /// A positive expected revision was supplied for a key with no current record.
    #[snafu(display("key '{key}' does not exist"))]
    NotExists { key: String },

    /// The expected revision does not match the key's current revision.
    #[snafu(display("revision mismatch for key '{key}': expected {expected}, current {current}"))]
    RevisionMismatch {
        key: String,
        expected: Revision,
        current: Revision,
    },

    /// A create-only write found a live record.
    #[snafu(display("key '{key}' already exists at revision {revision}"))]
    AlreadyExists { key: String, revision: Revision },

    /// The store or the caller broke an invariant. Not recoverable.
    #[snafu(display("invariant violated: {reason}"))]
    InvariantViolation { reason: String },

    #[snafu(display("failed to open sqlite database at {}: {source}", path.display()))]
    Open {
        path: PathBuf,
        source: rusqlite::Error,
    },

    #[snafu(display("failed to create directory {}: {source}", path.display()))]
    CreateDirectory {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("{operation}: {source}"))]
    Sqlite {
        operation: &'static str,
        source: rusqlite::Error,
    },

    /// The mutation committed at `record.revision` but the notifier failed.
    #[snafu(display("change notification failed for '{}' at revision {}: {source}", record.key, record.revision))]
    Notify {
        record: Box<VersionedRecord>,
        source: NotifyError,
    },
}

impl StoreError {
    /// Whether the error reports corruption or caller misuse rather than a business condition.
    pub fn is_fatal(&self) -> bool {
        matches!(self, StoreError::InvariantViolation { .. })
    }

    /// Whether the error is an optimistic-concurrency rejection the caller can act on.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            StoreError::NotExists { .. } | StoreError::RevisionMismatch { .. } | StoreError::AlreadyExists { .. }
        )
    }

    /// The record that was durably written even though the call failed.
    pub fn committed_record(&self) -> Option<&VersionedRecord> {
        match self {
            StoreError::Notify { record, .. } => Some(&**record),
            _ => None,
        }
    }

    /// Whether SQLite reported lock contention, which the transaction runner retries.
    pub(crate) fn is_busy(&self) -> bool {
        match self {
            StoreError::Sqlite {
                source: rusqlite::Error::SqliteFailure(err, _),
                ..
            } => matches!(err.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked),
            _ => false,
        }
    }

    pub(crate) fn invariant(reason: impl Into<String>) -> Self {
        StoreError::InvariantViolation { reason: reason.into() }
    }
}
