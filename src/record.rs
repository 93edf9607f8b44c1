//! The versioned record model.
//!
//! Every committed mutation appends one immutable row. A key's history is the
//! ordered set of its rows; the row with the highest revision is the key's
//! current state, and a tombstone at the top means the key is deleted.

use rusqlite::Row;
use serde::Deserialize;
use serde::Serialize;

/// Global revision number. Signed because callers use `<= 0` to mean "latest".
pub type Revision = i64;

/// Column list shared by every statement that reads or writes `key_value`.
pub(crate) const RECORD_COLUMNS: &str =
    "name, value, old_value, old_revision, create_revision, revision, ttl, version, del";

/// One committed version of a key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionedRecord {
    /// Internal row identifier.
    pub id: i64,
    pub key: String,
    pub value: Vec<u8>,
    /// Payload of the version this one replaced.
    pub old_value: Vec<u8>,
    /// Revision of the version this one replaced, 0 for a new lineage.
    pub old_revision: Revision,
    /// Revision at which the current lineage of this key began.
    pub create_revision: Revision,
    pub revision: Revision,
    /// Absolute expiry in unix seconds, 0 when the key never expires.
    pub ttl: i64,
    /// Per-key counter, 1 for the first version of a lineage.
    pub version: i64,
    #[serde(alias = "deleted")]
    pub is_deleted: bool,
}

impl VersionedRecord {
    /// Build the record that follows `current` for `key`, stamped with `revision`.
    ///
    /// Lineage metadata (`create_revision`, `version`, `ttl`) carries forward from
    /// `current`; without one, a new lineage starts at `revision`.
    pub fn successor(
        key: &str,
        value: Vec<u8>,
        revision: Revision,
        ttl: i64,
        current: Option<&VersionedRecord>,
        is_deleted: bool,
    ) -> Self {
        let mut record = VersionedRecord {
            id: 0,
            key: key.to_string(),
            value,
            old_value: Vec::new(),
            old_revision: 0,
            create_revision: revision,
            revision,
            ttl,
            version: 1,
            is_deleted,
        };
        if let Some(current) = current {
            record.old_value = current.value.clone();
            record.old_revision = current.revision;
            record.create_revision = current.create_revision;
            record.ttl = current.ttl;
            record.version = current.version + 1;
        }
        record
    }

    /// Reconstruct the version this record replaced, if it replaced one.
    pub fn previous(&self) -> Option<VersionedRecord> {
        if self.version <= 1 {
            return None;
        }
        Some(VersionedRecord {
            revision: self.old_revision,
            value: self.old_value.clone(),
            ..self.clone()
        })
    }

    /// Map a row selected as `id, <RECORD_COLUMNS>`.
    pub(crate) fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(VersionedRecord {
            id: row.get(0)?,
            key: row.get(1)?,
            value: row.get::<_, Option<Vec<u8>>>(2)?.unwrap_or_default(),
            old_value: row.get::<_, Option<Vec<u8>>>(3)?.unwrap_or_default(),
            old_revision: row.get::<_, Option<i64>>(4)?.unwrap_or_default(),
            create_revision: row.get::<_, Option<i64>>(5)?.unwrap_or_default(),
            revision: row.get(6)?,
            ttl: row.get::<_, Option<i64>>(7)?.unwrap_or_default(),
            version: row.get::<_, Option<i64>>(8)?.unwrap_or_default(),
            is_deleted: row.get::<_, Option<i64>>(9)?.unwrap_or_default() != 0,
        })
    }
}
