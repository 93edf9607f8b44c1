//! Centralized constants for the revisioned store.
//!
//! Tiger Style: Constants are fixed and immutable, enforced at compile time.
//! Each constant has explicit bounds to prevent unbounded resource allocation.

use std::time::Duration;

// ============================================================================
// Key Pattern Constants
// ============================================================================

/// Trailing character that turns a key argument into a prefix pattern.
///
/// Used in:
/// - `query.rs`: `KeyPattern::parse`
/// - `store.rs`: rejecting range deletes
pub const KEY_WILDCARD: char = '%';

// ============================================================================
// Query Constants
// ============================================================================

/// SQL `LIMIT` value SQLite interprets as "no limit".
pub const SQL_UNBOUNDED_LIMIT: i64 = -1;

// ============================================================================
// Transaction Constants
// ============================================================================

/// How long SQLite itself waits on a locked database before reporting busy (5 seconds).
pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Maximum number of times a unit of work is retried after `SQLITE_BUSY` (10).
///
/// Tiger Style: Bounded retries so a wedged lock holder surfaces as an error
/// instead of stalling callers forever.
pub const DEFAULT_MAX_BUSY_RETRIES: u32 = 10;

/// Base backoff between busy retries (10ms), multiplied by the attempt number.
pub const DEFAULT_BUSY_BACKOFF: Duration = Duration::from_millis(10);

// ============================================================================
// Compaction Constants
// ============================================================================

/// Interval between background compaction runs (5 minutes).
pub const DEFAULT_COMPACTION_INTERVAL: Duration = Duration::from_secs(300);

/// Lower bound accepted for the compaction interval (10ms).
pub const MIN_COMPACTION_INTERVAL: Duration = Duration::from_millis(10);

// ============================================================================
// Notification Constants
// ============================================================================

/// Capacity of the broadcast channel used by `BroadcastNotifier` (1024 records).
///
/// Lagging subscribers lose the oldest records and must catch up with `replay`.
pub const DEFAULT_NOTIFY_CHANNEL_CAPACITY: usize = 1024;
