//! Background compaction task.
//!
//! Periodically runs [`RevisionedStore::cleanup`] so the append-only log stays
//! bounded, and optionally [`RevisionedStore::delete_expired`] when TTL expiry
//! is enabled.
//!
//! # Tiger Style
//!
//! - Fixed interval, missed ticks are skipped rather than bunched up
//! - Store calls run on the blocking pool; SQLite I/O never stalls the runtime
//! - Uses CancellationToken for graceful shutdown

use std::sync::Arc;

use tokio::time::interval;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::config::CompactionConfig;
use crate::store::now_unix_secs;
use crate::store::CompactionReport;
use crate::store::RevisionedStore;
use crate::txn::TransactionRunner;

/// Spawn the compaction loop on the current tokio runtime.
///
/// Returns a CancellationToken that stops the task.
pub fn spawn_compaction_task<R>(store: Arc<RevisionedStore<R>>, config: CompactionConfig) -> CancellationToken
where
    R: TransactionRunner + 'static,
{
    let cancel = CancellationToken::new();
    let cancel_clone = cancel.clone();

    tokio::spawn(async move {
        run_compaction_loop(store, config, cancel_clone).await;
    });

    cancel
}

async fn run_compaction_loop<R>(store: Arc<RevisionedStore<R>>, config: CompactionConfig, cancel: CancellationToken)
where
    R: TransactionRunner + 'static,
{
    let mut ticker = interval(config.interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // The first tick completes immediately; compaction starts one interval after spawn.
    ticker.tick().await;

    info!(
        interval_ms = config.interval_ms,
        expire_ttl = config.expire_ttl,
        "compaction task started"
    );

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("compaction task shutting down");
                break;
            }
            _ = ticker.tick() => {
                run_compaction_iteration(&store, &config).await;
            }
        }
    }
}

/// Run one sweep. Failures are logged and retried on the next tick.
async fn run_compaction_iteration<R>(store: &Arc<RevisionedStore<R>>, config: &CompactionConfig)
where
    R: TransactionRunner + 'static,
{
    if config.expire_ttl {
        let store = store.clone();
        match tokio::task::spawn_blocking(move || store.delete_expired(now_unix_secs())).await {
            Ok(Ok(deleted)) => debug!(deleted, "TTL expiry pass completed"),
            Ok(Err(e)) => warn!(error = %e, "TTL expiry pass failed"),
            Err(e) => warn!(error = %e, "TTL expiry pass panicked"),
        }
    }

    let store = store.clone();
    match tokio::task::spawn_blocking(move || store.cleanup()).await {
        Ok(Ok(CompactionReport { keys, rows_deleted })) => {
            debug!(keys, rows_deleted, "compaction iteration completed");
        }
        Ok(Err(e)) => warn!(error = %e, "compaction iteration failed"),
        Err(e) => warn!(error = %e, "compaction iteration panicked"),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::config::StoreConfig;

    fn fast_config(expire_ttl: bool) -> CompactionConfig {
        CompactionConfig {
            interval_ms: 20,
            expire_ttl,
        }
    }

    async fn wait_until<F: Fn() -> bool>(condition: F) -> bool {
        for _ in 0..100 {
            if condition() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        false
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn task_compacts_history() {
        let store = Arc::new(RevisionedStore::open_in_memory(&StoreConfig::default()).unwrap());
        let (_, first) = store.update("a", b"1", 0, 0).unwrap();
        let (_, second) = store.update("a", b"2", first.revision, 0).unwrap();
        let (_, b) = store.update("b", b"1", 0, 0).unwrap();
        store.delete("b", b.revision).unwrap();

        let cancel = spawn_compaction_task(store.clone(), fast_config(false));
        let compacted = wait_until(|| {
            store.replay("a", 0).map(|rows| rows.len() == 1).unwrap_or(false)
                && store.replay("b", 0).map(|rows| rows.is_empty()).unwrap_or(false)
        })
        .await;
        cancel.cancel();

        assert!(compacted, "history should be compacted");
        assert_eq!(store.get("a").unwrap().map(|r| r.revision), Some(second.revision));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn task_expires_ttl_rows_when_enabled() {
        let store = Arc::new(RevisionedStore::open_in_memory(&StoreConfig::default()).unwrap());
        store.update("live", b"x", 0, 0).unwrap();
        // Write an already-expired row directly through the runner.
        store
            .runner()
            .run("seed expired row", |conn| {
                conn.execute(
                    "INSERT INTO key_value (name, value, revision, ttl, version, del) \
                     VALUES ('old', x'00', 1000, 1, 1, 0)",
                    [],
                )
                .map_err(|e| crate::error::StoreError::Sqlite {
                    operation: "seed",
                    source: e,
                })
            })
            .unwrap();

        let cancel = spawn_compaction_task(store.clone(), fast_config(true));
        let expired = wait_until(|| store.replay("old", 0).map(|rows| rows.is_empty()).unwrap_or(false)).await;
        cancel.cancel();

        assert!(expired, "expired row should be deleted");
        assert!(store.get("live").unwrap().is_some());
    }

    fn execute(store: &RevisionedStore, sql: &'static str) {
        store
            .runner()
            .run("test statement", |conn| {
                conn.execute_batch(sql).map_err(|e| crate::error::StoreError::Sqlite {
                    operation: "test statement",
                    source: e,
                })
            })
            .unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn failed_sweep_is_retried_on_next_tick() {
        let store = Arc::new(RevisionedStore::open_in_memory(&StoreConfig::default()).unwrap());
        execute(&store, "ALTER TABLE key_value RENAME TO key_value_hidden");

        let cancel = spawn_compaction_task(store.clone(), fast_config(false));
        // Several sweeps fail while the table is missing.
        tokio::time::sleep(Duration::from_millis(100)).await;

        execute(&store, "ALTER TABLE key_value_hidden RENAME TO key_value");
        let (_, first) = store.update("a", b"1", 0, 0).unwrap();
        store.update("a", b"2", first.revision, 0).unwrap();

        let compacted = wait_until(|| store.replay("a", 0).map(|rows| rows.len() == 1).unwrap_or(false)).await;
        cancel.cancel();
        assert!(compacted, "task should keep sweeping after a failed iteration");
    }

    #[tokio::test]
    async fn cancelled_task_stops() {
        let store = Arc::new(RevisionedStore::open_in_memory(&StoreConfig::default()).unwrap());
        let cancel = spawn_compaction_task(store.clone(), fast_config(false));
        cancel.cancel();
        assert!(cancel.is_cancelled());
        // The task holds the only other reference; it is released once the loop exits.
        assert!(wait_until(|| Arc::strong_count(&store) == 1).await);
    }
}
