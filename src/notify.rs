//! Post-commit change notification.
//!
//! A [`ChangeNotifier`] is invoked synchronously, at most once per committed
//! mutation, after the transaction has committed. Its failure is reported to
//! the writer but never undoes the write.

use thiserror::Error;
use tokio::sync::broadcast;

use crate::constants::DEFAULT_NOTIFY_CHANNEL_CAPACITY;
use crate::record::VersionedRecord;

/// Failure reported by a [`ChangeNotifier`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NotifyError {
    /// The notifier refused the record.
    #[error("notifier rejected record: {reason}")]
    Rejected { reason: String },

    /// The notifier can no longer deliver records.
    #[error("notifier closed")]
    Closed,
}

/// Observer of committed mutations.
pub trait ChangeNotifier: Send + Sync {
    fn notify(&self, record: &VersionedRecord) -> Result<(), NotifyError>;
}

impl<F> ChangeNotifier for F
where
    F: Fn(&VersionedRecord) -> Result<(), NotifyError> + Send + Sync,
{
    fn notify(&self, record: &VersionedRecord) -> Result<(), NotifyError> {
        self(record)
    }
}

/// Fans committed records out to any number of subscribers.
///
/// Having no subscribers is not an error. Subscribers that fall more than the
/// channel capacity behind receive `RecvError::Lagged` and should resume from
/// the store with `replay`.
#[derive(Debug, Clone)]
pub struct BroadcastNotifier {
    sender: broadcast::Sender<VersionedRecord>,
}

impl BroadcastNotifier {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_NOTIFY_CHANNEL_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<VersionedRecord> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for BroadcastNotifier {
    fn default() -> Self {
        Self::new()
    }
}

impl ChangeNotifier for BroadcastNotifier {
    fn notify(&self, record: &VersionedRecord) -> Result<(), NotifyError> {
        // SendError only means nobody is listening right now.
        let _ = self.sender.send(record.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(revision: i64) -> VersionedRecord {
        VersionedRecord {
            key: "a".into(),
            revision,
            version: 1,
            ..Default::default()
        }
    }

    #[test]
    fn broadcast_without_subscribers_succeeds() {
        let notifier = BroadcastNotifier::new();
        assert_eq!(notifier.subscriber_count(), 0);
        assert!(notifier.notify(&record(2)).is_ok());
    }

    #[tokio::test]
    async fn broadcast_delivers_in_order() {
        let notifier = BroadcastNotifier::with_capacity(8);
        let mut rx = notifier.subscribe();
        for revision in 2..5 {
            notifier.notify(&record(revision)).unwrap();
        }
        for revision in 2..5 {
            assert_eq!(rx.recv().await.unwrap().revision, revision);
        }
    }

    #[test]
    fn closures_are_notifiers() {
        let notifier = |record: &VersionedRecord| {
            if record.revision % 2 == 0 {
                Ok(())
            } else {
                Err(NotifyError::Rejected {
                    reason: "odd revision".into(),
                })
            }
        };
        assert!(notifier.notify(&record(2)).is_ok());
        assert_eq!(
            notifier.notify(&record(3)).unwrap_err().to_string(),
            "notifier rejected record: odd revision"
        );
    }
}
