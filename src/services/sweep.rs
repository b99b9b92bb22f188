//! Periodic overdue and due-soon reminders
//!
//! The sweep only reads borrow records. It walks them in id order, one page at a
//! time, and records the last processed id so an interrupted pass resumes where it
//! stopped. Reminders are idempotent-safe, so a record seen twice is harmless.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::{watch, Mutex};

use super::{notifications::Notifier, redis::RedisService};
use crate::{error::AppResult, models::borrow::SweepReport, repository::BorrowRecordStore};

const CHECKPOINT_KEY: &str = "sweep:overdue:checkpoint";

/// Where the sweep remembers how far it got
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SweepCheckpoint: Send + Sync {
    async fn load(&self) -> AppResult<Option<i64>>;

    async fn save(&self, last_id: i64) -> AppResult<()>;

    async fn clear(&self) -> AppResult<()>;
}

pub struct RedisCheckpoint {
    redis: RedisService,
}

impl RedisCheckpoint {
    pub fn new(redis: RedisService) -> Self {
        Self { redis }
    }
}

#[async_trait]
impl SweepCheckpoint for RedisCheckpoint {
    async fn load(&self) -> AppResult<Option<i64>> {
        self.redis.get_checkpoint(CHECKPOINT_KEY).await
    }

    async fn save(&self, last_id: i64) -> AppResult<()> {
        self.redis.set_checkpoint(CHECKPOINT_KEY, last_id).await
    }

    async fn clear(&self) -> AppResult<()> {
        self.redis.clear_checkpoint(CHECKPOINT_KEY).await
    }
}

#[derive(Default)]
pub struct MemoryCheckpoint {
    last_id: Mutex<Option<i64>>,
}

#[async_trait]
impl SweepCheckpoint for MemoryCheckpoint {
    async fn load(&self) -> AppResult<Option<i64>> {
        Ok(*self.last_id.lock().await)
    }

    async fn save(&self, last_id: i64) -> AppResult<()> {
        *self.last_id.lock().await = Some(last_id);
        Ok(())
    }

    async fn clear(&self) -> AppResult<()> {
        *self.last_id.lock().await = None;
        Ok(())
    }
}

#[derive(Clone)]
pub struct OverdueSweeper {
    store: Arc<dyn BorrowRecordStore>,
    checkpoint: Arc<dyn SweepCheckpoint>,
    notifier: Notifier,
    batch_size: i64,
    due_soon: Duration,
}

impl OverdueSweeper {
    pub fn new(
        store: Arc<dyn BorrowRecordStore>,
        checkpoint: Arc<dyn SweepCheckpoint>,
        notifier: Notifier,
        batch_size: i64,
        due_soon_days: i64,
    ) -> Self {
        Self {
            store,
            checkpoint,
            notifier,
            batch_size: batch_size.max(1),
            due_soon: Duration::days(due_soon_days.max(0)),
        }
    }

    async fn save_checkpoint(&self, last_id: Option<i64>) {
        if let Some(last_id) = last_id {
            if let Err(e) = self.checkpoint.save(last_id).await {
                tracing::warn!(last_id, error = %e, "Could not save sweep checkpoint");
            }
        }
    }

    /// One pass over BORROWED records due before `now + due_soon_days`
    pub async fn sweep_overdue(&self, now: DateTime<Utc>, shutdown: &watch::Receiver<bool>) -> AppResult<SweepReport> {
        let mut report = SweepReport {
            resumed_after: self.checkpoint.load().await?,
            ..SweepReport::default()
        };
        if let Some(last_id) = report.resumed_after {
            tracing::info!(last_id, "Resuming interrupted sweep");
        }

        let cutoff = now + self.due_soon;
        let mut after = report.resumed_after;

        'pages: loop {
            let page = self.store.list_due_before(cutoff, after, self.batch_size).await?;
            let full_page = page.len() as i64 == self.batch_size;

            for record in page {
                if *shutdown.borrow() {
                    report.interrupted = true;
                    break 'pages;
                }

                let delivered = if record.is_overdue(now) {
                    let delivered = self.notifier.overdue(record.id).await;
                    report.overdue.push(record.clone());
                    delivered
                } else {
                    report.due_soon += 1;
                    self.notifier.due_soon(record.id).await
                };
                if delivered {
                    report.notified += 1;
                } else {
                    report.failed += 1;
                }
                after = Some(record.id);
            }

            self.save_checkpoint(after).await;
            if !full_page {
                break;
            }
        }

        if report.interrupted {
            self.save_checkpoint(after).await;
            tracing::info!(last_id = ?after, "Sweep interrupted");
        } else if let Err(e) = self.checkpoint.clear().await {
            tracing::warn!(error = %e, "Could not clear sweep checkpoint");
        }

        tracing::info!(
            overdue = report.overdue.len(),
            due_soon = report.due_soon,
            notified = report.notified,
            failed = report.failed,
            "Overdue sweep finished"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        error::AppError,
        models::borrow::{BorrowRecord, NewBorrow},
        repository::{memory::MemoryBorrowRecordStore, BorrowRecordStore as _},
        services::notifications::{LogNotifier, MockNotificationGateway},
    };
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 10, 9, 0, 0).unwrap()
    }

    /// A lent record due `due_in_days` from [`now`]
    async fn lent(store: &MemoryBorrowRecordStore, id: i64, due_in_days: i64) {
        let mut record = BorrowRecord::new(NewBorrow {
            id,
            borrow_number: format!("BR-{}", id),
            archive_id: 1000 + id,
            borrower_id: 5,
            requested_days: 1,
            purpose: None,
            workflow_instance_id: None,
            apply_time: now() - Duration::days(30),
        });
        record
            .approve_and_lend(2, None, 10, now() + Duration::days(due_in_days) - Duration::days(10))
            .unwrap();
        store.create_record(&record).await.unwrap();
    }

    fn notifier() -> Notifier {
        Notifier::new(Arc::new(LogNotifier), std::time::Duration::from_millis(200))
    }

    #[tokio::test]
    async fn test_sweep_splits_overdue_and_due_soon() {
        let store = Arc::new(MemoryBorrowRecordStore::default());
        lent(&store, 1, -3).await;
        lent(&store, 2, 1).await;
        lent(&store, 3, 20).await;
        lent(&store, 4, -1).await;

        let checkpoint = Arc::new(MemoryCheckpoint::default());
        let sweeper = OverdueSweeper::new(store, checkpoint.clone(), notifier(), 2, 2);
        let (_tx, rx) = watch::channel(false);

        let report = sweeper.sweep_overdue(now(), &rx).await.unwrap();
        assert_eq!(report.overdue.iter().map(|r| r.id).collect::<Vec<_>>(), vec![1, 4]);
        assert_eq!(report.due_soon, 1);
        assert_eq!(report.notified, 3);
        assert!(!report.interrupted);
        assert_eq!(checkpoint.load().await.unwrap(), None);

        // reading only: a second pass sees the same records
        let again = sweeper.sweep_overdue(now(), &rx).await.unwrap();
        assert_eq!(again.overdue.len(), 2);
    }

    #[tokio::test]
    async fn test_interrupted_sweep_resumes_from_checkpoint() {
        let store = Arc::new(MemoryBorrowRecordStore::default());
        for id in 1..=5 {
            lent(&store, id, -1).await;
        }
        let checkpoint = Arc::new(MemoryCheckpoint::default());
        checkpoint.save(3).await.unwrap();

        let sweeper = OverdueSweeper::new(store, checkpoint.clone(), notifier(), 10, 2);
        let (_tx, rx) = watch::channel(false);
        let report = sweeper.sweep_overdue(now(), &rx).await.unwrap();

        assert_eq!(report.resumed_after, Some(3));
        assert_eq!(report.overdue.iter().map(|r| r.id).collect::<Vec<_>>(), vec![4, 5]);
        assert_eq!(checkpoint.load().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_shutdown_stops_before_next_record() {
        let store = Arc::new(MemoryBorrowRecordStore::default());
        lent(&store, 1, -1).await;
        lent(&store, 2, -1).await;

        let mut checkpoint = MockSweepCheckpoint::new();
        checkpoint.expect_load().returning(|| Ok(None));
        checkpoint.expect_clear().never();
        checkpoint.expect_save().returning(|_| Ok(()));

        let sweeper = OverdueSweeper::new(store, Arc::new(checkpoint), notifier(), 10, 2);
        let (tx, rx) = watch::channel(false);
        tx.send(true).unwrap();

        let report = sweeper.sweep_overdue(now(), &rx).await.unwrap();
        assert!(report.interrupted);
        assert!(report.overdue.is_empty());
    }

    #[tokio::test]
    async fn test_failed_notification_does_not_stop_the_batch() {
        let store = Arc::new(MemoryBorrowRecordStore::default());
        lent(&store, 1, -1).await;
        lent(&store, 2, -1).await;

        let mut gateway = MockNotificationGateway::new();
        gateway
            .expect_notify_overdue()
            .times(2)
            .returning(|id| if id == 1 { Err(AppError::Notification("bounced".into())) } else { Ok(()) });
        let notifier = Notifier::new(Arc::new(gateway), std::time::Duration::from_millis(200));

        let sweeper = OverdueSweeper::new(store, Arc::new(MemoryCheckpoint::default()), notifier, 10, 2);
        let (_tx, rx) = watch::channel(false);
        let report = sweeper.sweep_overdue(now(), &rx).await.unwrap();
        assert_eq!((report.notified, report.failed), (1, 1));
        assert_eq!(report.overdue.len(), 2);
    }
}
