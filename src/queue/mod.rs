//! Persistent named work queue
//!
//! Rows live in the `queue` table; the payload is opaque bytes whose
//! meaning belongs to the worker bound to the queue name. Enqueue wakes
//! idle workers through a shared [`Notify`] so they don't wait a full
//! poll interval.

mod worker;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Notify;

use crate::data::{Database, QueueItem};
use crate::error::AppError;

pub use worker::{MAX_ATTEMPTS, Outcome, next_backoff, run_worker};

/// Queue of outbound ActivityPub deliveries
pub const AP_SEND_QUEUE: &str = "ap_send";
/// Queue of incoming webmentions waiting for verification
pub const WEBMENTION_QUEUE: &str = "wm";
/// Queue of outgoing webmentions
pub const WEBMENTION_SEND_QUEUE: &str = "wm_send";

/// Handle over the queue table, cheap to clone.
#[derive(Clone)]
pub struct Queue {
    db: Arc<Database>,
    notify: Arc<Notify>,
}

impl Queue {
    pub fn new(db: Arc<Database>) -> Self {
        Self {
            db,
            notify: Arc::new(Notify::new()),
        }
    }

    /// Commit `payload` under `name`, due at `at`.
    pub async fn enqueue(
        &self,
        name: &str,
        payload: &[u8],
        at: DateTime<Utc>,
    ) -> Result<i64, AppError> {
        let id = self.db.enqueue(name, payload, at).await?;
        tracing::debug!(queue = name, id, scheduled_at = %at, "Enqueued item");
        self.notify.notify_waiters();
        Ok(id)
    }

    /// Commit `payload` under `name`, due now.
    pub async fn enqueue_now(&self, name: &str, payload: &[u8]) -> Result<i64, AppError> {
        self.enqueue(name, payload, Utc::now()).await
    }

    /// Earliest due item for `name`, if any.
    pub async fn peek(&self, name: &str) -> Result<Option<QueueItem>, AppError> {
        self.db.peek_queue(name, Utc::now()).await
    }

    /// Push the item back by `delay` and count the attempt.
    pub async fn reschedule(&self, item: &QueueItem, delay: Duration) -> Result<(), AppError> {
        let delay = chrono::Duration::from_std(delay)
            .map_err(|e| AppError::Internal(anyhow::anyhow!("invalid delay: {}", e)))?;
        self.db
            .reschedule_queue_item(item.id, Utc::now() + delay)
            .await
    }

    pub async fn dequeue(&self, item: &QueueItem) -> Result<(), AppError> {
        self.db.dequeue(item.id).await
    }

    /// All items of `name` in delivery order, due or not.
    pub async fn items(&self, name: &str) -> Result<Vec<QueueItem>, AppError> {
        self.db.list_queue(name).await
    }

    pub(crate) fn notified(&self) -> tokio::sync::futures::Notified<'_> {
        self.notify.notified()
    }
}
