//! Owner notifications
//!
//! Federation events the blog owner should see (new webmentions, likes,
//! boosts) are stored as rows and logged.

use std::sync::Arc;

use chrono::Utc;

use crate::data::{Database, Notification};
use crate::error::AppError;

#[derive(Clone)]
pub struct Notifier {
    db: Arc<Database>,
}

impl Notifier {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Store a notification. Failures are logged, never propagated.
    pub async fn notify(&self, text: &str) {
        tracing::info!(notification = text, "New notification");
        if let Err(error) = self.db.insert_notification(text, Utc::now().timestamp()).await {
            tracing::error!(%error, "Failed to store notification");
        }
    }

    /// Most recent notifications first.
    pub async fn recent(&self, limit: i64) -> Result<Vec<Notification>, AppError> {
        self.db.list_notifications(limit).await
    }
}
