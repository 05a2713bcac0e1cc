//! Webmention intake

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::config::AppConfig;
use crate::data::{Database, Mention};
use crate::error::AppError;
use crate::metrics::WEBMENTIONS_TOTAL;
use crate::queue::{Queue, WEBMENTION_QUEUE};
use crate::urls::{is_absolute_http_url, is_local_url, normalize_local_url, same_url};

/// Payload of a `wm` queue item
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MentionJob {
    pub source: String,
    pub target: String,
}

/// Store a mention as `new` (or `renew`) and queue its verification.
///
/// The target must be a page of this site; alt-domain targets are
/// rewritten to the main public address.
pub async fn queue_mention(
    config: &AppConfig,
    db: &Database,
    queue: &Queue,
    source: &str,
    target: &str,
) -> Result<Mention, AppError> {
    let source = source.trim();
    let target = target.trim();

    if !is_absolute_http_url(source) || !is_absolute_http_url(target) {
        return Err(AppError::Validation(
            "source and target must be absolute http(s) URLs".to_string(),
        ));
    }
    if !is_local_url(&config.server, target) {
        return Err(AppError::Validation("target is not on this site".to_string()));
    }
    let target = normalize_local_url(&config.server, target);
    if same_url(source, &target) {
        return Err(AppError::Validation("source and target are the same".to_string()));
    }

    let mention = db
        .upsert_incoming_mention(source, &target, Utc::now().timestamp())
        .await?;
    enqueue_verification(queue, &mention).await?;

    WEBMENTIONS_TOTAL.with_label_values(&["received", "queued"]).inc();
    tracing::info!(source = %mention.source, target = %mention.target, status = %mention.status, "Queued webmention");
    Ok(mention)
}

/// Queue a verification run for a stored mention.
pub async fn enqueue_verification(queue: &Queue, mention: &Mention) -> Result<i64, AppError> {
    let job = MentionJob {
        source: mention.source.clone(),
        target: mention.target.clone(),
    };
    let payload = serde_json::to_vec(&job)
        .map_err(|e| AppError::Internal(anyhow::anyhow!("Failed to encode mention job: {}", e)))?;
    queue.enqueue_now(WEBMENTION_QUEUE, &payload).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::valid_config;
    use crate::data::MentionStatus;
    use std::sync::Arc;
    use tempfile::TempDir;

    async fn setup() -> (Arc<Database>, Queue, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let db = Arc::new(
            Database::connect(&temp_dir.path().join("receive.db"))
                .await
                .unwrap(),
        );
        let queue = Queue::new(db.clone());
        (db, queue, temp_dir)
    }

    #[tokio::test]
    async fn mention_is_stored_and_queued() {
        let (db, queue, _dir) = setup().await;
        let config = valid_config();

        let mention = queue_mention(
            &config,
            &db,
            &queue,
            "https://src.example/post",
            "https://old.example.com/notes/p",
        )
        .await
        .unwrap();

        assert_eq!(mention.target, "https://blog.example.com/notes/p");
        assert_eq!(mention.status(), Some(MentionStatus::New));

        let items = queue.items(WEBMENTION_QUEUE).await.unwrap();
        let job: MentionJob = serde_json::from_slice(&items[0].content).unwrap();
        assert_eq!(job.target, "https://blog.example.com/notes/p");
    }

    #[tokio::test]
    async fn foreign_or_self_targets_are_rejected() {
        let (db, queue, _dir) = setup().await;
        let config = valid_config();

        for (source, target) in [
            ("https://src.example/post", "https://elsewhere.example/p"),
            ("https://blog.example.com/p", "https://blog.example.com/p"),
            ("ftp://src.example/post", "https://blog.example.com/p"),
            ("not a url", "https://blog.example.com/p"),
        ] {
            assert!(matches!(
                queue_mention(&config, &db, &queue, source, target).await,
                Err(AppError::Validation(_))
            ));
        }
        assert!(queue.items(WEBMENTION_QUEUE).await.unwrap().is_empty());
    }
}
