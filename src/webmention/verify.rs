//! Webmention verification
//!
//! The `wm` worker fetches the target (must answer 200), fetches the
//! source (must link to the target) and fills the mention's title,
//! content and author from the source's h-entry.

use std::sync::Arc;

use super::fetch::{FetchedPage, LocalClient, fetch_external};
use super::parse::{MAX_CONTENT_CHARS, MAX_TITLE_CHARS, SourceDocument, truncate_chars};
use super::receive::MentionJob;
use crate::config::AppConfig;
use crate::data::{Database, Mention, MentionStatus, MentionUpdate, QueueItem};
use crate::error::AppError;
use crate::metrics::WEBMENTIONS_TOTAL;
use crate::notify::Notifier;
use crate::queue::Outcome;
use crate::urls::{is_local_url, is_public_or_short_url, normalize_local_url, same_url};

/// Result of checking one mention
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// Store the update
    Accept(MentionUpdate),
    /// Delete the mention
    Reject(String),
    /// Try again later
    Retry(String),
}

#[derive(Clone)]
pub struct MentionVerifier {
    config: Arc<AppConfig>,
    db: Arc<Database>,
    http_client: Arc<reqwest::Client>,
    local: LocalClient,
    notifier: Notifier,
}

impl MentionVerifier {
    pub fn new(
        config: Arc<AppConfig>,
        db: Arc<Database>,
        http_client: Arc<reqwest::Client>,
        local: LocalClient,
        notifier: Notifier,
    ) -> Self {
        Self {
            config,
            db,
            http_client,
            local,
            notifier,
        }
    }

    /// Handle one `wm` queue item.
    pub async fn handle_item(&self, item: &QueueItem) -> Outcome {
        let job: MentionJob = match serde_json::from_slice(&item.content) {
            Ok(job) => job,
            Err(error) => {
                tracing::error!(id = item.id, %error, "Undecodable mention job");
                return Outcome::Drop;
            }
        };

        match self.verify_stored(&job.source, &job.target).await {
            Ok(outcome) => outcome,
            Err(error) => {
                tracing::error!(source = %job.source, target = %job.target, %error, "Mention verification failed");
                Outcome::Retry
            }
        }
    }

    async fn verify_stored(&self, source: &str, target: &str) -> Result<Outcome, AppError> {
        let Some(mention) = self.db.find_mention(source, target).await? else {
            tracing::debug!(source, target, "Mention no longer stored");
            return Ok(Outcome::Done);
        };

        match self.check(&mention).await {
            Verdict::Accept(update) => {
                let previous = mention.status();
                self.db.update_verified_mention(mention.id, &update).await?;
                WEBMENTIONS_TOTAL.with_label_values(&["received", "verified"]).inc();
                tracing::info!(source = %mention.source, target = %update.target, "Verified webmention");

                if previous == Some(MentionStatus::New)
                    && update.status == Some(MentionStatus::Verified)
                {
                    self.notifier
                        .notify(&format!(
                            "New webmention from {} to {}",
                            mention.source, update.target
                        ))
                        .await;
                }
                Ok(Outcome::Done)
            }
            Verdict::Reject(reason) => {
                self.db.delete_mention(mention.id).await?;
                WEBMENTIONS_TOTAL.with_label_values(&["received", "rejected"]).inc();
                tracing::info!(source = %mention.source, target = %mention.target, reason, "Deleted unverifiable webmention");
                Ok(Outcome::Done)
            }
            Verdict::Retry(reason) => {
                tracing::warn!(source = %mention.source, target = %mention.target, reason, "Webmention verification will be retried");
                Ok(Outcome::Retry)
            }
        }
    }

    /// Decide what a mention becomes; does not touch the database.
    pub async fn check(&self, mention: &Mention) -> Verdict {
        let server = &self.config.server;

        let target_page = match self.local.get(&mention.target).await {
            Ok(page) => page,
            Err(error) => return Verdict::Retry(format!("target fetch failed: {}", error)),
        };
        if target_page.status != 200 {
            return Verdict::Reject(format!("target returned HTTP {}", target_page.status));
        }
        let new_target = Some(target_page.final_url.clone())
            .filter(|final_url| !same_url(final_url, &mention.target));

        let source_page = if is_public_or_short_url(server, &mention.source) {
            self.local.get(&mention.source).await
        } else {
            fetch_external(&self.http_client, &mention.source).await
        };
        let source_page = match source_page {
            Ok(page) => page,
            Err(error) => return Verdict::Retry(format!("source fetch failed: {}", error)),
        };
        if source_page.status >= 500 {
            return Verdict::Retry(format!("source returned HTTP {}", source_page.status));
        }
        if source_page.status != 200 {
            return Verdict::Reject(format!("source returned HTTP {}", source_page.status));
        }

        let document = parse_source(&source_page, &mention.source);
        let links_to = |wanted: &str| {
            document
                .links
                .iter()
                .any(|link| same_url(&normalize_local_url(server, link), wanted))
        };
        if !links_to(&mention.target) && !new_target.as_deref().is_some_and(links_to) {
            return Verdict::Reject("source does not link to target".to_string());
        }

        let entry = document
            .entry_for(&mention.source)
            .or_else(|| document.entry_for(&source_page.final_url));
        let mut title = entry.and_then(|e| e.name.clone()).unwrap_or_default();
        let content = entry.and_then(|e| e.content.clone()).unwrap_or_default();
        let author = entry.and_then(|e| e.author.clone()).unwrap_or_default();
        if title.is_empty() && content.is_empty() {
            title = document.title.clone().unwrap_or_default();
        }

        let status = if is_local_url(server, &mention.source)
            || mention.status() == Some(MentionStatus::Approved)
        {
            MentionStatus::Approved
        } else {
            MentionStatus::Verified
        };

        Verdict::Accept(MentionUpdate {
            target: new_target.unwrap_or_else(|| mention.target.clone()),
            title: truncate_chars(&title, MAX_TITLE_CHARS),
            content: truncate_chars(&content, MAX_CONTENT_CHARS),
            author,
            status: Some(status),
        })
    }
}

fn parse_source(page: &FetchedPage, source: &str) -> SourceDocument {
    let base = if page.final_url.is_empty() {
        source
    } else {
        page.final_url.as_str()
    };
    SourceDocument::parse(&page.text(), base)
}
