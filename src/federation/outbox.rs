//! Outbound federation
//!
//! Turns post lifecycle events into activities and fans them out to the
//! follower inboxes of the owning blog. Every send goes through the
//! `ap_send` queue; nothing here talks to remote servers directly.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde_json::Value;

use super::delivery::{SendRequest, enqueue_send};
use super::serializer::{announce_activity, delete_activity, post_activity, reply_link};
use crate::config::AppConfig;
use crate::data::{Database, Post};
use crate::error::AppError;
use crate::queue::Queue;
use crate::webmention::WebmentionSender;

/// Delay between a reply's Create and its Announce
pub const ANNOUNCE_DELAY_SECS: i64 = 30;

/// Federation orchestrator for local posts
#[derive(Clone)]
pub struct Outbox {
    config: Arc<AppConfig>,
    db: Arc<Database>,
    queue: Queue,
    webmentions: WebmentionSender,
}

impl Outbox {
    pub fn new(
        config: Arc<AppConfig>,
        db: Arc<Database>,
        queue: Queue,
        webmentions: WebmentionSender,
    ) -> Self {
        Self {
            config,
            db,
            queue,
            webmentions,
        }
    }

    fn federates(&self, post: &Post) -> bool {
        self.config.activitypub.enabled && post.is_published() && post.is_public()
    }

    fn blog_iri(&self, post: &Post) -> Result<String, AppError> {
        self.config.blog_iri(&post.blog).ok_or_else(|| {
            AppError::Validation(format!("Post {} belongs to unknown blog {}", post.path, post.blog))
        })
    }

    /// Send `Create` for a newly published post; replies are also
    /// announced a little later.
    pub async fn publish_post(&self, post: &Post) -> Result<(), AppError> {
        if !self.federates(post) {
            return Ok(());
        }

        let blog_iri = self.blog_iri(post)?;
        let create = post_activity(&self.config, "Create", &blog_iri, post);
        let queued = self
            .send_to_all_followers(&post.blog, &blog_iri, &create, Utc::now())
            .await?;
        tracing::info!(blog = %post.blog, path = %post.path, inboxes = queued, "Published post");

        if reply_link(post).is_some() {
            self.announce_reply(post, Utc::now() + Duration::seconds(ANNOUNCE_DELAY_SECS))
                .await?;
        }
        Ok(())
    }

    /// Send `Update` with the refreshed object.
    pub async fn update_post(&self, post: &Post) -> Result<(), AppError> {
        if !self.federates(post) {
            return Ok(());
        }

        let blog_iri = self.blog_iri(post)?;
        let update = post_activity(&self.config, "Update", &blog_iri, post);
        let queued = self
            .send_to_all_followers(&post.blog, &blog_iri, &update, Utc::now())
            .await?;
        tracing::info!(blog = %post.blog, path = %post.path, inboxes = queued, "Updated post");
        Ok(())
    }

    /// Send `Delete` with a Tombstone object.
    pub async fn delete_post(&self, post: &Post) -> Result<(), AppError> {
        if !self.config.activitypub.enabled {
            return Ok(());
        }

        let blog_iri = self.blog_iri(post)?;
        let delete = delete_activity(&self.config, &blog_iri, post);
        let queued = self
            .send_to_all_followers(&post.blog, &blog_iri, &delete, Utc::now())
            .await?;
        tracing::info!(blog = %post.blog, path = %post.path, inboxes = queued, "Deleted post");
        Ok(())
    }

    /// Send `Announce` of the post, due at `at`.
    pub async fn announce_reply(&self, post: &Post, at: DateTime<Utc>) -> Result<(), AppError> {
        if !self.federates(post) {
            return Ok(());
        }

        let blog_iri = self.blog_iri(post)?;
        let announce = announce_activity(&self.config, &blog_iri, post);
        self.send_to_all_followers(&post.blog, &blog_iri, &announce, at)
            .await?;
        Ok(())
    }

    /// Queue one signed send per distinct follower inbox of `blog`.
    pub async fn send_to_all_followers(
        &self,
        blog: &str,
        blog_iri: &str,
        activity: &Value,
        at: DateTime<Utc>,
    ) -> Result<usize, AppError> {
        let inboxes = self.db.follower_inboxes(blog).await?;
        for inbox in &inboxes {
            let request = SendRequest {
                inbox: inbox.clone(),
                blog_iri: blog_iri.to_string(),
                activity: activity.clone(),
                target_actor: None,
            };
            enqueue_send(&self.queue, &request, at).await?;
        }
        Ok(inboxes.len())
    }

    /// Queue webmentions for every link of a published post.
    pub async fn queue_webmentions_for_post(&self, post: &Post) -> Result<usize, AppError> {
        if !post.is_published() {
            return Ok(0);
        }
        self.webmentions.queue_for_post(post).await
    }

    /// Queue webmentions for links that a changed or removed post used
    /// to carry.
    pub async fn queue_webmentions_for_links(
        &self,
        source: &str,
        links: &[String],
    ) -> Result<usize, AppError> {
        self.webmentions.queue_for_links(source, links).await
    }

    /// Sender handed to the `wm_send` worker.
    pub fn webmention_sender(&self) -> &WebmentionSender {
        &self.webmentions
    }
}
