//! Activity processing
//!
//! Handles activities POSTed to a blog inbox: signature check against the
//! signing actor, then dispatch by type. Unknown types are accepted and
//! ignored so remote servers don't retry them.

use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;

use super::actor::{ActorFetch, ActorResolver, RemoteActor};
use super::delivery::{SendRequest, enqueue_send};
use super::serializer::accept_activity;
use super::signature::{extract_signature_key_id, key_id_actor, verify_signature};
use crate::config::AppConfig;
use crate::data::Database;
use crate::error::AppError;
use crate::metrics::{ACTIVITYPUB_ACTIVITIES_RECEIVED, FOLLOWERS_TOTAL};
use crate::notify::Notifier;
use crate::queue::Queue;
use crate::urls::is_local_url;
use crate::webmention::{extract_links, queue_mention};

/// ActivityPub activity types handled by the inbox
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivityType {
    Follow,
    Undo,
    Create,
    Update,
    Delete,
    Block,
    Like,
    Announce,
    Accept,
    Reject,
}

impl ActivityType {
    /// Parse activity type from string
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "Follow" => Some(Self::Follow),
            "Undo" => Some(Self::Undo),
            "Create" => Some(Self::Create),
            "Update" => Some(Self::Update),
            "Delete" => Some(Self::Delete),
            "Block" => Some(Self::Block),
            "Like" => Some(Self::Like),
            "Announce" => Some(Self::Announce),
            "Accept" => Some(Self::Accept),
            "Reject" => Some(Self::Reject),
            _ => None,
        }
    }
}

/// Identity behind an inbound request
#[derive(Debug, Clone)]
pub enum Signer {
    /// Signature verified
    Verified(RemoteActor),
    /// The signing actor is gone (404/410); nothing to process
    Gone(String),
}

/// `id` of a JSON value that is either an IRI string or an object.
fn value_id(value: Option<&Value>) -> Option<&str> {
    match value? {
        Value::String(s) => Some(s.as_str()),
        Value::Object(map) => map.get("id").and_then(|id| id.as_str()),
        _ => None,
    }
}

fn str_field<'a>(value: &'a Value, key: &str) -> Option<&'a str> {
    value.get(key).and_then(|v| v.as_str())
}

const ACTOR_TYPES: &[&str] = &["Person", "Service", "Application", "Group", "Organization"];

/// Activity processor
///
/// Shared by every inbox request; all state lives in the database.
#[derive(Clone)]
pub struct ActivityProcessor {
    config: Arc<AppConfig>,
    db: Arc<Database>,
    queue: Queue,
    resolver: Arc<ActorResolver>,
    notifier: Notifier,
}

impl ActivityProcessor {
    pub fn new(
        config: Arc<AppConfig>,
        db: Arc<Database>,
        queue: Queue,
        resolver: Arc<ActorResolver>,
        notifier: Notifier,
    ) -> Self {
        Self {
            config,
            db,
            queue,
            resolver,
            notifier,
        }
    }

    /// Accept one inbox POST for `blog`.
    ///
    /// # Errors
    /// - `NotFound` for an unknown blog
    /// - `Validation` for malformed JSON
    /// - `InvalidSignature` when the signature does not verify
    /// - `Forbidden` when the signer is not `activity.actor`
    pub async fn accept_inbox(
        &self,
        blog: &str,
        method: &str,
        path_and_query: &str,
        headers: &http::HeaderMap,
        body: &[u8],
    ) -> Result<(), AppError> {
        if self.config.blog(blog).is_none() {
            return Err(AppError::NotFound);
        }

        let activity: Value = serde_json::from_slice(body)?;
        if !activity.is_object() {
            return Err(AppError::Validation("Activity must be a JSON object".to_string()));
        }

        let signer = match self.verify_request(method, path_and_query, headers, body).await? {
            Signer::Verified(actor) => actor,
            Signer::Gone(actor_iri) => {
                let removed = self.db.remove_follower_everywhere(&actor_iri).await?;
                self.refresh_follower_gauge().await;
                tracing::info!(blog, actor = %actor_iri, removed, "Signing actor is gone, removed follower");
                return Ok(());
            }
        };

        let actor_id = value_id(activity.get("actor"))
            .ok_or_else(|| AppError::Validation("Activity has no actor".to_string()))?;
        if actor_id != signer.id {
            tracing::warn!(blog, actor = actor_id, signer = %signer.id, "Activity actor does not match signer");
            return Err(AppError::Forbidden);
        }

        self.process(blog, &activity, &signer).await
    }

    /// Resolve the signing key and verify the request signature.
    pub async fn verify_request(
        &self,
        method: &str,
        path_and_query: &str,
        headers: &http::HeaderMap,
        body: &[u8],
    ) -> Result<Signer, AppError> {
        let key_id = extract_signature_key_id(headers)?;
        let cached = self.resolver.is_cached(&key_id).await;

        match self
            .verify_with_actor(&key_id, method, path_and_query, headers, body)
            .await
        {
            // The actor may have rotated its key since it was cached.
            Err(AppError::InvalidSignature(reason)) if cached => {
                tracing::debug!(key_id = %key_id, reason, "Signature failed against cached actor, refetching");
                self.resolver.invalidate(&key_id).await;
                self.verify_with_actor(&key_id, method, path_and_query, headers, body)
                    .await
            }
            result => result,
        }
    }

    async fn verify_with_actor(
        &self,
        key_id: &str,
        method: &str,
        path_and_query: &str,
        headers: &http::HeaderMap,
        body: &[u8],
    ) -> Result<Signer, AppError> {
        let actor = match self.resolver.fetch(key_id).await? {
            ActorFetch::Found(actor) => actor,
            fetch if fetch.is_gone() => {
                return Ok(Signer::Gone(key_id_actor(key_id).to_string()));
            }
            ActorFetch::Status(status) => {
                return Err(AppError::InvalidSignature(format!(
                    "Could not fetch signing actor: HTTP {}",
                    status
                )));
            }
        };

        if key_id.contains('#') && actor.public_key_id.as_deref() != Some(key_id) {
            return Err(AppError::InvalidSignature(
                "Signature keyId does not match actor public key id".to_string(),
            ));
        }
        let public_key_pem = actor
            .public_key_pem
            .as_deref()
            .ok_or_else(|| AppError::InvalidSignature("Actor has no public key".to_string()))?;

        verify_signature(method, path_and_query, headers, body, public_key_pem)?;
        Ok(Signer::Verified(actor))
    }

    /// Dispatch a verified activity.
    pub async fn process(&self, blog: &str, activity: &Value, signer: &RemoteActor) -> Result<(), AppError> {
        let type_name = str_field(activity, "type").unwrap_or("Unknown");
        ACTIVITYPUB_ACTIVITIES_RECEIVED
            .with_label_values(&[type_name])
            .inc();

        let Some(activity_type) = ActivityType::parse(type_name) else {
            tracing::debug!(blog, activity_type = type_name, "Ignoring unsupported activity");
            return Ok(());
        };

        match activity_type {
            ActivityType::Follow => self.handle_follow(blog, activity, signer).await,
            ActivityType::Undo => self.handle_undo(blog, activity, signer).await,
            ActivityType::Create => self.handle_create(blog, activity).await,
            ActivityType::Update => self.handle_update(blog, activity, signer).await,
            ActivityType::Block => self.handle_block(blog, activity, signer).await,
            ActivityType::Like | ActivityType::Announce => {
                self.handle_reaction(activity_type, activity, signer).await;
                Ok(())
            }
            ActivityType::Delete | ActivityType::Accept | ActivityType::Reject => {
                tracing::debug!(blog, activity_type = type_name, actor = %signer.id, "Ignoring activity");
                Ok(())
            }
        }
    }

    async fn handle_follow(&self, blog: &str, activity: &Value, follower: &RemoteActor) -> Result<(), AppError> {
        let object = value_id(activity.get("object"))
            .ok_or_else(|| AppError::Validation("Follow has no object".to_string()))?;
        if object == follower.id {
            return Err(AppError::Validation("Actor cannot follow itself".to_string()));
        }

        let inbox = follower
            .delivery_inbox()
            .ok_or_else(|| AppError::Validation(format!("Actor {} has no inbox", follower.id)))?;
        let username = follower.username();
        self.db
            .upsert_follower(blog, &follower.id, inbox, &username)
            .await?;
        self.refresh_follower_gauge().await;

        let blog_iri = self.config.blog_iri(blog).ok_or(AppError::NotFound)?;
        let accept = SendRequest {
            inbox: follower.inbox.clone().unwrap_or_else(|| inbox.to_string()),
            blog_iri: blog_iri.clone(),
            activity: accept_activity(&blog_iri, activity),
            target_actor: Some(follower.id.clone()),
        };
        enqueue_send(&self.queue, &accept, Utc::now()).await?;

        tracing::info!(blog, actor = %follower.id, inbox, "New follower");
        self.notifier
            .notify(&format!("{} ({}) followed {}", username, follower.id, blog))
            .await;
        Ok(())
    }

    async fn handle_undo(&self, blog: &str, activity: &Value, actor: &RemoteActor) -> Result<(), AppError> {
        let Some(object) = activity.get("object").filter(|o| o.is_object()) else {
            return Ok(());
        };
        if str_field(object, "type") != Some("Follow") {
            return Ok(());
        }
        if value_id(object.get("actor")) != Some(actor.id.as_str()) {
            tracing::debug!(blog, actor = %actor.id, "Ignoring Undo of someone else's Follow");
            return Ok(());
        }

        if self.db.remove_follower(blog, &actor.id).await? {
            self.refresh_follower_gauge().await;
            tracing::info!(blog, actor = %actor.id, "Follower removed");
        }
        Ok(())
    }

    async fn handle_block(&self, blog: &str, activity: &Value, actor: &RemoteActor) -> Result<(), AppError> {
        let Some(object) = value_id(activity.get("object")) else {
            return Ok(());
        };
        if object != actor.id && !is_local_url(&self.config.server, object) {
            return Ok(());
        }

        if self.db.remove_follower(blog, &actor.id).await? {
            self.refresh_follower_gauge().await;
            tracing::info!(blog, actor = %actor.id, "Follower removed after Block");
        }
        Ok(())
    }

    /// Replies and mentions become incoming webmentions.
    async fn handle_create(&self, blog: &str, activity: &Value) -> Result<(), AppError> {
        let Some(object) = activity.get("object").filter(|o| o.is_object()) else {
            return Ok(());
        };
        let Some(source) = str_field(object, "id") else {
            return Ok(());
        };
        if self.config.webmention.disable_receiving {
            return Ok(());
        }

        let reply_target = value_id(object.get("inReplyTo"))
            .filter(|target| is_local_url(&self.config.server, target));
        let targets: Vec<String> = match reply_target {
            Some(target) => vec![target.to_string()],
            None => str_field(object, "content")
                .map(|content| extract_links(content, source))
                .unwrap_or_default()
                .into_iter()
                .filter(|link| is_local_url(&self.config.server, link))
                .collect(),
        };

        for target in targets {
            if let Err(error) =
                queue_mention(&self.config, &self.db, &self.queue, source, &target).await
            {
                tracing::debug!(blog, source, target = %target, %error, "Activity not recorded as mention");
            }
        }
        Ok(())
    }

    /// Actor updates refresh the follower row; object updates are
    /// treated like Create.
    async fn handle_update(&self, blog: &str, activity: &Value, actor: &RemoteActor) -> Result<(), AppError> {
        let Some(object) = activity.get("object") else {
            return Ok(());
        };
        let is_actor_update = value_id(Some(object)) == Some(actor.id.as_str())
            || str_field(object, "type").is_some_and(|t| ACTOR_TYPES.contains(&t));
        if !is_actor_update {
            return self.handle_create(blog, activity).await;
        }

        self.resolver.invalidate(&actor.id).await;
        let ActorFetch::Found(refreshed) = self.resolver.fetch(&actor.id).await? else {
            return Ok(());
        };
        let Some(inbox) = refreshed.delivery_inbox() else {
            return Ok(());
        };

        for (blog_name, _) in &self.config.blogs {
            if self.db.get_follower(blog_name, &refreshed.id).await?.is_some() {
                self.db
                    .upsert_follower(blog_name, &refreshed.id, inbox, &refreshed.username())
                    .await?;
            }
        }
        tracing::info!(blog, actor = %refreshed.id, "Refreshed follower from actor Update");
        Ok(())
    }

    async fn handle_reaction(&self, kind: ActivityType, activity: &Value, actor: &RemoteActor) {
        let Some(object) = value_id(activity.get("object")) else {
            return;
        };
        if !is_local_url(&self.config.server, object) {
            return;
        }

        let verb = match kind {
            ActivityType::Like => "liked",
            _ => "boosted",
        };
        self.notifier
            .notify(&format!("{} ({}) {} {}", actor.username(), actor.id, verb, object))
            .await;
    }

    async fn refresh_follower_gauge(&self) {
        match self.db.count_followers().await {
            Ok(count) => FOLLOWERS_TOTAL.set(count),
            Err(error) => tracing::warn!(%error, "Failed to count followers"),
        }
    }
}
