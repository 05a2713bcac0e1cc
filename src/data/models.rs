//! Data models
//!
//! Rust structs representing database rows.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// =============================================================================
// ID Types
// =============================================================================

/// Entity ID wrapper (ULID format, 26 characters)
///
/// Used for activity fragments such as `#accept-<id>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(pub String);

impl EntityId {
    /// Generate a new ULID
    pub fn new() -> Self {
        Self(ulid::Ulid::new().to_string().to_ascii_lowercase())
    }
}

impl Default for EntityId {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Followers
// =============================================================================

/// A remote actor following one of the blogs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Follower {
    pub blog: String,
    /// Actor IRI
    #[sqlx(rename = "follower")]
    pub actor: String,
    /// Shared inbox when advertised, else the personal inbox
    pub inbox: String,
    /// `@user@host`
    pub username: String,
}

// =============================================================================
// Webmentions
// =============================================================================

/// Lifecycle state of a mention
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MentionStatus {
    New,
    Renew,
    Verified,
    Approved,
}

impl MentionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MentionStatus::New => "new",
            MentionStatus::Renew => "renew",
            MentionStatus::Verified => "verified",
            MentionStatus::Approved => "approved",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "new" => Some(MentionStatus::New),
            "renew" => Some(MentionStatus::Renew),
            "verified" => Some(MentionStatus::Verified),
            "approved" => Some(MentionStatus::Approved),
            _ => None,
        }
    }
}

/// Stored webmention
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Mention {
    pub id: i64,
    pub source: String,
    pub target: String,
    /// Unix seconds
    pub created: i64,
    pub title: String,
    pub content: String,
    pub author: String,
    pub status: String,
}

impl Mention {
    pub fn status(&self) -> Option<MentionStatus> {
        MentionStatus::parse(&self.status)
    }
}

/// Metadata extracted during verification, written back in one update
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MentionUpdate {
    pub target: String,
    pub title: String,
    pub content: String,
    pub author: String,
    pub status: Option<MentionStatus>,
}

// =============================================================================
// Queue
// =============================================================================

/// A durable unit of work
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct QueueItem {
    pub id: i64,
    pub name: String,
    pub content: Vec<u8>,
    /// Unix milliseconds
    pub scheduled_at: i64,
    pub attempts: i64,
}

// =============================================================================
// Posts (read interface of the post store)
// =============================================================================

pub const POST_STATUS_PUBLISHED: &str = "published";
pub const POST_VISIBILITY_PUBLIC: &str = "public";

/// A post and its multi-valued parameters
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Post {
    pub path: String,
    /// Derived from the path when empty
    #[serde(default)]
    pub blog: String,
    #[serde(default)]
    pub section: String,
    #[serde(default = "default_post_status")]
    pub status: String,
    #[serde(default = "default_post_visibility")]
    pub visibility: String,
    #[serde(default)]
    pub published: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated: Option<DateTime<Utc>>,
    #[serde(default)]
    pub parameters: BTreeMap<String, Vec<String>>,
}

fn default_post_status() -> String {
    POST_STATUS_PUBLISHED.to_string()
}

fn default_post_visibility() -> String {
    POST_VISIBILITY_PUBLIC.to_string()
}

impl Post {
    /// First value of a parameter, if any non-empty one exists.
    pub fn first_parameter(&self, name: &str) -> Option<&str> {
        self.parameters
            .get(name)
            .and_then(|values| values.iter().find(|v| !v.trim().is_empty()))
            .map(String::as_str)
    }

    /// All non-empty values of a parameter.
    pub fn parameter_values(&self, name: &str) -> impl Iterator<Item = &str> {
        self.parameters
            .get(name)
            .into_iter()
            .flatten()
            .map(String::as_str)
            .filter(|v| !v.trim().is_empty())
    }

    pub fn title(&self) -> Option<&str> {
        self.first_parameter("title")
    }

    /// Rendered HTML body
    pub fn content(&self) -> &str {
        self.first_parameter("content").unwrap_or_default()
    }

    pub fn is_published(&self) -> bool {
        self.status == POST_STATUS_PUBLISHED
    }

    pub fn is_public(&self) -> bool {
        self.visibility == POST_VISIBILITY_PUBLIC
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub(crate) struct PostRow {
    pub path: String,
    pub blog: String,
    pub section: String,
    pub status: String,
    pub visibility: String,
    pub published: Option<DateTime<Utc>>,
    pub updated: Option<DateTime<Utc>>,
}

// =============================================================================
// Notifications
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Notification {
    pub id: i64,
    /// Unix seconds
    pub created: i64,
    pub text: String,
}
