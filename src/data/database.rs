//! SQLite database operations
//!
//! All database access goes through this module.
//! The database is the single serialization point between request
//! handlers and queue workers; uniqueness constraints back every upsert.

use chrono::{DateTime, Utc};
use sqlx::{Pool, Sqlite, SqlitePool};
use std::collections::BTreeMap;
use std::path::Path;

use super::models::*;
use crate::error::AppError;
use crate::urls::unescape;

/// Database connection pool wrapper.
pub struct Database {
    pool: Pool<Sqlite>,
}

impl Database {
    /// Open (or create) the SQLite file at `path` and apply migrations.
    pub async fn connect(path: &Path) -> Result<Self, AppError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| AppError::Database(sqlx::Error::Io(e)))?;
        }

        let connection_string = format!("sqlite:{}?mode=rwc", path.display());
        let pool = SqlitePool::connect(&connection_string).await?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| {
                tracing::error!("Migration failed: {}", e);
                AppError::Internal(anyhow::anyhow!("Migration failed: {}", e))
            })?;

        tracing::info!(path = %path.display(), "Database connected and migrated successfully");

        Ok(Self { pool })
    }

    // =========================================================================
    // Persistent cache (key/value)
    // =========================================================================

    pub async fn cache_get(&self, key: &str) -> Result<Option<Vec<u8>>, AppError> {
        let value =
            sqlx::query_scalar::<_, Vec<u8>>("SELECT value FROM persistent_cache WHERE key = ?")
                .bind(key)
                .fetch_optional(&self.pool)
                .await?;

        Ok(value)
    }

    pub async fn cache_set(&self, key: &str, value: &[u8]) -> Result<(), AppError> {
        sqlx::query(
            "INSERT INTO persistent_cache (key, value) VALUES (?, ?) \
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Insert only when the key is absent. Returns whether this call wrote it.
    pub async fn cache_set_if_absent(&self, key: &str, value: &[u8]) -> Result<bool, AppError> {
        let result = sqlx::query("INSERT OR IGNORE INTO persistent_cache (key, value) VALUES (?, ?)")
            .bind(key)
            .bind(value)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    // =========================================================================
    // Followers
    // =========================================================================

    /// Insert or refresh a follower of `blog`.
    pub async fn upsert_follower(
        &self,
        blog: &str,
        actor: &str,
        inbox: &str,
        username: &str,
    ) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO activitypub_followers (blog, follower, inbox, username)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(blog, follower) DO UPDATE SET
                inbox = excluded.inbox,
                username = excluded.username
            "#,
        )
        .bind(blog)
        .bind(actor)
        .bind(inbox)
        .bind(username)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn get_follower(&self, blog: &str, actor: &str) -> Result<Option<Follower>, AppError> {
        let follower = sqlx::query_as::<_, Follower>(
            "SELECT blog, follower, inbox, username FROM activitypub_followers WHERE blog = ? AND follower = ?",
        )
        .bind(blog)
        .bind(actor)
        .fetch_optional(&self.pool)
        .await?;

        Ok(follower)
    }

    /// Remove one follower of one blog. Returns whether a row was deleted.
    pub async fn remove_follower(&self, blog: &str, actor: &str) -> Result<bool, AppError> {
        let result =
            sqlx::query("DELETE FROM activitypub_followers WHERE blog = ? AND follower = ?")
                .bind(blog)
                .bind(actor)
                .execute(&self.pool)
                .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Remove an actor from the followers of every blog.
    pub async fn remove_follower_everywhere(&self, actor: &str) -> Result<u64, AppError> {
        let result = sqlx::query("DELETE FROM activitypub_followers WHERE follower = ?")
            .bind(actor)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }

    /// Remove every follower (all blogs) that receives activities at `inbox`.
    pub async fn remove_followers_by_inbox(&self, inbox: &str) -> Result<u64, AppError> {
        let result = sqlx::query("DELETE FROM activitypub_followers WHERE inbox = ?")
            .bind(inbox)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }

    pub async fn list_followers(&self, blog: &str) -> Result<Vec<Follower>, AppError> {
        let followers = sqlx::query_as::<_, Follower>(
            "SELECT blog, follower, inbox, username FROM activitypub_followers WHERE blog = ? ORDER BY username, follower",
        )
        .bind(blog)
        .fetch_all(&self.pool)
        .await?;

        Ok(followers)
    }

    /// Distinct inboxes of a blog's followers, in a stable order.
    pub async fn follower_inboxes(&self, blog: &str) -> Result<Vec<String>, AppError> {
        let inboxes = sqlx::query_scalar::<_, String>(
            "SELECT DISTINCT inbox FROM activitypub_followers WHERE blog = ? ORDER BY inbox",
        )
        .bind(blog)
        .fetch_all(&self.pool)
        .await?;

        Ok(inboxes)
    }

    pub async fn count_followers(&self) -> Result<i64, AppError> {
        let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM activitypub_followers")
            .fetch_one(&self.pool)
            .await?;

        Ok(count)
    }

    // =========================================================================
    // Webmentions
    // =========================================================================

    /// Record an incoming (source, target) pair.
    ///
    /// A new pair is inserted as `new`. A repeated pair keeps its row; a
    /// `new` row becomes `renew` and every repeat refreshes `created`.
    /// Matching is case-insensitive on the percent-decoded URLs.
    pub async fn upsert_incoming_mention(
        &self,
        source: &str,
        target: &str,
        created: i64,
    ) -> Result<Mention, AppError> {
        let source = unescape(source);
        let target = unescape(target);

        let mut conn = self.pool.acquire().await?;
        sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await?;

        let result: Result<i64, AppError> = async {
            let existing = sqlx::query_as::<_, Mention>(
                "SELECT * FROM webmentions WHERE lower(source) = lower(?) AND lower(target) = lower(?)",
            )
            .bind(&source)
            .bind(&target)
            .fetch_optional(&mut *conn)
            .await?;

            match existing {
                Some(mention) => {
                    let status = if mention.status == MentionStatus::New.as_str() {
                        MentionStatus::Renew.as_str()
                    } else {
                        mention.status.as_str()
                    };
                    sqlx::query("UPDATE webmentions SET created = ?, status = ? WHERE id = ?")
                        .bind(created)
                        .bind(status)
                        .bind(mention.id)
                        .execute(&mut *conn)
                        .await?;
                    Ok(mention.id)
                }
                None => {
                    let inserted = sqlx::query(
                        "INSERT INTO webmentions (source, target, created, status) VALUES (?, ?, ?, ?)",
                    )
                    .bind(&source)
                    .bind(&target)
                    .bind(created)
                    .bind(MentionStatus::New.as_str())
                    .execute(&mut *conn)
                    .await?;
                    Ok(inserted.last_insert_rowid())
                }
            }
        }
        .await;

        let id = match result {
            Ok(id) => {
                sqlx::query("COMMIT").execute(&mut *conn).await?;
                id
            }
            Err(error) => {
                let _ = sqlx::query("ROLLBACK").execute(&mut *conn).await;
                return Err(error);
            }
        };
        drop(conn);

        self.get_mention(id).await?.ok_or(AppError::NotFound)
    }

    pub async fn get_mention(&self, id: i64) -> Result<Option<Mention>, AppError> {
        let mention = sqlx::query_as::<_, Mention>("SELECT * FROM webmentions WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(mention)
    }

    pub async fn find_mention(
        &self,
        source: &str,
        target: &str,
    ) -> Result<Option<Mention>, AppError> {
        let mention = sqlx::query_as::<_, Mention>(
            "SELECT * FROM webmentions WHERE lower(source) = lower(?) AND lower(target) = lower(?)",
        )
        .bind(unescape(source))
        .bind(unescape(target))
        .fetch_optional(&self.pool)
        .await?;

        Ok(mention)
    }

    /// Write verification results back to a mention.
    ///
    /// When the target moved to a URL that already has a row for the same
    /// source, the older row is dropped so the pair stays unique.
    pub async fn update_verified_mention(
        &self,
        id: i64,
        update: &MentionUpdate,
    ) -> Result<(), AppError> {
        let target = unescape(&update.target);

        let mut conn = self.pool.acquire().await?;
        sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await?;

        let result: Result<(), AppError> = async {
            sqlx::query(
                r#"
                DELETE FROM webmentions
                WHERE id != ?
                  AND lower(target) = lower(?)
                  AND lower(source) = (SELECT lower(source) FROM webmentions WHERE id = ?)
                "#,
            )
            .bind(id)
            .bind(&target)
            .bind(id)
            .execute(&mut *conn)
            .await?;

            sqlx::query(
                r#"
                UPDATE webmentions
                SET target = ?, title = ?, content = ?, author = ?, status = COALESCE(?, status)
                WHERE id = ?
                "#,
            )
            .bind(&target)
            .bind(&update.title)
            .bind(&update.content)
            .bind(&update.author)
            .bind(update.status.map(|s| s.as_str()))
            .bind(id)
            .execute(&mut *conn)
            .await?;

            Ok(())
        }
        .await;

        match result {
            Ok(()) => {
                sqlx::query("COMMIT").execute(&mut *conn).await?;
                Ok(())
            }
            Err(error) => {
                let _ = sqlx::query("ROLLBACK").execute(&mut *conn).await;
                Err(error)
            }
        }
    }

    pub async fn set_mention_status(
        &self,
        id: i64,
        status: MentionStatus,
    ) -> Result<bool, AppError> {
        let result = sqlx::query("UPDATE webmentions SET status = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn delete_mention(&self, id: i64) -> Result<bool, AppError> {
        let result = sqlx::query("DELETE FROM webmentions WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Mentions, newest first, optionally filtered by status.
    pub async fn list_mentions(
        &self,
        status: Option<MentionStatus>,
    ) -> Result<Vec<Mention>, AppError> {
        let mentions = match status {
            Some(status) => {
                sqlx::query_as::<_, Mention>(
                    "SELECT * FROM webmentions WHERE status = ? ORDER BY created DESC, id DESC",
                )
                .bind(status.as_str())
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as::<_, Mention>(
                    "SELECT * FROM webmentions ORDER BY created DESC, id DESC",
                )
                .fetch_all(&self.pool)
                .await?
            }
        };

        Ok(mentions)
    }

    // =========================================================================
    // Queue
    // =========================================================================

    /// Commit a new queue row. Returns its id.
    pub async fn enqueue(
        &self,
        name: &str,
        content: &[u8],
        scheduled_at: DateTime<Utc>,
    ) -> Result<i64, AppError> {
        let result =
            sqlx::query("INSERT INTO queue (name, content, scheduled_at, attempts) VALUES (?, ?, ?, 0)")
                .bind(name)
                .bind(content)
                .bind(scheduled_at.timestamp_millis())
                .execute(&self.pool)
                .await?;

        Ok(result.last_insert_rowid())
    }

    /// The earliest due row of `name`; ties resolve by insertion order.
    pub async fn peek_queue(
        &self,
        name: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<QueueItem>, AppError> {
        let item = sqlx::query_as::<_, QueueItem>(
            r#"
            SELECT id, name, content, scheduled_at, attempts FROM queue
            WHERE name = ? AND scheduled_at <= ?
            ORDER BY scheduled_at ASC, id ASC
            LIMIT 1
            "#,
        )
        .bind(name)
        .bind(now.timestamp_millis())
        .fetch_optional(&self.pool)
        .await?;

        Ok(item)
    }

    /// Move a row to `scheduled_at` and count the failed attempt.
    pub async fn reschedule_queue_item(
        &self,
        id: i64,
        scheduled_at: DateTime<Utc>,
    ) -> Result<(), AppError> {
        sqlx::query("UPDATE queue SET scheduled_at = ?, attempts = attempts + 1 WHERE id = ?")
            .bind(scheduled_at.timestamp_millis())
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    pub async fn dequeue(&self, id: i64) -> Result<(), AppError> {
        sqlx::query("DELETE FROM queue WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// All rows of a queue regardless of schedule, in delivery order.
    pub async fn list_queue(&self, name: &str) -> Result<Vec<QueueItem>, AppError> {
        let items = sqlx::query_as::<_, QueueItem>(
            "SELECT id, name, content, scheduled_at, attempts FROM queue WHERE name = ? ORDER BY scheduled_at ASC, id ASC",
        )
        .bind(name)
        .fetch_all(&self.pool)
        .await?;

        Ok(items)
    }

    // =========================================================================
    // Posts
    // =========================================================================

    pub async fn get_post(&self, path: &str) -> Result<Option<Post>, AppError> {
        let Some(row) = sqlx::query_as::<_, PostRow>(
            "SELECT path, blog, section, status, visibility, published, updated FROM posts WHERE path = ?",
        )
        .bind(path)
        .fetch_optional(&self.pool)
        .await?
        else {
            return Ok(None);
        };

        let parameter_rows = sqlx::query_as::<_, (String, String)>(
            "SELECT parameter, value FROM post_parameters WHERE path = ? ORDER BY id",
        )
        .bind(path)
        .fetch_all(&self.pool)
        .await?;

        let mut parameters: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (parameter, value) in parameter_rows {
            parameters.entry(parameter).or_default().push(value);
        }

        Ok(Some(Post {
            path: row.path,
            blog: row.blog,
            section: row.section,
            status: row.status,
            visibility: row.visibility,
            published: row.published,
            updated: row.updated,
            parameters,
        }))
    }

    /// Insert or replace a post and all of its parameters.
    pub async fn upsert_post(&self, post: &Post) -> Result<(), AppError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO posts (path, blog, section, status, visibility, published, updated)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(path) DO UPDATE SET
                blog = excluded.blog,
                section = excluded.section,
                status = excluded.status,
                visibility = excluded.visibility,
                published = excluded.published,
                updated = excluded.updated
            "#,
        )
        .bind(&post.path)
        .bind(&post.blog)
        .bind(&post.section)
        .bind(&post.status)
        .bind(&post.visibility)
        .bind(post.published)
        .bind(post.updated)
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM post_parameters WHERE path = ?")
            .bind(&post.path)
            .execute(&mut *tx)
            .await?;

        for (parameter, values) in &post.parameters {
            for value in values {
                sqlx::query("INSERT INTO post_parameters (path, parameter, value) VALUES (?, ?, ?)")
                    .bind(&post.path)
                    .bind(parameter)
                    .bind(value)
                    .execute(&mut *tx)
                    .await?;
            }
        }

        tx.commit().await?;
        Ok(())
    }

    /// Delete a post, returning what was stored.
    pub async fn delete_post(&self, path: &str) -> Result<Option<Post>, AppError> {
        let Some(post) = self.get_post(path).await? else {
            return Ok(None);
        };

        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM post_parameters WHERE path = ?")
            .bind(path)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM posts WHERE path = ?")
            .bind(path)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        Ok(Some(post))
    }

    /// Number of published, public posts across all blogs.
    pub async fn count_public_posts(&self) -> Result<i64, AppError> {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM posts WHERE status = ? AND visibility = ?",
        )
        .bind(POST_STATUS_PUBLISHED)
        .bind(POST_VISIBILITY_PUBLIC)
        .fetch_one(&self.pool)
        .await?;

        Ok(count)
    }

    // =========================================================================
    // Notifications
    // =========================================================================

    pub async fn insert_notification(&self, text: &str, created: i64) -> Result<i64, AppError> {
        let result = sqlx::query("INSERT INTO notifications (created, text) VALUES (?, ?)")
            .bind(created)
            .bind(text)
            .execute(&self.pool)
            .await?;

        Ok(result.last_insert_rowid())
    }

    pub async fn list_notifications(&self, limit: i64) -> Result<Vec<Notification>, AppError> {
        let notifications = sqlx::query_as::<_, Notification>(
            "SELECT id, created, text FROM notifications ORDER BY created DESC, id DESC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(notifications)
    }
}
