//! Post lifecycle hooks
//!
//! The post store is external; these endpoints let it (or the owner)
//! report changes so they are federated and webmentioned.

use axum::{
    Json, Router,
    extract::{Query, State},
    http::StatusCode,
    routing::put,
};
use serde::Deserialize;

use crate::AppState;
use crate::auth::CurrentUser;
use crate::data::Post;
use crate::error::AppError;
use crate::federation::post_url;
use crate::webmention::post_links;

/// Create posts router
///
/// Routes:
/// - PUT /posts - Create or update a post
/// - DELETE /posts?path= - Delete a post
pub fn posts_router() -> Router<AppState> {
    Router::new().route("/posts", put(put_post).delete(delete_post))
}

fn is_federated(post: &Post) -> bool {
    post.is_published() && post.is_public()
}

/// PUT /api/posts
///
/// A new published public post is sent as `Create`, a known one as
/// `Update`. A post that stops being public is sent as `Delete`.
async fn put_post(
    State(state): State<AppState>,
    CurrentUser(_session): CurrentUser,
    Json(mut post): Json<Post>,
) -> Result<(StatusCode, Json<Post>), AppError> {
    if !post.path.starts_with('/') {
        return Err(AppError::Validation("path must start with /".to_string()));
    }
    if post.blog.is_empty() {
        post.blog = state.config.blog_for_post_path(&post.path).to_string();
    }
    if state.config.blog(&post.blog).is_none() {
        return Err(AppError::Validation(format!("Unknown blog: {}", post.blog)));
    }

    let previous = state.db.get_post(&post.path).await?;
    state.db.upsert_post(&post).await?;

    let was_federated = previous.as_ref().is_some_and(is_federated);
    match (&previous, was_federated, is_federated(&post)) {
        (_, true, true) => state.outbox.update_post(&post).await?,
        (Some(previous), true, false) => state.outbox.delete_post(previous).await?,
        _ => state.outbox.publish_post(&post).await?,
    }

    let source = post_url(&state.config, &post.path);
    let dropped_links: Vec<String> = match &previous {
        Some(previous) => {
            let current = post_links(&state.config, &post);
            post_links(&state.config, previous)
                .into_iter()
                .filter(|link| !current.contains(link))
                .collect()
        }
        None => Vec::new(),
    };
    state.outbox.queue_webmentions_for_post(&post).await?;
    if !dropped_links.is_empty() {
        state
            .outbox
            .queue_webmentions_for_links(&source, &dropped_links)
            .await?;
    }

    tracing::info!(path = %post.path, blog = %post.blog, created = previous.is_none(), "Stored post");
    let status = if previous.is_some() {
        StatusCode::OK
    } else {
        StatusCode::CREATED
    };
    Ok((status, Json(post)))
}

#[derive(Debug, Deserialize)]
struct PathQuery {
    path: String,
}

/// DELETE /api/posts?path=
async fn delete_post(
    State(state): State<AppState>,
    CurrentUser(_session): CurrentUser,
    Query(query): Query<PathQuery>,
) -> Result<StatusCode, AppError> {
    let post = state
        .db
        .delete_post(&query.path)
        .await?
        .ok_or(AppError::NotFound)?;

    if is_federated(&post) {
        state.outbox.delete_post(&post).await?;
    }

    let source = post_url(&state.config, &post.path);
    let links = post_links(&state.config, &post);
    state.outbox.queue_webmentions_for_links(&source, &links).await?;

    tracing::info!(path = %post.path, blog = %post.blog, "Deleted post");
    Ok(StatusCode::NO_CONTENT)
}
