//! Webmention endpoints
//!
//! - POST /webmention - Receive a webmention
//! - /webmention/admin/* - Moderation (owner only)

use axum::body::Bytes;
use axum::{
    Router,
    extract::{DefaultBodyLimit, Path, Query, State},
    http::{HeaderMap, StatusCode, header},
    response::Json,
    routing::{get, post},
};
use serde::{Deserialize, Serialize};

use crate::AppState;
use crate::auth::CurrentUser;
use crate::data::{Mention, MentionStatus};
use crate::error::AppError;
use crate::webmention::{enqueue_verification, queue_mention};

const WEBMENTION_BODY_LIMIT: usize = 1024 * 1024;
const FORM_CONTENT_TYPE: &str = "application/x-www-form-urlencoded";

/// Create webmention router
///
/// Routes:
/// - POST /webmention - Webmention endpoint
/// - GET /webmention/admin - List mentions
/// - POST /webmention/admin/:id/approve - Approve a mention
/// - POST /webmention/admin/:id/delete - Delete a mention
/// - POST /webmention/admin/:id/reverify - Queue verification again
pub fn webmention_router() -> Router<AppState> {
    Router::new()
        .route(
            "/webmention",
            post(receive).layer(DefaultBodyLimit::max(WEBMENTION_BODY_LIMIT)),
        )
        .route("/webmention/admin", get(list_mentions))
        .route("/webmention/admin/:id/approve", post(approve_mention))
        .route("/webmention/admin/:id/delete", post(delete_mention))
        .route("/webmention/admin/:id/reverify", post(reverify_mention))
}

/// Webmention accepted response
#[derive(Debug, Serialize)]
pub struct QueuedResponse {
    pub source: String,
    pub target: String,
    pub status: String,
}

/// POST /webmention
///
/// Form-encoded `source` and `target`; verification happens later on
/// the `wm` queue.
async fn receive(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<QueuedResponse>), AppError> {
    if state.config.webmention.disable_receiving {
        return Err(AppError::NotFound);
    }

    let is_form = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.trim().to_ascii_lowercase().starts_with(FORM_CONTENT_TYPE));
    if !is_form {
        return Err(AppError::Validation(format!(
            "Content-Type must be {}",
            FORM_CONTENT_TYPE
        )));
    }

    let mut source = None;
    let mut target = None;
    for (key, value) in url::form_urlencoded::parse(&body) {
        match key.as_ref() {
            "source" => source = Some(value.into_owned()),
            "target" => target = Some(value.into_owned()),
            _ => {}
        }
    }
    let (Some(source), Some(target)) = (source, target) else {
        return Err(AppError::Validation("source and target are required".to_string()));
    };

    let mention = queue_mention(&state.config, &state.db, &state.queue, &source, &target).await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(QueuedResponse {
            source: mention.source,
            target: mention.target,
            status: mention.status,
        }),
    ))
}

/// Mention list filter
#[derive(Debug, Deserialize)]
struct ListQuery {
    #[serde(default)]
    status: Option<String>,
}

/// GET /webmention/admin?status=
async fn list_mentions(
    State(state): State<AppState>,
    CurrentUser(_session): CurrentUser,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<Mention>>, AppError> {
    let status = match query.status.as_deref().filter(|s| !s.is_empty()) {
        Some(value) => Some(
            MentionStatus::parse(value)
                .ok_or_else(|| AppError::Validation(format!("Unknown status: {}", value)))?,
        ),
        None => None,
    };

    Ok(Json(state.db.list_mentions(status).await?))
}

/// POST /webmention/admin/:id/approve
async fn approve_mention(
    State(state): State<AppState>,
    CurrentUser(_session): CurrentUser,
    Path(id): Path<i64>,
) -> Result<StatusCode, AppError> {
    if !state.db.set_mention_status(id, MentionStatus::Approved).await? {
        return Err(AppError::NotFound);
    }
    tracing::info!(id, "Approved webmention");
    Ok(StatusCode::NO_CONTENT)
}

/// POST /webmention/admin/:id/delete
async fn delete_mention(
    State(state): State<AppState>,
    CurrentUser(_session): CurrentUser,
    Path(id): Path<i64>,
) -> Result<StatusCode, AppError> {
    if !state.db.delete_mention(id).await? {
        return Err(AppError::NotFound);
    }
    tracing::info!(id, "Deleted webmention");
    Ok(StatusCode::NO_CONTENT)
}

/// POST /webmention/admin/:id/reverify
async fn reverify_mention(
    State(state): State<AppState>,
    CurrentUser(_session): CurrentUser,
    Path(id): Path<i64>,
) -> Result<StatusCode, AppError> {
    let mention = state.db.get_mention(id).await?.ok_or(AppError::NotFound)?;
    enqueue_verification(&state.queue, &mention).await?;
    tracing::info!(id, source = %mention.source, target = %mention.target, "Queued webmention verification");
    Ok(StatusCode::ACCEPTED)
}
