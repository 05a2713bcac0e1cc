//! ActivityPub endpoints
//!
//! - Inbox (activity receiving)
//! - Followers page
//! - Remote follow (OStatus subscribe)

use axum::body::Bytes;
use axum::{
    Form, Router,
    extract::{DefaultBodyLimit, OriginalUri, Path, State},
    http::StatusCode,
    response::{Html, IntoResponse, Redirect},
    routing::{get, post},
};
use http::HeaderMap;
use serde::Deserialize;

use crate::AppState;
use crate::auth::CurrentUser;
use crate::error::AppError;
use crate::federation::{expand_subscribe_template, resolve_subscribe_template};
use crate::metrics::{FEDERATION_REQUEST_DURATION_SECONDS, FEDERATION_REQUESTS_TOTAL};

const INBOX_BODY_LIMIT: usize = 10 * 1024 * 1024;
const REMOTE_FOLLOW_BODY_LIMIT: usize = 100 * 1024;

/// Create ActivityPub router
///
/// Routes:
/// - POST /activitypub/inbox/:blog - Blog inbox
/// - GET /activitypub/followers/:blog - Follower list (owner only)
/// - GET/POST /activitypub/remote_follow/:blog - Remote follow form
pub fn activitypub_router() -> Router<AppState> {
    Router::new()
        .route(
            "/activitypub/inbox/:blog",
            post(inbox).layer(DefaultBodyLimit::max(INBOX_BODY_LIMIT)),
        )
        .route("/activitypub/followers/:blog", get(followers))
        .route(
            "/activitypub/remote_follow/:blog",
            get(remote_follow_form)
                .post(remote_follow)
                .layer(DefaultBodyLimit::max(REMOTE_FOLLOW_BODY_LIMIT)),
        )
}

/// POST /activitypub/inbox/:blog
///
/// Receives incoming ActivityPub activities.
///
/// # Steps
/// 1. Verify HTTP Signature against the signing actor
/// 2. Check the activity actor is the signer
/// 3. Process based on type
async fn inbox(
    State(state): State<AppState>,
    Path(blog): Path<String>,
    OriginalUri(uri): OriginalUri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, AppError> {
    if !state.config.activitypub.enabled {
        return Err(AppError::NotFound);
    }

    let _timer = FEDERATION_REQUEST_DURATION_SECONDS
        .with_label_values(&["inbound"])
        .start_timer();

    let path_and_query = uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or_else(|| uri.path());

    match state
        .inbox
        .accept_inbox(&blog, "POST", path_and_query, &headers, &body)
        .await
    {
        Ok(()) => {
            FEDERATION_REQUESTS_TOTAL
                .with_label_values(&["inbound", "accepted"])
                .inc();
            Ok(StatusCode::OK)
        }
        Err(error) => {
            FEDERATION_REQUESTS_TOTAL
                .with_label_values(&["inbound", error.kind()])
                .inc();
            tracing::warn!(blog = %blog, %error, "Rejected inbox request");
            Err(error)
        }
    }
}

/// GET /activitypub/followers/:blog
async fn followers(
    State(state): State<AppState>,
    CurrentUser(_session): CurrentUser,
    Path(blog): Path<String>,
) -> Result<Html<String>, AppError> {
    let blog_config = state.config.blog(&blog).ok_or(AppError::NotFound)?;
    let followers = state.db.list_followers(&blog).await?;

    let rows: String = followers
        .iter()
        .map(|follower| {
            format!(
                "<tr><td><a href=\"{actor}\" rel=\"nofollow noopener\">{username}</a></td><td>{inbox}</td></tr>\n",
                actor = html_escape::encode_double_quoted_attribute(&follower.actor),
                username = html_escape::encode_text(&follower.username),
                inbox = html_escape::encode_text(&follower.inbox),
            )
        })
        .collect();

    Ok(Html(format!(
        r#"<!DOCTYPE html>
<html lang="{lang}">
<head><meta charset="utf-8"><title>Followers of {title}</title></head>
<body>
<h1>Followers of {title} ({count})</h1>
<table>
<thead><tr><th>Account</th><th>Inbox</th></tr></thead>
<tbody>
{rows}</tbody>
</table>
</body>
</html>"#,
        lang = html_escape::encode_double_quoted_attribute(&blog_config.lang),
        title = html_escape::encode_text(&blog_config.title),
        count = followers.len(),
        rows = rows,
    )))
}

/// GET /activitypub/remote_follow/:blog
async fn remote_follow_form(
    State(state): State<AppState>,
    Path(blog): Path<String>,
) -> Result<Html<String>, AppError> {
    let blog_config = state.config.blog(&blog).ok_or(AppError::NotFound)?;

    Ok(Html(format!(
        r#"<!DOCTYPE html>
<html lang="{lang}">
<head><meta charset="utf-8"><title>Follow {title}</title></head>
<body>
<h1>Follow {title}</h1>
<form method="post" action="/activitypub/remote_follow/{blog}">
<label for="address">Your account (user@example.social)</label>
<input type="text" id="address" name="address" required>
<input type="submit" value="Follow">
</form>
</body>
</html>"#,
        lang = html_escape::encode_double_quoted_attribute(&blog_config.lang),
        title = html_escape::encode_text(&blog_config.title),
        blog = urlencoding::encode(&blog),
    )))
}

#[derive(Debug, Deserialize)]
struct RemoteFollowForm {
    address: String,
}

/// POST /activitypub/remote_follow/:blog
///
/// Looks the account up on its home server and redirects to its
/// subscribe page for this blog.
async fn remote_follow(
    State(state): State<AppState>,
    Path(blog): Path<String>,
    Form(form): Form<RemoteFollowForm>,
) -> Result<impl IntoResponse, AppError> {
    let blog_iri = state.config.blog_iri(&blog).ok_or(AppError::NotFound)?;

    let template = resolve_subscribe_template(
        &form.address,
        &state.http_client,
        state.config.activitypub.allow_private_addresses,
    )
    .await?;
    let target = expand_subscribe_template(&template, &blog_iri)?;

    tracing::info!(blog = %blog, address = %form.address, "Redirecting remote follow");
    Ok(Redirect::to(&target))
}
