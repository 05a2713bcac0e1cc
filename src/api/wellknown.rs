//! Well-known endpoints
//!
//! - /.well-known/webfinger
//! - /.well-known/host-meta
//! - /.well-known/nodeinfo
//! - /nodeinfo

use axum::{
    Router,
    extract::{Query, State},
    http::header,
    response::{IntoResponse, Json},
    routing::get,
};
use serde::Deserialize;

use crate::AppState;
use crate::error::AppError;
use crate::federation::{JRD_CONTENT_TYPE, generate_webfinger_response};

const NODEINFO_SCHEMA: &str = "http://nodeinfo.diaspora.software/ns/schema/2.1";
const NODEINFO_CONTENT_TYPE: &str =
    "application/json; profile=\"http://nodeinfo.diaspora.software/ns/schema/2.1#\"";

/// Create well-known router
///
/// Routes:
/// - GET /.well-known/webfinger
/// - GET /.well-known/host-meta
/// - GET /.well-known/nodeinfo
/// - GET /nodeinfo
pub fn wellknown_router() -> Router<AppState> {
    Router::new()
        .route("/.well-known/webfinger", get(webfinger))
        .route("/.well-known/host-meta", get(host_meta))
        .route("/.well-known/nodeinfo", get(nodeinfo_links))
        .route("/nodeinfo", get(nodeinfo))
}

/// WebFinger query parameters
#[derive(Debug, Deserialize)]
struct WebFingerQuery {
    #[serde(default)]
    resource: Option<String>,
}

/// GET /.well-known/webfinger
///
/// Query: ?resource=acct:blog@host or ?resource=<blog IRI>
async fn webfinger(
    State(state): State<AppState>,
    Query(query): Query<WebFingerQuery>,
) -> Result<impl IntoResponse, AppError> {
    let resource = query
        .resource
        .filter(|r| !r.trim().is_empty())
        .ok_or_else(|| AppError::Validation("Missing resource parameter".to_string()))?;

    let blog = state.webfinger.lookup(&resource).ok_or(AppError::NotFound)?;
    let jrd = generate_webfinger_response(&state.config, blog).ok_or(AppError::NotFound)?;

    tracing::debug!(resource = %resource, blog, "WebFinger lookup");
    Ok(([(header::CONTENT_TYPE, JRD_CONTENT_TYPE)], Json(jrd)))
}

/// GET /.well-known/host-meta
///
/// Returns host-meta XML for WebFinger discovery.
async fn host_meta(State(state): State<AppState>) -> impl IntoResponse {
    let xml = format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<XRD xmlns="http://docs.oasis-open.org/ns/xri/xrd-1.0">
  <Link rel="lrdd" type="application/jrd+json" template="{}/.well-known/webfinger?resource={{uri}}"/>
</XRD>"#,
        state.config.server.public_address()
    );

    ([(header::CONTENT_TYPE, "application/xrd+xml; charset=utf-8")], xml)
}

/// GET /.well-known/nodeinfo
async fn nodeinfo_links(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "links": [
            {
                "rel": NODEINFO_SCHEMA,
                "href": format!("{}/nodeinfo", state.config.server.public_address())
            }
        ]
    }))
}

/// GET /nodeinfo
///
/// Returns the NodeInfo 2.1 document.
async fn nodeinfo(State(state): State<AppState>) -> Result<impl IntoResponse, AppError> {
    let local_posts = state.db.count_public_posts().await?;
    let blogs: Vec<serde_json::Value> = state
        .config
        .blogs
        .iter()
        .map(|(name, blog)| {
            serde_json::json!({
                "name": name,
                "title": blog.title,
                "lang": blog.lang,
            })
        })
        .collect();

    let document = serde_json::json!({
        "version": "2.1",
        "software": {
            "name": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION")
        },
        "protocols": ["activitypub"],
        "services": {
            "inbound": [],
            "outbound": []
        },
        "openRegistrations": false,
        "usage": {
            "users": {
                "total": state.config.blogs.len()
            },
            "localPosts": local_posts
        },
        "metadata": {
            "nodeName": state.config.user.name,
            "blogs": blogs
        }
    });

    Ok(([(header::CONTENT_TYPE, NODEINFO_CONTENT_TYPE)], Json(document)))
}
