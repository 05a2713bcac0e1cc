//! Post and blog documents
//!
//! Fallback handler for everything the other routers don't claim. A blog
//! path serves the blog's Person actor, any other path a stored post as
//! Note/Article; both fall back to a minimal h-entry / h-card HTML page
//! unless the client asks for ActivityStreams.

use axum::{
    extract::{OriginalUri, State},
    http::{HeaderMap, Method, StatusCode, header},
    response::{IntoResponse, Response},
};

use crate::AppState;
use crate::auth::MaybeUser;
use crate::config::{AppConfig, BlogConfig, url_authority};
use crate::data::Post;
use crate::error::AppError;
use crate::federation::{
    ACTIVITY_JSON, format_time, note_for_post, person_for_blog, post_url, reply_link,
    wants_activity_json,
};
use crate::urls::unescape;

/// Which configured address a request arrived on
#[derive(Debug, Clone, PartialEq, Eq)]
enum Origin {
    Main,
    Short,
    Alt(String),
}

fn request_origin(config: &AppConfig, headers: &HeaderMap) -> Origin {
    let Some(host) = headers
        .get(header::HOST)
        .and_then(|h| h.to_str().ok())
        .map(|h| h.trim().to_ascii_lowercase())
    else {
        return Origin::Main;
    };

    if config.server.public_host().as_deref() == Some(host.as_str()) {
        return Origin::Main;
    }
    if config.server.short_host().as_deref() == Some(host.as_str()) {
        return Origin::Short;
    }
    config
        .server
        .alt_addresses()
        .find(|alt| url_authority(alt).as_deref() == Some(host.as_str()))
        .map(|alt| Origin::Alt(alt.to_string()))
        .unwrap_or(Origin::Main)
}

fn moved_permanently(location: &str) -> Response {
    (StatusCode::MOVED_PERMANENTLY, [(header::LOCATION, location.to_string())]).into_response()
}

fn activity_json(document: serde_json::Value) -> Response {
    (
        [
            (header::CONTENT_TYPE, format!("{}; charset=utf-8", ACTIVITY_JSON)),
            (header::VARY, "Accept".to_string()),
        ],
        document.to_string(),
    )
        .into_response()
}

fn html_page(config: &AppConfig, body: String) -> Response {
    let endpoint = format!("{}/webmention", config.server.public_address());
    (
        [
            (header::CONTENT_TYPE, "text/html; charset=utf-8".to_string()),
            (header::LINK, format!("<{}>; rel=\"webmention\"", endpoint)),
            (header::VARY, "Accept".to_string()),
        ],
        body,
    )
        .into_response()
}

/// Fallback: GET/HEAD of a blog or post path.
pub async fn serve(
    State(state): State<AppState>,
    user: MaybeUser,
    method: Method,
    headers: HeaderMap,
    OriginalUri(uri): OriginalUri,
) -> Result<Response, AppError> {
    if method != Method::GET && method != Method::HEAD {
        return Err(AppError::NotFound);
    }

    let config = &state.config;
    let origin = request_origin(config, &headers);
    let wants_as = config.activitypub.enabled
        && headers
            .get(header::ACCEPT)
            .and_then(|a| a.to_str().ok())
            .is_some_and(wants_activity_json);
    let raw_path = uri.path();
    let path_and_query = uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or(raw_path);
    // Posts and blogs are keyed by the decoded path.
    let path = unescape(raw_path);
    let path = path.as_str();

    if let Origin::Alt(_) = origin {
        if !wants_as {
            let location = format!("{}{}", config.server.public_address(), path_and_query);
            return Ok(moved_permanently(&location));
        }
    }

    if let Some((name, blog)) = config.blog_by_path(path) {
        if wants_as {
            let address = match &origin {
                Origin::Alt(alt) => alt.as_str(),
                _ => config.server.public_address(),
            };
            let person = person_for_blog(config, name, state.keys.public_key_pem(), address)
                .ok_or(AppError::NotFound)?;
            return Ok(activity_json(person));
        }
        return Ok(html_page(config, blog_page(config, name, blog)));
    }

    if path.len() > 1 && path.ends_with('/') {
        let trimmed = raw_path.trim_end_matches('/');
        let location = match uri.query() {
            Some(query) => format!("{}?{}", trimmed, query),
            None => trimmed.to_string(),
        };
        return Ok(moved_permanently(&location));
    }

    let post = state.db.get_post(path).await?.ok_or(AppError::NotFound)?;
    if !(post.is_published() && post.is_public()) && !user.is_logged_in() {
        return Err(AppError::NotFound);
    }

    if wants_as {
        return Ok(activity_json(note_for_post(config, &post)));
    }
    Ok(html_page(config, post_page(config, &post)))
}

fn blog_page(config: &AppConfig, name: &str, blog: &BlogConfig) -> String {
    let iri = config.blog_iri(name).unwrap_or_default();
    format!(
        r#"<!DOCTYPE html>
<html lang="{lang}">
<head><meta charset="utf-8"><title>{title}</title></head>
<body>
<header class="h-card">
<h1><a class="u-url p-name" href="{iri}">{title}</a></h1>
<p class="p-note">{description}</p>
<a href="/activitypub/remote_follow/{name}">Follow</a>
</header>
</body>
</html>"#,
        lang = html_escape::encode_double_quoted_attribute(&blog.lang),
        title = html_escape::encode_text(&blog.title),
        iri = html_escape::encode_double_quoted_attribute(&iri),
        description = html_escape::encode_text(&blog.description),
        name = urlencoding::encode(name),
    )
}

fn post_page(config: &AppConfig, post: &Post) -> String {
    let url = post_url(config, &post.path);
    let lang = config
        .blog(&post.blog)
        .map(|blog| blog.lang.as_str())
        .unwrap_or("en");
    let author_url = config.blog_iri(&post.blog).unwrap_or_default();

    let mut article = String::new();
    if let Some(title) = post.title() {
        article.push_str(&format!(
            "<h1 class=\"p-name\">{}</h1>\n",
            html_escape::encode_text(title)
        ));
    }
    if let Some(reply) = reply_link(post) {
        article.push_str(&format!(
            "<p>In reply to <a class=\"u-in-reply-to\" href=\"{0}\">{1}</a></p>\n",
            html_escape::encode_double_quoted_attribute(reply),
            html_escape::encode_text(reply)
        ));
    }
    if let Some(published) = post.published {
        article.push_str(&format!(
            "<a class=\"u-url\" href=\"{}\"><time class=\"dt-published\" datetime=\"{}\">{}</time></a>\n",
            html_escape::encode_double_quoted_attribute(&url),
            format_time(config, published),
            published.format("%Y-%m-%d")
        ));
    } else {
        article.push_str(&format!(
            "<a class=\"u-url\" href=\"{}\"></a>\n",
            html_escape::encode_double_quoted_attribute(&url)
        ));
    }
    article.push_str(&format!(
        "<div class=\"e-content\">{}</div>\n",
        post.content()
    ));
    article.push_str(&format!(
        "<a class=\"p-author h-card\" href=\"{}\">{}</a>\n",
        html_escape::encode_double_quoted_attribute(&author_url),
        html_escape::encode_text(&config.user.name)
    ));

    format!(
        r#"<!DOCTYPE html>
<html lang="{lang}">
<head><meta charset="utf-8"><title>{title}</title></head>
<body>
<article class="h-entry">
{article}</article>
</body>
</html>"#,
        lang = html_escape::encode_double_quoted_attribute(lang),
        title = html_escape::encode_text(post.title().unwrap_or(&post.path)),
        article = article,
    )
}
