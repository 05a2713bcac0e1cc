//! Outgoing webmentions
//!
//! Every link in a post (plus its reply/like/bookmark targets) becomes a
//! `wm_send` queue item. The worker discovers the endpoint and notifies
//! it; links to this site skip HTTP and go straight into the mention
//! store.

use std::sync::Arc;

use scraper::{Html, Selector};
use serde::{Deserialize, Serialize};
use url::Url;

use super::parse::extract_links;
use super::receive::queue_mention;
use crate::config::AppConfig;
use crate::data::{Database, Post, QueueItem};
use crate::error::AppError;
use crate::federation::post_url;
use crate::metrics::WEBMENTIONS_TOTAL;
use crate::queue::{Outcome, Queue, WEBMENTION_SEND_QUEUE};
use crate::urls::{is_local_url, same_url};

/// Parameters whose values are mentioned targets
const LINK_PARAMETERS: &[&str] = &[
    "replylink",
    "reply",
    "likelink",
    "like",
    "bookmarklink",
    "bookmark",
];

/// Outgoing links of a post: rendered HTML first, then link parameters.
pub fn post_links(config: &AppConfig, post: &Post) -> Vec<String> {
    let source = post_url(config, &post.path);
    let mut links = extract_links(post.content(), &source);

    for parameter in LINK_PARAMETERS {
        for value in post.parameter_values(parameter) {
            let value = value.trim().to_string();
            if Url::parse(&value).is_ok() && !links.contains(&value) {
                links.push(value);
            }
        }
    }

    links.retain(|link| !same_url(link, &source));
    links
}

/// Payload of a `wm_send` queue item
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendJob {
    pub source: String,
    pub target: String,
}

/// Queues outgoing webmentions and delivers them from the `wm_send`
/// worker.
#[derive(Clone)]
pub struct WebmentionSender {
    config: Arc<AppConfig>,
    db: Arc<Database>,
    queue: Queue,
    http_client: Arc<reqwest::Client>,
}

impl WebmentionSender {
    pub fn new(
        config: Arc<AppConfig>,
        db: Arc<Database>,
        queue: Queue,
        http_client: Arc<reqwest::Client>,
    ) -> Self {
        Self {
            config,
            db,
            queue,
            http_client,
        }
    }

    /// Queue a mention of every target linked from `post`.
    pub async fn queue_for_post(&self, post: &Post) -> Result<usize, AppError> {
        let links = post_links(&self.config, post);
        self.queue_for_links(&post_url(&self.config, &post.path), &links)
            .await
    }

    /// Queue one send per target telling it that `source` changed.
    pub async fn queue_for_links(&self, source: &str, targets: &[String]) -> Result<usize, AppError> {
        if self.config.webmention.disable_sending {
            return Ok(0);
        }

        for target in targets {
            let job = SendJob {
                source: source.to_string(),
                target: target.clone(),
            };
            let payload = serde_json::to_vec(&job).map_err(|e| {
                AppError::Internal(anyhow::anyhow!("Failed to encode webmention send: {}", e))
            })?;
            self.queue.enqueue_now(WEBMENTION_SEND_QUEUE, &payload).await?;
        }

        if !targets.is_empty() {
            tracing::debug!(source, targets = targets.len(), "Queued outgoing webmentions");
        }
        Ok(targets.len())
    }

    /// Handle one `wm_send` queue item.
    pub async fn handle_item(&self, item: &QueueItem) -> Outcome {
        let job: SendJob = match serde_json::from_slice(&item.content) {
            Ok(job) => job,
            Err(error) => {
                tracing::error!(id = item.id, %error, "Undecodable webmention send");
                return Outcome::Drop;
            }
        };

        let outcome = if is_local_url(&self.config.server, &job.target) {
            match queue_mention(&self.config, &self.db, &self.queue, &job.source, &job.target).await {
                Ok(_) => Outcome::Done,
                Err(AppError::Validation(reason)) => {
                    tracing::debug!(source = %job.source, target = %job.target, reason, "Local webmention refused");
                    Outcome::Drop
                }
                Err(error) => {
                    tracing::warn!(source = %job.source, target = %job.target, %error, "Local webmention failed");
                    Outcome::Retry
                }
            }
        } else {
            self.send_remote(&job.source, &job.target).await
        };

        let label = match outcome {
            Outcome::Done => "ok",
            Outcome::Retry => "retried",
            Outcome::Drop => "failed",
        };
        WEBMENTIONS_TOTAL.with_label_values(&["sent", label]).inc();
        outcome
    }

    async fn send_remote(&self, source: &str, target: &str) -> Outcome {
        let endpoint = match discover_endpoint(&self.http_client, target).await {
            Ok(Some(endpoint)) => endpoint,
            Ok(None) => {
                tracing::debug!(source, target, "Target has no webmention endpoint");
                return Outcome::Done;
            }
            Err(error) => {
                tracing::debug!(source, target, %error, "Webmention endpoint discovery failed");
                return Outcome::Retry;
            }
        };

        let response = match self
            .http_client
            .post(&endpoint)
            .form(&[("source", source), ("target", target)])
            .send()
            .await
        {
            Ok(response) => response,
            Err(error) => {
                tracing::debug!(source, target, endpoint = %endpoint, %error, "Webmention send failed");
                return Outcome::Retry;
            }
        };

        let status = response.status();
        if status.is_success() {
            tracing::info!(source, target, endpoint = %endpoint, "Sent webmention");
            Outcome::Done
        } else if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            tracing::debug!(source, target, endpoint = %endpoint, status = status.as_u16(), "Webmention endpoint unavailable");
            Outcome::Retry
        } else {
            tracing::info!(source, target, endpoint = %endpoint, status = status.as_u16(), "Webmention refused");
            Outcome::Drop
        }
    }
}

/// Find the webmention endpoint of `target`.
///
/// HEAD first, looking only at `Link` headers; then GET, looking at
/// `Link` headers and `<link>`/`<a>` elements with `rel="webmention"`.
pub async fn discover_endpoint(
    http_client: &reqwest::Client,
    target: &str,
) -> Result<Option<String>, AppError> {
    if let Ok(response) = http_client.head(target).send().await {
        if response.status().is_success() {
            let base = response.url().clone();
            if let Some(endpoint) = endpoint_from_headers(response.headers(), &base) {
                return Ok(Some(endpoint));
            }
        }
    }

    let response = http_client.get(target).send().await?;
    if response.status().is_server_error() {
        return Err(AppError::Federation(format!(
            "{} answered HTTP {}",
            target,
            response.status()
        )));
    }
    if !response.status().is_success() {
        return Ok(None);
    }
    let base = response.url().clone();
    if let Some(endpoint) = endpoint_from_headers(response.headers(), &base) {
        return Ok(Some(endpoint));
    }

    let body = response.text().await?;
    Ok(endpoint_from_html(&body, &base))
}

fn endpoint_from_headers(headers: &reqwest::header::HeaderMap, base: &Url) -> Option<String> {
    headers
        .get_all(reqwest::header::LINK)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(parse_link_header)
        .find(|(_, rels)| rels.iter().any(|rel| rel.eq_ignore_ascii_case("webmention")))
        .and_then(|(href, _)| base.join(&href).ok())
        .map(|url| url.to_string())
}

/// Parse `<url>; rel="a b", <url2>; rel=c` into `(url, rels)` pairs.
pub fn parse_link_header(value: &str) -> Vec<(String, Vec<String>)> {
    let mut links = Vec::new();
    let mut rest = value.trim();

    while let Some(start) = rest.find('<') {
        let Some(end) = rest[start..].find('>') else {
            break;
        };
        let href = rest[start + 1..start + end].trim().to_string();
        let after = &rest[start + end + 1..];
        let params_end = after.find('<').unwrap_or(after.len());
        let params = &after[..params_end];

        let rels = params
            .split(';')
            .filter_map(|param| {
                let (key, value) = param.split_once('=')?;
                (key.trim().eq_ignore_ascii_case("rel"))
                    .then(|| value.trim().trim_matches(',').trim().trim_matches('"').to_string())
            })
            .flat_map(|rel| rel.split_whitespace().map(str::to_string).collect::<Vec<_>>())
            .collect();

        links.push((href, rels));
        rest = &after[params_end..];
    }

    links
}

fn endpoint_from_html(html: &str, base: &Url) -> Option<String> {
    let document = Html::parse_document(html);
    let selector = Selector::parse("link[href], a[href]").ok()?;

    document
        .select(&selector)
        .find(|element| {
            element
                .value()
                .attr("rel")
                .is_some_and(|rel| rel.split_whitespace().any(|r| r.eq_ignore_ascii_case("webmention")))
        })
        .and_then(|element| element.value().attr("href"))
        .and_then(|href| base.join(href).ok())
        .map(|url| url.to_string())
}
