//! Remote actor resolution
//!
//! Fetches ActivityStreams actor documents and caches them in memory.
//! 404 and 410 answers are cached too, so a deleted account does not cost
//! a request per inbound activity.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::RwLock;

use crate::config::ActivityPubConfig;
use crate::error::AppError;
use crate::metrics::{FEDERATION_REQUEST_DURATION_SECONDS, FEDERATION_REQUESTS_TOTAL};

const ACCEPT_ACTIVITY: &str =
    "application/activity+json, application/ld+json; profile=\"https://www.w3.org/ns/activitystreams\"";

/// The parts of a remote actor document federation cares about
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteActor {
    pub id: String,
    pub inbox: Option<String>,
    pub shared_inbox: Option<String>,
    pub public_key_id: Option<String>,
    pub public_key_pem: Option<String>,
    pub preferred_username: Option<String>,
    pub moved_to: Option<String>,
}

impl RemoteActor {
    /// Read an actor from a parsed document. Every field is optional
    /// except `id`.
    pub fn from_document(doc: &Value) -> Result<Self, AppError> {
        let str_field = |value: Option<&Value>| {
            value
                .and_then(|v| v.as_str())
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        };

        let id = str_field(doc.get("id"))
            .ok_or_else(|| AppError::Federation("Actor document has no id".to_string()))?;
        let public_key = doc.get("publicKey");

        Ok(Self {
            id,
            inbox: str_field(doc.get("inbox")),
            shared_inbox: str_field(doc.pointer("/endpoints/sharedInbox")),
            public_key_id: str_field(public_key.and_then(|k| k.get("id"))),
            public_key_pem: str_field(public_key.and_then(|k| k.get("publicKeyPem"))),
            preferred_username: str_field(doc.get("preferredUsername")),
            moved_to: str_field(doc.get("movedTo")),
        })
    }

    /// `sharedInbox` when advertised, else `inbox`.
    pub fn delivery_inbox(&self) -> Option<&str> {
        self.shared_inbox.as_deref().or(self.inbox.as_deref())
    }

    /// Webfinger-style handle, `@user@host`.
    pub fn username(&self) -> String {
        let parsed = url::Url::parse(&self.id).ok();
        let host = parsed
            .as_ref()
            .and_then(|u| u.host_str())
            .unwrap_or_default()
            .to_string();
        let user = self.preferred_username.clone().unwrap_or_else(|| {
            parsed
                .as_ref()
                .and_then(|u| u.path_segments())
                .and_then(|mut segments| segments.next_back().map(str::to_string))
                .unwrap_or_default()
        });
        format!("@{}@{}", user, host)
    }
}

/// Result of a fetch that reached the remote server
#[derive(Debug, Clone)]
pub enum ActorFetch {
    Found(RemoteActor),
    /// Non-success HTTP status; 404 and 410 mean the actor is gone.
    Status(u16),
}

impl ActorFetch {
    pub fn is_gone(&self) -> bool {
        matches!(self, ActorFetch::Status(404 | 410))
    }
}

#[derive(Debug, Clone)]
struct CachedActor {
    result: ActorFetch,
    cached_at: Instant,
    ttl: Duration,
}

impl CachedActor {
    fn is_valid(&self) -> bool {
        self.cached_at.elapsed() < self.ttl
    }
}

/// Actor resolver
///
/// Thread-safe; shared between the inbox handler and the outbox.
pub struct ActorResolver {
    /// Cache storage: actor IRI (no fragment) -> result
    cache: RwLock<HashMap<String, CachedActor>>,
    http_client: Arc<reqwest::Client>,
    ttl: Duration,
    negative_ttl: Duration,
    allow_private_addresses: bool,
}

impl ActorResolver {
    pub fn new(http_client: Arc<reqwest::Client>, config: &ActivityPubConfig) -> Self {
        Self {
            cache: RwLock::new(HashMap::new()),
            http_client,
            ttl: Duration::from_secs(config.actor_cache_ttl_seconds),
            negative_ttl: Duration::from_secs(config.negative_cache_ttl_seconds),
            allow_private_addresses: config.allow_private_addresses,
        }
    }

    /// Fetch the actor behind `iri`, which may carry a `#fragment` key id.
    ///
    /// Transport and parse failures are errors; HTTP failures come back
    /// as [`ActorFetch::Status`] so callers can act on 404/410.
    pub async fn fetch(&self, iri: &str) -> Result<ActorFetch, AppError> {
        let actor_url = iri.split('#').next().unwrap_or(iri);

        {
            let cache = self.cache.read().await;
            if let Some(cached) = cache.get(actor_url).filter(|c| c.is_valid()) {
                tracing::debug!(actor = actor_url, "Actor cache hit");
                return Ok(cached.result.clone());
            }
        }

        let result = self.fetch_remote(actor_url).await?;

        let ttl = match &result {
            ActorFetch::Found(_) => Some(self.ttl),
            fetch if fetch.is_gone() => Some(self.negative_ttl),
            ActorFetch::Status(_) => None,
        };
        if let Some(ttl) = ttl.filter(|ttl| !ttl.is_zero()) {
            let mut cache = self.cache.write().await;
            cache.insert(
                actor_url.to_string(),
                CachedActor {
                    result: result.clone(),
                    cached_at: Instant::now(),
                    ttl,
                },
            );
        }

        Ok(result)
    }

    async fn fetch_remote(&self, actor_url: &str) -> Result<ActorFetch, AppError> {
        if !self.allow_private_addresses {
            ensure_public_url(actor_url).await?;
        }

        let timer = FEDERATION_REQUEST_DURATION_SECONDS
            .with_label_values(&["actor_fetch"])
            .start_timer();
        let response = self
            .http_client
            .get(actor_url)
            .header(reqwest::header::ACCEPT, ACCEPT_ACTIVITY)
            .send()
            .await;
        timer.observe_duration();

        let response = match response {
            Ok(response) => response,
            Err(error) => {
                FEDERATION_REQUESTS_TOTAL
                    .with_label_values(&["actor_fetch", "error"])
                    .inc();
                tracing::debug!(actor = actor_url, %error, "Actor fetch failed");
                return Err(error.into());
            }
        };

        let status = response.status();
        FEDERATION_REQUESTS_TOTAL
            .with_label_values(&["actor_fetch", status.as_str()])
            .inc();

        if !status.is_success() {
            tracing::debug!(actor = actor_url, status = status.as_u16(), "Actor fetch returned error status");
            return Ok(ActorFetch::Status(status.as_u16()));
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_ascii_lowercase();
        if !content_type.contains("json") {
            return Err(AppError::Federation(format!(
                "Unexpected actor content type: {}",
                content_type
            )));
        }

        let document: Value = response
            .json()
            .await
            .map_err(|e| AppError::Federation(format!("Failed to parse actor: {}", e)))?;

        Ok(ActorFetch::Found(RemoteActor::from_document(&document)?))
    }

    /// Whether a live cache entry exists for `iri`.
    pub async fn is_cached(&self, iri: &str) -> bool {
        let actor_url = iri.split('#').next().unwrap_or(iri);
        self.cache
            .read()
            .await
            .get(actor_url)
            .is_some_and(|c| c.is_valid())
    }

    /// Drop a cached entry, e.g. after the actor sent an Update.
    pub async fn invalidate(&self, iri: &str) {
        let actor_url = iri.split('#').next().unwrap_or(iri);
        self.cache.write().await.remove(actor_url);
        tracing::debug!(actor = actor_url, "Invalidated actor cache entry");
    }

    /// Remove expired entries.
    pub async fn prune_expired(&self) {
        let mut cache = self.cache.write().await;
        let before = cache.len();
        cache.retain(|_, v| v.is_valid());
        let removed = before - cache.len();

        if removed > 0 {
            tracing::info!("Pruned {} expired actor cache entries", removed);
        }
    }

    pub async fn cached_entries(&self) -> usize {
        self.cache.read().await.len()
    }
}

fn is_disallowed_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_multicast()
                || v4.is_unspecified()
        }
        IpAddr::V6(v6) => {
            v6.is_loopback()
                || v6.is_unique_local()
                || v6.is_unicast_link_local()
                || v6.is_multicast()
                || v6.is_unspecified()
        }
    }
}

fn is_disallowed_host(host: &str) -> bool {
    let normalized = host.trim_end_matches('.').to_ascii_lowercase();
    if normalized == "localhost" || normalized.ends_with(".localhost") {
        return true;
    }

    normalized
        .trim_start_matches('[')
        .trim_end_matches(']')
        .parse::<IpAddr>()
        .map(is_disallowed_ip)
        .unwrap_or(false)
}

async fn validate_resolved_host_ips(host: &str, port: u16) -> Result<(), AppError> {
    let normalized = host.trim_end_matches('.').to_ascii_lowercase();

    let mut resolved_any = false;
    let lookup = tokio::net::lookup_host((normalized.as_str(), port))
        .await
        .map_err(|e| AppError::Federation(format!("Failed to resolve actor host: {}", e)))?;

    for addr in lookup {
        resolved_any = true;
        if is_disallowed_ip(addr.ip()) {
            return Err(AppError::Forbidden);
        }
    }

    if !resolved_any {
        return Err(AppError::Federation(
            "No DNS records for actor host".to_string(),
        ));
    }

    Ok(())
}

/// Refuse URLs whose host is, or resolves to, a local or private address.
pub async fn ensure_public_url(raw: &str) -> Result<(), AppError> {
    let parsed = url::Url::parse(raw)
        .map_err(|e| AppError::Validation(format!("Invalid URL: {}", e)))?;
    let host = extract_actor_domain(raw)?;
    let port = parsed
        .port_or_known_default()
        .ok_or_else(|| AppError::Validation("Missing port in URL".to_string()))?;
    validate_resolved_host_ips(&host, port).await
}

/// Host of an actor IRI or key id; local and private hosts are refused.
pub fn extract_actor_domain(actor_or_key_id: &str) -> Result<String, AppError> {
    let actor_url = actor_or_key_id.split('#').next().unwrap_or(actor_or_key_id);
    let parsed = url::Url::parse(actor_url)
        .map_err(|e| AppError::Validation(format!("Invalid actor URL: {}", e)))?;

    match parsed.scheme() {
        "http" | "https" => {}
        scheme => {
            return Err(AppError::Validation(format!(
                "Unsupported actor URL scheme: {}",
                scheme
            )));
        }
    }

    let host = parsed
        .host_str()
        .ok_or_else(|| AppError::Validation("Missing host in actor URL".to_string()))?
        .to_ascii_lowercase();

    if is_disallowed_host(&host) {
        return Err(AppError::Forbidden);
    }

    Ok(host)
}
