//! WebFinger protocol implementation
//!
//! Local lookups map `acct:` handles and blog IRIs to blog actors.
//! Remote lookups are only used to find a server's OStatus subscribe
//! template for the remote follow flow.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::actor::ensure_public_url;
use crate::config::AppConfig;
use crate::error::AppError;

pub const JRD_CONTENT_TYPE: &str = "application/jrd+json; charset=utf-8";
pub const PROFILE_PAGE_REL: &str = "http://webfinger.net/rel/profile-page";
pub const SUBSCRIBE_REL: &str = "http://ostatus.org/schema/1.0/subscribe";

/// WebFinger JRD response
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct WebFingerResponse {
    pub subject: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aliases: Option<Vec<String>>,
    #[serde(default)]
    pub links: Vec<WebFingerLink>,
}

/// WebFinger link
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct WebFingerLink {
    pub rel: String,
    #[serde(rename = "type")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub href: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<String>,
}

/// Resource -> blog name, built once from the configuration.
#[derive(Debug, Clone, Default)]
pub struct WebfingerIndex {
    resources: HashMap<String, String>,
}

impl WebfingerIndex {
    pub fn build(config: &AppConfig) -> Self {
        let hosts: Vec<String> = config
            .server
            .public_host()
            .into_iter()
            .chain(config.server.short_host())
            .collect();

        let mut resources = HashMap::new();
        for name in config.blogs.keys() {
            for host in &hosts {
                let handle = format!("{}@{}", name, host).to_ascii_lowercase();
                resources.insert(format!("acct:{}", handle), name.clone());
                resources.insert(handle, name.clone());
            }
            if let Some(iri) = config.blog_iri(name) {
                resources.insert(iri.to_ascii_lowercase(), name.clone());
            }
        }

        Self { resources }
    }

    /// Blog named by `resource`, if it is one of ours.
    pub fn lookup(&self, resource: &str) -> Option<&str> {
        let mut resource = resource.trim().to_ascii_lowercase();
        if resource.starts_with("acct:@") {
            resource.remove(5);
        } else if resource.starts_with('@') {
            resource.remove(0);
        }
        self.resources.get(&resource).map(String::as_str)
    }
}

/// JRD for a local blog.
pub fn generate_webfinger_response(config: &AppConfig, blog: &str) -> Option<WebFingerResponse> {
    let iri = config.blog_iri(blog)?;
    let host = config.server.public_host()?;
    let subject = format!("acct:{}@{}", blog, host);

    Some(WebFingerResponse {
        subject: subject.clone(),
        aliases: Some(vec![subject, iri.clone()]),
        links: vec![
            WebFingerLink {
                rel: "self".to_string(),
                link_type: Some("application/activity+json".to_string()),
                href: Some(iri.clone()),
                template: None,
            },
            WebFingerLink {
                rel: PROFILE_PAGE_REL.to_string(),
                link_type: Some("text/html".to_string()),
                href: Some(iri),
                template: None,
            },
        ],
    })
}

/// Split `user@host`, `@user@host` or `acct:user@host`.
pub fn parse_account_address(address: &str) -> Option<(String, String)> {
    let address = address.trim();
    let address = address.strip_prefix("acct:").unwrap_or(address);
    let address = address.strip_prefix('@').unwrap_or(address);
    let (user, host) = address.split_once('@')?;

    let valid_host = !host.is_empty()
        && host
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | ':'));
    if user.is_empty() || user.contains('/') || !valid_host {
        return None;
    }
    Some((user.to_string(), host.to_ascii_lowercase()))
}

/// The OStatus subscribe template advertised in a JRD.
pub fn subscribe_template(response: &WebFingerResponse) -> Option<&str> {
    response
        .links
        .iter()
        .find(|link| link.rel == SUBSCRIBE_REL)
        .and_then(|link| link.template.as_deref())
}

/// Look up `address` on its home server and return the subscribe
/// template.
///
/// Unless `allow_private_addresses` is set, hosts that are or resolve to
/// local or private addresses are refused before any request is made.
pub async fn resolve_subscribe_template(
    address: &str,
    http_client: &reqwest::Client,
    allow_private_addresses: bool,
) -> Result<String, AppError> {
    let (user, host) = parse_account_address(address)
        .ok_or_else(|| AppError::Validation(format!("Invalid account address: {}", address)))?;

    let url = format!(
        "https://{}/.well-known/webfinger?resource={}",
        host,
        urlencoding::encode(&format!("acct:{}@{}", user, host))
    );
    if !allow_private_addresses {
        ensure_public_url(&url).await?;
    }

    let response = http_client
        .get(&url)
        .header(reqwest::header::ACCEPT, "application/jrd+json, application/json")
        .send()
        .await?;

    if !response.status().is_success() {
        return Err(AppError::Federation(format!(
            "WebFinger lookup for {} failed: HTTP {}",
            address,
            response.status()
        )));
    }

    let jrd: WebFingerResponse = response
        .json()
        .await
        .map_err(|e| AppError::Federation(format!("Invalid WebFinger response: {}", e)))?;

    subscribe_template(&jrd)
        .map(str::to_string)
        .ok_or_else(|| AppError::Federation(format!("{} has no subscribe template", address)))
}

/// Expand a subscribe template for `iri`; only http(s) results are used.
pub fn expand_subscribe_template(template: &str, iri: &str) -> Result<String, AppError> {
    let target = template.replace("{uri}", &urlencoding::encode(iri));
    match url::Url::parse(&target) {
        Ok(parsed) if matches!(parsed.scheme(), "http" | "https") && parsed.has_host() => {
            Ok(target)
        }
        _ => Err(AppError::Federation(format!(
            "Unusable subscribe template: {}",
            template
        ))),
    }
}
