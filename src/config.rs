//! Configuration management
//!
//! Loads configuration from:
//! 1. Default values
//! 2. Configuration files (config/default.toml, config/local.toml)
//! 3. Environment variables (override)

use chrono::FixedOffset;
use serde::Deserialize;
use std::{collections::BTreeMap, path::PathBuf};

/// Main application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub auth: AuthConfig,
    #[serde(default)]
    pub user: UserConfig,
    /// Blog used for requests that don't name one
    pub default_blog: String,
    pub blogs: BTreeMap<String, BlogConfig>,
    pub activitypub: ActivityPubConfig,
    pub webmention: WebmentionConfig,
    pub queue: QueueConfig,
    pub logging: LoggingConfig,
}

/// Server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Bind address (e.g., "0.0.0.0")
    pub host: String,
    /// Port number (e.g., 8080)
    pub port: u16,
    /// Canonical public address, e.g. "https://blog.example.com"
    pub public_address: String,
    /// Optional short address that serves the same content
    #[serde(default)]
    pub short_public_address: Option<String>,
    /// Previous or secondary addresses that redirect to the public address
    #[serde(default)]
    pub alt_domains: Vec<String>,
    /// Offset used when rendering timestamps, e.g. "+02:00"
    pub utc_offset: String,
}

impl ServerConfig {
    /// Public address without a trailing slash.
    pub fn public_address(&self) -> &str {
        self.public_address.trim_end_matches('/')
    }

    /// Host (and explicit port) of the public address, e.g. "blog.example.com".
    pub fn public_host(&self) -> Option<String> {
        url_authority(self.public_address())
    }

    /// Host of the short public address, if configured.
    pub fn short_host(&self) -> Option<String> {
        self.short_public_address
            .as_deref()
            .and_then(url_authority)
    }

    /// Alt domain addresses without trailing slashes.
    pub fn alt_addresses(&self) -> impl Iterator<Item = &str> {
        self.alt_domains.iter().map(|d| d.trim_end_matches('/'))
    }

    /// Parsed `utc_offset`.
    pub fn offset(&self) -> Option<FixedOffset> {
        parse_utc_offset(&self.utc_offset)
    }
}

/// Database configuration (SQLite only)
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Path to SQLite database file
    pub path: PathBuf,
}

/// Authentication configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    /// Login name of the blog owner
    pub username: String,
    /// Login password of the blog owner
    pub password: String,
    /// Session secret key (32+ bytes)
    pub session_secret: String,
    /// Session max age in seconds (default: 604800 = 7 days)
    pub session_max_age: i64,
}

/// Blog owner profile
#[derive(Debug, Clone, Deserialize, Default)]
pub struct UserConfig {
    #[serde(default)]
    pub name: String,
    /// Absolute URL of the profile picture
    #[serde(default)]
    pub picture: Option<String>,
}

/// A single blog hosted by this server
#[derive(Debug, Clone, Deserialize)]
pub struct BlogConfig {
    /// Path prefix, "/" for the root blog
    pub path: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_lang")]
    pub lang: String,
}

fn default_lang() -> String {
    "en".to_string()
}

/// ActivityPub settings
#[derive(Debug, Clone, Deserialize)]
pub struct ActivityPubConfig {
    pub enabled: bool,
    /// RSA modulus size for a freshly generated key
    pub key_bits: usize,
    /// How long a fetched actor stays cached
    pub actor_cache_ttl_seconds: u64,
    /// How long a 404/410 actor lookup stays cached
    pub negative_cache_ttl_seconds: u64,
    /// Allow actor fetches to loopback/private hosts (tests, intranets)
    pub allow_private_addresses: bool,
}

/// Webmention settings
#[derive(Debug, Clone, Deserialize)]
pub struct WebmentionConfig {
    pub disable_sending: bool,
    pub disable_receiving: bool,
}

/// Queue worker settings
#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    /// Sleep between polls when a queue is empty
    pub poll_interval_seconds: u64,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    pub level: String,
    /// Log format: "pretty" or "json"
    pub format: String,
}

impl AppConfig {
    /// Load configuration from file and environment
    ///
    /// # Loading Order
    /// 1. Default values
    /// 2. config/default.toml (if exists)
    /// 3. config/local.toml (if exists)
    /// 4. Environment variables (QUILLFED__*)
    ///
    /// # Errors
    /// Returns error if configuration is invalid
    pub fn load() -> Result<Self, crate::error::AppError> {
        use config::{Config, Environment, File};

        let config = Config::builder()
            .set_default("server.host", "127.0.0.1")?
            .set_default("server.port", 8080)?
            .set_default("server.utc_offset", "+00:00")?
            .set_default("database.path", "data/quillfed.db")?
            .set_default("auth.username", "admin")?
            .set_default("auth.session_max_age", 604800)?
            .set_default("activitypub.enabled", true)?
            .set_default("activitypub.key_bits", 2048)?
            .set_default("activitypub.actor_cache_ttl_seconds", 3600)?
            .set_default("activitypub.negative_cache_ttl_seconds", 3600)?
            .set_default("activitypub.allow_private_addresses", false)?
            .set_default("webmention.disable_sending", false)?
            .set_default("webmention.disable_receiving", false)?
            .set_default("queue.poll_interval_seconds", 15)?
            .set_default("logging.level", "info")?
            .set_default("logging.format", "pretty")?
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name("config/local").required(false))
            .add_source(
                Environment::with_prefix("QUILLFED")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let app_config: Self = config.try_deserialize()?;
        app_config.validate()?;
        Ok(app_config)
    }

    /// Look up a blog by name.
    pub fn blog(&self, name: &str) -> Option<&BlogConfig> {
        self.blogs.get(name)
    }

    /// ActivityPub IRI of a blog under the main public address.
    pub fn blog_iri(&self, name: &str) -> Option<String> {
        self.blog(name)
            .map(|blog| join_address(self.server.public_address(), &blog.path))
    }

    /// Find the blog whose path equals `path` (trailing slash ignored).
    pub fn blog_by_path(&self, path: &str) -> Option<(&str, &BlogConfig)> {
        let wanted = normalize_blog_path(path);
        self.blogs
            .iter()
            .find(|(_, blog)| normalize_blog_path(&blog.path) == wanted)
            .map(|(name, blog)| (name.as_str(), blog))
    }

    /// Find the blog whose path prefix owns `path` (longest prefix wins).
    pub fn blog_for_post_path(&self, path: &str) -> &str {
        self.blogs
            .iter()
            .filter(|(_, blog)| {
                let prefix = normalize_blog_path(&blog.path);
                prefix == "/" || path == prefix || path.starts_with(&format!("{}/", prefix))
            })
            .max_by_key(|(_, blog)| normalize_blog_path(&blog.path).len())
            .map(|(name, _)| name.as_str())
            .unwrap_or(self.default_blog.as_str())
    }

    pub fn should_use_secure_cookies(&self) -> bool {
        self.server.public_address.starts_with("https://")
    }

    pub(crate) fn validate(&self) -> Result<(), crate::error::AppError> {
        use crate::error::AppError;
        const MIN_SESSION_SECRET_BYTES: usize = 32;

        if self.blogs.is_empty() {
            return Err(AppError::Config("at least one blog must be configured".into()));
        }

        if !self.blogs.contains_key(&self.default_blog) {
            return Err(AppError::Config(format!(
                "default_blog {} is not a configured blog",
                self.default_blog
            )));
        }

        for (name, blog) in &self.blogs {
            if !blog.path.starts_with('/') {
                return Err(AppError::Config(format!(
                    "blogs.{}.path must start with /",
                    name
                )));
            }
        }

        for (key, address) in std::iter::once(("server.public_address", &self.server.public_address))
            .chain(
                self.server
                    .short_public_address
                    .iter()
                    .map(|a| ("server.short_public_address", a)),
            )
            .chain(self.server.alt_domains.iter().map(|a| ("server.alt_domains", a)))
        {
            if url_authority(address).is_none() {
                return Err(AppError::Config(format!(
                    "{} must be an absolute http(s) URL: {}",
                    key, address
                )));
            }
        }

        if self.server.offset().is_none() {
            return Err(AppError::Config(format!(
                "server.utc_offset is not a valid offset: {}",
                self.server.utc_offset
            )));
        }

        if self.auth.session_secret.as_bytes().len() < MIN_SESSION_SECRET_BYTES {
            return Err(AppError::Config(format!(
                "auth.session_secret must be at least {} bytes",
                MIN_SESSION_SECRET_BYTES
            )));
        }

        if self.auth.session_max_age <= 0 {
            return Err(AppError::Config(
                "auth.session_max_age must be greater than 0".to_string(),
            ));
        }

        if !self.should_use_secure_cookies() {
            tracing::warn!(
                public_address = %self.server.public_address,
                "Using insecure session cookies because the public address is not https"
            );
        }

        Ok(())
    }
}

/// `host[:port]` of an absolute http(s) URL.
pub(crate) fn url_authority(address: &str) -> Option<String> {
    let parsed = url::Url::parse(address).ok()?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return None;
    }
    let host = parsed.host_str()?.to_ascii_lowercase();
    Some(match parsed.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host,
    })
}

/// `address` + blog `path`; the root blog keeps its trailing slash.
pub(crate) fn join_address(address: &str, path: &str) -> String {
    format!("{}{}", address.trim_end_matches('/'), path)
}

fn normalize_blog_path(path: &str) -> &str {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() { "/" } else { trimmed }
}

fn parse_utc_offset(value: &str) -> Option<FixedOffset> {
    let value = value.trim();
    if value.eq_ignore_ascii_case("z") || value.eq_ignore_ascii_case("utc") {
        return FixedOffset::east_opt(0);
    }

    let (sign, rest) = match value.as_bytes().first()? {
        b'+' => (1, &value[1..]),
        b'-' => (-1, &value[1..]),
        _ => return None,
    };
    let (hours, minutes) = rest.split_once(':').unwrap_or((rest, "0"));
    let hours: i32 = hours.parse().ok()?;
    let minutes: i32 = minutes.parse().ok()?;
    if hours > 23 || minutes > 59 {
        return None;
    }

    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
}
