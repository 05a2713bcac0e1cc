//! quillfed - social-web federation for a personal multi-blog server
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      API Layer (Axum)                        │
//! │  - ActivityPub inbox, followers, remote follow               │
//! │  - Webfinger, host-meta, NodeInfo                            │
//! │  - Webmention endpoint and admin                             │
//! │  - Post documents and post hooks                             │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │               Federation / Webmention Layer                  │
//! │  - Inbox processing, outbox fan-out                          │
//! │  - Signed delivery, mention verification                     │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                  Data Layer / Queue                          │
//! │  - SQLite (sqlx)                                             │
//! │  - Persistent named queues (`ap_send`, `wm`)                 │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - `api`: HTTP handlers
//! - `federation`: ActivityPub federation handling
//! - `webmention`: Webmention sending, receiving and verification
//! - `queue`: Durable work queue and workers
//! - `data`: Database layer
//! - `auth`: Owner session
//! - `config`: Configuration management
//! - `error`: Error types

pub mod api;
pub mod auth;
pub mod config;
pub mod data;
pub mod error;
pub mod federation;
pub mod metrics;
pub mod notify;
pub mod queue;
pub mod urls;
pub mod webmention;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Overall deadline of one outbound HTTP request
const HTTP_TIMEOUT: Duration = Duration::from_secs(300);
/// How often expired actor cache entries are dropped
const ACTOR_CACHE_PRUNE_INTERVAL: Duration = Duration::from_secs(600);

/// Application state shared across all handlers
///
/// This struct is cloned for each request and contains
/// shared resources like database pool, queue handle, and HTTP client.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration
    pub config: Arc<config::AppConfig>,

    /// Database connection pool
    pub db: Arc<data::Database>,

    /// Persistent work queue
    pub queue: queue::Queue,

    /// Site signing key
    pub keys: Arc<federation::KeyStore>,

    /// HTTP client for federation and webmentions
    pub http_client: Arc<reqwest::Client>,

    /// Remote actor cache
    pub resolver: Arc<federation::ActorResolver>,

    pub notifier: notify::Notifier,

    /// Inbox processing
    pub inbox: federation::ActivityProcessor,

    /// Post fan-out
    pub outbox: federation::Outbox,

    /// Webfinger resources, built once from the configuration
    pub webfinger: Arc<federation::WebfingerIndex>,
}

impl AppState {
    /// Initialize application state
    ///
    /// # Steps
    /// 1. Connect to SQLite database
    /// 2. Load or generate the signing key
    /// 3. Build the HTTP client
    /// 4. Wire federation and webmention services
    ///
    /// # Errors
    /// Returns error if any initialization step fails
    pub async fn new(config: config::AppConfig) -> Result<Self, error::AppError> {
        tracing::info!("Initializing application state...");

        let db = Arc::new(data::Database::connect(&config.database.path).await?);

        let keys = federation::KeyStore::load_or_generate(&db, config.activitypub.key_bits).await?;

        let http_client = reqwest::Client::builder()
            .user_agent(concat!("quillfed/", env!("CARGO_PKG_VERSION")))
            .timeout(HTTP_TIMEOUT)
            .pool_max_idle_per_host(0)
            .build()
            .map_err(|e| error::AppError::Internal(e.into()))?;

        let state = Self::assemble(config, db, keys, http_client);

        match state.db.count_followers().await {
            Ok(count) => metrics::FOLLOWERS_TOTAL.set(count),
            Err(error) => tracing::warn!(%error, "Failed to count followers"),
        }

        tracing::info!("Application state initialized successfully");
        Ok(state)
    }

    /// Wire services over already-open resources.
    pub fn assemble(
        config: config::AppConfig,
        db: Arc<data::Database>,
        keys: federation::KeyStore,
        http_client: reqwest::Client,
    ) -> Self {
        let config = Arc::new(config);
        let http_client = Arc::new(http_client);
        let queue = queue::Queue::new(db.clone());
        let notifier = notify::Notifier::new(db.clone());
        let resolver = Arc::new(federation::ActorResolver::new(
            http_client.clone(),
            &config.activitypub,
        ));

        let inbox = federation::ActivityProcessor::new(
            config.clone(),
            db.clone(),
            queue.clone(),
            resolver.clone(),
            notifier.clone(),
        );
        let webmentions = webmention::WebmentionSender::new(
            config.clone(),
            db.clone(),
            queue.clone(),
            http_client.clone(),
        );
        let outbox = federation::Outbox::new(config.clone(), db.clone(), queue.clone(), webmentions);
        let webfinger = Arc::new(federation::WebfingerIndex::build(&config));

        Self {
            config,
            db,
            queue,
            keys: Arc::new(keys),
            http_client,
            resolver,
            notifier,
            inbox,
            outbox,
            webfinger,
        }
    }
}

/// Build the Axum router with all routes.
///
/// This is shared by the binary and integration tests to keep route
/// composition consistent across environments.
pub fn build_router(state: AppState) -> axum::Router {
    use axum::Router;
    use tower_http::{compression::CompressionLayer, trace::TraceLayer};

    let cors_layer = build_cors_layer(&state.config.server);

    Router::new()
        .merge(auth::auth_router())
        .merge(api::wellknown_router())
        .merge(api::activitypub_router())
        .merge(api::webmention_router())
        .nest("/api", api::posts_router())
        .fallback(api::site::serve)
        .layer(CompressionLayer::new())
        .layer(TraceLayer::new_for_http())
        .layer(cors_layer)
        .with_state(state)
        .merge(api::metrics_router())
}

fn build_cors_layer(server: &config::ServerConfig) -> tower_http::cors::CorsLayer {
    use axum::http::HeaderValue;
    use tower_http::cors::{Any, CorsLayer};

    if !server.public_address.starts_with("https://") {
        return CorsLayer::permissive();
    }

    let allowed_origin = server.public_address();
    match HeaderValue::from_str(allowed_origin) {
        Ok(origin) => CorsLayer::new()
            .allow_origin([origin])
            .allow_methods(Any)
            .allow_headers(Any),
        Err(error) => {
            tracing::error!(
                %error,
                origin = %allowed_origin,
                "Failed to parse CORS origin from public address; denying cross-origin requests"
            );
            CorsLayer::new().allow_methods(Any).allow_headers(Any)
        }
    }
}

/// Start one worker per queue name plus the actor cache janitor.
///
/// `router` is the application router; mention verification requests
/// local pages through it in-process. All tasks return once `shutdown`
/// flips to `true`.
pub fn spawn_workers(
    state: &AppState,
    router: axum::Router,
    shutdown: watch::Receiver<bool>,
) -> Vec<JoinHandle<()>> {
    let poll_interval = Duration::from_secs(state.config.queue.poll_interval_seconds.max(1));
    let mut handles = Vec::new();

    let sender = federation::ApSender::new(state.http_client.clone(), state.keys.clone());
    let db = state.db.clone();
    handles.push(tokio::spawn(queue::run_worker(
        state.queue.clone(),
        queue::AP_SEND_QUEUE,
        poll_interval,
        shutdown.clone(),
        move |item| {
            let sender = sender.clone();
            let db = db.clone();
            async move { sender.handle_item(&db, &item).await }
        },
    )));

    let verifier = webmention::MentionVerifier::new(
        state.config.clone(),
        state.db.clone(),
        state.http_client.clone(),
        webmention::LocalClient::new(router, state.config.clone()),
        state.notifier.clone(),
    );
    handles.push(tokio::spawn(queue::run_worker(
        state.queue.clone(),
        queue::WEBMENTION_QUEUE,
        poll_interval,
        shutdown.clone(),
        move |item| {
            let verifier = verifier.clone();
            async move { verifier.handle_item(&item).await }
        },
    )));

    let webmentions = state.outbox.webmention_sender().clone();
    handles.push(tokio::spawn(queue::run_worker(
        state.queue.clone(),
        queue::WEBMENTION_SEND_QUEUE,
        poll_interval,
        shutdown.clone(),
        move |item| {
            let webmentions = webmentions.clone();
            async move { webmentions.handle_item(&item).await }
        },
    )));

    let resolver = state.resolver.clone();
    let mut shutdown = shutdown;
    handles.push(tokio::spawn(async move {
        let mut interval = tokio::time::interval(ACTOR_CACHE_PRUNE_INTERVAL);
        loop {
            tokio::select! {
                _ = interval.tick() => resolver.prune_expired().await,
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }));

    handles
}
