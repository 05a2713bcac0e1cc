//! Common test utilities for E2E tests

#![allow(dead_code)]

pub mod schema_validator;

use std::collections::BTreeMap;
use std::sync::OnceLock;

use axum::Router;
use quillfed::auth::{Session, create_session_token};
use quillfed::federation::KeyStore;
use quillfed::{AppState, config};
use rsa::RsaPrivateKey;
use rsa::pkcs8::{EncodePrivateKey, LineEnding};
use tempfile::TempDir;
use tokio::net::TcpListener;

/// Test server instance
pub struct TestServer {
    pub addr: String,
    /// `http://localhost:<port>`, configured as an alt domain
    pub alt_addr: String,
    pub state: AppState,
    pub router: Router,
    pub _temp_dir: TempDir,
    pub client: reqwest::Client,
}

impl TestServer {
    /// Create a new test server instance
    pub async fn new() -> Self {
        Self::with_config(|_| {}).await
    }

    /// Create a test server after adjusting the default test configuration.
    pub async fn with_config(adjust: impl FnOnce(&mut config::AppConfig)) -> Self {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("test.db");

        // Bind first so the public address can carry the port.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let addr = format!("http://127.0.0.1:{}", port);
        let alt_addr = format!("http://localhost:{}", port);

        let mut config = test_config(&addr, &alt_addr, db_path);
        adjust(&mut config);

        quillfed::metrics::init_metrics();
        let state = AppState::new(config).await.unwrap();
        let router = quillfed::build_router(state.clone());

        let app = router.clone();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .unwrap();

        Self {
            addr,
            alt_addr,
            state,
            router,
            _temp_dir: temp_dir,
            client,
        }
    }

    /// Get base URL for requests
    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.addr, path)
    }

    /// Session token for the configured owner
    pub fn token(&self) -> String {
        let auth = &self.state.config.auth;
        let session = Session::new(&auth.username, auth.session_max_age);
        create_session_token(&session, &auth.session_secret).unwrap()
    }
}

fn test_config(addr: &str, alt_addr: &str, db_path: std::path::PathBuf) -> config::AppConfig {
    let mut blogs = BTreeMap::new();
    blogs.insert(
        "main".to_string(),
        config::BlogConfig {
            path: "/".to_string(),
            title: "Main".to_string(),
            description: "Main blog".to_string(),
            lang: "en".to_string(),
        },
    );
    blogs.insert(
        "notes".to_string(),
        config::BlogConfig {
            path: "/notes".to_string(),
            title: "Notes".to_string(),
            description: "Short notes".to_string(),
            lang: "en".to_string(),
        },
    );

    config::AppConfig {
        server: config::ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            public_address: addr.to_string(),
            short_public_address: None,
            alt_domains: vec![alt_addr.to_string()],
            utc_offset: "+00:00".to_string(),
        },
        database: config::DatabaseConfig { path: db_path },
        auth: config::AuthConfig {
            username: "owner".to_string(),
            password: "correct horse".to_string(),
            session_secret: "test-secret-key-32-bytes-long!!!".to_string(),
            session_max_age: 604800,
        },
        user: config::UserConfig {
            name: "Test Owner".to_string(),
            picture: None,
        },
        default_blog: "main".to_string(),
        blogs,
        activitypub: config::ActivityPubConfig {
            enabled: true,
            key_bits: 1024,
            actor_cache_ttl_seconds: 3600,
            negative_cache_ttl_seconds: 3600,
            allow_private_addresses: true,
        },
        webmention: config::WebmentionConfig {
            disable_sending: true,
            disable_receiving: false,
        },
        queue: config::QueueConfig {
            poll_interval_seconds: 1,
        },
        logging: config::LoggingConfig {
            level: "info".to_string(),
            format: "pretty".to_string(),
        },
    }
}

/// Serve `router` on a random local port and return its base URL.
pub async fn spawn_mock(router: Router) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = format!("http://{}", listener.local_addr().unwrap());
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    addr
}

/// PKCS#8 PEM of a small RSA key, generated once per test binary.
pub fn remote_key_pem() -> &'static str {
    static PEM: OnceLock<String> = OnceLock::new();
    PEM.get_or_init(|| {
        let mut rng = rand::thread_rng();
        let key = RsaPrivateKey::new(&mut rng, 1024).unwrap();
        key.to_pkcs8_pem(LineEnding::LF).unwrap().to_string()
    })
}

/// A second remote key, for simulating key rotation
pub fn rotated_key_pem() -> &'static str {
    static PEM: OnceLock<String> = OnceLock::new();
    PEM.get_or_init(|| {
        let mut rng = rand::thread_rng();
        let key = RsaPrivateKey::new(&mut rng, 1024).unwrap();
        key.to_pkcs8_pem(LineEnding::LF).unwrap().to_string()
    })
}

/// Key store for a simulated remote actor
pub fn remote_keys() -> KeyStore {
    KeyStore::from_pem(remote_key_pem()).unwrap()
}
