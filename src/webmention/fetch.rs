//! Page fetching for verification
//!
//! Local pages are requested from the application router in-process with
//! an owner session, so drafts and private posts are reachable. Other
//! pages go through the shared HTTP client.

use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::http::{Method, Request, StatusCode, header};
use tower::ServiceExt;
use url::{Position, Url};

use crate::auth::{Session, create_session_token};
use crate::config::{AppConfig, url_authority};
use crate::error::AppError;
use crate::urls::is_local_url;

/// Largest body read from a fetched page.
const MAX_PAGE_BYTES: usize = 10 * 1024 * 1024;
const MAX_LOCAL_REDIRECTS: usize = 5;
/// Lifetime of the session minted for one in-process request.
const LOCAL_SESSION_SECS: i64 = 60;

/// A fetched page
#[derive(Debug, Clone)]
pub struct FetchedPage {
    pub status: u16,
    /// URL after redirects
    pub final_url: String,
    pub body: Vec<u8>,
}

impl FetchedPage {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// In-process client over the application router
#[derive(Clone)]
pub struct LocalClient {
    router: Router,
    config: Arc<AppConfig>,
}

impl LocalClient {
    pub fn new(router: Router, config: Arc<AppConfig>) -> Self {
        Self { router, config }
    }

    /// GET `url` as the logged-in owner, following local redirects.
    pub async fn get(&self, url: &str) -> Result<FetchedPage, AppError> {
        let session = Session::new(&self.config.auth.username, LOCAL_SESSION_SECS);
        let token = create_session_token(&session, &self.config.auth.session_secret)?;

        let mut current = Url::parse(url)
            .map_err(|e| AppError::Validation(format!("Invalid URL {}: {}", url, e)))?;

        for _ in 0..=MAX_LOCAL_REDIRECTS {
            let host = url_authority(current.as_str())
                .ok_or_else(|| AppError::Validation(format!("Invalid URL {}", current)))?;
            let request = Request::builder()
                .method(Method::GET)
                .uri(&current[Position::BeforePath..])
                .header(header::HOST, host)
                .header(header::ACCEPT, "text/html")
                .header(header::AUTHORIZATION, format!("Bearer {}", token))
                .body(Body::empty())
                .map_err(|e| AppError::Internal(e.into()))?;

            let response = match self.router.clone().oneshot(request).await {
                Ok(response) => response,
                Err(never) => match never {},
            };
            let status = response.status();

            if status.is_redirection() {
                let next = response
                    .headers()
                    .get(header::LOCATION)
                    .and_then(|l| l.to_str().ok())
                    .and_then(|l| current.join(l).ok());
                match next {
                    Some(next) if is_local_url(&self.config.server, next.as_str()) => {
                        current = next;
                        continue;
                    }
                    _ => {
                        return Ok(FetchedPage {
                            status: status.as_u16(),
                            final_url: current.to_string(),
                            body: Vec::new(),
                        });
                    }
                }
            }

            let body = axum::body::to_bytes(response.into_body(), MAX_PAGE_BYTES)
                .await
                .map_err(|e| AppError::Internal(anyhow::anyhow!("Failed to read local page: {}", e)))?;
            return Ok(FetchedPage {
                status: status.as_u16(),
                final_url: current.to_string(),
                body: body.to_vec(),
            });
        }

        Ok(FetchedPage {
            status: StatusCode::LOOP_DETECTED.as_u16(),
            final_url: current.to_string(),
            body: Vec::new(),
        })
    }
}

/// GET a remote page; redirects are followed by the client.
pub async fn fetch_external(
    http_client: &reqwest::Client,
    url: &str,
) -> Result<FetchedPage, AppError> {
    let response = http_client
        .get(url)
        .header(reqwest::header::ACCEPT, "text/html, application/xhtml+xml, */*;q=0.8")
        .send()
        .await?;

    let status = response.status().as_u16();
    let final_url = response.url().to_string();
    let body = response.bytes().await?;
    if body.len() > MAX_PAGE_BYTES {
        return Err(AppError::Validation(format!("Page {} is too large", url)));
    }

    Ok(FetchedPage {
        status,
        final_url,
        body: body.to_vec(),
    })
}
