//! Activity delivery
//!
//! Outbound activities are queued as [`SendRequest`] items on the
//! `ap_send` queue; the worker signs each one and POSTs it to its inbox.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::keys::KeyStore;
use super::serializer::ACTIVITY_JSON;
use super::signature::sign_request;
use crate::data::{Database, QueueItem};
use crate::error::AppError;
use crate::metrics::{
    ACTIVITYPUB_ACTIVITIES_SENT, FEDERATION_REQUEST_DURATION_SECONDS, FEDERATION_REQUESTS_TOTAL,
    FOLLOWERS_TOTAL,
};
use crate::queue::{AP_SEND_QUEUE, Outcome, Queue};

/// Attempts after which a 4xx rejection is final.
const MAX_CLIENT_ERROR_ATTEMPTS: i64 = 3;

/// Payload of an `ap_send` queue item
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SendRequest {
    pub inbox: String,
    /// Sending blog; the key id is `<blog_iri>#main-key`
    pub blog_iri: String,
    pub activity: Value,
    /// Set when the activity is addressed to one actor (e.g. an Accept);
    /// a gone inbox then removes only that actor.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_actor: Option<String>,
}

impl SendRequest {
    pub fn activity_type(&self) -> &str {
        self.activity
            .get("type")
            .and_then(|t| t.as_str())
            .unwrap_or("Unknown")
    }
}

/// Commit a send request to the queue, due at `at`.
pub async fn enqueue_send(
    queue: &Queue,
    request: &SendRequest,
    at: DateTime<Utc>,
) -> Result<i64, AppError> {
    let payload = serde_json::to_vec(request)
        .map_err(|e| AppError::Internal(anyhow::anyhow!("Failed to encode send request: {}", e)))?;
    let id = queue.enqueue(AP_SEND_QUEUE, &payload, at).await?;
    ACTIVITYPUB_ACTIVITIES_SENT
        .with_label_values(&[request.activity_type()])
        .inc();
    Ok(id)
}

/// Statuses that count as delivered.
pub fn is_delivered(status: u16) -> bool {
    matches!(status, 200 | 201 | 202 | 204)
}

/// Signs and POSTs activities
#[derive(Clone)]
pub struct ApSender {
    http_client: Arc<reqwest::Client>,
    keys: Arc<KeyStore>,
}

impl ApSender {
    pub fn new(http_client: Arc<reqwest::Client>, keys: Arc<KeyStore>) -> Self {
        Self { http_client, keys }
    }

    /// POST `activity` to `inbox`, signed as `blog_iri`.
    ///
    /// Returns the response status; transport failures are errors.
    pub async fn send(&self, inbox: &str, blog_iri: &str, activity: &Value) -> Result<u16, AppError> {
        let body = serde_json::to_vec(activity)
            .map_err(|e| AppError::Validation(format!("Failed to serialize activity: {}", e)))?;

        let key_id = format!("{}#main-key", blog_iri);
        let sig_headers = sign_request("POST", inbox, &body, self.keys.signing_key(), &key_id)?;

        let timer = FEDERATION_REQUEST_DURATION_SECONDS
            .with_label_values(&["outbound"])
            .start_timer();
        let response = self
            .http_client
            .post(inbox)
            .header(reqwest::header::CONTENT_TYPE, ACTIVITY_JSON)
            .header(reqwest::header::ACCEPT, ACTIVITY_JSON)
            .header(reqwest::header::DATE, sig_headers.date)
            .header(reqwest::header::HOST, sig_headers.host)
            .header("Digest", sig_headers.digest)
            .header("Signature", sig_headers.signature)
            .body(body)
            .send()
            .await;
        timer.observe_duration();

        let response = response.inspect_err(|_| {
            FEDERATION_REQUESTS_TOTAL
                .with_label_values(&["outbound", "error"])
                .inc();
        })?;

        let status = response.status();
        FEDERATION_REQUESTS_TOTAL
            .with_label_values(&["outbound", status.as_str()])
            .inc();
        Ok(status.as_u16())
    }

    /// Handle one `ap_send` item and decide its fate.
    pub async fn handle_item(&self, db: &Database, item: &QueueItem) -> Outcome {
        let request: SendRequest = match serde_json::from_slice(&item.content) {
            Ok(request) => request,
            Err(error) => {
                tracing::error!(id = item.id, %error, "Undecodable send request");
                return Outcome::Drop;
            }
        };

        let status = match self
            .send(&request.inbox, &request.blog_iri, &request.activity)
            .await
        {
            Ok(status) => status,
            Err(error) => {
                tracing::warn!(
                    inbox = %request.inbox,
                    activity = request.activity_type(),
                    attempts = item.attempts,
                    %error,
                    "Delivery failed"
                );
                return Outcome::Retry;
            }
        };

        if is_delivered(status) {
            tracing::debug!(inbox = %request.inbox, activity = request.activity_type(), status, "Delivered activity");
            return Outcome::Done;
        }

        match status {
            404 | 410 => match remove_gone_followers(db, &request).await {
                Ok(removed) => {
                    tracing::info!(inbox = %request.inbox, status, removed, "Inbox gone, removed followers");
                    Outcome::Done
                }
                Err(error) => {
                    tracing::error!(inbox = %request.inbox, %error, "Failed to remove followers of gone inbox");
                    Outcome::Retry
                }
            },
            400..=499 if item.attempts + 1 >= MAX_CLIENT_ERROR_ATTEMPTS => {
                tracing::warn!(inbox = %request.inbox, status, attempts = item.attempts + 1, "Inbox rejected activity, giving up");
                Outcome::Drop
            }
            _ => {
                tracing::warn!(inbox = %request.inbox, status, attempts = item.attempts, "Inbox rejected activity");
                Outcome::Retry
            }
        }
    }
}

/// Drop followers behind a gone inbox.
///
/// An activity addressed to a single actor removes only that actor;
/// fan-out deliveries remove every follower using the inbox, on all blogs.
async fn remove_gone_followers(db: &Database, request: &SendRequest) -> Result<u64, AppError> {
    let removed = match &request.target_actor {
        Some(actor) => db.remove_follower_everywhere(actor).await?,
        None => db.remove_followers_by_inbox(&request.inbox).await?,
    };
    FOLLOWERS_TOTAL.set(db.count_followers().await?);
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::federation::signature::{SIGNED_HEADERS, parse_signature_header};
    use axum::extract::State;
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::post;
    use serde_json::json;
    use std::sync::Mutex;
    use tempfile::TempDir;

    #[derive(Clone)]
    struct InboxState {
        status: StatusCode,
        received: Arc<Mutex<Vec<(HeaderMap, Vec<u8>)>>>,
    }

    async fn inbox(State(state): State<InboxState>, headers: HeaderMap, body: axum::body::Bytes) -> StatusCode {
        state.received.lock().unwrap().push((headers, body.to_vec()));
        state.status
    }

    async fn spawn_inbox(status: StatusCode) -> (String, Arc<Mutex<Vec<(HeaderMap, Vec<u8>)>>>) {
        let received = Arc::new(Mutex::new(Vec::new()));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/inbox", listener.local_addr().unwrap());
        let app = axum::Router::new()
            .route("/inbox", post(inbox))
            .with_state(InboxState {
                status,
                received: received.clone(),
            });
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (url, received)
    }

    async fn setup() -> (ApSender, Arc<Database>, Queue, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let db = Arc::new(
            Database::connect(&temp_dir.path().join("delivery.db"))
                .await
                .unwrap(),
        );
        let keys = Arc::new(KeyStore::load_or_generate(&db, 1024).await.unwrap());
        let sender = ApSender::new(Arc::new(reqwest::Client::new()), keys);
        let queue = Queue::new(db.clone());
        (sender, db, queue, temp_dir)
    }

    async fn queued_item(queue: &Queue, request: &SendRequest) -> QueueItem {
        enqueue_send(queue, request, Utc::now()).await.unwrap();
        queue.peek(AP_SEND_QUEUE).await.unwrap().unwrap()
    }

    fn create_request(inbox: &str) -> SendRequest {
        SendRequest {
            inbox: inbox.to_string(),
            blog_iri: "https://self/".to_string(),
            activity: json!({"type": "Create", "id": "https://self/p"}),
            target_actor: None,
        }
    }

    #[tokio::test]
    async fn delivered_request_is_signed() {
        let (sender, db, queue, _dir) = setup().await;
        let (inbox_url, received) = spawn_inbox(StatusCode::ACCEPTED).await;

        let item = queued_item(&queue, &create_request(&inbox_url)).await;
        assert_eq!(sender.handle_item(&db, &item).await, Outcome::Done);

        let received = received.lock().unwrap();
        let (headers, body) = &received[0];
        let signature = parse_signature_header(headers["signature"].to_str().unwrap()).unwrap();
        assert_eq!(signature.key_id, "https://self/#main-key");
        assert_eq!(signature.headers.join(" "), SIGNED_HEADERS);
        assert_eq!(
            headers["digest"].to_str().unwrap(),
            crate::federation::signature::generate_digest(body)
        );
        assert_eq!(headers["content-type"], ACTIVITY_JSON);
    }

    #[tokio::test]
    async fn gone_inbox_removes_all_followers_sharing_it() {
        let (sender, db, queue, _dir) = setup().await;
        let (inbox_url, _) = spawn_inbox(StatusCode::GONE).await;

        db.upsert_follower("main", "https://peer/u/a", &inbox_url, "@a@peer").await.unwrap();
        db.upsert_follower("notes", "https://peer/u/b", &inbox_url, "@b@peer").await.unwrap();
        db.upsert_follower("main", "https://other/u/c", "https://other/inbox", "@c@other").await.unwrap();

        let item = queued_item(&queue, &create_request(&inbox_url)).await;
        assert_eq!(sender.handle_item(&db, &item).await, Outcome::Done);

        assert_eq!(
            db.follower_inboxes("main").await.unwrap(),
            vec!["https://other/inbox".to_string()]
        );
        assert!(db.follower_inboxes("notes").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn gone_inbox_for_single_actor_removes_only_that_actor() {
        let (sender, db, queue, _dir) = setup().await;
        let (inbox_url, _) = spawn_inbox(StatusCode::NOT_FOUND).await;

        db.upsert_follower("main", "https://peer/u/a", &inbox_url, "@a@peer").await.unwrap();
        db.upsert_follower("main", "https://peer/u/b", &inbox_url, "@b@peer").await.unwrap();

        let mut request = create_request(&inbox_url);
        request.activity = json!({"type": "Accept"});
        request.target_actor = Some("https://peer/u/a".to_string());

        let item = queued_item(&queue, &request).await;
        assert_eq!(sender.handle_item(&db, &item).await, Outcome::Done);

        let followers = db.list_followers("main").await.unwrap();
        assert_eq!(followers.len(), 1);
        assert_eq!(followers[0].actor, "https://peer/u/b");
    }

    #[tokio::test]
    async fn server_errors_retry_and_client_errors_drop_after_three_attempts() {
        let (sender, db, queue, _dir) = setup().await;
        let (failing, _) = spawn_inbox(StatusCode::SERVICE_UNAVAILABLE).await;
        let (rejecting, _) = spawn_inbox(StatusCode::FORBIDDEN).await;

        let item = queued_item(&queue, &create_request(&failing)).await;
        assert_eq!(sender.handle_item(&db, &item).await, Outcome::Retry);
        queue.dequeue(&item).await.unwrap();

        let mut item = queued_item(&queue, &create_request(&rejecting)).await;
        assert_eq!(sender.handle_item(&db, &item).await, Outcome::Retry);
        item.attempts = 2;
        assert_eq!(sender.handle_item(&db, &item).await, Outcome::Drop);
    }

    #[tokio::test]
    async fn transport_error_retries() {
        let (sender, db, queue, _dir) = setup().await;
        let item = queued_item(&queue, &create_request("http://127.0.0.1:1/inbox")).await;
        assert_eq!(sender.handle_item(&db, &item).await, Outcome::Retry);
    }

    #[tokio::test]
    async fn undecodable_payload_is_dropped() {
        let (sender, db, queue, _dir) = setup().await;
        queue.enqueue_now(AP_SEND_QUEUE, b"not json").await.unwrap();
        let item = queue.peek(AP_SEND_QUEUE).await.unwrap().unwrap();
        assert_eq!(sender.handle_item(&db, &item).await, Outcome::Drop);
    }
}
