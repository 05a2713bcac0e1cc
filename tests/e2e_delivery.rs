//! E2E tests for outbound delivery: post fan-out and gone inboxes

mod common;

use std::sync::{Arc, Mutex};

use axum::{Router, http::StatusCode, routing::post};
use chrono::Utc;
use common::{TestServer, spawn_mock};
use quillfed::federation::{ApSender, SendRequest, enqueue_send};
use quillfed::queue::{AP_SEND_QUEUE, Outcome, WEBMENTION_SEND_QUEUE};
use quillfed::webmention::SendJob;
use serde_json::{Value, json};

async fn queued_sends(server: &TestServer) -> Vec<SendRequest> {
    server
        .state
        .queue
        .items(AP_SEND_QUEUE)
        .await
        .unwrap()
        .into_iter()
        .map(|item| serde_json::from_slice(&item.content).unwrap())
        .collect()
}

async fn clear_sends(server: &TestServer) {
    for item in server.state.queue.items(AP_SEND_QUEUE).await.unwrap() {
        server.state.queue.dequeue(&item).await.unwrap();
    }
}

async fn put_post(server: &TestServer, post: &Value) -> reqwest::Response {
    server
        .client
        .put(server.url("/api/posts"))
        .bearer_auth(server.token())
        .json(post)
        .send()
        .await
        .unwrap()
}

fn sender(server: &TestServer) -> ApSender {
    ApSender::new(server.state.http_client.clone(), server.state.keys.clone())
}

/// Inbox that answers every POST with `status` and counts the hits.
async fn spawn_inbox(status: StatusCode) -> (String, Arc<Mutex<usize>>) {
    let hits = Arc::new(Mutex::new(0usize));
    let counter = hits.clone();
    let router = Router::new().route(
        "/inbox",
        post(move || {
            let counter = counter.clone();
            async move {
                *counter.lock().unwrap() += 1;
                status
            }
        }),
    );
    (format!("{}/inbox", spawn_mock(router).await), hits)
}

#[tokio::test]
async fn test_publish_fans_out_to_each_inbox_once() {
    let server = TestServer::new().await;
    let db = &server.state.db;
    db.upsert_follower("main", "https://a.example/u/1", "https://a.example/inbox", "@1@a.example")
        .await
        .unwrap();
    db.upsert_follower("main", "https://a.example/u/2", "https://a.example/inbox", "@2@a.example")
        .await
        .unwrap();
    db.upsert_follower("main", "https://b.example/u/3", "https://b.example/u/3/inbox", "@3@b.example")
        .await
        .unwrap();
    db.upsert_follower("main", "https://c.example/u/4", "https://c.example/inbox", "@4@c.example")
        .await
        .unwrap();
    // Followers of another blog are not addressed.
    db.upsert_follower("notes", "https://d.example/u/5", "https://d.example/inbox", "@5@d.example")
        .await
        .unwrap();

    let post = json!({
        "path": "/2026/hello",
        "published": "2026-10-01T12:00:00Z",
        "parameters": {
            "title": ["Hello"],
            "content": ["<p>Hello, fediverse</p>"]
        }
    });
    let response = put_post(&server, &post).await;
    assert_eq!(response.status(), 201);
    let stored: Value = response.json().await.unwrap();
    assert_eq!(stored["blog"], "main");

    let sends = queued_sends(&server).await;
    assert_eq!(sends.len(), 3);
    let mut inboxes: Vec<&str> = sends.iter().map(|s| s.inbox.as_str()).collect();
    inboxes.sort();
    assert_eq!(
        inboxes,
        vec!["https://a.example/inbox", "https://b.example/u/3/inbox", "https://c.example/inbox"]
    );

    let post_url = server.url("/2026/hello");
    for send in &sends {
        assert_eq!(send.activity["type"], "Create");
        assert_eq!(send.activity["object"]["id"], post_url);
        assert_eq!(send.activity["object"]["type"], "Article");
        assert_eq!(send.blog_iri, server.state.config.blog_iri("main").unwrap());
        assert!(send.target_actor.is_none());
    }

    // Second PUT of the same path is an Update.
    clear_sends(&server).await;
    assert_eq!(put_post(&server, &post).await.status(), 200);
    let sends = queued_sends(&server).await;
    assert_eq!(sends.len(), 3);
    assert!(sends.iter().all(|s| s.activity["type"] == "Update"));

    // Deleting sends a Tombstone.
    clear_sends(&server).await;
    let response = server
        .client
        .delete(server.url("/api/posts?path=/2026/hello"))
        .bearer_auth(server.token())
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 204);
    let sends = queued_sends(&server).await;
    assert_eq!(sends.len(), 3);
    for send in &sends {
        assert_eq!(send.activity["type"], "Delete");
        assert_eq!(send.activity["object"]["type"], "Tombstone");
        assert_eq!(send.activity["object"]["id"], post_url);
    }
}

#[tokio::test]
async fn test_drafts_and_private_posts_are_not_federated() {
    let server = TestServer::new().await;
    server
        .state
        .db
        .upsert_follower("notes", "https://a.example/u/1", "https://a.example/inbox", "@1@a.example")
        .await
        .unwrap();

    let draft = json!({"path": "/notes/draft", "status": "draft", "parameters": {"content": ["wip"]}});
    assert_eq!(put_post(&server, &draft).await.status(), 201);
    let private = json!({"path": "/notes/private", "visibility": "private", "parameters": {"content": ["me"]}});
    assert_eq!(put_post(&server, &private).await.status(), 201);

    assert!(queued_sends(&server).await.is_empty());

    // Drafts stay hidden from visitors but are visible to the owner.
    let anonymous = server.client.get(server.url("/notes/draft")).send().await.unwrap();
    assert_eq!(anonymous.status(), 404);
    let owner = server
        .client
        .get(server.url("/notes/draft"))
        .bearer_auth(server.token())
        .send()
        .await
        .unwrap();
    assert_eq!(owner.status(), 200);
}

#[tokio::test]
async fn test_post_hooks_require_login() {
    let server = TestServer::new().await;

    let response = server
        .client
        .put(server.url("/api/posts"))
        .json(&json!({"path": "/x"}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 401);

    let response = put_post(&server, &json!({"path": "no-slash"})).await;
    assert_eq!(response.status(), 400);

    let response = server
        .client
        .delete(server.url("/api/posts?path=/missing"))
        .bearer_auth(server.token())
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);
}

#[tokio::test]
async fn test_gone_inbox_removes_its_followers() {
    let server = TestServer::new().await;
    let (gone_inbox, hits) = spawn_inbox(StatusCode::GONE).await;
    let db = &server.state.db;
    db.upsert_follower("main", "https://a.example/u/1", &gone_inbox, "@1@a.example")
        .await
        .unwrap();
    db.upsert_follower("notes", "https://a.example/u/2", &gone_inbox, "@2@a.example")
        .await
        .unwrap();
    db.upsert_follower("main", "https://b.example/u/3", "https://b.example/inbox", "@3@b.example")
        .await
        .unwrap();

    let request = SendRequest {
        inbox: gone_inbox.clone(),
        blog_iri: server.state.config.blog_iri("main").unwrap(),
        activity: json!({"type": "Create", "id": server.url("/p")}),
        target_actor: None,
    };
    enqueue_send(&server.state.queue, &request, Utc::now()).await.unwrap();
    let item = server.state.queue.peek(AP_SEND_QUEUE).await.unwrap().unwrap();

    let outcome = sender(&server).handle_item(db, &item).await;

    assert_eq!(outcome, Outcome::Done);
    assert_eq!(*hits.lock().unwrap(), 1);
    assert_eq!(db.count_followers().await.unwrap(), 1);
    assert!(db.get_follower("main", "https://b.example/u/3").await.unwrap().is_some());
}

#[tokio::test]
async fn test_gone_inbox_of_single_recipient_removes_only_that_actor() {
    let server = TestServer::new().await;
    let (gone_inbox, _hits) = spawn_inbox(StatusCode::NOT_FOUND).await;
    let db = &server.state.db;
    db.upsert_follower("main", "https://a.example/u/1", &gone_inbox, "@1@a.example")
        .await
        .unwrap();
    db.upsert_follower("main", "https://a.example/u/2", &gone_inbox, "@2@a.example")
        .await
        .unwrap();

    let request = SendRequest {
        inbox: gone_inbox,
        blog_iri: server.state.config.blog_iri("main").unwrap(),
        activity: json!({"type": "Accept"}),
        target_actor: Some("https://a.example/u/1".to_string()),
    };
    enqueue_send(&server.state.queue, &request, Utc::now()).await.unwrap();
    let item = server.state.queue.peek(AP_SEND_QUEUE).await.unwrap().unwrap();

    assert_eq!(sender(&server).handle_item(db, &item).await, Outcome::Done);
    assert!(db.get_follower("main", "https://a.example/u/1").await.unwrap().is_none());
    assert!(db.get_follower("main", "https://a.example/u/2").await.unwrap().is_some());
}

#[tokio::test]
async fn test_server_errors_are_retried() {
    let server = TestServer::new().await;
    let (inbox, _hits) = spawn_inbox(StatusCode::SERVICE_UNAVAILABLE).await;
    let db = &server.state.db;
    db.upsert_follower("main", "https://a.example/u/1", &inbox, "@1@a.example")
        .await
        .unwrap();

    let request = SendRequest {
        inbox,
        blog_iri: server.state.config.blog_iri("main").unwrap(),
        activity: json!({"type": "Create"}),
        target_actor: None,
    };
    enqueue_send(&server.state.queue, &request, Utc::now()).await.unwrap();
    let item = server.state.queue.peek(AP_SEND_QUEUE).await.unwrap().unwrap();

    assert_eq!(sender(&server).handle_item(db, &item).await, Outcome::Retry);
    assert_eq!(db.count_followers().await.unwrap(), 1);
}

#[tokio::test]
async fn test_outgoing_webmentions_are_queued_durably() {
    let server = TestServer::with_config(|config| config.webmention.disable_sending = false).await;
    let post = json!({
        "path": "/linking",
        "parameters": {
            "content": ["<p>See <a href=\"https://peer.example/a\">this</a></p>"],
            "likelink": ["https://liked.example/x"]
        }
    });
    assert_eq!(put_post(&server, &post).await.status(), 201);

    let jobs = |items: Vec<quillfed::data::QueueItem>| -> Vec<SendJob> {
        items
            .iter()
            .map(|item| serde_json::from_slice(&item.content).unwrap())
            .collect()
    };
    let queued = jobs(server.state.queue.items(WEBMENTION_SEND_QUEUE).await.unwrap());
    let targets: Vec<&str> = queued.iter().map(|job| job.target.as_str()).collect();
    assert_eq!(targets, vec!["https://peer.example/a", "https://liked.example/x"]);
    assert!(queued.iter().all(|job| job.source == server.url("/linking")));

    // Deleting notifies the same targets again.
    let response = server
        .client
        .delete(server.url("/api/posts?path=/linking"))
        .bearer_auth(server.token())
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 204);
    assert_eq!(
        server.state.queue.items(WEBMENTION_SEND_QUEUE).await.unwrap().len(),
        4
    );
}
