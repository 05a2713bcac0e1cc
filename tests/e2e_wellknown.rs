//! E2E tests for discovery endpoints and blog/post documents

mod common;

use common::TestServer;
use common::schema_validator::{
    nodeinfo_schema, person_schema, validate_against_schema, webfinger_schema,
};
use quillfed::data::{POST_STATUS_PUBLISHED, POST_VISIBILITY_PUBLIC, Post};
use serde_json::Value;

const AS_ACCEPT: &str = "application/activity+json";

fn host(server: &TestServer) -> String {
    server.addr.trim_start_matches("http://").to_string()
}

#[tokio::test]
async fn test_webfinger_acct_and_iri_resolve_to_same_blog() {
    let server = TestServer::new().await;
    let schema = webfinger_schema();

    let by_acct = server
        .client
        .get(server.url(&format!("/.well-known/webfinger?resource=acct:notes@{}", host(&server))))
        .send()
        .await
        .unwrap();
    assert_eq!(by_acct.status(), 200);
    assert!(
        by_acct.headers()["content-type"]
            .to_str()
            .unwrap()
            .starts_with("application/jrd+json")
    );
    let by_acct: Value = by_acct.json().await.unwrap();
    validate_against_schema(&by_acct, &schema).unwrap();

    let iri = server.url("/notes");
    let by_iri: Value = server
        .client
        .get(server.url("/.well-known/webfinger"))
        .query(&[("resource", iri.as_str())])
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert_eq!(by_acct, by_iri);
    assert_eq!(by_acct["subject"], format!("acct:notes@{}", host(&server)));
    let self_link = by_acct["links"]
        .as_array()
        .unwrap()
        .iter()
        .find(|l| l["rel"] == "self")
        .unwrap();
    assert_eq!(self_link["type"], "application/activity+json");
    assert_eq!(self_link["href"], iri);
}

#[tokio::test]
async fn test_webfinger_unknown_and_missing_resource() {
    let server = TestServer::new().await;

    let response = server
        .client
        .get(server.url(&format!("/.well-known/webfinger?resource=acct:nobody@{}", host(&server))))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);

    let response = server
        .client
        .get(server.url("/.well-known/webfinger"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
}

#[tokio::test]
async fn test_host_meta_points_at_webfinger() {
    let server = TestServer::new().await;

    let response = server
        .client
        .get(server.url("/.well-known/host-meta"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body = response.text().await.unwrap();
    assert!(body.contains(&format!(
        "template=\"{}/.well-known/webfinger?resource={{uri}}\"",
        server.addr
    )));
}

#[tokio::test]
async fn test_nodeinfo_discovery_and_document() {
    let server = TestServer::new().await;
    let post = Post {
        path: "/hello".to_string(),
        blog: "main".to_string(),
        status: POST_STATUS_PUBLISHED.to_string(),
        visibility: POST_VISIBILITY_PUBLIC.to_string(),
        ..Post::default()
    };
    server.state.db.upsert_post(&post).await.unwrap();

    let links: Value = server
        .client
        .get(server.url("/.well-known/nodeinfo"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let href = links["links"][0]["href"].as_str().unwrap().to_string();
    assert_eq!(href, server.url("/nodeinfo"));

    let response = server.client.get(&href).send().await.unwrap();
    assert_eq!(response.status(), 200);
    let nodeinfo: Value = response.json().await.unwrap();
    validate_against_schema(&nodeinfo, &nodeinfo_schema()).unwrap();
    assert_eq!(nodeinfo["software"]["name"], "quillfed");
    assert_eq!(nodeinfo["usage"]["users"]["total"], 2);
    assert_eq!(nodeinfo["usage"]["localPosts"], 1);
}

#[tokio::test]
async fn test_blog_serves_person_to_activitypub_clients() {
    let server = TestServer::new().await;

    let response = server
        .client
        .get(server.url("/notes"))
        .header("Accept", AS_ACCEPT)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert!(
        response.headers()["content-type"]
            .to_str()
            .unwrap()
            .starts_with("application/activity+json")
    );
    let person: Value = response.json().await.unwrap();
    validate_against_schema(&person, &person_schema()).unwrap();
    assert_eq!(person["id"], server.url("/notes"));
    assert_eq!(person["inbox"], server.url("/activitypub/inbox/notes"));
    assert_eq!(person["publicKey"]["publicKeyPem"], server.state.keys.public_key_pem());
    assert!(person.get("movedTo").is_none());

    let html = server.client.get(server.url("/notes")).send().await.unwrap();
    assert_eq!(html.status(), 200);
    assert!(html.text().await.unwrap().contains("h-card"));
}

#[tokio::test]
async fn test_alt_domain_actor_points_at_canonical_iri() {
    let server = TestServer::new().await;
    let alt_host = server.alt_addr.trim_start_matches("http://").to_string();

    let response = server
        .client
        .get(server.url("/"))
        .header("Host", &alt_host)
        .header("Accept", AS_ACCEPT)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let person: Value = response.json().await.unwrap();
    assert_eq!(person["id"], format!("{}/", server.alt_addr));
    assert_eq!(person["movedTo"], server.url("/"));

    // Browsers are sent to the main address.
    let response = server
        .client
        .get(server.url("/some/post?x=1"))
        .header("Host", &alt_host)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 301);
    assert_eq!(response.headers()["location"], server.url("/some/post?x=1"));
}

#[tokio::test]
async fn test_post_documents() {
    let server = TestServer::new().await;
    let mut post = Post {
        path: "/notes/first".to_string(),
        blog: "notes".to_string(),
        status: POST_STATUS_PUBLISHED.to_string(),
        visibility: POST_VISIBILITY_PUBLIC.to_string(),
        ..Post::default()
    };
    post.parameters
        .insert("content".into(), vec!["<p>First note</p>".into()]);
    server.state.db.upsert_post(&post).await.unwrap();

    let note: Value = server
        .client
        .get(server.url("/notes/first"))
        .header("Accept", AS_ACCEPT)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(note["type"], "Note");
    assert_eq!(note["id"], server.url("/notes/first"));
    assert_eq!(note["attributedTo"], server.url("/notes"));

    let response = server
        .client
        .get(server.url("/notes/first/"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 301);
    assert_eq!(response.headers()["location"], "/notes/first");

    let response = server.client.get(server.url("/notes/missing")).send().await.unwrap();
    assert_eq!(response.status(), 404);
}

#[tokio::test]
async fn test_percent_encoded_post_paths_are_decoded() {
    let server = TestServer::new().await;
    for path in ["/café", "/hello world"] {
        let post = Post {
            path: path.to_string(),
            blog: "main".to_string(),
            status: POST_STATUS_PUBLISHED.to_string(),
            visibility: POST_VISIBILITY_PUBLIC.to_string(),
            ..Post::default()
        };
        server.state.db.upsert_post(&post).await.unwrap();
    }

    let response = server.client.get(server.url("/caf%C3%A9")).send().await.unwrap();
    assert_eq!(response.status(), 200);

    let response = server
        .client
        .get(server.url("/caf%C3%A9"))
        .header("Accept", AS_ACCEPT)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let note: Value = response.json().await.unwrap();
    assert_eq!(note["type"], "Note");

    let response = server.client.get(server.url("/hello%20world")).send().await.unwrap();
    assert_eq!(response.status(), 200);

    // The redirect keeps the path encoded.
    let response = server.client.get(server.url("/caf%C3%A9/")).send().await.unwrap();
    assert_eq!(response.status(), 301);
    assert_eq!(response.headers()["location"], "/caf%C3%A9");
}
