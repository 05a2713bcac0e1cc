//! ActivityStreams documents
//!
//! Note/Article objects for posts, Person actors for blogs, and the
//! activity envelopes sent to followers.

use chrono::{DateTime, Utc};
use serde_json::{Map, Value, json};

use crate::config::{AppConfig, join_address};
use crate::data::{EntityId, Post};

pub const AS_CONTEXT: &str = "https://www.w3.org/ns/activitystreams";
pub const SECURITY_CONTEXT: &str = "https://w3id.org/security/v1";
pub const AS_PUBLIC: &str = "https://www.w3.org/ns/activitystreams#Public";
pub const ACTIVITY_JSON: &str = "application/activity+json";
pub const LD_JSON: &str = "application/ld+json";

/// Whether an `Accept` header asks for an ActivityStreams document.
pub fn wants_activity_json(accept: &str) -> bool {
    let accept = accept.to_ascii_lowercase();
    accept.contains(ACTIVITY_JSON) || accept.contains(LD_JSON)
}

/// Canonical URL of a post under the main public address.
pub fn post_url(config: &AppConfig, path: &str) -> String {
    format!("{}{}", config.server.public_address(), path)
}

/// The post this one replies to, if any.
pub fn reply_link(post: &Post) -> Option<&str> {
    post.first_parameter("replylink")
        .or_else(|| post.first_parameter("reply"))
}

/// RFC 3339 in the configured offset.
pub fn format_time(config: &AppConfig, time: DateTime<Utc>) -> String {
    match config.server.offset() {
        Some(offset) => time.with_timezone(&offset).to_rfc3339(),
        None => time.to_rfc3339(),
    }
}

/// Plain text of an HTML fragment, entities decoded.
pub fn strip_html(html: &str) -> String {
    let text = ammonia::Builder::empty().clean(html).to_string();
    html_escape::decode_html_entities(&text).trim().to_string()
}

/// Note (untitled) or Article (titled) for a post.
pub fn note_for_post(config: &AppConfig, post: &Post) -> Value {
    let url = post_url(config, &post.path);
    let blog_iri = config.blog_iri(&post.blog).unwrap_or_else(|| {
        join_address(config.server.public_address(), "/")
    });
    let title = post.title().map(strip_html).filter(|t| !t.is_empty());

    let mut note = Map::new();
    note.insert("@context".into(), json!([AS_CONTEXT]));
    note.insert(
        "type".into(),
        json!(if title.is_some() { "Article" } else { "Note" }),
    );
    note.insert("id".into(), json!(url));
    note.insert("url".into(), json!(url));
    note.insert("attributedTo".into(), json!(blog_iri));
    note.insert("to".into(), json!([AS_PUBLIC]));
    note.insert("mediaType".into(), json!("text/html"));
    note.insert("content".into(), json!(post.content()));
    if let Some(title) = title {
        note.insert("name".into(), json!(title));
    }
    if let Some(published) = post.published {
        note.insert("published".into(), json!(format_time(config, published)));
    }
    if let Some(updated) = post.updated {
        note.insert("updated".into(), json!(format_time(config, updated)));
    }
    if let Some(reply) = reply_link(post) {
        note.insert("inReplyTo".into(), json!(reply));
    }

    let images: Vec<Value> = post
        .parameter_values("images")
        .map(|url| json!({"type": "Image", "url": url}))
        .collect();
    if !images.is_empty() {
        note.insert("attachment".into(), Value::Array(images));
    }

    Value::Object(note)
}

/// Person actor for a blog.
///
/// `address` is the public address the document is served from. On an
/// alt domain the actor points at its canonical IRI through `movedTo`.
pub fn person_for_blog(
    config: &AppConfig,
    blog_name: &str,
    public_key_pem: &str,
    address: &str,
) -> Option<Value> {
    let blog = config.blog(blog_name)?;
    let canonical = join_address(config.server.public_address(), &blog.path);
    let iri = join_address(address, &blog.path);
    let on_alt_domain = iri != canonical;

    let mut person = Map::new();
    person.insert("@context".into(), json!([AS_CONTEXT, SECURITY_CONTEXT]));
    person.insert("type".into(), json!("Person"));
    person.insert("id".into(), json!(iri));
    person.insert("url".into(), json!(iri));
    person.insert("name".into(), json!(blog.title));
    person.insert("summary".into(), json!(blog.description));
    person.insert("preferredUsername".into(), json!(blog_name));
    person.insert(
        "inbox".into(),
        json!(format!(
            "{}/activitypub/inbox/{}",
            config.server.public_address(),
            blog_name
        )),
    );
    person.insert(
        "publicKey".into(),
        json!({
            "id": format!("{}#main-key", iri),
            "owner": iri,
            "publicKeyPem": public_key_pem,
        }),
    );
    if let Some(picture) = config.user.picture.as_deref().filter(|p| !p.is_empty()) {
        person.insert("icon".into(), json!({"type": "Image", "url": picture}));
    }

    let mut also_known_as: Vec<String> = config
        .server
        .alt_addresses()
        .map(|alt| join_address(alt, &blog.path))
        .filter(|alt_iri| *alt_iri != iri)
        .collect();
    if on_alt_domain {
        also_known_as.insert(0, canonical.clone());
        person.insert("movedTo".into(), json!(canonical));
    }
    if !also_known_as.is_empty() {
        person.insert("alsoKnownAs".into(), json!(also_known_as));
    }

    Some(Value::Object(person))
}

fn envelope(kind: &str, id: String, actor: &str, published: Option<String>) -> Map<String, Value> {
    let mut activity = Map::new();
    activity.insert("@context".into(), json!([AS_CONTEXT]));
    activity.insert("type".into(), json!(kind));
    activity.insert("id".into(), json!(id));
    activity.insert("actor".into(), json!(actor));
    if let Some(published) = published {
        activity.insert("published".into(), json!(published));
    }
    activity
}

fn published_of(config: &AppConfig, post: &Post) -> Option<String> {
    post.published.map(|t| format_time(config, t))
}

/// `Create` or `Update` wrapping the post's Note/Article.
pub fn post_activity(config: &AppConfig, kind: &str, blog_iri: &str, post: &Post) -> Value {
    let mut note = note_for_post(config, post);
    if let Some(object) = note.as_object_mut() {
        object.remove("@context");
    }

    let mut activity = envelope(
        kind,
        post_url(config, &post.path),
        blog_iri,
        published_of(config, post),
    );
    activity.insert("to".into(), json!([AS_PUBLIC]));
    activity.insert("object".into(), note);
    Value::Object(activity)
}

/// `Delete` of a post, sent as a Tombstone.
pub fn delete_activity(config: &AppConfig, blog_iri: &str, post: &Post) -> Value {
    let url = post_url(config, &post.path);
    let mut activity = envelope(
        "Delete",
        format!("{}#delete", url),
        blog_iri,
        published_of(config, post),
    );
    activity.insert("to".into(), json!([AS_PUBLIC]));
    activity.insert("object".into(), json!({"id": url, "type": "Tombstone"}));
    Value::Object(activity)
}

/// `Announce` of a reply post, so followers see it in their timeline.
pub fn announce_activity(config: &AppConfig, blog_iri: &str, post: &Post) -> Value {
    let url = post_url(config, &post.path);
    let mut activity = envelope(
        "Announce",
        format!("{}#announce", url),
        blog_iri,
        published_of(config, post),
    );
    activity.insert("to".into(), json!([AS_PUBLIC]));
    activity.insert("object".into(), json!(url));
    Value::Object(activity)
}

/// `Accept` of a Follow; the inner Follow loses its `@context`.
pub fn accept_activity(blog_iri: &str, follow: &Value) -> Value {
    let mut inner = follow.clone();
    if let Some(object) = inner.as_object_mut() {
        object.remove("@context");
    }

    let mut activity = envelope(
        "Accept",
        format!("{}#accept-{}", blog_iri, EntityId::new().0),
        blog_iri,
        None,
    );
    activity.insert("object".into(), inner);
    Value::Object(activity)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::valid_config;
    use chrono::TimeZone;

    fn sample_post() -> Post {
        let mut post = Post {
            path: "/notes/2024/hello".to_string(),
            blog: "notes".to_string(),
            published: Some(Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap()),
            ..Post::default()
        };
        post.parameters
            .insert("content".into(), vec!["<p>Hello <b>world</b></p>".into()]);
        post
    }

    #[test]
    fn untitled_post_is_a_note() {
        let config = valid_config();
        let note = note_for_post(&config, &sample_post());

        assert_eq!(note["type"], "Note");
        assert_eq!(note["id"], "https://blog.example.com/notes/2024/hello");
        assert_eq!(note["url"], note["id"]);
        assert_eq!(note["attributedTo"], "https://blog.example.com/notes");
        assert_eq!(note["to"][0], AS_PUBLIC);
        assert_eq!(note["mediaType"], "text/html");
        assert_eq!(note["content"], "<p>Hello <b>world</b></p>");
        assert!(note.get("name").is_none());
        assert!(note.get("attachment").is_none());
    }

    #[test]
    fn titled_reply_with_images_is_an_article() {
        let config = valid_config();
        let mut post = sample_post();
        post.parameters
            .insert("title".into(), vec!["Fish &amp; <i>Chips</i>".into()]);
        post.parameters
            .insert("replylink".into(), vec!["https://peer.example/p/1".into()]);
        post.parameters.insert(
            "images".into(),
            vec!["https://blog.example.com/a.jpg".into(), "https://blog.example.com/b.jpg".into()],
        );

        let note = note_for_post(&config, &post);
        assert_eq!(note["type"], "Article");
        assert_eq!(note["name"], "Fish & Chips");
        assert_eq!(note["inReplyTo"], "https://peer.example/p/1");
        assert_eq!(note["attachment"].as_array().unwrap().len(), 2);
        assert_eq!(note["attachment"][1]["type"], "Image");
    }

    #[test]
    fn timestamps_use_configured_offset() {
        let mut config = valid_config();
        config.server.utc_offset = "+02:00".to_string();

        let note = note_for_post(&config, &sample_post());
        assert_eq!(note["published"], "2024-05-01T12:00:00+02:00");
    }

    #[test]
    fn person_lists_alt_domain_aliases() {
        let config = valid_config();
        let person = person_for_blog(&config, "main", "PEM", config.server.public_address()).unwrap();

        assert_eq!(person["id"], "https://blog.example.com/");
        assert_eq!(person["preferredUsername"], "main");
        assert_eq!(person["inbox"], "https://blog.example.com/activitypub/inbox/main");
        assert_eq!(person["publicKey"]["id"], "https://blog.example.com/#main-key");
        assert_eq!(person["publicKey"]["publicKeyPem"], "PEM");
        assert_eq!(person["alsoKnownAs"], json!(["https://old.example.com/"]));
        assert!(person.get("movedTo").is_none());
    }

    #[test]
    fn person_on_alt_domain_moves_to_canonical() {
        let config = valid_config();
        let person = person_for_blog(&config, "main", "PEM", "https://old.example.com").unwrap();

        assert_eq!(person["id"], "https://old.example.com/");
        assert_eq!(person["movedTo"], "https://blog.example.com/");
        assert_eq!(person["alsoKnownAs"], json!(["https://blog.example.com/"]));
    }

    #[test]
    fn delete_and_announce_ids_carry_fragments() {
        let config = valid_config();
        let post = sample_post();
        let blog_iri = config.blog_iri("notes").unwrap();

        let delete = delete_activity(&config, &blog_iri, &post);
        assert_eq!(delete["id"], "https://blog.example.com/notes/2024/hello#delete");
        assert_eq!(delete["object"]["type"], "Tombstone");

        let announce = announce_activity(&config, &blog_iri, &post);
        assert_eq!(announce["id"], "https://blog.example.com/notes/2024/hello#announce");
        assert_eq!(announce["object"], "https://blog.example.com/notes/2024/hello");

        let create = post_activity(&config, "Create", &blog_iri, &post);
        assert_eq!(create["@context"], json!([AS_CONTEXT]));
        assert_eq!(create["id"], create["object"]["id"]);
        assert!(create["object"].get("@context").is_none());
    }

    #[test]
    fn accept_strips_inner_context() {
        let follow = json!({
            "@context": AS_CONTEXT,
            "type": "Follow",
            "actor": "https://peer/u/a",
            "object": "https://self/"
        });

        let accept = accept_activity("https://self/", &follow);
        assert_eq!(accept["type"], "Accept");
        assert!(accept["id"].as_str().unwrap().starts_with("https://self/#accept-"));
        assert!(accept["object"].get("@context").is_none());
        assert_eq!(accept["object"]["type"], "Follow");
    }

    #[test]
    fn accept_header_detection() {
        assert!(wants_activity_json("application/activity+json"));
        assert!(wants_activity_json(
            "application/ld+json; profile=\"https://www.w3.org/ns/activitystreams\""
        ));
        assert!(!wants_activity_json("text/html,application/xhtml+xml"));
    }
}
