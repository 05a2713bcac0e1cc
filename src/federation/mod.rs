//! ActivityPub federation module
//!
//! Handles:
//! - Activity processing (inbox)
//! - Post fan-out (outbox)
//! - Signed delivery through the `ap_send` queue
//! - HTTP Signatures
//! - WebFinger
//! - Actor fetching and caching
//! - ActivityStreams documents

mod activity;
mod actor;
mod delivery;
mod keys;
mod outbox;
mod serializer;
mod signature;
mod webfinger;

pub use activity::{ActivityProcessor, ActivityType, Signer};
pub use actor::{ActorFetch, ActorResolver, RemoteActor, ensure_public_url, extract_actor_domain};
pub use delivery::{ApSender, SendRequest, enqueue_send, is_delivered};
pub use keys::KeyStore;
pub use outbox::{ANNOUNCE_DELAY_SECS, Outbox};
pub use serializer::{
    ACTIVITY_JSON, AS_CONTEXT, AS_PUBLIC, LD_JSON, SECURITY_CONTEXT, accept_activity,
    announce_activity, delete_activity, format_time, note_for_post, person_for_blog,
    post_activity, post_url, reply_link, strip_html, wants_activity_json,
};
pub use signature::{
    SIGNED_HEADERS, SignatureHeaders, extract_signature_key_id, generate_digest, key_id_actor,
    parse_signature_header, sign_request, verify_signature,
};
pub use webfinger::{
    JRD_CONTENT_TYPE, PROFILE_PAGE_REL, SUBSCRIBE_REL, WebFingerLink, WebFingerResponse,
    WebfingerIndex, expand_subscribe_template, generate_webfinger_response, parse_account_address,
    resolve_subscribe_template, subscribe_template,
};
