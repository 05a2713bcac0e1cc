//! Webmention support
//!
//! - Intake: store as `new`/`renew`, queue verification
//! - Verification worker for the `wm` queue
//! - Outgoing mentions through the `wm_send` queue, with endpoint discovery

mod fetch;
mod parse;
mod receive;
mod send;
mod verify;

pub use fetch::{FetchedPage, LocalClient, fetch_external};
pub use parse::{HEntry, SourceDocument, extract_links, truncate_chars};
pub use receive::{MentionJob, enqueue_verification, queue_mention};
pub use send::{SendJob, WebmentionSender, discover_endpoint, post_links};
pub use verify::{MentionVerifier, Verdict};
