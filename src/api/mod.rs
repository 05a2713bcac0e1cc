//! API layer
//!
//! HTTP handlers for:
//! - ActivityPub (inbox, followers, remote follow)
//! - Well-known discovery (Webfinger, host-meta, NodeInfo)
//! - Webmention endpoint and moderation
//! - Post hooks and post documents
//! - Metrics (Prometheus)

mod activitypub;
pub mod metrics;
mod posts;
pub mod site;
mod webmention;
mod wellknown;

pub use activitypub::activitypub_router;
pub use metrics::metrics_router;
pub use posts::posts_router;
pub use webmention::webmention_router;
pub use wellknown::wellknown_router;
