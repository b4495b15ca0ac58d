//! API layer
//!
//! HTTP handlers for:
//! - ActivityPub (actor document, inbox)
//! - WebFinger discovery
//! - Metrics (Prometheus)

mod activitypub;
mod metrics;
mod wellknown;

pub use activitypub::activitypub_router;
pub use metrics::metrics_router;
pub use wellknown::wellknown_router;

/// Largest accepted request body
pub const MAX_INBOX_BODY_BYTES: usize = 256 * 1024;
