//! Authenticated CMS push notifications.
//!
//! The CMS calls `POST /api/cms/push` whenever content changes. An accepted
//! push clears the in-memory knowledge cache so the next reader aggregates
//! fresh content; it optionally revalidates a downstream page cache and
//! re-fetches every collection to refresh the on-disk snapshots.

mod invalidator;
mod revalidate;
mod signature;

pub use invalidator::{WebhookInvalidator, WebhookResponse};
pub use revalidate::{HttpPageRevalidator, PageRevalidator};
pub use signature::{
    DEFAULT_MAX_AGE, Rejection, SIGNATURE_HEADER, SignatureVerifier, TIMESTAMP_HEADER,
    compute_signature,
};
