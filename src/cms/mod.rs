//! Content source abstraction and the CMS HTTP client.
//!
//! Everything downstream consumes [`ContentSource`]; its methods never fail.
//! Implementations degrade to the last snapshot or an empty list instead.

mod client;
pub mod models;

pub use client::{CmsClient, CmsConfig};
pub use models::{CmsBook, CmsEvent, CmsFaq, EventStatus};

use async_trait::async_trait;

/// Provider of the three CMS collections.
#[async_trait]
pub trait ContentSource: Send + Sync {
    /// Returns all events.
    async fn fetch_events(&self) -> Vec<CmsEvent>;

    /// Returns all books.
    async fn fetch_books(&self) -> Vec<CmsBook>;

    /// Returns all FAQs.
    async fn fetch_faqs(&self) -> Vec<CmsFaq>;
}
