//! CMS content records.
//!
//! Field names follow the CMS wire format (camelCase). Nullable fields are
//! `Option`, and unknown fields are ignored so additive CMS changes never
//! break decoding.

use serde::{Deserialize, Serialize};

/// Lifecycle of an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventStatus {
    /// Not yet happened.
    Scheduled,
    /// Happened; a recording may be available.
    Recorded,
    /// Any status this crate does not know about.
    #[serde(other)]
    Other,
}

/// An event (author talk, book club session).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CmsEvent {
    /// Event identifier.
    pub id: String,
    /// Event title.
    pub title: String,
    /// URL slug.
    #[serde(default)]
    pub slug: Option<String>,
    /// Free-text description.
    #[serde(default)]
    pub description: Option<String>,
    /// Featured author.
    #[serde(default)]
    pub author_name: Option<String>,
    /// Book discussed at the event.
    #[serde(default)]
    pub book_title: Option<String>,
    /// Event date, ISO 8601 (date or date-time).
    #[serde(default)]
    pub event_date: Option<String>,
    /// Start time as displayed (e.g. `7:00 PM`).
    #[serde(default)]
    pub start_time: Option<String>,
    /// Venue.
    #[serde(default)]
    pub location: Option<String>,
    /// Recording URL.
    #[serde(default)]
    pub video_url: Option<String>,
    /// Lifecycle status.
    pub status: EventStatus,
    /// Whether the event is featured.
    #[serde(default)]
    pub is_featured: bool,
}

/// A book in the catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CmsBook {
    /// Book identifier.
    pub id: String,
    /// Title.
    pub title: String,
    /// Author.
    #[serde(default)]
    pub author: Option<String>,
    /// Genre.
    #[serde(default)]
    pub genre: Option<String>,
    /// Blurb.
    #[serde(default)]
    pub description: Option<String>,
    /// Whether the book is featured.
    #[serde(default)]
    pub is_featured: bool,
    /// Display order.
    #[serde(default)]
    pub sort_order: i64,
}

/// A frequently asked question.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CmsFaq {
    /// FAQ identifier.
    pub id: String,
    /// Question text.
    pub question: String,
    /// Answer text.
    pub answer: String,
    /// Category.
    #[serde(default)]
    pub category: Option<String>,
    /// Display order.
    #[serde(default)]
    pub sort_order: i64,
}
