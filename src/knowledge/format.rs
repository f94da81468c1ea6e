//! Renders CMS collections into the knowledge text handed to the chat bot.
//!
//! Sections appear in a fixed order and only when their source collection is
//! non-empty:
//!
//! 1. `## Upcoming Events` (status `scheduled`)
//! 2. `## Past Events (Recordings Available)` (status `recorded`, first 10)
//! 3. `## Book Catalog`
//! 4. `## Frequently Asked Questions` (ordered by `sort_order`)
//!
//! Sections are separated by a blank line.

use crate::cms::{CmsBook, CmsEvent, CmsFaq, EventStatus};
use chrono::{DateTime, NaiveDate};

/// Text returned when there is nothing to say.
pub const EMPTY_KNOWLEDGE_PLACEHOLDER: &str = "No content is currently available from the CMS.";

/// Maximum recorded events listed.
const MAX_RECORDED_EVENTS: usize = 10;

/// Builds the knowledge text, or [`EMPTY_KNOWLEDGE_PLACEHOLDER`] if every
/// collection is empty.
#[must_use]
pub fn render_knowledge(events: &[CmsEvent], books: &[CmsBook], faqs: &[CmsFaq]) -> String {
    let upcoming: Vec<&CmsEvent> = events
        .iter()
        .filter(|e| e.status == EventStatus::Scheduled)
        .collect();
    let recorded: Vec<&CmsEvent> = events
        .iter()
        .filter(|e| e.status == EventStatus::Recorded)
        .collect();

    let mut sections = Vec::with_capacity(4);
    if !upcoming.is_empty() {
        sections.push(upcoming_events(&upcoming));
    }
    if !recorded.is_empty() {
        sections.push(recorded_events(&recorded));
    }
    if !books.is_empty() {
        sections.push(book_catalog(books));
    }
    if !faqs.is_empty() {
        sections.push(frequently_asked(faqs));
    }

    if sections.is_empty() {
        return EMPTY_KNOWLEDGE_PLACEHOLDER.to_string();
    }
    sections.join("\n\n")
}

fn upcoming_events(events: &[&CmsEvent]) -> String {
    let items: Vec<String> = events
        .iter()
        .map(|e| {
            let mut parts = vec![format!("- \"{}\"", e.title)];
            if let Some(date) = present(e.event_date.as_deref()) {
                parts.push(format!("on {}", display_date(date)));
            }
            if let Some(start) = present(e.start_time.as_deref()) {
                parts.push(format!("at {start}"));
            }
            if let Some(author) = present(e.author_name.as_deref()) {
                parts.push(format!("featuring {author}"));
            }
            if let Some(book) = present(e.book_title.as_deref()) {
                parts.push(format!("discussing \"{book}\""));
            }
            if let Some(location) = present(e.location.as_deref()) {
                parts.push(format!("| Location: {location}"));
            }
            let mut line = parts.join(" ");
            if let Some(description) = present(e.description.as_deref()) {
                line.push_str("\n  ");
                line.push_str(description);
            }
            line
        })
        .collect();

    format!("## Upcoming Events\n{}", items.join("\n"))
}

fn recorded_events(events: &[&CmsEvent]) -> String {
    let items: Vec<String> = events
        .iter()
        .take(MAX_RECORDED_EVENTS)
        .map(|e| {
            let mut parts = vec![format!("- \"{}\"", e.title)];
            if let Some(author) = present(e.author_name.as_deref()) {
                parts.push(format!("with {author}"));
            }
            if let Some(book) = present(e.book_title.as_deref()) {
                parts.push(format!("on \"{book}\""));
            }
            if present(e.video_url.as_deref()).is_some() {
                parts.push("(recording available)".to_string());
            }
            parts.join(" ")
        })
        .collect();

    format!("## Past Events (Recordings Available)\n{}", items.join("\n"))
}

fn book_catalog(books: &[CmsBook]) -> String {
    let (featured, others): (Vec<&CmsBook>, Vec<&CmsBook>) =
        books.iter().partition(|b| b.is_featured);

    let mut items = Vec::with_capacity(books.len() + 2);
    if !featured.is_empty() {
        items.push("### Featured Books".to_string());
        items.extend(featured.iter().map(|b| {
            let mut line = book_line(b);
            if let Some(description) = present(b.description.as_deref()) {
                line.push_str("\n  ");
                line.push_str(description);
            }
            line
        }));
    }
    if !others.is_empty() {
        items.push("### All Books".to_string());
        items.extend(others.iter().map(|b| book_line(b)));
    }

    format!("## Book Catalog\n{}", items.join("\n"))
}

fn book_line(book: &CmsBook) -> String {
    let mut parts = vec![format!("- \"{}\"", book.title)];
    if let Some(author) = present(book.author.as_deref()) {
        parts.push(format!("by {author}"));
    }
    if let Some(genre) = present(book.genre.as_deref()) {
        parts.push(format!("({genre})"));
    }
    parts.join(" ")
}

fn frequently_asked(faqs: &[CmsFaq]) -> String {
    let mut sorted: Vec<&CmsFaq> = faqs.iter().collect();
    sorted.sort_by_key(|f| f.sort_order);
    let items: Vec<String> = sorted
        .iter()
        .map(|f| format!("Q: {}\nA: {}", f.question, f.answer))
        .collect();

    format!("## Frequently Asked Questions\n{}", items.join("\n\n"))
}

/// Treats empty strings like missing values.
fn present(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.trim().is_empty())
}

/// Formats an ISO date as `Saturday, March 15, 2025`.
///
/// The calendar date is taken as written; no time zone conversion happens.
/// Unparseable input is returned unchanged.
fn display_date(raw: &str) -> String {
    let date = DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.date_naive())
        .ok()
        .or_else(|| {
            raw.get(..10)
                .and_then(|day| NaiveDate::parse_from_str(day, "%Y-%m-%d").ok())
        });
    date.map_or_else(
        || raw.to_string(),
        |d| d.format("%A, %B %-d, %Y").to_string(),
    )
}
