//! In-memory conversational session store with sliding expiration.
//!
//! Sessions hold the message history and an opaque state blob (typically the
//! knowledge text captured at creation). Reads and writes refresh the idle
//! clock; a background sweeper evicts sessions idle longer than the TTL.
//!
//! Expiry is enforced by the sweep only: an idle session stays readable until
//! the next sweep removes it, and reading it resets its idle clock.

use crate::Error;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Default idle TTL (2 hours).
pub const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(2 * 60 * 60);

/// Default sweep interval (5 minutes).
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Author of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// The visitor.
    User,
    /// The bot.
    Assistant,
}

impl Role {
    /// Returns the lowercase wire name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "user" => Ok(Self::User),
            "assistant" => Ok(Self::Assistant),
            other => Err(Error::InvalidInput(format!("unknown message role: {other}"))),
        }
    }
}

/// One message in a conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Author.
    pub role: Role,
    /// Text.
    pub content: String,
    /// When the message was appended.
    pub timestamp: DateTime<Utc>,
}

/// A conversation.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    /// Unique id (UUID v4).
    pub id: String,
    /// Messages in append order.
    pub messages: Vec<Message>,
    /// Opaque per-session state.
    pub state: serde_json::Value,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last read or write.
    pub last_accessed_at: DateTime<Utc>,
}

struct Entry {
    session: Session,
    touched: Instant,
}

impl Entry {
    fn touch(&mut self) {
        self.touched = Instant::now();
        self.session.last_accessed_at = Utc::now();
    }
}

/// Thread-safe session store.
pub struct SessionStore {
    sessions: Mutex<HashMap<String, Entry>>,
    ttl: Duration,
}

impl fmt::Debug for SessionStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionStore")
            .field("sessions", &self.len())
            .field("ttl", &self.ttl)
            .finish()
    }
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new(DEFAULT_SESSION_TTL)
    }
}

impl SessionStore {
    /// Creates an empty store with the given idle TTL.
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns the idle TTL.
    #[must_use]
    pub const fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Creates a session seeded with `state`.
    pub fn create(&self, state: serde_json::Value) -> Session {
        let now = Utc::now();
        let session = Session {
            id: Uuid::new_v4().to_string(),
            messages: Vec::new(),
            state,
            created_at: now,
            last_accessed_at: now,
        };

        let count = {
            let mut sessions = self.lock();
            sessions.insert(
                session.id.clone(),
                Entry {
                    session: session.clone(),
                    touched: Instant::now(),
                },
            );
            sessions.len()
        };

        record_count(count);
        tracing::debug!(session_id = %session.id, "Session created");
        session
    }

    /// Returns a copy of the session and refreshes its idle clock.
    pub fn get(&self, id: &str) -> Option<Session> {
        let mut sessions = self.lock();
        let entry = sessions.get_mut(id)?;
        entry.touch();
        Some(entry.session.clone())
    }

    /// Returns `true` if the session exists. Does not refresh the idle clock.
    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.lock().contains_key(id)
    }

    /// Appends a message. Returns `false` if the session does not exist.
    pub fn add_message(&self, id: &str, role: Role, content: impl Into<String>) -> bool {
        let mut sessions = self.lock();
        let Some(entry) = sessions.get_mut(id) else {
            return false;
        };
        entry.session.messages.push(Message {
            role,
            content: content.into(),
            timestamp: Utc::now(),
        });
        entry.touch();
        true
    }

    /// Returns the messages of a session, or an empty list if it does not exist.
    #[must_use]
    pub fn messages(&self, id: &str) -> Vec<Message> {
        self.lock()
            .get(id)
            .map(|entry| entry.session.messages.clone())
            .unwrap_or_default()
    }

    /// Removes a session. Returns `true` if it existed.
    pub fn delete(&self, id: &str) -> bool {
        let (removed, count) = {
            let mut sessions = self.lock();
            let removed = sessions.remove(id).is_some();
            (removed, sessions.len())
        };
        if removed {
            record_count(count);
            tracing::debug!(session_id = %id, "Session deleted");
        }
        removed
    }

    /// Number of live sessions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Returns `true` if there are no sessions.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Evicts sessions idle longer than the TTL. Returns the number evicted.
    pub fn sweep_expired(&self) -> usize {
        let (evicted, remaining) = {
            let mut sessions = self.lock();
            let before = sessions.len();
            sessions.retain(|_, entry| entry.touched.elapsed() <= self.ttl);
            (before - sessions.len(), sessions.len())
        };

        record_count(remaining);
        if evicted > 0 {
            metrics::counter!("sessions_evicted_total").increment(evicted as u64);
            tracing::info!(evicted, remaining, "Swept expired sessions");
        }
        evicted
    }

    /// Runs [`sweep_expired`](Self::sweep_expired) every `interval` until
    /// `shutdown` flips to `true` or its sender is dropped.
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        store.sweep_expired();
                    },
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    },
                }
            }
            tracing::debug!("Session sweeper stopped");
        })
    }
}

#[allow(clippy::cast_precision_loss)]
fn record_count(count: usize) {
    metrics::gauge!("sessions_active").set(count as f64);
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_create_and_get() {
        let store = SessionStore::default();
        let session = store.create(json!({ "knowledge": "k" }));

        assert!(Uuid::parse_str(&session.id).is_ok());
        let fetched = store.get(&session.id).unwrap();
        assert_eq!(fetched.state, json!({ "knowledge": "k" }));
        assert!(fetched.messages.is_empty());
        assert!(fetched.last_accessed_at >= session.last_accessed_at);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_ids_are_unique() {
        let store = SessionStore::default();
        let a = store.create(json!(null));
        let b = store.create(json!(null));
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_missing_session() {
        let store = SessionStore::default();
        assert!(store.get("nope").is_none());
        assert!(!store.add_message("nope", Role::User, "hi"));
        assert!(store.messages("nope").is_empty());
        assert!(!store.delete("nope"));
    }

    #[test]
    fn test_messages_preserve_order() {
        let store = SessionStore::default();
        let id = store.create(json!({})).id;
        assert!(store.add_message(&id, Role::User, "When is the next event?"));
        assert!(store.add_message(&id, Role::Assistant, "Saturday."));

        let messages = store.messages(&id);
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, Role::User);
        assert_eq!(messages[1].content, "Saturday.");
        assert!(messages[0].timestamp <= messages[1].timestamp);
    }

    #[test]
    fn test_delete() {
        let store = SessionStore::default();
        let id = store.create(json!({})).id;
        assert!(store.delete(&id));
        assert!(!store.contains(&id));
        assert!(store.is_empty());
    }

    #[test]
    fn test_sweep_evicts_idle_sessions() {
        let store = SessionStore::new(Duration::from_millis(50));
        let id = store.create(json!({})).id;

        assert_eq!(store.sweep_expired(), 0);
        std::thread::sleep(Duration::from_millis(80));
        assert_eq!(store.sweep_expired(), 1);
        assert!(store.get(&id).is_none());
    }

    #[test]
    fn test_access_slides_expiration() {
        let ttl = Duration::from_millis(200);
        let store = SessionStore::new(ttl);
        let id = store.create(json!({})).id;

        // Touch at 0.9 x TTL, then pass the original deadline.
        std::thread::sleep(Duration::from_millis(180));
        assert!(store.get(&id).is_some());
        std::thread::sleep(Duration::from_millis(60));
        assert_eq!(store.sweep_expired(), 0);
        assert!(store.contains(&id));

        std::thread::sleep(Duration::from_millis(220));
        assert_eq!(store.sweep_expired(), 1);
        assert!(store.get(&id).is_none());
    }

    #[test]
    fn test_add_message_slides_expiration() {
        let store = SessionStore::new(Duration::from_millis(150));
        let id = store.create(json!({})).id;
        std::thread::sleep(Duration::from_millis(100));
        assert!(store.add_message(&id, Role::User, "still here"));
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(store.sweep_expired(), 0);
    }

    #[test]
    fn test_role_parsing() {
        assert_eq!("user".parse::<Role>().unwrap(), Role::User);
        assert_eq!("Assistant".parse::<Role>().unwrap(), Role::Assistant);
        assert!(matches!("system".parse::<Role>(), Err(Error::InvalidInput(_))));
    }

    #[tokio::test]
    async fn test_sweeper_runs_and_stops() {
        let store = Arc::new(SessionStore::new(Duration::from_millis(10)));
        store.create(json!({}));
        let (tx, rx) = watch::channel(false);

        let handle = store.spawn_sweeper(Duration::from_millis(20), rx);
        for _ in 0..50 {
            if store.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(store.is_empty());

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
