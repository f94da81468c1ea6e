//! Route handlers.

use crate::context::AppContext;
use crate::session::{Role, Session};
use axum::Json;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use serde_json::json;

/// Header carrying the provenance of `/api/knowledge` responses.
pub const FRESHNESS_HEADER: &str = "x-knowledge-freshness";

/// `POST /api/cms/push`
pub async fn cms_push(
    State(context): State<AppContext>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let outcome = context.webhook().handle(&headers, &body);
    let status = StatusCode::from_u16(outcome.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(outcome.body)).into_response()
}

/// `GET /api/health`
pub async fn health(State(context): State<AppContext>) -> Response {
    Json(json!({
        "status": "ok",
        "service": context.config().server.service_name,
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptimeSecs": context.uptime().as_secs(),
        "circuits": context.breakers().all_stats(),
    }))
    .into_response()
}

/// `GET /api/knowledge`
pub async fn knowledge(State(context): State<AppContext>) -> Response {
    let knowledge = context.knowledge().get_with_freshness().await;
    (
        [
            ("content-type", "text/plain; charset=utf-8"),
            (FRESHNESS_HEADER, knowledge.freshness.as_str()),
        ],
        knowledge.text,
    )
        .into_response()
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SessionCreated {
    session_id: String,
}

/// `POST /api/chat/session`
///
/// Seeds the new session with the current knowledge text.
pub async fn create_session(State(context): State<AppContext>) -> Response {
    let knowledge = context.knowledge().get().await;
    let session = context.sessions().create(json!({ "knowledge": knowledge }));
    Json(SessionCreated {
        session_id: session.id,
    })
    .into_response()
}

#[derive(Serialize)]
struct MessageView {
    role: Role,
    content: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SessionView {
    session_id: String,
    message_count: usize,
    messages: Vec<MessageView>,
    created_at: String,
}

impl From<Session> for SessionView {
    fn from(session: Session) -> Self {
        Self {
            session_id: session.id,
            message_count: session.messages.len(),
            messages: session
                .messages
                .into_iter()
                .map(|m| MessageView {
                    role: m.role,
                    content: m.content,
                })
                .collect(),
            created_at: session.created_at.to_rfc3339(),
        }
    }
}

/// `GET /api/chat/session/{id}`
pub async fn get_session(State(context): State<AppContext>, Path(id): Path<String>) -> Response {
    match context.sessions().get(&id) {
        Some(session) => Json(SessionView::from(session)).into_response(),
        None => session_not_found(),
    }
}

/// `HEAD /api/chat/session/{id}`
pub async fn head_session(State(context): State<AppContext>, Path(id): Path<String>) -> StatusCode {
    if context.sessions().contains(&id) {
        StatusCode::OK
    } else {
        StatusCode::NOT_FOUND
    }
}

/// `DELETE /api/chat/session/{id}`
pub async fn delete_session(
    State(context): State<AppContext>,
    Path(id): Path<String>,
) -> Response {
    if context.sessions().delete(&id) {
        Json(json!({ "deleted": true })).into_response()
    } else {
        session_not_found()
    }
}

/// Body of `POST /api/chat/session/{id}/messages`.
#[derive(Debug, Deserialize)]
pub struct AppendMessage {
    role: Role,
    content: String,
}

/// `POST /api/chat/session/{id}/messages`
pub async fn append_message(
    State(context): State<AppContext>,
    Path(id): Path<String>,
    Json(message): Json<AppendMessage>,
) -> Response {
    if context
        .sessions()
        .add_message(&id, message.role, message.content)
    {
        StatusCode::NO_CONTENT.into_response()
    } else {
        session_not_found()
    }
}

fn session_not_found() -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(json!({ "error": "Session not found" })),
    )
        .into_response()
}
