//! HTTP surface.
//!
//! | Method | Path | Handler |
//! |--------|------|---------|
//! | POST | `/api/cms/push` | [`handlers::cms_push`] |
//! | GET | `/api/health` | [`handlers::health`] |
//! | GET | `/api/knowledge` | [`handlers::knowledge`] |
//! | POST | `/api/chat/session` | [`handlers::create_session`] |
//! | GET, HEAD, DELETE | `/api/chat/session/{id}` | session lookup and removal |
//! | POST | `/api/chat/session/{id}/messages` | [`handlers::append_message`] |

pub mod handlers;

use crate::context::AppContext;
use crate::{Error, Result};
use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::http::header;
use axum::routing::{get, post};
use std::future::Future;
use std::net::SocketAddr;
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;

/// Maximum accepted request body (1MB).
const MAX_REQUEST_BODY_SIZE: usize = 1024 * 1024;

/// Builds the router with security headers and request tracing.
pub fn router(context: AppContext) -> Router {
    Router::new()
        .route("/api/cms/push", post(handlers::cms_push))
        .route("/api/health", get(handlers::health))
        .route("/api/knowledge", get(handlers::knowledge))
        .route("/api/chat/session", post(handlers::create_session))
        .route(
            "/api/chat/session/{id}",
            get(handlers::get_session)
                .head(handlers::head_session)
                .delete(handlers::delete_session),
        )
        .route(
            "/api/chat/session/{id}/messages",
            post(handlers::append_message),
        )
        .layer(DefaultBodyLimit::max(MAX_REQUEST_BODY_SIZE))
        // Security headers (OWASP recommendations)
        .layer(SetResponseHeaderLayer::overriding(
            header::X_CONTENT_TYPE_OPTIONS,
            header::HeaderValue::from_static("nosniff"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            header::X_FRAME_OPTIONS,
            header::HeaderValue::from_static("DENY"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            header::CACHE_CONTROL,
            header::HeaderValue::from_static("no-store"),
        ))
        .layer(TraceLayer::new_for_http())
        .with_state(context)
}

/// Serves the router on `addr` until `shutdown` resolves.
///
/// # Errors
///
/// Returns an error if the listener cannot bind or the server fails.
pub async fn serve<F>(context: AppContext, addr: SocketAddr, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| Error::operation("bind", format!("{addr}: {e}")))?;
    let local = listener
        .local_addr()
        .map_err(|e| Error::operation("bind", e))?;
    tracing::info!(addr = %local, "HTTP server listening");

    axum::serve(listener, router(context))
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|e| Error::operation("serve", e))?;

    tracing::info!("HTTP server stopped");
    Ok(())
}
