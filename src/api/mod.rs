pub mod chat;
pub mod models;

use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Request, State};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use tower_http::trace::TraceLayer;

use crate::backends::Backend;
use crate::config::Config;
use crate::error::AdapterError;

#[derive(Clone)]
pub struct AppState {
    pub backend: Arc<dyn Backend>,
    pub uri: String,
    pub debug: bool,
}

impl AppState {
    pub fn new(backend: Arc<dyn Backend>, config: &Config) -> Self {
        AppState {
            backend,
            uri: config.base_uri(),
            debug: config.debug,
        }
    }
}

pub fn router(state: AppState) -> Router {
    let mut router = Router::new()
        .route("/", get(root).post(root))
        .route("/v1/models", get(models::list))
        .route("/v1/chat/completions", post(chat::completions))
        .route("/v1/embeddings", post(models::embeddings))
        .route("/v1/images/generations", post(models::images));
    if state.debug {
        router = router.layer(middleware::from_fn(log_body));
    }
    router.with_state(state).layer(TraceLayer::new_for_http())
}

/// Health/self-identification probe: answers the gateway's own base URL.
async fn root(State(state): State<AppState>) -> String {
    state.uri.clone()
}

/// Body-logging middleware, mounted only when DEBUG is set. Request bodies
/// are small chat/embedding payloads, never large uploads.
async fn log_body(req: Request, next: Next) -> Response {
    let (parts, body) = req.into_parts();
    let bytes = match axum::body::to_bytes(body, usize::MAX).await {
        Ok(bytes) => bytes,
        Err(e) => {
            return AdapterError::ClientRequest(format!("reading request body: {e}"))
                .into_response()
        }
    };
    if !bytes.is_empty() {
        tracing::debug!(body = %String::from_utf8_lossy(&bytes), "request body");
    }
    next.run(Request::from_parts(parts, Body::from(bytes))).await
}
