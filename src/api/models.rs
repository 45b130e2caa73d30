use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::Value;

use crate::api::AppState;
use crate::error::AdapterError;
use crate::protocol::ModelList;

pub async fn list(State(state): State<AppState>) -> Response {
    match state.backend.list_models().await {
        Ok(data) => Json(ModelList::new(data)).into_response(),
        Err(err) => {
            tracing::error!("listing models failed: {err}");
            // Catalog failures always answer 500, whatever the backend said.
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({"error": err.to_string()})),
            )
                .into_response()
        }
    }
}

pub async fn embeddings(State(state): State<AppState>, body: Bytes) -> Response {
    let body = match parse(&body) {
        Ok(body) => body,
        Err(err) => return err.into_response(),
    };
    match state.backend.embeddings(body).await {
        Ok(resp) => Json(resp).into_response(),
        Err(err) => err.into_response(),
    }
}

pub async fn images(State(state): State<AppState>, body: Bytes) -> Response {
    let body = match parse(&body) {
        Ok(body) => body,
        Err(err) => return err.into_response(),
    };
    match state.backend.images(body).await {
        Ok(resp) => Json(resp).into_response(),
        Err(err) => err.into_response(),
    }
}

fn parse(body: &Bytes) -> Result<Value, AdapterError> {
    serde_json::from_slice(body)
        .map_err(|e| AdapterError::ClientRequest(format!("invalid request body: {e}")))
}
