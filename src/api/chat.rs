use axum::body::Bytes;
use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum::Json;

use crate::api::AppState;
use crate::error::AdapterError;
use crate::protocol::ChatRequest;
use crate::stream::{self, ChatReply};

pub async fn completions(State(state): State<AppState>, body: Bytes) -> Response {
    let req: ChatRequest = match serde_json::from_slice(&body) {
        Ok(req) => req,
        Err(e) => {
            return AdapterError::ClientRequest(format!("invalid chat request: {e}"))
                .into_response()
        }
    };
    let stream_requested = req.stream;
    let model = req.model.clone();
    tracing::info!(
        backend = state.backend.name(),
        model = %model,
        stream = stream_requested,
        "chat completion"
    );

    match state.backend.chat(req).await {
        Ok(reply) if stream_requested => {
            stream::sse_response(model, reply, state.backend.capabilities().done_sentinel)
        }
        Ok(ChatReply::Single(unit)) => {
            Json(stream::completion_from_unit(&model, unit)).into_response()
        }
        // The backend streamed despite a non-streamed request; fold the
        // units into one completion rather than surprising the caller.
        Ok(ChatReply::Stream(units)) => match stream::collapse(units).await {
            Ok(unit) => Json(stream::completion_from_unit(&model, unit)).into_response(),
            Err(err) => err.into_response(),
        },
        Err(err) => err.into_response(),
    }
}
