use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use thiserror::Error;

/// Every failure the gateway can surface to a caller. Nothing is retried;
/// each variant maps to exactly one HTTP response shape.
#[derive(Error, Debug)]
pub enum AdapterError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("invalid request: {0}")]
    ClientRequest(String),
    /// The upstream vendor API rejected or failed the call. The mirrored
    /// status is whatever the backend reported, 500 when it reported none.
    #[error("{message}")]
    Backend {
        status: Option<u16>,
        message: String,
    },
    #[error("network error: {0}")]
    Network(String),
    #[error("unsupported operation: {0}")]
    Unsupported(String),
}

impl AdapterError {
    pub fn backend(message: impl Into<String>) -> Self {
        AdapterError::Backend {
            status: None,
            message: message.into(),
        }
    }

    pub fn backend_status(status: StatusCode, message: impl Into<String>) -> Self {
        AdapterError::Backend {
            status: Some(status.as_u16()),
            message: message.into(),
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            AdapterError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AdapterError::ClientRequest(_) => StatusCode::BAD_REQUEST,
            AdapterError::Backend { status, .. } => status
                .and_then(|s| StatusCode::from_u16(s).ok())
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            AdapterError::Network(_) => StatusCode::BAD_GATEWAY,
            AdapterError::Unsupported(_) => StatusCode::BAD_REQUEST,
        }
    }
}

impl From<reqwest::Error> for AdapterError {
    fn from(e: reqwest::Error) -> Self {
        match e.status() {
            Some(status) => AdapterError::backend_status(status, e.to_string()),
            None => AdapterError::backend(e.to_string()),
        }
    }
}

impl IntoResponse for AdapterError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({ "error": self.to_string() });
        (self.status_code(), Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_status_is_mirrored() {
        let err = AdapterError::backend_status(StatusCode::TOO_MANY_REQUESTS, "slow down");
        assert_eq!(err.status_code(), StatusCode::TOO_MANY_REQUESTS);
    }

    #[test]
    fn backend_without_status_defaults_to_500() {
        assert_eq!(
            AdapterError::backend("boom").status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn malformed_request_is_a_400() {
        assert_eq!(
            AdapterError::ClientRequest("bad json".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
    }
}
