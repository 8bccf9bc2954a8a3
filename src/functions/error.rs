use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use thiserror::Error;

pub const RATE_LIMIT_EXCEEDED: &str = "RATE_LIMIT_EXCEEDED";

#[derive(Debug, Error)]
pub enum FunctionError {
    #[error("Rate limit exceeded. Please sign in for unlimited access.")]
    RateLimited,

    #[error("No audio data provided")]
    MissingAudio,

    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Transcription API error: {0}")]
    Upstream(String),
}

impl FunctionError {
    fn code(&self) -> Option<&'static str> {
        match self {
            FunctionError::RateLimited => Some(RATE_LIMIT_EXCEEDED),
            _ => None,
        }
    }
}

impl IntoResponse for FunctionError {
    fn into_response(self) -> Response {
        let status = match &self {
            FunctionError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let body = match self.code() {
            Some(code) => serde_json::json!({ "error": self.to_string(), "code": code }),
            None => serde_json::json!({ "error": self.to_string() }),
        };

        let mut response = (status, axum::Json(body)).into_response();
        if matches!(self, FunctionError::RateLimited) {
            response
                .headers_mut()
                .insert("x-ratelimit-remaining", HeaderValue::from_static("0"));
        }
        response
    }
}
