use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use thiserror::Error;

/// Failure of the language model call. Never papered over.
#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("generation request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("generation provider returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("malformed generation response: {0}")]
    Malformed(String),
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Query is required")]
    MissingQuery,

    #[error("Failed to generate response from the language model")]
    Generation(#[from] GenerationError),
}

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Internal,
}

impl From<PipelineError> for ApiError {
    fn from(err: PipelineError) -> Self {
        match err {
            PipelineError::MissingQuery => ApiError::BadRequest(err.to_string()),
            PipelineError::Generation(e) => {
                tracing::error!("Generation failed: {}", e);
                ApiError::Internal
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(message) => (StatusCode::BAD_REQUEST, message),
            ApiError::Internal => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal server error".to_string(),
            ),
        };
        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generation_failure_hides_detail_from_http_clients() {
        let err = PipelineError::Generation(GenerationError::Status {
            status: 500,
            body: "upstream stack trace".into(),
        });
        assert_eq!(err.to_string(), "Failed to generate response from the language model");

        let response = ApiError::from(err).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_missing_query_is_bad_request() {
        let response = ApiError::from(PipelineError::MissingQuery).into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
