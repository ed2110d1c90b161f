//! API error handling.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

/// API error type.
#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Unavailable(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };

        let body = Json(json!({
            "error": message
        }));

        (status, body).into_response()
    }
}

impl From<builder_core::Error> for ApiError {
    fn from(err: builder_core::Error) -> Self {
        use builder_core::Error;
        match err {
            Error::NotFound(_) => ApiError::NotFound(err.to_string()),
            Error::Decode(_) | Error::InvalidInput(_) => ApiError::BadRequest(err.to_string()),
            Error::Cancelled => ApiError::Unavailable("server is shutting down".to_string()),
            _ => ApiError::Internal(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use builder_core::Error;

    #[test]
    fn test_core_errors_map_to_status() {
        let status = |e: Error| ApiError::from(e).into_response().status();
        assert_eq!(status(Error::NotFound("x".into())), StatusCode::NOT_FOUND);
        assert_eq!(status(Error::Decode("x".into())), StatusCode::BAD_REQUEST);
        assert_eq!(status(Error::InvalidInput("x".into())), StatusCode::BAD_REQUEST);
        assert_eq!(status(Error::Cancelled), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(status(Error::Io("x".into())), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
