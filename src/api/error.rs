use axum::{http::StatusCode, response::IntoResponse, Json};
use serde::Serialize;
use thiserror::Error;

use crate::error::LocateError;

/// HTTP-boundary error, rendered as `{ "error": "<message>" }`
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error("unauthorized")]
    Unauthorized,
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    BadGateway(String),
    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    fn status_code(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::BadGateway(_) => StatusCode::BAD_GATEWAY,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Pipeline stages only distinguish client mistakes from everything else.
    pub fn pipeline(err: LocateError) -> Self {
        match err {
            LocateError::InvalidInput(msg) => ApiError::BadRequest(msg),
            other => ApiError::Internal(other.detail()),
        }
    }
}

impl From<LocateError> for ApiError {
    fn from(err: LocateError) -> Self {
        match err {
            LocateError::InvalidInput(msg) => ApiError::BadRequest(msg),
            LocateError::UnknownJob(_) => ApiError::NotFound(err.to_string()),
            LocateError::UpstreamTimeout { .. } | LocateError::UpstreamFailure { .. } => {
                ApiError::BadGateway(err.detail())
            }
            LocateError::ModelContractViolation(_) | LocateError::Internal(_) => {
                ApiError::Internal(err.detail())
            }
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(status = status.as_u16(), "Request failed: {}", self);
        } else {
            tracing::debug!(status = status.as_u16(), "Request rejected: {}", self);
        }
        (status, Json(ErrorBody { error: self.to_string() })).into_response()
    }
}
