use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;

use crate::error::Error;

pub type ApiResult<T> = Result<T, ApiError>;

/// API error that converts to a proper HTTP response
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl ApiError {
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
        }
    }
}

/// Status for each error kind. Anything without a client-facing meaning is a 500.
#[must_use]
pub fn status_for(err: &Error) -> StatusCode {
    match err {
        Error::InvalidCredentials | Error::NotAuthorized(_) => StatusCode::UNAUTHORIZED,
        Error::Forbidden(_) | Error::SliceLocked(_) => StatusCode::FORBIDDEN,
        Error::InvalidUuid(_) | Error::InvalidEncoding(_) | Error::BadRequest(_) => {
            StatusCode::BAD_REQUEST
        }
        Error::NotFound => StatusCode::NOT_FOUND,
        Error::SliceBusy(_) => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        let status = status_for(&err);
        if status.is_server_error() {
            tracing::error!(error = %err, "request failed");
        }
        Self {
            status,
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = json!({ "error": self.message });
        (self.status, Json(body)).into_response()
    }
}
