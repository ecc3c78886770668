//! Domain errors mapped to HTTP responses.
//!
//! - `validation_error` → 400
//! - `not_found` → 404
//! - `duplicate_version`, `version_not_ready` → 409
//! - `build_in_progress` → 202
//! - `storage_error`, `index_backend_error` → 502
//! - `partial_delete` → 500, with the delete report

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

use crate::error::{DocError, ErrorBody, ErrorKind};

#[derive(Debug)]
pub struct ApiError(pub DocError);

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self(DocError::validation(message))
    }
}

impl From<DocError> for ApiError {
    fn from(err: DocError) -> Self {
        Self(err)
    }
}

pub fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::ValidationError => StatusCode::BAD_REQUEST,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::DuplicateVersion | ErrorKind::VersionNotReady => StatusCode::CONFLICT,
        ErrorKind::BuildInProgress => StatusCode::ACCEPTED,
        ErrorKind::StorageError | ErrorKind::IndexBackendError => StatusCode::BAD_GATEWAY,
        ErrorKind::PartialDelete => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(self.0.kind());
        if status.is_server_error() {
            tracing::error!(kind = %self.0.kind(), error = %self.0, "request failed");
        } else {
            tracing::debug!(kind = %self.0.kind(), error = %self.0, "request rejected");
        }
        (status, Json(ErrorBody::from(&self.0))).into_response()
    }
}
