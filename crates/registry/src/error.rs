use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// Errors surfaced through the registry API.
///
/// Every variant maps to a status code plus a stable string detail that
/// clients and dashboards can match on.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// Validation failure with a stable reason string.
    #[error("{0}")]
    BadRequest(String),

    /// Missing or malformed credentials.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Valid credentials without access to the operation.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// Resource absent or owned by another tenant.
    #[error("not found: {0}")]
    NotFound(String),

    /// A required token is not configured on the server.
    #[error("not configured: {0}")]
    NotConfigured(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl RegistryError {
    fn status_and_detail(&self) -> (StatusCode, String) {
        match self {
            Self::BadRequest(detail) => (StatusCode::BAD_REQUEST, detail.clone()),
            Self::Unauthorized(detail) => (StatusCode::UNAUTHORIZED, detail.clone()),
            Self::Forbidden(detail) => (StatusCode::FORBIDDEN, detail.clone()),
            Self::NotFound(detail) => (StatusCode::NOT_FOUND, detail.clone()),
            Self::NotConfigured(detail) => (StatusCode::SERVICE_UNAVAILABLE, detail.clone()),
            Self::Database(e) => (StatusCode::INTERNAL_SERVER_ERROR, format!("db_error: {e}")),
            Self::Io(e) => (StatusCode::INTERNAL_SERVER_ERROR, format!("io_error: {e}")),
        }
    }
}

impl IntoResponse for RegistryError {
    fn into_response(self) -> Response {
        let (status, detail) = self.status_and_detail();
        let body = serde_json::json!({ "detail": detail });
        (status, axum::Json(body)).into_response()
    }
}
