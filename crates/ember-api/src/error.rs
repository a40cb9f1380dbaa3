//! Error types for the query API.
//!
//! [`ApiError`] unifies all failure modes into a single enum that can be
//! converted into an Axum HTTP response via its
//! [`IntoResponse`](axum::response::IntoResponse) implementation. The body
//! always has the shape
//! `{"error": {"kind", "reason", "message"}, "status"}`.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use ember_core::QueryError;
use ember_types::RequestError;

/// Errors that can occur in the API layer.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// The request body or its values were rejected.
    #[error(transparent)]
    Validation(#[from] RequestError),

    /// The query did not finish within the request deadline.
    #[error("query exceeded the {0} ms request deadline")]
    Timeout(u64),
}

impl From<QueryError> for ApiError {
    fn from(e: QueryError) -> Self {
        match e {
            QueryError::Validation(inner) => Self::Validation(inner),
        }
    }
}

impl ApiError {
    /// HTTP status for this error.
    pub const fn status(&self) -> StatusCode {
        match self {
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        }
    }

    /// Stable error kind.
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation_error",
            Self::Timeout(_) => "timeout",
        }
    }

    /// Machine-readable reason; the validation reason code where there is
    /// one.
    pub const fn reason(&self) -> &'static str {
        match self {
            Self::Validation(e) => e.reason(),
            Self::Timeout(_) => "request_deadline_exceeded",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "Request failed");
        } else {
            tracing::debug!(error = %self, "Request rejected");
        }

        let body = serde_json::json!({
            "error": {
                "kind": self.kind(),
                "reason": self.reason(),
                "message": self.to_string(),
            },
            "status": status.as_u16(),
        });

        (status, axum::Json(body)).into_response()
    }
}
