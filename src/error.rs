//! Caller-visible error kinds and their HTTP mapping.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Session, pool, or sandbox does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// Missing required field, bad snapshot id, malformed step
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Pool cannot serve new sandboxes; message names the pool and condition
    #[error("pool unhealthy: {0}")]
    PoolUnhealthy(String),

    /// Sandbox not Ready within the deadline, or an RPC deadline expired
    #[error("timeout: {0}")]
    Timeout(String),

    /// Optimistic concurrency loss; retried internally, never surfaced
    #[error("conflict: {0}")]
    Conflict(String),

    /// A phase transition outside the sandbox lifecycle graph
    #[error("illegal sandbox transition: {from} -> {to}")]
    IllegalTransition { from: String, to: String },

    /// Resource store or sidecar unreachable
    #[error("upstream unavailable: {0}")]
    Upstream(String),

    #[error(transparent)]
    Kube(#[from] kube::Error),

    #[error(transparent)]
    Serde(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Translate a kube API error, turning 404 into `NotFound` and 409 into
    /// `Conflict` so callers can match on semantics instead of status codes.
    pub fn from_kube(err: kube::Error, what: impl Into<String>) -> Self {
        match err {
            kube::Error::Api(ref ae) if ae.code == 404 => Error::NotFound(what.into()),
            kube::Error::Api(ref ae) if ae.code == 409 => Error::Conflict(what.into()),
            other => Error::Kube(other),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Conflict(_))
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::InvalidArgument(_) => StatusCode::BAD_REQUEST,
            Error::PoolUnhealthy(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Error::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Error::Conflict(_) => StatusCode::CONFLICT,
            Error::IllegalTransition { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Error::Upstream(_) | Error::Kube(_) => StatusCode::BAD_GATEWAY,
            Error::Serde(_) => StatusCode::BAD_REQUEST,
            Error::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Error envelope: `{"error": "..."}` with the mapped status code.
impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = Json(serde_json::json!({ "error": self.to_string() }));
        (status, body).into_response()
    }
}
