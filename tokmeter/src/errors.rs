use crate::upstream::UpstreamError;
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error as ThisError;

#[derive(ThisError, Debug)]
pub enum Error {
    /// Request arrived without an `x-api-key`
    #[error("Missing API key")]
    MissingCredential,

    /// The upstream exchange failed before a response was received
    #[error(transparent)]
    Upstream(#[from] UpstreamError),

    /// Generic internal service error
    #[error("Failed to {operation}")]
    Internal { operation: String },

    /// Unexpected error with full context chain
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::MissingCredential => StatusCode::UNAUTHORIZED,
            Error::Upstream(_) | Error::Internal { .. } | Error::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Message placed in the `error` field of the response body.
    ///
    /// Upstream failures are reported with their full text so clients can tell a timeout from a
    /// refused connection. Anything else internal stays opaque.
    pub fn user_message(&self) -> String {
        match self {
            Error::MissingCredential => "Missing API key".to_string(),
            Error::Upstream(err) => err.to_string(),
            Error::Internal { .. } | Error::Other(_) => "Internal server error".to_string(),
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        match &self {
            Error::Internal { .. } | Error::Other(_) => {
                tracing::error!("Internal service error: {:#}", self);
            }
            Error::Upstream(_) => {
                tracing::warn!("Upstream error: {}", self);
            }
            Error::MissingCredential => {
                tracing::info!("Authentication error: {}", self);
            }
        }

        let status = self.status_code();
        (status, Json(json!({ "error": self.user_message() }))).into_response()
    }
}

/// Type alias for service operation results
pub type Result<T> = std::result::Result<T, Error>;
