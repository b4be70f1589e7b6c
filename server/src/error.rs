//! Gateway error kinds and their HTTP mapping

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;

use crate::session::StoreError;
use crate::shard::ShardError;

/// Errors surfaced by the gateway
#[derive(Debug, Error)]
pub enum GatewayError {
    /// No shards configured, no mount path, or an unreadable dataset file
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Missing or malformed request input, including path traversal
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Well-formed input naming a dataset, image or session that does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// A shard call failed during session setup or teardown
    #[error("Upstream error from shard {shard}: {source}")]
    Upstream {
        shard: String,
        #[source]
        source: ShardError,
    },

    /// The store references a token its shard no longer knows, twice in a row
    #[error("Session for {0} is inconsistent with its shard")]
    SessionInconsistency(String),

    #[error("Session store error: {0}")]
    Store(#[from] StoreError),
}

impl GatewayError {
    pub fn upstream(shard: &str, source: ShardError) -> Self {
        Self::Upstream {
            shard: shard.to_string(),
            source,
        }
    }

    fn code(&self) -> &'static str {
        match self {
            GatewayError::Configuration(_) => "configuration_error",
            GatewayError::InvalidInput(_) => "invalid_input",
            GatewayError::NotFound(_) => "not_found",
            GatewayError::Upstream { .. } => "upstream_error",
            GatewayError::SessionInconsistency(_) => "session_inconsistency",
            GatewayError::Store(_) => "store_error",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            GatewayError::NotFound(_) => StatusCode::NOT_FOUND,
            GatewayError::Store(_) => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::Configuration(_)
            | GatewayError::Upstream { .. }
            | GatewayError::SessionInconsistency(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Error response body for the gateway API
#[derive(Debug, Serialize)]
pub struct GatewayErrorResponse {
    pub status: &'static str,
    pub error: String,
    pub code: &'static str,
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = GatewayErrorResponse {
            status: "error",
            error: self.to_string(),
            code: self.code(),
        };
        (status, Json(body)).into_response()
    }
}
