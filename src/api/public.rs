//! Public API types

use axum::Json;
use axum::response::{IntoResponse, Response};
use http::StatusCode;
use serde_json::json;

use crate::chat::{StoreError, ValidationError};
use crate::ollama::GatewayError;

// Errors

pub struct ApiError(anyhow::Error);

impl ApiError {
    fn status(&self) -> StatusCode {
        if self.0.downcast_ref::<ValidationError>().is_some() {
            return StatusCode::BAD_REQUEST;
        }
        if let Some(err) = self.0.downcast_ref::<StoreError>() {
            return match err {
                StoreError::NotFound(_) => StatusCode::NOT_FOUND,
                StoreError::TurnInProgress(_) => StatusCode::CONFLICT,
                StoreError::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
            };
        }
        if let Some(err) = self.0.downcast_ref::<GatewayError>() {
            return match err {
                GatewayError::ModelNotFound(_) => StatusCode::NOT_FOUND,
                GatewayError::UpstreamError { .. } => StatusCode::BAD_GATEWAY,
                GatewayError::BackendUnreachable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            };
        }
        StatusCode::INTERNAL_SERVER_ERROR
    }
}

/// Convert `ApiError` into an Axum compatible response.
impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!("{:#}", self.0);
        } else {
            tracing::warn!("{}", self.0);
        }

        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

/// Enables using `?` on functions that return `Result<_,
/// anyhow::Error>` to turn them into `Result<_, ApiError>`
impl<E> From<E> for ApiError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

// Re-export public types from each route

pub mod chats {
    pub use crate::api::routes::chats::public::*;
}

pub mod ollama {
    pub use crate::api::routes::ollama::public::*;
}
