use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::interaction::InteractionError;
use crate::registry::RegistryError;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Unknown run_id: {0}")]
    RunNotFound(String),
    #[error("Input request {0} is not pending")]
    RequestNotPending(String),
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::RunNotFound(_) => StatusCode::NOT_FOUND,
            ApiError::RequestNotPending(_) | ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn code(&self) -> &'static str {
        match self {
            ApiError::RunNotFound(_) => "run_not_found",
            ApiError::RequestNotPending(_) => "request_not_pending",
            ApiError::BadRequest(_) => "bad_request",
            ApiError::Internal(_) => "internal",
        }
    }
}

impl From<RegistryError> for ApiError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::RunNotFound(run_id) => ApiError::RunNotFound(run_id),
            // The run ended between lookup and resolution.
            RegistryError::Interaction(e @ InteractionError::Bus(_)) => ApiError::BadRequest(e.to_string()),
            RegistryError::Interaction(e) => ApiError::Internal(e.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!("Request failed: {}", self);
        } else {
            tracing::debug!("Request rejected: {}", self);
        }
        let body = json!({
            "error": {
                "code": self.code(),
                "message": self.to_string(),
            }
        });
        (status, Json(body)).into_response()
    }
}
