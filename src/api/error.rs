use axum::{
    extract::rejection::JsonRejection,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::error::OrchestratorError;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Orchestrator(#[from] OrchestratorError),

    #[error("{0}")]
    BadRequest(String),
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Orchestrator(e) => match e {
                OrchestratorError::RegistrationConflict(_)
                | OrchestratorError::DuplicateCorrelation(_) => StatusCode::CONFLICT,
                OrchestratorError::InvalidRegistration(_) => StatusCode::BAD_REQUEST,
                OrchestratorError::InvalidToken(_) => StatusCode::UNAUTHORIZED,
                OrchestratorError::AgentNotFound(_) => StatusCode::NOT_FOUND,
                OrchestratorError::AgentUnhealthy(_)
                | OrchestratorError::ShutdownInProgress
                | OrchestratorError::NotInitialized => StatusCode::SERVICE_UNAVAILABLE,
                OrchestratorError::RequestTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
                OrchestratorError::TransportFailure(_) => StatusCode::BAD_GATEWAY,
                OrchestratorError::HandlerFailure { .. }
                | OrchestratorError::InvalidTransition(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            ApiError::BadRequest(_) => "bad-request",
            ApiError::Orchestrator(e) => e.code(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            log::warn!("Request failed with {}: {}", status, self);
        }
        let body = Json(json!({
            "error": self.code(),
            "message": self.to_string(),
        }));
        (status, body).into_response()
    }
}
