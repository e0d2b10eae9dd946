use thiserror::Error;

use crate::types::AgentId;

pub type Result<T> = std::result::Result<T, OrchestratorError>;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum OrchestratorError {
    #[error("agent {0} is already registered")]
    RegistrationConflict(AgentId),

    #[error("invalid registration: {0}")]
    InvalidRegistration(String),

    #[error("invalid heartbeat token for agent {0}")]
    InvalidToken(AgentId),

    #[error("agent {0} not found")]
    AgentNotFound(AgentId),

    #[error("agent {0} is not healthy")]
    AgentUnhealthy(AgentId),

    #[error("request {correlation_id} timed out after {timeout_ms}ms")]
    RequestTimeout {
        correlation_id: String,
        timeout_ms: u64,
    },

    #[error("correlation id {0} already has a pending request")]
    DuplicateCorrelation(String),

    #[error("subscriber {subscription} failed: {message}")]
    HandlerFailure {
        subscription: String,
        message: String,
    },

    #[error("transport failure: {0}")]
    TransportFailure(String),

    #[error("orchestrator is shutting down")]
    ShutdownInProgress,

    #[error("orchestrator has not been initialized")]
    NotInitialized,

    #[error("invalid state transition: {0}")]
    InvalidTransition(String),
}

impl OrchestratorError {
    /// Stable machine-readable code, used in error responses and events.
    pub fn code(&self) -> &'static str {
        match self {
            OrchestratorError::RegistrationConflict(_) => "registration-conflict",
            OrchestratorError::InvalidRegistration(_) => "invalid-registration",
            OrchestratorError::InvalidToken(_) => "invalid-token",
            OrchestratorError::AgentNotFound(_) => "agent-not-found",
            OrchestratorError::AgentUnhealthy(_) => "agent-unhealthy",
            OrchestratorError::RequestTimeout { .. } => "request-timeout",
            OrchestratorError::DuplicateCorrelation(_) => "duplicate-correlation",
            OrchestratorError::HandlerFailure { .. } => "handler-failure",
            OrchestratorError::TransportFailure(_) => "transport-failure",
            OrchestratorError::ShutdownInProgress => "shutdown-in-progress",
            OrchestratorError::NotInitialized => "not-initialized",
            OrchestratorError::InvalidTransition(_) => "invalid-transition",
        }
    }

    /// Only failures where no agent answered are safe to retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            OrchestratorError::RequestTimeout { .. } | OrchestratorError::TransportFailure(_)
        )
    }
}
