use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

use super::{Priority, RequestId};
use crate::error::OrchestratorError;

/// Logical request kind used by the connector's reachability probe.
pub const HEALTH_CHECK_REQUEST: &str = "health-check";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentRequest {
    pub id: RequestId,
    #[serde(rename = "type")]
    pub request_type: String,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub data: Value,
    /// Per-request deadline; the connector default applies when absent.
    #[serde(default, rename = "timeout", skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

impl AgentRequest {
    pub fn new(request_type: impl Into<String>, data: Value) -> Self {
        Self {
            id: RequestId::new_v4(),
            request_type: request_type.into(),
            priority: Priority::Normal,
            data,
            timeout_ms: None,
            metadata: HashMap::new(),
        }
    }

    pub fn health_check() -> Self {
        Self::new(HEALTH_CHECK_REQUEST, Value::Null).with_priority(Priority::Low)
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn is_health_check(&self) -> bool {
        self.request_type == HEALTH_CHECK_REQUEST
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseStatus {
    Success,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseError {
    pub code: String,
    pub message: String,
    pub recoverable: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentResponse {
    pub request_id: RequestId,
    pub status: ResponseStatus,
    #[serde(default)]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ResponseError>,
    #[serde(default, rename = "processingTime")]
    pub processing_time_ms: u64,
}

impl AgentResponse {
    pub fn success(request_id: RequestId, data: Value, processing_time_ms: u64) -> Self {
        Self {
            request_id,
            status: ResponseStatus::Success,
            data,
            error: None,
            processing_time_ms,
        }
    }

    pub fn error(
        request_id: RequestId,
        code: impl Into<String>,
        message: impl Into<String>,
        recoverable: bool,
    ) -> Self {
        Self {
            request_id,
            status: ResponseStatus::Error,
            data: Value::Null,
            error: Some(ResponseError {
                code: code.into(),
                message: message.into(),
                recoverable,
            }),
            processing_time_ms: 0,
        }
    }

    /// Represents a failed exchange as a response entry so fan-out results
    /// always carry one outcome per agent.
    pub fn from_failure(request_id: RequestId, error: &OrchestratorError, elapsed_ms: u64) -> Self {
        let mut response = Self::error(
            request_id,
            error.code(),
            error.to_string(),
            error.is_retryable(),
        );
        response.processing_time_ms = elapsed_ms;
        response
    }

    pub fn is_success(&self) -> bool {
        self.status == ResponseStatus::Success
    }
}
