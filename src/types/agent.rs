use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{AgentId, AgentState, Capability, BROADCAST_ADDRESS, HOST_ADDRESS};
use crate::error::{OrchestratorError, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentRegistration {
    pub agent_id: AgentId,
    pub name: String,
    pub version: String,
    pub endpoint: String,
    pub capabilities: Vec<Capability>,
    /// Stamped by the registry on acceptance; any caller-supplied value is
    /// overwritten.
    #[serde(default = "Utc::now")]
    pub registered_at: DateTime<Utc>,
}

impl AgentRegistration {
    pub fn new(
        agent_id: impl Into<AgentId>,
        name: impl Into<String>,
        version: impl Into<String>,
        endpoint: impl Into<String>,
        capabilities: Vec<Capability>,
    ) -> Self {
        Self {
            agent_id: agent_id.into(),
            name: name.into(),
            version: version.into(),
            endpoint: endpoint.into(),
            capabilities,
            registered_at: Utc::now(),
        }
    }

    pub fn has_capability(&self, capability: &Capability) -> bool {
        self.capabilities.contains(capability)
    }

    pub fn validate(&self) -> Result<()> {
        let id = self.agent_id.as_str();
        if id.trim().is_empty() {
            return Err(OrchestratorError::InvalidRegistration(
                "agent id must not be empty".to_string(),
            ));
        }
        if id == HOST_ADDRESS || id == BROADCAST_ADDRESS {
            return Err(OrchestratorError::InvalidRegistration(format!(
                "agent id '{}' is reserved",
                id
            )));
        }
        if self.name.trim().is_empty() {
            return Err(OrchestratorError::InvalidRegistration(
                "agent name must not be empty".to_string(),
            ));
        }
        if self.capabilities.is_empty() {
            return Err(OrchestratorError::InvalidRegistration(
                "at least one capability is required".to_string(),
            ));
        }
        Ok(())
    }

    /// Capabilities with duplicates removed, first occurrence wins.
    pub(crate) fn dedup_capabilities(&mut self) {
        let mut seen = Vec::with_capacity(self.capabilities.len());
        self.capabilities.retain(|capability| {
            if seen.contains(capability) {
                false
            } else {
                seen.push(capability.clone());
                true
            }
        });
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentRuntimeMetrics {
    pub requests_served: u64,
    pub avg_latency_ms: f64,
    pub error_count: u64,
}

impl AgentRuntimeMetrics {
    pub fn record(&mut self, latency_ms: f64, success: bool) {
        if success {
            let served = self.requests_served as f64;
            self.avg_latency_ms = (self.avg_latency_ms * served + latency_ms) / (served + 1.0);
            self.requests_served += 1;
        } else {
            self.error_count += 1;
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentRuntimeState {
    pub registration: AgentRegistration,
    pub state: AgentState,
    pub last_heartbeat: DateTime<Utc>,
    pub missed_heartbeats: u32,
    pub metrics: AgentRuntimeMetrics,
}

impl AgentRuntimeState {
    pub fn new(registration: AgentRegistration) -> Self {
        Self {
            last_heartbeat: registration.registered_at,
            registration,
            state: AgentState::Registering,
            missed_heartbeats: 0,
            metrics: AgentRuntimeMetrics::default(),
        }
    }

    pub fn agent_id(&self) -> &AgentId {
        &self.registration.agent_id
    }

    pub fn is_healthy(&self) -> bool {
        self.state == AgentState::Healthy
    }
}
