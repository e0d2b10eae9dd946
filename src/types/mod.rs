pub mod agent;
pub mod analysis;
pub mod message;
pub mod request;

pub use agent::{AgentRegistration, AgentRuntimeMetrics, AgentRuntimeState};
pub use analysis::{AnalysisOptions, AnalysisRequest, AnalysisSummary, AnalysisType, FailedAgent};
pub use message::{AgentMessage, MessageType};
pub use request::{AgentRequest, AgentResponse, ResponseError, ResponseStatus};

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

pub type MessageId = uuid::Uuid;
pub type RequestId = uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentId(String);

impl AgentId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AgentId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for AgentId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// A named operation class an agent can perform, e.g. `malware-analysis`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Capability(String);

impl Capability {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Capability {
    fn from(name: &str) -> Self {
        Self(name.to_string())
    }
}

impl From<String> for Capability {
    fn from(name: String) -> Self {
        Self(name)
    }
}

pub const HOST_ADDRESS: &str = "host";
pub const BROADCAST_ADDRESS: &str = "broadcast";

/// Sender or recipient of a bus message. On the wire this is a plain string:
/// `"host"`, `"broadcast"`, or an agent id.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Address {
    Host,
    Agent(AgentId),
    Broadcast,
}

impl Address {
    pub fn agent(id: impl Into<AgentId>) -> Self {
        Address::Agent(id.into())
    }

    pub fn as_str(&self) -> &str {
        match self {
            Address::Host => HOST_ADDRESS,
            Address::Agent(id) => id.as_str(),
            Address::Broadcast => BROADCAST_ADDRESS,
        }
    }

    pub fn parse(raw: &str) -> Self {
        match raw {
            HOST_ADDRESS => Address::Host,
            BROADCAST_ADDRESS => Address::Broadcast,
            other => Address::Agent(AgentId::from(other)),
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for Address {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(Address::parse(&raw))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentState {
    Registering, // Accepted, not yet confirmed live
    Healthy,     // Heartbeats on time, eligible for routing
    Degraded,    // Missed a heartbeat, excluded from capability lookups
    Unreachable, // Evicted from the registry
}

impl AgentState {
    pub fn as_str(&self) -> &str {
        match self {
            AgentState::Registering => "registering",
            AgentState::Healthy => "healthy",
            AgentState::Degraded => "degraded",
            AgentState::Unreachable => "unreachable",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}
