use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use super::{AgentId, Capability, Priority};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnalysisType {
    Malware,
    Network,
    Vulnerability,
    Incident,
}

impl AnalysisType {
    pub fn as_str(&self) -> &str {
        match self {
            AnalysisType::Malware => "malware",
            AnalysisType::Network => "network",
            AnalysisType::Vulnerability => "vulnerability",
            AnalysisType::Incident => "incident",
        }
    }

    /// Capabilities an agent must advertise (any one of them) to take part
    /// in this workflow.
    pub fn required_capabilities(&self) -> Vec<Capability> {
        let names: &[&str] = match self {
            AnalysisType::Malware => &["malware-analysis", "reverse-engineering", "deobfuscation"],
            AnalysisType::Network => &["network-analysis", "threat-intelligence", "pattern-matching"],
            AnalysisType::Vulnerability => {
                &["vulnerability-scanning", "static-analysis", "pattern-matching"]
            }
            AnalysisType::Incident => &["incident-response", "threat-intelligence", "forensics"],
        };
        names.iter().map(|name| Capability::from(*name)).collect()
    }
}

impl fmt::Display for AnalysisType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisOptions {
    /// Explicit target list; skips capability lookup when present.
    #[serde(default)]
    pub agents: Option<Vec<AgentId>>,
    #[serde(default)]
    pub priority: Option<Priority>,
    #[serde(default, rename = "timeout")]
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisRequest {
    #[serde(rename = "type")]
    pub analysis_type: AnalysisType,
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub options: AnalysisOptions,
}

impl AnalysisRequest {
    pub fn new(analysis_type: AnalysisType, payload: Value) -> Self {
        Self {
            analysis_type,
            payload,
            options: AnalysisOptions::default(),
        }
    }

    pub fn with_agents(mut self, agents: Vec<AgentId>) -> Self {
        self.options.agents = Some(agents);
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.options.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.options.priority = Some(priority);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailedAgent {
    pub agent_id: AgentId,
    pub code: String,
    pub message: String,
}

/// Consensus view over one workflow invocation. Built fresh each time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisSummary {
    pub analysis_type: AnalysisType,
    pub agents_involved: usize,
    pub total_agents: usize,
    pub overall_risk_score: f64,
    pub threats_detected: usize,
    pub threats: Vec<Value>,
    pub recommendations: Vec<String>,
    #[serde(rename = "processingTime")]
    pub processing_time_ms: u64,
    pub failures: Vec<FailedAgent>,
}

impl AnalysisSummary {
    pub fn empty(analysis_type: AnalysisType) -> Self {
        Self {
            analysis_type,
            agents_involved: 0,
            total_agents: 0,
            overall_risk_score: 0.0,
            threats_detected: 0,
            threats: Vec::new(),
            recommendations: Vec::new(),
            processing_time_ms: 0,
            failures: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_malware_capabilities() {
        let caps = AnalysisType::Malware.required_capabilities();
        assert_eq!(caps.len(), 3);
        assert_eq!(caps[0], Capability::from("malware-analysis"));
    }

    #[test]
    fn test_request_parses_external_shape() {
        let raw = json!({
            "type": "network",
            "payload": {"pcap": "capture.pcap"},
            "options": {"agents": ["net-1"], "priority": "critical", "timeout": 5000}
        });
        let request: AnalysisRequest = serde_json::from_value(raw).unwrap();

        assert_eq!(request.analysis_type, AnalysisType::Network);
        assert_eq!(request.options.agents, Some(vec![AgentId::from("net-1")]));
        assert_eq!(request.options.priority, Some(Priority::Critical));
        assert_eq!(request.options.timeout_ms, Some(5000));
    }

    #[test]
    fn test_options_are_optional() {
        let request: AnalysisRequest =
            serde_json::from_value(json!({"type": "incident"})).unwrap();
        assert!(request.options.agents.is_none());
        assert_eq!(request.payload, Value::Null);
    }
}
