use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Per-agent request accounting kept by the connector. Every attempt counts,
/// so retried calls show up in `attempts` and `retries` as well.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectorAgentMetrics {
    pub attempts: u64,
    pub successes: u64,
    pub failures: u64,
    pub timeouts: u64,
    pub retries: u64,
    pub avg_latency_ms: f64,
}

impl ConnectorAgentMetrics {
    pub(crate) fn record_success(&mut self, latency_ms: f64) {
        self.successes += 1;
        let n = self.successes as f64;
        self.avg_latency_ms += (latency_ms - self.avg_latency_ms) / n;
    }

    pub(crate) fn record_failure(&mut self) {
        self.failures += 1;
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectorMetrics {
    pub total_requests: u64,
    pub successful: u64,
    pub failed: u64,
    pub timeouts: u64,
    pub retries: u64,
    pub agents: BTreeMap<String, ConnectorAgentMetrics>,
}

impl ConnectorMetrics {
    pub(crate) fn from_agents(agents: BTreeMap<String, ConnectorAgentMetrics>) -> Self {
        let mut metrics = Self::default();
        for agent in agents.values() {
            metrics.total_requests += agent.successes + agent.failures;
            metrics.successful += agent.successes;
            metrics.failed += agent.failures;
            metrics.timeouts += agent.timeouts;
            metrics.retries += agent.retries;
        }
        metrics.agents = agents;
        metrics
    }

    pub fn success_rate(&self) -> f64 {
        if self.total_requests == 0 {
            return 0.0;
        }
        self.successful as f64 / self.total_requests as f64
    }
}
