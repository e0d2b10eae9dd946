use serde_json::Value;
use std::collections::{HashMap, HashSet};

use crate::types::{AgentId, AgentResponse, AnalysisSummary, AnalysisType, FailedAgent};

/// Folds per-agent responses into one summary. `targets` fixes the order in
/// which threats and recommendations are merged.
pub fn aggregate(
    analysis_type: AnalysisType,
    targets: &[AgentId],
    responses: &HashMap<AgentId, AgentResponse>,
    max_threats: usize,
) -> AnalysisSummary {
    let mut summary = AnalysisSummary::empty(analysis_type);
    summary.total_agents = targets.len();

    let mut seen_threats = HashSet::new();
    let mut seen_recommendations = HashSet::new();

    for agent_id in targets {
        let Some(response) = responses.get(agent_id) else {
            summary.failures.push(FailedAgent {
                agent_id: agent_id.clone(),
                code: "no-response".to_string(),
                message: "no outcome was recorded for this agent".to_string(),
            });
            continue;
        };

        if !response.is_success() {
            let (code, message) = response
                .error
                .as_ref()
                .map(|e| (e.code.clone(), e.message.clone()))
                .unwrap_or_else(|| ("agent-error".to_string(), String::new()));
            summary.failures.push(FailedAgent {
                agent_id: agent_id.clone(),
                code,
                message,
            });
            continue;
        }

        summary.agents_involved += 1;
        summary.processing_time_ms = summary.processing_time_ms.max(response.processing_time_ms);

        if let Some(score) = response.data.get("riskScore").and_then(Value::as_f64) {
            if score.is_finite() && score > summary.overall_risk_score {
                summary.overall_risk_score = score;
            }
        }

        if let Some(threats) = response.data.get("threats").and_then(Value::as_array) {
            for threat in threats {
                // serde_json::Value is not Hash; its canonical text is.
                if seen_threats.insert(threat.to_string()) {
                    summary.threats.push(threat.clone());
                }
            }
        }

        if let Some(recommendations) = response.data.get("recommendations").and_then(Value::as_array) {
            for recommendation in recommendations.iter().filter_map(Value::as_str) {
                if seen_recommendations.insert(recommendation.to_string()) {
                    summary.recommendations.push(recommendation.to_string());
                }
            }
        }
    }

    summary.threats_detected = summary.threats.len();
    summary.threats.truncate(max_threats);
    summary
}
