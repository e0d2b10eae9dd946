use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse,
    },
    Json,
};
use chrono::{DateTime, Utc};
use futures::stream::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::convert::Infallible;
use std::sync::Arc;
use tokio_stream::wrappers::BroadcastStream;

use crate::api::error::ApiError;
use crate::bus::HistoryFilter;
use crate::error::OrchestratorError;
use crate::manager::{AgentManager, HeartbeatAck, ManagerMetrics};
use crate::types::{
    Address, AgentId, AgentMessage, AgentRegistration, AgentRuntimeState, AnalysisRequest,
    AnalysisSummary, MessageType,
};

pub type SharedManager = Arc<AgentManager>;

/// Upper bound on `GET /messages` results when no limit is given.
const DEFAULT_MESSAGE_LIMIT: usize = 100;

#[derive(Deserialize)]
pub struct HeartbeatRequest {
    pub token: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct MessageQuery {
    pub from: Option<String>,
    pub to: Option<String>,
    #[serde(rename = "type")]
    pub message_type: Option<MessageType>,
    pub since: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

impl From<MessageQuery> for HistoryFilter {
    fn from(query: MessageQuery) -> Self {
        let mut filter = HistoryFilter::default();
        if let Some(from) = query.from {
            filter = filter.sent_by(Address::parse(&from));
        }
        if let Some(to) = query.to {
            filter = filter.sent_to(Address::parse(&to));
        }
        if let Some(message_type) = query.message_type {
            filter = filter.of_type(message_type);
        }
        if let Some(since) = query.since {
            filter = filter.since(since);
        }
        filter.limit = Some(query.limit.unwrap_or(DEFAULT_MESSAGE_LIMIT));
        filter
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentStatusResponse {
    pub total: usize,
    pub healthy: usize,
    pub agents: Vec<AgentRuntimeState>,
}

pub async fn health_check(State(manager): State<SharedManager>) -> Json<serde_json::Value> {
    let metrics = manager.metrics();
    let status = if metrics.shutting_down {
        "shutting-down"
    } else if metrics.initialized {
        "healthy"
    } else {
        "starting"
    };
    Json(serde_json::json!({
        "status": status,
        "version": env!("CARGO_PKG_VERSION"),
        "timestamp": Utc::now().to_rfc3339(),
        "agents": metrics.registry.total_agents,
    }))
}

pub async fn get_config(State(manager): State<SharedManager>) -> Json<crate::config::Config> {
    Json(manager.config().clone())
}

/// Registers an agent reachable at its advertised HTTP endpoint.
pub async fn register_agent(
    State(manager): State<SharedManager>,
    payload: Result<Json<AgentRegistration>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(registration) = payload?;
    let response = manager.register_remote_agent(registration);
    let status = match response.code.as_deref() {
        None => StatusCode::CREATED,
        Some("registration-conflict") => StatusCode::CONFLICT,
        Some("invalid-registration") => StatusCode::BAD_REQUEST,
        Some(_) => StatusCode::SERVICE_UNAVAILABLE,
    };
    Ok((status, Json(response)))
}

pub async fn unregister_agent(
    State(manager): State<SharedManager>,
    Path(agent_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    manager.unregister_agent(&AgentId::from(agent_id))?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn heartbeat(
    State(manager): State<SharedManager>,
    Path(agent_id): Path<String>,
    payload: Result<Json<HeartbeatRequest>, JsonRejection>,
) -> Result<Json<HeartbeatAck>, ApiError> {
    let Json(request) = payload?;
    let ack = manager.heartbeat(&AgentId::from(agent_id), &request.token)?;
    Ok(Json(ack))
}

pub async fn list_agents(State(manager): State<SharedManager>) -> Json<AgentStatusResponse> {
    let agents = manager.agent_status();
    Json(AgentStatusResponse {
        total: agents.len(),
        healthy: agents.iter().filter(|agent| agent.is_healthy()).count(),
        agents,
    })
}

pub async fn get_agent(
    State(manager): State<SharedManager>,
    Path(agent_id): Path<String>,
) -> Result<Json<AgentRuntimeState>, ApiError> {
    let agent_id = AgentId::from(agent_id);
    manager
        .agent(&agent_id)
        .map(Json)
        .ok_or_else(|| OrchestratorError::AgentNotFound(agent_id).into())
}

pub async fn agents_health(
    State(manager): State<SharedManager>,
) -> Result<Json<BTreeMap<String, bool>>, ApiError> {
    let health = manager.health_check_all().await?;
    Ok(Json(
        health
            .into_iter()
            .map(|(agent_id, healthy)| (agent_id.to_string(), healthy))
            .collect(),
    ))
}

pub async fn execute_analysis(
    State(manager): State<SharedManager>,
    payload: Result<Json<AnalysisRequest>, JsonRejection>,
) -> Result<Json<AnalysisSummary>, ApiError> {
    let Json(request) = payload?;
    let summary = manager.execute_analysis(request).await?;
    Ok(Json(summary))
}

pub async fn get_metrics(State(manager): State<SharedManager>) -> Json<ManagerMetrics> {
    Json(manager.metrics())
}

pub async fn list_messages(
    State(manager): State<SharedManager>,
    Query(query): Query<MessageQuery>,
) -> Json<Vec<AgentMessage>> {
    Json(manager.message_history(&HistoryFilter::from(query)))
}

/// Server-sent events mirroring the orchestrator event stream. Observers
/// that fall behind skip the events they missed.
pub async fn stream_events(
    State(manager): State<SharedManager>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let stream = BroadcastStream::new(manager.events()).filter_map(|event| async move {
        let event = event.ok()?;
        Event::default()
            .event(event.name())
            .json_data(&event)
            .ok()
            .map(Ok)
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}
