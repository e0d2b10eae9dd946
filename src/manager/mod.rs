//! The orchestrator facade. One [`AgentManager`] owns an isolated bus,
//! registry and connector; nothing is process-global, so tests can run many
//! managers side by side.

pub mod aggregation;

pub use aggregation::aggregate;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;

use crate::bus::{BusMetrics, HistoryFilter, MessageBus, SubscriptionId};
use crate::config::{Config, ConnectorConfig};
use crate::connector::{AgentConnector, ConnectorMetrics};
use crate::error::{OrchestratorError, Result};
use crate::events::{EventStream, OrchestratorEvent};
use crate::registry::{AgentRegistry, RegistryMetrics};
use crate::transport::{self, AgentEndpoint, HttpEndpoint};
use crate::types::{
    AgentId, AgentMessage, AgentRegistration, AgentRequest, AgentResponse, AgentRuntimeState,
    AnalysisRequest, AnalysisSummary, AnalysisType,
};

/// Request kind sent to agents taking part in an analysis workflow.
pub const ANALYSIS_REQUEST: &str = "analysis";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl RegisterResponse {
    fn accepted(token: String) -> Self {
        Self {
            success: true,
            token: Some(token),
            error: None,
            code: None,
        }
    }

    fn rejected(error: &OrchestratorError) -> Self {
        Self {
            success: false,
            token: None,
            error: Some(error.to_string()),
            code: Some(error.code().to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatAck {
    pub acknowledged: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowMetrics {
    pub started: u64,
    pub completed: u64,
    /// Completed workflows in which no target answered successfully.
    pub without_responders: u64,
    pub in_flight: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManagerMetrics {
    pub initialized: bool,
    pub shutting_down: bool,
    pub registry: RegistryMetrics,
    pub connector: ConnectorMetrics,
    pub bus: BusMetrics,
    pub workflows: WorkflowMetrics,
}

#[derive(Default)]
struct WorkflowCounters {
    started: AtomicU64,
    completed: AtomicU64,
    without_responders: AtomicU64,
}

pub struct AgentManager {
    config: Config,
    events: EventStream,
    bus: Arc<MessageBus>,
    registry: Arc<AgentRegistry>,
    connector: Arc<AgentConnector>,
    endpoints: Mutex<HashMap<AgentId, SubscriptionId>>,
    http: reqwest::Client,
    initialized: AtomicBool,
    shutting_down: AtomicBool,
    in_flight: AtomicUsize,
    idle: Notify,
    workflows: WorkflowCounters,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

/// Counts an operation as in flight until dropped.
struct InFlight<'a>(&'a AgentManager);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if self.0.in_flight.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.0.idle.notify_waiters();
        }
    }
}

/// Client shared by every remote agent endpoint. Calls that outlive the
/// connector's request timeout are abandoned.
fn http_client(config: &ConnectorConfig) -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(config.request_timeout())
        .build()
        .unwrap_or_else(|e| {
            log::warn!("Falling back to a default HTTP client: {}", e);
            reqwest::Client::new()
        })
}

impl AgentManager {
    pub fn new(config: Config) -> Self {
        let http = http_client(&config.connector);
        let events = EventStream::new(config.bus.event_capacity);
        let bus = Arc::new(MessageBus::new(&config.bus, events.clone()));
        let registry = Arc::new(AgentRegistry::new(
            Arc::clone(&bus),
            config.registry.clone(),
            events.clone(),
        ));
        let connector = Arc::new(AgentConnector::new(
            Arc::clone(&bus),
            Arc::clone(&registry),
            config.connector.clone(),
        ));

        Self {
            config,
            events,
            bus,
            registry,
            connector,
            endpoints: Mutex::new(HashMap::new()),
            http,
            initialized: AtomicBool::new(false),
            shutting_down: AtomicBool::new(false),
            in_flight: AtomicUsize::new(0),
            idle: Notify::new(),
            workflows: WorkflowCounters::default(),
            watcher: Mutex::new(None),
        }
    }

    /// Starts liveness monitoring and endpoint cleanup. Safe to call twice.
    pub fn initialize(self: &Arc<Self>) -> Result<()> {
        if self.shutting_down.load(Ordering::Acquire) {
            return Err(OrchestratorError::ShutdownInProgress);
        }
        if self.initialized.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        self.registry.start_monitoring();
        let receiver = self.events.subscribe();
        *self.watcher.lock() = Some(tokio::spawn(watch_departures(
            Arc::downgrade(self),
            receiver,
        )));

        log::info!(
            "Agent manager initialized (heartbeat timeout {:?}, request timeout {:?})",
            self.config.registry.heartbeat_timeout(),
            self.config.connector.request_timeout()
        );
        Ok(())
    }

    /// Stops accepting work, waits up to the grace period for in-flight
    /// operations, then tears down connector, registry and bus in that
    /// order. Whatever is still pending afterwards fails with
    /// `ShutdownInProgress`.
    pub async fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::AcqRel) {
            return;
        }
        log::info!("Agent manager shutting down");

        let grace = self.config.manager.shutdown_grace();
        if tokio::time::timeout(grace, self.drained()).await.is_err() {
            log::warn!(
                "Shutdown grace of {:?} elapsed with {} operation(s) in flight",
                grace,
                self.in_flight.load(Ordering::Acquire)
            );
        }

        if let Some(watcher) = self.watcher.lock().take() {
            watcher.abort();
        }
        self.connector.shutdown();
        self.registry.shutdown();
        self.endpoints.lock().clear();
        self.bus.shutdown();
        log::info!("Agent manager shut down");
    }

    async fn drained(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.in_flight.load(Ordering::Acquire) == 0 {
                return;
            }
            notified.await;
        }
    }

    fn begin(&self) -> Result<InFlight<'_>> {
        if !self.initialized.load(Ordering::Acquire) {
            return Err(OrchestratorError::NotInitialized);
        }
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        let guard = InFlight(self);
        if self.shutting_down.load(Ordering::Acquire) {
            return Err(OrchestratorError::ShutdownInProgress);
        }
        Ok(guard)
    }

    pub fn register_agent(&self, registration: AgentRegistration) -> RegisterResponse {
        let outcome = self
            .begin()
            .and_then(|_guard| self.registry.register(registration));
        match outcome {
            Ok(token) => RegisterResponse::accepted(token),
            Err(e) => RegisterResponse::rejected(&e),
        }
    }

    /// Registers an agent reached over HTTP at its advertised endpoint.
    pub fn register_remote_agent(&self, registration: AgentRegistration) -> RegisterResponse {
        let agent_id = registration.agent_id.clone();
        let endpoint = HttpEndpoint::with_client(registration.endpoint.clone(), self.http.clone());
        let response = self.register_agent(registration);
        if !response.success {
            return response;
        }

        match self.attach_endpoint(&agent_id, Arc::new(endpoint)) {
            Ok(_) => response,
            Err(e) => {
                log::error!("Could not attach endpoint for {}: {}", agent_id, e);
                let _ = self.registry.unregister(&agent_id);
                RegisterResponse::rejected(&e)
            }
        }
    }

    /// Routes requests for a registered agent to `endpoint`, replacing any
    /// endpoint attached before.
    pub fn attach_endpoint(
        &self,
        agent_id: &AgentId,
        endpoint: Arc<dyn AgentEndpoint>,
    ) -> Result<SubscriptionId> {
        let _guard = self.begin()?;
        if !self.registry.contains(agent_id) {
            return Err(OrchestratorError::AgentNotFound(agent_id.clone()));
        }

        let subscription = transport::attach_endpoint(&self.bus, agent_id.clone(), endpoint)?;
        if let Some(previous) = self.endpoints.lock().insert(agent_id.clone(), subscription) {
            self.bus.unsubscribe(previous);
        }
        log::debug!("Endpoint attached for {}", agent_id);
        Ok(subscription)
    }

    pub fn unregister_agent(&self, agent_id: &AgentId) -> Result<()> {
        let _guard = self.begin()?;
        self.registry.unregister(agent_id)?;
        self.detach_endpoint(agent_id);
        Ok(())
    }

    pub fn heartbeat(&self, agent_id: &AgentId, token: &str) -> Result<HeartbeatAck> {
        let _guard = self.begin()?;
        self.registry.heartbeat(agent_id, token)?;
        Ok(HeartbeatAck { acknowledged: true })
    }

    pub async fn send_request(
        &self,
        agent_id: &AgentId,
        request: AgentRequest,
    ) -> Result<AgentResponse> {
        let _guard = self.begin()?;
        self.connector.send_request(agent_id, request).await
    }

    /// Runs one analysis workflow: picks the agents able to handle
    /// `request.analysis_type` (or the explicit list in the options), sends
    /// them all the same request and merges whatever comes back.
    pub async fn execute_analysis(&self, request: AnalysisRequest) -> Result<AnalysisSummary> {
        let _guard = self.begin()?;
        self.workflows.started.fetch_add(1, Ordering::Relaxed);

        let analysis_type = request.analysis_type;
        let targets = match &request.options.agents {
            Some(agents) => dedup(agents.iter().cloned()),
            None => self.select_targets(analysis_type),
        };

        let mut agent_request = AgentRequest::new(ANALYSIS_REQUEST, request.payload)
            .with_metadata("analysisType", json!(analysis_type.as_str()));
        if let Some(priority) = request.options.priority {
            agent_request = agent_request.with_priority(priority);
        }
        if let Some(timeout_ms) = request.options.timeout_ms {
            agent_request = agent_request.with_timeout_ms(timeout_ms);
        }

        log::info!(
            "Starting {} analysis {} across {} agent(s)",
            analysis_type,
            agent_request.id,
            targets.len()
        );
        let responses = self
            .connector
            .broadcast_to_agents(&targets, agent_request)
            .await;
        let summary = aggregate(
            analysis_type,
            &targets,
            &responses,
            self.config.manager.max_threats,
        );

        self.workflows.completed.fetch_add(1, Ordering::Relaxed);
        if summary.agents_involved == 0 {
            self.workflows
                .without_responders
                .fetch_add(1, Ordering::Relaxed);
            log::warn!("{} analysis finished with no responding agents", analysis_type);
        } else {
            log::info!(
                "{} analysis finished: {}/{} agents, risk {}, {} threat(s)",
                analysis_type,
                summary.agents_involved,
                summary.total_agents,
                summary.overall_risk_score,
                summary.threats_detected
            );
        }
        Ok(summary)
    }

    /// Healthy agents holding any required capability, in capability order
    /// then registration order, each listed once.
    fn select_targets(&self, analysis_type: AnalysisType) -> Vec<AgentId> {
        dedup(
            analysis_type
                .required_capabilities()
                .iter()
                .flat_map(|capability| self.registry.agents_by_capability(capability))
                .map(|registration| registration.agent_id),
        )
    }

    pub async fn health_check_all(&self) -> Result<HashMap<AgentId, bool>> {
        let _guard = self.begin()?;
        Ok(self.connector.health_check_all().await)
    }

    pub fn agent_status(&self) -> Vec<AgentRuntimeState> {
        self.registry.all_agents()
    }

    pub fn agent(&self, agent_id: &AgentId) -> Option<AgentRuntimeState> {
        self.registry.agent(agent_id)
    }

    pub fn message_history(&self, filter: &HistoryFilter) -> Vec<AgentMessage> {
        self.bus.message_history(filter)
    }

    pub fn metrics(&self) -> ManagerMetrics {
        ManagerMetrics {
            initialized: self.is_initialized(),
            shutting_down: self.shutting_down.load(Ordering::Acquire),
            registry: self.registry.metrics(),
            connector: self.connector.metrics(),
            bus: self.bus.metrics(),
            workflows: WorkflowMetrics {
                started: self.workflows.started.load(Ordering::Relaxed),
                completed: self.workflows.completed.load(Ordering::Relaxed),
                without_responders: self.workflows.without_responders.load(Ordering::Relaxed),
                in_flight: self.in_flight.load(Ordering::Acquire),
            },
        }
    }

    pub fn events(&self) -> broadcast::Receiver<OrchestratorEvent> {
        self.events.subscribe()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn bus(&self) -> &Arc<MessageBus> {
        &self.bus
    }

    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    fn detach_endpoint(&self, agent_id: &AgentId) {
        if let Some(subscription) = self.endpoints.lock().remove(agent_id) {
            self.bus.unsubscribe(subscription);
            log::debug!("Endpoint detached for {}", agent_id);
        }
    }
}

/// Drops the endpoint of every agent that leaves the registry, including
/// agents evicted by the liveness sweep.
async fn watch_departures(
    manager: Weak<AgentManager>,
    mut receiver: broadcast::Receiver<OrchestratorEvent>,
) {
    loop {
        match receiver.recv().await {
            Ok(OrchestratorEvent::AgentUnregistered { agent_id }) => {
                let Some(manager) = manager.upgrade() else {
                    break;
                };
                // A quick re-registration may already own a fresh endpoint.
                if !manager.registry.contains(&agent_id) {
                    manager.detach_endpoint(&agent_id);
                }
            }
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                log::warn!("Endpoint watcher skipped {} event(s)", skipped);
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

fn dedup(ids: impl IntoIterator<Item = AgentId>) -> Vec<AgentId> {
    let mut seen = HashSet::new();
    ids.into_iter().filter(|id| seen.insert(id.clone())).collect()
}
