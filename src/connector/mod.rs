//! Request/response exchanges with agents over the bus: deadlines, bounded
//! retries and capability fan-out.

pub mod metrics;

pub use metrics::{ConnectorAgentMetrics, ConnectorMetrics};

use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::bus::MessageBus;
use crate::config::ConnectorConfig;
use crate::error::{OrchestratorError, Result};
use crate::registry::AgentRegistry;
use crate::transport::transport_error;
use crate::types::{Address, AgentId, AgentMessage, AgentRequest, AgentResponse, Capability};

pub struct AgentConnector {
    bus: Arc<MessageBus>,
    registry: Arc<AgentRegistry>,
    config: ConnectorConfig,
    metrics: Mutex<HashMap<AgentId, ConnectorAgentMetrics>>,
    closed: AtomicBool,
}

impl AgentConnector {
    pub fn new(bus: Arc<MessageBus>, registry: Arc<AgentRegistry>, config: ConnectorConfig) -> Self {
        Self {
            bus,
            registry,
            config,
            metrics: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &ConnectorConfig {
        &self.config
    }

    /// Sends `request` to one healthy agent and waits for its response.
    ///
    /// Timeouts and transport failures are retried up to `retry_attempts`
    /// times with backoff. Error responses from the agent are returned as
    /// they are; the agent did answer.
    pub async fn send_request(
        &self,
        agent_id: &AgentId,
        request: AgentRequest,
    ) -> Result<AgentResponse> {
        self.ensure_open()?;
        let agent = self
            .registry
            .agent(agent_id)
            .ok_or_else(|| OrchestratorError::AgentNotFound(agent_id.clone()))?;
        if !agent.is_healthy() {
            return Err(OrchestratorError::AgentUnhealthy(agent_id.clone()));
        }

        // The endpoint bounds its call with the same deadline.
        let request = match request.timeout_ms {
            Some(_) => request,
            None => request.with_timeout_ms(self.config.request_timeout_ms),
        };
        let timeout = request
            .timeout_ms
            .map(Duration::from_millis)
            .unwrap_or_else(|| self.config.request_timeout());
        let payload = serde_json::to_value(&request)
            .map_err(|e| OrchestratorError::TransportFailure(e.to_string()))?;

        let started = Instant::now();
        let mut attempt: u32 = 0;
        loop {
            self.record(agent_id, |m| m.attempts += 1);
            let outcome = self.exchange(agent_id, payload.clone(), timeout).await;
            if matches!(outcome, Err(OrchestratorError::RequestTimeout { .. })) {
                self.record(agent_id, |m| m.timeouts += 1);
            }
            let latency_ms = started.elapsed().as_secs_f64() * 1000.0;

            match outcome {
                Ok(response) => {
                    let success = response.is_success();
                    self.record(agent_id, |m| {
                        if success {
                            m.record_success(latency_ms)
                        } else {
                            m.record_failure()
                        }
                    });
                    self.registry.record_outcome(agent_id, latency_ms, success);
                    return Ok(response);
                }
                Err(e) if e.is_retryable() && attempt < self.config.retry_attempts && !self.is_closed() => {
                    attempt += 1;
                    let delay = self.config.retry_delay(attempt);
                    log::warn!(
                        "Request {} to {} failed ({}), retry {}/{} in {:?}",
                        request.id,
                        agent_id,
                        e.code(),
                        attempt,
                        self.config.retry_attempts,
                        delay
                    );
                    self.record(agent_id, |m| m.retries += 1);
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    log::debug!("Request {} to {} failed: {}", request.id, agent_id, e);
                    self.record(agent_id, |m| m.record_failure());
                    self.registry.record_outcome(agent_id, latency_ms, false);
                    return Err(e);
                }
            }
        }
    }

    /// One attempt: a fresh message and correlation id every time. Metrics
    /// are left to the caller.
    async fn exchange(
        &self,
        agent_id: &AgentId,
        payload: serde_json::Value,
        timeout: Duration,
    ) -> Result<AgentResponse> {
        let message = AgentMessage::request(Address::Host, Address::Agent(agent_id.clone()), payload);
        let reply = self.bus.request_response(message, timeout).await?;

        if let Some(e) = transport_error(&reply.payload) {
            return Err(e);
        }
        serde_json::from_value(reply.payload).map_err(|e| {
            OrchestratorError::TransportFailure(format!("undecodable response from {}: {}", agent_id, e))
        })
    }

    /// Sends `request` to every healthy agent with `capability` and returns
    /// one entry per agent, failures included.
    pub async fn broadcast_to_capability(
        &self,
        capability: &Capability,
        request: AgentRequest,
    ) -> HashMap<AgentId, AgentResponse> {
        let targets: Vec<AgentId> = self
            .registry
            .agents_by_capability(capability)
            .into_iter()
            .map(|registration| registration.agent_id)
            .collect();
        log::debug!(
            "Broadcasting {} to {} agent(s) with {}",
            request.request_type,
            targets.len(),
            capability
        );
        self.broadcast_to_agents(&targets, request).await
    }

    /// Concurrent fan-out. Waits for every target; a target that fails is
    /// reported through [`AgentResponse::from_failure`].
    pub async fn broadcast_to_agents(
        &self,
        agents: &[AgentId],
        request: AgentRequest,
    ) -> HashMap<AgentId, AgentResponse> {
        let mut seen = HashSet::new();
        let targets: Vec<AgentId> = agents
            .iter()
            .filter(|id| seen.insert(*id))
            .cloned()
            .collect();
        if targets.is_empty() {
            return HashMap::new();
        }
        let limit = self
            .config
            .max_concurrency
            .unwrap_or(targets.len())
            .max(1);

        stream::iter(targets)
            .map(|agent_id| {
                let request = request.clone();
                async move {
                    let request_id = request.id;
                    let started = Instant::now();
                    let response = match self.send_request(&agent_id, request).await {
                        Ok(response) => response,
                        Err(e) => AgentResponse::from_failure(
                            request_id,
                            &e,
                            u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
                        ),
                    };
                    (agent_id, response)
                }
            })
            .buffer_unordered(limit)
            .collect()
            .await
    }

    /// Probes every registered agent once with a `health-check` request.
    /// Degraded agents are probed too. Neither the registry nor the request
    /// metrics change.
    pub async fn health_check_all(&self) -> HashMap<AgentId, bool> {
        let agents: Vec<AgentId> = self
            .registry
            .all_agents()
            .into_iter()
            .map(|agent| agent.registration.agent_id)
            .collect();
        if agents.is_empty() || self.is_closed() {
            return agents.into_iter().map(|id| (id, false)).collect();
        }
        let limit = self.config.max_concurrency.unwrap_or(agents.len()).max(1);
        let timeout = self.config.health_check_timeout();

        stream::iter(agents)
            .map(|agent_id| async move {
                let probe = AgentRequest::health_check()
                    .with_timeout_ms(self.config.health_check_timeout_ms);
                let healthy = match serde_json::to_value(&probe) {
                    Ok(payload) => matches!(
                        self.exchange(&agent_id, payload, timeout).await,
                        Ok(response) if response.is_success()
                    ),
                    Err(_) => false,
                };
                if !healthy {
                    log::debug!("Health check failed for {}", agent_id);
                }
                (agent_id, healthy)
            })
            .buffer_unordered(limit)
            .collect()
            .await
    }

    pub fn agent_metrics(&self, agent_id: &AgentId) -> Option<ConnectorAgentMetrics> {
        self.metrics.lock().get(agent_id).cloned()
    }

    pub fn metrics(&self) -> ConnectorMetrics {
        let agents: BTreeMap<String, ConnectorAgentMetrics> = self
            .metrics
            .lock()
            .iter()
            .map(|(id, metrics)| (id.to_string(), metrics.clone()))
            .collect();
        ConnectorMetrics::from_agents(agents)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// New requests are refused and in-flight retries stop after their
    /// current attempt.
    pub fn shutdown(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            log::info!("Agent connector shut down");
        }
    }

    fn record(&self, agent_id: &AgentId, update: impl FnOnce(&mut ConnectorAgentMetrics)) {
        let mut metrics = self.metrics.lock();
        update(metrics.entry(agent_id.clone()).or_default());
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            Err(OrchestratorError::ShutdownInProgress)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BusConfig, RegistryConfig};
    use crate::events::EventStream;
    use crate::transport::{attach_endpoint, AgentEndpoint};
    use crate::types::AgentRegistration;
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::sync::atomic::AtomicUsize;

    struct FixedEndpoint(Value);

    #[async_trait]
    impl AgentEndpoint for FixedEndpoint {
        async fn process(&self, request: AgentRequest) -> anyhow::Result<AgentResponse> {
            Ok(AgentResponse::success(request.id, self.0.clone(), 5))
        }
    }

    struct SilentEndpoint;

    #[async_trait]
    impl AgentEndpoint for SilentEndpoint {
        async fn process(&self, _request: AgentRequest) -> anyhow::Result<AgentResponse> {
            std::future::pending().await
        }
    }

    /// Fails at the transport level for the first `failures` calls.
    struct FlakyEndpoint {
        failures: usize,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl AgentEndpoint for FlakyEndpoint {
        async fn process(&self, request: AgentRequest) -> anyhow::Result<AgentResponse> {
            if self.calls.fetch_add(1, Ordering::SeqCst) < self.failures {
                anyhow::bail!("connection reset");
            }
            Ok(AgentResponse::success(request.id, json!({"ok": true}), 1))
        }
    }

    /// Hangs on its first call and answers every later one at once.
    #[derive(Default)]
    struct StuckOnceEndpoint {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl AgentEndpoint for StuckOnceEndpoint {
        async fn process(&self, request: AgentRequest) -> anyhow::Result<AgentResponse> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                std::future::pending::<()>().await;
            }
            Ok(AgentResponse::success(request.id, json!({"ok": true}), 1))
        }
    }

    /// Answers with an error that reuses the transport's reserved code.
    struct SelfReportedTransportFailure(AtomicUsize);

    #[async_trait]
    impl AgentEndpoint for SelfReportedTransportFailure {
        async fn process(&self, request: AgentRequest) -> anyhow::Result<AgentResponse> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(AgentResponse::error(
                request.id,
                crate::transport::TRANSPORT_FAILURE_CODE,
                "upstream sandbox offline",
                true,
            ))
        }
    }

    struct RejectingEndpoint(AtomicUsize);

    #[async_trait]
    impl AgentEndpoint for RejectingEndpoint {
        async fn process(&self, request: AgentRequest) -> anyhow::Result<AgentResponse> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(AgentResponse::error(request.id, "bad-sample", "cannot parse", false))
        }
    }

    struct Harness {
        bus: Arc<MessageBus>,
        registry: Arc<AgentRegistry>,
        connector: AgentConnector,
    }

    impl Harness {
        fn new(config: ConnectorConfig) -> Self {
            let events = EventStream::default();
            let bus = Arc::new(MessageBus::new(&BusConfig::default(), events.clone()));
            let registry = Arc::new(AgentRegistry::new(
                Arc::clone(&bus),
                RegistryConfig::default(),
                events,
            ));
            let connector = AgentConnector::new(Arc::clone(&bus), Arc::clone(&registry), config);
            Self {
                bus,
                registry,
                connector,
            }
        }

        fn add(&self, id: &str, capability: &str, endpoint: Arc<dyn AgentEndpoint>) -> AgentId {
            let agent_id = AgentId::from(id);
            self.registry
                .register(AgentRegistration::new(
                    id,
                    id,
                    "1.0.0",
                    format!("http://{}.local", id),
                    vec![Capability::from(capability)],
                ))
                .unwrap();
            attach_endpoint(&self.bus, agent_id.clone(), endpoint).unwrap();
            agent_id
        }
    }

    fn fast_config() -> ConnectorConfig {
        ConnectorConfig {
            request_timeout_ms: 100,
            retry_attempts: 2,
            retry_delay_ms: 1,
            max_retry_delay_ms: 5,
            ..ConnectorConfig::default()
        }
    }

    #[tokio::test]
    async fn test_send_request_returns_agent_response() {
        let harness = Harness::new(fast_config());
        let id = harness.add("yara", "pattern-matching", Arc::new(FixedEndpoint(json!({"hits": 2}))));

        let response = harness
            .connector
            .send_request(&id, AgentRequest::new("analysis", json!({})))
            .await
            .unwrap();

        assert!(response.is_success());
        assert_eq!(response.data, json!({"hits": 2}));
        let served = harness.registry.agent(&id).unwrap().metrics;
        assert_eq!(served.requests_served, 1);
    }

    #[tokio::test]
    async fn test_unknown_and_unhealthy_agents_are_rejected() {
        let harness = Harness::new(fast_config());
        let id = harness.add("yara", "pattern-matching", Arc::new(FixedEndpoint(json!({}))));

        let err = harness
            .connector
            .send_request(&AgentId::from("ghost"), AgentRequest::new("analysis", json!({})))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "agent-not-found");

        let start = harness.registry.agent(&id).unwrap().last_heartbeat;
        harness
            .registry
            .check_liveness_at(start + chrono::Duration::seconds(31));
        let err = harness
            .connector
            .send_request(&id, AgentRequest::new("analysis", json!({})))
            .await
            .unwrap_err();
        assert_eq!(err, OrchestratorError::AgentUnhealthy(id));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_retried_then_reported_once() {
        let harness = Harness::new(fast_config());
        let id = harness.add("slow", "pattern-matching", Arc::new(SilentEndpoint));

        let err = harness
            .connector
            .send_request(&id, AgentRequest::new("analysis", json!({})))
            .await
            .unwrap_err();

        assert_eq!(err.code(), "request-timeout");
        let metrics = harness.connector.agent_metrics(&id).unwrap();
        assert_eq!(metrics.attempts, 3);
        assert_eq!(metrics.timeouts, 3);
        assert_eq!(metrics.retries, 2);
        assert_eq!(metrics.failures, 1);
        assert_eq!(harness.bus.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_transport_failure_recovers_on_retry() {
        let harness = Harness::new(fast_config());
        let id = harness.add(
            "flaky",
            "pattern-matching",
            Arc::new(FlakyEndpoint {
                failures: 2,
                calls: AtomicUsize::new(0),
            }),
        );

        let response = harness
            .connector
            .send_request(&id, AgentRequest::new("analysis", json!({})))
            .await
            .unwrap();

        assert!(response.is_success());
        let metrics = harness.connector.agent_metrics(&id).unwrap();
        assert_eq!(metrics.retries, 2);
        assert_eq!(metrics.successes, 1);
    }

    #[tokio::test]
    async fn test_error_response_is_not_retried() {
        let harness = Harness::new(fast_config());
        let endpoint = Arc::new(RejectingEndpoint(AtomicUsize::new(0)));
        let id = harness.add("strict", "pattern-matching", endpoint.clone());

        let response = harness
            .connector
            .send_request(&id, AgentRequest::new("analysis", json!({})))
            .await
            .unwrap();

        assert!(!response.is_success());
        assert_eq!(response.error.unwrap().code, "bad-sample");
        assert_eq!(endpoint.0.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_reaches_agent_after_hung_attempt() {
        let harness = Harness::new(fast_config());
        let endpoint = Arc::new(StuckOnceEndpoint::default());
        let id = harness.add("a", "pattern-matching", endpoint.clone());

        let response = harness
            .connector
            .send_request(&id, AgentRequest::new("analysis", json!({})))
            .await
            .unwrap();

        assert!(response.is_success());
        assert_eq!(endpoint.calls.load(Ordering::SeqCst), 2);
        let metrics = harness.connector.agent_metrics(&id).unwrap();
        assert_eq!(metrics.attempts, 2);
        assert_eq!(metrics.timeouts, 1);
        assert_eq!(metrics.retries, 1);
        assert_eq!(metrics.successes, 1);

        let health = harness.connector.health_check_all().await;
        assert!(health[&id]);
    }

    #[tokio::test]
    async fn test_agent_reported_transport_code_is_not_retried() {
        let harness = Harness::new(fast_config());
        let endpoint = Arc::new(SelfReportedTransportFailure(AtomicUsize::new(0)));
        let id = harness.add("proxy", "pattern-matching", endpoint.clone());

        let response = harness
            .connector
            .send_request(&id, AgentRequest::new("analysis", json!({})))
            .await
            .unwrap();

        assert!(!response.is_success());
        assert_eq!(endpoint.0.load(Ordering::SeqCst), 1);
        assert_eq!(harness.connector.agent_metrics(&id).unwrap().retries, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_broadcast_waits_for_every_agent() {
        let harness = Harness::new(ConnectorConfig {
            retry_attempts: 0,
            ..fast_config()
        });
        harness.add("a", "threat-intelligence", Arc::new(FixedEndpoint(json!({"n": 1}))));
        harness.add("b", "threat-intelligence", Arc::new(SilentEndpoint));
        harness.add("c", "threat-intelligence", Arc::new(FixedEndpoint(json!({"n": 3}))));
        harness.add("d", "forensics", Arc::new(FixedEndpoint(json!({}))));

        let results = harness
            .connector
            .broadcast_to_capability(
                &Capability::from("threat-intelligence"),
                AgentRequest::new("analysis", json!({})),
            )
            .await;

        assert_eq!(results.len(), 3);
        assert!(results[&AgentId::from("a")].is_success());
        assert!(results[&AgentId::from("c")].is_success());
        let failed = &results[&AgentId::from("b")];
        assert_eq!(failed.error.as_ref().unwrap().code, "request-timeout");
        assert!(failed.error.as_ref().unwrap().recoverable);
    }

    #[tokio::test]
    async fn test_bounded_broadcast_deduplicates_targets() {
        let harness = Harness::new(ConnectorConfig {
            max_concurrency: Some(1),
            ..fast_config()
        });
        let a = harness.add("a", "forensics", Arc::new(FixedEndpoint(json!({}))));
        let b = harness.add("b", "forensics", Arc::new(FixedEndpoint(json!({}))));

        let results = harness
            .connector
            .broadcast_to_agents(
                &[a.clone(), b.clone(), a.clone(), AgentId::from("ghost")],
                AgentRequest::new("analysis", json!({})),
            )
            .await;

        assert_eq!(results.len(), 3);
        assert_eq!(
            results[&AgentId::from("ghost")].error.as_ref().unwrap().code,
            "agent-not-found"
        );
        assert_eq!(harness.connector.agent_metrics(&a).unwrap().attempts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_health_check_probes_once_without_side_effects() {
        let harness = Harness::new(ConnectorConfig {
            health_check_timeout_ms: 50,
            ..fast_config()
        });
        let up = harness.add("up", "forensics", Arc::new(FixedEndpoint(json!({"status": "ok"}))));
        let down = harness.add("down", "forensics", Arc::new(SilentEndpoint));

        let health = harness.connector.health_check_all().await;

        assert_eq!(health.len(), 2);
        assert!(health[&up]);
        assert!(!health[&down]);
        assert!(harness.connector.agent_metrics(&up).is_none());
        assert!(harness.connector.agent_metrics(&down).is_none());
        assert!(harness.registry.agent(&down).unwrap().is_healthy());
        assert_eq!(harness.registry.agent(&up).unwrap().metrics.requests_served, 0);
    }

    #[tokio::test]
    async fn test_shutdown_refuses_new_requests() {
        let harness = Harness::new(fast_config());
        let id = harness.add("yara", "pattern-matching", Arc::new(FixedEndpoint(json!({}))));

        harness.connector.shutdown();
        let err = harness
            .connector
            .send_request(&id, AgentRequest::new("analysis", json!({})))
            .await
            .unwrap_err();
        assert_eq!(err, OrchestratorError::ShutdownInProgress);
    }

    #[tokio::test]
    async fn test_metrics_totals() {
        let harness = Harness::new(fast_config());
        let id = harness.add("yara", "pattern-matching", Arc::new(FixedEndpoint(json!({}))));
        for _ in 0..3 {
            harness
                .connector
                .send_request(&id, AgentRequest::new("analysis", json!({})))
                .await
                .unwrap();
        }

        let metrics = harness.connector.metrics();
        assert_eq!(metrics.total_requests, 3);
        assert_eq!(metrics.successful, 3);
        assert_eq!(metrics.success_rate(), 1.0);
        assert_eq!(metrics.agents["yara"].attempts, 3);
    }
}
