//! Membership and liveness tracking.
//!
//! The registry is the single writer of [`AgentRuntimeState`]. Everyone else
//! reads cloned snapshots. Lifecycle changes are emitted on the event stream
//! and published on the bus as broadcast `event` messages so agents can
//! observe their peers.

pub mod state_machine;

pub use state_machine::{LivenessEvent, LivenessStateMachine};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;

use crate::bus::MessageBus;
use crate::config::RegistryConfig;
use crate::error::{OrchestratorError, Result};
use crate::events::{EventStream, OrchestratorEvent};
use crate::types::{
    Address, AgentId, AgentMessage, AgentRegistration, AgentRuntimeState, AgentState, Capability,
};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryMetrics {
    pub total_agents: usize,
    pub registering: usize,
    pub healthy: usize,
    pub degraded: usize,
    pub evicted: u64,
    pub capabilities: BTreeMap<String, usize>,
}

struct AgentEntry {
    runtime: AgentRuntimeState,
    token: String,
    sequence: u64,
}

pub struct AgentRegistry {
    bus: Arc<MessageBus>,
    config: RegistryConfig,
    agents: RwLock<HashMap<AgentId, AgentEntry>>,
    next_sequence: AtomicU64,
    evicted: AtomicU64,
    events: EventStream,
    monitor: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl AgentRegistry {
    pub fn new(bus: Arc<MessageBus>, config: RegistryConfig, events: EventStream) -> Self {
        Self {
            bus,
            config,
            agents: RwLock::new(HashMap::new()),
            next_sequence: AtomicU64::new(0),
            evicted: AtomicU64::new(0),
            events,
            monitor: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    /// Accepts `registration` and returns the secret token the agent must
    /// present on every heartbeat. A duplicate id is rejected and the
    /// existing entry is left as it was.
    pub fn register(&self, mut registration: AgentRegistration) -> Result<String> {
        self.ensure_open()?;
        registration.validate()?;
        registration.dedup_capabilities();
        registration.registered_at = Utc::now();

        let agent_id = registration.agent_id.clone();
        let capabilities = registration.capabilities.clone();
        let token = generate_token();

        {
            let mut agents = self.agents.write();
            if agents.contains_key(&agent_id) {
                log::warn!("Rejected duplicate registration for {}", agent_id);
                return Err(OrchestratorError::RegistrationConflict(agent_id));
            }

            let mut runtime = AgentRuntimeState::new(registration);
            runtime.state = LivenessStateMachine::transition(runtime.state, LivenessEvent::Confirmed)?;
            agents.insert(
                agent_id.clone(),
                AgentEntry {
                    runtime,
                    token: token.clone(),
                    sequence: self.next_sequence.fetch_add(1, Ordering::Relaxed),
                },
            );
        }

        log::info!(
            "Registered agent {} with capabilities [{}]",
            agent_id,
            capabilities
                .iter()
                .map(Capability::as_str)
                .collect::<Vec<_>>()
                .join(", ")
        );
        self.events.emit(OrchestratorEvent::AgentRegistered {
            agent_id: agent_id.clone(),
        });
        self.announce(json!({
            "event": "agent-registered",
            "agentId": agent_id,
            "capabilities": capabilities,
        }));

        Ok(token)
    }

    pub fn unregister(&self, agent_id: &AgentId) -> Result<AgentRuntimeState> {
        let mut entry = self
            .agents
            .write()
            .remove(agent_id)
            .ok_or_else(|| OrchestratorError::AgentNotFound(agent_id.clone()))?;

        entry.runtime.state =
            LivenessStateMachine::transition(entry.runtime.state, LivenessEvent::Unregistered)?;
        log::info!("Unregistered agent {}", agent_id);
        self.announce_unregistered(agent_id);
        Ok(entry.runtime)
    }

    pub fn heartbeat(&self, agent_id: &AgentId, token: &str) -> Result<()> {
        let recovered = {
            let mut agents = self.agents.write();
            let entry = agents
                .get_mut(agent_id)
                .ok_or_else(|| OrchestratorError::AgentNotFound(agent_id.clone()))?;
            if entry.token != token {
                return Err(OrchestratorError::InvalidToken(agent_id.clone()));
            }

            let previous = entry.runtime.state;
            entry.runtime.state =
                LivenessStateMachine::transition(previous, LivenessEvent::HeartbeatReceived)?;
            entry.runtime.last_heartbeat = Utc::now();
            entry.runtime.missed_heartbeats = 0;
            previous == AgentState::Degraded
        };

        if recovered {
            log::info!("Agent {} recovered after missed heartbeats", agent_id);
        } else {
            log::trace!("Heartbeat from {}", agent_id);
        }
        Ok(())
    }

    pub fn check_liveness(&self) -> Vec<AgentId> {
        self.check_liveness_at(Utc::now())
    }

    /// Runs one liveness sweep as of `now` and returns the evicted agents.
    pub fn check_liveness_at(&self, now: DateTime<Utc>) -> Vec<AgentId> {
        let mut degraded = Vec::new();
        let mut evicted = Vec::new();

        {
            let mut agents = self.agents.write();
            for (agent_id, entry) in agents.iter_mut() {
                let Some((event, missed)) =
                    LivenessStateMachine::assess(&entry.runtime, &self.config, now)
                else {
                    continue;
                };

                let previous = entry.runtime.state;
                match LivenessStateMachine::transition(previous, event) {
                    Ok(next) => {
                        entry.runtime.state = next;
                        entry.runtime.missed_heartbeats = missed;
                        if next == AgentState::Unreachable {
                            evicted.push(agent_id.clone());
                        } else if previous == AgentState::Healthy {
                            degraded.push((agent_id.clone(), missed));
                        }
                    }
                    Err(e) => log::error!("Liveness sweep skipped {}: {}", agent_id, e),
                }
            }
            for agent_id in &evicted {
                agents.remove(agent_id);
            }
        }

        for (agent_id, missed) in degraded {
            log::warn!("Agent {} degraded after {} missed heartbeat(s)", agent_id, missed);
        }
        for agent_id in &evicted {
            self.evicted.fetch_add(1, Ordering::Relaxed);
            log::warn!("Agent {} unreachable, removing from registry", agent_id);
            self.events.emit(OrchestratorEvent::AgentUnhealthy {
                agent_id: agent_id.clone(),
            });
            self.announce(json!({"event": "agent-unhealthy", "agentId": agent_id}));
            self.announce_unregistered(agent_id);
        }

        evicted
    }

    /// The single write path for per-agent request metrics. Outcomes for
    /// agents that have left the registry are ignored.
    pub fn record_outcome(&self, agent_id: &AgentId, latency_ms: f64, success: bool) {
        if let Some(entry) = self.agents.write().get_mut(agent_id) {
            entry.runtime.metrics.record(latency_ms, success);
        }
    }

    /// Healthy agents advertising `capability`, in registration order.
    pub fn agents_by_capability(&self, capability: &Capability) -> Vec<AgentRegistration> {
        let agents = self.agents.read();
        let mut matches: Vec<&AgentEntry> = agents
            .values()
            .filter(|entry| {
                entry.runtime.is_healthy() && entry.runtime.registration.has_capability(capability)
            })
            .collect();
        matches.sort_by_key(|entry| entry.sequence);
        matches
            .into_iter()
            .map(|entry| entry.runtime.registration.clone())
            .collect()
    }

    /// Every registered agent, in registration order.
    pub fn all_agents(&self) -> Vec<AgentRuntimeState> {
        let agents = self.agents.read();
        let mut entries: Vec<&AgentEntry> = agents.values().collect();
        entries.sort_by_key(|entry| entry.sequence);
        entries.into_iter().map(|entry| entry.runtime.clone()).collect()
    }

    pub fn agent(&self, agent_id: &AgentId) -> Option<AgentRuntimeState> {
        self.agents
            .read()
            .get(agent_id)
            .map(|entry| entry.runtime.clone())
    }

    pub fn contains(&self, agent_id: &AgentId) -> bool {
        self.agents.read().contains_key(agent_id)
    }

    pub fn metrics(&self) -> RegistryMetrics {
        let agents = self.agents.read();
        let mut metrics = RegistryMetrics {
            total_agents: agents.len(),
            evicted: self.evicted.load(Ordering::Relaxed),
            ..RegistryMetrics::default()
        };
        for entry in agents.values() {
            match entry.runtime.state {
                AgentState::Registering => metrics.registering += 1,
                AgentState::Healthy => metrics.healthy += 1,
                AgentState::Degraded => metrics.degraded += 1,
                AgentState::Unreachable => {}
            }
            for capability in &entry.runtime.registration.capabilities {
                *metrics
                    .capabilities
                    .entry(capability.as_str().to_string())
                    .or_insert(0) += 1;
            }
        }
        metrics
    }

    /// Spawns the periodic liveness sweep. Calling it again is a no-op.
    pub fn start_monitoring(self: &Arc<Self>) {
        let mut monitor = self.monitor.lock();
        if monitor.is_some() {
            return;
        }

        let registry = Arc::downgrade(self);
        let period = self.config.check_interval();
        *monitor = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(registry) = registry.upgrade() else {
                    break;
                };
                registry.check_liveness();
            }
        }));
        log::debug!("Liveness monitoring started (every {:?})", period);
    }

    pub fn is_monitoring(&self) -> bool {
        self.monitor.lock().is_some()
    }

    /// Stops monitoring and forgets every agent. Idempotent.
    pub fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(handle) = self.monitor.lock().take() {
            handle.abort();
        }
        let removed = {
            let mut agents = self.agents.write();
            let count = agents.len();
            agents.clear();
            count
        };
        log::info!("Agent registry shut down ({} agents released)", removed);
    }

    fn announce_unregistered(&self, agent_id: &AgentId) {
        self.events.emit(OrchestratorEvent::AgentUnregistered {
            agent_id: agent_id.clone(),
        });
        self.announce(json!({"event": "agent-unregistered", "agentId": agent_id}));
    }

    fn announce(&self, payload: serde_json::Value) {
        if let Err(e) = self.bus.publish(AgentMessage::event(Address::Host, payload)) {
            log::debug!("Lifecycle event not published: {}", e);
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(OrchestratorError::ShutdownInProgress)
        } else {
            Ok(())
        }
    }
}

fn generate_token() -> String {
    format!(
        "{}{}",
        uuid::Uuid::new_v4().simple(),
        uuid::Uuid::new_v4().simple()
    )
}
