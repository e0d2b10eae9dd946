use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::RegistryConfig;
use crate::error::{OrchestratorError, Result};
use crate::types::{AgentRuntimeState, AgentState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LivenessEvent {
    Confirmed,
    HeartbeatReceived,
    HeartbeatMissed,
    MissLimitReached,
    Unregistered,
}

pub struct LivenessStateMachine;

impl LivenessStateMachine {
    pub fn transition(state: AgentState, event: LivenessEvent) -> Result<AgentState> {
        let next = match (state, event) {
            (AgentState::Registering, LivenessEvent::Confirmed) => AgentState::Healthy,

            (
                AgentState::Registering | AgentState::Healthy | AgentState::Degraded,
                LivenessEvent::HeartbeatReceived,
            ) => AgentState::Healthy,

            (AgentState::Healthy | AgentState::Degraded, LivenessEvent::HeartbeatMissed) => {
                AgentState::Degraded
            }

            (AgentState::Degraded, LivenessEvent::MissLimitReached) => AgentState::Unreachable,

            (
                AgentState::Registering | AgentState::Healthy | AgentState::Degraded,
                LivenessEvent::Unregistered,
            ) => AgentState::Unreachable,

            _ => {
                return Err(OrchestratorError::InvalidTransition(format!(
                    "{:?} from {}",
                    event,
                    state.as_str()
                )));
            }
        };
        Ok(next)
    }

    /// Decides what one sweep at `now` means for `agent`. Returns the event
    /// to apply and the number of whole heartbeat intervals missed so far.
    pub fn assess(
        agent: &AgentRuntimeState,
        config: &RegistryConfig,
        now: DateTime<Utc>,
    ) -> Option<(LivenessEvent, u32)> {
        let elapsed = now
            .signed_duration_since(agent.last_heartbeat)
            .to_std()
            .ok()?;
        if elapsed <= config.heartbeat_timeout() {
            return None;
        }

        let interval = config.heartbeat_interval().as_millis().max(1);
        let missed = u32::try_from(elapsed.as_millis() / interval).unwrap_or(u32::MAX);

        match agent.state {
            AgentState::Healthy => Some((LivenessEvent::HeartbeatMissed, missed.max(1))),
            AgentState::Degraded if missed >= config.max_missed_heartbeats => {
                Some((LivenessEvent::MissLimitReached, missed))
            }
            AgentState::Degraded => Some((LivenessEvent::HeartbeatMissed, missed)),
            _ => None,
        }
    }
}
