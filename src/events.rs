use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::types::{AgentId, AgentMessage};

const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Lifecycle notifications for external observers. Observers can watch but
/// never influence orchestration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all_fields = "camelCase")]
pub enum OrchestratorEvent {
    #[serde(rename = "agent:registered")]
    AgentRegistered { agent_id: AgentId },
    #[serde(rename = "agent:unregistered")]
    AgentUnregistered { agent_id: AgentId },
    #[serde(rename = "agent:unhealthy")]
    AgentUnhealthy { agent_id: AgentId },
    #[serde(rename = "message")]
    Message(Box<AgentMessage>),
    #[serde(rename = "error")]
    Error {
        source: String,
        code: String,
        message: String,
    },
}

impl OrchestratorEvent {
    pub fn name(&self) -> &'static str {
        match self {
            OrchestratorEvent::AgentRegistered { .. } => "agent:registered",
            OrchestratorEvent::AgentUnregistered { .. } => "agent:unregistered",
            OrchestratorEvent::AgentUnhealthy { .. } => "agent:unhealthy",
            OrchestratorEvent::Message(_) => "message",
            OrchestratorEvent::Error { .. } => "error",
        }
    }
}

/// Shared fan-out of [`OrchestratorEvent`]s. Cloning yields another handle on
/// the same channel.
#[derive(Debug, Clone)]
pub struct EventStream {
    sender: broadcast::Sender<OrchestratorEvent>,
}

impl EventStream {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Emitting with no observers attached is not an error.
    pub fn emit(&self, event: OrchestratorEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OrchestratorEvent> {
        self.sender.subscribe()
    }

    pub fn observer_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventStream {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_emit_reaches_every_observer() {
        let stream = EventStream::default();
        let mut first = stream.subscribe();
        let mut second = stream.subscribe();

        stream.emit(OrchestratorEvent::AgentRegistered {
            agent_id: AgentId::from("yara-1"),
        });

        assert_eq!(first.recv().await.unwrap().name(), "agent:registered");
        assert_eq!(second.recv().await.unwrap().name(), "agent:registered");
    }

    #[test]
    fn test_emit_without_observers_is_silent() {
        let stream = EventStream::new(4);
        stream.emit(OrchestratorEvent::AgentUnhealthy {
            agent_id: AgentId::from("a"),
        });
        assert_eq!(stream.observer_count(), 0);
    }

    #[test]
    fn test_event_json_shape() {
        let event = OrchestratorEvent::AgentUnregistered {
            agent_id: AgentId::from("a"),
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["event"], "agent:unregistered");
        assert_eq!(value["data"]["agentId"], "a");
        assert!(value["data"].get("agent_id").is_none());

        let back: OrchestratorEvent = serde_json::from_value(value).unwrap();
        assert_eq!(back, event);
    }
}
