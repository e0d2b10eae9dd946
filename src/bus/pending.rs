use std::collections::HashMap;
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::error::{OrchestratorError, Result};
use crate::types::AgentMessage;

pub(crate) type Completion = oneshot::Sender<Result<AgentMessage>>;

struct PendingCall {
    deadline: Instant,
    completion: Completion,
}

/// Outstanding request/response slots keyed by correlation id. A slot leaves
/// the table exactly once: on resolution, on timeout, or on shutdown.
#[derive(Default)]
pub(crate) struct PendingTable {
    slots: HashMap<String, PendingCall>,
}

pub(crate) enum Resolution {
    Resolved,
    Late,
    Unknown,
}

impl PendingTable {
    pub fn register(
        &mut self,
        correlation_id: &str,
        deadline: Instant,
    ) -> Result<oneshot::Receiver<Result<AgentMessage>>> {
        if self.slots.contains_key(correlation_id) {
            return Err(OrchestratorError::DuplicateCorrelation(
                correlation_id.to_string(),
            ));
        }
        let (completion, receiver) = oneshot::channel();
        self.slots.insert(
            correlation_id.to_string(),
            PendingCall {
                deadline,
                completion,
            },
        );
        Ok(receiver)
    }

    pub fn contains(&self, correlation_id: &str) -> bool {
        self.slots.contains_key(correlation_id)
    }

    /// Completes the slot for `response`. A response that arrives at or after
    /// the deadline clears the slot without completing it, so the waiting
    /// caller observes its timeout rather than a stale reply.
    pub fn resolve(&mut self, correlation_id: &str, response: AgentMessage) -> Resolution {
        let Some(call) = self.slots.remove(correlation_id) else {
            return Resolution::Unknown;
        };
        if Instant::now() >= call.deadline {
            return Resolution::Late;
        }
        // The caller may have been dropped; the slot is gone either way.
        let _ = call.completion.send(Ok(response));
        Resolution::Resolved
    }

    pub fn remove(&mut self, correlation_id: &str) -> bool {
        self.slots.remove(correlation_id).is_some()
    }

    pub fn fail_all(&mut self, error: &OrchestratorError) -> usize {
        let failed = self.slots.len();
        for (_, call) in self.slots.drain() {
            let _ = call.completion.send(Err(error.clone()));
        }
        failed
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Address;
    use serde_json::json;
    use std::time::Duration;

    fn response() -> AgentMessage {
        AgentMessage::request(Address::agent("a"), Address::Host, json!({}))
    }

    #[tokio::test]
    async fn test_register_rejects_duplicates() {
        let mut table = PendingTable::default();
        let deadline = Instant::now() + Duration::from_secs(1);

        let _rx = table.register("c-1", deadline).unwrap();
        let err = table.register("c-1", deadline).unwrap_err();
        assert_eq!(err.code(), "duplicate-correlation");
        assert_eq!(table.len(), 1);
    }

    #[tokio::test]
    async fn test_resolve_completes_once() {
        let mut table = PendingTable::default();
        let rx = table
            .register("c-1", Instant::now() + Duration::from_secs(1))
            .unwrap();

        assert!(matches!(table.resolve("c-1", response()), Resolution::Resolved));
        assert!(matches!(table.resolve("c-1", response()), Resolution::Unknown));
        assert!(rx.await.unwrap().is_ok());
        assert_eq!(table.len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resolve_after_deadline_is_late() {
        let mut table = PendingTable::default();
        let mut rx = table
            .register("c-1", Instant::now() + Duration::from_millis(10))
            .unwrap();

        tokio::time::advance(Duration::from_millis(20)).await;

        assert!(matches!(table.resolve("c-1", response()), Resolution::Late));
        assert!(!table.contains("c-1"));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_fail_all_drains_table() {
        let mut table = PendingTable::default();
        let deadline = Instant::now() + Duration::from_secs(1);
        let rx1 = table.register("c-1", deadline).unwrap();
        let rx2 = table.register("c-2", deadline).unwrap();

        assert_eq!(table.fail_all(&OrchestratorError::ShutdownInProgress), 2);
        assert_eq!(
            rx1.await.unwrap().unwrap_err(),
            OrchestratorError::ShutdownInProgress
        );
        assert!(rx2.await.unwrap().is_err());
        assert_eq!(table.len(), 0);
    }
}
