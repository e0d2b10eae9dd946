//! How requests on the bus reach an actual agent.
//!
//! An [`AgentEndpoint`] is attached to an agent's address; from then on every
//! request message for that agent is decoded, handed to the endpoint, and
//! answered with a correlated response on the bus.

pub mod http;

pub use http::HttpEndpoint;

use async_trait::async_trait;
use futures::FutureExt;
use serde_json::Value;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::bus::{handler_fn, MessageBus, MessageFilter, SubscriptionId};
use crate::error::{OrchestratorError, Result};
use crate::types::{Address, AgentId, AgentMessage, AgentRequest, AgentResponse, MessageType};

/// Code carried by replies whose endpoint call failed before the agent
/// produced an answer.
pub const TRANSPORT_FAILURE_CODE: &str = "transport-failure";

/// Top-level payload key set only on replies the transport synthesizes. An
/// agent's own [`AgentResponse`] is re-serialized and can never carry it.
const TRANSPORT_FAILURE_MARKER: &str = "transportFailure";

/// Deadline for an endpoint call when the request does not carry one.
const DEFAULT_ENDPOINT_TIMEOUT: Duration = Duration::from_secs(30);

#[async_trait]
pub trait AgentEndpoint: Send + Sync {
    /// Handles one request. An `Err` means the agent could not be reached;
    /// analysis failures belong in an error [`AgentResponse`].
    async fn process(&self, request: AgentRequest) -> anyhow::Result<AgentResponse>;
}

/// Subscribes `endpoint` to request messages addressed to `agent_id`.
///
/// The subscription queue only orders delivery: every request is processed
/// on its own task, bounded by the request's `timeout`, so one hung call
/// never holds back the requests queued behind it.
pub fn attach_endpoint(
    bus: &Arc<MessageBus>,
    agent_id: AgentId,
    endpoint: Arc<dyn AgentEndpoint>,
) -> Result<SubscriptionId> {
    let address = Address::Agent(agent_id.clone());
    let reply_bus = Arc::downgrade(bus);
    let only_requests: MessageFilter =
        Arc::new(|message: &AgentMessage| message.message_type == MessageType::Request);

    let handler = handler_fn(move |message: AgentMessage| {
        let reply_bus = reply_bus.clone();
        let endpoint = Arc::clone(&endpoint);
        let agent_id = agent_id.clone();
        async move {
            let request: AgentRequest = serde_json::from_value(message.payload.clone())?;
            tokio::spawn(async move {
                let payload = answer(endpoint.as_ref(), &agent_id, request).await;
                let Some(bus) = reply_bus.upgrade() else {
                    return;
                };
                if let Err(e) = bus.publish(message.reply(payload)) {
                    log::debug!("Reply from {} not delivered: {}", agent_id, e);
                }
            });
            Ok::<(), anyhow::Error>(())
        }
    });

    bus.subscribe(address, handler, Some(only_requests))
}

/// Runs one endpoint call and returns the reply payload.
async fn answer(endpoint: &dyn AgentEndpoint, agent_id: &AgentId, request: AgentRequest) -> Value {
    let request_id = request.id;
    let deadline = request
        .timeout_ms
        .map(Duration::from_millis)
        .unwrap_or(DEFAULT_ENDPOINT_TIMEOUT);
    let started = Instant::now();

    let call = AssertUnwindSafe(endpoint.process(request)).catch_unwind();
    let failure = match tokio::time::timeout(deadline, call).await {
        Ok(Ok(Ok(response))) => match serde_json::to_value(&response) {
            Ok(payload) => return payload,
            Err(e) => format!("unserializable response: {}", e),
        },
        Ok(Ok(Err(e))) => format!("{:#}", e),
        Ok(Err(_)) => "endpoint panicked".to_string(),
        Err(_) => format!("no answer within {:?}", deadline),
    };

    log::warn!("Endpoint for {} failed: {}", agent_id, failure);
    let mut response = AgentResponse::error(request_id, TRANSPORT_FAILURE_CODE, failure, true);
    response.processing_time_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

    let mut payload = serde_json::to_value(&response).unwrap_or_default();
    if let Value::Object(fields) = &mut payload {
        fields.insert(TRANSPORT_FAILURE_MARKER.to_string(), Value::Bool(true));
    }
    payload
}

/// Recognizes a reply synthesized above and turns it back into the error it
/// stands for. Error responses written by the agent itself are left alone,
/// whatever their code.
pub(crate) fn transport_error(payload: &Value) -> Option<OrchestratorError> {
    if payload.get(TRANSPORT_FAILURE_MARKER) != Some(&Value::Bool(true)) {
        return None;
    }
    let message = payload
        .pointer("/error/message")
        .and_then(Value::as_str)
        .unwrap_or("agent endpoint failed");
    Some(OrchestratorError::TransportFailure(message.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BusConfig;
    use crate::events::EventStream;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct EchoEndpoint;

    #[async_trait]
    impl AgentEndpoint for EchoEndpoint {
        async fn process(&self, request: AgentRequest) -> anyhow::Result<AgentResponse> {
            Ok(AgentResponse::success(request.id, request.data, 3))
        }
    }

    struct UnreachableEndpoint;

    #[async_trait]
    impl AgentEndpoint for UnreachableEndpoint {
        async fn process(&self, _request: AgentRequest) -> anyhow::Result<AgentResponse> {
            anyhow::bail!("connection refused")
        }
    }

    /// Reports a failure itself, using the transport's reserved code.
    struct SelfReportedFailure;

    #[async_trait]
    impl AgentEndpoint for SelfReportedFailure {
        async fn process(&self, request: AgentRequest) -> anyhow::Result<AgentResponse> {
            Ok(AgentResponse::error(
                request.id,
                TRANSPORT_FAILURE_CODE,
                "upstream sandbox offline",
                true,
            ))
        }
    }

    /// Never answers its first call; answers every later one at once.
    #[derive(Default)]
    struct StuckOnce {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl AgentEndpoint for StuckOnce {
        async fn process(&self, request: AgentRequest) -> anyhow::Result<AgentResponse> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                std::future::pending::<()>().await;
            }
            Ok(AgentResponse::success(request.id, json!({}), 1))
        }
    }

    struct PanickingEndpoint;

    #[async_trait]
    impl AgentEndpoint for PanickingEndpoint {
        async fn process(&self, _request: AgentRequest) -> anyhow::Result<AgentResponse> {
            panic!("sample decoder bug")
        }
    }

    fn bus() -> Arc<MessageBus> {
        Arc::new(MessageBus::new(&BusConfig::default(), EventStream::default()))
    }

    fn request_message(agent: &str, request: &AgentRequest) -> AgentMessage {
        AgentMessage::request(
            Address::Host,
            Address::agent(agent),
            serde_json::to_value(request).unwrap(),
        )
    }

    #[tokio::test]
    async fn test_attached_endpoint_answers_requests() {
        let bus = bus();
        attach_endpoint(&bus, AgentId::from("echo"), Arc::new(EchoEndpoint)).unwrap();

        let request = AgentRequest::new("analysis", json!({"sample": "abc"}));
        let reply = bus
            .request_response(request_message("echo", &request), Duration::from_secs(1))
            .await
            .unwrap();

        assert_eq!(reply.from, Address::agent("echo"));
        assert!(transport_error(&reply.payload).is_none());
        let response: AgentResponse = serde_json::from_value(reply.payload).unwrap();
        assert_eq!(response.request_id, request.id);
        assert_eq!(response.data, json!({"sample": "abc"}));
    }

    #[tokio::test]
    async fn test_endpoint_failure_becomes_transport_error() {
        let bus = bus();
        attach_endpoint(&bus, AgentId::from("down"), Arc::new(UnreachableEndpoint)).unwrap();

        let request = AgentRequest::new("analysis", json!({}));
        let reply = bus
            .request_response(request_message("down", &request), Duration::from_secs(1))
            .await
            .unwrap();

        assert!(matches!(
            transport_error(&reply.payload),
            Some(OrchestratorError::TransportFailure(message)) if message.contains("connection refused")
        ));
        let response: AgentResponse = serde_json::from_value(reply.payload).unwrap();
        assert!(!response.is_success());
        assert_eq!(response.error.unwrap().code, TRANSPORT_FAILURE_CODE);
    }

    #[tokio::test]
    async fn test_agent_error_with_reserved_code_is_not_a_transport_error() {
        let bus = bus();
        attach_endpoint(&bus, AgentId::from("liar"), Arc::new(SelfReportedFailure)).unwrap();

        let request = AgentRequest::new("analysis", json!({}));
        let reply = bus
            .request_response(request_message("liar", &request), Duration::from_secs(1))
            .await
            .unwrap();

        assert!(transport_error(&reply.payload).is_none());
        let response: AgentResponse = serde_json::from_value(reply.payload).unwrap();
        assert_eq!(response.error.unwrap().code, TRANSPORT_FAILURE_CODE);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_call_is_bounded_and_does_not_block_the_queue() {
        let bus = bus();
        let endpoint = Arc::new(StuckOnce::default());
        attach_endpoint(&bus, AgentId::from("stuck"), endpoint.clone()).unwrap();

        let first = AgentRequest::new("analysis", json!({})).with_timeout_ms(1_000);
        let mut hung = {
            let bus = Arc::clone(&bus);
            let message = request_message("stuck", &first);
            tokio::spawn(async move { bus.request_response(message, Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        let second = AgentRequest::new("analysis", json!({}));
        let reply = bus
            .request_response(request_message("stuck", &second), Duration::from_millis(100))
            .await
            .unwrap();
        assert!(transport_error(&reply.payload).is_none());
        assert!(!hung.is_finished());

        let reply = (&mut hung).await.unwrap().unwrap();
        assert!(matches!(
            transport_error(&reply.payload),
            Some(OrchestratorError::TransportFailure(message)) if message.contains("no answer")
        ));
        assert_eq!(endpoint.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_endpoint_panic_becomes_transport_error() {
        let bus = bus();
        attach_endpoint(&bus, AgentId::from("buggy"), Arc::new(PanickingEndpoint)).unwrap();

        let request = AgentRequest::new("analysis", json!({}));
        let reply = bus
            .request_response(request_message("buggy", &request), Duration::from_secs(1))
            .await
            .unwrap();

        assert!(matches!(
            transport_error(&reply.payload),
            Some(OrchestratorError::TransportFailure(message)) if message.contains("panicked")
        ));
    }

    #[tokio::test]
    async fn test_events_are_not_passed_to_endpoint() {
        let bus = bus();
        attach_endpoint(&bus, AgentId::from("echo"), Arc::new(EchoEndpoint)).unwrap();

        bus.publish(AgentMessage::event(Address::Host, json!({"event": "noop"})))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(bus.metrics().handler_failures, 0);
        assert_eq!(bus.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_undecodable_request_is_a_handler_failure() {
        let bus = bus();
        attach_endpoint(&bus, AgentId::from("echo"), Arc::new(EchoEndpoint)).unwrap();

        let garbage = AgentMessage::request(Address::Host, Address::agent("echo"), json!("nope"));
        let result = bus
            .request_response(garbage, Duration::from_millis(50))
            .await;

        assert_eq!(result.unwrap_err().code(), "request-timeout");
        assert_eq!(bus.metrics().handler_failures, 1);
    }
}
