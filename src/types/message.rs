use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{Address, MessageId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Request,
    Response,
    Event,
}

/// The unit of communication on the bus. Constructed once and never mutated
/// after publication; builders consume `self`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentMessage {
    pub id: MessageId,
    pub from: Address,
    pub to: Address,
    #[serde(rename = "type")]
    pub message_type: MessageType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
}

impl AgentMessage {
    pub fn new(from: Address, to: Address, message_type: MessageType, payload: Value) -> Self {
        Self {
            id: MessageId::new_v4(),
            from,
            to,
            message_type,
            correlation_id: None,
            payload,
            timestamp: Utc::now(),
        }
    }

    pub fn request(from: Address, to: Address, payload: Value) -> Self {
        Self::new(from, to, MessageType::Request, payload)
    }

    pub fn event(from: Address, payload: Value) -> Self {
        Self::new(from, Address::Broadcast, MessageType::Event, payload)
    }

    /// Builds the reply to `self`: addressed back to the sender and carrying
    /// the request's correlation id (or its message id when none was set).
    pub fn reply(&self, payload: Value) -> Self {
        Self::new(
            self.to.clone(),
            self.from.clone(),
            MessageType::Response,
            payload,
        )
        .with_correlation_id(self.correlation_key())
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    /// The id a response must echo to be matched with this message.
    pub fn correlation_key(&self) -> String {
        self.correlation_id
            .clone()
            .unwrap_or_else(|| self.id.to_string())
    }

    pub fn is_response(&self) -> bool {
        self.message_type == MessageType::Response
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_reply_swaps_addresses_and_correlates() {
        let request = AgentMessage::request(
            Address::Host,
            Address::agent("yara-1"),
            json!({"scan": true}),
        );
        let reply = request.reply(json!({"ok": true}));

        assert_eq!(reply.from, Address::agent("yara-1"));
        assert_eq!(reply.to, Address::Host);
        assert_eq!(reply.message_type, MessageType::Response);
        assert_eq!(reply.correlation_id, Some(request.id.to_string()));
    }

    #[test]
    fn test_explicit_correlation_id_is_echoed() {
        let request = AgentMessage::request(Address::Host, Address::agent("a"), json!({}))
            .with_correlation_id("corr-7");
        assert_eq!(request.correlation_key(), "corr-7");
        assert_eq!(request.reply(json!({})).correlation_id.as_deref(), Some("corr-7"));
    }

    #[test]
    fn test_wire_format_uses_type_and_camel_case() {
        let message = AgentMessage::event(Address::Host, json!({"event": "agent-registered"}))
            .with_correlation_id("c");
        let value = serde_json::to_value(&message).unwrap();

        assert_eq!(value["type"], "event");
        assert_eq!(value["to"], "broadcast");
        assert_eq!(value["from"], "host");
        assert_eq!(value["correlationId"], "c");
    }
}
