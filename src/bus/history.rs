use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

use crate::types::{Address, AgentMessage, MessageType};

/// Selection over the bus history. Every set field must match.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HistoryFilter {
    #[serde(default)]
    pub from: Option<Address>,
    #[serde(default)]
    pub to: Option<Address>,
    #[serde(default, rename = "type")]
    pub message_type: Option<MessageType>,
    #[serde(default)]
    pub since: Option<DateTime<Utc>>,
    /// Keep only the most recent `limit` matches.
    #[serde(default)]
    pub limit: Option<usize>,
}

impl HistoryFilter {
    pub fn sent_by(mut self, address: Address) -> Self {
        self.from = Some(address);
        self
    }

    pub fn sent_to(mut self, address: Address) -> Self {
        self.to = Some(address);
        self
    }

    pub fn of_type(mut self, message_type: MessageType) -> Self {
        self.message_type = Some(message_type);
        self
    }

    pub fn since(mut self, timestamp: DateTime<Utc>) -> Self {
        self.since = Some(timestamp);
        self
    }

    pub fn matches(&self, message: &AgentMessage) -> bool {
        self.from.as_ref().map_or(true, |from| &message.from == from)
            && self.to.as_ref().map_or(true, |to| &message.to == to)
            && self
                .message_type
                .map_or(true, |message_type| message.message_type == message_type)
            && self.since.map_or(true, |since| message.timestamp >= since)
    }
}

/// Fixed-capacity ring buffer of published messages, oldest evicted first.
#[derive(Debug)]
pub struct MessageHistory {
    entries: VecDeque<AgentMessage>,
    capacity: usize,
}

impl MessageHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
        }
    }

    pub fn push(&mut self, message: AgentMessage) {
        if self.capacity == 0 {
            return;
        }
        while self.entries.len() >= self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(message);
    }

    pub fn query(&self, filter: &HistoryFilter) -> Vec<AgentMessage> {
        let mut matches: Vec<AgentMessage> = self
            .entries
            .iter()
            .filter(|message| filter.matches(message))
            .cloned()
            .collect();

        if let Some(limit) = filter.limit {
            if matches.len() > limit {
                matches.drain(0..matches.len() - limit);
            }
        }
        matches
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn message(from: Address, to: Address, message_type: MessageType) -> AgentMessage {
        AgentMessage::new(from, to, message_type, json!({}))
    }

    #[test]
    fn test_oldest_entries_are_evicted() {
        let mut history = MessageHistory::new(2);
        let first = message(Address::Host, Address::agent("a"), MessageType::Request);
        let second = message(Address::Host, Address::agent("b"), MessageType::Request);
        let third = message(Address::Host, Address::agent("c"), MessageType::Request);

        history.push(first);
        history.push(second.clone());
        history.push(third.clone());

        let all = history.query(&HistoryFilter::default());
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].id, second.id);
        assert_eq!(all[1].id, third.id);
    }

    #[test]
    fn test_zero_capacity_keeps_nothing() {
        let mut history = MessageHistory::new(0);
        history.push(message(Address::Host, Address::Broadcast, MessageType::Event));
        assert!(history.is_empty());
    }

    #[test]
    fn test_filter_by_sender_recipient_and_type() {
        let mut history = MessageHistory::new(10);
        history.push(message(Address::Host, Address::agent("a"), MessageType::Request));
        history.push(message(Address::agent("a"), Address::Host, MessageType::Response));
        history.push(message(Address::Host, Address::Broadcast, MessageType::Event));

        let from_host = history.query(&HistoryFilter::default().sent_by(Address::Host));
        assert_eq!(from_host.len(), 2);

        let to_a = history.query(&HistoryFilter::default().sent_to(Address::agent("a")));
        assert_eq!(to_a.len(), 1);

        let events = history.query(&HistoryFilter::default().of_type(MessageType::Event));
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].to, Address::Broadcast);
    }

    #[test]
    fn test_filter_since_and_limit() {
        let mut history = MessageHistory::new(10);
        let mut old = message(Address::Host, Address::agent("a"), MessageType::Request);
        old.timestamp = Utc::now() - chrono::Duration::minutes(5);
        history.push(old);
        for _ in 0..3 {
            history.push(message(Address::Host, Address::agent("a"), MessageType::Request));
        }

        let cutoff = Utc::now() - chrono::Duration::minutes(1);
        assert_eq!(history.query(&HistoryFilter::default().since(cutoff)).len(), 3);

        let filter = HistoryFilter {
            limit: Some(2),
            ..HistoryFilter::default()
        };
        assert_eq!(history.query(&filter).len(), 2);
        assert_eq!(history.len(), 4);
    }
}
