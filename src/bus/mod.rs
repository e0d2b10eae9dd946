//! In-process publish/subscribe router.
//!
//! The bus knows nothing about how agents are reached. It delivers messages
//! to subscriptions by address, pairs responses with pending requests by
//! correlation id, and keeps a bounded history for diagnostics.

pub mod history;
mod pending;
pub mod subscription;

pub use history::{HistoryFilter, MessageHistory};
pub use subscription::{handler_fn, MessageFilter, MessageHandler, SubscriptionId};

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use crate::config::BusConfig;
use crate::error::{OrchestratorError, Result};
use crate::events::{EventStream, OrchestratorEvent};
use crate::types::{Address, AgentMessage};
use pending::{PendingTable, Resolution};
use subscription::Subscription;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BusMetrics {
    pub published: u64,
    pub delivered: u64,
    pub responses_resolved: u64,
    pub responses_dropped: u64,
    pub handler_failures: u64,
    pub timeouts: u64,
    pub pending_requests: usize,
    pub subscriptions: usize,
    pub history_size: usize,
}

#[derive(Default)]
struct BusCounters {
    published: AtomicU64,
    delivered: AtomicU64,
    responses_resolved: AtomicU64,
    responses_dropped: AtomicU64,
    handler_failures: Arc<AtomicU64>,
    timeouts: AtomicU64,
}

pub struct MessageBus {
    subscriptions: RwLock<Vec<Subscription>>,
    pending: Mutex<PendingTable>,
    history: Mutex<MessageHistory>,
    counters: BusCounters,
    events: EventStream,
    closed: AtomicBool,
}

impl MessageBus {
    pub fn new(config: &BusConfig, events: EventStream) -> Self {
        Self {
            subscriptions: RwLock::new(Vec::new()),
            pending: Mutex::new(PendingTable::default()),
            history: Mutex::new(MessageHistory::new(config.history_capacity)),
            counters: BusCounters::default(),
            events,
            closed: AtomicBool::new(false),
        }
    }

    /// Routes `message` to its subscribers, or completes the pending request
    /// it answers. Responses that answer nothing are dropped without trace.
    pub fn publish(&self, message: AgentMessage) -> Result<()> {
        self.ensure_open()?;

        if message.is_response() {
            self.resolve_response(message);
            return Ok(());
        }

        self.counters.published.fetch_add(1, Ordering::Relaxed);
        self.history.lock().push(message.clone());

        let mut delivered = 0u64;
        {
            let subscriptions = self.subscriptions.read();
            for subscription in subscriptions.iter().filter(|s| s.wants(&message)) {
                if subscription.enqueue(message.clone()) {
                    delivered += 1;
                }
            }
        }
        self.counters
            .delivered
            .fetch_add(delivered, Ordering::Relaxed);

        log::debug!(
            "Published {:?} {} from {} to {} ({} subscribers)",
            message.message_type,
            message.id,
            message.from,
            message.to,
            delivered
        );
        self.events
            .emit(OrchestratorEvent::Message(Box::new(message)));
        Ok(())
    }

    fn resolve_response(&self, message: AgentMessage) {
        let Some(correlation_id) = message.correlation_id.clone() else {
            self.drop_response(&message, "no correlation id");
            return;
        };

        let resolution = {
            let mut pending = self.pending.lock();
            if !pending.contains(&correlation_id) {
                Resolution::Unknown
            } else {
                // History append and resolution happen in one critical
                // section so a resolved response is always recorded.
                let mut history = self.history.lock();
                let resolution = pending.resolve(&correlation_id, message.clone());
                if matches!(resolution, Resolution::Resolved) {
                    history.push(message.clone());
                }
                resolution
            }
        };

        match resolution {
            Resolution::Resolved => {
                self.counters.published.fetch_add(1, Ordering::Relaxed);
                self.counters
                    .responses_resolved
                    .fetch_add(1, Ordering::Relaxed);
                self.events
                    .emit(OrchestratorEvent::Message(Box::new(message)));
            }
            Resolution::Late => self.drop_response(&message, "arrived after deadline"),
            Resolution::Unknown => self.drop_response(&message, "no pending request"),
        }
    }

    fn drop_response(&self, message: &AgentMessage, reason: &str) {
        self.counters
            .responses_dropped
            .fetch_add(1, Ordering::Relaxed);
        log::debug!(
            "Dropped response {} from {} (correlation {:?}): {}",
            message.id,
            message.from,
            message.correlation_id,
            reason
        );
    }

    pub fn subscribe(
        &self,
        address: Address,
        handler: Arc<dyn MessageHandler>,
        filter: Option<MessageFilter>,
    ) -> Result<SubscriptionId> {
        self.ensure_open()?;
        let subscription = Subscription::spawn(
            address,
            handler,
            filter,
            self.events.clone(),
            Arc::clone(&self.counters.handler_failures),
        );
        let id = subscription.id;
        log::debug!("Subscription {} added for {}", id, subscription.address);
        self.subscriptions.write().push(subscription);
        Ok(id)
    }

    /// Removes a subscription. Messages already queued for it are still
    /// handled; nothing new is delivered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscriptions = self.subscriptions.write();
        let before = subscriptions.len();
        subscriptions.retain(|s| s.id != id);
        before != subscriptions.len()
    }

    /// Publishes `message` and waits for the response carrying its
    /// correlation id. Exactly one outcome is produced per call.
    pub async fn request_response(
        &self,
        message: AgentMessage,
        timeout: Duration,
    ) -> Result<AgentMessage> {
        self.ensure_open()?;

        let correlation_id = message.correlation_key();
        let message = message.with_correlation_id(correlation_id.clone());
        let deadline = Instant::now() + timeout;
        let mut completion = self.pending.lock().register(&correlation_id, deadline)?;

        if let Err(e) = self.publish(message) {
            self.pending.lock().remove(&correlation_id);
            return Err(e);
        }

        match tokio::time::timeout_at(deadline, &mut completion).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(self.timeout_error(&correlation_id, timeout)),
            Err(_) => {
                let removed = self.pending.lock().remove(&correlation_id);
                if !removed {
                    // Resolved or failed between the deadline and removal.
                    if let Ok(outcome) = completion.try_recv() {
                        return outcome;
                    }
                }
                Err(self.timeout_error(&correlation_id, timeout))
            }
        }
    }

    fn timeout_error(&self, correlation_id: &str, timeout: Duration) -> OrchestratorError {
        self.counters.timeouts.fetch_add(1, Ordering::Relaxed);
        log::debug!("Request {} timed out after {:?}", correlation_id, timeout);
        OrchestratorError::RequestTimeout {
            correlation_id: correlation_id.to_string(),
            timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
        }
    }

    pub fn message_history(&self, filter: &HistoryFilter) -> Vec<AgentMessage> {
        self.history.lock().query(filter)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.read().len()
    }

    pub fn metrics(&self) -> BusMetrics {
        BusMetrics {
            published: self.counters.published.load(Ordering::Relaxed),
            delivered: self.counters.delivered.load(Ordering::Relaxed),
            responses_resolved: self.counters.responses_resolved.load(Ordering::Relaxed),
            responses_dropped: self.counters.responses_dropped.load(Ordering::Relaxed),
            handler_failures: self.counters.handler_failures.load(Ordering::Relaxed),
            timeouts: self.counters.timeouts.load(Ordering::Relaxed),
            pending_requests: self.pending_count(),
            subscriptions: self.subscription_count(),
            history_size: self.history.lock().len(),
        }
    }

    pub fn events(&self) -> &EventStream {
        &self.events
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Fails every pending request, stops all subscriptions and clears the
    /// history. Idempotent.
    pub fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let failed = self
            .pending
            .lock()
            .fail_all(&OrchestratorError::ShutdownInProgress);
        let subscriptions = std::mem::take(&mut *self.subscriptions.write());
        for subscription in &subscriptions {
            subscription.abort();
        }
        self.history.lock().clear();
        log::info!(
            "Message bus shut down ({} pending requests failed, {} subscriptions closed)",
            failed,
            subscriptions.len()
        );
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            Err(OrchestratorError::ShutdownInProgress)
        } else {
            Ok(())
        }
    }
}
