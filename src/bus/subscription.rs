use async_trait::async_trait;
use futures::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::OrchestratorError;
use crate::events::{EventStream, OrchestratorEvent};
use crate::types::{Address, AgentMessage};

pub type SubscriptionId = uuid::Uuid;

/// Optional predicate deciding whether a subscription wants a message.
pub type MessageFilter = Arc<dyn Fn(&AgentMessage) -> bool + Send + Sync>;

#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: AgentMessage) -> anyhow::Result<()>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> MessageHandler for FnHandler<F>
where
    F: Fn(AgentMessage) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    async fn handle(&self, message: AgentMessage) -> anyhow::Result<()> {
        (self.0)(message).await
    }
}

/// Wraps an async closure as a [`MessageHandler`].
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn MessageHandler>
where
    F: Fn(AgentMessage) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

/// A registered interest in one address. Messages are queued and handled one
/// at a time by a dedicated task, which keeps per-address delivery in
/// publish order.
pub(crate) struct Subscription {
    pub id: SubscriptionId,
    pub address: Address,
    filter: Option<MessageFilter>,
    queue: mpsc::UnboundedSender<AgentMessage>,
    worker: JoinHandle<()>,
}

impl Subscription {
    pub fn spawn(
        address: Address,
        handler: Arc<dyn MessageHandler>,
        filter: Option<MessageFilter>,
        events: EventStream,
        failures: Arc<AtomicU64>,
    ) -> Self {
        let id = SubscriptionId::new_v4();
        let (queue, receiver) = mpsc::unbounded_channel();
        let worker = tokio::spawn(drain_queue(id, handler, receiver, events, failures));
        Self {
            id,
            address,
            filter,
            queue,
            worker,
        }
    }

    /// Broadcasts reach every subscription; directed messages only the
    /// subscriptions registered for the recipient.
    pub fn wants(&self, message: &AgentMessage) -> bool {
        let addressed = match &message.to {
            Address::Broadcast => true,
            recipient => recipient == &self.address,
        };
        addressed && self.filter.as_ref().map_or(true, |filter| filter(message))
    }

    pub fn enqueue(&self, message: AgentMessage) -> bool {
        self.queue.send(message).is_ok()
    }

    pub fn abort(&self) {
        self.worker.abort();
    }
}

async fn drain_queue(
    id: SubscriptionId,
    handler: Arc<dyn MessageHandler>,
    mut receiver: mpsc::UnboundedReceiver<AgentMessage>,
    events: EventStream,
    failures: Arc<AtomicU64>,
) {
    while let Some(message) = receiver.recv().await {
        let message_id = message.id;
        let outcome = AssertUnwindSafe(handler.handle(message))
            .catch_unwind()
            .await;

        let failure = match outcome {
            Ok(Ok(())) => continue,
            Ok(Err(e)) => e.to_string(),
            Err(_) => "handler panicked".to_string(),
        };

        failures.fetch_add(1, Ordering::Relaxed);
        let error = OrchestratorError::HandlerFailure {
            subscription: id.to_string(),
            message: failure,
        };
        log::warn!("Message {} not handled: {}", message_id, error);
        events.emit(OrchestratorEvent::Error {
            source: "bus".to_string(),
            code: error.code().to_string(),
            message: error.to_string(),
        });
    }
}
