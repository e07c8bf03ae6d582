//! Distributed-broker executor seam. Submission enqueues a message; completion is observed
//! by an external worker pulling from the same broker. An embedded broker is explicitly out
//! of scope, so only an in-memory channel-backed reference implementation ships here —
//! production deployments supply their own [`BrokerExecutor`].

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use forge_core::model::WorkSpec;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::executor::{Executor, ExternalStatus};

/// A message handed to the broker: the work to perform plus the `external_ref` a consumer
/// should report its outcome against.
#[derive(Debug, Clone)]
pub struct BrokerMessage {
    pub external_ref: String,
    pub spec: WorkSpec,
}

/// The seam a real message-broker integration (SQS, Redis streams, NATS, ...) implements.
#[async_trait]
pub trait BrokerExecutor: Send + Sync {
    async fn enqueue(&self, message: BrokerMessage) -> forge_core::error::Result<()>;
    async fn revoke(&self, external_ref: &str) -> forge_core::error::Result<bool>;
}

enum Slot {
    Queued,
    Completed(serde_json::Value),
    Failed(String),
    Cancelled,
}

/// In-memory reference broker: `enqueue` pushes onto an `mpsc` channel a test consumer can
/// drain via [`InMemoryBroker::receiver`]; outcomes are reported back via
/// [`InMemoryBroker::report_completed`]/[`InMemoryBroker::report_failed`].
pub struct InMemoryBroker {
    sender: mpsc::UnboundedSender<BrokerMessage>,
    receiver: tokio::sync::Mutex<mpsc::UnboundedReceiver<BrokerMessage>>,
    slots: DashMap<String, Slot>,
}

impl InMemoryBroker {
    pub fn new() -> Arc<Self> {
        let (sender, receiver) = mpsc::unbounded_channel();
        Arc::new(Self {
            sender,
            receiver: tokio::sync::Mutex::new(receiver),
            slots: DashMap::new(),
        })
    }

    pub async fn receive(&self) -> Option<BrokerMessage> {
        self.receiver.lock().await.recv().await
    }

    pub fn report_completed(&self, external_ref: &str, result: serde_json::Value) {
        self.slots
            .insert(external_ref.to_string(), Slot::Completed(result));
    }

    pub fn report_failed(&self, external_ref: &str, error: impl Into<String>) {
        self.slots
            .insert(external_ref.to_string(), Slot::Failed(error.into()));
    }
}

#[async_trait]
impl BrokerExecutor for InMemoryBroker {
    async fn enqueue(&self, message: BrokerMessage) -> forge_core::error::Result<()> {
        self.slots
            .insert(message.external_ref.clone(), Slot::Queued);
        self.sender
            .send(message)
            .map_err(|e| forge_core::error::ForgeError::Executor(e.to_string()))
    }

    async fn revoke(&self, external_ref: &str) -> forge_core::error::Result<bool> {
        match self.slots.get(external_ref).map(|s| matches!(s.value(), Slot::Queued)) {
            Some(true) => {
                self.slots.insert(external_ref.to_string(), Slot::Cancelled);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

/// Adapts any [`BrokerExecutor`] to the [`Executor`] protocol.
pub struct DistributedExecutor<B: BrokerExecutor> {
    broker: Arc<B>,
}

impl<B: BrokerExecutor> DistributedExecutor<B> {
    pub fn new(broker: Arc<B>) -> Self {
        Self { broker }
    }
}

#[async_trait]
impl Executor for DistributedExecutor<InMemoryBroker> {
    async fn submit(&self, spec: &WorkSpec) -> forge_core::error::Result<String> {
        let external_ref = Uuid::now_v7().to_string();
        self.broker
            .enqueue(BrokerMessage {
                external_ref: external_ref.clone(),
                spec: spec.clone(),
            })
            .await?;
        Ok(external_ref)
    }

    async fn cancel(&self, external_ref: &str) -> forge_core::error::Result<bool> {
        self.broker.revoke(external_ref).await
    }

    async fn get_status(
        &self,
        external_ref: &str,
    ) -> forge_core::error::Result<Option<ExternalStatus>> {
        Ok(self.broker.slots.get(external_ref).map(|s| match s.value() {
            Slot::Queued => ExternalStatus::Queued,
            Slot::Completed(_) => ExternalStatus::Completed,
            Slot::Failed(_) => ExternalStatus::Failed,
            Slot::Cancelled => ExternalStatus::Cancelled,
        }))
    }

    async fn get_result(
        &self,
        external_ref: &str,
    ) -> forge_core::error::Result<Option<serde_json::Value>> {
        Ok(self.broker.slots.get(external_ref).and_then(|s| match s.value() {
            Slot::Completed(value) => Some(value.clone()),
            _ => None,
        }))
    }

    async fn get_error(&self, external_ref: &str) -> forge_core::error::Result<Option<String>> {
        Ok(self.broker.slots.get(external_ref).and_then(|s| match s.value() {
            Slot::Failed(msg) => Some(msg.clone()),
            _ => None,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use forge_core::model::WorkKind;

    #[tokio::test]
    async fn submit_enqueues_and_consumer_can_report_completion() {
        let broker = InMemoryBroker::new();
        let executor = DistributedExecutor::new(broker.clone());
        let spec = WorkSpec::new(WorkKind::Task, "send_email", serde_json::json!({"to": "a@b.c"}));
        let external_ref = executor.submit(&spec).await.unwrap();

        let message = broker.receive().await.unwrap();
        assert_eq!(message.external_ref, external_ref);

        broker.report_completed(&external_ref, serde_json::json!({"sent": true}));
        assert_eq!(
            executor.get_status(&external_ref).await.unwrap(),
            Some(ExternalStatus::Completed)
        );
    }

    #[tokio::test]
    async fn revoke_before_consumption_cancels() {
        let broker = InMemoryBroker::new();
        let executor = DistributedExecutor::new(broker.clone());
        let spec = WorkSpec::new(WorkKind::Task, "send_email", serde_json::json!({}));
        let external_ref = executor.submit(&spec).await.unwrap();
        assert!(executor.cancel(&external_ref).await.unwrap());
        assert_eq!(
            executor.get_status(&external_ref).await.unwrap(),
            Some(ExternalStatus::Cancelled)
        );
    }
}
