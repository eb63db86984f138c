//! Broker simulator for the scenario tests
//!
//! Stands in for the external queue: accepts publishes through a loopback
//! transport, then redelivers them to the service the way the broker's
//! webhook would, honoring not-before times and the retry budget, and
//! producing the dead-letter callback body when the budget exhausts.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use uptask::codec::{self, BrokerDelivery};
use uptask::transport::{EventMetadata, Transport, TransportError, TransportErrorCode};
use uptask::{InsertOpts, TaskEnvelope, TaskService};

/// One message accepted by the simulated broker.
#[derive(Debug, Clone)]
pub struct BrokerMessage {
    pub message_id: String,
    pub envelope: TaskEnvelope,
    /// Value of the Upstash-Retries header the publisher sent.
    pub retries: u32,
    pub not_before: Option<DateTime<Utc>>,
    pub queue: String,
}

/// In-memory double for the queue side of the broker.
#[derive(Default)]
pub struct MemoryBroker {
    queue: Mutex<VecDeque<BrokerMessage>>,
    history: Mutex<Vec<BrokerMessage>>,
    dlq: Mutex<Vec<Vec<u8>>>,
    sequence: AtomicU64,
}

impl MemoryBroker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push(&self, message: BrokerMessage) {
        self.history.lock().push(message.clone());
        self.queue.lock().push_back(message);
    }

    pub fn pop(&self) -> Option<BrokerMessage> {
        self.queue.lock().pop_front()
    }

    /// Every message ever accepted, publish order.
    pub fn published(&self) -> Vec<BrokerMessage> {
        self.history.lock().clone()
    }

    /// Dead-letter callback bodies produced by exhausted messages.
    pub fn dlq_bodies(&self) -> Vec<Vec<u8>> {
        self.dlq.lock().clone()
    }

    fn next_message_id(&self) -> String {
        format!("msg-{}", self.sequence.fetch_add(1, Ordering::SeqCst))
    }

    /// Inject a broker-originated scheduled delivery: a nil-id envelope
    /// tied to a broker message id, the shape schedule triggers produce.
    pub fn push_scheduled(&self, kind: &str, data: serde_json::Value, message_id: &str) {
        let mut envelope = TaskEnvelope::new(kind, data);
        envelope.id = uuid::Uuid::nil().to_string();
        self.push(BrokerMessage {
            message_id: message_id.to_string(),
            envelope,
            retries: 3,
            not_before: None,
            queue: String::new(),
        });
    }

    fn push_dlq(&self, message: &BrokerMessage, retried: u32) {
        let inner = serde_json::to_vec(&message.envelope).expect("envelope must serialize");
        let callback = serde_json::json!({
            "sourceBody": BASE64.encode(inner),
            "sourceMessageId": message.message_id,
            "retried": retried,
            "maxRetries": message.retries,
        });
        self.dlq
            .lock()
            .push(serde_json::to_vec(&callback).expect("callback must serialize"));
    }
}

/// Transport that publishes into the [`MemoryBroker`].
pub struct LoopbackTransport {
    broker: Arc<MemoryBroker>,
}

impl LoopbackTransport {
    pub fn new(broker: Arc<MemoryBroker>) -> Arc<Self> {
        Arc::new(Self { broker })
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn send(
        &self,
        envelope: &mut TaskEnvelope,
        opts: &InsertOpts,
    ) -> Result<(), TransportError> {
        if let Some(scheduled_at) = opts.scheduled_at {
            if scheduled_at < Utc::now() {
                return Err(TransportError::new(
                    TransportErrorCode::InvalidSchedule,
                    "send",
                    format!("scheduled time {scheduled_at} is in the past"),
                    EventMetadata::from_envelope(envelope),
                ));
            }
            envelope.set_not_before(scheduled_at);
        }
        envelope.set_max_retries(opts.max_retries);

        let retries = opts.max_retries.saturating_sub(envelope.snoozed());
        self.broker.push(BrokerMessage {
            message_id: self.broker.next_message_id(),
            envelope: envelope.clone(),
            retries,
            not_before: opts.scheduled_at,
            queue: opts.queue.clone(),
        });
        Ok(())
    }
}

/// Transport that refuses every publish, for rollback tests.
pub struct FailingTransport;

#[async_trait]
impl Transport for FailingTransport {
    async fn send(
        &self,
        envelope: &mut TaskEnvelope,
        _opts: &InsertOpts,
    ) -> Result<(), TransportError> {
        Err(TransportError::new(
            TransportErrorCode::DeliveryFailed,
            "send",
            "broker unreachable",
            EventMetadata::from_envelope(envelope),
        ))
    }
}

/// Deliver queued messages to the service until the queue drains,
/// redelivering failed attempts while budget remains and dead-lettering
/// exhausted messages.
pub async fn drive(service: &TaskService, broker: &MemoryBroker) {
    while let Some(message) = broker.pop() {
        if let Some(not_before) = message.not_before {
            let wait = (not_before - Utc::now()).to_std().unwrap_or_default();
            tokio::time::sleep(wait).await;
        }

        let body = serde_json::to_vec(&message.envelope).expect("envelope must serialize");
        let mut attempt = 0u32;
        loop {
            let delivery = BrokerDelivery {
                message_id: Some(message.message_id.clone()),
                retried: attempt,
                max_retries: Some(message.retries),
                schedule_id: None,
            };
            let envelope = codec::decode(&body, &delivery).expect("redelivery must decode");

            match service.handle_event(envelope).await {
                Ok(()) => break,
                Err(_) if attempt < message.retries => attempt += 1,
                Err(_) => {
                    broker.push_dlq(&message, attempt);
                    break;
                }
            }
        }
    }
}
