//! Envelope codec: typed args to and from the CloudEvents wire form
//!
//! Encoding produces a fresh envelope from task args. Decoding parses an
//! inbound broker delivery (webhook POST or dead-letter callback) and merges
//! the broker's per-delivery metadata into the envelope extensions.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::envelope::{TaskEnvelope, SOURCE_UPSTASH};
use crate::task::TaskArgs;

/// Errors from envelope encoding and decoding.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// The inbound request could not be parsed as a valid envelope.
    #[error("malformed envelope: {0}")]
    MalformedEnvelope(String),

    /// Task args could not be serialized into the envelope data.
    #[error("failed to encode task args: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Per-delivery metadata the broker attaches to an inbound envelope,
/// extracted from the webhook headers or the DLQ callback fields.
#[derive(Debug, Clone, Default)]
pub struct BrokerDelivery {
    pub message_id: Option<String>,
    pub retried: u32,
    pub max_retries: Option<u32>,
    pub schedule_id: Option<String>,
}

/// The broker's dead-letter callback body.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DlqCallback {
    source_body: String,
    source_message_id: String,
    #[serde(default)]
    schedule_id: Option<String>,
    #[serde(default)]
    retried: u32,
    #[serde(default)]
    max_retries: Option<u32>,
}

/// Encode typed task args into a fresh envelope.
pub fn encode<T: TaskArgs>(args: &T) -> Result<TaskEnvelope, CodecError> {
    Ok(encode_raw(T::KIND, args.payload()?))
}

/// Encode a pre-serialized payload under an explicit kind. Used for
/// per-handler event envelopes, whose kind is computed at runtime.
pub fn encode_raw(kind: &str, data: serde_json::Value) -> TaskEnvelope {
    TaskEnvelope::new(kind, data)
}

/// Decode an inbound webhook delivery: parse the structured CloudEvent body
/// and merge the broker's delivery metadata.
pub fn decode(body: &[u8], delivery: &BrokerDelivery) -> Result<TaskEnvelope, CodecError> {
    let mut envelope: TaskEnvelope = serde_json::from_slice(body)
        .map_err(|err| CodecError::MalformedEnvelope(err.to_string()))?;
    apply_delivery(&mut envelope, delivery)?;
    Ok(envelope)
}

/// Decode a dead-letter callback: unwrap the base64 outer envelope, then
/// apply the same metadata merge using the callback fields.
pub fn decode_dlq(body: &[u8]) -> Result<TaskEnvelope, CodecError> {
    let callback: DlqCallback = serde_json::from_slice(body)
        .map_err(|err| CodecError::MalformedEnvelope(format!("invalid dlq callback: {err}")))?;

    let raw = BASE64
        .decode(&callback.source_body)
        .map_err(|err| CodecError::MalformedEnvelope(format!("invalid dlq source body: {err}")))?;
    let mut envelope: TaskEnvelope = serde_json::from_slice(&raw)
        .map_err(|err| CodecError::MalformedEnvelope(err.to_string()))?;

    apply_delivery(
        &mut envelope,
        &BrokerDelivery {
            message_id: Some(callback.source_message_id),
            retried: callback.retried,
            max_retries: callback.max_retries,
            schedule_id: callback.schedule_id,
        },
    )?;
    Ok(envelope)
}

/// Synthesize a stable envelope id from a broker message id. Scheduled
/// deliveries arrive with a nil id; hashing the message id keeps the
/// synthesized id identical across retries of the same message.
pub fn stable_id(message_id: &str) -> Uuid {
    let digest = Sha256::digest(message_id.as_bytes());
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&digest[..16]);
    Uuid::from_bytes(bytes)
}

fn apply_delivery(
    envelope: &mut TaskEnvelope,
    delivery: &BrokerDelivery,
) -> Result<(), CodecError> {
    let id = Uuid::parse_str(&envelope.id)
        .map_err(|_| CodecError::MalformedEnvelope(format!("invalid envelope id: {}", envelope.id)))?;

    let mut scheduled = false;
    if id.is_nil() {
        let message_id = delivery.message_id.as_deref().ok_or_else(|| {
            CodecError::MalformedEnvelope("nil envelope id without a broker message id".to_string())
        })?;
        envelope.id = stable_id(message_id).to_string();
        envelope.source = SOURCE_UPSTASH.to_string();
        scheduled = true;
    }

    if let Some(schedule_id) = &delivery.schedule_id {
        envelope.set_schedule_id(schedule_id);
    }
    if let Some(message_id) = &delivery.message_id {
        envelope.set_qstash_message_id(message_id);
    }
    envelope.set_scheduled(scheduled);

    // A preexisting counter marks a snooze re-enqueue; the broker's count
    // only covers redeliveries of the current message, so the two add up.
    let effective = if envelope.has_retried() {
        envelope.retried() + delivery.retried
    } else {
        delivery.retried
    };
    envelope.set_retried(effective);

    // The outbound header carried max_retries - snoozed (the broker's
    // remaining budget); reconstruct the effective budget on the way in.
    if let Some(budget) = delivery.max_retries {
        envelope.set_max_retries(budget + envelope.snoozed());
    }

    Ok(())
}
