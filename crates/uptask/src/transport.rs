//! Transport: publishing envelopes to the broker
//!
//! The engine never talks to the broker directly; everything outbound goes
//! through the [`Transport`] trait so tests and alternative brokers can
//! swap in their own delivery.

use async_trait::async_trait;

use crate::envelope::TaskEnvelope;
use crate::opts::InsertOpts;

/// Classifies a failed publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorCode {
    /// The target URL is unusable (e.g. missing a scheme).
    InvalidRequest,

    /// The outbound request could not be constructed.
    TransportCreation,

    /// The HTTP client could not be built.
    ClientCreation,

    /// The broker was unreachable.
    DeliveryFailed,

    /// The requested delivery time is in the past.
    InvalidSchedule,

    /// The broker answered with a failure status.
    BadResponse,
}

/// Envelope metadata attached to transport errors for diagnostics.
#[derive(Debug, Clone, Default)]
pub struct EventMetadata {
    pub kind: String,
    pub id: String,
    pub retried: u32,
    pub max_retries: u32,
    pub schedule_id: Option<String>,
    pub qstash_message_id: Option<String>,
}

impl EventMetadata {
    pub fn from_envelope(envelope: &TaskEnvelope) -> Self {
        Self {
            kind: envelope.ty.clone(),
            id: envelope.id.clone(),
            retried: envelope.retried(),
            max_retries: envelope.max_retries().unwrap_or(0),
            schedule_id: envelope.schedule_id().map(str::to_string),
            qstash_message_id: envelope.qstash_message_id().map(str::to_string),
        }
    }
}

/// A failure to publish to the broker.
#[derive(Debug, thiserror::Error)]
#[error("{op}: {code:?}: {message} (task {kind} {id}, attempt {retried}/{max_retries})",
    kind = .metadata.kind,
    id = .metadata.id,
    retried = .metadata.retried,
    max_retries = .metadata.max_retries,
)]
pub struct TransportError {
    pub code: TransportErrorCode,
    pub op: &'static str,
    pub message: String,
    pub metadata: EventMetadata,
}

impl TransportError {
    pub fn new(
        code: TransportErrorCode,
        op: &'static str,
        message: impl Into<String>,
        metadata: EventMetadata,
    ) -> Self {
        Self {
            code,
            op,
            message: message.into(),
            metadata,
        }
    }
}

/// Publishes one envelope to the broker, applying the enqueue options as
/// broker headers. Implementations update the envelope's budget and
/// schedule extensions in place before the send.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn send(
        &self,
        envelope: &mut TaskEnvelope,
        opts: &InsertOpts,
    ) -> Result<(), TransportError>;
}
