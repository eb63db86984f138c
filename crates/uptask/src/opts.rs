//! Enqueue options
//!
//! Caller-supplied hints bundled with an enqueue request. On the inbound
//! side the same structure is reconstructed from envelope extensions.

use chrono::{DateTime, Utc};

use crate::envelope::{TaskEnvelope, DEFAULT_QUEUE};

/// Default retry budget applied when the caller leaves it unset.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Options for a single enqueue.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InsertOpts {
    /// Retry budget. Zero means unset and is normalized to
    /// [`DEFAULT_MAX_RETRIES`] at enqueue.
    pub max_retries: u32,

    /// Named queue to route through. Empty or "default" publishes directly.
    pub queue: String,

    /// Earliest delivery time. Must not be in the past.
    pub scheduled_at: Option<DateTime<Utc>>,

    /// Free-form tags, carried for the caller's bookkeeping.
    pub tags: Vec<String>,
}

impl InsertOpts {
    /// Reconstruct the options an envelope was enqueued with from its
    /// extension attributes.
    pub fn from_envelope(envelope: &TaskEnvelope) -> Self {
        Self {
            max_retries: envelope.max_retries().unwrap_or(0),
            queue: envelope.queue().to_string(),
            scheduled_at: envelope.not_before(),
            tags: Vec::new(),
        }
    }

    /// Whether the options route through a named queue rather than the
    /// direct publish endpoint.
    pub fn uses_named_queue(&self) -> bool {
        !self.queue.is_empty() && self.queue != DEFAULT_QUEUE
    }
}
