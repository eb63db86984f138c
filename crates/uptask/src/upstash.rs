//! Upstash QStash transport
//!
//! Publishes envelopes through QStash's publish and enqueue endpoints. The
//! broker redelivers to the configured target URL, honoring the retry
//! budget, not-before, and failure-callback headers set here.

use async_trait::async_trait;
use chrono::Utc;
use reqwest::header::CONTENT_TYPE;
use tracing::debug;

use crate::envelope::{TaskEnvelope, CONTENT_TYPE_CLOUDEVENTS};
use crate::opts::InsertOpts;
use crate::transport::{EventMetadata, Transport, TransportError, TransportErrorCode};

/// Production QStash endpoint.
pub const UPSTASH_BASE_URL: &str = "https://qstash.upstash.io";

const RETRIES_HEADER: &str = "Upstash-Retries";
const NOT_BEFORE_HEADER: &str = "Upstash-Not-Before";
const FAILURE_CALLBACK_HEADER: &str = "Upstash-Failure-Callback";

/// Transport backed by the Upstash QStash HTTP API.
#[derive(Debug)]
pub struct UpstashTransport {
    client: reqwest::Client,
    token: String,
    target_url: String,
    base_url: String,
    dlq_url: Option<String>,
}

impl UpstashTransport {
    /// Create a transport publishing to the production broker, targeting
    /// the given application webhook URL.
    pub fn new(
        token: impl Into<String>,
        target_url: impl Into<String>,
    ) -> Result<Self, TransportError> {
        Self::with_base_url(token, target_url, UPSTASH_BASE_URL)
    }

    /// Create a transport against a custom broker endpoint (self-hosted or
    /// test double).
    pub fn with_base_url(
        token: impl Into<String>,
        target_url: impl Into<String>,
        base_url: impl Into<String>,
    ) -> Result<Self, TransportError> {
        let target_url = target_url.into();
        if !has_scheme(&target_url) {
            return Err(TransportError::new(
                TransportErrorCode::InvalidRequest,
                "create transport",
                format!("target url {target_url:?} is missing an http scheme"),
                EventMetadata::default(),
            ));
        }

        let client = reqwest::Client::builder().build().map_err(|err| {
            TransportError::new(
                TransportErrorCode::ClientCreation,
                "create transport",
                err.to_string(),
                EventMetadata::default(),
            )
        })?;

        Ok(Self {
            client,
            token: token.into(),
            target_url: trim_trailing_slash(target_url),
            base_url: trim_trailing_slash(base_url.into()),
            dlq_url: None,
        })
    }

    /// Register a dead-letter callback URL; the broker posts exhausted
    /// envelopes there.
    pub fn with_dlq_url(mut self, dlq_url: impl Into<String>) -> Self {
        self.dlq_url = Some(trim_trailing_slash(dlq_url.into()));
        self
    }

    /// The broker URL an envelope publishes to: the enqueue endpoint when a
    /// named queue is requested, the publish endpoint otherwise.
    fn publish_url(&self, envelope: &TaskEnvelope, opts: &InsertOpts) -> String {
        let kind_path = envelope.kind_path();
        if opts.uses_named_queue() {
            format!(
                "{}/v2/enqueue/{}/{}/{}",
                self.base_url, opts.queue, self.target_url, kind_path
            )
        } else {
            format!("{}/v2/publish/{}/{}", self.base_url, self.target_url, kind_path)
        }
    }
}

#[async_trait]
impl Transport for UpstashTransport {
    async fn send(
        &self,
        envelope: &mut TaskEnvelope,
        opts: &InsertOpts,
    ) -> Result<(), TransportError> {
        let metadata = EventMetadata::from_envelope(envelope);
        let url = self.publish_url(envelope, opts);

        let mut request = self.client.post(&url).bearer_auth(&self.token);

        // Snoozes have already consumed re-enqueues, so the broker only
        // gets the remaining budget.
        let remaining = opts.max_retries.saturating_sub(envelope.snoozed());
        request = request.header(RETRIES_HEADER, remaining.to_string());
        envelope.set_max_retries(opts.max_retries);

        if let Some(scheduled_at) = opts.scheduled_at {
            if scheduled_at < Utc::now() {
                return Err(TransportError::new(
                    TransportErrorCode::InvalidSchedule,
                    "send",
                    format!("scheduled time {scheduled_at} is in the past"),
                    metadata,
                ));
            }
            request = request.header(NOT_BEFORE_HEADER, scheduled_at.timestamp().to_string());
            envelope.set_not_before(scheduled_at);
        }

        if let Some(dlq_url) = &self.dlq_url {
            request = request.header(
                FAILURE_CALLBACK_HEADER,
                format!("{}/{}", dlq_url, envelope.kind_path()),
            );
        }

        if opts.uses_named_queue() {
            envelope.set_queue(&opts.queue);
        }

        let body = serde_json::to_vec(envelope).map_err(|err| {
            TransportError::new(
                TransportErrorCode::TransportCreation,
                "send",
                format!("failed to encode envelope: {err}"),
                metadata.clone(),
            )
        })?;

        debug!(url = %url, task = %envelope.ty, id = %envelope.id, "publishing envelope");

        let response = request
            .header(CONTENT_TYPE, CONTENT_TYPE_CLOUDEVENTS)
            .body(body)
            .send()
            .await
            .map_err(|err| {
                TransportError::new(
                    TransportErrorCode::DeliveryFailed,
                    "send",
                    err.to_string(),
                    metadata.clone(),
                )
            })?;

        let status = response.status();
        if status.as_u16() >= 400 {
            let detail = response.text().await.unwrap_or_default();
            return Err(TransportError::new(
                TransportErrorCode::BadResponse,
                "send",
                format!("broker returned {status}: {detail}"),
                metadata,
            ));
        }

        Ok(())
    }
}

fn has_scheme(url: &str) -> bool {
    url.starts_with("http://") || url.starts_with("https://")
}

fn trim_trailing_slash(mut url: String) -> String {
    while url.ends_with('/') {
        url.pop();
    }
    url
}
