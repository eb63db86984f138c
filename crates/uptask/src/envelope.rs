//! Task envelope: the CloudEvents v1.0 wire form of a task or event
//!
//! Envelopes travel to and from the broker as structured-mode CloudEvents
//! JSON. Engine-interpreted metadata (retry counters, queue, schedule info)
//! rides in string-valued extension attributes.

use std::collections::BTreeMap;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// CloudEvents spec version emitted by this engine.
pub const SPEC_VERSION: &str = "1.0";

/// Source set on envelopes published by this engine.
pub const SOURCE_UPTASK: &str = "uptask";

/// Source set on envelopes synthesized from broker-originated deliveries.
pub const SOURCE_UPSTASH: &str = "upstash";

/// Content type of the structured envelope body.
pub const CONTENT_TYPE_CLOUDEVENTS: &str = "application/cloudevents+json";

// Extension attribute keys.
pub const TASK_RETRIED_EXT: &str = "taskretried";
pub const TASK_MAX_RETRIES_EXT: &str = "taskmaxretries";
pub const TASK_SNOOZED_EXT: &str = "tasksnoozed";
pub const TASK_QUEUE_EXT: &str = "taskqueue";
pub const TASK_NOT_BEFORE_EXT: &str = "tasknotbefore";
pub const SCHEDULED_TASK_EXT: &str = "scheduledtask";
pub const SCHEDULE_ID_EXT: &str = "scheduleid";
pub const QSTASH_MESSAGE_ID_EXT: &str = "qstashmessageid";

/// The queue used when no explicit queue is requested.
pub const DEFAULT_QUEUE: &str = "default";

/// A CloudEvent carrying typed task arguments and engine extensions.
///
/// The struct serializes to the structured CloudEvents JSON object the
/// broker stores and redelivers. All extension attributes are kept as
/// strings; typed accessors parse on demand.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskEnvelope {
    pub specversion: String,
    pub id: String,
    pub source: String,
    #[serde(rename = "type")]
    pub ty: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub datacontenttype: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(flatten)]
    pub extensions: BTreeMap<String, String>,
}

impl TaskEnvelope {
    /// Create a fresh envelope for a publish: new v4 id, source "uptask",
    /// current time, and a zeroed retry counter.
    pub fn new(kind: &str, data: serde_json::Value) -> Self {
        let mut envelope = Self {
            specversion: SPEC_VERSION.to_string(),
            id: Uuid::new_v4().to_string(),
            source: SOURCE_UPTASK.to_string(),
            ty: kind.to_string(),
            time: Some(Utc::now()),
            datacontenttype: Some(CONTENT_TYPE_CLOUDEVENTS.to_string()),
            data: Some(data),
            extensions: BTreeMap::new(),
        };
        envelope.set_retried(0);
        envelope
    }

    /// The broker-facing path segment for this envelope's kind:
    /// `events/<handler>/<event>` for event deliveries, `tasks/<kind>`
    /// otherwise.
    pub fn kind_path(&self) -> String {
        if self.ty.contains('/') {
            format!("events/{}", self.ty)
        } else {
            format!("tasks/{}", self.ty)
        }
    }

    pub fn extension(&self, key: &str) -> Option<&str> {
        self.extensions.get(key).map(String::as_str)
    }

    pub fn set_extension(&mut self, key: &str, value: impl Into<String>) {
        self.extensions.insert(key.to_string(), value.into());
    }

    fn int_extension(&self, key: &str) -> Option<u32> {
        self.extension(key).and_then(|v| v.parse().ok())
    }

    /// Number of redeliveries already applied to this envelope id.
    pub fn retried(&self) -> u32 {
        self.int_extension(TASK_RETRIED_EXT).unwrap_or(0)
    }

    /// Whether the envelope carries an explicit retried counter (set on
    /// every publish; absent only on foreign envelopes).
    pub fn has_retried(&self) -> bool {
        self.int_extension(TASK_RETRIED_EXT).is_some()
    }

    pub fn set_retried(&mut self, retried: u32) {
        self.set_extension(TASK_RETRIED_EXT, retried.to_string());
    }

    /// The effective retry budget, when known.
    pub fn max_retries(&self) -> Option<u32> {
        self.int_extension(TASK_MAX_RETRIES_EXT)
    }

    pub fn set_max_retries(&mut self, max_retries: u32) {
        self.set_extension(TASK_MAX_RETRIES_EXT, max_retries.to_string());
    }

    /// Number of handler-initiated snoozes. Snoozes are not failures and
    /// are credited back against the retry budget.
    pub fn snoozed(&self) -> u32 {
        self.int_extension(TASK_SNOOZED_EXT).unwrap_or(0)
    }

    pub fn set_snoozed(&mut self, snoozed: u32) {
        self.set_extension(TASK_SNOOZED_EXT, snoozed.to_string());
    }

    /// The queue this envelope routes through ("default" when unset).
    pub fn queue(&self) -> &str {
        match self.extension(TASK_QUEUE_EXT) {
            Some(queue) if !queue.is_empty() => queue,
            _ => DEFAULT_QUEUE,
        }
    }

    pub fn set_queue(&mut self, queue: &str) {
        self.set_extension(TASK_QUEUE_EXT, queue);
    }

    /// Earliest delivery time, when the envelope was scheduled ahead.
    pub fn not_before(&self) -> Option<DateTime<Utc>> {
        let raw = self.extension(TASK_NOT_BEFORE_EXT)?;
        if let Ok(secs) = raw.parse::<i64>() {
            return Utc.timestamp_opt(secs, 0).single();
        }
        raw.parse::<DateTime<Utc>>().ok()
    }

    pub fn set_not_before(&mut self, not_before: DateTime<Utc>) {
        self.set_extension(TASK_NOT_BEFORE_EXT, not_before.timestamp().to_string());
    }

    /// True when the envelope originated from a broker-side schedule and
    /// its id was synthesized from the broker message id.
    pub fn scheduled(&self) -> bool {
        self.extension(SCHEDULED_TASK_EXT)
            .and_then(|v| v.parse().ok())
            .unwrap_or(false)
    }

    pub fn set_scheduled(&mut self, scheduled: bool) {
        self.set_extension(SCHEDULED_TASK_EXT, scheduled.to_string());
    }

    pub fn schedule_id(&self) -> Option<&str> {
        self.extension(SCHEDULE_ID_EXT).filter(|v| !v.is_empty())
    }

    pub fn set_schedule_id(&mut self, schedule_id: &str) {
        self.set_extension(SCHEDULE_ID_EXT, schedule_id);
    }

    pub fn qstash_message_id(&self) -> Option<&str> {
        self.extension(QSTASH_MESSAGE_ID_EXT).filter(|v| !v.is_empty())
    }

    pub fn set_qstash_message_id(&mut self, message_id: &str) {
        self.set_extension(QSTASH_MESSAGE_ID_EXT, message_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_envelope_defaults() {
        let envelope = TaskEnvelope::new("SortTask", serde_json::json!({"n": 3}));

        assert_eq!(envelope.specversion, SPEC_VERSION);
        assert_eq!(envelope.source, SOURCE_UPTASK);
        assert_eq!(envelope.ty, "SortTask");
        assert_eq!(envelope.retried(), 0);
        assert!(envelope.has_retried());
        assert!(!envelope.scheduled());
        assert!(Uuid::parse_str(&envelope.id).is_ok());
    }

    #[test]
    fn test_kind_path() {
        let task = TaskEnvelope::new("SortTask", serde_json::Value::Null);
        assert_eq!(task.kind_path(), "tasks/SortTask");

        let event = TaskEnvelope::new("audit/UserCreated", serde_json::Value::Null);
        assert_eq!(event.kind_path(), "events/audit/UserCreated");
    }

    #[test]
    fn test_queue_defaults() {
        let mut envelope = TaskEnvelope::new("SortTask", serde_json::Value::Null);
        assert_eq!(envelope.queue(), DEFAULT_QUEUE);

        envelope.set_queue("critical");
        assert_eq!(envelope.queue(), "critical");
    }

    #[test]
    fn test_not_before_round_trip() {
        let mut envelope = TaskEnvelope::new("SortTask", serde_json::Value::Null);
        assert!(envelope.not_before().is_none());

        let at = Utc.timestamp_opt(1_900_000_000, 0).unwrap();
        envelope.set_not_before(at);
        assert_eq!(envelope.not_before(), Some(at));
    }

    #[test]
    fn test_counter_accessors() {
        let mut envelope = TaskEnvelope::new("SortTask", serde_json::Value::Null);
        envelope.set_retried(2);
        envelope.set_max_retries(5);
        envelope.set_snoozed(1);

        assert_eq!(envelope.retried(), 2);
        assert_eq!(envelope.max_retries(), Some(5));
        assert_eq!(envelope.snoozed(), 1);
    }

    #[test]
    fn test_extensions_survive_json_round_trip() {
        let mut envelope = TaskEnvelope::new("SortTask", serde_json::json!({"n": 1}));
        envelope.set_max_retries(3);
        envelope.set_schedule_id("sched-1");

        let json = serde_json::to_string(&envelope).unwrap();
        let parsed: TaskEnvelope = serde_json::from_str(&json).unwrap();

        assert_eq!(parsed, envelope);
        assert_eq!(parsed.extension(TASK_MAX_RETRIES_EXT), Some("3"));
        assert_eq!(parsed.schedule_id(), Some("sched-1"));
    }
}
