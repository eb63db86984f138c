//! Event fan-out
//!
//! Publishing an event enqueues a single fan-out task carrying the list of
//! subscribed handler keys. Once the broker delivers it, the fan-out
//! handler enqueues one per-handler task per subscriber, so every
//! subscriber gets its own at-least-once delivery without the publisher
//! awaiting any of them.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::client::TaskClient;
use crate::task::{Container, TaskArgs, TaskHandler};

/// Reserved kind of the internal fan-out task.
pub const FANOUT_TASK_KIND: &str = "_UptaskFanoutTask";

/// Payload of the internal fan-out task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventFanoutArgs {
    /// Registration keys of the subscribers, `<handler>/<event-kind>` each.
    pub handlers: Vec<String>,
    pub event_type: String,
    pub payload: serde_json::Value,
}

impl TaskArgs for EventFanoutArgs {
    const KIND: &'static str = FANOUT_TASK_KIND;
}

/// Handler behind the reserved fan-out kind. Registered automatically on
/// the first user registration.
pub(crate) struct EventFanoutHandler {
    pub client: Arc<TaskClient>,
}

#[async_trait]
impl TaskHandler<EventFanoutArgs> for EventFanoutHandler {
    async fn process_task(&self, task: Container<EventFanoutArgs>) -> anyhow::Result<()> {
        let mut opts = task.insert_opts.clone();
        // The parent's not-before has already elapsed by the time the
        // fan-out runs; carrying it over would fail every child enqueue.
        if opts.scheduled_at.is_some_and(|at| at <= Utc::now()) {
            opts.scheduled_at = None;
        }

        let dispatches = task.args.handlers.iter().map(|key| {
            let client = self.client.clone();
            let payload = task.args.payload.clone();
            let opts = opts.clone();
            async move {
                client.enqueue(key, payload, Some(opts)).await?;
                anyhow::Ok(())
            }
        });

        // All subscribers or nothing: a failed child fails the fan-out so
        // the broker redelivers it. Subscribers must be idempotent.
        futures::future::try_join_all(dispatches).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fanout_args_round_trip() {
        let args = EventFanoutArgs {
            handlers: vec!["audit/UserCreated".to_string(), "mail/UserCreated".to_string()],
            event_type: "UserCreated".to_string(),
            payload: serde_json::json!({ "id": "u-1" }),
        };

        let json = serde_json::to_value(&args).unwrap();
        let parsed: EventFanoutArgs = serde_json::from_value(json).unwrap();
        assert_eq!(parsed.handlers.len(), 2);
        assert_eq!(parsed.event_type, "UserCreated");
        assert_eq!(EventFanoutArgs::KIND, "_UptaskFanoutTask");
    }
}
