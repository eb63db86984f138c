//! Typed task surface: args, containers, and handler traits
//!
//! A task is described by a serializable args struct with a declared kind.
//! Handlers receive a typed [`Container`] reconstructed from the inbound
//! envelope; registration erases the type so the dispatch pipeline can route
//! on the kind string alone.

use std::future::Future;
use std::marker::PhantomData;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use uuid::Uuid;

use crate::codec::CodecError;
use crate::envelope::TaskEnvelope;
use crate::opts::InsertOpts;

/// Arguments for a task. The kind uniquely identifies the task's shape and
/// is the routing key for dispatch.
pub trait TaskArgs: Serialize + DeserializeOwned + Send + Sync + 'static {
    const KIND: &'static str;

    /// The value JSON-encoded into the envelope data. Defaults to the args
    /// themselves; override to publish a different wire shape.
    fn payload(&self) -> serde_json::Result<serde_json::Value> {
        serde_json::to_value(self)
    }
}

/// Per-kind bound on handler execution time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TaskTimeout {
    /// Inherit the service-level default.
    #[default]
    ServiceDefault,

    /// Never time out.
    Unbounded,

    /// Cancel the handler after this long.
    After(Duration),
}

/// Typed view of one inbound delivery, handed to the user handler.
#[derive(Debug, Clone)]
pub struct Container<T> {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    /// Redeliveries already applied to this id (broker retries plus snooze
    /// re-enqueues).
    pub retried: u32,
    /// Handler-initiated snoozes so far.
    pub snoozed: u32,
    /// True when the delivery originated from a broker-side schedule.
    pub scheduled: bool,
    pub queue: String,
    pub schedule_id: Option<String>,
    pub qstash_message_id: Option<String>,
    pub insert_opts: InsertOpts,
    pub args: T,
}

impl<T: DeserializeOwned> Container<T> {
    /// Reconstruct the typed container from a decoded envelope.
    pub fn from_envelope(envelope: &TaskEnvelope) -> Result<Self, CodecError> {
        let id = Uuid::parse_str(&envelope.id).map_err(|_| {
            CodecError::MalformedEnvelope(format!("invalid envelope id: {}", envelope.id))
        })?;
        let data = envelope.data.clone().unwrap_or(serde_json::Value::Null);
        let args: T = serde_json::from_value(data).map_err(|err| {
            CodecError::MalformedEnvelope(format!(
                "invalid task args for {}: {err}",
                envelope.ty
            ))
        })?;

        Ok(Self {
            id,
            created_at: envelope.time.unwrap_or_else(Utc::now),
            retried: envelope.retried(),
            snoozed: envelope.snoozed(),
            scheduled: envelope.scheduled(),
            queue: envelope.queue().to_string(),
            schedule_id: envelope.schedule_id().map(str::to_string),
            qstash_message_id: envelope.qstash_message_id().map(str::to_string),
            insert_opts: InsertOpts::from_envelope(envelope),
            args,
        })
    }
}

/// A handler for tasks of one kind.
///
/// Handlers must be idempotent: the broker gives at-least-once delivery and
/// the engine does not deduplicate concurrent deliveries of the same id.
/// Return `Ok(())` on success, the value of [`crate::snooze`] to re-enqueue
/// with a delay, or any other error to fail the attempt and let the broker
/// retry while budget remains.
#[async_trait]
pub trait TaskHandler<T: TaskArgs>: Send + Sync {
    /// Bound on each invocation. Dropping the handler future is the only
    /// cancellation mechanism, so long-running handlers should reach await
    /// points regularly.
    fn timeout(&self, _task: &Container<T>) -> TaskTimeout {
        TaskTimeout::ServiceDefault
    }

    async fn process_task(&self, task: Container<T>) -> anyhow::Result<()>;
}

/// A named subscriber for events of one kind. Registering the same event
/// kind under several handler names yields one delivery per name.
#[async_trait]
pub trait EventHandler<E: TaskArgs>: Send + Sync {
    fn timeout(&self, _event: &Container<E>) -> TaskTimeout {
        TaskTimeout::ServiceDefault
    }

    async fn process_event(&self, event: Container<E>) -> anyhow::Result<()>;
}

/// Adapter that runs an [`EventHandler`] as the task handler behind its
/// per-name registration key.
pub(crate) struct EventHandlerAdapter<E, H> {
    pub handler: H,
    pub _marker: PhantomData<fn(E)>,
}

#[async_trait]
impl<E, H> TaskHandler<E> for EventHandlerAdapter<E, H>
where
    E: TaskArgs,
    H: EventHandler<E>,
{
    fn timeout(&self, event: &Container<E>) -> TaskTimeout {
        self.handler.timeout(event)
    }

    async fn process_task(&self, task: Container<E>) -> anyhow::Result<()> {
        self.handler.process_event(task).await
    }
}

/// Wrap an async function as a [`TaskHandler`].
///
/// ```ignore
/// service.register_task(TaskFuncHandler::new(|task: Container<SortArgs>| async move {
///     println!("{:?}", task.args);
///     Ok(())
/// }))?;
/// ```
pub struct TaskFuncHandler<T, F> {
    f: F,
    _marker: PhantomData<fn(T)>,
}

impl<T, F, Fut> TaskFuncHandler<T, F>
where
    T: TaskArgs,
    F: Fn(Container<T>) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    pub fn new(f: F) -> Self {
        Self {
            f,
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<T, F, Fut> TaskHandler<T> for TaskFuncHandler<T, F>
where
    T: TaskArgs,
    F: Fn(Container<T>) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    async fn process_task(&self, task: Container<T>) -> anyhow::Result<()> {
        (self.f)(task).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct SleepArgs {
        millis: u64,
    }

    impl TaskArgs for SleepArgs {
        const KIND: &'static str = "SleepTask";
    }

    #[test]
    fn test_container_from_envelope() {
        let mut envelope = TaskEnvelope::new("SleepTask", serde_json::json!({ "millis": 10 }));
        envelope.set_retried(1);
        envelope.set_max_retries(3);
        envelope.set_snoozed(1);

        let container: Container<SleepArgs> = Container::from_envelope(&envelope).unwrap();
        assert_eq!(container.args.millis, 10);
        assert_eq!(container.retried, 1);
        assert_eq!(container.snoozed, 1);
        assert_eq!(container.insert_opts.max_retries, 3);
        assert!(!container.scheduled);
    }

    #[test]
    fn test_container_rejects_mismatched_args() {
        let envelope = TaskEnvelope::new("SleepTask", serde_json::json!({ "wrong": true }));
        let result: Result<Container<SleepArgs>, _> = Container::from_envelope(&envelope);
        assert!(matches!(result, Err(CodecError::MalformedEnvelope(_))));
    }

    #[tokio::test]
    async fn test_func_handler_invokes_closure() {
        let handler = TaskFuncHandler::new(|task: Container<SleepArgs>| async move {
            anyhow::ensure!(task.args.millis == 10, "unexpected args");
            Ok(())
        });

        let envelope = TaskEnvelope::new("SleepTask", serde_json::json!({ "millis": 10 }));
        let container = Container::from_envelope(&envelope).unwrap();
        handler.process_task(container).await.unwrap();
    }
}
