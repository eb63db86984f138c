//! Task service: handler registry and dispatch pipeline
//!
//! The service owns the registration-key -> dispatch-closure map, builds
//! the per-handler pipeline (store bookkeeping, timeout enforcement,
//! return-value interpretation), and routes inbound envelopes. The registry
//! is write-once: registration locks middleware changes, the first inbound
//! dispatch locks registration.

use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use futures::future::BoxFuture;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use tracing::{debug, info, warn};

use crate::client::TaskClient;
use crate::codec::CodecError;
use crate::envelope::TaskEnvelope;
use crate::error::ServiceError;
use crate::fanout::{EventFanoutArgs, EventFanoutHandler, FANOUT_TASK_KIND};
use crate::middleware::{apply_middleware, HandlerFn, Middleware};
use crate::opts::{InsertOpts, DEFAULT_MAX_RETRIES};
use crate::snooze::{snooze_middleware, SnoozeSignal};
use crate::store::{ExecutionError, TaskExecution, TaskStatus, TaskStore};
use crate::task::{Container, EventHandler, EventHandlerAdapter, TaskArgs, TaskHandler, TaskTimeout};

/// Service-level tunables.
#[derive(Debug, Clone)]
pub struct TaskServiceConfig {
    /// Handler timeout applied when a handler declares
    /// [`TaskTimeout::ServiceDefault`].
    pub default_timeout: Duration,
}

impl Default for TaskServiceConfig {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(60 * 60),
        }
    }
}

/// Registry of task and event handlers plus the dispatch pipeline that
/// drives them.
pub struct TaskService {
    client: Arc<TaskClient>,
    store: Option<Arc<dyn TaskStore>>,
    config: TaskServiceConfig,
    handlers: RwLock<HashMap<String, HandlerFn>>,
    middlewares: Mutex<Vec<Middleware>>,
    handlers_added: AtomicBool,
    system_handlers_added: AtomicBool,
    dispatch_started: AtomicBool,
}

impl TaskService {
    pub fn new(transport: Arc<dyn crate::transport::Transport>) -> Self {
        Self::build(Arc::new(TaskClient::new(transport)), None)
    }

    /// A service with an execution store: every delivery is tracked through
    /// PENDING -> RUNNING -> {SUCCESS, FAILED}.
    pub fn with_store(
        transport: Arc<dyn crate::transport::Transport>,
        store: Arc<dyn TaskStore>,
    ) -> Self {
        Self::build(
            Arc::new(TaskClient::with_store(transport, store.clone())),
            Some(store),
        )
    }

    pub fn with_config(mut self, config: TaskServiceConfig) -> Self {
        self.config = config;
        self
    }

    fn build(client: Arc<TaskClient>, store: Option<Arc<dyn TaskStore>>) -> Self {
        Self {
            client,
            store,
            config: TaskServiceConfig::default(),
            handlers: RwLock::new(HashMap::new()),
            middlewares: Mutex::new(Vec::new()),
            handlers_added: AtomicBool::new(false),
            system_handlers_added: AtomicBool::new(false),
            dispatch_started: AtomicBool::new(false),
        }
    }

    /// The client used for enqueues, shared with the fan-out handler.
    pub fn client(&self) -> &Arc<TaskClient> {
        &self.client
    }

    // =========================================================================
    // Registration
    // =========================================================================

    /// Register a task handler under its args' kind.
    pub fn register_task<T, H>(&self, handler: H) -> Result<(), ServiceError>
    where
        T: TaskArgs,
        H: TaskHandler<T> + 'static,
    {
        self.register_with_key(T::KIND.to_string(), Arc::new(handler))
    }

    /// Register an event handler under `<handler_name>/<event-kind>`.
    /// Distinct names subscribe independently: each receives its own
    /// delivery of every published event of this kind.
    pub fn register_event<E, H>(&self, handler_name: &str, handler: H) -> Result<(), ServiceError>
    where
        E: TaskArgs,
        H: EventHandler<E> + 'static,
    {
        let key = format!("{handler_name}/{}", E::KIND);
        let adapter: Arc<dyn TaskHandler<E>> = Arc::new(EventHandlerAdapter {
            handler,
            _marker: PhantomData,
        });
        self.register_with_key(key, adapter)
    }

    /// Install inbound middleware, first registered outermost. Rejected
    /// once any handler is registered.
    pub fn use_middleware(&self, middleware: Middleware) -> Result<(), ServiceError> {
        if self.handlers_added.load(Ordering::SeqCst) {
            return Err(ServiceError::RegistrationLocked(
                "cannot add middleware after handlers are registered",
            ));
        }
        self.middlewares.lock().push(middleware);
        Ok(())
    }

    /// Install send-side middleware wrapping the client's publish path.
    /// Rejected once any handler is registered.
    pub fn use_send_middleware(&self, middleware: Middleware) -> Result<(), ServiceError> {
        if self.handlers_added.load(Ordering::SeqCst) {
            return Err(ServiceError::RegistrationLocked(
                "cannot add middleware after handlers are registered",
            ));
        }
        self.client.push_send_middleware(middleware);
        Ok(())
    }

    /// Whether a handler is registered for the given type string.
    pub fn has_handler(&self, ty: &str) -> bool {
        self.handlers.read().contains_key(ty)
    }

    fn register_with_key<T: TaskArgs>(
        &self,
        key: String,
        handler: Arc<dyn TaskHandler<T>>,
    ) -> Result<(), ServiceError> {
        if key.is_empty() || key.starts_with('/') {
            return Err(ServiceError::InvalidRegistration(key));
        }
        self.ensure_fanout_registered()?;
        let dispatch = self.build_dispatch(key.clone(), handler);
        self.insert_handler(key, dispatch)
    }

    /// The fan-out handler rides along with the first user registration so
    /// publish_event works without explicit setup.
    fn ensure_fanout_registered(&self) -> Result<(), ServiceError> {
        if self.system_handlers_added.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let handler: Arc<dyn TaskHandler<EventFanoutArgs>> = Arc::new(EventFanoutHandler {
            client: self.client.clone(),
        });
        let dispatch = self.build_dispatch(FANOUT_TASK_KIND.to_string(), handler);
        self.insert_handler(FANOUT_TASK_KIND.to_string(), dispatch)
    }

    fn insert_handler(&self, key: String, dispatch: HandlerFn) -> Result<(), ServiceError> {
        if self.dispatch_started.load(Ordering::SeqCst) {
            return Err(ServiceError::RegistrationLocked(
                "cannot register handlers after dispatch has started",
            ));
        }
        let mut handlers = self.handlers.write();
        if handlers.contains_key(&key) {
            return Err(ServiceError::AlreadyRegistered(key));
        }
        handlers.insert(key.clone(), dispatch);
        drop(handlers);
        self.handlers_added.store(true, Ordering::SeqCst);
        info!(kind = %key, "task handler registered");
        Ok(())
    }

    // =========================================================================
    // Dispatch
    // =========================================================================

    /// Route one inbound envelope to its registered handler and drive the
    /// pipeline. The first call permanently locks registration.
    pub async fn handle_event(&self, envelope: TaskEnvelope) -> Result<(), ServiceError> {
        self.dispatch_started.store(true, Ordering::SeqCst);
        debug!(ty = %envelope.ty, source = %envelope.source, id = %envelope.id, "handling event");

        let handler = self.handlers.read().get(&envelope.ty).cloned();
        let Some(handler) = handler else {
            return Err(ServiceError::NoHandlerRegistered(envelope.ty));
        };
        handler(envelope).await.map_err(ServiceError::from_dispatch)
    }

    /// Enqueue a task on the broker.
    pub async fn start_task<T: TaskArgs>(
        &self,
        args: &T,
        opts: Option<InsertOpts>,
    ) -> Result<String, ServiceError> {
        self.client.start_task(args, opts).await
    }

    /// Publish an event to every handler registered for its kind, via a
    /// single durable fan-out task. Fails when no local handler subscribes.
    pub async fn publish_event<E: TaskArgs>(
        &self,
        event: &E,
        opts: Option<InsertOpts>,
    ) -> Result<String, ServiceError> {
        let mut handlers: Vec<String> = self
            .handlers
            .read()
            .keys()
            .filter(|key| {
                key.split_once('/')
                    .is_some_and(|(_, kind)| kind == E::KIND)
            })
            .cloned()
            .collect();
        if handlers.is_empty() {
            return Err(ServiceError::NoHandlerRegistered(E::KIND.to_string()));
        }
        handlers.sort();

        let args = EventFanoutArgs {
            handlers,
            event_type: E::KIND.to_string(),
            payload: event.payload().map_err(CodecError::Encode)?,
        };
        self.client.start_task(&args, opts).await
    }

    /// Build the type-erased pipeline closure for one registration: store
    /// bookkeeping around the user handler, wrapped by the snooze layer and
    /// the installed middleware.
    fn build_dispatch<T: TaskArgs>(
        &self,
        kind: String,
        handler: Arc<dyn TaskHandler<T>>,
    ) -> HandlerFn {
        let store = self.store.clone();
        let default_timeout = self.config.default_timeout;

        let base: HandlerFn = Arc::new(move |envelope: TaskEnvelope| -> BoxFuture<'static, anyhow::Result<()>> {
            let handler = handler.clone();
            let store = store.clone();
            let kind = kind.clone();
            Box::pin(async move {
                let container = Container::<T>::from_envelope(&envelope)?;
                let mut insert_opts = container.insert_opts.clone();
                let id = container.id;
                let retried = container.retried;

                if let Some(store) = &store {
                    let exists = store.exists(id).await.unwrap_or(false);
                    // Schedule-triggered first deliveries have no record
                    // from an enqueue; create one now.
                    if container.scheduled && !exists {
                        if insert_opts.max_retries == 0 {
                            warn!(kind = %kind, id = %id, "max retries not set, defaulting to 3");
                            insert_opts.max_retries = DEFAULT_MAX_RETRIES;
                        }
                        debug!(kind = %kind, id = %id, "creating task execution from scheduled delivery");
                        let mut record = TaskExecution::new(
                            id,
                            envelope.ty.clone(),
                            envelope.data.clone().unwrap_or(serde_json::Value::Null),
                        );
                        record.max_retries = insert_opts.max_retries;
                        record.qstash_message_id = container.qstash_message_id.clone();
                        record.schedule_id = container.schedule_id.clone();
                        record.scheduled_at = insert_opts.scheduled_at;
                        record.queue = container.queue.clone();
                        store
                            .create(record)
                            .await
                            .context("failed to create task execution")?;
                    }

                    store
                        .update_status(id, TaskStatus::Running)
                        .await
                        .context("failed to update task execution")?;
                }

                info!(
                    kind = %kind,
                    id = %id,
                    retried,
                    max_retries = insert_opts.max_retries,
                    "processing task"
                );

                let timeout = handler.timeout(&container);
                let result = match resolve_timeout(timeout, default_timeout) {
                    Some(limit) => match tokio::time::timeout(limit, handler.process_task(container)).await {
                        Ok(result) => result,
                        Err(_) => Err(anyhow::anyhow!("task timed out after {limit:?}")),
                    },
                    None => handler.process_task(container).await,
                };

                let err = match result {
                    Ok(()) => {
                        if let Some(store) = &store {
                            store
                                .update_status(id, TaskStatus::Success)
                                .await
                                .context("failed to update task status")?;
                        }
                        return Ok(());
                    }
                    Err(err) => err,
                };

                // Snoozes bubble up untouched for the snooze layer; they
                // are not failures and leave no trace in the error log.
                if err.downcast_ref::<SnoozeSignal>().is_some() {
                    return Err(err);
                }

                if let Some(store) = &store {
                    store
                        .add_error(id, ExecutionError::new(format!("{err:#}")))
                        .await
                        .context("failed to add task error")?;
                    let new_status =
                        if insert_opts.max_retries > 0 && retried < insert_opts.max_retries {
                            TaskStatus::Pending
                        } else {
                            TaskStatus::Failed
                        };
                    store
                        .update_status(id, new_status)
                        .await
                        .context("failed to update task status")?;
                }

                Err(err.context(format!("failed to process task {kind}")))
            })
        });

        let snoozed = snooze_middleware(self.client.transport(), self.client.store())(base);
        let middlewares = self.middlewares.lock();
        apply_middleware(&middlewares, snoozed)
    }
}

fn resolve_timeout(timeout: TaskTimeout, default: Duration) -> Option<Duration> {
    match timeout {
        TaskTimeout::ServiceDefault => Some(default),
        TaskTimeout::Unbounded => None,
        TaskTimeout::After(limit) => Some(limit),
    }
}
