//! Task client: the outbound enqueue path
//!
//! Encodes args into an envelope, runs the send-side middleware chain, and
//! publishes through the transport. When an execution store is attached,
//! every enqueue records a PENDING execution before the send; a failed send
//! best-effort deletes the record again, because the broker is the
//! authoritative side once a publish succeeds.

use std::sync::Arc;

use futures::future::BoxFuture;
use parking_lot::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

use crate::codec;
use crate::envelope::TaskEnvelope;
use crate::error::ServiceError;
use crate::middleware::{apply_middleware, HandlerFn, Middleware};
use crate::opts::{InsertOpts, DEFAULT_MAX_RETRIES};
use crate::store::{TaskExecution, TaskStore};
use crate::task::TaskArgs;
use crate::transport::Transport;

/// Client for enqueueing tasks on the broker.
pub struct TaskClient {
    transport: Arc<dyn Transport>,
    store: Option<Arc<dyn TaskStore>>,
    send_middlewares: RwLock<Vec<Middleware>>,
}

impl TaskClient {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            store: None,
            send_middlewares: RwLock::new(Vec::new()),
        }
    }

    pub fn with_store(transport: Arc<dyn Transport>, store: Arc<dyn TaskStore>) -> Self {
        Self {
            transport,
            store: Some(store),
            send_middlewares: RwLock::new(Vec::new()),
        }
    }

    pub(crate) fn transport(&self) -> Arc<dyn Transport> {
        self.transport.clone()
    }

    pub(crate) fn store(&self) -> Option<Arc<dyn TaskStore>> {
        self.store.clone()
    }

    pub(crate) fn push_send_middleware(&self, middleware: Middleware) {
        self.send_middlewares.write().push(middleware);
    }

    /// Enqueue a task. Returns the envelope id, stable across all retries
    /// of this logical task.
    pub async fn start_task<T: TaskArgs>(
        &self,
        args: &T,
        opts: Option<InsertOpts>,
    ) -> Result<String, ServiceError> {
        let data = args.payload().map_err(codec::CodecError::Encode)?;
        self.enqueue(T::KIND, data, opts).await
    }

    /// Enqueue under an explicit kind string. The fan-out handler uses this
    /// for per-handler event envelopes whose kind is computed at runtime.
    pub(crate) async fn enqueue(
        &self,
        kind: &str,
        data: serde_json::Value,
        opts: Option<InsertOpts>,
    ) -> Result<String, ServiceError> {
        let mut opts = opts.unwrap_or_default();
        if opts.max_retries == 0 {
            opts.max_retries = DEFAULT_MAX_RETRIES;
        }

        let envelope = codec::encode_raw(kind, data.clone());
        let id = envelope.id.clone();
        info!(task = %kind, id = %id, "enqueueing task");

        let record_id = Uuid::parse_str(&id)
            .map_err(|_| codec::CodecError::MalformedEnvelope(format!("invalid envelope id: {id}")))?;

        if let Some(store) = &self.store {
            let mut record = TaskExecution::new(record_id, kind, data);
            record.max_retries = opts.max_retries;
            record.queue = envelope.queue().to_string();
            record.scheduled_at = opts.scheduled_at;
            store.create(record).await?;
        }

        let result = self.send_through_middleware(envelope, &opts).await;

        if let Err(err) = result {
            if let Some(store) = &self.store {
                // The publish never happened; reconcile the optimistic
                // record. Failure here only loses a stale PENDING row.
                if let Err(delete_err) = store.delete(record_id).await {
                    warn!(id = %id, error = %delete_err, "failed to roll back task execution");
                }
            }
            return Err(err);
        }

        Ok(id)
    }

    async fn send_through_middleware(
        &self,
        envelope: TaskEnvelope,
        opts: &InsertOpts,
    ) -> Result<(), ServiceError> {
        let transport = self.transport.clone();
        let opts_for_send = opts.clone();
        let terminal: HandlerFn = Arc::new(
            move |mut envelope: TaskEnvelope| -> BoxFuture<'static, anyhow::Result<()>> {
                let transport = transport.clone();
                let opts = opts_for_send.clone();
                Box::pin(async move {
                    transport.send(&mut envelope, &opts).await?;
                    Ok(())
                })
            },
        );

        let chain = {
            let middlewares = self.send_middlewares.read();
            apply_middleware(&middlewares, terminal)
        };

        chain(envelope).await.map_err(ServiceError::from_dispatch)
    }
}
