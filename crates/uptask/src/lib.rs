//! # uptask
//!
//! Typed task and event dispatch layered on an HTTP delay/retry broker
//! (Upstash QStash). Applications register typed handlers, enqueue tasks or
//! publish events, and receive webhook callbacks with structured retry,
//! snooze, and failure behavior.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        TaskService                          │
//! │   (handler registry, dispatch pipeline, snooze control)     │
//! └─────────────────────────────────────────────────────────────┘
//!                │                                ▲
//!                ▼                                │ webhook POST
//! ┌──────────────────────────────┐   ┌──────────────────────────┐
//! │          TaskClient          │   │          Broker          │
//! │  (encode, publish via        ├──►│  (delay, retry budget,   │
//! │   UpstashTransport)          │   │   queues, DLQ callback)  │
//! └──────────────────────────────┘   └──────────────────────────┘
//!                │
//!                ▼
//! ┌──────────────────────────────┐
//! │          TaskStore           │
//! │  (PENDING → RUNNING →        │
//! │   {SUCCESS, FAILED} + log)   │
//! └──────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use uptask::prelude::*;
//!
//! #[derive(Serialize, Deserialize)]
//! struct SortArgs {
//!     items: Vec<i64>,
//! }
//!
//! impl TaskArgs for SortArgs {
//!     const KIND: &'static str = "SortTask";
//! }
//!
//! struct SortHandler;
//!
//! #[async_trait]
//! impl TaskHandler<SortArgs> for SortHandler {
//!     async fn process_task(&self, task: Container<SortArgs>) -> anyhow::Result<()> {
//!         let mut items = task.args.items;
//!         items.sort();
//!         Ok(())
//!     }
//! }
//!
//! let transport = Arc::new(UpstashTransport::new(token, "https://app.example.com")?);
//! let service = TaskService::with_store(transport, Arc::new(MemoryTaskStore::new()));
//! service.register_task(SortHandler)?;
//! service.start_task(&SortArgs { items: vec![3, 1, 2] }, None).await?;
//! ```

pub mod client;
pub mod codec;
pub mod envelope;
pub mod error;
pub mod fanout;
pub mod middleware;
pub mod opts;
pub mod service;
pub mod snooze;
pub mod store;
pub mod task;
pub mod transport;
pub mod upstash;

/// Prelude for common imports
pub mod prelude {
    pub use crate::client::TaskClient;
    pub use crate::codec::{BrokerDelivery, CodecError};
    pub use crate::envelope::TaskEnvelope;
    pub use crate::error::ServiceError;
    pub use crate::opts::InsertOpts;
    pub use crate::service::{TaskService, TaskServiceConfig};
    pub use crate::snooze::snooze;
    pub use crate::store::{
        MemoryTaskStore, TaskExecution, TaskFilter, TaskStatus, TaskStore,
    };
    pub use crate::task::{Container, EventHandler, TaskArgs, TaskHandler, TaskTimeout};
    pub use crate::transport::Transport;
    pub use crate::upstash::UpstashTransport;
}

// Re-export key types at crate root
pub use client::TaskClient;
pub use codec::{BrokerDelivery, CodecError};
pub use envelope::TaskEnvelope;
pub use error::ServiceError;
pub use fanout::{EventFanoutArgs, FANOUT_TASK_KIND};
pub use middleware::{HandlerFn, Middleware};
pub use opts::{InsertOpts, DEFAULT_MAX_RETRIES};
pub use service::{TaskService, TaskServiceConfig};
pub use snooze::{snooze, SnoozeSignal};
pub use store::{
    ExecutionError, MemoryTaskStore, StoreError, TaskExecution, TaskFilter, TaskStatus, TaskStore,
};
pub use task::{Container, EventHandler, TaskArgs, TaskFuncHandler, TaskHandler, TaskTimeout};
pub use transport::{EventMetadata, Transport, TransportError, TransportErrorCode};
pub use upstash::{UpstashTransport, UPSTASH_BASE_URL};
