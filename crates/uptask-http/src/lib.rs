//! # uptask-http
//!
//! The webhook surface for the uptask engine: axum routes the broker posts
//! task, event, and dead-letter deliveries to, plus the signature
//! verification middleware and a small read API over the execution store.
//!
//! ```ignore
//! use axum::middleware;
//! use uptask_http::{task_routes, dlq_routes, api_routes, verify_signature, VerifyConfig};
//!
//! let verify = VerifyConfig::new(signing_key, "Upstash");
//! let app = task_routes(service.clone())
//!     .merge(dlq_routes(archive))
//!     .layer(middleware::from_fn_with_state(verify, verify_signature))
//!     .merge(api_routes(store));
//! axum::serve(listener, app).await?;
//! ```

mod routes;
mod verify;

pub use routes::{api_routes, dlq_routes, task_routes, DlqStore, StoreDlqArchive};
pub use verify::{verify_signature, VerifyConfig};
