//! Handler middleware
//!
//! Both the inbound dispatch path and the client's publish path are chains
//! of envelope-processing functions. Middleware wraps the next function and
//! may mutate the envelope before passing it along.

use std::sync::Arc;

use futures::future::BoxFuture;

use crate::envelope::TaskEnvelope;

/// A type-erased envelope processor: the innermost one invokes the user
/// handler (inbound) or the transport (outbound).
pub type HandlerFn =
    Arc<dyn Fn(TaskEnvelope) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Wraps a [`HandlerFn`] with additional behavior.
pub type Middleware = Arc<dyn Fn(HandlerFn) -> HandlerFn + Send + Sync>;

/// Apply middleware so the first registered runs outermost.
pub(crate) fn apply_middleware(middlewares: &[Middleware], handler: HandlerFn) -> HandlerFn {
    let mut handler = handler;
    for middleware in middlewares.iter().rev() {
        handler = middleware(handler);
    }
    handler
}
