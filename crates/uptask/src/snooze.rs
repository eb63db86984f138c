//! Snooze: handler-initiated delayed re-enqueue
//!
//! A handler returns [`snooze`] to have the same envelope redelivered
//! later. The snooze layer re-publishes the envelope with an extended
//! budget so the delay is never charged against the broker's retry count,
//! then acknowledges the current delivery.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use chrono::Utc;
use futures::future::BoxFuture;
use tracing::info;
use uuid::Uuid;

use crate::middleware::{HandlerFn, Middleware};
use crate::opts::InsertOpts;
use crate::store::TaskStore;
use crate::transport::Transport;

/// The signal a handler returns to request a delayed re-enqueue. Not a
/// failure: it is intercepted by the snooze layer and never surfaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("task snoozed for {duration:?}")]
pub struct SnoozeSignal {
    pub duration: Duration,
}

/// Request a snooze: return this from a task handler to have the envelope
/// redelivered no earlier than `duration` from now.
pub fn snooze(duration: Duration) -> anyhow::Error {
    anyhow::Error::new(SnoozeSignal { duration })
}

/// The always-installed layer that intercepts [`SnoozeSignal`] from the
/// dispatch pipeline below it.
pub(crate) fn snooze_middleware(
    transport: Arc<dyn Transport>,
    store: Option<Arc<dyn TaskStore>>,
) -> Middleware {
    Arc::new(move |next: HandlerFn| -> HandlerFn {
        let transport = transport.clone();
        let store = store.clone();
        Arc::new(move |envelope: crate::envelope::TaskEnvelope| -> BoxFuture<'static, anyhow::Result<()>> {
            let transport = transport.clone();
            let store = store.clone();
            let next = next.clone();
            Box::pin(async move {
                let result = next(envelope.clone()).await;
                let err = match result {
                    Ok(()) => return Ok(()),
                    Err(err) => err,
                };
                let Some(signal) = err.downcast_ref::<SnoozeSignal>().copied() else {
                    return Err(err);
                };

                let mut envelope = envelope;
                let mut opts = InsertOpts::from_envelope(&envelope);
                let retried = envelope.retried();

                // Extend the budget by one and count the re-enqueue as a
                // redelivery so the two counters stay aligned; the
                // transport subtracts the snooze count back out of the
                // outgoing budget header.
                opts.max_retries += 1;
                envelope.set_snoozed(envelope.snoozed() + 1);
                envelope.set_retried(retried + 1);

                let scheduled_at = if signal.duration.is_zero() {
                    None
                } else {
                    Some(Utc::now() + chrono::Duration::from_std(signal.duration)?)
                };
                opts.scheduled_at = scheduled_at;

                info!(
                    task = %envelope.ty,
                    id = %envelope.id,
                    duration = ?signal.duration,
                    retried,
                    max_retries = opts.max_retries,
                    "snoozing task"
                );

                transport
                    .send(&mut envelope, &opts)
                    .await
                    .context("failed to snooze task")?;

                if let Some(store) = &store {
                    let id = Uuid::parse_str(&envelope.id)
                        .context("snoozed envelope has an invalid id")?;
                    store
                        .update_snoozed(id, scheduled_at.unwrap_or_else(Utc::now))
                        .await
                        .context("failed to update snoozed task")?;
                }

                Ok(())
            })
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snooze_signal_is_recoverable_through_context() {
        let err = snooze(Duration::from_secs(3)).context("failed to process task");
        let signal = err.downcast_ref::<SnoozeSignal>().unwrap();
        assert_eq!(signal.duration, Duration::from_secs(3));
    }

    #[test]
    fn test_other_errors_do_not_match() {
        let err = anyhow::anyhow!("boom");
        assert!(err.downcast_ref::<SnoozeSignal>().is_none());
    }
}
