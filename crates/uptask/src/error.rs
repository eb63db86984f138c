//! Service-level error taxonomy

use crate::codec::CodecError;
use crate::store::StoreError;
use crate::transport::TransportError;

/// Errors surfaced by the task service and client.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    /// The inbound request could not be decoded; surfaces as HTTP 400.
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// No handler is registered for the inbound type, or an event was
    /// published with no matching subscribers.
    #[error("no handler registered for task type: {0}")]
    NoHandlerRegistered(String),

    /// A handler is already registered under this key.
    #[error("handler for kind {0:?} is already registered")]
    AlreadyRegistered(String),

    /// The registration key is unusable (empty kind or handler name).
    #[error("invalid registration key: {0:?}")]
    InvalidRegistration(String),

    /// The registry can no longer be modified.
    #[error("registration locked: {0}")]
    RegistrationLocked(&'static str),

    /// A publish to the broker failed.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// An execution-store operation failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// User code returned a non-snooze error.
    #[error("task handler failed: {0:#}")]
    Handler(anyhow::Error),
}

impl ServiceError {
    /// Recover a typed service error from a dispatch-chain error, falling
    /// back to [`ServiceError::Handler`] for plain handler failures.
    pub(crate) fn from_dispatch(err: anyhow::Error) -> Self {
        let err = match err.downcast::<CodecError>() {
            Ok(codec) => return Self::Codec(codec),
            Err(err) => err,
        };
        let err = match err.downcast::<StoreError>() {
            Ok(store) => return Self::Store(store),
            Err(err) => err,
        };
        match err.downcast::<TransportError>() {
            Ok(transport) => Self::Transport(transport),
            Err(err) => Self::Handler(err),
        }
    }
}
