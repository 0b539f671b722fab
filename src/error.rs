//! Error catalog for the driver core.
//!
//! Every public operation returns one of these tagged values. Transport
//! failures are wrapped rather than passed through so callers can match on
//! the kind without knowing which connection implementation is underneath.

use thiserror::Error;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// A required configuration callback was not supplied at construction.
    #[error("no {0} provider configured")]
    NoProvider(&'static str),

    /// Capabilities were requested without starting the server and none are
    /// cached for the current incarnation.
    #[error("server capabilities are unavailable before initialization")]
    CapabilitiesUnavailable,

    /// The internal state machine reached an illegal combination. This is a
    /// programmer error and implies a bug in the driver or its embedder.
    #[error("invalid lifecycle state: {0}")]
    StateInvalid(String),

    /// A message was issued while the server is shutting down or inside the
    /// restart cool-down window.
    #[error("language server is stopped")]
    ServerStopped,

    /// The transport reports the peer is gone.
    #[error("language server is unavailable")]
    ServerUnavailable,

    /// An inbound server request arrived and no handler is registered for it.
    #[error("no handler registered for server request `{0}`")]
    HandlerUnavailable(String),

    /// The request could not be encoded, or its reply could not be decoded
    /// into the caller's result type.
    #[error("failed to dispatch request: {0}")]
    RequestDispatchFailed(String),

    /// The transport failed while delivering a notification.
    #[error("failed to dispatch notification: {0}")]
    NotificationDispatchFailed(String),

    /// The transport failed while delivering a request.
    #[error("unable to send request: {0}")]
    UnableToSendRequest(String),

    /// The transport reported a timeout.
    #[error("timed out waiting for the language server")]
    Timeout,
}

impl Error {
    /// Whether this error means the connection itself is gone, so the
    /// supervisor should invalidate the current incarnation and schedule a
    /// restart.
    pub fn is_connection_loss(&self) -> bool {
        matches!(
            self,
            Error::ServerUnavailable
                | Error::UnableToSendRequest(_)
                | Error::NotificationDispatchFailed(_)
        )
    }
}
