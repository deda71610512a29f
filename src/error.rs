use thiserror::Error;

use crate::registry::OperationStatus;

/// Raised when cancelled work observes its token via [`CancelToken::check`].
///
/// Carries the operation id, the call-site label where cancellation was
/// observed, and the reason supplied by whoever requested it, so logs and
/// API payloads can say more than "cancelled".
///
/// [`CancelToken::check`]: crate::cancel::CancelToken::check
#[derive(Debug, Clone, Error)]
#[error("operation {operation_id} cancelled at '{label}' ({})", .reason.as_deref().unwrap_or("no reason given"))]
pub struct CancellationError {
    pub operation_id: String,
    pub label: String,
    pub reason: Option<String>,
}

/// A host service could not be reached after the configured retries.
#[derive(Debug, Clone, Error)]
#[error("host service '{host}' failed after {attempts} attempt(s): {message}")]
pub struct RemoteServiceError {
    pub host: String,
    pub attempts: u32,
    /// Text of the last underlying transport error.
    pub message: String,
}

/// Crate-wide error taxonomy.
#[derive(Debug, Error)]
pub enum OpsError {
    /// Request rejected before any work was dispatched.
    #[error("validation error: {0}")]
    Validation(String),

    #[error(transparent)]
    Cancelled(#[from] CancellationError),

    /// Domain work failed mid-run; the payload is whatever the operation
    /// function returned.
    #[error("operation {operation_id} failed: {source}")]
    Execution {
        operation_id: String,
        #[source]
        source: anyhow::Error,
    },

    #[error(transparent)]
    Remote(#[from] RemoteServiceError),

    #[error("operation not found: {0}")]
    NotFound(String),

    /// Guard for the lifecycle state machine; surfaced as an error, never a
    /// panic, so callers racing a terminal transition get a clean rejection.
    #[error("invalid transition for operation {operation_id}: {from} -> {to}")]
    InvalidTransition {
        operation_id: String,
        from: OperationStatus,
        to: OperationStatus,
    },
}

pub type OpsResult<T> = std::result::Result<T, OpsError>;
