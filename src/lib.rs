//! Operation orchestration core for the QuantLab backend.
//!
//! Long-running work (training runs, data loads, backtests) is started through
//! the [`OperationOrchestrator`], tracked in the [`registry`] with cooperative
//! cancellation and staged progress reporting, and optionally delegated to
//! remote host services that are polled for status and metrics.

pub mod cancel;
pub mod config;
pub mod error;
pub mod orchestrator;
pub mod progress;
pub mod registry;
pub mod remote;

pub use cancel::{CancelToken, CancellationCoordinator};
pub use config::{HostServiceConfig, OpsConfig};
pub use error::{CancellationError, OpsError, OpsResult, RemoteServiceError};
pub use orchestrator::{OperationContext, OperationOrchestrator, OperationOutcome};
pub use progress::{DefaultRenderer, ProgressManager, ProgressRenderer, ProgressUpdate};
pub use registry::*;
pub use remote::{HostServiceClient, RemoteSessionProxy, SessionStarted};
