// Operation Registry - lifecycle authority for managed operations
//
// Owns the record index, the legal state machine, typed metrics logs, and
// the TTL-cached pull refresh for operations that report through a bridge
// or a remote session proxy.

mod metrics;
mod source;
mod store;
mod types;

pub use metrics::{
    EpochMetric, MetricsLog, MetricsPage, MetricsSummary, SegmentMetric, TrainingTrend,
    WindowMetric,
};
pub use source::{InProcessBridge, PullBinding, PullSource, PullStatus};
pub use store::{OperationRegistry, RegistryStats};
pub use types::{
    generate_operation_id, OperationEvent, OperationEventKind, OperationInfo, OperationMetadata,
    OperationProgress, OperationStatus, OperationType, RemoteSessionRef, StartedOperation,
};
