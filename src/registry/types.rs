use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use super::metrics::MetricsSummary;

/// Kind of managed operation. Drives which typed metrics bucket the record
/// gets and which progress renderer applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    Training,
    DataLoad,
    Backtest,
    Indicator,
    Other,
}

impl std::fmt::Display for OperationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OperationType::Training => write!(f, "training"),
            OperationType::DataLoad => write!(f, "data_load"),
            OperationType::Backtest => write!(f, "backtest"),
            OperationType::Indicator => write!(f, "indicator"),
            OperationType::Other => write!(f, "other"),
        }
    }
}

/// Lifecycle state of an operation. Terminal states are sinks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl OperationStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OperationStatus::Completed | OperationStatus::Failed | OperationStatus::Cancelled
        )
    }

    pub fn is_active(&self) -> bool {
        matches!(self, OperationStatus::Pending | OperationStatus::Running)
    }

    /// Legal edges of the lifecycle state machine. Everything not listed
    /// here is rejected by the registry.
    pub fn can_transition_to(&self, next: OperationStatus) -> bool {
        use OperationStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Cancelled)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
        )
    }
}

impl std::fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OperationStatus::Pending => write!(f, "pending"),
            OperationStatus::Running => write!(f, "running"),
            OperationStatus::Completed => write!(f, "completed"),
            OperationStatus::Failed => write!(f, "failed"),
            OperationStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Point-in-time progress snapshot. Replaced wholesale on every update;
/// consumers never see a partially written state.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OperationProgress {
    /// Overall completion in percent, 0.0 to 100.0.
    pub percentage: f64,
    pub current_step: u32,
    pub total_steps: u32,
    pub step_label: String,
    pub items_processed: u64,
    pub items_total: Option<u64>,
    pub current_item_label: Option<String>,
    /// Free-form context supplied when the operation started.
    pub context: Map<String, Value>,
    /// Rendered human-readable line, when a renderer is attached.
    pub message: Option<String>,
}

/// Creation-time context for an operation. Immutable after create.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OperationMetadata {
    pub symbol: Option<String>,
    pub timeframe: Option<String>,
    pub mode: Option<String>,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
    #[serde(default)]
    pub extra: Map<String, Value>,
}

/// Where a delegated operation actually runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteSessionRef {
    pub host: String,
    pub session_id: String,
}

/// Full record of one managed operation, as returned by registry reads.
/// Always an owned snapshot, never a reference into registry internals.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationInfo {
    pub id: String,
    pub name: String,
    pub op_type: OperationType,
    pub status: OperationStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub metadata: OperationMetadata,
    pub progress: OperationProgress,
    /// Accumulated non-fatal warnings, append-only.
    #[serde(default)]
    pub warnings: Vec<String>,
    /// Accumulated non-fatal errors, append-only.
    #[serde(default)]
    pub errors: Vec<String>,
    /// Terminal failure text; set once when the operation fails.
    pub error_message: Option<String>,
    pub result_summary: Option<Map<String, Value>>,
    /// Compact digest of the metrics log; full history is cursor-paged.
    #[serde(default)]
    pub metrics: MetricsSummary,
    pub remote_session: Option<RemoteSessionRef>,
}

impl OperationInfo {
    pub fn new(
        id: String,
        name: String,
        op_type: OperationType,
        metadata: OperationMetadata,
    ) -> Self {
        Self {
            id,
            name,
            op_type,
            status: OperationStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            metadata,
            progress: OperationProgress::default(),
            warnings: Vec::new(),
            errors: Vec::new(),
            error_message: None,
            result_summary: None,
            metrics: MetricsSummary::default(),
            remote_session: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status.is_active()
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Acknowledgement returned to callers the moment an operation is dispatched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartedOperation {
    pub operation_id: String,
    pub status: String,
}

impl StartedOperation {
    pub fn new(operation_id: impl Into<String>) -> Self {
        Self {
            operation_id: operation_id.into(),
            status: "started".to_string(),
        }
    }
}

/// What happened, pushed over the registry's broadcast channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationEventKind {
    Created,
    Started,
    Progress,
    Completed,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationEvent {
    pub operation_id: String,
    pub kind: OperationEventKind,
    pub status: OperationStatus,
    pub percentage: f64,
    pub message: Option<String>,
}

/// Collision-resistant id: type tag, UTC timestamp to the millisecond, and a
/// random suffix. Not cryptographically unique; the registry rejects the
/// astronomically rare duplicate at insert instead.
pub fn generate_operation_id(op_type: OperationType) -> String {
    let timestamp = Utc::now().format("%Y%m%d%H%M%S%3f");
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{}_{}_{}", op_type, timestamp, &suffix[..8])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_display() {
        assert_eq!(OperationStatus::Pending.to_string(), "pending");
        assert_eq!(OperationStatus::Cancelled.to_string(), "cancelled");
        assert_eq!(OperationType::DataLoad.to_string(), "data_load");
    }

    #[test]
    fn test_legal_transitions() {
        use OperationStatus::*;
        assert!(Pending.can_transition_to(Running));
        assert!(Pending.can_transition_to(Cancelled));
        assert!(Running.can_transition_to(Completed));
        assert!(Running.can_transition_to(Failed));
        assert!(Running.can_transition_to(Cancelled));
    }

    #[test]
    fn test_terminal_states_are_sinks() {
        use OperationStatus::*;
        for terminal in [Completed, Failed, Cancelled] {
            for next in [Pending, Running, Completed, Failed, Cancelled] {
                assert!(
                    !terminal.can_transition_to(next),
                    "{terminal} must not transition to {next}"
                );
            }
        }
    }

    #[test]
    fn test_illegal_forward_edges() {
        use OperationStatus::*;
        assert!(!Pending.can_transition_to(Completed));
        assert!(!Pending.can_transition_to(Failed));
        assert!(!Running.can_transition_to(Pending));
        assert!(!Running.can_transition_to(Running));
    }

    #[test]
    fn test_generated_ids_carry_type_and_differ() {
        let a = generate_operation_id(OperationType::Training);
        let b = generate_operation_id(OperationType::Training);
        assert!(a.starts_with("training_"));
        assert_ne!(a, b);
        // type tag, timestamp, 8 hex chars
        assert_eq!(a.split('_').count(), 3);
        assert_eq!(a.split('_').next_back().map(str::len), Some(8));
    }

    #[test]
    fn test_status_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&OperationStatus::Running).unwrap(),
            "\"running\""
        );
        assert_eq!(
            serde_json::to_string(&OperationType::DataLoad).unwrap(),
            "\"data_load\""
        );
    }

    #[test]
    fn test_new_record_shape() {
        let info = OperationInfo::new(
            "op1".to_string(),
            "Train LSTM".to_string(),
            OperationType::Training,
            OperationMetadata::default(),
        );
        assert_eq!(info.status, OperationStatus::Pending);
        assert!(info.is_active());
        assert!(!info.is_terminal());
        assert_eq!(info.progress.percentage, 0.0);
        assert!(info.started_at.is_none());
        assert!(info.warnings.is_empty());
    }

    #[test]
    fn test_started_operation_payload() {
        let started = StartedOperation::new("op1");
        let json = serde_json::to_value(&started).unwrap();
        assert_eq!(json["operation_id"], "op1");
        assert_eq!(json["status"], "started");
    }
}
