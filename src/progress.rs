// Progress Manager - staged percentage reporting for one operation
//
// A multi-phase operation carves 0..100% into per-step windows; step-local
// counts are interpolated into the window so the overall percentage only
// moves forward while work advances. Every mutation pushes a full snapshot
// into the registry dispatcher's bounded channel; nothing here blocks the
// worker.

use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};

use crate::registry::OperationProgress;

/// Envelope carried from workers to the registry dispatcher. Progress is a
/// whole snapshot (replaced on arrival); warnings and errors are appended.
#[derive(Debug, Clone)]
pub struct ProgressUpdate {
    pub operation_id: String,
    pub progress: OperationProgress,
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
}

/// Turns a progress snapshot into a human-readable line. Implementations
/// must be pure formatters; they are invoked on the worker's update path.
pub trait ProgressRenderer: Send + Sync {
    fn render(&self, progress: &OperationProgress) -> String;
}

/// Domain-neutral wording, used when no renderer is registered for the
/// operation type.
pub struct DefaultRenderer;

impl ProgressRenderer for DefaultRenderer {
    fn render(&self, progress: &OperationProgress) -> String {
        let mut line = if progress.total_steps > 0 && progress.current_step > 0 {
            format!(
                "step {}/{}: {} ({:.1}%)",
                progress.current_step,
                progress.total_steps,
                progress.step_label,
                progress.percentage
            )
        } else {
            format!("{:.1}%", progress.percentage)
        };
        if let Some(item) = &progress.current_item_label {
            line.push_str(" - ");
            line.push_str(item);
        }
        line
    }
}

struct ProgressState {
    progress: OperationProgress,
    range_start: f64,
    range_end: f64,
}

struct ProgressInner {
    operation_id: String,
    sink: mpsc::Sender<ProgressUpdate>,
    renderer: Option<Arc<dyn ProgressRenderer>>,
    state: Mutex<ProgressState>,
}

/// Progress reporting handle for one operation. Cheap to clone; all clones
/// share state and updates are serialized internally.
#[derive(Clone)]
pub struct ProgressManager {
    inner: Arc<ProgressInner>,
}

impl ProgressManager {
    pub fn new(
        operation_id: impl Into<String>,
        sink: mpsc::Sender<ProgressUpdate>,
        renderer: Option<Arc<dyn ProgressRenderer>>,
    ) -> Self {
        Self {
            inner: Arc::new(ProgressInner {
                operation_id: operation_id.into(),
                sink,
                renderer,
                state: Mutex::new(ProgressState {
                    progress: OperationProgress::default(),
                    range_start: 0.0,
                    range_end: 100.0,
                }),
            }),
        }
    }

    pub fn operation_id(&self) -> &str {
        &self.inner.operation_id
    }

    /// Resets to 0% and records the step count and free-form context.
    pub fn start_operation(&self, total_steps: u32, context: Map<String, Value>) {
        self.apply(Vec::new(), Vec::new(), |state| {
            state.progress = OperationProgress {
                total_steps,
                context,
                ..OperationProgress::default()
            };
            state.range_start = 0.0;
            state.range_end = 100.0;
        });
    }

    /// Opens a step owning the percentage window `[range_start, range_end]`.
    /// Entering the step moves the percentage to the start of its window.
    /// Inverted or out-of-range windows are clamped rather than rejected.
    pub fn start_step(&self, label: &str, step_number: u32, range_start: f64, range_end: f64) {
        let start = range_start.clamp(0.0, 100.0);
        let mut end = range_end.clamp(0.0, 100.0);
        if end < start {
            warn!(
                "Inverted step window [{}, {}] for operation {}, clamping",
                range_start, range_end, self.inner.operation_id
            );
            end = start;
        }
        self.apply(Vec::new(), Vec::new(), |state| {
            state.range_start = start;
            state.range_end = end;
            state.progress.current_step = step_number;
            state.progress.step_label = label.to_string();
            state.progress.current_item_label = None;
            state.progress.percentage = start;
        });
    }

    /// Interpolates step-local counts into the open step's window:
    /// `pct = range_start + (current / total) * (range_end - range_start)`.
    /// With `total == 0` the percentage holds at the window start; `current`
    /// beyond `total` clamps to the window end.
    pub fn update_step_progress(
        &self,
        current: u64,
        total: u64,
        items_processed: Option<u64>,
        detail: Option<&str>,
    ) {
        self.apply(Vec::new(), Vec::new(), |state| {
            let fraction = if total == 0 {
                0.0
            } else {
                current.min(total) as f64 / total as f64
            };
            state.progress.percentage =
                state.range_start + fraction * (state.range_end - state.range_start);
            if let Some(items) = items_processed {
                state.progress.items_processed = items;
            }
            if let Some(detail) = detail {
                state.progress.current_item_label = Some(detail.to_string());
            }
        });
    }

    pub fn set_items_total(&self, items_total: u64) {
        self.apply(Vec::new(), Vec::new(), |state| {
            state.progress.items_total = Some(items_total);
        });
    }

    /// Attaches a warning to the next snapshot pushed downstream.
    pub fn push_warning(&self, warning: impl Into<String>) {
        self.apply(vec![warning.into()], Vec::new(), |_| {});
    }

    /// Attaches a non-fatal error to the next snapshot pushed downstream.
    pub fn push_error(&self, error: impl Into<String>) {
        self.apply(Vec::new(), vec![error.into()], |_| {});
    }

    /// Forces 100% and emits the final snapshot.
    pub fn complete_operation(&self) {
        self.apply(Vec::new(), Vec::new(), |state| {
            state.progress.percentage = 100.0;
            state.progress.current_step = state.progress.total_steps;
        });
    }

    /// Point-in-time copy of the current snapshot.
    pub fn snapshot(&self) -> OperationProgress {
        self.inner.state.lock().progress.clone()
    }

    fn apply(
        &self,
        warnings: Vec<String>,
        errors: Vec<String>,
        mutate: impl FnOnce(&mut ProgressState),
    ) {
        let inner = &self.inner;
        // the lock is held through the send so snapshots leave in the same
        // order the state changed; try_send never blocks
        let mut state = inner.state.lock();
        mutate(&mut state);

        let mut progress = state.progress.clone();
        if let Some(renderer) = &inner.renderer {
            progress.message = Some(renderer.render(&progress));
        }

        let update = ProgressUpdate {
            operation_id: inner.operation_id.clone(),
            progress,
            warnings,
            errors,
        };
        match inner.sink.try_send(update) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                warn!(
                    "Progress channel full, dropping snapshot for operation {}",
                    inner.operation_id
                );
            }
            Err(TrySendError::Closed(_)) => {
                debug!(
                    "Progress channel closed, dropping snapshot for operation {}",
                    inner.operation_id
                );
            }
        }
    }
}
