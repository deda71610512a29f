use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::OpsResult;
use crate::remote::RemoteSessionProxy;

use super::metrics::MetricsPage;
use super::types::{OperationProgress, OperationStatus};

/// Status snapshot produced by a pull source. Both the in-process bridge and
/// the remote proxy report this same shape, so the registry's refresh logic
/// does not care where an operation actually runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullStatus {
    pub state: OperationStatus,
    pub progress: Option<OperationProgress>,
    #[serde(default)]
    pub warnings: Vec<String>,
    #[serde(default)]
    pub errors: Vec<String>,
    pub error_message: Option<String>,
    pub result_summary: Option<Map<String, Value>>,
}

impl PullStatus {
    pub fn running() -> Self {
        Self {
            state: OperationStatus::Running,
            progress: None,
            warnings: Vec::new(),
            errors: Vec::new(),
            error_message: None,
            result_summary: None,
        }
    }
}

/// Anything the registry can refresh an operation from: current status plus
/// metric items appended since a cursor. Deliberately nothing else.
#[async_trait]
pub trait PullSource: Send + Sync {
    async fn status(&self) -> OpsResult<PullStatus>;

    async fn metrics(&self, cursor: u64) -> OpsResult<MetricsPage>;
}

/// Pull source for operations running inside this process. Domain code owns
/// the bridge and writes into it; the registry holds it weakly and reads on
/// refresh.
pub struct InProcessBridge {
    state: Mutex<BridgeState>,
}

struct BridgeState {
    status: PullStatus,
    items: Vec<Value>,
}

impl InProcessBridge {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(BridgeState {
                status: PullStatus::running(),
                items: Vec::new(),
            }),
        }
    }

    pub fn set_progress(&self, progress: OperationProgress) {
        self.state.lock().status.progress = Some(progress);
    }

    pub fn push_warning(&self, warning: impl Into<String>) {
        self.state.lock().status.warnings.push(warning.into());
    }

    pub fn push_error(&self, error: impl Into<String>) {
        self.state.lock().status.errors.push(error.into());
    }

    pub fn push_metrics(&self, items: Vec<Value>) {
        self.state.lock().items.extend(items);
    }

    pub fn complete(&self, result_summary: Option<Map<String, Value>>) {
        let mut state = self.state.lock();
        state.status.state = OperationStatus::Completed;
        state.status.result_summary = result_summary;
    }

    pub fn fail(&self, error_message: impl Into<String>) {
        let mut state = self.state.lock();
        state.status.state = OperationStatus::Failed;
        state.status.error_message = Some(error_message.into());
    }

    pub fn cancelled(&self, reason: Option<String>) {
        let mut state = self.state.lock();
        state.status.state = OperationStatus::Cancelled;
        state.status.error_message = reason;
    }
}

impl Default for InProcessBridge {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PullSource for InProcessBridge {
    async fn status(&self) -> OpsResult<PullStatus> {
        Ok(self.state.lock().status.clone())
    }

    async fn metrics(&self, cursor: u64) -> OpsResult<MetricsPage> {
        let state = self.state.lock();
        let len = state.items.len() as u64;
        if cursor >= len {
            return Ok(MetricsPage::empty(len));
        }
        Ok(MetricsPage {
            items: state.items[cursor as usize..].to_vec(),
            next_cursor: len,
        })
    }
}

/// The one source an operation may be bound to. The bridge is held weakly
/// because its lifetime belongs to the domain code driving it; the proxy is
/// owned because nothing else keeps a remote session alive locally.
#[derive(Debug, Clone)]
pub enum PullBinding {
    Bridge(Weak<InProcessBridge>),
    Remote(Arc<RemoteSessionProxy>),
}

impl PullBinding {
    /// Resolves to a usable source, or `None` when a weakly held bridge has
    /// been dropped by its owner.
    pub fn source(&self) -> Option<Arc<dyn PullSource>> {
        match self {
            PullBinding::Bridge(bridge) => bridge
                .upgrade()
                .map(|bridge| bridge as Arc<dyn PullSource>),
            PullBinding::Remote(proxy) => Some(Arc::clone(proxy) as Arc<dyn PullSource>),
        }
    }

    pub fn remote_proxy(&self) -> Option<&Arc<RemoteSessionProxy>> {
        match self {
            PullBinding::Remote(proxy) => Some(proxy),
            PullBinding::Bridge(_) => None,
        }
    }
}

impl std::fmt::Debug for InProcessBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("InProcessBridge")
            .field("state", &state.status.state)
            .field("items", &state.items.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_bridge_reports_progress_and_terminal_state() {
        let bridge = InProcessBridge::new();

        let mut progress = OperationProgress::default();
        progress.percentage = 40.0;
        bridge.set_progress(progress);
        bridge.push_warning("gap in feed");

        let status = bridge.status().await.unwrap();
        assert_eq!(status.state, OperationStatus::Running);
        assert_eq!(status.progress.unwrap().percentage, 40.0);
        assert_eq!(status.warnings, vec!["gap in feed".to_string()]);

        let mut summary = Map::new();
        summary.insert("rows".to_string(), json!(1500));
        bridge.complete(Some(summary));
        let status = bridge.status().await.unwrap();
        assert_eq!(status.state, OperationStatus::Completed);
        assert!(status.result_summary.is_some());
    }

    #[tokio::test]
    async fn test_bridge_metrics_are_cursor_paged() {
        let bridge = InProcessBridge::new();
        bridge.push_metrics(vec![json!({ "rows": 100 }), json!({ "rows": 200 })]);

        let page = bridge.metrics(0).await.unwrap();
        assert_eq!(page.items.len(), 2);
        assert_eq!(page.next_cursor, 2);

        bridge.push_metrics(vec![json!({ "rows": 300 })]);
        let page = bridge.metrics(page.next_cursor).await.unwrap();
        assert_eq!(page.items, vec![json!({ "rows": 300 })]);
        assert_eq!(page.next_cursor, 3);

        let page = bridge.metrics(3).await.unwrap();
        assert!(page.items.is_empty());
        assert_eq!(page.next_cursor, 3);
    }

    #[test]
    fn test_dropped_bridge_leaves_no_source() {
        let bridge = Arc::new(InProcessBridge::new());
        let binding = PullBinding::Bridge(Arc::downgrade(&bridge));
        assert!(binding.source().is_some());

        drop(bridge);
        assert!(binding.source().is_none());
    }

    #[test]
    fn test_pull_status_deserializes_with_default_lists() {
        let status: PullStatus = serde_json::from_str(r#"{ "state": "running" }"#).unwrap();
        assert_eq!(status.state, OperationStatus::Running);
        assert!(status.warnings.is_empty());
        assert!(status.error_message.is_none());
    }
}
