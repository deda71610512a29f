use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::broadcast;
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, error, info, warn};

use crate::cancel::CancellationCoordinator;
use crate::config::OpsConfig;
use crate::error::{OpsError, OpsResult};
use crate::remote::RemoteSessionProxy;

use super::metrics::{MetricsLog, MetricsPage};
use super::source::{InProcessBridge, PullBinding, PullStatus};
use super::types::{
    generate_operation_id, OperationEvent, OperationEventKind, OperationInfo, OperationMetadata,
    OperationProgress, OperationStatus, OperationType, RemoteSessionRef,
};

/// Counts by lifecycle state across the whole index.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct RegistryStats {
    pub total: usize,
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

/// Per-operation storage. Each record carries its own locks so hot-path
/// updates on different operations never contend; the index lock is only
/// taken for structural changes.
struct OperationCell {
    info: RwLock<OperationInfo>,
    metrics: Mutex<MetricsLog>,
    binding: RwLock<Option<PullBinding>>,
    abort: Mutex<Option<AbortHandle>>,
    /// Registry-side cursor into the bound source's metric stream.
    source_cursor: Mutex<u64>,
    refreshed_at: Mutex<Option<Instant>>,
    /// Serializes pull refreshes so concurrent readers hit the source at
    /// most once per staleness window.
    refresh_gate: tokio::sync::Mutex<()>,
}

impl OperationCell {
    fn new(info: OperationInfo) -> Self {
        let log = MetricsLog::for_type(info.op_type);
        Self {
            info: RwLock::new(info),
            metrics: Mutex::new(log),
            binding: RwLock::new(None),
            abort: Mutex::new(None),
            source_cursor: Mutex::new(0),
            refreshed_at: Mutex::new(None),
            refresh_gate: tokio::sync::Mutex::new(()),
        }
    }
}

/// Lifecycle authority for managed operations.
///
/// All reads return owned snapshots. Writers go through the legal state
/// machine; terminal states are sinks and every terminal transition releases
/// the operation's cancellation token exactly once.
pub struct OperationRegistry {
    index: RwLock<HashMap<String, Arc<OperationCell>>>,
    coordinator: Arc<CancellationCoordinator>,
    events: broadcast::Sender<OperationEvent>,
    cache_ttl: Duration,
    retention: Duration,
    cancel_ack_timeout: Duration,
}

impl OperationRegistry {
    pub fn new(coordinator: Arc<CancellationCoordinator>, config: &OpsConfig) -> Self {
        let (events, _) = broadcast::channel(config.event_channel_capacity);
        Self {
            index: RwLock::new(HashMap::new()),
            coordinator,
            events,
            cache_ttl: config.status_cache_ttl(),
            retention: config.completed_retention(),
            cancel_ack_timeout: config.remote_cancel_ack_timeout(),
        }
    }

    /// Creates a Pending record with a generated id and returns its snapshot.
    pub fn create(
        &self,
        name: impl Into<String>,
        op_type: OperationType,
        metadata: OperationMetadata,
    ) -> OpsResult<OperationInfo> {
        let id = generate_operation_id(op_type);
        self.insert_record(OperationInfo::new(id, name.into(), op_type, metadata))
    }

    /// Creates a Pending record under a caller-supplied id.
    pub fn create_with_id(
        &self,
        id: impl Into<String>,
        name: impl Into<String>,
        op_type: OperationType,
        metadata: OperationMetadata,
    ) -> OpsResult<OperationInfo> {
        let id = id.into();
        if id.is_empty() {
            return Err(OpsError::Validation("operation id must not be empty".to_string()));
        }
        self.insert_record(OperationInfo::new(id, name.into(), op_type, metadata))
    }

    /// Pending -> Running; records the start time.
    pub fn start(&self, id: &str) -> OpsResult<()> {
        let cell = self.cell(id)?;
        let snapshot = {
            let mut info = cell.info.write();
            Self::guard_transition(&info, OperationStatus::Running)?;
            info.status = OperationStatus::Running;
            info.started_at = Some(Utc::now());
            info.clone()
        };
        debug!("Operation {} started", id);
        self.emit(&snapshot, OperationEventKind::Started);
        Ok(())
    }

    /// Stores a handle able to force-interrupt the operation's execution
    /// unit. If the record is already terminal the handle is aborted on the
    /// spot instead of being kept.
    pub fn attach_handle(&self, id: &str, handle: AbortHandle) -> OpsResult<()> {
        let cell = self.cell(id)?;
        if cell.info.read().status.is_terminal() {
            handle.abort();
            return Ok(());
        }
        *cell.abort.lock() = Some(handle);
        Ok(())
    }

    /// Replaces the progress snapshot wholesale and appends any new warnings
    /// and errors. Updates against terminal records are ignored, not errors:
    /// a worker racing its own cancellation is expected to lose.
    pub fn update_progress(
        &self,
        id: &str,
        progress: OperationProgress,
        new_warnings: Vec<String>,
        new_errors: Vec<String>,
    ) -> OpsResult<()> {
        let cell = self.cell(id)?;
        let snapshot = {
            let mut info = cell.info.write();
            if info.status.is_terminal() {
                debug!(
                    "Progress update for {} ignored, operation already {}",
                    id, info.status
                );
                return Ok(());
            }
            info.progress = progress;
            info.warnings.extend(new_warnings);
            info.errors.extend(new_errors);
            info.clone()
        };
        self.emit(&snapshot, OperationEventKind::Progress);
        Ok(())
    }

    /// Running -> Completed; forces 100% and stores the result summary.
    pub fn complete(&self, id: &str, result_summary: Option<Map<String, Value>>) -> OpsResult<()> {
        let cell = self.cell(id)?;
        let snapshot = {
            let mut info = cell.info.write();
            Self::guard_transition(&info, OperationStatus::Completed)?;
            info.status = OperationStatus::Completed;
            info.completed_at = Some(Utc::now());
            info.progress.percentage = 100.0;
            info.result_summary = result_summary;
            info.clone()
        };
        self.finish_cell(&cell, id);
        info!("Operation {} completed", id);
        self.emit(&snapshot, OperationEventKind::Completed);
        Ok(())
    }

    /// Running -> Failed; stores the terminal error text.
    pub fn fail(&self, id: &str, error_message: impl Into<String>) -> OpsResult<()> {
        let cell = self.cell(id)?;
        let message = error_message.into();
        let snapshot = {
            let mut info = cell.info.write();
            Self::guard_transition(&info, OperationStatus::Failed)?;
            info.status = OperationStatus::Failed;
            info.completed_at = Some(Utc::now());
            info.error_message = Some(message.clone());
            info.clone()
        };
        self.finish_cell(&cell, id);
        error!("Operation {} failed: {}", id, message);
        self.emit(&snapshot, OperationEventKind::Failed);
        Ok(())
    }

    /// Cancels a Pending or Running operation. In order: signals the
    /// coordinator so cooperative checkpoints fire, aborts the registered
    /// execution handle, and propagates the cancel to a bound remote session
    /// with a bounded acknowledgement wait. Only then is the record marked
    /// Cancelled. Terminal records return `Ok(false)` with no side effects.
    pub async fn cancel(&self, id: &str, reason: Option<&str>) -> OpsResult<bool> {
        let cell = self.cell(id)?;
        if cell.info.read().status.is_terminal() {
            debug!("Cancel of {} ignored, already terminal", id);
            return Ok(false);
        }

        self.coordinator.cancel(id, reason);

        if let Some(handle) = cell.abort.lock().take() {
            handle.abort();
            debug!("Execution handle for operation {} aborted", id);
        }

        let proxy = cell
            .binding
            .read()
            .as_ref()
            .and_then(|binding| binding.remote_proxy().cloned());
        if let Some(proxy) = proxy {
            match tokio::time::timeout(self.cancel_ack_timeout, proxy.cancel()).await {
                Ok(Ok(true)) => debug!(
                    "Remote cancel for operation {} acknowledged by host '{}'",
                    id,
                    proxy.host()
                ),
                Ok(Ok(false)) => warn!(
                    "Remote cancel for operation {} not acknowledged by host '{}'",
                    id,
                    proxy.host()
                ),
                Ok(Err(err)) => warn!("Remote cancel for operation {} failed: {}", id, err),
                Err(_) => warn!(
                    "Remote cancel for operation {} timed out after {:?}",
                    id, self.cancel_ack_timeout
                ),
            }
        }

        let snapshot = {
            let mut info = cell.info.write();
            if info.status.is_terminal() {
                // lost a race against another canceller or a source refresh
                return Ok(false);
            }
            info.status = OperationStatus::Cancelled;
            info.completed_at = Some(Utc::now());
            if info.error_message.is_none() {
                info.error_message = Some(
                    reason
                        .map(str::to_string)
                        .unwrap_or_else(|| "Operation cancelled".to_string()),
                );
            }
            info.clone()
        };
        self.finish_cell(&cell, id);
        info!(
            "Operation {} cancelled (reason: {})",
            id,
            reason.unwrap_or("none")
        );
        self.emit(&snapshot, OperationEventKind::Cancelled);
        Ok(true)
    }

    /// Returns an owned snapshot of the record. Running operations with a
    /// bound source are refreshed first when forced or when the cached
    /// snapshot is older than the TTL; concurrent readers within one
    /// staleness window hit the source at most once combined.
    pub async fn get(&self, id: &str, force_refresh: bool) -> OpsResult<OperationInfo> {
        let cell = self.cell(id)?;
        if self.needs_refresh(&cell, force_refresh) {
            self.refresh(&cell, id, force_refresh).await;
        }
        let snapshot = cell.info.read().clone();
        Ok(snapshot)
    }

    /// Metric items appended since `cursor`, from the record's local log.
    /// Fresh items from a bound source land here via the `get` refresh path.
    pub fn get_metrics(&self, id: &str, cursor: u64) -> OpsResult<MetricsPage> {
        let cell = self.cell(id)?;
        let page = cell.metrics.lock().page(cursor);
        Ok(page)
    }

    /// Type-aware ingestion into the record's metrics bucket. Training
    /// appends recompute the derived trend. Terminal records still accept
    /// appends (the final backfill); their status and progress stay frozen.
    pub fn append_metrics(&self, id: &str, items: Vec<Value>) -> OpsResult<usize> {
        let cell = self.cell(id)?;
        let (accepted, summary) = {
            let mut log = cell.metrics.lock();
            let accepted = log.append(items);
            (accepted, log.summary())
        };
        if accepted > 0 {
            cell.info.write().metrics = summary;
        }
        Ok(accepted)
    }

    /// Binds an in-process bridge as the operation's pull source. The bridge
    /// is held weakly; its lifetime belongs to the domain code driving it.
    pub fn register_local_bridge(&self, id: &str, bridge: &Arc<InProcessBridge>) -> OpsResult<()> {
        let cell = self.cell(id)?;
        self.bind(&cell, id, PullBinding::Bridge(Arc::downgrade(bridge)))?;
        debug!("Local bridge registered for operation {}", id);
        Ok(())
    }

    /// Binds a remote session proxy as the operation's pull source and
    /// records where the work actually runs.
    pub fn register_remote_proxy(&self, id: &str, proxy: RemoteSessionProxy) -> OpsResult<()> {
        let cell = self.cell(id)?;
        let host = proxy.host().to_string();
        let session_id = proxy.session_id().to_string();
        self.bind(&cell, id, PullBinding::Remote(Arc::new(proxy)))?;
        cell.info.write().remote_session = Some(RemoteSessionRef {
            host: host.clone(),
            session_id: session_id.clone(),
        });
        info!(
            "Operation {} delegated to host '{}' as session {}",
            id, host, session_id
        );
        Ok(())
    }

    /// Owned snapshots, newest first.
    pub fn list(&self, filter: Option<OperationType>, active_only: bool) -> Vec<OperationInfo> {
        let cells: Vec<Arc<OperationCell>> = self.index.read().values().cloned().collect();
        let mut records: Vec<OperationInfo> = cells
            .iter()
            .map(|cell| cell.info.read().clone())
            .filter(|info| filter.map_or(true, |t| info.op_type == t))
            .filter(|info| !active_only || info.is_active())
            .collect();
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        records
    }

    pub fn stats(&self) -> RegistryStats {
        let cells: Vec<Arc<OperationCell>> = self.index.read().values().cloned().collect();
        let mut stats = RegistryStats::default();
        for cell in cells {
            stats.total += 1;
            match cell.info.read().status {
                OperationStatus::Pending => stats.pending += 1,
                OperationStatus::Running => stats.running += 1,
                OperationStatus::Completed => stats.completed += 1,
                OperationStatus::Failed => stats.failed += 1,
                OperationStatus::Cancelled => stats.cancelled += 1,
            }
        }
        stats
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OperationEvent> {
        self.events.subscribe()
    }

    /// Cancels every Pending or Running operation, returning the ids that
    /// actually transitioned. Used on shutdown.
    pub async fn cancel_active(&self, reason: Option<&str>) -> Vec<String> {
        let ids: Vec<String> = self
            .list(None, true)
            .into_iter()
            .map(|info| info.id)
            .collect();
        let mut cancelled = Vec::new();
        for id in ids {
            match self.cancel(&id, reason).await {
                Ok(true) => cancelled.push(id),
                Ok(false) => {}
                Err(err) => warn!("Cancel of {} during shutdown failed: {}", id, err),
            }
        }
        cancelled
    }

    /// Removes terminal records older than the retention window. Returns the
    /// number purged.
    pub fn purge_expired(&self) -> usize {
        let mut index = self.index.write();
        let before = index.len();
        index.retain(|_, cell| {
            let info = cell.info.read();
            if !info.status.is_terminal() {
                return true;
            }
            match info.completed_at {
                Some(done) => {
                    let age = Utc::now()
                        .signed_duration_since(done)
                        .to_std()
                        .unwrap_or(Duration::ZERO);
                    age < self.retention
                }
                None => true,
            }
        });
        let purged = before - index.len();
        if purged > 0 {
            info!("Purged {} expired operation record(s)", purged);
        }
        purged
    }

    /// Background loop sweeping expired records on an interval.
    pub fn spawn_retention_sweeper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let purged = registry.purge_expired();
                debug!("Retention sweep finished, {} record(s) purged", purged);
            }
        })
    }

    fn insert_record(&self, info: OperationInfo) -> OpsResult<OperationInfo> {
        let cell = Arc::new(OperationCell::new(info.clone()));
        {
            let mut index = self.index.write();
            if index.contains_key(&info.id) {
                return Err(OpsError::Validation(format!(
                    "operation id '{}' already exists",
                    info.id
                )));
            }
            index.insert(info.id.clone(), cell);
        }
        info!(
            "Operation {} created ({}, '{}')",
            info.id, info.op_type, info.name
        );
        self.emit(&info, OperationEventKind::Created);
        Ok(info)
    }

    fn cell(&self, id: &str) -> OpsResult<Arc<OperationCell>> {
        self.index
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| OpsError::NotFound(id.to_string()))
    }

    fn guard_transition(info: &OperationInfo, next: OperationStatus) -> OpsResult<()> {
        if info.status.can_transition_to(next) {
            Ok(())
        } else {
            warn!(
                "Rejected transition {} -> {} for operation {}",
                info.status, next, info.id
            );
            Err(OpsError::InvalidTransition {
                operation_id: info.id.clone(),
                from: info.status,
                to: next,
            })
        }
    }

    fn bind(&self, cell: &Arc<OperationCell>, id: &str, binding: PullBinding) -> OpsResult<()> {
        if cell.info.read().status.is_terminal() {
            return Err(OpsError::Validation(format!(
                "operation '{id}' is terminal, refusing to bind a source"
            )));
        }
        let mut bound = cell.binding.write();
        if bound.is_some() {
            return Err(OpsError::Validation(format!(
                "operation '{id}' already has a bound source"
            )));
        }
        *bound = Some(binding);
        Ok(())
    }

    /// Terminal bookkeeping shared by complete/fail/cancel and the refresh
    /// path: drop the binding and execution handle, release the token.
    fn finish_cell(&self, cell: &Arc<OperationCell>, id: &str) {
        *cell.binding.write() = None;
        *cell.abort.lock() = None;
        self.coordinator.release(id);
    }

    fn emit(&self, info: &OperationInfo, kind: OperationEventKind) {
        // nobody listening is fine
        let _ = self.events.send(OperationEvent {
            operation_id: info.id.clone(),
            kind,
            status: info.status,
            percentage: info.progress.percentage,
            message: info.progress.message.clone(),
        });
    }

    fn needs_refresh(&self, cell: &OperationCell, force: bool) -> bool {
        if !cell.info.read().status.is_active() {
            return false;
        }
        if cell.binding.read().is_none() {
            return false;
        }
        force || self.is_stale(cell)
    }

    fn is_stale(&self, cell: &OperationCell) -> bool {
        match *cell.refreshed_at.lock() {
            Some(at) => at.elapsed() >= self.cache_ttl,
            None => true,
        }
    }

    async fn refresh(&self, cell: &Arc<OperationCell>, id: &str, force: bool) {
        let _gate = cell.refresh_gate.lock().await;
        // double-checked: a reader queued behind a concurrent refresh is
        // satisfied by the snapshot that refresh just wrote
        if !force && !self.is_stale(cell) {
            return;
        }
        if !cell.info.read().status.is_active() {
            return;
        }

        let source = {
            let binding = cell.binding.read();
            match binding.as_ref() {
                None => return,
                Some(bound) => match bound.source() {
                    Some(source) => source,
                    None => {
                        drop(binding);
                        warn!(
                            "Pull source for operation {} is gone, serving cached snapshot",
                            id
                        );
                        *cell.binding.write() = None;
                        return;
                    }
                },
            }
        };

        let status = match source.status().await {
            Ok(status) => status,
            Err(err) => {
                warn!(
                    "Status pull for operation {} failed: {}, serving cached snapshot",
                    id, err
                );
                // rate-limit retries against an unreachable source to the
                // TTL cadence instead of hammering it on every read
                *cell.refreshed_at.lock() = Some(Instant::now());
                return;
            }
        };

        let cursor = *cell.source_cursor.lock();
        let page = match source.metrics(cursor).await {
            Ok(page) => Some(page),
            Err(err) => {
                warn!("Metrics pull for operation {} failed: {}", id, err);
                None
            }
        };

        self.apply_pull(cell, id, status, page);
        *cell.refreshed_at.lock() = Some(Instant::now());
    }

    fn apply_pull(
        &self,
        cell: &Arc<OperationCell>,
        id: &str,
        status: PullStatus,
        page: Option<MetricsPage>,
    ) {
        // metrics first so a terminal status sees its final items in place
        if let Some(page) = page {
            *cell.source_cursor.lock() = page.next_cursor;
            if !page.items.is_empty() {
                let summary = {
                    let mut log = cell.metrics.lock();
                    log.append(page.items);
                    log.summary()
                };
                cell.info.write().metrics = summary;
            }
        }

        let (snapshot, became_terminal) = {
            let mut info = cell.info.write();
            if info.status.is_terminal() {
                return;
            }
            if let Some(progress) = status.progress {
                info.progress = progress;
            }
            append_source_tail(&mut info.warnings, status.warnings);
            append_source_tail(&mut info.errors, status.errors);

            if status.state.is_terminal() && info.status.can_transition_to(status.state) {
                info.status = status.state;
                info.completed_at = Some(Utc::now());
                match status.state {
                    OperationStatus::Completed => {
                        info.progress.percentage = 100.0;
                        if status.result_summary.is_some() {
                            info.result_summary = status.result_summary;
                        }
                    }
                    _ => {
                        if info.error_message.is_none() {
                            info.error_message = status.error_message;
                        }
                    }
                }
                (info.clone(), true)
            } else {
                if status.state.is_terminal() {
                    warn!(
                        "Source reported {} for operation {} in state {}, ignoring",
                        status.state, id, info.status
                    );
                }
                (info.clone(), false)
            }
        };

        if became_terminal {
            self.finish_cell(cell, id);
            info!(
                "Operation {} reached {} via source refresh",
                id, snapshot.status
            );
            self.emit(&snapshot, terminal_event_kind(snapshot.status));
        } else {
            self.emit(&snapshot, OperationEventKind::Progress);
        }
    }
}

/// Source warning/error lists are append-only full views; keep whatever tail
/// this record has not stored yet.
fn append_source_tail(existing: &mut Vec<String>, incoming: Vec<String>) {
    if incoming.len() > existing.len() {
        let seen = existing.len();
        existing.extend(incoming.into_iter().skip(seen));
    }
}

fn terminal_event_kind(status: OperationStatus) -> OperationEventKind {
    match status {
        OperationStatus::Completed => OperationEventKind::Completed,
        OperationStatus::Failed => OperationEventKind::Failed,
        _ => OperationEventKind::Cancelled,
    }
}
