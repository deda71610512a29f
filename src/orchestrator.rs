// Operation Orchestrator - composition root for managed operations
//
// Wires the cancellation coordinator, the registry, the host service
// clients, and the progress dispatch channel together, and owns the worker
// boundary that turns a domain future's outcome into a registry transition.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde_json::{Map, Value};
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::cancel::{CancelToken, CancellationCoordinator};
use crate::config::OpsConfig;
use crate::error::{CancellationError, OpsError, OpsResult};
use crate::progress::{ProgressManager, ProgressRenderer, ProgressUpdate};
use crate::registry::{
    OperationEvent, OperationMetadata, OperationRegistry, OperationType, StartedOperation,
};
use crate::remote::{HostServiceClient, RemoteSessionProxy};

const RETENTION_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// What a managed operation's body receives: its id, a cooperative
/// cancellation token, and a progress manager already wired to the registry.
#[derive(Clone)]
pub struct OperationContext {
    pub operation_id: String,
    pub token: CancelToken,
    pub progress: ProgressManager,
}

/// How a managed operation's body finished, when it finished on its own.
#[derive(Debug)]
pub enum OperationOutcome {
    /// The work ran to completion in this process.
    Completed { result: Map<String, Value> },
    /// The work was handed to a host service. The registry keeps the record
    /// Running and pulls further state from the remote session; only the
    /// pull refresh may mark it terminal.
    Delegated { host: String, session_id: String },
}

/// Composition root. One instance per service process; everything managed
/// operations need is reachable from here, no globals.
pub struct OperationOrchestrator {
    coordinator: Arc<CancellationCoordinator>,
    registry: Arc<OperationRegistry>,
    host_clients: HashMap<String, Arc<HostServiceClient>>,
    progress_tx: mpsc::Sender<ProgressUpdate>,
    renderers: RwLock<HashMap<OperationType, Arc<dyn ProgressRenderer>>>,
}

impl OperationOrchestrator {
    pub fn new(config: OpsConfig) -> OpsResult<Self> {
        let coordinator = Arc::new(CancellationCoordinator::new());
        let registry = Arc::new(OperationRegistry::new(Arc::clone(&coordinator), &config));

        let mut host_clients = HashMap::new();
        for (host, host_config) in &config.host_services {
            if !host_config.enabled {
                info!("Host service '{}' is disabled, skipping", host);
                continue;
            }
            let client = HostServiceClient::new(host.clone(), host_config.clone())?;
            host_clients.insert(host.clone(), Arc::new(client));
            info!("Host service '{}' registered at {}", host, host_config.base_url);
        }

        let (progress_tx, progress_rx) = mpsc::channel(config.progress_channel_capacity);
        Self::start_dispatcher(Arc::clone(&registry), progress_rx);
        registry.spawn_retention_sweeper(RETENTION_SWEEP_INTERVAL);

        Ok(Self {
            coordinator,
            registry,
            host_clients,
            progress_tx,
            renderers: RwLock::new(HashMap::new()),
        })
    }

    /// The dispatcher is the only writer applying worker progress to the
    /// registry, so snapshots land in channel order.
    fn start_dispatcher(registry: Arc<OperationRegistry>, mut rx: mpsc::Receiver<ProgressUpdate>) {
        tokio::spawn(async move {
            while let Some(update) = rx.recv().await {
                if let Err(err) = registry.update_progress(
                    &update.operation_id,
                    update.progress,
                    update.warnings,
                    update.errors,
                ) {
                    debug!(
                        "Progress update for {} dropped: {}",
                        update.operation_id, err
                    );
                }
            }
            debug!("Progress dispatcher stopped");
        });
    }

    /// Races a future against the token. The token is checked before the
    /// future is polled at all, so work never starts under an already
    /// cancelled token; if the token wins the race the result is
    /// `OpsError::Cancelled` carrying `label`, never a panic.
    pub async fn execute_with_cancellation<F, T>(
        &self,
        fut: F,
        token: &CancelToken,
        label: &str,
    ) -> OpsResult<T>
    where
        F: Future<Output = OpsResult<T>>,
    {
        token.check(label)?;
        tokio::select! {
            _ = token.cancelled() => {
                debug!(
                    "Operation {} cancelled while awaiting '{}'",
                    token.operation_id(),
                    label
                );
                Err(CancellationError {
                    operation_id: token.operation_id().to_string(),
                    label: label.to_string(),
                    reason: token.reason(),
                }
                .into())
            }
            result = fut => result,
        }
    }

    /// Injects wording for progress lines of one operation type. Applies to
    /// managers created after the call.
    pub fn register_renderer(&self, op_type: OperationType, renderer: Arc<dyn ProgressRenderer>) {
        self.renderers.write().insert(op_type, renderer);
    }

    /// Creates the record, issues the token, wires a progress manager, and
    /// spawns `func` as a supervised worker. Returns as soon as the record
    /// is Running; the worker's outcome lands in the registry asynchronously.
    pub fn start_managed_operation<F, Fut>(
        &self,
        name: &str,
        op_type: OperationType,
        metadata: OperationMetadata,
        func: F,
    ) -> OpsResult<StartedOperation>
    where
        F: FnOnce(OperationContext) -> Fut + Send + 'static,
        Fut: Future<Output = Result<OperationOutcome, anyhow::Error>> + Send + 'static,
    {
        if name.trim().is_empty() {
            return Err(OpsError::Validation(
                "operation name must not be empty".to_string(),
            ));
        }

        let info = self.registry.create(name, op_type, metadata)?;
        let operation_id = info.id;
        let token = self.coordinator.create_token(&operation_id);
        let renderer = self.renderers.read().get(&op_type).cloned();
        let progress =
            ProgressManager::new(operation_id.clone(), self.progress_tx.clone(), renderer);
        let context = OperationContext {
            operation_id: operation_id.clone(),
            token: token.clone(),
            progress,
        };

        // The worker must not run domain code before the registry shows
        // Running and holds the abort handle, or an early cancel could miss
        // it. The gate closes that window.
        let (gate_tx, gate_rx) = oneshot::channel::<()>();
        let registry = Arc::clone(&self.registry);
        let hosts = self.host_clients.clone();
        let worker_id = operation_id.clone();
        let handle = tokio::spawn(async move {
            if gate_rx.await.is_err() {
                debug!("Start gate for operation {} dropped, worker exiting", worker_id);
                return;
            }
            let outcome = func(context).await;
            finish_worker(registry, hosts, worker_id, token, outcome).await;
        });

        self.registry.attach_handle(&operation_id, handle.abort_handle())?;
        self.registry.start(&operation_id)?;
        if gate_tx.send(()).is_err() {
            // worker was aborted before the gate opened; the registry
            // already holds the terminal state that caused it
            debug!("Worker for operation {} gone before start gate opened", operation_id);
        }

        info!("Operation {} submitted as managed {} work", operation_id, op_type);
        Ok(StartedOperation::new(operation_id))
    }

    /// Cancels one operation. Coordinator signal, handle interrupt, and
    /// remote propagation ordering all live in the registry.
    pub async fn cancel_operation(&self, operation_id: &str, reason: Option<&str>) -> OpsResult<bool> {
        self.registry.cancel(operation_id, reason).await
    }

    /// Trips the global cancel flag, then drains every active record.
    /// Tokens created after this call are born cancelled.
    pub async fn shutdown(&self, reason: Option<&str>) {
        info!(
            "Shutting down orchestration core (reason: {})",
            reason.unwrap_or("none")
        );
        self.coordinator.cancel_all(reason);
        let cancelled = self.registry.cancel_active(reason).await;
        if !cancelled.is_empty() {
            info!(
                "{} active operation(s) cancelled during shutdown",
                cancelled.len()
            );
        }
    }

    pub fn registry(&self) -> &Arc<OperationRegistry> {
        &self.registry
    }

    pub fn coordinator(&self) -> &Arc<CancellationCoordinator> {
        &self.coordinator
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<OperationEvent> {
        self.registry.subscribe()
    }
}

/// Maps the worker's outcome to a registry transition. Domain errors never
/// escape the worker task.
async fn finish_worker(
    registry: Arc<OperationRegistry>,
    hosts: HashMap<String, Arc<HostServiceClient>>,
    operation_id: String,
    token: CancelToken,
    outcome: Result<OperationOutcome, anyhow::Error>,
) {
    match outcome {
        Ok(OperationOutcome::Completed { result }) => {
            let summary = if result.is_empty() { None } else { Some(result) };
            if let Err(err) = registry.complete(&operation_id, summary) {
                debug!("Completion of {} not recorded: {}", operation_id, err);
            }
        }
        Ok(OperationOutcome::Delegated { host, session_id }) => match hosts.get(&host) {
            Some(client) => {
                let proxy = RemoteSessionProxy::new(Arc::clone(client), session_id);
                if let Err(err) = registry.register_remote_proxy(&operation_id, proxy) {
                    warn!("Remote binding for {} failed: {}", operation_id, err);
                    let _ = registry.fail(
                        &operation_id,
                        format!("delegation could not be recorded: {err}"),
                    );
                }
                // record stays Running; the pull refresh decides the outcome
            }
            None => {
                error!(
                    "Operation {} delegated to unconfigured host '{}'",
                    operation_id, host
                );
                let _ = registry.fail(&operation_id, format!("unknown host service '{host}'"));
            }
        },
        Err(err) => {
            let cancelled = token.is_cancelled()
                || err
                    .chain()
                    .any(|cause| cause.downcast_ref::<CancellationError>().is_some());
            if cancelled {
                // cancelling from inside the worker aborts our own handle;
                // the bookkeeping after the abort is synchronous, so the
                // terminal mark still lands before this task can die
                match registry.cancel(&operation_id, token.reason().as_deref()).await {
                    Ok(_) => {}
                    Err(cancel_err) => debug!(
                        "Cancellation of {} not recorded: {}",
                        operation_id, cancel_err
                    ),
                }
            } else {
                error!("Operation {} failed: {:#}", operation_id, err);
                let _ = registry.fail(&operation_id, format!("{err:#}"));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HostServiceConfig;
    use crate::progress::DefaultRenderer;
    use crate::registry::{OperationInfo, OperationStatus};
    use anyhow::anyhow;
    use serde_json::json;
    use tokio::time::sleep;

    async fn wait_for_status(
        registry: &OperationRegistry,
        id: &str,
        status: OperationStatus,
    ) -> OperationInfo {
        for _ in 0..200 {
            let info = registry.get(id, false).await.unwrap();
            if info.status == status {
                return info;
            }
            sleep(Duration::from_millis(10)).await;
        }
        panic!("operation {id} never reached {status}");
    }

    #[tokio::test]
    async fn test_empty_name_is_rejected() {
        let orchestrator = OperationOrchestrator::new(OpsConfig::default()).unwrap();
        let err = orchestrator
            .start_managed_operation("  ", OperationType::Other, OperationMetadata::default(), |_| async {
                Ok(OperationOutcome::Completed { result: Map::new() })
            })
            .unwrap_err();
        assert!(matches!(err, OpsError::Validation(_)));
    }

    #[tokio::test]
    async fn test_managed_operation_runs_to_completed() {
        let orchestrator = OperationOrchestrator::new(OpsConfig::default()).unwrap();
        let started = orchestrator
            .start_managed_operation(
                "nightly backtest",
                OperationType::Backtest,
                OperationMetadata::default(),
                |ctx| async move {
                    ctx.progress.start_operation(2, Map::new());
                    ctx.progress.start_step("warmup", 1, 0.0, 50.0);
                    ctx.progress.update_step_progress(1, 2, Some(10), None);
                    ctx.progress.complete_operation();
                    let mut result = Map::new();
                    result.insert("sharpe".to_string(), json!(1.8));
                    Ok(OperationOutcome::Completed { result })
                },
            )
            .unwrap();
        assert_eq!(started.status, "started");

        let registry = orchestrator.registry();
        let info = wait_for_status(registry, &started.operation_id, OperationStatus::Completed).await;
        assert_eq!(info.progress.percentage, 100.0);
        assert_eq!(
            info.result_summary.as_ref().and_then(|s| s.get("sharpe")),
            Some(&json!(1.8))
        );
        assert_eq!(orchestrator.coordinator().active_tokens(), 0);
    }

    #[tokio::test]
    async fn test_worker_error_marks_failed() {
        let orchestrator = OperationOrchestrator::new(OpsConfig::default()).unwrap();
        let started = orchestrator
            .start_managed_operation(
                "load candles",
                OperationType::DataLoad,
                OperationMetadata::default(),
                |_ctx| async move { Err(anyhow!("feed connection dropped")) },
            )
            .unwrap();

        let info = wait_for_status(
            orchestrator.registry(),
            &started.operation_id,
            OperationStatus::Failed,
        )
        .await;
        assert!(info
            .error_message
            .as_deref()
            .unwrap()
            .contains("feed connection dropped"));
    }

    #[tokio::test]
    async fn test_cancel_interrupts_running_worker() {
        let orchestrator = OperationOrchestrator::new(OpsConfig::default()).unwrap();
        let started = orchestrator
            .start_managed_operation(
                "slow training",
                OperationType::Training,
                OperationMetadata::default(),
                |ctx| async move {
                    loop {
                        ctx.token.check("epoch loop")?;
                        sleep(Duration::from_millis(5)).await;
                    }
                },
            )
            .unwrap();

        sleep(Duration::from_millis(25)).await;
        assert!(orchestrator
            .cancel_operation(&started.operation_id, Some("operator stop"))
            .await
            .unwrap());

        let info = wait_for_status(
            orchestrator.registry(),
            &started.operation_id,
            OperationStatus::Cancelled,
        )
        .await;
        assert_eq!(info.error_message.as_deref(), Some("operator stop"));
        assert_eq!(orchestrator.coordinator().active_tokens(), 0);
    }

    #[tokio::test]
    async fn test_global_cancel_poisons_later_operations() {
        let orchestrator = OperationOrchestrator::new(OpsConfig::default()).unwrap();
        orchestrator.coordinator().cancel_all(Some("maintenance window"));

        let started = orchestrator
            .start_managed_operation(
                "late arrival",
                OperationType::Indicator,
                OperationMetadata::default(),
                |ctx| async move {
                    ctx.token.check("init")?;
                    Ok(OperationOutcome::Completed { result: Map::new() })
                },
            )
            .unwrap();

        let info = wait_for_status(
            orchestrator.registry(),
            &started.operation_id,
            OperationStatus::Cancelled,
        )
        .await;
        assert_eq!(info.error_message.as_deref(), Some("maintenance window"));
    }

    #[tokio::test]
    async fn test_execute_with_cancellation_checks_before_polling() {
        let orchestrator = OperationOrchestrator::new(OpsConfig::default()).unwrap();
        orchestrator.coordinator().cancel_all(Some("halted"));
        let token = orchestrator.coordinator().create_token("op_pre");

        let err = orchestrator
            .execute_with_cancellation(async { Ok(42u32) }, &token, "warmup")
            .await
            .unwrap_err();
        match err {
            OpsError::Cancelled(cancelled) => {
                assert_eq!(cancelled.operation_id, "op_pre");
                assert_eq!(cancelled.label, "warmup");
                assert_eq!(cancelled.reason.as_deref(), Some("halted"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_execute_with_cancellation_passes_domain_errors_through() {
        let orchestrator = OperationOrchestrator::new(OpsConfig::default()).unwrap();
        let token = orchestrator.coordinator().create_token("op_calc");

        let result: OpsResult<f64> = orchestrator
            .execute_with_cancellation(
                async {
                    Err(OpsError::Execution {
                        operation_id: "op_calc".to_string(),
                        source: anyhow!("series produced NaN"),
                    })
                },
                &token,
                "compute indicator",
            )
            .await;
        match result.unwrap_err() {
            OpsError::Execution { operation_id, .. } => assert_eq!(operation_id, "op_calc"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_execute_with_cancellation_wins_race() {
        let orchestrator = OperationOrchestrator::new(OpsConfig::default()).unwrap();
        let token = orchestrator.coordinator().create_token("op_race");

        let coordinator = Arc::clone(orchestrator.coordinator());
        tokio::spawn(async move {
            sleep(Duration::from_millis(20)).await;
            coordinator.cancel("op_race", Some("too slow"));
        });

        let begin = std::time::Instant::now();
        let err = orchestrator
            .execute_with_cancellation(
                async {
                    sleep(Duration::from_secs(30)).await;
                    Ok(())
                },
                &token,
                "long fetch",
            )
            .await
            .unwrap_err();
        assert!(begin.elapsed() < Duration::from_secs(5));
        assert!(matches!(err, OpsError::Cancelled(_)));
    }

    #[tokio::test]
    async fn test_delegated_outcome_keeps_record_running() {
        let mut config = OpsConfig::default();
        let mut trainer = HostServiceConfig::new("http://127.0.0.1:1/training");
        trainer.max_retries = 1;
        trainer.request_timeout_secs = 1;
        config.host_services.insert("trainer".to_string(), trainer);
        let orchestrator = OperationOrchestrator::new(config).unwrap();

        let started = orchestrator
            .start_managed_operation(
                "remote training",
                OperationType::Training,
                OperationMetadata::default(),
                |_ctx| async move {
                    Ok(OperationOutcome::Delegated {
                        host: "trainer".to_string(),
                        session_id: "sess-77".to_string(),
                    })
                },
            )
            .unwrap();

        // wait for the worker to bind the proxy
        let registry = orchestrator.registry();
        let mut bound = None;
        for _ in 0..200 {
            let info = registry.get(&started.operation_id, false).await.unwrap();
            if info.remote_session.is_some() {
                bound = Some(info);
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
        let info = bound.expect("remote session never bound");
        assert_eq!(info.status, OperationStatus::Running);
        let session = info.remote_session.unwrap();
        assert_eq!(session.host, "trainer");
        assert_eq!(session.session_id, "sess-77");

        // the host is unreachable; a forced refresh serves the cached
        // snapshot instead of failing the record
        let info = registry.get(&started.operation_id, true).await.unwrap();
        assert_eq!(info.status, OperationStatus::Running);
    }

    #[tokio::test]
    async fn test_delegation_to_unknown_host_fails_record() {
        let orchestrator = OperationOrchestrator::new(OpsConfig::default()).unwrap();
        let started = orchestrator
            .start_managed_operation(
                "remote training",
                OperationType::Training,
                OperationMetadata::default(),
                |_ctx| async move {
                    Ok(OperationOutcome::Delegated {
                        host: "nobody".to_string(),
                        session_id: "sess-1".to_string(),
                    })
                },
            )
            .unwrap();

        let info = wait_for_status(
            orchestrator.registry(),
            &started.operation_id,
            OperationStatus::Failed,
        )
        .await;
        assert!(info.error_message.unwrap().contains("unknown host service"));
    }

    #[tokio::test]
    async fn test_registered_renderer_shapes_progress_message() {
        let orchestrator = OperationOrchestrator::new(OpsConfig::default()).unwrap();
        orchestrator.register_renderer(OperationType::DataLoad, Arc::new(DefaultRenderer));

        let started = orchestrator
            .start_managed_operation(
                "load candles",
                OperationType::DataLoad,
                OperationMetadata::default(),
                |ctx| async move {
                    ctx.progress.start_operation(1, Map::new());
                    ctx.progress.start_step("fetch candles", 1, 0.0, 100.0);
                    ctx.progress.update_step_progress(1, 2, Some(500), None);
                    sleep(Duration::from_millis(100)).await;
                    Ok(OperationOutcome::Completed { result: Map::new() })
                },
            )
            .unwrap();

        let registry = orchestrator.registry();
        let mut message = None;
        for _ in 0..200 {
            let info = registry.get(&started.operation_id, false).await.unwrap();
            if let Some(text) = info.progress.message.clone() {
                message = Some(text);
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
        let message = message.expect("no rendered progress message arrived");
        assert!(message.contains("fetch candles"), "got: {message}");

        wait_for_status(registry, &started.operation_id, OperationStatus::Completed).await;
    }

    #[tokio::test]
    async fn test_shutdown_cancels_active_and_poisons_new_tokens() {
        let orchestrator = OperationOrchestrator::new(OpsConfig::default()).unwrap();
        let started = orchestrator
            .start_managed_operation(
                "long running",
                OperationType::Other,
                OperationMetadata::default(),
                |ctx| async move {
                    ctx.token.cancelled().await;
                    Err(anyhow!(CancellationError {
                        operation_id: ctx.operation_id.clone(),
                        label: "main loop".to_string(),
                        reason: ctx.token.reason(),
                    }))
                },
            )
            .unwrap();

        sleep(Duration::from_millis(25)).await;
        orchestrator.shutdown(Some("deploy")).await;

        let info = wait_for_status(
            orchestrator.registry(),
            &started.operation_id,
            OperationStatus::Cancelled,
        )
        .await;
        assert_eq!(info.error_message.as_deref(), Some("deploy"));
        assert!(orchestrator.coordinator().global_cancel_active());
        assert!(orchestrator.coordinator().create_token("post_shutdown").is_cancelled());
    }
}
