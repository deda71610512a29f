// Cancellation Coordinator - one token per operation, plus a global kill switch
//
// - Tokens are children of a coordinator-wide root token, so cancel_all
//   trips every existing token and any token created afterwards
// - Cancellation is cooperative: domain code polls is_cancelled/check at
//   loop boundaries or suspends on cancelled()
// - release() drops the coordinator's entry once an operation is terminal;
//   clones held by in-flight code keep working

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::CancellationError;

/// Cancellation handle passed to operation workers.
///
/// Cheap to clone; all clones for one operation observe the same state, no
/// matter which thread or task signalled it.
#[derive(Debug, Clone)]
pub struct CancelToken {
    operation_id: String,
    inner: CancellationToken,
    reason: Arc<RwLock<Option<String>>>,
    global_reason: Arc<RwLock<Option<String>>>,
}

impl CancelToken {
    pub fn operation_id(&self) -> &str {
        &self.operation_id
    }

    /// Non-blocking poll.
    pub fn is_cancelled(&self) -> bool {
        self.inner.is_cancelled()
    }

    /// Checkpoint for loop boundaries: returns an error carrying the
    /// operation id, the given call-site label, and the cancellation reason.
    pub fn check(&self, label: &str) -> Result<(), CancellationError> {
        if self.inner.is_cancelled() {
            Err(CancellationError {
                operation_id: self.operation_id.clone(),
                label: label.to_string(),
                reason: self.reason(),
            })
        } else {
            Ok(())
        }
    }

    /// Suspends until the operation is cancelled. Never resolves otherwise.
    pub async fn cancelled(&self) {
        self.inner.cancelled().await
    }

    /// Most specific reason available: per-operation if one was given,
    /// otherwise the global one.
    pub fn reason(&self) -> Option<String> {
        if let Some(r) = self.reason.read().as_ref() {
            return Some(r.clone());
        }
        self.global_reason.read().clone()
    }
}

struct TokenEntry {
    token: CancellationToken,
    reason: Arc<RwLock<Option<String>>>,
}

/// Owns one cancellation token per live operation.
pub struct CancellationCoordinator {
    root: CancellationToken,
    global_reason: Arc<RwLock<Option<String>>>,
    tokens: RwLock<HashMap<String, TokenEntry>>,
}

impl CancellationCoordinator {
    pub fn new() -> Self {
        Self {
            root: CancellationToken::new(),
            global_reason: Arc::new(RwLock::new(None)),
            tokens: RwLock::new(HashMap::new()),
        }
    }

    /// Returns the token for `operation_id`, creating it on first call.
    /// Idempotent: repeated calls hand out handles to the same state. A token
    /// created while a global cancellation is active is born cancelled.
    pub fn create_token(&self, operation_id: &str) -> CancelToken {
        let mut tokens = self.tokens.write();
        let entry = tokens.entry(operation_id.to_string()).or_insert_with(|| {
            debug!("Cancellation token created for operation {}", operation_id);
            TokenEntry {
                token: self.root.child_token(),
                reason: Arc::new(RwLock::new(None)),
            }
        });
        CancelToken {
            operation_id: operation_id.to_string(),
            inner: entry.token.clone(),
            reason: Arc::clone(&entry.reason),
            global_reason: Arc::clone(&self.global_reason),
        }
    }

    /// Signals cancellation for one operation. Returns `true` only when a
    /// token existed and was not already cancelled; unknown ids and repeat
    /// calls return `false` without side effects.
    pub fn cancel(&self, operation_id: &str, reason: Option<&str>) -> bool {
        let tokens = self.tokens.write();
        match tokens.get(operation_id) {
            Some(entry) if entry.token.is_cancelled() => {
                debug!("Cancel of {} ignored, token already cancelled", operation_id);
                false
            }
            Some(entry) => {
                if let Some(r) = reason {
                    *entry.reason.write() = Some(r.to_string());
                }
                entry.token.cancel();
                info!(
                    "Cancellation signalled for operation {} (reason: {})",
                    operation_id,
                    reason.unwrap_or("none")
                );
                true
            }
            None => {
                debug!("Cancel of {} ignored, no token registered", operation_id);
                false
            }
        }
    }

    /// Trips every token at once. Tokens created after this call are born
    /// cancelled with the same reason.
    pub fn cancel_all(&self, reason: Option<&str>) {
        let tokens = self.tokens.write();
        if reason.is_some() {
            *self.global_reason.write() = reason.map(str::to_string);
        }
        self.root.cancel();
        info!(
            "Global cancellation signalled for {} active token(s) (reason: {})",
            tokens.len(),
            reason.unwrap_or("none")
        );
    }

    pub fn global_cancel_active(&self) -> bool {
        self.root.is_cancelled()
    }

    /// Drops the coordinator's entry for a terminal operation. Token clones
    /// already handed out keep observing their final state. Unknown ids and
    /// repeat releases are no-ops.
    pub fn release(&self, operation_id: &str) {
        if self.tokens.write().remove(operation_id).is_some() {
            debug!("Cancellation token released for operation {}", operation_id);
        }
    }

    /// Number of operations currently holding a registered token.
    pub fn active_tokens(&self) -> usize {
        self.tokens.read().len()
    }
}

impl Default for CancellationCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_token_is_idempotent() {
        let coordinator = CancellationCoordinator::new();
        let first = coordinator.create_token("op1");
        let second = coordinator.create_token("op1");
        assert_eq!(coordinator.active_tokens(), 1);

        coordinator.cancel("op1", Some("test"));
        assert!(first.is_cancelled());
        assert!(second.is_cancelled());
    }

    #[test]
    fn test_cancel_returns_true_once() {
        let coordinator = CancellationCoordinator::new();
        let token = coordinator.create_token("op1");

        assert!(coordinator.cancel("op1", Some("stop requested")));
        assert!(!coordinator.cancel("op1", Some("again")));
        assert!(token.is_cancelled());
        assert_eq!(token.reason().as_deref(), Some("stop requested"));
    }

    #[test]
    fn test_cancel_unknown_id_returns_false() {
        let coordinator = CancellationCoordinator::new();
        assert!(!coordinator.cancel("missing", None));
    }

    #[test]
    fn test_check_carries_label_and_reason() {
        let coordinator = CancellationCoordinator::new();
        let token = coordinator.create_token("op1");
        assert!(token.check("before start").is_ok());

        coordinator.cancel("op1", Some("user abort"));
        let err = token.check("epoch 3").unwrap_err();
        assert_eq!(err.operation_id, "op1");
        assert_eq!(err.label, "epoch 3");
        assert_eq!(err.reason.as_deref(), Some("user abort"));
    }

    #[test]
    fn test_cancel_all_trips_existing_and_future_tokens() {
        let coordinator = CancellationCoordinator::new();
        let existing = coordinator.create_token("op1");

        coordinator.cancel_all(Some("shutting down"));
        assert!(existing.is_cancelled());
        assert!(coordinator.global_cancel_active());

        let newborn = coordinator.create_token("op2");
        assert!(newborn.is_cancelled());
        assert_eq!(newborn.reason().as_deref(), Some("shutting down"));
    }

    #[test]
    fn test_per_operation_reason_wins_over_global() {
        let coordinator = CancellationCoordinator::new();
        let token = coordinator.create_token("op1");
        coordinator.cancel("op1", Some("specific"));
        coordinator.cancel_all(Some("global"));
        assert_eq!(token.reason().as_deref(), Some("specific"));
    }

    #[test]
    fn test_release_keeps_live_clones_working() {
        let coordinator = CancellationCoordinator::new();
        let token = coordinator.create_token("op1");
        coordinator.cancel("op1", None);
        coordinator.release("op1");
        coordinator.release("op1"); // repeat is a no-op
        assert_eq!(coordinator.active_tokens(), 0);
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn test_cancelled_future_resolves() {
        let coordinator = Arc::new(CancellationCoordinator::new());
        let token = coordinator.create_token("op1");

        let waiter = tokio::spawn({
            let token = token.clone();
            async move {
                token.cancelled().await;
                true
            }
        });

        coordinator.cancel("op1", Some("wake up"));
        assert!(waiter.await.unwrap());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_cancellation_observed_across_tasks() {
        let coordinator = Arc::new(CancellationCoordinator::new());
        let token = coordinator.create_token("op1");

        let mut watchers = Vec::new();
        for _ in 0..16 {
            let token = token.clone();
            watchers.push(tokio::spawn(async move {
                loop {
                    if token.is_cancelled() {
                        return token.check("watcher loop").unwrap_err();
                    }
                    tokio::task::yield_now().await;
                }
            }));
        }

        let canceller = {
            let coordinator = Arc::clone(&coordinator);
            tokio::spawn(async move {
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                coordinator.cancel("op1", Some("stress"))
            })
        };

        assert!(canceller.await.unwrap());
        for watcher in watchers {
            let err = watcher.await.unwrap();
            assert_eq!(err.reason.as_deref(), Some("stress"));
        }
    }
}
