use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Tuning knobs for the orchestration core.
///
/// Callers construct this directly or deserialize it from whatever source the
/// embedding service uses for configuration; this crate does no file or
/// environment loading of its own.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OpsConfig {
    /// How long a cached status snapshot stays fresh before `get` pulls from
    /// the bound source again.
    pub status_cache_ttl_ms: u64,
    /// Terminal records older than this are eligible for the retention
    /// sweeper.
    pub completed_retention_secs: u64,
    /// Capacity of the bounded channel carrying progress snapshots from
    /// workers to the registry dispatcher.
    pub progress_channel_capacity: usize,
    /// Capacity of the broadcast channel carrying operation events.
    pub event_channel_capacity: usize,
    /// Upper bound on waiting for a host service to acknowledge a cancel
    /// before the record is marked cancelled locally anyway.
    pub remote_cancel_ack_timeout_ms: u64,
    /// Host services available for delegated execution, keyed by host name.
    pub host_services: HashMap<String, HostServiceConfig>,
}

impl Default for OpsConfig {
    fn default() -> Self {
        Self {
            status_cache_ttl_ms: 1_000,
            completed_retention_secs: 3_600,
            progress_channel_capacity: 256,
            event_channel_capacity: 1_024,
            remote_cancel_ack_timeout_ms: 5_000,
            host_services: HashMap::new(),
        }
    }
}

impl OpsConfig {
    pub fn status_cache_ttl(&self) -> Duration {
        Duration::from_millis(self.status_cache_ttl_ms)
    }

    pub fn completed_retention(&self) -> Duration {
        Duration::from_secs(self.completed_retention_secs)
    }

    pub fn remote_cancel_ack_timeout(&self) -> Duration {
        Duration::from_millis(self.remote_cancel_ack_timeout_ms)
    }
}

/// Connection settings for one delegated-execution host service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostServiceConfig {
    /// Domain root of the service, e.g. `http://trainer:8005/training`.
    pub base_url: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
}

impl HostServiceConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            enabled: default_enabled(),
            request_timeout_secs: default_request_timeout_secs(),
            max_retries: default_max_retries(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }
}

fn default_enabled() -> bool {
    true
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_base_delay_ms() -> u64 {
    250
}
