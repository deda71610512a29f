use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::config::HostServiceConfig;
use crate::error::{OpsResult, RemoteServiceError};
use crate::registry::{MetricsPage, PullStatus};

/// Ceiling for the exponential backoff between retries.
const MAX_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Returned by a host service when it accepts a delegated session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionStarted {
    pub session_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CancelAck {
    acknowledged: bool,
}

/// HTTP client for one delegated-execution host service.
///
/// The host service contract is four endpoints under the configured domain
/// root: `POST /start`, `GET /status/{session_id}`,
/// `GET /metrics/{session_id}?cursor=N`, `POST /cancel/{session_id}`.
/// Transient failures are retried with exponential backoff up to the
/// configured attempt count before surfacing a [`RemoteServiceError`].
#[derive(Debug)]
pub struct HostServiceClient {
    host: String,
    base_url: String,
    config: HostServiceConfig,
    client: reqwest::Client,
}

impl HostServiceClient {
    pub fn new(host: impl Into<String>, config: HostServiceConfig) -> OpsResult<Self> {
        let host = host.into();
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|err| RemoteServiceError {
                host: host.clone(),
                attempts: 0,
                message: format!("failed to build http client: {err}"),
            })?;
        let base_url = config.base_url.trim_end_matches('/').to_string();
        Ok(Self {
            host,
            base_url,
            config,
            client,
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// Asks the host service to start a session with the given payload.
    pub async fn start_session(&self, payload: &Value) -> OpsResult<SessionStarted> {
        let url = format!("{}/start", self.base_url);
        self.send_with_retry("start", || self.client.post(&url).json(payload))
            .await
    }

    pub async fn session_status(&self, session_id: &str) -> OpsResult<PullStatus> {
        let url = format!("{}/status/{}", self.base_url, session_id);
        self.send_with_retry("status", || self.client.get(&url))
            .await
    }

    pub async fn session_metrics(&self, session_id: &str, cursor: u64) -> OpsResult<MetricsPage> {
        let url = format!("{}/metrics/{}", self.base_url, session_id);
        self.send_with_retry("metrics", || {
            self.client.get(&url).query(&[("cursor", cursor)])
        })
        .await
    }

    /// Forwards a cancel for the session. Returns whether the host
    /// acknowledged it; callers bound the overall wait themselves.
    pub async fn cancel_session(&self, session_id: &str) -> OpsResult<bool> {
        let url = format!("{}/cancel/{}", self.base_url, session_id);
        let ack: CancelAck = self
            .send_with_retry("cancel", || self.client.post(&url))
            .await?;
        Ok(ack.acknowledged)
    }

    async fn send_with_retry<T>(
        &self,
        endpoint: &str,
        build: impl Fn() -> reqwest::RequestBuilder,
    ) -> OpsResult<T>
    where
        T: serde::de::DeserializeOwned,
    {
        let max_attempts = self.config.max_retries.max(1);
        let mut delay = self.config.retry_base_delay();
        let mut attempt = 0;

        loop {
            attempt += 1;
            let result = async {
                let response = build().send().await?;
                let response = response.error_for_status()?;
                response.json::<T>().await
            }
            .await;

            match result {
                Ok(value) => return Ok(value),
                Err(err) if attempt >= max_attempts => {
                    return Err(RemoteServiceError {
                        host: self.host.clone(),
                        attempts: attempt,
                        message: err.to_string(),
                    }
                    .into());
                }
                Err(err) => {
                    warn!(
                        "Host service '{}' {} request failed on attempt {}: {}, retrying",
                        self.host, endpoint, attempt, err
                    );
                    tokio::time::sleep(delay).await;
                    delay = std::cmp::min(delay * 2, MAX_RETRY_DELAY);
                }
            }
        }
    }
}
