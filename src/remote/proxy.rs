use std::sync::Arc;

use async_trait::async_trait;

use crate::error::OpsResult;
use crate::registry::{MetricsPage, PullSource, PullStatus};

use super::client::HostServiceClient;

/// [`PullSource`] over one delegated session on a host service. The registry
/// refreshes through this exactly as it would through an in-process bridge.
#[derive(Debug, Clone)]
pub struct RemoteSessionProxy {
    client: Arc<HostServiceClient>,
    session_id: String,
}

impl RemoteSessionProxy {
    pub fn new(client: Arc<HostServiceClient>, session_id: impl Into<String>) -> Self {
        Self {
            client,
            session_id: session_id.into(),
        }
    }

    pub fn host(&self) -> &str {
        self.client.host()
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Forwards the cancel and reports whether the host acknowledged it.
    pub async fn cancel(&self) -> OpsResult<bool> {
        self.client.cancel_session(&self.session_id).await
    }
}

#[async_trait]
impl PullSource for RemoteSessionProxy {
    async fn status(&self) -> OpsResult<PullStatus> {
        self.client.session_status(&self.session_id).await
    }

    async fn metrics(&self, cursor: u64) -> OpsResult<MetricsPage> {
        self.client.session_metrics(&self.session_id, cursor).await
    }
}
