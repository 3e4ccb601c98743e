use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::client::GpuHelperClient;
use super::{AcquireToken, GpuResourceManager};
use crate::record::{EnvironmentRecord, StatsItem, StatsRecord};
use crate::resources::Resource;

/// GPU metrics via the shared out-of-process helper. The real sampling lives
/// in the helper; this resource only translates its responses.
pub struct GpuResource {
    client: Mutex<GpuHelperClient>,
    token: Mutex<Option<AcquireToken>>,
    manager: Arc<GpuResourceManager>,
    pid: u32,
}

impl GpuResource {
    pub fn new(
        client: GpuHelperClient,
        token: AcquireToken,
        manager: Arc<GpuResourceManager>,
        pid: u32,
    ) -> Self {
        Self {
            client: Mutex::new(client),
            token: Mutex::new(Some(token)),
            manager,
            pid,
        }
    }
}

#[async_trait]
impl Resource for GpuResource {
    fn name(&self) -> &'static str {
        "gpu"
    }

    async fn sample(&self) -> Result<Option<StatsRecord>> {
        let mut client = self.client.lock().await;
        let response = client
            .get_stats(self.pid, &[])
            .await
            .context("fetching gpu stats")?;

        if response.entries.is_empty() {
            return Ok(None);
        }

        let timestamp = match response.timestamp_us {
            us if us > 0 => DateTime::<Utc>::from_timestamp_micros(us).unwrap_or_else(Utc::now),
            _ => Utc::now(),
        };

        let items = response
            .entries
            .into_iter()
            .map(|e| StatsItem {
                key: e.key,
                value_json: e.value_json,
            })
            .collect();

        Ok(Some(StatsRecord { timestamp, items }))
    }

    async fn probe(&self, cancel: &CancellationToken) -> Option<EnvironmentRecord> {
        let mut client = self.client.lock().await;
        let response = tokio::select! {
            _ = cancel.cancelled() => return None,
            resp = client.get_metadata() => resp,
        };

        match response {
            Ok(metadata) => match serde_json::from_str(&metadata.metadata_json) {
                Ok(env) => Some(env),
                Err(e) => {
                    debug!(error = %e, "GPU helper metadata was not a valid environment fragment");
                    None
                }
            },
            Err(e) => {
                debug!(error = %e, "GPU helper metadata fetch failed");
                None
            }
        }
    }

    async fn close(&self) {
        if let Some(token) = self.token.lock().await.take() {
            self.manager.release(token).await;
        }
    }
}
