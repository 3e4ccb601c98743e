use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::openmetrics::filter::{label_hash, LabelIndex, MetricFilter};
use crate::openmetrics::parse::parse_text;
use crate::openmetrics::Fetcher;
use crate::record::{EnvironmentRecord, StatsRecord};
use crate::resources::Resource;

/// One pull-based OpenMetrics endpoint. Each distinct label set of a metric
/// gets a dense index so downstream consumers can group series without the
/// labels themselves.
pub struct OpenMetricsResource {
    endpoint: String,
    url: String,
    fetcher: Fetcher,
    filter: Arc<MetricFilter>,
    /// Only this resource's sampler mutates the index.
    index: Mutex<LabelIndex>,
}

impl OpenMetricsResource {
    pub fn new(endpoint: String, url: String, fetcher: Fetcher, filter: Arc<MetricFilter>) -> Self {
        Self {
            endpoint,
            url,
            fetcher,
            filter,
            index: Mutex::new(LabelIndex::new()),
        }
    }
}

#[async_trait]
impl Resource for OpenMetricsResource {
    fn name(&self) -> &'static str {
        "openmetrics"
    }

    async fn sample(&self) -> Result<Option<StatsRecord>> {
        let body = self
            .fetcher
            .fetch_text(&self.url)
            .await
            .with_context(|| format!("fetching openmetrics endpoint {}", self.endpoint))?;

        let mut rec = StatsRecord::now();
        let mut index = self.index.lock().await;

        for sample in parse_text(&body) {
            if !sample.value.is_finite() {
                continue; // JSON scalars only
            }
            if !self
                .filter
                .should_capture(&self.endpoint, &sample.name, &sample.labels)
            {
                continue;
            }
            let hash = label_hash(&sample.labels);
            let idx = index.index_for(&sample.name, &hash);
            rec.push(
                format!("openmetrics.{}.{}.{idx}", self.endpoint, sample.name),
                sample.value,
            );
        }

        if rec.is_empty() {
            return Ok(None);
        }
        Ok(Some(rec))
    }

    async fn probe(&self, _cancel: &CancellationToken) -> Option<EnvironmentRecord> {
        None
    }
}
