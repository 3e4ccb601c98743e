use std::collections::BTreeMap;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::openmetrics::{FetchPolicy, Fetcher};
use crate::record::{EnvironmentRecord, StatsRecord};
use crate::resources::Resource;

const QUERY_API_PATH: &str = "/api/v1/query";

/// Well-known DCGM fields and their canonical GPU-metric names.
const FIELD_MAP: &[(&str, &str)] = &[
    ("DCGM_FI_DEV_GPU_UTIL", "gpu"),
    ("DCGM_FI_DEV_MEM_COPY_UTIL", "memory"),
    ("DCGM_FI_DEV_FB_USED", "memoryUsedMB"),
    ("DCGM_FI_DEV_GPU_TEMP", "temp"),
    ("DCGM_FI_DEV_POWER_USAGE", "powerWatts"),
    ("DCGM_FI_DEV_SM_CLOCK", "smClockMhz"),
];

fn canonical_field(dcgm_name: &str) -> Option<&'static str> {
    FIELD_MAP
        .iter()
        .find(|(name, _)| *name == dcgm_name)
        .map(|(_, canonical)| *canonical)
}

// Prometheus query API response shapes (the subset we read).

#[derive(Debug, Deserialize)]
struct QueryResponse {
    status: String,
    data: QueryData,
}

#[derive(Debug, Deserialize)]
struct QueryData {
    result: Vec<QueryResult>,
}

#[derive(Debug, Deserialize)]
struct QueryResult {
    metric: BTreeMap<String, String>,
    /// `[timestamp, "value"]`
    value: (f64, String),
}

/// GPU metrics scraped from a DCGM exporter's Prometheus query API.
///
/// Only `<base>/api/v1/query?query=...` URLs are supported; a raw `/metrics`
/// endpoint yields no resource. That limitation is deliberate.
pub struct DcgmResource {
    query_url: reqwest::Url,
    queries: Vec<String>,
    fetcher: Fetcher,
}

impl DcgmResource {
    /// Parse the configured URL; None when it is not a query API URL with at
    /// least one `query` parameter.
    pub fn try_new(url: &str, policy: FetchPolicy) -> Option<Self> {
        let parsed = reqwest::Url::parse(url).ok()?;
        if parsed.path() != QUERY_API_PATH {
            return None;
        }
        let queries: Vec<String> = parsed
            .query_pairs()
            .filter(|(k, _)| k == "query")
            .map(|(_, v)| v.into_owned())
            .collect();
        if queries.is_empty() {
            return None;
        }

        let mut query_url = parsed;
        query_url.set_query(None);

        let fetcher = Fetcher::new(&BTreeMap::new(), policy).ok()?;
        Some(Self {
            query_url,
            queries,
            fetcher,
        })
    }

    fn url_for(&self, query: &str) -> reqwest::Url {
        let mut url = self.query_url.clone();
        url.query_pairs_mut().append_pair("query", query);
        url
    }
}

#[async_trait]
impl Resource for DcgmResource {
    fn name(&self) -> &'static str {
        "dcgm"
    }

    async fn sample(&self) -> Result<Option<StatsRecord>> {
        let mut rec = StatsRecord::now();

        for query in &self.queries {
            let body = self
                .fetcher
                .fetch_text(self.url_for(query).as_str())
                .await
                .with_context(|| format!("querying dcgm exporter for {query}"))?;

            let response: QueryResponse = match serde_json::from_str(&body) {
                Ok(r) => r,
                Err(e) => {
                    debug!(query = %query, error = %e, "Skipping malformed query API response");
                    continue;
                }
            };
            if response.status != "success" {
                debug!(query = %query, status = %response.status, "Query API returned non-success");
                continue;
            }

            for result in response.data.result {
                append_result(&mut rec, query, &result);
            }
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

/// Translate one query API vector element into a canonical GPU metric.
/// Unknown DCGM fields and unparsable values are skipped.
fn append_result(rec: &mut StatsRecord, query: &str, result: &QueryResult) {
    let dcgm_name = result
        .metric
        .get("__name__")
        .map(String::as_str)
        .unwrap_or(query);
    let Some(field) = canonical_field(dcgm_name) else {
        return;
    };
    let Some(gpu_index) = result.metric.get("gpu") else {
        return;
    };
    let Ok(value) = result.value.1.parse::<f64>() else {
        return;
    };

    let mut key = format!("gpu.{gpu_index}.{field}");
    // Disambiguate metrics from multiple nodes in a distributed scrape.
    if let Some(hostname) = result.metric.get("Hostname") {
        key = format!("{key}/l:{hostname}");
    }
    rec.push(key, value);
}
