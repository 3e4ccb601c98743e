//! Pull-based metrics plumbing: HTTP fetch policy, text-format parsing and
//! filtering shared by the OpenMetrics and DCGM resources.

pub mod filter;
pub mod parse;

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{Context, Result};
use rand::RngExt;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use tracing::debug;

/// Retry behaviour for endpoint fetches.
#[derive(Debug, Clone)]
pub struct FetchPolicy {
    /// Attempts beyond the first.
    pub retries: u32,
    /// Per-attempt timeout.
    pub timeout: Duration,
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
    /// Jitter fraction applied to each delay, in [0, 1].
    pub jitter: f64,
}

impl Default for FetchPolicy {
    fn default() -> Self {
        Self {
            retries: 3,
            timeout: Duration::from_secs(5),
            backoff_initial: Duration::from_millis(500),
            backoff_max: Duration::from_secs(10),
            jitter: 0.25,
        }
    }
}

/// Exponential backoff delay for the given attempt (1-based), with jitter to
/// spread out concurrent retriers.
fn backoff_delay(policy: &FetchPolicy, attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1).min(16);
    let base_ms = policy.backoff_initial.as_millis() as f64;
    let max_ms = policy.backoff_max.as_millis() as f64;
    let delay_ms = (base_ms * 2f64.powi(exp as i32)).min(max_ms);

    let jitter = policy.jitter.clamp(0.0, 1.0);
    let jitter_ms = delay_ms * jitter * (rand::rng().random::<f64>() - 0.5);
    Duration::from_millis((delay_ms + jitter_ms).max(0.0) as u64)
}

/// HTTP GET with optional headers and a bounded retry loop: transport errors
/// and 5xx responses back off and retry, other non-2xx statuses fail
/// immediately.
#[derive(Debug, Clone)]
pub struct Fetcher {
    client: reqwest::Client,
    policy: FetchPolicy,
}

impl Fetcher {
    pub fn new(headers: &BTreeMap<String, String>, policy: FetchPolicy) -> Result<Self> {
        let mut header_map = HeaderMap::new();
        for (name, value) in headers {
            let name: HeaderName = name.parse().context("invalid header name")?;
            let value: HeaderValue = value.parse().context("invalid header value")?;
            header_map.insert(name, value);
        }

        let client = reqwest::Client::builder()
            .timeout(policy.timeout)
            .default_headers(header_map)
            .build()
            .context("failed to build HTTP client")?;

        Ok(Self { client, policy })
    }

    /// Fetch `url` and return the response body as text.
    pub async fn fetch_text(&self, url: &str) -> Result<String> {
        let mut last_err: Option<anyhow::Error> = None;

        for attempt in 1..=self.policy.retries + 1 {
            match self.client.get(url).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        return resp.text().await.context("reading response body");
                    }
                    if status.is_server_error() {
                        last_err = Some(anyhow::anyhow!("HTTP status {status}"));
                    } else {
                        // Client errors will not heal on retry.
                        anyhow::bail!("HTTP status {status} fetching {url}");
                    }
                }
                Err(e) => last_err = Some(anyhow::Error::new(e).context("request failed")),
            }

            if attempt <= self.policy.retries {
                let delay = backoff_delay(&self.policy, attempt);
                debug!(url = %url, attempt, delay_ms = delay.as_millis() as u64, "Fetch failed, backing off");
                tokio::time::sleep(delay).await;
            }
        }

        Err(last_err
            .unwrap_or_else(|| anyhow::anyhow!("fetch failed"))
            .context(format!("giving up on {url} after {} attempts", self.policy.retries + 1)))
    }
}
