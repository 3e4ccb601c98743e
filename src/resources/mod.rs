pub mod coreweave;
pub mod dcgm;
pub mod openmetrics;
pub mod system;
pub mod tpu;
pub mod trainium;

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::gpu::GpuResourceManager;
use crate::openmetrics::filter::MetricFilter;
use crate::openmetrics::{FetchPolicy, Fetcher};
use crate::record::{EnvironmentRecord, StatsRecord};
use crate::settings::{MonitorSettings, RunHandle};

use self::coreweave::{CoreWeaveResource, GraphqlOrgClient, OrgLookup};
use self::dcgm::DcgmResource;
use self::openmetrics::OpenMetricsResource;
use self::system::SystemResource;
use self::tpu::TpuResource;
use self::trainium::TrainiumResource;

/// One pluggable source of metric samples and/or environment facts.
///
/// Calls are sequential per resource; the monitor imposes all concurrency.
#[async_trait]
pub trait Resource: Send + Sync {
    /// Logical name, used only for diagnostics.
    fn name(&self) -> &'static str;

    /// Measurements produced since the last call, or a snapshot at this
    /// instant. `Ok(None)` means "nothing new": the sampler neither buffers
    /// nor emits.
    async fn sample(&self) -> Result<Option<StatsRecord>>;

    /// One-shot static facts; `None` means no contribution. Implementations
    /// doing I/O must respect `cancel`.
    async fn probe(&self, cancel: &CancellationToken) -> Option<EnvironmentRecord>;

    /// Release external handles held by the resource. Default: nothing.
    async fn close(&self) {}
}

/// Collaborators the registry needs beyond settings.
pub struct ResourceDeps {
    pub gpu_manager: Arc<GpuResourceManager>,
    /// Org lookup used to gate CoreWeave probing. Defaults to a GraphQL
    /// client against `settings.graphql_url` when not supplied.
    pub org_lookup: Option<Arc<dyn OrgLookup>>,
}

/// Build the ordered resource registry for the given settings. Resources
/// whose capability probe or configuration fails are skipped, never added
/// broken.
pub async fn build_registry(
    settings: &MonitorSettings,
    run: &RunHandle,
    deps: &ResourceDeps,
) -> Vec<Arc<dyn Resource>> {
    let mut registry: Vec<Arc<dyn Resource>> = Vec::new();

    registry.push(Arc::new(SystemResource::new(settings)));

    if settings.gpu_helper_binary.is_some() {
        match deps.gpu_manager.acquire().await {
            Ok((client, token)) => {
                registry.push(Arc::new(crate::gpu::resource::GpuResource::new(
                    client,
                    token,
                    Arc::clone(&deps.gpu_manager),
                    settings.pid,
                )));
            }
            Err(e) => {
                warn!(error = %e, "GPU helper unavailable — skipping GPU resource");
            }
        }
    }

    if let Some(tpu) = TpuResource::detect(&settings.tpu_runtime_addr) {
        registry.push(Arc::new(tpu));
    }

    if let Some(trainium) = TrainiumResource::detect(settings.pid) {
        registry.push(Arc::new(trainium));
    }

    let org_lookup = deps.org_lookup.clone().or_else(|| {
        settings
            .graphql_url
            .as_ref()
            .map(|url| Arc::new(GraphqlOrgClient::new(url.clone())) as Arc<dyn OrgLookup>)
    });
    if let (Some(lookup), Some(metadata_url)) = (org_lookup, &settings.coreweave_metadata_url) {
        registry.push(Arc::new(CoreWeaveResource::new(
            lookup,
            metadata_url.clone(),
            run.entity.clone(),
        )));
    }

    if let Some(url) = &settings.dcgm_url {
        match DcgmResource::try_new(url, FetchPolicy::default()) {
            Some(dcgm) => registry.push(Arc::new(dcgm)),
            None => warn!(url = %url, "DCGM exporter URL is not a query API URL — skipping"),
        }
    }

    if !settings.openmetrics_endpoints.is_empty() {
        let filter = Arc::new(MetricFilter::new(settings.openmetrics_filters.clone()));
        match Fetcher::new(&settings.openmetrics_headers, FetchPolicy::default()) {
            Ok(fetcher) => {
                for (name, url) in &settings.openmetrics_endpoints {
                    registry.push(Arc::new(OpenMetricsResource::new(
                        name.clone(),
                        url.clone(),
                        fetcher.clone(),
                        Arc::clone(&filter),
                    )));
                }
            }
            Err(e) => warn!(error = %e, "Invalid OpenMetrics headers — skipping endpoints"),
        }
    }

    info!(
        resources = ?registry.iter().map(|r| r.name()).collect::<Vec<_>>(),
        "Resource registry built"
    );
    registry
}
