use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::openmetrics::filter::FilterSpec;

/// Identity of the run this monitor reports for. Supplied by the embedding
/// application's run handle.
#[derive(Debug, Clone, Default)]
pub struct RunHandle {
    /// Entity owning the run; input to the CoreWeave org lookup.
    pub entity: String,

    /// Opaque identifier of the process emitting records.
    pub writer_id: String,
}

/// Static facts the embedding application already knows about itself.
/// Used to synthesize the initial environment record on start.
#[derive(Debug, Clone, Default)]
pub struct EnvironmentHints {
    pub os: Option<String>,
    pub python: Option<String>,
    pub host: Option<String>,
    pub program: Option<String>,
    pub args: Vec<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub git_commit: Option<String>,
    pub git_remote: Option<String>,
}

#[derive(Debug, Clone)]
pub struct MonitorSettings {
    /// Seconds between samples for every resource (env: SYSMON_SAMPLING_INTERVAL)
    pub sampling_interval: Duration,

    /// Per-key buffer capacity: N>0 bounded, 0 disabled, -1 unbounded
    /// (env: SYSMON_BUFFER_SIZE)
    pub buffer_size: i32,

    /// Optional node label; emitted keys become "<key>/l:<label>"
    /// (env: SYSMON_NODE_LABEL)
    pub label: Option<String>,

    /// Mount paths to report disk usage for (env: SYSMON_DISK_PATHS, comma-separated)
    pub disk_paths: Vec<String>,

    /// Process whose CPU/memory/GPU usage is attributed (default: this process)
    pub pid: u32,

    /// Gather and emit machine facts on start (env: SYSMON_MACHINE_INFO)
    pub machine_info_enabled: bool,

    /// Whether this instance is the primary writer for the run.
    /// Only the primary synthesizes the settings-derived environment record.
    pub primary: bool,

    /// Path to the GPU helper binary; GPU sampling is skipped when unset
    /// (env: SYSMON_GPU_HELPER)
    pub gpu_helper_binary: Option<PathBuf>,

    /// Directory the helper writes its portfile into (default: temp dir)
    pub portfile_dir: PathBuf,

    /// TPU runtime gRPC endpoint (env: SYSMON_TPU_RUNTIME_ADDR)
    pub tpu_runtime_addr: String,

    /// OpenMetrics endpoints, name → URL
    /// (env: SYSMON_OPENMETRICS_ENDPOINTS, JSON object)
    pub openmetrics_endpoints: BTreeMap<String, String>,

    /// Extra headers sent with every OpenMetrics fetch (e.g. Authorization)
    pub openmetrics_headers: BTreeMap<String, String>,

    /// Metric filters applied to OpenMetrics samples; empty passes everything
    pub openmetrics_filters: FilterSpec,

    /// DCGM exporter query URL: <base>/api/v1/query?query=... (env: SYSMON_DCGM_URL)
    pub dcgm_url: Option<String>,

    /// CoreWeave instance-metadata document URL (env: SYSMON_COREWEAVE_METADATA_URL)
    pub coreweave_metadata_url: Option<String>,

    /// Backend GraphQL endpoint for the CoreWeave org lookup
    /// (env: SYSMON_GRAPHQL_URL)
    pub graphql_url: Option<String>,

    /// Facts used to synthesize the start-time environment record.
    pub environment: EnvironmentHints,

    /// User-supplied override; takes precedence over probed values.
    pub cpu_count_override: Option<u32>,

    /// User-supplied override; takes precedence over probed values.
    pub gpu_count_override: Option<u32>,

    /// User-supplied override; takes precedence over probed values.
    pub gpu_type_override: Option<String>,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            sampling_interval: Duration::from_secs(15),
            buffer_size: 32,
            label: None,
            disk_paths: vec!["/".to_string()],
            pid: std::process::id(),
            machine_info_enabled: true,
            primary: true,
            gpu_helper_binary: None,
            portfile_dir: std::env::temp_dir(),
            tpu_runtime_addr: "http://localhost:8431".to_string(),
            openmetrics_endpoints: BTreeMap::new(),
            openmetrics_headers: BTreeMap::new(),
            openmetrics_filters: FilterSpec::default(),
            dcgm_url: None,
            coreweave_metadata_url: None,
            graphql_url: None,
            environment: EnvironmentHints::default(),
            cpu_count_override: None,
            gpu_count_override: None,
            gpu_type_override: None,
        }
    }
}

impl MonitorSettings {
    /// Build settings from the environment, falling back to defaults.
    /// Endpoint maps and filters are normally supplied programmatically; the
    /// env path exists for standalone deployments.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            sampling_interval: std::env::var("SYSMON_SAMPLING_INTERVAL")
                .ok()
                .and_then(|v| v.parse::<f64>().ok())
                .filter(|s| *s > 0.0)
                .map(Duration::from_secs_f64)
                .unwrap_or(defaults.sampling_interval),
            buffer_size: std::env::var("SYSMON_BUFFER_SIZE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.buffer_size),
            label: std::env::var("SYSMON_NODE_LABEL")
                .ok()
                .filter(|s| !s.is_empty()),
            disk_paths: std::env::var("SYSMON_DISK_PATHS")
                .map(|v| {
                    v.split(',')
                        .map(|s| s.trim().to_string())
                        .filter(|s| !s.is_empty())
                        .collect()
                })
                .ok()
                .filter(|v: &Vec<String>| !v.is_empty())
                .unwrap_or_else(|| defaults.disk_paths.clone()),
            machine_info_enabled: std::env::var("SYSMON_MACHINE_INFO")
                .map(|v| !v.eq_ignore_ascii_case("false"))
                .unwrap_or(true),
            gpu_helper_binary: std::env::var("SYSMON_GPU_HELPER")
                .ok()
                .filter(|s| !s.is_empty())
                .map(PathBuf::from),
            tpu_runtime_addr: std::env::var("SYSMON_TPU_RUNTIME_ADDR")
                .unwrap_or_else(|_| defaults.tpu_runtime_addr.clone()),
            openmetrics_endpoints: std::env::var("SYSMON_OPENMETRICS_ENDPOINTS")
                .ok()
                .and_then(|v| serde_json::from_str(&v).ok())
                .unwrap_or_default(),
            dcgm_url: std::env::var("SYSMON_DCGM_URL").ok().filter(|s| !s.is_empty()),
            coreweave_metadata_url: std::env::var("SYSMON_COREWEAVE_METADATA_URL")
                .ok()
                .filter(|s| !s.is_empty()),
            graphql_url: std::env::var("SYSMON_GRAPHQL_URL")
                .ok()
                .filter(|s| !s.is_empty()),
            ..defaults
        }
    }

    /// Suffix a metric key with the configured node label, if any.
    pub fn labeled_key(&self, key: &str) -> String {
        match &self.label {
            Some(label) => format!("{key}/l:{label}"),
            None => key.to_string(),
        }
    }
}
