use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex as StdMutex};

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::record::{EnvironmentRecord, StatsRecord, TrainiumFacts};
use crate::resources::Resource;

const NEURON_MONITOR: &str = "neuron-monitor";

struct MonitorProcess {
    child: Child,
    reader: JoinHandle<()>,
}

/// Trainium / Neuron metrics, polled from a long-running `neuron-monitor`
/// subprocess whose stdout is newline-delimited JSON reports.
pub struct TrainiumResource {
    pid: u32,
    /// Latest report seen on the subprocess stdout.
    latest: Arc<StdMutex<Option<serde_json::Value>>>,
    process: Mutex<Option<MonitorProcess>>,
}

impl TrainiumResource {
    /// Available only when the Neuron tooling is on PATH. The subprocess is
    /// started lazily at the first sample.
    pub fn detect(pid: u32) -> Option<Self> {
        find_in_path(NEURON_MONITOR)?;
        Some(Self {
            pid,
            latest: Arc::new(StdMutex::new(None)),
            process: Mutex::new(None),
        })
    }

    async fn ensure_started(&self) -> Result<()> {
        let mut process = self.process.lock().await;
        if process.is_some() {
            return Ok(());
        }

        let mut child = Command::new(NEURON_MONITOR)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .context("spawning neuron-monitor")?;

        let stdout = child
            .stdout
            .take()
            .context("neuron-monitor stdout not captured")?;
        let latest = Arc::clone(&self.latest);
        let reader = tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                match serde_json::from_str::<serde_json::Value>(&line) {
                    Ok(report) => {
                        if let Ok(mut slot) = latest.lock() {
                            *slot = Some(report);
                        }
                    }
                    Err(e) => debug!(error = %e, "Skipping malformed neuron-monitor line"),
                }
            }
        });

        info!("neuron-monitor started");
        *process = Some(MonitorProcess { child, reader });
        Ok(())
    }

    fn latest_report(&self) -> Option<serde_json::Value> {
        self.latest.lock().ok()?.clone()
    }
}

#[async_trait]
impl Resource for TrainiumResource {
    fn name(&self) -> &'static str {
        "trainium"
    }

    async fn sample(&self) -> Result<Option<StatsRecord>> {
        self.ensure_started().await?;

        let Some(report) = self.latest_report() else {
            return Ok(None); // no report yet
        };

        let rec = flatten_report(&report, self.pid);
        if rec.is_empty() {
            return Ok(None);
        }
        Ok(Some(rec))
    }

    async fn probe(&self, _cancel: &CancellationToken) -> Option<EnvironmentRecord> {
        let report = self.latest_report()?;
        let facts = hardware_info(&report)?;
        Some(EnvironmentRecord {
            trainium: Some(facts),
            ..Default::default()
        })
    }

    async fn close(&self) {
        if let Some(mut process) = self.process.lock().await.take() {
            process.reader.abort();
            let _ = process.child.kill().await;
            info!("neuron-monitor stopped");
        }
    }
}

/// Flatten the runtime section of a neuron-monitor report for one PID into
/// `trn.`-prefixed metrics.
fn flatten_report(report: &serde_json::Value, pid: u32) -> StatsRecord {
    let mut rec = StatsRecord::now();

    let Some(runtime) = report
        .get("neuron_runtime_data")
        .and_then(|v| v.as_array())
        .and_then(|entries| {
            entries
                .iter()
                .find(|e| e.get("pid").and_then(|p| p.as_u64()) == Some(u64::from(pid)))
        })
        .and_then(|e| e.get("report"))
    else {
        return rec;
    };

    if let Some(cores) = runtime
        .pointer("/neuroncore_counters/neuroncores_in_use")
        .and_then(|v| v.as_object())
    {
        for (core, counters) in cores {
            if let Some(util) = counters
                .get("neuroncore_utilization")
                .and_then(|v| v.as_f64())
            {
                rec.push(format!("trn.{core}.neuroncore_utilization"), util);
            }
        }
    }

    let used = runtime.pointer("/memory_used/neuron_runtime_used_bytes");
    if let Some(host) = used.and_then(|v| v.get("host")).and_then(|v| v.as_u64()) {
        rec.push("trn.host_total_memory_usage", host);
    }
    if let Some(device) = used
        .and_then(|v| v.get("neuron_device"))
        .and_then(|v| v.as_u64())
    {
        rec.push("trn.neuron_device_total_memory_usage", device);
    }

    if let Some(host_breakdown) = used
        .and_then(|v| v.pointer("/usage_breakdown/host"))
        .and_then(|v| v.as_object())
    {
        for (field, value) in host_breakdown {
            if let Some(bytes) = value.as_u64() {
                rec.push(format!("trn.host_memory_usage.{field}"), bytes);
            }
        }
    }

    if let Some(core_breakdown) = used
        .and_then(|v| v.pointer("/usage_breakdown/neuroncore_memory_usage"))
        .and_then(|v| v.as_object())
    {
        for (core, fields) in core_breakdown {
            let Some(fields) = fields.as_object() else {
                continue;
            };
            for (field, value) in fields {
                if let Some(bytes) = value.as_u64() {
                    rec.push(format!("trn.{core}.neuroncore_memory_usage.{field}"), bytes);
                }
            }
        }
    }

    rec
}

/// Static hardware facts from the report's hardware section.
fn hardware_info(report: &serde_json::Value) -> Option<TrainiumFacts> {
    let info = report.get("neuron_hardware_info")?;
    Some(TrainiumFacts {
        neuron_device_count: info.get("neuron_device_count")?.as_u64()? as u32,
        neuroncore_per_device_count: info.get("neuroncore_per_device_count")?.as_u64()? as u32,
    })
}

/// Locate an executable on PATH without shelling out.
fn find_in_path(name: &str) -> Option<PathBuf> {
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(name))
        .find(|candidate| is_executable(candidate))
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}
