use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tonic::client::Grpc;
use tonic::codec::ProstCodec;
use tonic::codegen::http::uri::PathAndQuery;
use tonic::transport::{Channel, Endpoint};
use tracing::debug;

use crate::record::{EnvironmentRecord, StatsRecord, TpuFacts};
use crate::resources::Resource;

const GOOGLE_VENDOR_ID: u32 = 0x1ae0;
const PCI_DEVICES_DIR: &str = "/sys/bus/pci/devices";

const METRIC_MEMORY_USAGE: &str = "tpu.runtime.hbm.memory.usage.bytes";
const METRIC_MEMORY_TOTAL: &str = "tpu.runtime.hbm.memory.total.bytes";
const METRIC_DUTY_CYCLE: &str = "tpu.runtime.tensorcore.dutycycle.percent";

const GET_RUNTIME_METRIC: &str = "/tpu.monitoring.runtime.MetricService/GetRuntimeMetric";

/// One TPU chip family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TpuChip {
    pub name: &'static str,
    pub hbm_gib: u32,
    pub devices_per_chip: u32,
}

/// Classify a Google PCI device into a chip family.
fn classify(device_id: u32, subsystem_id: u32) -> Option<TpuChip> {
    let chip = match (device_id, subsystem_id) {
        (0x0027, 0x004e) => TpuChip { name: "v2", hbm_gib: 8, devices_per_chip: 2 },
        (0x0027, 0x004f) => TpuChip { name: "v3", hbm_gib: 16, devices_per_chip: 2 },
        (0x005e, _) => TpuChip { name: "v4", hbm_gib: 32, devices_per_chip: 1 },
        (0x0063, _) => TpuChip { name: "v5e", hbm_gib: 16, devices_per_chip: 1 },
        (0x0062, _) => TpuChip { name: "v5p", hbm_gib: 95, devices_per_chip: 1 },
        (0x006f, _) => TpuChip { name: "v6e", hbm_gib: 32, devices_per_chip: 1 },
        _ => return None,
    };
    Some(chip)
}

/// Scan a PCI device tree for Google TPUs. Returns the most common chip
/// family and the number of matched devices.
fn scan_pci(dir: &Path) -> Option<(TpuChip, u32)> {
    let entries = std::fs::read_dir(dir).ok()?;
    let mut tallies: Vec<(TpuChip, u32)> = Vec::new();

    for entry in entries.flatten() {
        let device_dir = entry.path();
        if read_pci_id(&device_dir.join("vendor")) != Some(GOOGLE_VENDOR_ID) {
            continue;
        }
        let Some(device_id) = read_pci_id(&device_dir.join("device")) else {
            continue;
        };
        let subsystem_id = read_pci_id(&device_dir.join("subsystem_device")).unwrap_or(0);

        if let Some(chip) = classify(device_id, subsystem_id) {
            match tallies.iter_mut().find(|(c, _)| *c == chip) {
                Some((_, n)) => *n += 1,
                None => tallies.push((chip, 1)),
            }
        }
    }

    tallies.into_iter().max_by_key(|&(_, n)| n)
}

/// Read a sysfs hex id like "0x1ae0".
fn read_pci_id(path: &Path) -> Option<u32> {
    let raw = std::fs::read_to_string(path).ok()?;
    u32::from_str_radix(raw.trim().trim_start_matches("0x"), 16).ok()
}

#[derive(Clone, PartialEq, prost::Message)]
struct MetricRequest {
    #[prost(string, tag = "1")]
    metric_name: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct TpuMetric {
    #[prost(int64, tag = "1")]
    pub device_id: i64,
    #[prost(oneof = "tpu_metric::Value", tags = "2, 3")]
    pub value: Option<tpu_metric::Value>,
}

pub mod tpu_metric {
    #[derive(Clone, PartialEq, prost::Oneof)]
    pub enum Value {
        #[prost(int64, tag = "2")]
        AsInt(i64),
        #[prost(double, tag = "3")]
        AsDouble(f64),
    }
}

impl TpuMetric {
    fn as_f64(&self) -> Option<f64> {
        match self.value {
            Some(tpu_metric::Value::AsInt(v)) => Some(v as f64),
            Some(tpu_metric::Value::AsDouble(v)) => Some(v),
            None => None,
        }
    }
}

#[derive(Clone, PartialEq, prost::Message)]
struct MetricResponse {
    #[prost(message, repeated, tag = "1")]
    metrics: Vec<TpuMetric>,
}

/// Unary client for the TPU runtime's metric service on localhost.
struct TpuRuntimeClient {
    inner: Grpc<Channel>,
}

impl TpuRuntimeClient {
    fn connect_lazy(addr: &str) -> Result<Self> {
        let channel = Endpoint::try_from(addr.to_string())
            .context("invalid TPU runtime address")?
            .connect_lazy();
        Ok(Self {
            inner: Grpc::new(channel),
        })
    }

    async fn fetch_metric(&mut self, metric_name: &str) -> Result<Vec<TpuMetric>, tonic::Status> {
        self.inner
            .ready()
            .await
            .map_err(|e| tonic::Status::unavailable(format!("runtime channel not ready: {e}")))?;
        let codec: ProstCodec<MetricRequest, MetricResponse> = ProstCodec::default();
        let response = self
            .inner
            .unary(
                tonic::Request::new(MetricRequest {
                    metric_name: metric_name.to_string(),
                }),
                PathAndQuery::from_static(GET_RUNTIME_METRIC),
                codec,
            )
            .await?;
        Ok(response.into_inner().metrics)
    }
}

/// TPU metrics via the runtime's local gRPC endpoint. Constructed only when
/// PCI enumeration finds at least one Google TPU.
pub struct TpuResource {
    chip: TpuChip,
    count: u32,
    client: Mutex<TpuRuntimeClient>,
}

impl TpuResource {
    /// Detect TPU hardware and prepare a lazy runtime connection.
    pub fn detect(runtime_addr: &str) -> Option<Self> {
        let (chip, count) = scan_pci(Path::new(PCI_DEVICES_DIR))?;
        Self::with_chip(chip, count, runtime_addr)
    }

    fn with_chip(chip: TpuChip, count: u32, runtime_addr: &str) -> Option<Self> {
        let client = match TpuRuntimeClient::connect_lazy(runtime_addr) {
            Ok(client) => client,
            Err(e) => {
                debug!(error = %e, "TPU runtime address rejected");
                return None;
            }
        };
        Some(Self {
            chip,
            count,
            client: Mutex::new(client),
        })
    }
}

/// Build the emitted record from the three metric fetches.
///
/// For 2-device chips (v2/v3) the runtime reports one duty-cycle per chip;
/// the measurement is replicated to both device ids. Memory metrics map 1:1.
fn build_record(
    chip: &TpuChip,
    totals: &[TpuMetric],
    usages: &[TpuMetric],
    duty_cycles: &[TpuMetric],
) -> StatsRecord {
    let mut rec = StatsRecord::now();

    let total_by_device: HashMap<i64, f64> = totals
        .iter()
        .filter_map(|m| m.as_f64().map(|v| (m.device_id, v)))
        .collect();

    for usage in usages {
        let Some(used) = usage.as_f64() else { continue };
        let id = usage.device_id;
        if let Some(&total) = total_by_device.get(&id) {
            if total > 0.0 {
                rec.push(format!("tpu.{id}.memoryUsage"), used / total * 100.0);
            }
        }
        rec.push(format!("tpu.{id}.memoryUsageBytes"), used as i64);
    }

    for duty in duty_cycles {
        let Some(value) = duty.as_f64() else { continue };
        let id = duty.device_id;
        if chip.devices_per_chip == 2 {
            rec.push(format!("tpu.{}.dutyCycle", 2 * id), value);
            rec.push(format!("tpu.{}.dutyCycle", 2 * id + 1), value);
        } else {
            rec.push(format!("tpu.{id}.dutyCycle"), value);
        }
    }

    rec
}

#[async_trait]
impl Resource for TpuResource {
    fn name(&self) -> &'static str {
        "tpu"
    }

    async fn sample(&self) -> Result<Option<StatsRecord>> {
        let mut client = self.client.lock().await;

        let mut first_err: Option<tonic::Status> = None;
        let totals = collect(client.fetch_metric(METRIC_MEMORY_TOTAL).await, &mut first_err);
        let usages = collect(client.fetch_metric(METRIC_MEMORY_USAGE).await, &mut first_err);
        let duty_cycles = collect(client.fetch_metric(METRIC_DUTY_CYCLE).await, &mut first_err);

        let rec = build_record(&self.chip, &totals, &usages, &duty_cycles);
        if rec.is_empty() {
            // All three produced nothing; surface a transport error if one
            // occurred, otherwise report "nothing new".
            if let Some(status) = first_err {
                return Err(anyhow::Error::new(status).context("fetching tpu runtime metrics"));
            }
            return Ok(None);
        }
        Ok(Some(rec))
    }

    async fn probe(&self, _cancel: &CancellationToken) -> Option<EnvironmentRecord> {
        Some(EnvironmentRecord {
            tpu: Some(TpuFacts {
                name: self.chip.name.to_string(),
                count: self.count,
                hbm_gib: self.chip.hbm_gib,
                devices_per_chip: self.chip.devices_per_chip,
            }),
            ..Default::default()
        })
    }
}

fn collect(
    result: Result<Vec<TpuMetric>, tonic::Status>,
    first_err: &mut Option<tonic::Status>,
) -> Vec<TpuMetric> {
    match result {
        Ok(metrics) => metrics,
        Err(status) => {
            if first_err.is_none() {
                *first_err = Some(status);
            }
            Vec::new()
        }
    }
}
