use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// One metric sample: dotted key plus a JSON-encoded scalar value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatsItem {
    pub key: String,
    pub value_json: String,
}

/// An ordered batch of metric samples sharing one timestamp.
///
/// An empty `items` list means "nothing new this tick" — the sampler neither
/// buffers nor emits it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatsRecord {
    pub timestamp: DateTime<Utc>,
    pub items: Vec<StatsItem>,
}

impl StatsRecord {
    pub fn new(timestamp: DateTime<Utc>) -> Self {
        Self {
            timestamp,
            items: Vec::new(),
        }
    }

    pub fn now() -> Self {
        Self::new(Utc::now())
    }

    /// Append a sample, JSON-encoding the value.
    pub fn push(&mut self, key: impl Into<String>, value: impl Serialize) {
        // Serialization of numbers, bools and strings cannot fail.
        let value_json = serde_json::to_string(&value).unwrap_or_else(|_| "null".to_string());
        self.items.push(StatsItem {
            key: key.into(),
            value_json,
        });
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Static facts about one GPU device.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GpuDeviceFacts {
    pub name: String,
    pub memory_total_bytes: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub architecture: Option<String>,
}

/// Static facts about an Apple SoC.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppleFacts {
    pub name: String,
    pub gpu_cores: Option<u32>,
}

/// Static facts about the detected TPU chip family.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TpuFacts {
    pub name: String,
    pub count: u32,
    pub hbm_gib: u32,
    pub devices_per_chip: u32,
}

/// Static facts about Trainium / Neuron hardware.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainiumFacts {
    pub neuron_device_count: u32,
    pub neuroncore_per_device_count: u32,
}

/// Facts parsed from the CoreWeave instance-metadata document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreWeaveFacts {
    pub cluster_name: Option<String>,
    pub org_id: Option<String>,
    pub region: Option<String>,
    pub node_pool: Option<String>,
    pub fde_raid: Option<bool>,
}

impl CoreWeaveFacts {
    fn merge(&mut self, other: CoreWeaveFacts) {
        overwrite(&mut self.cluster_name, other.cluster_name);
        overwrite(&mut self.org_id, other.org_id);
        overwrite(&mut self.region, other.region);
        overwrite(&mut self.node_pool, other.node_pool);
        overwrite(&mut self.fde_raid, other.fde_raid);
    }
}

/// Capacity and usage of one configured mount path.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiskFacts {
    pub total_bytes: u64,
    pub used_bytes: u64,
}

/// Static machine and accelerator facts gathered by the one-shot probe.
///
/// Probes from different resources are merged field-by-field; later writes
/// overwrite scalars, maps merge key-wise, lists concatenate.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnvironmentRecord {
    pub os: Option<String>,
    pub python: Option<String>,
    pub host: Option<String>,
    pub program: Option<String>,
    pub args: Vec<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub git_commit: Option<String>,
    pub git_remote: Option<String>,
    pub writer_id: Option<String>,
    pub cpu_count: Option<u32>,
    pub cpu_count_logical: Option<u32>,
    pub memory_total_bytes: Option<u64>,
    pub gpu_count: Option<u32>,
    pub gpu_type: Option<String>,
    pub gpu_nvidia: Vec<GpuDeviceFacts>,
    pub gpu_amd: Vec<GpuDeviceFacts>,
    pub apple: Vec<AppleFacts>,
    pub tpu: Option<TpuFacts>,
    pub trainium: Option<TrainiumFacts>,
    pub coreweave: Option<CoreWeaveFacts>,
    pub disk: BTreeMap<String, DiskFacts>,
    pub slurm: BTreeMap<String, String>,
}

fn overwrite<T>(dst: &mut Option<T>, src: Option<T>) {
    if src.is_some() {
        *dst = src;
    }
}

impl EnvironmentRecord {
    /// Merge `other` into `self`: scalars overwrite when present, maps merge
    /// key-wise, repeated fields concatenate, fragments merge field-by-field.
    pub fn merge(&mut self, other: EnvironmentRecord) {
        overwrite(&mut self.os, other.os);
        overwrite(&mut self.python, other.python);
        overwrite(&mut self.host, other.host);
        overwrite(&mut self.program, other.program);
        self.args.extend(other.args);
        overwrite(&mut self.start_time, other.start_time);
        overwrite(&mut self.git_commit, other.git_commit);
        overwrite(&mut self.git_remote, other.git_remote);
        overwrite(&mut self.writer_id, other.writer_id);
        overwrite(&mut self.cpu_count, other.cpu_count);
        overwrite(&mut self.cpu_count_logical, other.cpu_count_logical);
        overwrite(&mut self.memory_total_bytes, other.memory_total_bytes);
        overwrite(&mut self.gpu_count, other.gpu_count);
        overwrite(&mut self.gpu_type, other.gpu_type);
        self.gpu_nvidia.extend(other.gpu_nvidia);
        self.gpu_amd.extend(other.gpu_amd);
        self.apple.extend(other.apple);
        overwrite(&mut self.tpu, other.tpu);
        overwrite(&mut self.trainium, other.trainium);
        match (self.coreweave.as_mut(), other.coreweave) {
            (Some(dst), Some(src)) => dst.merge(src),
            (None, Some(src)) => self.coreweave = Some(src),
            _ => {}
        }
        self.disk.extend(other.disk);
        self.slurm.extend(other.slurm);
    }
}

/// A unit of outbound work handed to the embedding application.
#[derive(Debug, Clone)]
pub enum Record {
    Stats {
        record: StatsRecord,
        /// Bypass downstream debouncing/deduplication.
        always_send: bool,
    },
    Environment(EnvironmentRecord),
}

/// Outbound work queue provided by the embedding application.
///
/// The monitor only enqueues; it never observes delivery. Sends are
/// cancellation-aware so a stuck consumer cannot block shutdown.
#[async_trait]
pub trait WorkQueue: Send + Sync {
    /// Enqueue `record`, giving up if `cancel` fires first.
    /// Returns false when the record was dropped.
    async fn add_work_or_cancel(&self, cancel: &CancellationToken, record: Record) -> bool;
}

/// Bounded mpsc-backed work queue, suitable for embedders and tests.
#[derive(Debug, Clone)]
pub struct RecordChannel {
    tx: mpsc::Sender<Record>,
}

impl RecordChannel {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Record>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }
}

#[async_trait]
impl WorkQueue for RecordChannel {
    async fn add_work_or_cancel(&self, cancel: &CancellationToken, record: Record) -> bool {
        tokio::select! {
            _ = cancel.cancelled() => false,
            sent = self.tx.send(record) => sent.is_ok(),
        }
    }
}
