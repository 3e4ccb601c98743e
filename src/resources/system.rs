use std::collections::{BTreeMap, HashMap};

use anyhow::Result;
use async_trait::async_trait;
use sysinfo::{Disks, Networks, Pid, System};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::record::{DiskFacts, EnvironmentRecord, StatsRecord};
use crate::resources::Resource;
use crate::settings::MonitorSettings;

const BYTES_PER_MIB: u64 = 1024 * 1024;
const BYTES_PER_GIB: f64 = (1024 * 1024 * 1024) as f64;
const SECTOR_SIZE: u64 = 512;

/// Sector counters for one block device, read from /proc/diskstats.
#[derive(Debug, Clone, Copy, PartialEq)]
struct DiskIoCounters {
    sectors_read: u64,
    sectors_written: u64,
}

struct SystemState {
    sys: System,
    disks: Disks,
    networks: Networks,
    /// Device → counters at construction; deltas are reported against this.
    io_baseline: HashMap<String, DiskIoCounters>,
    /// (sent, received) totals at construction.
    net_baseline: (u64, u64),
}

/// CPU, memory, disk and network metrics for the host and the tracked
/// process. Always present in the registry.
pub struct SystemResource {
    pid: Pid,
    disk_paths: Vec<String>,
    state: Mutex<SystemState>,
}

impl SystemResource {
    pub fn new(settings: &MonitorSettings) -> Self {
        let sys = System::new();
        let disks = Disks::new_with_refreshed_list();
        let networks = Networks::new_with_refreshed_list();

        let io_baseline = read_diskstats().unwrap_or_default();
        let net_baseline = network_totals(&networks);

        Self {
            pid: Pid::from_u32(settings.pid),
            disk_paths: settings.disk_paths.clone(),
            state: Mutex::new(SystemState {
                sys,
                disks,
                networks,
                io_baseline,
                net_baseline,
            }),
        }
    }
}

#[async_trait]
impl Resource for SystemResource {
    fn name(&self) -> &'static str {
        "system"
    }

    async fn sample(&self) -> Result<Option<StatsRecord>> {
        let mut state = self.state.lock().await;
        let mut rec = StatsRecord::now();

        state.sys.refresh_cpu_usage();
        state.sys.refresh_memory();
        state.sys.refresh_process(self.pid);

        let logical = state.sys.cpus().len().max(1);

        if let Some(proc_) = state.sys.process(self.pid) {
            rec.push("cpu", f64::from(proc_.cpu_usage()) / logical as f64);

            let total = state.sys.total_memory();
            if total > 0 {
                rec.push(
                    "proc.memory.percent",
                    proc_.memory() as f64 / total as f64 * 100.0,
                );
            }
            rec.push("proc.memory.rssMB", proc_.memory() as f64 / BYTES_PER_MIB as f64);
        }

        if let Some(threads) = read_thread_count(self.pid.as_u32()) {
            rec.push("proc.cpu.threads", threads);
        }

        for (i, cpu) in state.sys.cpus().iter().enumerate() {
            rec.push(format!("cpu.{i}.cpu_percent"), f64::from(cpu.cpu_usage()));
        }

        let total = state.sys.total_memory();
        if total > 0 {
            rec.push(
                "memory_percent",
                state.sys.used_memory() as f64 / total as f64 * 100.0,
            );
        }
        rec.push(
            "proc.memory.availableMB",
            state.sys.available_memory() as f64 / BYTES_PER_MIB as f64,
        );

        state.disks.refresh_list();
        for path in &self.disk_paths {
            if let Some((total, available)) = disk_space_for_path(&state.disks, path) {
                let used = total.saturating_sub(available);
                if total > 0 {
                    rec.push(
                        format!("disk.{path}.usagePercent"),
                        used as f64 / total as f64 * 100.0,
                    );
                }
                rec.push(format!("disk.{path}.usageGB"), used as f64 / BYTES_PER_GIB);
            }
        }

        // Devices that vanished since construction are skipped, not errors.
        if let Some(current) = read_diskstats() {
            for (device, baseline) in &state.io_baseline {
                if let Some(now) = current.get(device) {
                    let read_mib = now.sectors_read.saturating_sub(baseline.sectors_read)
                        * SECTOR_SIZE
                        / BYTES_PER_MIB;
                    let written_mib = now.sectors_written.saturating_sub(baseline.sectors_written)
                        * SECTOR_SIZE
                        / BYTES_PER_MIB;
                    rec.push(format!("disk.{device}.in"), read_mib);
                    rec.push(format!("disk.{device}.out"), written_mib);
                }
            }
        }

        state.networks.refresh();
        let (sent, received) = network_totals(&state.networks);
        let (sent_base, received_base) = state.net_baseline;
        rec.push("network.sent", sent.saturating_sub(sent_base));
        rec.push("network.recv", received.saturating_sub(received_base));

        Ok(Some(rec))
    }

    async fn probe(&self, _cancel: &CancellationToken) -> Option<EnvironmentRecord> {
        let mut state = self.state.lock().await;
        state.sys.refresh_cpu_usage();
        state.sys.refresh_memory();
        state.disks.refresh_list();

        let mut env = EnvironmentRecord {
            cpu_count: state
                .sys
                .physical_core_count()
                .map(|n| n as u32),
            cpu_count_logical: Some(state.sys.cpus().len() as u32),
            memory_total_bytes: Some(state.sys.total_memory()),
            slurm: slurm_env(std::env::vars()),
            ..Default::default()
        };

        for path in &self.disk_paths {
            if let Some((total, available)) = disk_space_for_path(&state.disks, path) {
                env.disk.insert(
                    path.clone(),
                    DiskFacts {
                        total_bytes: total,
                        used_bytes: total.saturating_sub(available),
                    },
                );
            }
        }

        Some(env)
    }
}

/// (total, available) bytes of the disk whose mount point is the longest
/// prefix of `path`.
fn disk_space_for_path(disks: &Disks, path: &str) -> Option<(u64, u64)> {
    disks
        .list()
        .iter()
        .filter(|d| path.starts_with(&*d.mount_point().to_string_lossy()))
        .max_by_key(|d| d.mount_point().as_os_str().len())
        .map(|d| (d.total_space(), d.available_space()))
}

/// Capture SLURM job variables verbatim, lowercasing the key remainder.
fn slurm_env(vars: impl Iterator<Item = (String, String)>) -> BTreeMap<String, String> {
    vars.filter_map(|(k, v)| {
        k.strip_prefix("SLURM_")
            .map(|rest| (rest.to_ascii_lowercase(), v))
    })
    .collect()
}

fn network_totals(networks: &Networks) -> (u64, u64) {
    let mut sent = 0u64;
    let mut received = 0u64;
    for (_, data) in networks.iter() {
        sent = sent.saturating_add(data.total_transmitted());
        received = received.saturating_add(data.total_received());
    }
    (sent, received)
}

/// Thread count from /proc/<pid>/status. None off Linux or when unreadable.
fn read_thread_count(pid: u32) -> Option<u64> {
    let status = std::fs::read_to_string(format!("/proc/{pid}/status")).ok()?;
    parse_thread_count(&status)
}

fn parse_thread_count(status: &str) -> Option<u64> {
    status
        .lines()
        .find_map(|line| line.strip_prefix("Threads:"))
        .and_then(|rest| rest.trim().parse().ok())
}

/// Parse /proc/diskstats into per-device sector counters. Loop and ram
/// pseudo-devices are excluded.
fn read_diskstats() -> Option<HashMap<String, DiskIoCounters>> {
    let contents = std::fs::read_to_string("/proc/diskstats").ok()?;
    Some(parse_diskstats(&contents))
}

fn parse_diskstats(contents: &str) -> HashMap<String, DiskIoCounters> {
    let mut counters = HashMap::new();
    for line in contents.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        // major minor name reads merged sectors_read ms writes merged sectors_written ...
        if fields.len() < 10 {
            continue;
        }
        let name = fields[2];
        if name.starts_with("loop") || name.starts_with("ram") {
            continue;
        }
        let (Ok(sectors_read), Ok(sectors_written)) =
            (fields[5].parse::<u64>(), fields[9].parse::<u64>())
        else {
            continue;
        };
        counters.insert(
            name.to_string(),
            DiskIoCounters {
                sectors_read,
                sectors_written,
            },
        );
    }
    counters
}
