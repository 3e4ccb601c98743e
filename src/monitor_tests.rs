//! End-to-end tests for the monitor: state machine, sampler behaviour,
//! probe fan-out and shutdown.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::monitor::{MonitorState, SystemMonitor};
use crate::record::{EnvironmentRecord, Record, RecordChannel, StatsRecord};
use crate::resources::Resource;
use crate::settings::{EnvironmentHints, MonitorSettings, RunHandle};

#[derive(Clone, Copy)]
enum Behavior {
    Emit(f64),
    Empty,
    Fail,
    Panic,
}

struct ScriptedResource {
    label: &'static str,
    behavior: Behavior,
    probe_env: Option<EnvironmentRecord>,
    samples: AtomicUsize,
    closed: AtomicBool,
}

impl ScriptedResource {
    fn new(label: &'static str, behavior: Behavior) -> Arc<Self> {
        Arc::new(Self {
            label,
            behavior,
            probe_env: None,
            samples: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        })
    }

    fn with_probe(label: &'static str, env: EnvironmentRecord) -> Arc<Self> {
        Arc::new(Self {
            label,
            behavior: Behavior::Empty,
            probe_env: Some(env),
            samples: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl Resource for ScriptedResource {
    fn name(&self) -> &'static str {
        self.label
    }

    async fn sample(&self) -> anyhow::Result<Option<StatsRecord>> {
        let _ = self.samples.fetch_add(1, Ordering::SeqCst);
        match self.behavior {
            Behavior::Emit(value) => {
                let mut rec = StatsRecord::now();
                rec.push(self.label, value);
                Ok(Some(rec))
            }
            Behavior::Empty => Ok(None),
            Behavior::Fail => Err(anyhow::anyhow!("scripted failure")),
            Behavior::Panic => panic!("scripted panic"),
        }
    }

    async fn probe(&self, _cancel: &CancellationToken) -> Option<EnvironmentRecord> {
        self.probe_env.clone()
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

fn fast_settings() -> MonitorSettings {
    MonitorSettings {
        sampling_interval: Duration::from_millis(10),
        machine_info_enabled: false,
        ..Default::default()
    }
}

fn run_handle() -> RunHandle {
    RunHandle {
        entity: "acme".into(),
        writer_id: "writer-1".into(),
    }
}

fn monitor_with(
    settings: MonitorSettings,
    resources: Vec<Arc<dyn Resource>>,
) -> (SystemMonitor, mpsc::Receiver<Record>) {
    let (queue, rx) = RecordChannel::new(256);
    let monitor = SystemMonitor::with_resources(settings, run_handle(), Arc::new(queue), resources);
    (monitor, rx)
}

async fn next_stats(rx: &mut mpsc::Receiver<Record>) -> Option<StatsRecord> {
    loop {
        match tokio::time::timeout(Duration::from_secs(2), rx.recv()).await {
            Ok(Some(Record::Stats { record, always_send })) => {
                assert!(always_send);
                return Some(record);
            }
            Ok(Some(Record::Environment(_))) => continue,
            _ => return None,
        }
    }
}

async fn next_environment(rx: &mut mpsc::Receiver<Record>) -> Option<EnvironmentRecord> {
    loop {
        match tokio::time::timeout(Duration::from_secs(2), rx.recv()).await {
            Ok(Some(Record::Environment(env))) => return Some(env),
            Ok(Some(Record::Stats { .. })) => continue,
            _ => return None,
        }
    }
}

// ── Group A: state machine ──

#[tokio::test]
async fn initial_state_is_stopped() {
    let (monitor, _rx) = monitor_with(fast_settings(), vec![]);
    assert_eq!(monitor.state(), MonitorState::Stopped);
}

#[tokio::test]
async fn start_pause_resume_finish_sequence() {
    let (monitor, _rx) = monitor_with(fast_settings(), vec![]);

    monitor.start().await;
    assert_eq!(monitor.state(), MonitorState::Running);
    monitor.pause();
    assert_eq!(monitor.state(), MonitorState::Paused);
    monitor.resume();
    assert_eq!(monitor.state(), MonitorState::Running);
    monitor.pause();
    assert_eq!(monitor.state(), MonitorState::Paused);
    monitor.resume();
    assert_eq!(monitor.state(), MonitorState::Running);
    monitor.finish().await;
    assert_eq!(monitor.state(), MonitorState::Stopped);
}

#[tokio::test]
async fn transitions_are_idempotent() {
    let (monitor, _rx) = monitor_with(fast_settings(), vec![]);

    // No-ops from Stopped.
    monitor.pause();
    assert_eq!(monitor.state(), MonitorState::Stopped);
    monitor.resume();
    assert_eq!(monitor.state(), MonitorState::Stopped);
    monitor.finish().await;
    assert_eq!(monitor.state(), MonitorState::Stopped);

    monitor.start().await;
    monitor.start().await; // second start is a no-op
    assert_eq!(monitor.state(), MonitorState::Running);
    monitor.resume(); // resume while running is a no-op
    assert_eq!(monitor.state(), MonitorState::Running);

    monitor.finish().await;
    monitor.finish().await;
    assert_eq!(monitor.state(), MonitorState::Stopped);
}

#[tokio::test]
async fn paused_monitor_accepts_finish() {
    let (monitor, _rx) = monitor_with(fast_settings(), vec![]);
    monitor.start().await;
    monitor.pause();
    monitor.finish().await;
    assert_eq!(monitor.state(), MonitorState::Stopped);
}

#[tokio::test]
async fn restart_after_finish_spawns_fresh_samplers() {
    let resource = ScriptedResource::new("r", Behavior::Emit(1.0));
    let (monitor, mut rx) = monitor_with(fast_settings(), vec![resource.clone()]);

    monitor.start().await;
    assert!(next_stats(&mut rx).await.is_some());
    monitor.finish().await;

    let sampled_before = resource.samples.load(Ordering::SeqCst);
    monitor.start().await;
    assert!(next_stats(&mut rx).await.is_some());
    assert!(resource.samples.load(Ordering::SeqCst) > sampled_before);
    monitor.finish().await;
}

// ── Group B: sampler behaviour ──

#[tokio::test]
async fn sampler_emits_buffered_always_send_records() {
    let resource = ScriptedResource::new("cpu", Behavior::Emit(42.0));
    let (monitor, mut rx) = monitor_with(fast_settings(), vec![resource]);

    monitor.start().await;
    let rec = next_stats(&mut rx).await.unwrap();
    assert_eq!(rec.items[0].key, "cpu");
    assert_eq!(rec.items[0].value_json, "42.0");

    // The buffer holds the same measurements.
    let snapshot = monitor.buffer().snapshot().await;
    assert!(!snapshot["cpu"].is_empty());

    monitor.finish().await;
}

#[tokio::test]
async fn label_suffix_applied_to_queue_keys_but_not_buffer() {
    let settings = MonitorSettings {
        label: Some("rank0".into()),
        ..fast_settings()
    };
    let resource = ScriptedResource::new("cpu", Behavior::Emit(1.0));
    let (monitor, mut rx) = monitor_with(settings, vec![resource]);

    monitor.start().await;
    let rec = next_stats(&mut rx).await.unwrap();
    assert_eq!(rec.items[0].key, "cpu/l:rank0");

    let snapshot = monitor.buffer().snapshot().await;
    assert!(snapshot.contains_key("cpu"));
    assert!(!snapshot.contains_key("cpu/l:rank0"));

    monitor.finish().await;
}

#[tokio::test]
async fn paused_sampler_neither_samples_nor_emits() {
    let resource = ScriptedResource::new("cpu", Behavior::Emit(1.0));
    let (monitor, mut rx) = monitor_with(fast_settings(), vec![resource.clone()]);

    monitor.start().await;
    monitor.pause();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let sampled_while_paused = resource.samples.load(Ordering::SeqCst);
    // Drain anything emitted in the start→pause window.
    while rx.try_recv().is_ok() {}

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(resource.samples.load(Ordering::SeqCst), sampled_while_paused);
    assert!(rx.try_recv().is_err());

    monitor.finish().await;
}

#[tokio::test]
async fn empty_samples_are_not_emitted() {
    let resource = ScriptedResource::new("idle", Behavior::Empty);
    let (monitor, mut rx) = monitor_with(fast_settings(), vec![resource.clone()]);

    monitor.start().await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(resource.samples.load(Ordering::SeqCst) > 0);
    assert!(rx.try_recv().is_err());
    assert!(monitor.buffer().snapshot().await.is_empty());

    monitor.finish().await;
}

#[tokio::test]
async fn failing_resource_does_not_stop_others() {
    let failing = ScriptedResource::new("bad", Behavior::Fail);
    let emitting = ScriptedResource::new("good", Behavior::Emit(7.0));
    let (monitor, mut rx) = monitor_with(fast_settings(), vec![failing.clone(), emitting]);

    monitor.start().await;
    let rec = next_stats(&mut rx).await.unwrap();
    assert_eq!(rec.items[0].key, "good");
    // The failing sampler keeps ticking rather than tearing anything down.
    assert!(failing.samples.load(Ordering::SeqCst) > 0);

    monitor.finish().await;
}

#[tokio::test]
async fn panicking_resource_is_contained() {
    let panicking = ScriptedResource::new("boom", Behavior::Panic);
    let emitting = ScriptedResource::new("good", Behavior::Emit(7.0));
    let (monitor, mut rx) = monitor_with(fast_settings(), vec![panicking, emitting]);

    monitor.start().await;
    assert!(next_stats(&mut rx).await.is_some());
    assert_eq!(monitor.state(), MonitorState::Running);

    monitor.finish().await;
    assert_eq!(monitor.state(), MonitorState::Stopped);
}

#[tokio::test]
async fn finish_joins_samplers_and_closes_resources() {
    let resource = ScriptedResource::new("cpu", Behavior::Emit(1.0));
    let (monitor, _rx) = monitor_with(fast_settings(), vec![resource.clone()]);

    monitor.start().await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    monitor.finish().await;

    assert!(resource.closed.load(Ordering::SeqCst));
    let after_finish = resource.samples.load(Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(resource.samples.load(Ordering::SeqCst), after_finish);
}

// ── Group C: environment records ──

#[tokio::test]
async fn primary_writer_synthesizes_environment_from_settings() {
    let settings = MonitorSettings {
        machine_info_enabled: true,
        environment: EnvironmentHints {
            os: Some("linux".into()),
            program: Some("train.py".into()),
            ..Default::default()
        },
        ..fast_settings()
    };
    let (monitor, mut rx) = monitor_with(settings, vec![]);

    monitor.start().await;
    let env = next_environment(&mut rx).await.unwrap();
    assert_eq!(env.os.as_deref(), Some("linux"));
    assert_eq!(env.program.as_deref(), Some("train.py"));
    assert_eq!(env.writer_id.as_deref(), Some("writer-1"));

    monitor.finish().await;
}

#[tokio::test]
async fn non_primary_writer_emits_no_environment() {
    let settings = MonitorSettings {
        machine_info_enabled: true,
        primary: false,
        ..fast_settings()
    };
    let (monitor, mut rx) = monitor_with(settings, vec![]);

    monitor.start().await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(rx.try_recv().is_err());

    monitor.finish().await;
}

#[tokio::test]
async fn probe_merges_fragments_and_applies_overrides() {
    let cpu_probe = ScriptedResource::with_probe(
        "sys",
        EnvironmentRecord {
            cpu_count: Some(8),
            cpu_count_logical: Some(16),
            ..Default::default()
        },
    );
    let gpu_probe = ScriptedResource::with_probe(
        "gpu",
        EnvironmentRecord {
            gpu_count: Some(4),
            gpu_type: Some("A100".into()),
            ..Default::default()
        },
    );

    let settings = MonitorSettings {
        cpu_count_override: Some(96),
        ..fast_settings()
    };
    let (monitor, mut rx) = monitor_with(settings, vec![cpu_probe, gpu_probe]);

    monitor.start().await;
    let env = next_environment(&mut rx).await.unwrap();
    assert_eq!(env.cpu_count, Some(96)); // override wins
    assert_eq!(env.cpu_count_logical, Some(16));
    assert_eq!(env.gpu_count, Some(4));
    assert_eq!(env.gpu_type.as_deref(), Some("A100"));
    assert_eq!(env.writer_id.as_deref(), Some("writer-1"));

    monitor.finish().await;
}
