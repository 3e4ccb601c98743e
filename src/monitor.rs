use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use futures::FutureExt;
use tokio::sync::Mutex;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::buffer::SampleBuffer;
use crate::classify::should_report;
use crate::gpu::GpuResourceManager;
use crate::record::{EnvironmentRecord, Record, StatsRecord, WorkQueue};
use crate::resources::{build_registry, Resource, ResourceDeps};
use crate::settings::{MonitorSettings, RunHandle};

/// Monitor lifecycle state. Transitions are compare-and-swap on a single
/// atomic, so samplers always observe either the old or the new state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MonitorState {
    Stopped = 0,
    Running = 1,
    Paused = 2,
}

impl MonitorState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => MonitorState::Running,
            2 => MonitorState::Paused,
            _ => MonitorState::Stopped,
        }
    }
}

struct SamplerSet {
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

/// Long-lived telemetry subsystem: one sampler task per resource, a one-shot
/// probe fan-out, and an in-memory sample buffer. Publishes records to the
/// embedding application's work queue.
pub struct SystemMonitor {
    settings: MonitorSettings,
    run: RunHandle,
    resources: Vec<Arc<dyn Resource>>,
    buffer: Arc<SampleBuffer>,
    queue: Arc<dyn WorkQueue>,
    state: Arc<AtomicU8>,
    running: Mutex<Option<SamplerSet>>,
}

impl SystemMonitor {
    /// Build a monitor with the full conditional resource registry.
    pub async fn new(settings: MonitorSettings, run: RunHandle, queue: Arc<dyn WorkQueue>) -> Self {
        let gpu_manager = Arc::new(GpuResourceManager::new(
            settings.gpu_helper_binary.clone(),
            settings.portfile_dir.clone(),
        ));
        let deps = ResourceDeps {
            gpu_manager,
            org_lookup: None,
        };
        let resources = build_registry(&settings, &run, &deps).await;
        Self::with_resources(settings, run, queue, resources)
    }

    /// Build a monitor over an explicit registry. The registry is immutable
    /// for the monitor's lifetime.
    pub fn with_resources(
        settings: MonitorSettings,
        run: RunHandle,
        queue: Arc<dyn WorkQueue>,
        resources: Vec<Arc<dyn Resource>>,
    ) -> Self {
        let buffer = Arc::new(SampleBuffer::new(settings.buffer_size));
        Self {
            settings,
            run,
            resources,
            buffer,
            queue,
            state: Arc::new(AtomicU8::new(MonitorState::Stopped as u8)),
            running: Mutex::new(None),
        }
    }

    pub fn state(&self) -> MonitorState {
        MonitorState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn buffer(&self) -> Arc<SampleBuffer> {
        Arc::clone(&self.buffer)
    }

    /// Stopped → Running: emit the settings-derived environment record, kick
    /// off the probe fan-out, and spawn one sampler per resource. A no-op in
    /// any other state.
    pub async fn start(&self) {
        // Serialize against finish() so a concurrent shutdown cannot miss
        // freshly spawned samplers.
        let mut running = self.running.lock().await;
        if self
            .state
            .compare_exchange(
                MonitorState::Stopped as u8,
                MonitorState::Running as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_err()
        {
            return;
        }

        let cancel = CancellationToken::new();
        let mut tasks = Vec::new();

        if self.settings.machine_info_enabled && self.settings.primary {
            let env = synthesize_environment(&self.settings, &self.run);
            let _ = self
                .queue
                .add_work_or_cancel(&cancel, Record::Environment(env))
                .await;
        }

        {
            let resources = self.resources.clone();
            let queue = Arc::clone(&self.queue);
            let settings = self.settings.clone();
            let run = self.run.clone();
            let cancel = cancel.clone();
            tasks.push(tokio::spawn(async move {
                probe_resources(&resources, &settings, &run, queue.as_ref(), &cancel).await;
            }));
        }

        for resource in &self.resources {
            let resource = Arc::clone(resource);
            let state = Arc::clone(&self.state);
            let buffer = Arc::clone(&self.buffer);
            let queue = Arc::clone(&self.queue);
            let settings = self.settings.clone();
            let cancel = cancel.clone();
            tasks.push(tokio::spawn(async move {
                sampler_loop(resource, state, buffer, queue.as_ref(), &settings, &cancel).await;
            }));
        }

        *running = Some(SamplerSet { cancel, tasks });
        info!(
            resources = self.resources.len(),
            interval_secs = self.settings.sampling_interval.as_secs_f64(),
            "System monitor started"
        );
    }

    /// Running → Paused; samplers keep ticking but do nothing. Otherwise a
    /// no-op.
    pub fn pause(&self) {
        if self
            .state
            .compare_exchange(
                MonitorState::Running as u8,
                MonitorState::Paused as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
        {
            info!("System monitor paused");
        }
    }

    /// Paused → Running. Otherwise a no-op.
    pub fn resume(&self) {
        if self
            .state
            .compare_exchange(
                MonitorState::Paused as u8,
                MonitorState::Running as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
        {
            info!("System monitor resumed");
        }
    }

    /// Any state → Stopped: cancel the root token, join every sampler, then
    /// close closable resources. Idempotent; a later `start` spawns fresh
    /// samplers over the same registry.
    pub async fn finish(&self) {
        // Mirror start()'s lock ordering: take the lock before touching the
        // state so the swap and the teardown cannot interleave with a
        // concurrent start() installing a fresh sampler set.
        let mut running = self.running.lock().await;
        let previous = self.state.swap(MonitorState::Stopped as u8, Ordering::SeqCst);

        if let Some(set) = running.take() {
            set.cancel.cancel();
            for task in set.tasks {
                // Panics inside tasks are already recovered and reported;
                // a join error here is only the task being cancelled.
                let _ = task.await;
            }
        }

        if MonitorState::from_u8(previous) != MonitorState::Stopped {
            for resource in &self.resources {
                resource.close().await;
            }
            info!("System monitor stopped");
        }
    }
}

/// Environment facts the application already knows, emitted by the primary
/// writer at start.
fn synthesize_environment(settings: &MonitorSettings, run: &RunHandle) -> EnvironmentRecord {
    let hints = &settings.environment;
    EnvironmentRecord {
        os: hints.os.clone(),
        python: hints.python.clone(),
        host: hints.host.clone(),
        program: hints.program.clone(),
        args: hints.args.clone(),
        start_time: hints.start_time,
        git_commit: hints.git_commit.clone(),
        git_remote: hints.git_remote.clone(),
        writer_id: Some(run.writer_id.clone()),
        ..Default::default()
    }
}

/// Run every resource's probe in parallel, merge the non-nil results, apply
/// user overrides, and enqueue the merged record. Panics in any probe are
/// recovered and do not abort the group.
async fn probe_resources(
    resources: &[Arc<dyn Resource>],
    settings: &MonitorSettings,
    run: &RunHandle,
    queue: &dyn WorkQueue,
    cancel: &CancellationToken,
) {
    let probe_cancel = cancel.child_token();
    let merged = Arc::new(Mutex::new(EnvironmentRecord::default()));

    let mut group = JoinSet::new();
    for resource in resources {
        let resource = Arc::clone(resource);
        let merged = Arc::clone(&merged);
        let probe_cancel = probe_cancel.clone();
        let _ = group.spawn(async move {
            if let Some(env) = resource.probe(&probe_cancel).await {
                merged.lock().await.merge(env);
            }
        });
    }
    while let Some(joined) = group.join_next().await {
        if let Err(e) = joined {
            if e.is_panic() {
                error!("Probe recovered from a panicking resource");
            }
        }
    }

    let mut env = merged.lock().await.clone();

    // User-supplied overrides beat auto-detected values.
    if settings.cpu_count_override.is_some() {
        env.cpu_count = settings.cpu_count_override;
    }
    if settings.gpu_count_override.is_some() {
        env.gpu_count = settings.gpu_count_override;
    }
    if settings.gpu_type_override.is_some() {
        env.gpu_type = settings.gpu_type_override.clone();
    }

    if env == EnvironmentRecord::default() {
        debug!("Probe produced no environment facts");
        return;
    }
    env.writer_id = Some(run.writer_id.clone());

    let _ = queue
        .add_work_or_cancel(cancel, Record::Environment(env))
        .await;
}

/// Per-resource sampling loop: tick, sample, buffer, label, enqueue.
/// Classified-reportable errors are logged once per distinct message; panics
/// are recovered and the loop continues.
async fn sampler_loop(
    resource: Arc<dyn Resource>,
    state: Arc<AtomicU8>,
    buffer: Arc<SampleBuffer>,
    queue: &dyn WorkQueue,
    settings: &MonitorSettings,
    cancel: &CancellationToken,
) {
    let mut ticker = tokio::time::interval(settings.sampling_interval);
    ticker.tick().await; // first tick is immediate — skip it
    let mut reported: HashSet<String> = HashSet::new();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        if MonitorState::from_u8(state.load(Ordering::SeqCst)) != MonitorState::Running {
            continue;
        }

        let record = match AssertUnwindSafe(resource.sample()).catch_unwind().await {
            Err(_) => {
                error!(resource = resource.name(), "Sampler recovered from panic");
                continue;
            }
            Ok(Err(e)) => {
                if should_report(&e) {
                    let message = format!("{e:#}");
                    if reported.insert(message.clone()) {
                        warn!(resource = resource.name(), error = %message, "Sampling failed");
                    }
                }
                continue;
            }
            Ok(Ok(None)) => continue,
            Ok(Ok(Some(record))) if record.is_empty() => continue,
            Ok(Ok(Some(record))) => record,
        };

        buffer.push(&record).await;
        let record = apply_label(record, settings);
        let _ = queue
            .add_work_or_cancel(
                cancel,
                Record::Stats {
                    record,
                    always_send: true,
                },
            )
            .await;
    }

    debug!(resource = resource.name(), "Sampler exited");
}

/// Rewrite every key with the node-label suffix, when one is configured.
fn apply_label(mut record: StatsRecord, settings: &MonitorSettings) -> StatsRecord {
    if settings.label.is_some() {
        for item in &mut record.items {
            item.key = settings.labeled_key(&item.key);
        }
    }
    record
}
