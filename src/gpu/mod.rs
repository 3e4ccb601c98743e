//! Lifecycle management for the out-of-process GPU helper: at most one
//! helper subprocess and one gRPC connection per manager, shared by
//! reference count.

pub mod client;
pub mod portfile;
pub mod resource;

use std::collections::HashSet;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use self::client::GpuHelperClient;

const STARTUP_DEADLINE: Duration = Duration::from_secs(30);
const TEARDOWN_GRACE: Duration = Duration::from_secs(2);

/// Proof of one acquisition. Opaque; consumed by `release`.
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct AcquireToken(Uuid);

struct HelperHandle {
    child: Child,
    client: GpuHelperClient,
    portfile_path: PathBuf,
}

struct ManagerState {
    helper: Option<HelperHandle>,
    outstanding: HashSet<Uuid>,
}

/// Reference-counted coordinator for the GPU helper subprocess.
///
/// Injectable, never a package-level static: each monitor (and each test)
/// constructs its own. Acquire/Release are serialized under one lock.
pub struct GpuResourceManager {
    binary: Option<PathBuf>,
    portfile_dir: PathBuf,
    state: Mutex<ManagerState>,
}

impl GpuResourceManager {
    pub fn new(binary: Option<PathBuf>, portfile_dir: PathBuf) -> Self {
        Self {
            binary,
            portfile_dir,
            state: Mutex::new(ManagerState {
                helper: None,
                outstanding: HashSet::new(),
            }),
        }
    }

    /// Start the helper on first use, then hand out a shared client plus a
    /// token binding this acquisition to its release. Startup failures
    /// propagate; the caller decides whether GPU sampling is skipped.
    pub async fn acquire(&self) -> Result<(GpuHelperClient, AcquireToken)> {
        let mut state = self.state.lock().await;

        if state.helper.is_none() {
            state.helper = Some(self.start_helper().await?);
        }

        let token = Uuid::new_v4();
        let inserted = state.outstanding.insert(token);
        debug_assert!(inserted);

        let client = state
            .helper
            .as_ref()
            .map(|h| h.client.clone())
            .context("helper vanished during acquire")?;
        Ok((client, AcquireToken(token)))
    }

    /// Give back one acquisition. The last release tears the helper down.
    /// Releasing an unknown (or already-released) token is a no-op.
    pub async fn release(&self, token: AcquireToken) {
        let mut state = self.state.lock().await;
        if !state.outstanding.remove(&token.0) {
            return;
        }
        if state.outstanding.is_empty() {
            if let Some(handle) = state.helper.take() {
                teardown(handle).await;
            }
        }
    }

    async fn start_helper(&self) -> Result<HelperHandle> {
        let binary = self
            .binary
            .as_ref()
            .context("no GPU helper binary configured")?;

        let portfile_path = self
            .portfile_dir
            .join(format!("gpu-helper-{}.port", Uuid::new_v4()));

        let child = Command::new(binary)
            .arg("--portfile")
            .arg(&portfile_path)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("spawning GPU helper {}", binary.display()))?;

        info!(binary = %binary.display(), portfile = %portfile_path.display(), "GPU helper started");

        let cancel = CancellationToken::new();
        let target = match portfile::wait_for_portfile(&portfile_path, STARTUP_DEADLINE, &cancel).await
        {
            Ok(target) => target,
            Err(e) => {
                abandon(child, &portfile_path).await;
                return Err(e).context("waiting for GPU helper portfile");
            }
        };

        let mut client = match GpuHelperClient::connect(&target).await {
            Ok(client) => client,
            Err(e) => {
                abandon(child, &portfile_path).await;
                return Err(e).context("connecting to GPU helper");
            }
        };

        if let Err(e) = client.health_check().await {
            abandon(child, &portfile_path).await;
            return Err(anyhow::Error::new(e).context("GPU helper failed health check"));
        }

        info!(target = %target, "GPU helper healthy");
        Ok(HelperHandle {
            child,
            client,
            portfile_path,
        })
    }
}

/// Kill a helper that never became healthy and clean up its portfile.
async fn abandon(mut child: Child, portfile_path: &std::path::Path) {
    let _ = child.kill().await;
    let _ = tokio::fs::remove_file(portfile_path).await;
}

/// Orderly shutdown: ask the helper to exit, then make sure it did.
async fn teardown(mut handle: HelperHandle) {
    let mut client = handle.client.clone();
    let asked = tokio::time::timeout(TEARDOWN_GRACE, client.tear_down()).await;
    match asked {
        Ok(Ok(_)) => {
            if tokio::time::timeout(TEARDOWN_GRACE, handle.child.wait())
                .await
                .is_err()
            {
                warn!("GPU helper ignored teardown — killing");
                let _ = handle.child.kill().await;
            }
        }
        _ => {
            let _ = handle.child.kill().await;
        }
    }
    let _ = tokio::fs::remove_file(&handle.portfile_path).await;
    info!("GPU helper stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn acquire_without_binary_fails() {
        let dir = tempfile::tempdir().unwrap();
        let manager = GpuResourceManager::new(None, dir.path().to_path_buf());
        let err = manager.acquire().await.unwrap_err();
        assert!(err.to_string().contains("no GPU helper binary configured"));
    }

    #[tokio::test]
    async fn acquire_with_missing_binary_propagates_spawn_error() {
        let dir = tempfile::tempdir().unwrap();
        let manager = GpuResourceManager::new(
            Some(PathBuf::from("/nonexistent/gpu-helper")),
            dir.path().to_path_buf(),
        );
        assert!(manager.acquire().await.is_err());
    }

    #[tokio::test]
    async fn release_of_unknown_token_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let manager = GpuResourceManager::new(None, dir.path().to_path_buf());
        manager.release(AcquireToken(Uuid::new_v4())).await;
        // Still usable afterwards.
        assert!(manager.acquire().await.is_err());
    }

    #[tokio::test]
    async fn failed_acquire_leaves_no_helper_state() {
        let dir = tempfile::tempdir().unwrap();
        let manager = GpuResourceManager::new(
            Some(PathBuf::from("/nonexistent/gpu-helper")),
            dir.path().to_path_buf(),
        );
        let _ = manager.acquire().await;
        let state = manager.state.lock().await;
        assert!(state.helper.is_none());
        assert!(state.outstanding.is_empty());
    }
}
