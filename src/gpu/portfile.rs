//! Rendezvous protocol between the monitor and the GPU helper binary: the
//! helper writes one line describing how to dial it, the monitor polls until
//! that line appears and parses.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PortfileError {
    #[error("portfile is empty")]
    Empty,
    #[error("unknown format in portfile")]
    UnknownFormat,
    #[error("invalid port in portfile")]
    InvalidPort,
}

/// Where the helper is listening.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DialTarget {
    /// TCP on loopback.
    Tcp(u16),
    /// Unix domain socket.
    Unix(PathBuf),
}

impl std::fmt::Display for DialTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DialTarget::Tcp(port) => write!(f, "127.0.0.1:{port}"),
            DialTarget::Unix(path) => write!(f, "unix:{}", path.display()),
        }
    }
}

/// Parse portfile contents: first non-empty line, `sock=<port>` or
/// `unix=<path>`.
pub fn parse_portfile(contents: &str) -> Result<DialTarget, PortfileError> {
    let line = contents
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .ok_or(PortfileError::Empty)?;

    if let Some(port) = line.strip_prefix("sock=") {
        port.parse::<u16>()
            .map(DialTarget::Tcp)
            .map_err(|_| PortfileError::InvalidPort)
    } else if let Some(path) = line.strip_prefix("unix=") {
        Ok(DialTarget::Unix(PathBuf::from(path)))
    } else {
        Err(PortfileError::UnknownFormat)
    }
}

const POLL_INITIAL: Duration = Duration::from_millis(20);
const POLL_MAX: Duration = Duration::from_millis(500);

/// Poll for the portfile until it appears and parses, the deadline passes,
/// or `cancel` fires. A present-but-empty file is treated as mid-write and
/// retried; a malformed one fails immediately.
pub async fn wait_for_portfile(
    path: &Path,
    deadline: Duration,
    cancel: &CancellationToken,
) -> Result<DialTarget> {
    let started = tokio::time::Instant::now();
    let mut delay = POLL_INITIAL;

    loop {
        match tokio::fs::read_to_string(path).await {
            Ok(contents) => match parse_portfile(&contents) {
                Ok(target) => {
                    debug!(portfile = %path.display(), target = %target, "Portfile parsed");
                    return Ok(target);
                }
                Err(PortfileError::Empty) => {} // mid-write; keep polling
                Err(e) => return Err(e).context("parsing portfile"),
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e).context("reading portfile"),
        }

        if started.elapsed() >= deadline {
            anyhow::bail!("timed out waiting for portfile at {}", path.display());
        }

        tokio::select! {
            _ = cancel.cancelled() => anyhow::bail!("cancelled waiting for portfile"),
            _ = tokio::time::sleep(delay) => {}
        }
        delay = (delay * 2).min(POLL_MAX);
    }
}
