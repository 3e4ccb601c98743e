//! Decides which sampling errors are noise and which deserve a log line.

/// Message fragments produced by sampling against hardware or tooling that
/// simply is not there. Matching errors are suppressed; the resource keeps
/// running and produces nothing.
const SUPPRESSED_FRAGMENTS: &[&str] = &[
    // External tool missing from PATH.
    "executable file not found in $PATH",
    // Local daemon (GPU helper, TPU runtime, DCGM exporter) not listening.
    "connection refused",
    // Windows counterpart of a missing device interface.
    "Incorrect function",
    // /proc/diskstats absent (non-Linux or restricted container).
    "no such file or directory",
];

/// Returns true when a sampling error should be surfaced through the logger.
///
/// Transient and missing-capability failures return false: gRPC UNAVAILABLE,
/// refused connections, missing external tools, missing procfs entries, and
/// the Windows "Incorrect function" device error.
pub fn should_report(err: &anyhow::Error) -> bool {
    for cause in err.chain() {
        if let Some(status) = cause.downcast_ref::<tonic::Status>() {
            if status.code() == tonic::Code::Unavailable {
                return false;
            }
        }
        if let Some(io) = cause.downcast_ref::<std::io::Error>() {
            if matches!(
                io.kind(),
                std::io::ErrorKind::ConnectionRefused | std::io::ErrorKind::NotFound
            ) {
                return false;
            }
        }
    }

    let message = format!("{err:#}");
    !SUPPRESSED_FRAGMENTS
        .iter()
        .any(|fragment| message.contains(fragment))
}
