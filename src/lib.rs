//! In-process system telemetry: periodically samples compute resources
//! (CPU, memory, disk, GPU, TPU, Trainium, OpenMetrics endpoints), buffers
//! the samples, and publishes timestamped records to an outbound work queue
//! supplied by the embedding application.

pub mod buffer;
pub mod classify;
pub mod gpu;
pub mod monitor;
pub mod openmetrics;
pub mod record;
pub mod resources;
pub mod settings;

#[cfg(test)]
mod monitor_tests;

pub use buffer::{Measurement, SampleBuffer};
pub use monitor::{MonitorState, SystemMonitor};
pub use record::{EnvironmentRecord, Record, RecordChannel, StatsItem, StatsRecord, WorkQueue};
pub use resources::Resource;
pub use settings::{EnvironmentHints, MonitorSettings, RunHandle};
