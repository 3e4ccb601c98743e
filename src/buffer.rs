use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::record::StatsRecord;

/// One buffered data point for a metric key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    pub timestamp: DateTime<Utc>,
    pub value: serde_json::Value,
}

/// Per-key ring of recent measurements.
///
/// Capacity `N > 0` keeps the most recent `N` measurements per key (FIFO
/// eviction), `N = 0` retains nothing, `N = -1` retains everything. Keys are
/// bounded independently. Timestamps come from the producing record, not
/// from push time.
#[derive(Debug)]
pub struct SampleBuffer {
    entries: RwLock<HashMap<String, VecDeque<Measurement>>>,
    capacity: i32,
}

impl SampleBuffer {
    pub fn new(capacity: i32) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            capacity,
        }
    }

    /// Split a record into per-key measurements and append them.
    pub async fn push(&self, record: &StatsRecord) {
        if self.capacity == 0 {
            return;
        }

        let mut entries = self.entries.write().await;
        for item in &record.items {
            let value: serde_json::Value = match serde_json::from_str(&item.value_json) {
                Ok(v) => v,
                Err(_) => continue, // not a JSON scalar; skip
            };
            let ring = entries.entry(item.key.clone()).or_default();
            if self.capacity > 0 && ring.len() >= self.capacity as usize {
                ring.pop_front();
            }
            ring.push_back(Measurement {
                timestamp: record.timestamp,
                value,
            });
        }
    }

    /// Deep copy of the current window, keyed by metric.
    pub async fn snapshot(&self) -> HashMap<String, Vec<Measurement>> {
        let entries = self.entries.read().await;
        entries
            .iter()
            .map(|(k, ring)| (k.clone(), ring.iter().cloned().collect()))
            .collect()
    }

    /// Drop all buffered measurements.
    pub async fn clear(&self) {
        self.entries.write().await.clear();
    }
}
