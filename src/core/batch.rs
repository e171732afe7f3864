//! GPU process batches: validate a raw list and publish it as one
//! replacement `GpuProcessList`.

use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use crate::core::events::{GpuProcessRecord, GpuProcessStatus, MetricUpdate};
use crate::core::normalizer::{executable_name, field, list_of, number_at, pid_at, text_at};
use crate::core::state::MetricSink;

/// Why an entry was dropped
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RejectReason {
    #[error("entry is not an object")]
    NotAnObject,
    #[error("missing or non-positive pid")]
    InvalidPid,
    #[error("missing process name")]
    MissingName,
    #[error("missing or negative gpu memory")]
    InvalidMemory,
    #[error("missing or non-numeric gpu usage")]
    InvalidUsage,
    #[error("gpu usage reported as unavailable")]
    UnavailableUsage,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchOutcome {
    pub records: Vec<GpuProcessRecord>,
    pub rejected: usize,
}

impl BatchOutcome {
    pub fn input_len(&self) -> usize {
        self.records.len() + self.rejected
    }
}

#[derive(Debug, Default)]
pub struct ProcessBatchAggregator {
    published: u64,
}

impl ProcessBatchAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of lists published so far
    pub fn published(&self) -> u64 {
        self.published
    }

    /// Validate every entry of one poll cycle
    pub fn ingest(&self, raw: &[Value]) -> BatchOutcome {
        let mut outcome = BatchOutcome::default();
        for (index, entry) in raw.iter().enumerate() {
            match validate(entry) {
                Ok(record) => outcome.records.push(record),
                Err(reason) => {
                    warn!(index, %reason, "dropping gpu process entry");
                    outcome.rejected += 1;
                }
            }
        }
        debug!(
            accepted = outcome.records.len(),
            rejected = outcome.rejected,
            "gpu process batch ingested"
        );
        outcome
    }

    /// Apply the whole validated list as one replacement
    pub fn publish(&mut self, outcome: BatchOutcome, sink: &dyn MetricSink) {
        sink.apply(MetricUpdate::GpuProcessList(outcome.records));
        self.published += 1;
    }
}

/// The process array inside a backend response, if there is one
pub fn extract_list(raw: &Value) -> Option<&[Value]> {
    list_of(raw).map(Vec::as_slice)
}

fn validate(entry: &Value) -> Result<GpuProcessRecord, RejectReason> {
    if !entry.is_object() {
        return Err(RejectReason::NotAnObject);
    }
    let pid = pid_at(entry).ok_or(RejectReason::InvalidPid)?;
    let name = text_at(entry, &["name", "Name", "process_name", "processName"])
        .map(|n| executable_name(&n).to_string())
        .filter(|n| !n.is_empty())
        .ok_or(RejectReason::MissingName)?;
    let gpu_memory_mb = number_at(
        entry,
        &["gpu_memory", "gpuMemory", "gpu_memory_mb", "memory", "memory_mb", "used_memory"],
    )
    .filter(|m| *m >= 0.0)
    .ok_or(RejectReason::InvalidMemory)?;
    let gpu_usage_percent = number_at(
        entry,
        &["gpu_usage", "gpuUsage", "gpu_usage_percent", "usage", "utilization"],
    )
    .ok_or(RejectReason::InvalidUsage)?;
    // negative usage is the backend's "not sampled" sentinel
    if gpu_usage_percent < 0.0 {
        return Err(RejectReason::UnavailableUsage);
    }
    let gpu_usage_percent = gpu_usage_percent.min(100.0);

    let status = match field(entry, &["status", "Status", "state"]) {
        Some(Value::String(s)) => GpuProcessStatus::from(s.as_str()),
        _ => GpuProcessStatus::Unknown,
    };

    Ok(GpuProcessRecord {
        pid,
        name,
        gpu_usage_percent,
        gpu_memory_mb,
        process_type: text_at(entry, &["type", "process_type", "processType"]).unwrap_or_default(),
        command: text_at(entry, &["command", "cmd", "command_line", "commandLine"]).unwrap_or_default(),
        status,
    })
}
