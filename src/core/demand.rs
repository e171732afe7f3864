//! Widget demand: which poll jobs the visible widgets actually need

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::str::FromStr;
use thiserror::Error;

use crate::core::scheduler::JobKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WidgetKind {
    Cpu,
    Ram,
    DiskSpace,
    NetworkMonitor,
    Gpu,
    GpuProcess,
    ProcessMonitor,
    SystemInfo,
    Logs,
}

impl WidgetKind {
    pub const ALL: [WidgetKind; 9] = [
        WidgetKind::Cpu,
        WidgetKind::Ram,
        WidgetKind::DiskSpace,
        WidgetKind::NetworkMonitor,
        WidgetKind::Gpu,
        WidgetKind::GpuProcess,
        WidgetKind::ProcessMonitor,
        WidgetKind::SystemInfo,
        WidgetKind::Logs,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::Cpu => "cpu",
            Self::Ram => "ram",
            Self::DiskSpace => "disk_space",
            Self::NetworkMonitor => "network_monitor",
            Self::Gpu => "gpu",
            Self::GpuProcess => "gpu_process",
            Self::ProcessMonitor => "process_monitor",
            Self::SystemInfo => "system_info",
            Self::Logs => "logs",
        }
    }

    /// Jobs this widget depends on
    pub fn jobs(self) -> &'static [JobKind] {
        match self {
            Self::Cpu => &[JobKind::RealtimeMetrics, JobKind::SystemInfo],
            Self::Ram | Self::DiskSpace | Self::NetworkMonitor => &[JobKind::RealtimeMetrics],
            Self::Gpu => &[JobKind::GpuInfo],
            Self::GpuProcess => &[JobKind::GpuInfo, JobKind::GpuProcesses],
            Self::ProcessMonitor => &[JobKind::TopProcesses],
            Self::SystemInfo => &[JobKind::SystemInfo],
            Self::Logs => &[],
        }
    }
}

impl std::fmt::Display for WidgetKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown widget '{0}'")]
pub struct UnknownWidget(pub String);

impl FromStr for WidgetKind {
    type Err = UnknownWidget;

    /// Accepts `disk_space`, `disk-space` and `diskSpace`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let key: String = s
            .trim()
            .chars()
            .filter(|c| !matches!(*c, '_' | '-' | ' '))
            .flat_map(char::to_lowercase)
            .collect();
        let key = match key.as_str() {
            "memory" => "ram",
            "network" => "networkmonitor",
            "processes" => "processmonitor",
            "gpuprocesses" => "gpuprocess",
            other => other,
        };
        Self::ALL
            .into_iter()
            .find(|w| w.name().replace('_', "") == key)
            .ok_or_else(|| UnknownWidget(s.trim().to_string()))
    }
}

/// Comma separated widget list, as given on the command line
pub fn parse_widgets(list: &str) -> Result<BTreeSet<WidgetKind>, UnknownWidget> {
    list.split(',')
        .filter(|part| !part.trim().is_empty())
        .map(WidgetKind::from_str)
        .collect()
}

/// Jobs needed by `widgets`, in canonical start order
pub fn required_jobs(widgets: &BTreeSet<WidgetKind>) -> Vec<JobKind> {
    let needed: BTreeSet<JobKind> = widgets.iter().flat_map(|w| w.jobs()).copied().collect();
    JobKind::ALL.into_iter().filter(|j| needed.contains(j)).collect()
}

/// Whether the backend should collect per-process GPU data
pub fn needs_gpu_process_collection(widgets: &BTreeSet<WidgetKind>) -> bool {
    widgets.contains(&WidgetKind::GpuProcess)
}
