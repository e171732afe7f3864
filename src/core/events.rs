//! Canonical metric update events published to the client-side store
//!
//! Any field a sensor could not report is `None`; a real zero is `Some(0)`.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CpuReading {
    pub usage_percent: Option<f64>,
    pub temperature_c: Option<f64>,
    pub frequency_mhz: Option<f64>,
    pub core_usage: Vec<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MemoryReading {
    pub total_bytes: Option<u64>,
    pub used_bytes: Option<u64>,
    pub available_bytes: Option<u64>,
    pub percent: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DiskUsage {
    pub total_bytes: Option<u64>,
    pub used_bytes: Option<u64>,
    pub free_bytes: Option<u64>,
    pub percent: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DiskIo {
    pub read_bps: Option<f64>,
    pub write_bps: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NetworkIo {
    pub sent_bps: Option<f64>,
    pub recv_bps: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterfaceStatus {
    pub name: String,
    pub up: Option<bool>,
    pub ip: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GpuInfo {
    pub name: Option<String>,
    pub usage_percent: Option<f64>,
    pub mem_used_mb: Option<f64>,
    pub mem_total_mb: Option<f64>,
    pub temp_c: Option<f64>,
    pub power_w: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GpuProcessStatus {
    Running,
    Idle,
    Suspended,
    #[default]
    Unknown,
}

impl From<&str> for GpuProcessStatus {
    fn from(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "running" | "active" => Self::Running,
            "idle" | "sleeping" => Self::Idle,
            "suspended" | "stopped" => Self::Suspended,
            _ => Self::Unknown,
        }
    }
}

impl std::fmt::Display for GpuProcessStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Idle => write!(f, "idle"),
            Self::Suspended => write!(f, "suspended"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// One validated entry of a GPU process list
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GpuProcessRecord {
    pub pid: u32,
    pub name: String,
    pub gpu_usage_percent: f64,
    pub gpu_memory_mb: f64,
    pub process_type: String,
    pub command: String,
    pub status: GpuProcessStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopProcess {
    pub name: String,
    pub pid: u32,
    pub cpu_percent: Option<f64>,
    pub mem_percent: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SystemInfo {
    pub cpu_cores: Option<u32>,
    pub platform_label: Option<String>,
}

/// Store slot an update lands in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricDomain {
    Cpu,
    Memory,
    DiskUsage,
    DiskIo,
    NetworkIo,
    NetworkInterfaceStatus,
    GpuInfo,
    GpuProcessList,
    TopProcessList,
    SystemInfo,
}

/// All updates the core can publish
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "domain", content = "data", rename_all = "snake_case")]
pub enum MetricUpdate {
    Cpu(CpuReading),
    Memory(MemoryReading),
    DiskUsage(DiskUsage),
    DiskIo(DiskIo),
    NetworkIo(NetworkIo),
    NetworkInterfaceStatus(Vec<InterfaceStatus>),
    GpuInfo(GpuInfo),
    /// Complete replacement list for one poll cycle
    GpuProcessList(Vec<GpuProcessRecord>),
    TopProcessList(Vec<TopProcess>),
    SystemInfo(SystemInfo),
}

impl MetricUpdate {
    pub fn domain(&self) -> MetricDomain {
        match self {
            Self::Cpu(_) => MetricDomain::Cpu,
            Self::Memory(_) => MetricDomain::Memory,
            Self::DiskUsage(_) => MetricDomain::DiskUsage,
            Self::DiskIo(_) => MetricDomain::DiskIo,
            Self::NetworkIo(_) => MetricDomain::NetworkIo,
            Self::NetworkInterfaceStatus(_) => MetricDomain::NetworkInterfaceStatus,
            Self::GpuInfo(_) => MetricDomain::GpuInfo,
            Self::GpuProcessList(_) => MetricDomain::GpuProcessList,
            Self::TopProcessList(_) => MetricDomain::TopProcessList,
            Self::SystemInfo(_) => MetricDomain::SystemInfo,
        }
    }
}
