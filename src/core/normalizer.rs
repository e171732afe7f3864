//! Metric normalizer - maps loosely shaped backend responses onto
//! [`MetricUpdate`] values.
//!
//! Value policy, applied everywhere:
//! - percentages above 100 are clamped to 100;
//! - negative numbers are "unavailable" sentinels and drop the field;
//! - non-finite or non-numeric values drop the field;
//! - an update with no surviving field is not emitted at all.

use serde_json::Value;
use std::collections::HashSet;
use tracing::{debug, info, warn};

use crate::core::events::{
    CpuReading, DiskIo, DiskUsage, GpuInfo, InterfaceStatus, MemoryReading, MetricUpdate,
    NetworkIo, SystemInfo, TopProcess,
};

/// System info response → `SystemInfo`
pub fn normalize_system_info(raw: &Value) -> Vec<MetricUpdate> {
    let info = SystemInfo {
        cpu_cores: number_at(raw, &["cpu_cores", "cpuCores", "CpuCores", "cores", "logical_cores"])
            .filter(|n| *n >= 1.0 && *n <= u32::MAX as f64)
            .map(|n| n as u32),
        platform_label: text_at(raw, &["platform_label", "platformLabel", "platform", "os", "Platform"]),
    };

    if info == SystemInfo::default() {
        return Vec::new();
    }
    vec![MetricUpdate::SystemInfo(info)]
}

/// Real-time snapshot → cpu, memory, disk, io, network, gpu and process updates
pub fn normalize_realtime(raw: &Value) -> Vec<MetricUpdate> {
    let mut updates = Vec::new();

    if let Some(cpu) = cpu_reading(raw) {
        updates.push(MetricUpdate::Cpu(cpu));
    }
    if let Some(memory) = memory_reading(raw) {
        updates.push(MetricUpdate::Memory(memory));
    }
    if let Some(disk) = disk_usage(raw) {
        updates.push(MetricUpdate::DiskUsage(disk));
    }
    if let Some(io) = disk_io(raw) {
        updates.push(MetricUpdate::DiskIo(io));
    }
    if let Some(net) = network_io(raw) {
        updates.push(MetricUpdate::NetworkIo(net));
    }
    let interfaces = interfaces(raw);
    if !interfaces.is_empty() {
        updates.push(MetricUpdate::NetworkInterfaceStatus(interfaces));
    }
    if let Some(gpu) = field(raw, &["gpu", "Gpu", "GPU"]) {
        updates.extend(normalize_gpu_info(gpu));
    }
    if let Some(procs) = field(raw, &["processes", "top_processes", "Processes"]) {
        updates.extend(normalize_top_processes(procs));
    }

    updates
}

/// GPU info response (object, or array whose first entry is used) → `GpuInfo`
pub fn normalize_gpu_info(raw: &Value) -> Vec<MetricUpdate> {
    let gpu = match raw {
        Value::Array(items) => match items.first() {
            Some(first) => first,
            None => return Vec::new(),
        },
        Value::Object(_) => raw,
        _ => return Vec::new(),
    };

    let info = GpuInfo {
        name: text_at(gpu, &["name", "Name", "model", "gpu_name"]),
        usage_percent: percent_at(gpu, &["usage", "usage_percent", "Usage", "utilization", "gpu_usage"]),
        mem_used_mb: non_negative_at(gpu, &["mem_used", "memUsed", "memory_used", "memory_used_mb", "MemoryUsed"]),
        mem_total_mb: non_negative_at(gpu, &["mem_total", "memTotal", "memory_total", "memory_total_mb", "MemoryTotal"]),
        temp_c: non_negative_at(gpu, &["temp", "temperature", "Temperature", "temp_c"]),
        power_w: non_negative_at(gpu, &["power", "power_w", "power_draw", "Power"]),
    };

    if info == GpuInfo::default() {
        return Vec::new();
    }
    vec![MetricUpdate::GpuInfo(info)]
}

/// Top process list → `TopProcessList`. Entries without a usable pid or
/// name are skipped. A valid empty list is published as empty.
pub fn normalize_top_processes(raw: &Value) -> Vec<MetricUpdate> {
    let Some(entries) = list_of(raw) else {
        return Vec::new();
    };

    let processes = entries
        .iter()
        .filter_map(|entry| {
            let pid = pid_at(entry)?;
            let name = text_at(entry, &["name", "Name", "process_name", "command"])
                .map(|n| executable_name(&n).to_string())
                .filter(|n| !n.is_empty());
            let Some(name) = name else {
                debug!(pid, "skipping process without a name");
                return None;
            };
            Some(TopProcess {
                name,
                pid,
                cpu_percent: percent_at(entry, &["cpu_percent", "cpu", "cpu_usage", "CPU"]),
                mem_percent: percent_at(entry, &["mem_percent", "memory_percent", "memory", "mem"]),
            })
        })
        .collect();

    vec![MetricUpdate::TopProcessList(processes)]
}

fn cpu_reading(raw: &Value) -> Option<CpuReading> {
    let mut cpu = CpuReading::default();
    match field(raw, &["cpu", "Cpu", "CPU"]) {
        Some(section @ Value::Object(_)) => {
            cpu.usage_percent = percent_at(section, &["usage", "usage_percent", "Usage", "percent", "total"]);
            cpu.temperature_c = non_negative_at(section, &["temperature", "temp", "temperature_c", "Temperature"]);
            cpu.frequency_mhz = non_negative_at(section, &["frequency", "frequency_mhz", "freq"]);
            if let Some(Value::Array(cores)) = field(section, &["per_core", "core_usage", "cores"]) {
                cpu.core_usage = cores.iter().filter_map(clamp_percent).collect();
            }
        }
        Some(value) => cpu.usage_percent = clamp_percent(value),
        None => {}
    }
    if cpu.usage_percent.is_none() {
        cpu.usage_percent = percent_at(raw, &["cpu_usage", "cpuUsage", "CpuUsage", "cpu_percent"]);
    }

    (cpu != CpuReading::default()).then_some(cpu)
}

fn memory_reading(raw: &Value) -> Option<MemoryReading> {
    let mut mem = MemoryReading::default();
    if let Some(section @ Value::Object(_)) = field(raw, &["memory", "Memory", "mem", "ram"]) {
        mem.total_bytes = bytes_at(section, &["total", "total_bytes", "Total"]);
        mem.used_bytes = bytes_at(section, &["used", "used_bytes", "Used"]);
        mem.available_bytes = bytes_at(section, &["available", "available_bytes", "free"]);
        mem.percent = percent_at(section, &["percent", "usage_percent", "usage", "Percent"]);
    } else {
        mem.total_bytes = bytes_at(raw, &["memory_total", "memoryTotal"]);
        mem.used_bytes = bytes_at(raw, &["memory_used", "memoryUsed"]);
        mem.percent = percent_at(raw, &["memory_usage", "memoryUsage", "memory_percent", "MemoryUsage"]);
    }
    if mem.percent.is_none() {
        mem.percent = derived_percent(mem.used_bytes, mem.total_bytes);
    }

    (mem != MemoryReading::default()).then_some(mem)
}

fn disk_usage(raw: &Value) -> Option<DiskUsage> {
    let section = field(raw, &["disk", "Disk", "disk_usage", "diskUsage", "storage"])?;
    let mut disk = DiskUsage {
        total_bytes: bytes_at(section, &["total", "total_bytes", "Total"]),
        used_bytes: bytes_at(section, &["used", "used_bytes", "Used"]),
        free_bytes: bytes_at(section, &["free", "free_bytes", "available", "Free"]),
        percent: percent_at(section, &["percent", "usage_percent", "usage", "Percent"]),
    };
    if disk.percent.is_none() {
        disk.percent = derived_percent(disk.used_bytes, disk.total_bytes);
    }

    (disk != DiskUsage::default()).then_some(disk)
}

fn disk_io(raw: &Value) -> Option<DiskIo> {
    let section = field(raw, &["disk_io", "diskIo", "DiskIO", "io"])?;
    let io = DiskIo {
        read_bps: non_negative_at(section, &["read_bps", "readBps", "read_bytes_per_sec", "readSpeed", "read"]),
        write_bps: non_negative_at(section, &["write_bps", "writeBps", "write_bytes_per_sec", "writeSpeed", "write"]),
    };
    (io != DiskIo::default()).then_some(io)
}

fn network_io(raw: &Value) -> Option<NetworkIo> {
    let section = field(raw, &["network", "Network", "network_io", "networkIo", "net"])?;
    let net = NetworkIo {
        sent_bps: non_negative_at(section, &["sent_bps", "sentBps", "sent_bytes_per_sec", "upload", "tx_bps", "sent"]),
        recv_bps: non_negative_at(section, &["recv_bps", "recvBps", "recv_bytes_per_sec", "download", "rx_bps", "received"]),
    };
    (net != NetworkIo::default()).then_some(net)
}

fn interfaces(raw: &Value) -> Vec<InterfaceStatus> {
    let nested = field(raw, &["network", "Network", "net"])
        .and_then(|n| field(n, &["interfaces", "Interfaces"]));
    let list = nested.or_else(|| field(raw, &["interfaces", "network_interfaces", "networkInterfaces"]));
    let Some(Value::Array(items)) = list else {
        return Vec::new();
    };

    items
        .iter()
        .filter_map(|item| {
            let name = text_at(item, &["name", "Name", "interface", "iface"])?;
            let up = match field(item, &["up", "is_up", "isUp", "status"]) {
                Some(Value::Bool(b)) => Some(*b),
                Some(Value::String(s)) => match s.to_lowercase().as_str() {
                    "up" | "connected" => Some(true),
                    "down" | "disconnected" => Some(false),
                    _ => None,
                },
                _ => None,
            };
            Some(InterfaceStatus {
                name,
                up,
                ip: text_at(item, &["ip", "ip_address", "ipAddress", "address"]),
            })
        })
        .collect()
}

fn derived_percent(used: Option<u64>, total: Option<u64>) -> Option<f64> {
    match (used, total) {
        (Some(used), Some(total)) if total > 0 => Some((used as f64 / total as f64 * 100.0).min(100.0)),
        _ => None,
    }
}

/// First non-null value among `keys`
pub(crate) fn field<'a>(raw: &'a Value, keys: &[&str]) -> Option<&'a Value> {
    let obj = raw.as_object()?;
    keys.iter()
        .filter_map(|k| obj.get(*k))
        .find(|v| !v.is_null())
}

/// Numbers and numeric strings; NaN and infinities are rejected
pub(crate) fn number(value: &Value) -> Option<f64> {
    let n = match value {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().trim_end_matches('%').trim().parse::<f64>().ok()?,
        _ => return None,
    };
    n.is_finite().then_some(n)
}

pub(crate) fn number_at(raw: &Value, keys: &[&str]) -> Option<f64> {
    field(raw, keys).and_then(number)
}

pub(crate) fn clamp_percent(value: &Value) -> Option<f64> {
    number(value).filter(|n| *n >= 0.0).map(|n| n.min(100.0))
}

pub(crate) fn percent_at(raw: &Value, keys: &[&str]) -> Option<f64> {
    field(raw, keys).and_then(clamp_percent)
}

pub(crate) fn non_negative_at(raw: &Value, keys: &[&str]) -> Option<f64> {
    number_at(raw, keys).filter(|n| *n >= 0.0)
}

fn bytes_at(raw: &Value, keys: &[&str]) -> Option<u64> {
    non_negative_at(raw, keys).map(|n| n as u64)
}

pub(crate) fn text_at(raw: &Value, keys: &[&str]) -> Option<String> {
    match field(raw, keys)? {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        _ => None,
    }
}

pub(crate) fn pid_at(raw: &Value) -> Option<u32> {
    number_at(raw, &["pid", "Pid", "PID", "process_id", "processId", "ProcessId"])
        .filter(|n| *n >= 1.0 && n.fract() == 0.0 && *n <= u32::MAX as f64)
        .map(|n| n as u32)
}

/// Bare array, or an object wrapping one
pub(crate) fn list_of(raw: &Value) -> Option<&Vec<Value>> {
    match raw {
        Value::Array(items) => Some(items),
        Value::Object(_) => match field(raw, &["processes", "gpu_processes", "data", "items"])? {
            Value::Array(items) => Some(items),
            _ => None,
        },
        _ => None,
    }
}

/// `C:\Program Files\app.exe` and `/usr/bin/app` both become the bare file name
pub(crate) fn executable_name(raw: &str) -> &str {
    raw.trim()
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or("")
        .trim()
}

/// Remembers which sensors are missing so the warning is logged once per
/// available → unavailable transition instead of on every poll.
#[derive(Debug, Default)]
pub struct SensorAvailability {
    missing: HashSet<String>,
}

impl SensorAvailability {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true on the transition into "unavailable"
    pub fn mark_unavailable(&mut self, sensor: &str, reason: &str) -> bool {
        let changed = self.missing.insert(sensor.to_string());
        if changed {
            warn!(sensor, "sensor unavailable: {}", reason);
        }
        changed
    }

    /// Returns true on the transition back to "available"
    pub fn mark_available(&mut self, sensor: &str) -> bool {
        let changed = self.missing.remove(sensor);
        if changed {
            info!(sensor, "sensor available again");
        }
        changed
    }

    pub fn is_available(&self, sensor: &str) -> bool {
        !self.missing.contains(sensor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::events::MetricDomain;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn cpu_usage_above_100_is_clamped() {
        let updates = normalize_realtime(&json!({ "cpu_usage": 150 }));
        assert_eq!(
            updates,
            vec![MetricUpdate::Cpu(CpuReading {
                usage_percent: Some(100.0),
                ..Default::default()
            })]
        );
    }

    #[test]
    fn naming_conventions_are_equivalent() {
        let a = normalize_realtime(&json!({ "cpu": { "usage": 42.5 } }));
        let b = normalize_realtime(&json!({ "Cpu": { "Usage": "42.5" } }));
        let c = normalize_realtime(&json!({ "cpu": 42.5 }));
        assert_eq!(a, b);
        assert_eq!(a, c);
    }

    #[test]
    fn negative_gpu_memory_is_omitted_not_zeroed() {
        let updates = normalize_gpu_info(&json!({
            "name": "RTX 4070",
            "usage": 33,
            "memUsed": -5,
            "memTotal": 12288,
            "temp": -1,
        }));
        assert_eq!(
            updates,
            vec![MetricUpdate::GpuInfo(GpuInfo {
                name: Some("RTX 4070".into()),
                usage_percent: Some(33.0),
                mem_used_mb: None,
                mem_total_mb: Some(12288.0),
                temp_c: None,
                power_w: None,
            })]
        );
    }

    #[test]
    fn gpu_usage_sentinel_suppresses_field() {
        let updates = normalize_gpu_info(&json!({ "usage": -1 }));
        assert!(updates.is_empty());

        let updates = normalize_gpu_info(&json!([{ "usage": -1, "power": 80.5 }]));
        match &updates[..] {
            [MetricUpdate::GpuInfo(info)] => {
                assert_eq!(info.usage_percent, None);
                assert_eq!(info.power_w, Some(80.5));
            }
            other => panic!("unexpected updates: {other:?}"),
        }
    }

    #[test]
    fn real_zero_is_kept() {
        let updates = normalize_realtime(&json!({ "network": { "upload": 0, "download": "NaN" } }));
        assert_eq!(
            updates,
            vec![MetricUpdate::NetworkIo(NetworkIo {
                sent_bps: Some(0.0),
                recv_bps: None,
            })]
        );
    }

    #[test]
    fn full_snapshot_maps_every_domain() {
        let raw = json!({
            "cpu": { "usage": 12.0, "temperature": 55, "per_core": [10, 200, -3, 14] },
            "memory": { "total": 16_000, "used": 4_000 },
            "disk": { "total": 1000, "used": 250, "free": 750 },
            "disk_io": { "readSpeed": 2048, "writeSpeed": 512 },
            "network": {
                "sent_bps": 100, "recv_bps": 200,
                "interfaces": [
                    { "name": "eth0", "status": "up", "ip_address": "10.0.0.2" },
                    { "name": "", "up": true }
                ]
            },
            "processes": [{ "pid": 7, "name": "/usr/bin/top", "cpu": 3.5 }]
        });
        let updates = normalize_realtime(&raw);
        let domains: Vec<_> = updates.iter().map(MetricUpdate::domain).collect();
        assert_eq!(
            domains,
            vec![
                MetricDomain::Cpu,
                MetricDomain::Memory,
                MetricDomain::DiskUsage,
                MetricDomain::DiskIo,
                MetricDomain::NetworkIo,
                MetricDomain::NetworkInterfaceStatus,
                MetricDomain::TopProcessList,
            ]
        );

        let MetricUpdate::Cpu(cpu) = &updates[0] else { unreachable!() };
        assert_eq!(cpu.core_usage, vec![10.0, 100.0, 14.0]);
        let MetricUpdate::Memory(mem) = &updates[1] else { unreachable!() };
        assert_eq!(mem.percent, Some(25.0));
        let MetricUpdate::NetworkInterfaceStatus(ifaces) = &updates[5] else { unreachable!() };
        assert_eq!(
            ifaces,
            &vec![InterfaceStatus {
                name: "eth0".into(),
                up: Some(true),
                ip: Some("10.0.0.2".into()),
            }]
        );
        let MetricUpdate::TopProcessList(procs) = &updates[6] else { unreachable!() };
        assert_eq!(procs[0].name, "top");
        assert_eq!(procs[0].mem_percent, None);
    }

    #[test]
    fn empty_or_garbage_snapshot_emits_nothing() {
        assert!(normalize_realtime(&json!({})).is_empty());
        assert!(normalize_realtime(&json!("offline")).is_empty());
        assert!(normalize_realtime(&json!({ "cpu": { "usage": "n/a" } })).is_empty());
    }

    #[test]
    fn system_info_aliases() {
        assert_eq!(
            normalize_system_info(&json!({ "cpuCores": 8, "platform": "Linux 6.1" })),
            vec![MetricUpdate::SystemInfo(SystemInfo {
                cpu_cores: Some(8),
                platform_label: Some("Linux 6.1".into()),
            })]
        );
        assert!(normalize_system_info(&json!({ "cpu_cores": 0 })).is_empty());
    }

    #[test]
    fn top_processes_skip_invalid_entries() {
        let updates = normalize_top_processes(&json!({
            "processes": [
                { "pid": 0, "name": "idle" },
                { "pid": 12, "name": "  " },
                { "PID": "44", "Name": "C:\\Windows\\explorer.exe", "memory_percent": 1.5 },
            ]
        }));
        assert_eq!(
            updates,
            vec![MetricUpdate::TopProcessList(vec![TopProcess {
                name: "explorer.exe".into(),
                pid: 44,
                cpu_percent: None,
                mem_percent: Some(1.5),
            }])]
        );
        assert_eq!(
            normalize_top_processes(&json!([])),
            vec![MetricUpdate::TopProcessList(vec![])]
        );
        assert!(normalize_top_processes(&json!(42)).is_empty());
    }

    #[test]
    fn executable_name_strips_paths() {
        assert_eq!(executable_name("/usr/lib/firefox/firefox"), "firefox");
        assert_eq!(executable_name("C:\\Games\\game.exe"), "game.exe");
        assert_eq!(executable_name("plain"), "plain");
        assert_eq!(executable_name("/trailing/"), "");
    }

    #[test]
    fn sensor_warning_once_per_transition() {
        let mut sensors = SensorAvailability::new();
        assert!(sensors.mark_unavailable("gpu", "no device"));
        assert!(!sensors.mark_unavailable("gpu", "no device"));
        assert!(!sensors.is_available("gpu"));
        assert!(sensors.mark_available("gpu"));
        assert!(!sensors.mark_available("gpu"));
        assert!(sensors.mark_unavailable("gpu", "lost"));
    }
}
