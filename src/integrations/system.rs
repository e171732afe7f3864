//! Local telemetry backend built on `sysinfo`.
//!
//! Answers with the same loose JSON shapes a native helper would. GPU
//! telemetry is not available through `sysinfo`, so those calls report
//! [`BackendError::Unavailable`].

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::ffi::OsStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use sysinfo::{CpuRefreshKind, Disks, MemoryRefreshKind, Networks, RefreshKind, System};
use tracing::debug;

use crate::backend::{Ack, Backend, BackendResult};
use crate::error::BackendError;

/// Reusable `sysinfo` handles so every sample refreshes instead of reallocating
pub struct SystemMonitor {
    sys: System,
    procs: System,
    disks: Disks,
    networks: Networks,
    last_network_refresh: Instant,
}

impl SystemMonitor {
    pub fn new() -> Self {
        // CPU usage needs a previous sample to diff against
        let mut sys = System::new_with_specifics(
            RefreshKind::new()
                .with_cpu(CpuRefreshKind::everything())
                .with_memory(MemoryRefreshKind::everything()),
        );
        sys.refresh_cpu_usage();
        sys.refresh_memory();

        let mut disks = Disks::new_with_refreshed_list();
        disks.refresh();

        Self {
            sys,
            procs: System::new(),
            disks,
            networks: Networks::new_with_refreshed_list(),
            last_network_refresh: Instant::now(),
        }
    }

    pub fn system_info(&self) -> Value {
        let platform = match (System::name(), System::os_version()) {
            (Some(name), Some(version)) => Some(format!("{name} {version}")),
            (name, _) => name,
        };
        json!({
            "cpu_cores": self.sys.cpus().len(),
            "platform": platform,
        })
    }

    pub fn realtime(&mut self) -> Value {
        self.sys.refresh_cpu_usage();
        self.sys.refresh_memory();
        self.disks.refresh();
        if self.disks.list().is_empty() {
            self.disks.refresh_list();
        }

        let cpus = self.sys.cpus();
        let cpu = json!({
            "usage": self.sys.global_cpu_usage(),
            "frequency": cpus.first().map(|c| c.frequency()),
            "per_core": cpus.iter().map(|c| c.cpu_usage()).collect::<Vec<_>>(),
        });

        let memory = json!({
            "total": self.sys.total_memory(),
            "used": self.sys.used_memory(),
            "available": self.sys.available_memory(),
        });

        let (total, available) = self.disks.list().iter().fold((0u64, 0u64), |(t, a), d| {
            (t.saturating_add(d.total_space()), a.saturating_add(d.available_space()))
        });
        let disk = if total > 0 {
            json!({
                "total": total,
                "used": total.saturating_sub(available),
                "free": available,
            })
        } else {
            Value::Null
        };

        json!({
            "cpu": cpu,
            "memory": memory,
            "disk": disk,
            "network": self.network(),
        })
    }

    /// Transfer rates since the previous sample
    fn network(&mut self) -> Value {
        let elapsed = self.last_network_refresh.elapsed().as_secs_f64();
        self.networks.refresh();
        self.last_network_refresh = Instant::now();

        let (recv, sent) = self
            .networks
            .iter()
            .fold((0u64, 0u64), |(r, s), (_, data)| {
                (r.saturating_add(data.received()), s.saturating_add(data.transmitted()))
            });
        let rate = |bytes: u64| (elapsed > 0.0).then(|| bytes as f64 / elapsed);
        let interfaces: Vec<Value> = self
            .networks
            .iter()
            .map(|(name, _)| json!({ "name": name }))
            .collect();

        json!({
            "recv_bps": rate(recv),
            "sent_bps": rate(sent),
            "interfaces": interfaces,
        })
    }

    /// The `count` busiest processes by CPU
    pub fn top_processes(&mut self, count: usize) -> Value {
        self.procs.refresh_all();
        let cores = self.procs.cpus().len().max(1) as f32;
        let total_memory = self.procs.total_memory();

        let mut processes: Vec<(f32, Value)> = self
            .procs
            .processes()
            .values()
            .map(|p| {
                let cpu = p.cpu_usage() / cores;
                let mem = (total_memory > 0).then(|| p.memory() as f64 / total_memory as f64 * 100.0);
                let entry = json!({
                    "pid": p.pid().as_u32(),
                    "name": OsStr::new(p.name()).to_string_lossy(),
                    "cpu_percent": cpu,
                    "mem_percent": mem,
                });
                (cpu, entry)
            })
            .collect();
        processes.sort_by(|a, b| b.0.total_cmp(&a.0));
        processes.truncate(count);

        Value::Array(processes.into_iter().map(|(_, entry)| entry).collect())
    }
}

impl Default for SystemMonitor {
    fn default() -> Self {
        Self::new()
    }
}

/// [`Backend`] served from this host
pub struct LocalBackend {
    monitor: Arc<Mutex<SystemMonitor>>,
    gpu_process_collection: AtomicBool,
}

impl LocalBackend {
    pub fn new() -> Self {
        Self {
            monitor: Arc::new(Mutex::new(SystemMonitor::new())),
            gpu_process_collection: AtomicBool::new(false),
        }
    }

    pub fn gpu_process_collection(&self) -> bool {
        self.gpu_process_collection.load(Ordering::SeqCst)
    }

    /// Sampling blocks on procfs and friends; keep it off the runtime threads
    async fn sample<F>(&self, f: F) -> BackendResult<Value>
    where
        F: FnOnce(&mut SystemMonitor) -> Value + Send + 'static,
    {
        let monitor = self.monitor.clone();
        tokio::task::spawn_blocking(move || f(&mut monitor.lock()))
            .await
            .map_err(|e| BackendError::transient(format!("sampling task failed: {e}")))
    }
}

impl Default for LocalBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Backend for LocalBackend {
    async fn start_monitoring(&self) -> BackendResult<Ack> {
        Ok(Ack::ok())
    }

    async fn stop_monitoring(&self) -> BackendResult<Ack> {
        Ok(Ack::ok())
    }

    async fn get_system_info(&self) -> BackendResult<Value> {
        self.sample(|m| m.system_info()).await
    }

    async fn get_realtime_metrics(&self) -> BackendResult<Value> {
        self.sample(SystemMonitor::realtime).await
    }

    async fn get_gpu_info(&self) -> BackendResult<Value> {
        Err(BackendError::unavailable("no gpu telemetry on this host"))
    }

    async fn get_gpu_processes(&self) -> BackendResult<Value> {
        Err(BackendError::unavailable("no gpu telemetry on this host"))
    }

    async fn get_top_processes(&self, count: u32) -> BackendResult<Value> {
        self.sample(move |m| m.top_processes(count as usize)).await
    }

    async fn set_gpu_process_monitoring(&self, enabled: bool) -> BackendResult<()> {
        debug!(enabled, "gpu process collection toggled");
        self.gpu_process_collection.store(enabled, Ordering::SeqCst);
        Ok(())
    }
}
