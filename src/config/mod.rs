//! Configuration system for sysdash

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::core::scheduler::JobKind;

/// Global polling configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct Config {
    pub polling: PollingConfig,
    pub retry: RetryConfig,
    pub adaptive: AdaptiveConfig,
    pub metrics: MetricsConfig,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("sysdash").join("config.toml"))
    }

    /// Overlay every field the patch sets
    pub fn apply(&mut self, patch: &ConfigPatch) {
        let p = &mut self.polling;
        overlay(&mut p.realtime_metrics_ms, patch.realtime_metrics_ms);
        overlay(&mut p.gpu_processes_ms, patch.gpu_processes_ms);
        overlay(&mut p.system_info_ms, patch.system_info_ms);
        overlay(&mut p.gpu_info_ms, patch.gpu_info_ms);
        overlay(&mut p.top_processes_ms, patch.top_processes_ms);
        overlay(&mut p.top_process_count, patch.top_process_count);
        overlay(&mut p.widget_debounce_ms, patch.widget_debounce_ms);

        overlay(&mut self.retry.max_attempts, patch.max_attempts);
        overlay(&mut self.retry.base_delay_ms, patch.base_delay_ms);

        let a = &mut self.adaptive;
        overlay(&mut a.error_rate_high, patch.error_rate_high);
        overlay(&mut a.error_rate_low, patch.error_rate_low);
        overlay(&mut a.window, patch.window);
        overlay(&mut a.min_samples, patch.min_samples);
        overlay(&mut a.max_interval_ms, patch.max_interval_ms);
        overlay(&mut a.background_interval_ms, patch.background_interval_ms);

        overlay(&mut self.metrics.ema_alpha, patch.ema_alpha);
        overlay(&mut self.metrics.reset_after, patch.reset_after);
    }
}

fn overlay<T: Copy>(slot: &mut T, value: Option<T>) {
    if let Some(v) = value {
        *slot = v;
    }
}

/// Per-job cadences, in milliseconds
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PollingConfig {
    pub realtime_metrics_ms: u64,
    pub gpu_processes_ms: u64,
    pub system_info_ms: u64,
    pub gpu_info_ms: u64,
    pub top_processes_ms: u64,
    pub top_process_count: u32,
    pub widget_debounce_ms: u64,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            realtime_metrics_ms: 3_000,
            gpu_processes_ms: 6_000,
            system_info_ms: 60_000,
            gpu_info_ms: 3_000,
            top_processes_ms: 5_000,
            top_process_count: 10,
            widget_debounce_ms: 1_000,
        }
    }
}

impl PollingConfig {
    pub fn interval_for(&self, job: JobKind) -> Duration {
        let ms = match job {
            JobKind::RealtimeMetrics => self.realtime_metrics_ms,
            JobKind::GpuProcesses => self.gpu_processes_ms,
            JobKind::SystemInfo => self.system_info_ms,
            JobKind::GpuInfo => self.gpu_info_ms,
            JobKind::TopProcesses => self.top_processes_ms,
        };
        // a zero interval would spin the timer
        Duration::from_millis(ms.max(1))
    }

    pub fn widget_debounce(&self) -> Duration {
        Duration::from_millis(self.widget_debounce_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 200,
        }
    }
}

impl RetryConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AdaptiveConfig {
    /// Degrade a job once its trailing error rate goes above this
    pub error_rate_high: f64,
    /// Recover once the trailing error rate drops below this
    pub error_rate_low: f64,
    /// Number of trailing outcomes considered per job
    pub window: usize,
    pub min_samples: usize,
    pub max_interval_ms: u64,
    pub background_interval_ms: u64,
}

impl Default for AdaptiveConfig {
    fn default() -> Self {
        Self {
            error_rate_high: 0.5,
            error_rate_low: 0.05,
            window: 20,
            min_samples: 5,
            max_interval_ms: 15_000,
            background_interval_ms: 60_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MetricsConfig {
    /// Smoothing factor of the response time moving average
    pub ema_alpha: f64,
    /// Reset the counters after this many completed polls; 0 lets them grow
    pub reset_after: u64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            ema_alpha: 0.2,
            reset_after: 100,
        }
    }
}

/// Partial configuration accepted by `MonitorService::update_config`
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ConfigPatch {
    pub realtime_metrics_ms: Option<u64>,
    pub gpu_processes_ms: Option<u64>,
    pub system_info_ms: Option<u64>,
    pub gpu_info_ms: Option<u64>,
    pub top_processes_ms: Option<u64>,
    pub top_process_count: Option<u32>,
    pub widget_debounce_ms: Option<u64>,
    pub max_attempts: Option<u32>,
    pub base_delay_ms: Option<u64>,
    pub error_rate_high: Option<f64>,
    pub error_rate_low: Option<f64>,
    pub window: Option<usize>,
    pub min_samples: Option<usize>,
    pub max_interval_ms: Option<u64>,
    pub background_interval_ms: Option<u64>,
    pub ema_alpha: Option<f64>,
    pub reset_after: Option<u64>,
}

/// Write the default configuration to `path`
pub fn init_config(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        anyhow::bail!(
            "Configuration already exists at {}. Use --force to overwrite.",
            path.display()
        );
    }
    Config::default().save(path)?;
    println!("Created {}", path.display());
    Ok(())
}
