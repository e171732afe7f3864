//! sysdash - live system telemetry in your terminal
//!
//! Runs the polling core against the local host and prints every metric
//! update as it is published.

use anyhow::Result;
use clap::{Parser, Subcommand};
use humansize::{format_size, BINARY, DECIMAL};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use sysdash::config::{self, Config};
use sysdash::core::demand::parse_widgets;
use sysdash::core::events::MetricUpdate;
use sysdash::integrations::LocalBackend;
use sysdash::{MonitorService, WidgetKind};

#[derive(Parser)]
#[command(name = "sysdash")]
#[command(author = "Sysdash Contributors")]
#[command(version = "0.1.0")]
#[command(about = "Live system telemetry for your terminal", long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Configuration file path
    #[arg(short, long, value_name = "FILE", env = "SYSDASH_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Poll the local host and print metric updates as they arrive
    Watch {
        /// Comma separated widgets to poll for (cpu, ram, disk_space, ...)
        #[arg(short, long)]
        widgets: Option<String>,

        /// Stop after this many seconds
        #[arg(short, long)]
        duration: Option<u64>,

        /// Print one JSON object per update
        #[arg(long)]
        json: bool,
    },

    /// Write the default configuration file
    InitConfig {
        /// Force overwrite existing configuration
        #[arg(short, long)]
        force: bool,
    },

    /// Print a one-shot snapshot as JSON
    Status,
}

fn setup_logging(verbosity: u8) -> Result<tracing_appender::non_blocking::WorkerGuard> {
    let level = match verbosity {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    };

    let filter = EnvFilter::from_default_env().add_directive(level.into());

    let log_dir = dirs::cache_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("sysdash")
        .join("logs");

    std::fs::create_dir_all(&log_dir)?;

    let file_appender = tracing_appender::rolling::daily(&log_dir, "sysdash.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(non_blocking).with_ansi(false))
        .init();

    Ok(guard)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Keep the guard alive for the duration of the program
    let _logging_guard = setup_logging(cli.verbose)?;

    let config_path = cli
        .config
        .clone()
        .or_else(|| Config::default_path().filter(|p| p.exists()));

    match cli.command {
        Commands::InitConfig { force } => {
            let path = cli
                .config
                .or_else(Config::default_path)
                .ok_or_else(|| anyhow::anyhow!("no configuration directory on this system"))?;
            config::init_config(&path, force)?;
        }
        Commands::Watch {
            widgets,
            duration,
            json,
        } => {
            let config = load_config(config_path)?;
            let widgets = widgets.as_deref().map(parse_widgets).transpose()?;
            watch(config, widgets, duration.map(Duration::from_secs), json).await?;
        }
        Commands::Status => {
            let config = load_config(config_path)?;
            status(config).await?;
        }
    }

    Ok(())
}

fn load_config(path: Option<PathBuf>) -> Result<Config> {
    match path {
        Some(path) => {
            info!(path = %path.display(), "loading configuration");
            Config::load(&path)
        }
        None => Ok(Config::default()),
    }
}

async fn watch(
    config: Config,
    widgets: Option<impl IntoIterator<Item = WidgetKind>>,
    duration: Option<Duration>,
    json: bool,
) -> Result<()> {
    let service = MonitorService::new(Arc::new(LocalBackend::new()), config);
    if let Some(widgets) = widgets {
        service.update_active_widgets(widgets);
    }
    let mut updates = service.store().subscribe();
    let _connection = service.on_connection_status_change(|connected| {
        info!(connected, "connection status changed");
    });

    service.start_monitoring().await?;

    let deadline = async {
        match duration {
            Some(d) => tokio::time::sleep(d).await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = &mut deadline => break,
            _ = tokio::signal::ctrl_c() => break,
            update = updates.recv() => match update {
                Ok(update) => print_update(&update, json)?,
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "output fell behind"),
                Err(RecvError::Closed) => break,
            },
        }
    }

    service.cleanup().await;
    if !json {
        let status = service.status();
        println!(
            "\n{} polls, {} errors, {:.1} ms average response",
            status.performance.total_polls,
            status.performance.error_count,
            status.performance.average_response_time_ms
        );
    }
    Ok(())
}

async fn status(config: Config) -> Result<()> {
    let service = MonitorService::new(Arc::new(LocalBackend::new()), config);
    service.update_active_widgets([
        WidgetKind::Cpu,
        WidgetKind::Ram,
        WidgetKind::DiskSpace,
        WidgetKind::NetworkMonitor,
        WidgetKind::ProcessMonitor,
    ]);
    service.start_monitoring().await?;

    // one cycle of every job
    tokio::time::sleep(Duration::from_secs(1)).await;
    service.cleanup().await;

    let metrics: Vec<MetricUpdate> = service.store().snapshot().latest.into_values().collect();
    let report = serde_json::json!({
        "status": service.status(),
        "metrics": metrics,
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn print_update(update: &MetricUpdate, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string(update)?);
    } else {
        println!("{}", describe(update));
    }
    Ok(())
}

fn pct(value: Option<f64>) -> String {
    value.map_or_else(|| "n/a".to_string(), |v| format!("{v:.1}%"))
}

fn bytes(value: Option<u64>) -> String {
    value.map_or_else(|| "n/a".to_string(), |v| format_size(v, BINARY))
}

fn rate(value: Option<f64>) -> String {
    value.map_or_else(|| "n/a".to_string(), |v| format!("{}/s", format_size(v as u64, DECIMAL)))
}

fn describe(update: &MetricUpdate) -> String {
    match update {
        MetricUpdate::Cpu(cpu) => {
            let freq = cpu
                .frequency_mhz
                .map(|f| format!(" @ {f:.0} MHz"))
                .unwrap_or_default();
            format!("cpu        {}{} ({} cores)", pct(cpu.usage_percent), freq, cpu.core_usage.len())
        }
        MetricUpdate::Memory(mem) => format!(
            "memory     {} / {} ({})",
            bytes(mem.used_bytes),
            bytes(mem.total_bytes),
            pct(mem.percent)
        ),
        MetricUpdate::DiskUsage(disk) => format!(
            "disk       {} / {} ({}), {} free",
            bytes(disk.used_bytes),
            bytes(disk.total_bytes),
            pct(disk.percent),
            bytes(disk.free_bytes)
        ),
        MetricUpdate::DiskIo(io) => format!("disk io    read {} write {}", rate(io.read_bps), rate(io.write_bps)),
        MetricUpdate::NetworkIo(net) => format!("network    rx {} tx {}", rate(net.recv_bps), rate(net.sent_bps)),
        MetricUpdate::NetworkInterfaceStatus(ifaces) => {
            let names: Vec<&str> = ifaces.iter().map(|i| i.name.as_str()).collect();
            format!("interfaces {}", names.join(", "))
        }
        MetricUpdate::GpuInfo(gpu) => format!(
            "gpu        {} {} ({} MB used)",
            gpu.name.as_deref().unwrap_or("unknown"),
            pct(gpu.usage_percent),
            gpu.mem_used_mb.map_or_else(|| "n/a".to_string(), |m| format!("{m:.0}"))
        ),
        MetricUpdate::GpuProcessList(list) => {
            let mut out = format!("gpu procs  {} running", list.len());
            for p in list.iter().take(5) {
                out.push_str(&format!(
                    "\n  {:>7} {:<24} {:>5.1}% {:>8.0} MB {}",
                    p.pid, p.name, p.gpu_usage_percent, p.gpu_memory_mb, p.status
                ));
            }
            out
        }
        MetricUpdate::TopProcessList(list) => {
            let mut out = String::from("processes");
            for p in list {
                out.push_str(&format!(
                    "\n  {:>7} {:<24} cpu {:>6} mem {:>6}",
                    p.pid,
                    p.name,
                    pct(p.cpu_percent),
                    pct(p.mem_percent)
                ));
            }
            out
        }
        MetricUpdate::SystemInfo(info) => format!(
            "system     {} ({} cores)",
            info.platform_label.as_deref().unwrap_or("unknown platform"),
            info.cpu_cores.map_or_else(|| "?".to_string(), |c| c.to_string())
        ),
    }
}
