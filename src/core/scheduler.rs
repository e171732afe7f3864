//! Poll job scheduler - one recurring timer per named job

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use indexmap::IndexMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, warn};

use crate::error::BackendError;

/// The poll jobs the dashboard knows how to run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    RealtimeMetrics,
    GpuProcesses,
    SystemInfo,
    GpuInfo,
    TopProcesses,
}

impl JobKind {
    pub const ALL: [JobKind; 5] = [
        JobKind::RealtimeMetrics,
        JobKind::GpuProcesses,
        JobKind::SystemInfo,
        JobKind::GpuInfo,
        JobKind::TopProcesses,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::RealtimeMetrics => "realtime_metrics",
            Self::GpuProcesses => "gpu_processes",
            Self::SystemInfo => "system_info",
            Self::GpuInfo => "gpu_info",
            Self::TopProcesses => "top_processes",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.name() == name)
    }
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

pub type JobFuture = BoxFuture<'static, Result<(), BackendError>>;

/// Produces one poll cycle each time it is called
pub type JobFn = Arc<dyn Fn() -> JobFuture + Send + Sync>;

/// Receives every failed cycle: job name, error, consecutive error count
pub type ErrorHandler = Arc<dyn Fn(&str, &BackendError, u32) + Send + Sync>;

/// Bookkeeping for one job, shared with its running cycles
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobStats {
    pub last_run_at: Option<DateTime<Utc>>,
    pub consecutive_errors: u32,
    pub runs: u64,
}

struct JobEntry {
    job: JobFn,
    interval: Duration,
    handle: JoinHandle<()>,
    stats: Arc<Mutex<JobStats>>,
}

/// Owns the named set of recurring jobs.
///
/// Invariant: at most one live timer per job name. Every cycle is spawned as
/// its own task, so a slow backend call never holds back the next tick.
pub struct PollScheduler {
    jobs: Mutex<IndexMap<String, JobEntry>>,
    on_error: ErrorHandler,
    in_flight: Arc<AtomicUsize>,
}

impl PollScheduler {
    pub fn new() -> Self {
        Self::with_error_handler(Arc::new(|name, err, streak| {
            warn!(job = name, streak, "poll cycle failed: {}", err);
        }))
    }

    pub fn with_error_handler(on_error: ErrorHandler) -> Self {
        Self {
            jobs: Mutex::new(IndexMap::new()),
            on_error,
            in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Cancel any schedule for `name`, run `job` now, then every `interval`
    pub fn start_job(&self, name: &str, job: JobFn, interval: Duration) {
        let mut jobs = self.jobs.lock();
        if let Some(previous) = jobs.shift_remove(name) {
            previous.handle.abort();
            debug!(job = name, "replacing existing schedule");
        }

        let stats = Arc::new(Mutex::new(JobStats::default()));
        let handle = self.spawn_loop(name, job.clone(), interval, Instant::now(), stats.clone());
        jobs.insert(
            name.to_string(),
            JobEntry {
                job,
                interval,
                handle,
                stats,
            },
        );
        debug!(job = name, interval_ms = interval.as_millis() as u64, "job started");
    }

    /// Reschedule a running job with a new cadence. The first cycle fires one
    /// full interval from now. Returns false if the job is not running.
    pub fn restart_job(&self, name: &str, interval: Duration) -> bool {
        let mut jobs = self.jobs.lock();
        let Some(entry) = jobs.get_mut(name) else {
            return false;
        };

        entry.handle.abort();
        entry.handle = self.spawn_loop(
            name,
            entry.job.clone(),
            interval,
            Instant::now() + interval,
            entry.stats.clone(),
        );
        entry.interval = interval;
        debug!(job = name, interval_ms = interval.as_millis() as u64, "job rescheduled");
        true
    }

    /// Idempotent
    pub fn stop_job(&self, name: &str) -> bool {
        match self.jobs.lock().shift_remove(name) {
            Some(entry) => {
                entry.handle.abort();
                debug!(job = name, "job stopped");
                true
            }
            None => false,
        }
    }

    pub fn stop_all(&self) {
        let drained: Vec<(String, JobEntry)> = self.jobs.lock().drain(..).collect();
        for (_, entry) in &drained {
            entry.handle.abort();
        }
        if !drained.is_empty() {
            debug!(count = drained.len(), "all jobs stopped");
        }
    }

    pub fn is_running(&self, name: &str) -> bool {
        self.jobs.lock().contains_key(name)
    }

    pub fn active_count(&self) -> usize {
        self.jobs.lock().len()
    }

    /// Names in start order
    pub fn job_names(&self) -> Vec<String> {
        self.jobs.lock().keys().cloned().collect()
    }

    pub fn interval_of(&self, name: &str) -> Option<Duration> {
        self.jobs.lock().get(name).map(|e| e.interval)
    }

    pub fn stats(&self, name: &str) -> Option<JobStats> {
        self.jobs.lock().get(name).map(|e| e.stats.lock().clone())
    }

    /// Cycles whose backend call has not completed yet
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    fn spawn_loop(
        &self,
        name: &str,
        job: JobFn,
        interval: Duration,
        first_tick: Instant,
        stats: Arc<Mutex<JobStats>>,
    ) -> JoinHandle<()> {
        let name = name.to_string();
        let on_error = self.on_error.clone();
        let in_flight = self.in_flight.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(first_tick, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;
                stats.lock().last_run_at = Some(Utc::now());

                let cycle = job();
                let guard = InFlightGuard::new(in_flight.clone());
                let name = name.clone();
                let on_error = on_error.clone();
                let stats = stats.clone();

                tokio::spawn(async move {
                    let result = cycle.await;
                    drop(guard);

                    let streak = {
                        let mut s = stats.lock();
                        s.runs += 1;
                        match &result {
                            Ok(()) => s.consecutive_errors = 0,
                            Err(_) => s.consecutive_errors += 1,
                        }
                        s.consecutive_errors
                    };
                    if let Err(e) = result {
                        on_error(&name, &e, streak);
                    }
                });
            }
        })
    }
}

impl Default for PollScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for PollScheduler {
    fn drop(&mut self) {
        for (_, entry) in self.jobs.get_mut().drain(..) {
            entry.handle.abort();
        }
    }
}

/// Keeps the in-flight counter honest even if a cycle panics
struct InFlightGuard(Arc<AtomicUsize>);

impl InFlightGuard {
    fn new(counter: Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}
