//! Monitor service - owns the polling session and wires the backend, the
//! scheduler, the adaptive controller and the metric store together.

use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::backend::{Backend, BackendResult};
use crate::config::{Config, ConfigPatch};
use crate::core::adaptive::AdaptiveController;
use crate::core::batch::{extract_list, ProcessBatchAggregator};
use crate::core::demand::{needs_gpu_process_collection, required_jobs, WidgetKind};
use crate::core::metrics::PerformanceMetrics;
use crate::core::normalizer::{
    normalize_gpu_info, normalize_realtime, normalize_system_info, normalize_top_processes,
    SensorAvailability,
};
use crate::core::notifier::{ConnectionNotifier, Subscription};
use crate::core::retry::with_retry;
use crate::core::scheduler::{JobFn, JobKind, PollScheduler};
use crate::core::state::{MetricSink, MetricStore};
use crate::error::{BackendError, ErrorKind, MonitorError, Result};

/// Lifecycle of the polling session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    #[default]
    Stopped,
    Starting,
    Running,
    Stopping,
}

/// Point-in-time view for status displays
#[derive(Debug, Clone, Serialize)]
pub struct ServiceStatus {
    pub connected: bool,
    pub phase: SessionPhase,
    pub visible: bool,
    pub performance: PerformanceMetrics,
    pub active_job_count: usize,
    pub active_jobs: Vec<String>,
    /// Job invocations whose backend call is still in flight
    pub queued_count: usize,
}

#[derive(Debug)]
struct Session {
    phase: SessionPhase,
    widgets: BTreeSet<WidgetKind>,
    /// Widget set the running jobs were built from
    applied: Option<BTreeSet<WidgetKind>>,
    /// Last value sent to the backend's GPU process collection toggle
    gpu_collection: Option<bool>,
    /// Bumped by every start attempt so a late ack can tell it was superseded
    start_epoch: u64,
    /// Why the latest start attempt failed, for callers that joined it
    start_error: Option<String>,
}

struct Inner {
    backend: Arc<dyn Backend>,
    config: RwLock<Config>,
    scheduler: PollScheduler,
    controller: Mutex<AdaptiveController>,
    performance: Mutex<PerformanceMetrics>,
    notifier: ConnectionNotifier,
    store: MetricStore,
    aggregator: Mutex<ProcessBatchAggregator>,
    sensors: Mutex<SensorAvailability>,
    session: Mutex<Session>,
    phase: watch::Sender<SessionPhase>,
    running: AtomicBool,
    shut_down: AtomicBool,
    debounce: Mutex<Option<JoinHandle<()>>>,
}

/// The telemetry polling core. Construct one per dashboard.
///
/// Methods that schedule work must be called from within a tokio runtime.
pub struct MonitorService {
    inner: Arc<Inner>,
}

impl MonitorService {
    /// Until the UI reports its widgets, every widget counts as active
    pub fn new(backend: Arc<dyn Backend>, config: Config) -> Self {
        let controller = AdaptiveController::new(config.adaptive.clone());
        Self {
            inner: Arc::new(Inner {
                backend,
                scheduler: PollScheduler::new(),
                controller: Mutex::new(controller),
                performance: Mutex::new(PerformanceMetrics::default()),
                notifier: ConnectionNotifier::new(),
                store: MetricStore::new(),
                aggregator: Mutex::new(ProcessBatchAggregator::new()),
                sensors: Mutex::new(SensorAvailability::new()),
                session: Mutex::new(Session {
                    phase: SessionPhase::Stopped,
                    widgets: WidgetKind::ALL.into_iter().collect(),
                    applied: None,
                    gpu_collection: None,
                    start_epoch: 0,
                    start_error: None,
                }),
                phase: watch::Sender::new(SessionPhase::Stopped),
                config: RwLock::new(config),
                running: AtomicBool::new(false),
                shut_down: AtomicBool::new(false),
                debounce: Mutex::new(None),
            }),
        }
    }

    /// Ask the backend to start collecting, then start the jobs the active
    /// widgets need. Transient failures of the start call are retried.
    ///
    /// A call made while another start is pending waits for that start and
    /// reports its outcome.
    pub async fn start_monitoring(&self) -> Result<()> {
        let inner = &self.inner;
        if inner.shut_down.load(Ordering::SeqCst) {
            return Err(MonitorError::ShutDown);
        }
        let (epoch, pending) = {
            let mut session = inner.session.lock();
            let phase = session.phase;
            match phase {
                SessionPhase::Running => return Ok(()),
                SessionPhase::Starting => (session.start_epoch, Some(inner.phase.subscribe())),
                _ => {
                    session.start_epoch += 1;
                    session.start_error = None;
                    inner.set_phase(&mut session, SessionPhase::Starting);
                    (session.start_epoch, None)
                }
            }
        };
        if let Some(pending) = pending {
            return Inner::join_start(inner, pending).await;
        }
        info!("starting monitoring");

        let retry = inner.config.read().retry.clone();
        let ack = with_retry(
            move || inner.backend.start_monitoring(),
            retry.max_attempts,
            retry.base_delay(),
        )
        .await;

        let failure = match ack {
            Ok(ack) if ack.success => None,
            Ok(ack) => Some(MonitorError::StartRejected(ack.message)),
            Err(e) => Some(MonitorError::Backend(e)),
        };
        let superseded = {
            let mut session = inner.session.lock();
            let current = session.start_epoch == epoch;
            if let Some(err) = failure {
                if current && session.phase == SessionPhase::Starting {
                    session.start_error = Some(err.to_string());
                    inner.set_phase(&mut session, SessionPhase::Stopped);
                }
                warn!(error = %err, "monitoring did not start");
                return Err(err);
            }
            if current && session.phase == SessionPhase::Starting {
                inner.set_phase(&mut session, SessionPhase::Running);
                None
            } else {
                // a newer start owns the backend session when the epoch moved on
                Some(current)
            }
        };
        if let Some(stopped) = superseded {
            if stopped {
                match inner.backend.stop_monitoring().await {
                    Ok(ack) if ack.success => debug!("backend stopped after a cancelled start"),
                    Ok(ack) => warn!(message = %ack.message, "backend refused to stop after a cancelled start"),
                    Err(e) => warn!(error = %e, "stop after a cancelled start failed"),
                }
            }
            return Err(MonitorError::StartRejected(
                "stopped while starting".to_string(),
            ));
        }

        inner.running.store(true, Ordering::SeqCst);
        inner.notifier.notify(true);
        Inner::rebuild_jobs(inner, true).await;
        Ok(())
    }

    /// Tear the session down. Always ends in `Stopped`, even if the backend
    /// refuses or fails the stop call.
    pub async fn stop_monitoring(&self) {
        let inner = &self.inner;
        {
            let mut session = inner.session.lock();
            if session.phase == SessionPhase::Stopped {
                return;
            }
            inner.set_phase(&mut session, SessionPhase::Stopping);
            session.applied = None;
            session.gpu_collection = None;
        }

        inner.running.store(false, Ordering::SeqCst);
        if let Some(pending) = inner.debounce.lock().take() {
            pending.abort();
        }
        inner.scheduler.stop_all();
        inner.notifier.notify(false);

        match inner.backend.stop_monitoring().await {
            Ok(ack) if ack.success => debug!("backend stopped monitoring"),
            Ok(ack) => warn!(message = %ack.message, "backend refused to stop monitoring"),
            Err(e) => warn!(error = %e, "backend stop call failed"),
        }

        inner.controller.lock().reset();
        inner.set_phase(&mut inner.session.lock(), SessionPhase::Stopped);
        info!("monitoring stopped");
    }

    pub fn is_connected(&self) -> bool {
        self.inner.notifier.is_connected()
    }

    pub fn phase(&self) -> SessionPhase {
        self.inner.session.lock().phase
    }

    /// `callback` receives the current state immediately, then every change
    pub fn on_connection_status_change<F>(&self, callback: F) -> Subscription
    where
        F: Fn(bool) + Send + Sync + 'static,
    {
        self.inner.notifier.subscribe(callback)
    }

    pub fn watch_connection(&self) -> watch::Receiver<bool> {
        self.inner.notifier.watch()
    }

    /// Report the widgets currently on screen. While running, the job set is
    /// rebuilt once the widget set has been stable for the debounce delay.
    pub fn update_active_widgets<I>(&self, widgets: I)
    where
        I: IntoIterator<Item = WidgetKind>,
    {
        let widgets: BTreeSet<WidgetKind> = widgets.into_iter().collect();
        {
            let mut session = self.inner.session.lock();
            if session.widgets == widgets {
                return;
            }
            debug!(?widgets, "active widgets changed");
            session.widgets = widgets;
        }
        if self.inner.running.load(Ordering::SeqCst) {
            self.schedule_rebuild();
        }
    }

    /// Foreground/background transition of the dashboard window
    pub fn set_visibility(&self, visible: bool) {
        let scheduler = &self.inner.scheduler;
        let jobs: Vec<(String, Duration)> = scheduler
            .job_names()
            .into_iter()
            .filter_map(|name| scheduler.interval_of(&name).map(|i| (name, i)))
            .collect();

        let changes = self.inner.controller.lock().set_visibility(visible, &jobs);
        for (name, interval) in changes {
            scheduler.restart_job(&name, interval);
        }
    }

    pub fn status(&self) -> ServiceStatus {
        let inner = &self.inner;
        ServiceStatus {
            connected: inner.notifier.is_connected(),
            phase: inner.session.lock().phase,
            visible: inner.controller.lock().is_visible(),
            performance: inner.performance.lock().clone(),
            active_job_count: inner.scheduler.active_count(),
            active_jobs: inner.scheduler.job_names(),
            queued_count: inner.scheduler.in_flight(),
        }
    }

    pub fn config(&self) -> Config {
        self.inner.config.read().clone()
    }

    /// Apply a partial config. Running jobs move to their new cadence now.
    pub fn update_config(&self, patch: &ConfigPatch) {
        let inner = &self.inner;
        let config = {
            let mut config = inner.config.write();
            config.apply(patch);
            config.clone()
        };
        inner.controller.lock().update_settings(config.adaptive.clone());
        info!("configuration updated");

        if !inner.running.load(Ordering::SeqCst) {
            return;
        }
        let targets: Vec<(JobKind, Duration)> = {
            let mut controller = inner.controller.lock();
            inner
                .scheduler
                .job_names()
                .iter()
                .filter_map(|name| JobKind::from_name(name))
                .map(|job| {
                    let interval = controller.interval_for(job.name(), config.polling.interval_for(job));
                    (job, interval)
                })
                .collect()
        };
        for (job, interval) in targets {
            if inner.scheduler.interval_of(job.name()) != Some(interval) {
                inner.scheduler.restart_job(job.name(), interval);
            }
        }
    }

    /// Published metrics
    pub fn store(&self) -> &MetricStore {
        &self.inner.store
    }

    pub fn interval_of(&self, job: JobKind) -> Option<Duration> {
        self.inner.scheduler.interval_of(job.name())
    }

    /// Stop everything and drop all subscribers. Idempotent; the service
    /// cannot be restarted afterwards.
    pub async fn cleanup(&self) {
        if self.inner.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        self.stop_monitoring().await;
        self.inner.notifier.clear();
        info!("monitor service cleaned up");
    }

    fn schedule_rebuild(&self) {
        let delay = self.inner.config.read().polling.widget_debounce();
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(inner) = weak.upgrade() {
                Inner::rebuild_jobs(&inner, false).await;
            }
        });
        if let Some(previous) = self.inner.debounce.lock().replace(task) {
            previous.abort();
        }
    }
}

impl Inner {
    fn set_phase(&self, session: &mut Session, phase: SessionPhase) {
        session.phase = phase;
        self.phase.send_replace(phase);
    }

    /// Wait for the pending start to settle and report it as our own
    async fn join_start(inner: &Arc<Inner>, mut phase: watch::Receiver<SessionPhase>) -> Result<()> {
        debug!("start already pending, waiting for it");
        let settled = phase
            .wait_for(|p| *p != SessionPhase::Starting)
            .await
            .map(|p| *p);
        match settled {
            Ok(SessionPhase::Running) => Ok(()),
            Ok(_) | Err(_) => {
                let reason = inner.session.lock().start_error.clone();
                Err(MonitorError::StartRejected(
                    reason.unwrap_or_else(|| "stopped while starting".to_string()),
                ))
            }
        }
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Tear down every job and start exactly the ones the widgets need
    async fn rebuild_jobs(inner: &Arc<Inner>, force: bool) {
        if !inner.is_running() {
            return;
        }
        let (jobs, gpu_wanted, gpu_changed) = {
            let mut session = inner.session.lock();
            if !force && session.applied.as_ref() == Some(&session.widgets) {
                return;
            }
            session.applied = Some(session.widgets.clone());
            let wanted = needs_gpu_process_collection(&session.widgets);
            let changed = session.gpu_collection != Some(wanted);
            session.gpu_collection = Some(wanted);
            (required_jobs(&session.widgets), wanted, changed)
        };

        let targets: Vec<(JobKind, Duration)> = {
            let config = inner.config.read();
            let mut controller = inner.controller.lock();
            jobs.iter()
                .map(|job| {
                    let interval = controller.interval_for(job.name(), config.polling.interval_for(*job));
                    (*job, interval)
                })
                .collect()
        };

        inner.scheduler.stop_all();
        for (job, interval) in targets {
            inner
                .scheduler
                .start_job(job.name(), Inner::job_fn(inner, job), interval);
        }
        if !inner.is_running() {
            inner.scheduler.stop_all();
            return;
        }
        info!(jobs = ?inner.scheduler.job_names(), "poll jobs rebuilt");

        if gpu_changed {
            if let Err(e) = inner.backend.set_gpu_process_monitoring(gpu_wanted).await {
                warn!(enabled = gpu_wanted, error = %e, "could not toggle gpu process collection");
            }
        }
    }

    fn job_fn(inner: &Arc<Inner>, job: JobKind) -> JobFn {
        let weak = Arc::downgrade(inner);
        Arc::new(move || {
            let weak = weak.clone();
            async move {
                match weak.upgrade() {
                    Some(inner) => inner.run_cycle(job).await,
                    None => Ok(()),
                }
            }
            .boxed()
        })
    }

    /// One poll cycle: fetch with retry, publish, feed the counters and the
    /// adaptive controller. Results arriving after a stop are discarded.
    async fn run_cycle(&self, job: JobKind) -> std::result::Result<(), BackendError> {
        if !self.is_running() {
            return Ok(());
        }
        let (retry, count) = {
            let config = self.config.read();
            (config.retry.clone(), config.polling.top_process_count)
        };

        let started = Instant::now();
        let result = with_retry(move || self.fetch(job, count), retry.max_attempts, retry.base_delay()).await;
        let elapsed = started.elapsed();

        if !self.is_running() {
            debug!(job = job.name(), "discarding result that arrived after stop");
            return Ok(());
        }

        let result = result.and_then(|raw| self.publish(job, &raw));
        let metrics = self.config.read().metrics.clone();
        match result {
            Ok(()) => {
                self.sensors.lock().mark_available(job.name());
                self.performance.lock().record_success(elapsed, &metrics);
                self.adapt(job, true);
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::Unavailable => {
                self.sensors.lock().mark_unavailable(job.name(), &e.to_string());
                Ok(())
            }
            Err(e) => {
                self.performance.lock().record_error(elapsed, &metrics);
                self.adapt(job, false);
                Err(e)
            }
        }
    }

    async fn fetch(&self, job: JobKind, count: u32) -> BackendResult<Value> {
        match job {
            JobKind::RealtimeMetrics => self.backend.get_realtime_metrics().await,
            JobKind::GpuProcesses => self.backend.get_gpu_processes().await,
            JobKind::SystemInfo => self.backend.get_system_info().await,
            JobKind::GpuInfo => self.backend.get_gpu_info().await,
            JobKind::TopProcesses => self.backend.get_top_processes(count).await,
        }
    }

    fn publish(&self, job: JobKind, raw: &Value) -> std::result::Result<(), BackendError> {
        let updates = match job {
            JobKind::RealtimeMetrics => normalize_realtime(raw),
            JobKind::SystemInfo => normalize_system_info(raw),
            JobKind::GpuInfo => normalize_gpu_info(raw),
            JobKind::TopProcesses => normalize_top_processes(raw),
            JobKind::GpuProcesses => {
                let list = extract_list(raw).ok_or_else(|| {
                    BackendError::Malformed("gpu process response holds no list".to_string())
                })?;
                let mut aggregator = self.aggregator.lock();
                let outcome = aggregator.ingest(list);
                aggregator.publish(outcome, &self.store);
                return Ok(());
            }
        };
        self.store.apply_all(updates);
        Ok(())
    }

    fn adapt(&self, job: JobKind, success: bool) {
        let Some(current) = self.scheduler.interval_of(job.name()) else {
            return;
        };
        let change = self.controller.lock().observe(job.name(), success, current);
        if let Some(interval) = change {
            self.scheduler.restart_job(job.name(), interval);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{Ack, MockBackend};
    use crate::core::events::{MetricDomain, MetricUpdate};
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn healthy_backend() -> (MockBackend, Arc<Mutex<Vec<bool>>>) {
        let flags = Arc::new(Mutex::new(Vec::new()));
        let seen = flags.clone();
        let mut backend = MockBackend::new();
        backend.expect_start_monitoring().returning(|| Ok(Ack::ok()));
        backend.expect_stop_monitoring().returning(|| Ok(Ack::ok()));
        backend
            .expect_get_realtime_metrics()
            .returning(|| Ok(json!({ "cpu_usage": 12.5 })));
        backend
            .expect_get_system_info()
            .returning(|| Ok(json!({ "cpu_cores": 8, "platform": "test" })));
        backend
            .expect_get_gpu_info()
            .returning(|| Ok(json!({ "name": "Test GPU", "usage": 40 })));
        backend.expect_get_gpu_processes().returning(|| {
            Ok(json!([
                { "pid": 100, "name": "/opt/render", "gpu_memory": 256, "gpu_usage": 30 },
                { "pid": 0, "name": "bogus", "gpu_memory": 1, "gpu_usage": 1 }
            ]))
        });
        backend.expect_get_top_processes().returning(|_| Ok(json!([])));
        backend
            .expect_set_gpu_process_monitoring()
            .returning(move |enabled| {
                seen.lock().push(enabled);
                Ok(())
            });
        (backend, flags)
    }

    fn quick_config() -> Config {
        let mut config = Config::default();
        config.retry.max_attempts = 1;
        config
    }

    fn ms(v: u64) -> Duration {
        Duration::from_millis(v)
    }

    #[tokio::test(start_paused = true)]
    async fn gpu_process_widget_runs_exactly_gpu_jobs() {
        let (backend, flags) = healthy_backend();
        let service = MonitorService::new(Arc::new(backend), quick_config());

        service.start_monitoring().await.unwrap();
        assert_eq!(service.status().active_job_count, JobKind::ALL.len());

        service.update_active_widgets([WidgetKind::GpuProcess]);
        tokio::time::sleep(ms(1_500)).await;

        assert_eq!(
            service.status().active_jobs,
            vec!["gpu_processes".to_string(), "gpu_info".to_string()]
        );
        assert_eq!(*flags.lock(), vec![true]);

        let Some(MetricUpdate::GpuProcessList(list)) =
            service.store().latest(MetricDomain::GpuProcessList)
        else {
            panic!("gpu process list was not published");
        };
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].name, "render");
        assert!(service.store().latest(MetricDomain::GpuInfo).is_some());

        service.cleanup().await;
    }

    #[tokio::test(start_paused = true)]
    async fn no_widgets_means_no_jobs() {
        let (backend, flags) = healthy_backend();
        let service = MonitorService::new(Arc::new(backend), quick_config());
        service.start_monitoring().await.unwrap();

        service.update_active_widgets(Vec::<WidgetKind>::new());
        // still debouncing
        tokio::time::sleep(ms(500)).await;
        assert_eq!(service.status().active_job_count, JobKind::ALL.len());

        tokio::time::sleep(ms(1_000)).await;
        assert_eq!(service.status().active_job_count, 0);
        assert_eq!(*flags.lock(), vec![true, false]);
        assert!(service.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn widget_churn_is_debounced_into_one_rebuild() {
        let (backend, flags) = healthy_backend();
        let service = MonitorService::new(Arc::new(backend), quick_config());
        service.update_active_widgets([WidgetKind::Ram]);
        service.start_monitoring().await.unwrap();
        assert_eq!(service.status().active_jobs, vec!["realtime_metrics".to_string()]);

        for _ in 0..5 {
            service.update_active_widgets([WidgetKind::Gpu]);
            tokio::time::sleep(ms(300)).await;
            service.update_active_widgets([WidgetKind::Ram, WidgetKind::GpuProcess]);
            tokio::time::sleep(ms(300)).await;
        }
        assert_eq!(service.status().active_jobs, vec!["realtime_metrics".to_string()]);

        tokio::time::sleep(ms(1_100)).await;
        assert_eq!(
            service.status().active_jobs,
            vec![
                "realtime_metrics".to_string(),
                "gpu_processes".to_string(),
                "gpu_info".to_string()
            ]
        );
        assert_eq!(*flags.lock(), vec![false, true]);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_with_failing_backend_still_stops() {
        let mut backend = MockBackend::new();
        backend.expect_start_monitoring().returning(|| Ok(Ack::ok()));
        backend
            .expect_stop_monitoring()
            .returning(|| Err(BackendError::transient("connection reset")));
        backend
            .expect_get_realtime_metrics()
            .returning(|| Ok(json!({ "cpu_usage": 1 })));
        backend.expect_set_gpu_process_monitoring().returning(|_| Ok(()));

        let service = MonitorService::new(Arc::new(backend), quick_config());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = seen.clone();
        let _sub = service.on_connection_status_change(move |c| log.lock().push(c));

        service.update_active_widgets([WidgetKind::Ram]);
        service.start_monitoring().await.unwrap();
        tokio::time::sleep(ms(100)).await;
        service.stop_monitoring().await;

        let status = service.status();
        assert_eq!(status.phase, SessionPhase::Stopped);
        assert!(!status.connected);
        assert!(!service.is_connected());
        assert_eq!(status.active_job_count, 0);
        assert_eq!(*seen.lock(), vec![false, true, false]);

        // idempotent
        service.stop_monitoring().await;
        assert_eq!(*seen.lock(), vec![false, true, false]);
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_start_surfaces_error() {
        let mut backend = MockBackend::new();
        backend
            .expect_start_monitoring()
            .times(1)
            .returning(|| Ok(Ack::failed("helper not installed")));

        let service = MonitorService::new(Arc::new(backend), quick_config());
        let err = service.start_monitoring().await.unwrap_err();

        assert!(matches!(err, MonitorError::StartRejected(ref m) if m == "helper not installed"));
        assert_eq!(service.phase(), SessionPhase::Stopped);
        assert!(!service.is_connected());
        assert_eq!(service.status().active_job_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_start_failures_are_retried() {
        let calls = Arc::new(Mutex::new(0));
        let counter = calls.clone();
        let mut backend = MockBackend::new();
        backend.expect_start_monitoring().returning(move || {
            let mut n = counter.lock();
            *n += 1;
            if *n < 3 {
                Err(BackendError::transient("not ready"))
            } else {
                Ok(Ack::ok())
            }
        });
        backend.expect_stop_monitoring().returning(|| Ok(Ack::ok()));
        backend.expect_set_gpu_process_monitoring().returning(|_| Ok(()));
        backend.expect_get_top_processes().returning(|_| Ok(json!([])));

        let service = MonitorService::new(Arc::new(backend), Config::default());
        service.update_active_widgets([WidgetKind::ProcessMonitor]);
        service.start_monitoring().await.unwrap();

        assert_eq!(*calls.lock(), 3);
        assert_eq!(service.phase(), SessionPhase::Running);
    }

    #[tokio::test(start_paused = true)]
    async fn sustained_failures_slow_the_job_down() {
        let mut backend = MockBackend::new();
        backend.expect_start_monitoring().returning(|| Ok(Ack::ok()));
        backend
            .expect_get_realtime_metrics()
            .returning(|| Err(BackendError::transient("rpc timeout")));
        backend.expect_set_gpu_process_monitoring().returning(|_| Ok(()));

        let mut config = quick_config();
        config.polling.realtime_metrics_ms = 1_000;
        let service = MonitorService::new(Arc::new(backend), config);
        service.update_active_widgets([WidgetKind::Ram]);
        service.start_monitoring().await.unwrap();

        tokio::time::sleep(ms(3_500)).await;
        assert_eq!(service.interval_of(JobKind::RealtimeMetrics), Some(ms(1_000)));

        tokio::time::sleep(ms(1_000)).await;
        assert_eq!(service.interval_of(JobKind::RealtimeMetrics), Some(ms(2_000)));

        let status = service.status();
        assert_eq!(status.performance.error_count, 5);
        assert_eq!(status.performance.success_count, 0);
        assert!(status.connected);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_sensor_is_not_a_failure() {
        let mut backend = MockBackend::new();
        backend.expect_start_monitoring().returning(|| Ok(Ack::ok()));
        backend
            .expect_get_gpu_info()
            .returning(|| Err(BackendError::unavailable("no gpu")));
        backend.expect_set_gpu_process_monitoring().returning(|_| Ok(()));

        let service = MonitorService::new(Arc::new(backend), quick_config());
        service.update_active_widgets([WidgetKind::Gpu]);
        service.start_monitoring().await.unwrap();
        tokio::time::sleep(ms(10_000)).await;

        let status = service.status();
        assert_eq!(status.performance.error_count, 0);
        assert_eq!(service.interval_of(JobKind::GpuInfo), Some(ms(3_000)));
        assert!(service.store().latest(MetricDomain::GpuInfo).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn background_then_foreground() {
        let (backend, _) = healthy_backend();
        let service = MonitorService::new(Arc::new(backend), quick_config());
        service.update_active_widgets([WidgetKind::Ram]);
        service.start_monitoring().await.unwrap();

        service.set_visibility(false);
        assert_eq!(service.interval_of(JobKind::RealtimeMetrics), Some(ms(60_000)));
        assert!(!service.status().visible);

        service.set_visibility(true);
        assert_eq!(service.interval_of(JobKind::RealtimeMetrics), Some(ms(3_000)));
    }

    #[tokio::test(start_paused = true)]
    async fn config_update_reschedules_immediately() {
        let (backend, _) = healthy_backend();
        let service = MonitorService::new(Arc::new(backend), quick_config());
        service.update_active_widgets([WidgetKind::Cpu]);
        service.start_monitoring().await.unwrap();

        service.update_config(&ConfigPatch {
            realtime_metrics_ms: Some(500),
            ..Default::default()
        });
        assert_eq!(service.interval_of(JobKind::RealtimeMetrics), Some(ms(500)));
        assert_eq!(service.interval_of(JobKind::SystemInfo), Some(ms(60_000)));
        assert_eq!(service.config().polling.realtime_metrics_ms, 500);
    }

    #[tokio::test(start_paused = true)]
    async fn cleanup_is_final_and_idempotent() {
        let (backend, _) = healthy_backend();
        let service = MonitorService::new(Arc::new(backend), quick_config());
        service.start_monitoring().await.unwrap();

        service.cleanup().await;
        service.cleanup().await;
        assert_eq!(service.phase(), SessionPhase::Stopped);
        assert_eq!(service.status().active_job_count, 0);
        assert!(matches!(
            service.start_monitoring().await,
            Err(MonitorError::ShutDown)
        ));
    }

    /// Backend whose realtime call takes a while to answer
    struct SlowBackend;

    #[async_trait]
    impl Backend for SlowBackend {
        async fn start_monitoring(&self) -> BackendResult<Ack> {
            Ok(Ack::ok())
        }
        async fn stop_monitoring(&self) -> BackendResult<Ack> {
            Ok(Ack::ok())
        }
        async fn get_system_info(&self) -> BackendResult<Value> {
            Err(BackendError::unavailable("slow backend"))
        }
        async fn get_realtime_metrics(&self) -> BackendResult<Value> {
            tokio::time::sleep(Duration::from_millis(500)).await;
            Ok(json!({ "cpu_usage": 50 }))
        }
        async fn get_gpu_info(&self) -> BackendResult<Value> {
            Err(BackendError::unavailable("slow backend"))
        }
        async fn get_gpu_processes(&self) -> BackendResult<Value> {
            Err(BackendError::unavailable("slow backend"))
        }
        async fn get_top_processes(&self, _count: u32) -> BackendResult<Value> {
            Err(BackendError::unavailable("slow backend"))
        }
        async fn set_gpu_process_monitoring(&self, _enabled: bool) -> BackendResult<()> {
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn late_results_are_discarded_after_stop() {
        let service = MonitorService::new(Arc::new(SlowBackend), quick_config());
        service.update_active_widgets([WidgetKind::Ram]);
        service.start_monitoring().await.unwrap();

        tokio::time::sleep(ms(100)).await;
        assert_eq!(service.status().queued_count, 1);

        service.stop_monitoring().await;
        tokio::time::sleep(ms(1_000)).await;

        assert_eq!(service.status().queued_count, 0);
        assert!(service.store().latest(MetricDomain::Cpu).is_none());
        assert_eq!(service.status().performance.total_polls, 0);
    }

    /// Backend whose start acknowledgement arrives after 500 ms
    struct DelayedStart {
        ack: Ack,
        calls: Arc<Mutex<Vec<&'static str>>>,
    }

    impl DelayedStart {
        fn new(ack: Ack) -> (Self, Arc<Mutex<Vec<&'static str>>>) {
            let calls = Arc::new(Mutex::new(Vec::new()));
            (Self { ack, calls: calls.clone() }, calls)
        }
    }

    #[async_trait]
    impl Backend for DelayedStart {
        async fn start_monitoring(&self) -> BackendResult<Ack> {
            tokio::time::sleep(Duration::from_millis(500)).await;
            self.calls.lock().push("start");
            Ok(self.ack.clone())
        }
        async fn stop_monitoring(&self) -> BackendResult<Ack> {
            self.calls.lock().push("stop");
            Ok(Ack::ok())
        }
        async fn get_system_info(&self) -> BackendResult<Value> {
            Err(BackendError::unavailable("delayed start"))
        }
        async fn get_realtime_metrics(&self) -> BackendResult<Value> {
            Ok(json!({ "cpu_usage": 5 }))
        }
        async fn get_gpu_info(&self) -> BackendResult<Value> {
            Err(BackendError::unavailable("delayed start"))
        }
        async fn get_gpu_processes(&self) -> BackendResult<Value> {
            Err(BackendError::unavailable("delayed start"))
        }
        async fn get_top_processes(&self, _count: u32) -> BackendResult<Value> {
            Err(BackendError::unavailable("delayed start"))
        }
        async fn set_gpu_process_monitoring(&self, _enabled: bool) -> BackendResult<()> {
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn stop_during_start_stops_the_backend_after_the_ack() {
        let (backend, calls) = DelayedStart::new(Ack::ok());
        let service = Arc::new(MonitorService::new(Arc::new(backend), quick_config()));
        service.update_active_widgets([WidgetKind::Ram]);

        let starting = {
            let service = service.clone();
            tokio::spawn(async move { service.start_monitoring().await })
        };
        tokio::time::sleep(ms(100)).await;
        assert_eq!(service.phase(), SessionPhase::Starting);
        service.stop_monitoring().await;

        let result = starting.await.unwrap();
        assert!(matches!(result, Err(MonitorError::StartRejected(_))));
        assert_eq!(*calls.lock(), vec!["stop", "start", "stop"]);
        assert_eq!(service.phase(), SessionPhase::Stopped);
        assert!(!service.is_connected());
        assert_eq!(service.status().active_job_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_start_reports_the_pending_failure() {
        let (backend, calls) = DelayedStart::new(Ack::failed("driver busy"));
        let service = Arc::new(MonitorService::new(Arc::new(backend), quick_config()));

        let first = {
            let service = service.clone();
            tokio::spawn(async move { service.start_monitoring().await })
        };
        tokio::time::sleep(ms(100)).await;

        let second = service.start_monitoring().await;
        match second {
            Err(MonitorError::StartRejected(reason)) => assert!(reason.contains("driver busy")),
            other => panic!("joined start should fail, got {other:?}"),
        }
        assert!(first.await.unwrap().is_err());
        assert!(!service.is_connected());
        assert_eq!(service.phase(), SessionPhase::Stopped);
        assert_eq!(*calls.lock(), vec!["start"]);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_start_shares_the_pending_success() {
        let (backend, calls) = DelayedStart::new(Ack::ok());
        let service = Arc::new(MonitorService::new(Arc::new(backend), quick_config()));
        service.update_active_widgets([WidgetKind::Ram]);

        let first = {
            let service = service.clone();
            tokio::spawn(async move { service.start_monitoring().await })
        };
        tokio::time::sleep(ms(100)).await;

        service.start_monitoring().await.unwrap();
        first.await.unwrap().unwrap();
        assert!(service.is_connected());
        assert_eq!(service.phase(), SessionPhase::Running);
        assert_eq!(*calls.lock(), vec!["start"]);

        service.cleanup().await;
    }
}
