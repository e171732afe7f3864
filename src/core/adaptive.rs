//! Adaptive polling: slows jobs down on sustained errors or when the app is
//! in the background, and restores their cadence afterwards.
//!
//! Both triggers share one baseline map keyed by job name. A job's effective
//! interval is always derived from its baseline:
//!
//! - hidden app: `background_interval`
//! - degraded job: `min(2 * baseline, max_interval)`, never below the baseline
//! - otherwise: the baseline itself, and the baseline entry is dropped

use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tracing::{info, warn};

use crate::config::AdaptiveConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HealthState {
    #[default]
    Normal,
    Degraded,
}

#[derive(Debug, Default)]
struct JobHealth {
    outcomes: VecDeque<bool>,
    state: HealthState,
}

impl JobHealth {
    fn error_rate(&self) -> f64 {
        if self.outcomes.is_empty() {
            return 0.0;
        }
        let errors = self.outcomes.iter().filter(|ok| !**ok).count();
        errors as f64 / self.outcomes.len() as f64
    }
}

#[derive(Debug)]
pub struct AdaptiveController {
    settings: AdaptiveConfig,
    baselines: HashMap<String, Duration>,
    health: HashMap<String, JobHealth>,
    visible: bool,
}

impl AdaptiveController {
    pub fn new(settings: AdaptiveConfig) -> Self {
        Self {
            settings,
            baselines: HashMap::new(),
            health: HashMap::new(),
            visible: true,
        }
    }

    pub fn update_settings(&mut self, settings: AdaptiveConfig) {
        self.settings = settings;
    }

    pub fn is_visible(&self) -> bool {
        self.visible
    }

    pub fn state(&self, job: &str) -> HealthState {
        self.health.get(job).map(|h| h.state).unwrap_or_default()
    }

    /// Interval to restore once the job is healthy and visible again
    pub fn baseline(&self, job: &str) -> Option<Duration> {
        self.baselines.get(job).copied()
    }

    pub fn error_rate(&self, job: &str) -> f64 {
        self.health.get(job).map(JobHealth::error_rate).unwrap_or(0.0)
    }

    /// Record one completed cycle of `job`, currently running at `current`.
    ///
    /// Returns the new interval when the job changed state and its cadence
    /// must be rescheduled.
    pub fn observe(&mut self, job: &str, success: bool, current: Duration) -> Option<Duration> {
        let window = self.settings.window.max(1);
        let health = self.health.entry(job.to_string()).or_default();
        health.outcomes.push_back(success);
        while health.outcomes.len() > window {
            health.outcomes.pop_front();
        }
        if health.outcomes.len() < self.settings.min_samples.min(window) {
            return None;
        }

        let rate = health.error_rate();
        match health.state {
            HealthState::Normal if rate > self.settings.error_rate_high => {
                health.state = HealthState::Degraded;
                self.baselines.entry(job.to_string()).or_insert(current);
                warn!(job, error_rate = rate, "job degraded, backing off");
            }
            HealthState::Degraded if rate < self.settings.error_rate_low => {
                health.state = HealthState::Normal;
                info!(job, error_rate = rate, "job recovered");
            }
            _ => return None,
        }

        let target = self.target(job, current);
        self.release_if_settled(job);
        (target != current).then_some(target)
    }

    /// Apply a foreground/background transition to the given running jobs.
    /// Returns the jobs whose interval must change.
    pub fn set_visibility(
        &mut self,
        visible: bool,
        jobs: &[(String, Duration)],
    ) -> Vec<(String, Duration)> {
        if visible == self.visible {
            return Vec::new();
        }
        self.visible = visible;
        info!(visible, "visibility changed");

        let mut changes = Vec::new();
        for (job, current) in jobs {
            if !visible {
                self.baselines.entry(job.clone()).or_insert(*current);
            }
            let target = self.target(job, *current);
            self.release_if_settled(job);
            if target != *current {
                changes.push((job.clone(), target));
            }
        }
        changes
    }

    /// Effective interval for a job being (re)started at its configured
    /// cadence. Rebases the recorded baseline onto `configured`.
    pub fn interval_for(&mut self, job: &str, configured: Duration) -> Duration {
        if !self.visible || self.state(job) == HealthState::Degraded {
            self.baselines.insert(job.to_string(), configured);
        } else {
            self.baselines.remove(job);
        }
        self.target(job, configured)
    }

    /// Drop all per-job history; visibility is kept
    pub fn reset(&mut self) {
        self.baselines.clear();
        self.health.clear();
    }

    fn target(&self, job: &str, current: Duration) -> Duration {
        let baseline = self.baselines.get(job).copied().unwrap_or(current);
        if !self.visible {
            return Duration::from_millis(self.settings.background_interval_ms);
        }
        match self.state(job) {
            HealthState::Degraded => {
                let cap = Duration::from_millis(self.settings.max_interval_ms);
                baseline.saturating_mul(2).min(cap).max(baseline)
            }
            HealthState::Normal => baseline,
        }
    }

    fn release_if_settled(&mut self, job: &str) {
        if self.visible && self.state(job) == HealthState::Normal {
            self.baselines.remove(job);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn controller() -> AdaptiveController {
        AdaptiveController::new(AdaptiveConfig {
            error_rate_high: 0.5,
            error_rate_low: 0.05,
            window: 10,
            min_samples: 5,
            max_interval_ms: 15_000,
            background_interval_ms: 60_000,
        })
    }

    fn ms(v: u64) -> Duration {
        Duration::from_millis(v)
    }

    #[test]
    fn sustained_errors_double_interval() {
        let mut c = controller();
        for _ in 0..4 {
            assert_eq!(c.observe("gpu_info", false, ms(1000)), None);
        }
        assert_eq!(c.observe("gpu_info", false, ms(1000)), Some(ms(2000)));
        assert_eq!(c.state("gpu_info"), HealthState::Degraded);
        assert_eq!(c.baseline("gpu_info"), Some(ms(1000)));

        // already degraded: no further doubling
        assert_eq!(c.observe("gpu_info", false, ms(2000)), None);
    }

    #[test]
    fn doubling_is_capped_but_never_below_baseline() {
        let mut c = controller();
        let mut change = None;
        for _ in 0..5 {
            change = c.observe("a", false, ms(10_000)).or(change);
        }
        assert_eq!(change, Some(ms(15_000)));

        let mut c = controller();
        let mut change = None;
        for _ in 0..5 {
            change = c.observe("slow", false, ms(20_000)).or(change);
        }
        assert_eq!(change, None);
        assert_eq!(c.state("slow"), HealthState::Degraded);
    }

    #[test]
    fn recovery_restores_exact_baseline() {
        let mut c = controller();
        for _ in 0..5 {
            c.observe("realtime_metrics", false, ms(3000));
        }
        assert_eq!(c.state("realtime_metrics"), HealthState::Degraded);

        for i in 1..=10 {
            let change = c.observe("realtime_metrics", true, ms(6000));
            if i < 10 {
                assert_eq!(change, None, "recovered too early at success {i}");
            } else {
                assert_eq!(change, Some(ms(3000)));
            }
        }
        assert_eq!(c.state("realtime_metrics"), HealthState::Normal);
        assert_eq!(c.baseline("realtime_metrics"), None);
    }

    #[test]
    fn background_and_restore() {
        let mut c = controller();
        let jobs = vec![
            ("realtime_metrics".to_string(), ms(3000)),
            ("gpu_info".to_string(), ms(5000)),
        ];

        let hidden = c.set_visibility(false, &jobs);
        assert_eq!(
            hidden,
            vec![
                ("realtime_metrics".to_string(), ms(60_000)),
                ("gpu_info".to_string(), ms(60_000)),
            ]
        );
        assert!(c.set_visibility(false, &hidden).is_empty());

        let shown = c.set_visibility(true, &hidden);
        assert_eq!(shown, jobs);
        assert_eq!(c.baseline("gpu_info"), None);
    }

    #[test]
    fn visibility_and_errors_share_one_baseline() {
        let mut c = controller();
        for _ in 0..5 {
            c.observe("gpu_info", false, ms(1000));
        }
        // degraded: running at 2000, baseline 1000
        let hidden = c.set_visibility(false, &[("gpu_info".to_string(), ms(2000))]);
        assert_eq!(hidden, vec![("gpu_info".to_string(), ms(60_000))]);
        assert_eq!(c.baseline("gpu_info"), Some(ms(1000)));

        // recovers while hidden: stays on the background cadence
        let mut change = None;
        for _ in 0..10 {
            change = c.observe("gpu_info", true, ms(60_000)).or(change);
        }
        assert_eq!(change, None);
        assert_eq!(c.state("gpu_info"), HealthState::Normal);

        let shown = c.set_visibility(true, &[("gpu_info".to_string(), ms(60_000))]);
        assert_eq!(shown, vec![("gpu_info".to_string(), ms(1000))]);
    }

    #[test]
    fn shown_while_degraded_uses_doubled_interval() {
        let mut c = controller();
        c.set_visibility(false, &[("a".to_string(), ms(1000))]);
        for _ in 0..5 {
            c.observe("a", false, ms(60_000));
        }
        let shown = c.set_visibility(true, &[("a".to_string(), ms(60_000))]);
        assert_eq!(shown, vec![("a".to_string(), ms(2000))]);
        assert_eq!(c.baseline("a"), Some(ms(1000)));
    }

    #[test]
    fn restart_rebases_baseline() {
        let mut c = controller();
        assert_eq!(c.interval_for("a", ms(1000)), ms(1000));

        for _ in 0..5 {
            c.observe("a", false, ms(1000));
        }
        assert_eq!(c.interval_for("a", ms(4000)), ms(8000));
        assert_eq!(c.baseline("a"), Some(ms(4000)));

        c.reset();
        assert_eq!(c.state("a"), HealthState::Normal);
        assert_eq!(c.interval_for("a", ms(4000)), ms(4000));
    }
}
