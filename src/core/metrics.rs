//! Aggregate poll performance counters

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;

use crate::config::MetricsConfig;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PerformanceMetrics {
    pub success_count: u64,
    pub error_count: u64,
    /// Exponential moving average over completed calls
    pub average_response_time_ms: f64,
    pub last_polling_time: Option<DateTime<Utc>>,
    /// Completed calls since the metrics were created, never reset
    pub total_polls: u64,
}

impl PerformanceMetrics {
    pub fn record_success(&mut self, elapsed: Duration, settings: &MetricsConfig) {
        self.success_count += 1;
        self.record(elapsed, settings);
    }

    pub fn record_error(&mut self, elapsed: Duration, settings: &MetricsConfig) {
        self.error_count += 1;
        self.record(elapsed, settings);
    }

    /// Errors over completed calls in the current window; 0 when idle
    pub fn error_rate(&self) -> f64 {
        let total = self.success_count + self.error_count;
        if total == 0 {
            0.0
        } else {
            self.error_count as f64 / total as f64
        }
    }

    fn record(&mut self, elapsed: Duration, settings: &MetricsConfig) {
        let ms = elapsed.as_secs_f64() * 1000.0;
        self.average_response_time_ms = if self.total_polls == 0 {
            ms
        } else {
            let alpha = settings.ema_alpha.clamp(0.0, 1.0);
            alpha * ms + (1.0 - alpha) * self.average_response_time_ms
        };
        self.total_polls += 1;
        self.last_polling_time = Some(Utc::now());

        let limit = settings.reset_after;
        if limit > 0 && self.success_count + self.error_count >= limit {
            self.success_count = 0;
            self.error_count = 0;
        }
    }
}
