//! sysdash - telemetry polling core for system-monitoring dashboards
//!
//! Polls a native telemetry backend on per-job cadences, normalizes the
//! loosely shaped responses and publishes them into a reactive metric store.

pub mod backend;
pub mod config;
pub mod core;
pub mod error;
pub mod integrations;

pub use crate::core::demand::WidgetKind;
pub use crate::core::service::{MonitorService, ServiceStatus, SessionPhase};
pub use crate::error::{BackendError, MonitorError};
