//! Backend seam - the native telemetry provider the poll jobs talk to
//!
//! Responses are loosely shaped JSON because field names differ between
//! backend versions; `core::normalizer` owns turning them into canonical
//! updates.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::BackendError;

/// Acknowledgement returned by the session control calls
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    pub success: bool,
    #[serde(default)]
    pub message: String,
}

impl Ack {
    pub fn ok() -> Self {
        Self {
            success: true,
            message: String::new(),
        }
    }

    pub fn failed<S: Into<String>>(message: S) -> Self {
        Self {
            success: false,
            message: message.into(),
        }
    }
}

pub type BackendResult<T> = Result<T, BackendError>;

/// Request/response operations exposed by the native backend.
///
/// Every call may fail transiently; implementations report a missing sensor
/// with [`BackendError::Unavailable`] instead of inventing values.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Backend: Send + Sync {
    async fn start_monitoring(&self) -> BackendResult<Ack>;

    async fn stop_monitoring(&self) -> BackendResult<Ack>;

    async fn get_system_info(&self) -> BackendResult<Value>;

    async fn get_realtime_metrics(&self) -> BackendResult<Value>;

    async fn get_gpu_info(&self) -> BackendResult<Value>;

    async fn get_gpu_processes(&self) -> BackendResult<Value>;

    async fn get_top_processes(&self, count: u32) -> BackendResult<Value>;

    /// Best effort toggle; callers log and swallow failures
    async fn set_gpu_process_monitoring(&self, enabled: bool) -> BackendResult<()>;
}
