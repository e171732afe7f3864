//! Client-side metric store with reactive updates

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::core::events::{MetricDomain, MetricUpdate};

/// Anything the core can publish normalized updates into
pub trait MetricSink: Send + Sync {
    fn apply(&self, update: MetricUpdate);

    fn apply_all(&self, updates: Vec<MetricUpdate>) {
        for update in updates {
            self.apply(update);
        }
    }
}

/// Latest value per domain; each update replaces the whole slot
#[derive(Debug, Clone, Default)]
pub struct MetricState {
    pub latest: BTreeMap<MetricDomain, MetricUpdate>,
    pub updated_at: BTreeMap<MetricDomain, DateTime<Utc>>,
    pub total_updates: u64,
}

impl MetricState {
    pub fn get(&self, domain: MetricDomain) -> Option<&MetricUpdate> {
        self.latest.get(&domain)
    }
}

/// Thread-safe metric store
pub struct MetricStore {
    state: Arc<RwLock<MetricState>>,
    change_tx: broadcast::Sender<MetricUpdate>,
}

impl MetricStore {
    pub fn new() -> Self {
        let (change_tx, _) = broadcast::channel(256);
        Self {
            state: Arc::new(RwLock::new(MetricState::default())),
            change_tx,
        }
    }

    /// Subscribe to applied updates
    pub fn subscribe(&self) -> broadcast::Receiver<MetricUpdate> {
        self.change_tx.subscribe()
    }

    pub fn read(&self) -> parking_lot::RwLockReadGuard<'_, MetricState> {
        self.state.read()
    }

    pub fn snapshot(&self) -> MetricState {
        self.state.read().clone()
    }

    pub fn latest(&self, domain: MetricDomain) -> Option<MetricUpdate> {
        self.state.read().latest.get(&domain).cloned()
    }

    pub fn clear(&self) {
        *self.state.write() = MetricState::default();
    }
}

impl Default for MetricStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricSink for MetricStore {
    fn apply(&self, update: MetricUpdate) {
        let domain = update.domain();
        {
            let mut state = self.state.write();
            state.latest.insert(domain, update.clone());
            state.updated_at.insert(domain, Utc::now());
            state.total_updates += 1;
        }
        // no receivers is fine
        let _ = self.change_tx.send(update);
    }
}

impl Clone for MetricStore {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
            change_tx: self.change_tx.clone(),
        }
    }
}
