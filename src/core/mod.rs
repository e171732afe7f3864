pub mod adaptive;
pub mod batch;
pub mod demand;
pub mod events;
pub mod metrics;
pub mod normalizer;
pub mod notifier;
pub mod retry;
pub mod scheduler;
pub mod service;
pub mod state;
