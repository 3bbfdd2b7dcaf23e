//! Structured logging setup and in-process counters for the kernel.

#![deny(unsafe_code)]

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing_subscriber::{fmt, layer::SubscriberExt, EnvFilter, Registry};

/// Initialize structured logging (JSON) with env filter.
/// `filter` is used when RUST_LOG is unset, e.g., "info,conscience=debug".
pub fn init_json_logging(filter: &str) {
    let fmt_layer = fmt::layer().json().with_current_span(true).with_span_list(true);
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter.to_string()));
    let subscriber = Registry::default().with(filter).with(fmt_layer);
    tracing::subscriber::set_global_default(subscriber).ok();
}

/// Counters for the action-out stream: enqueued, delivered and dropped
/// commands. Monotonic; not persisted across restarts.
#[derive(Debug, Clone, Default)]
pub struct DispatchMetrics {
    enqueued: Arc<AtomicU64>,
    delivered: Arc<AtomicU64>,
    dropped: Arc<AtomicU64>,
}

impl DispatchMetrics {
    /// Fresh zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    /// One command accepted onto the buffer.
    pub fn record_enqueued(&self) {
        let _ = self.enqueued.fetch_add(1, Ordering::Relaxed);
    }

    /// One command handed to the Sentinel stream.
    pub fn record_delivered(&self) {
        let _ = self.delivered.fetch_add(1, Ordering::Relaxed);
    }

    /// One command dropped because the buffer was full.
    pub fn record_dropped(&self) {
        let _ = self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// (enqueued, delivered, dropped) snapshot.
    pub fn snapshot(&self) -> (u64, u64, u64) {
        (
            self.enqueued.load(Ordering::Relaxed),
            self.delivered.load(Ordering::Relaxed),
            self.dropped.load(Ordering::Relaxed),
        )
    }
}
