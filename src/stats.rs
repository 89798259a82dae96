use chrono::Utc;
use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc, Mutex,
};
use std::time::Duration;
use tokio::task::JoinHandle;

#[derive(Debug, Default)]
pub struct WorkerStats {
    pub received: AtomicU64,
    pub persisted: AtomicU64,
    pub malformed: AtomicU64,
    pub write_failures: AtomicU64,
    pub delivery_errors: AtomicU64,
    pub settle_failures: AtomicU64,
    pub last_persisted_unix_ms: AtomicU64,
    pub broker_connected: AtomicBool,
    pub last_error: Mutex<Option<String>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub received: u64,
    pub persisted: u64,
    pub malformed: u64,
    pub write_failures: u64,
    pub delivery_errors: u64,
    pub settle_failures: u64,
    pub last_persisted_unix_ms: u64,
    pub broker_connected: bool,
    pub last_error: Option<String>,
}

impl WorkerStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_broker_connected(&self, connected: bool) {
        self.broker_connected.store(connected, Ordering::Relaxed);
    }

    pub fn record_received(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_persisted(&self) {
        self.persisted.fetch_add(1, Ordering::Relaxed);
        let now = Utc::now().timestamp_millis().max(0) as u64;
        self.last_persisted_unix_ms.store(now, Ordering::Relaxed);
    }

    pub fn record_malformed(&self, err: impl Into<String>) {
        self.malformed.fetch_add(1, Ordering::Relaxed);
        self.record_error(err);
    }

    pub fn record_write_failure(&self, err: impl Into<String>) {
        self.write_failures.fetch_add(1, Ordering::Relaxed);
        self.record_error(err);
    }

    pub fn record_delivery_error(&self, err: impl Into<String>) {
        self.delivery_errors.fetch_add(1, Ordering::Relaxed);
        self.record_error(err);
    }

    pub fn record_settle_failure(&self, err: impl Into<String>) {
        self.settle_failures.fetch_add(1, Ordering::Relaxed);
        self.record_error(err);
    }

    pub fn record_error(&self, err: impl Into<String>) {
        if let Ok(mut guard) = self.last_error.lock() {
            *guard = Some(err.into());
        }
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            persisted: self.persisted.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
            write_failures: self.write_failures.load(Ordering::Relaxed),
            delivery_errors: self.delivery_errors.load(Ordering::Relaxed),
            settle_failures: self.settle_failures.load(Ordering::Relaxed),
            last_persisted_unix_ms: self.last_persisted_unix_ms.load(Ordering::Relaxed),
            broker_connected: self.broker_connected.load(Ordering::Relaxed),
            last_error: self.last_error.lock().ok().and_then(|guard| guard.clone()),
        }
    }
}

impl StatsSnapshot {
    pub fn log(&self, message: &'static str) {
        tracing::info!(
            received = self.received,
            persisted = self.persisted,
            malformed = self.malformed,
            write_failures = self.write_failures,
            delivery_errors = self.delivery_errors,
            settle_failures = self.settle_failures,
            last_persisted_unix_ms = self.last_persisted_unix_ms,
            broker_connected = self.broker_connected,
            last_error = self.last_error.as_deref().unwrap_or(""),
            "{message}"
        );
    }
}

pub fn spawn_reporter(stats: Arc<WorkerStats>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // The first tick completes immediately; skip it so the first report covers a full period.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            stats.snapshot().log("ingest stats");
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_counters_and_last_error() {
        let stats = WorkerStats::new();
        stats.record_received();
        stats.record_received();
        stats.record_persisted();
        stats.record_malformed("bad json");
        stats.set_broker_connected(true);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.received, 2);
        assert_eq!(snapshot.persisted, 1);
        assert_eq!(snapshot.malformed, 1);
        assert_eq!(snapshot.write_failures, 0);
        assert!(snapshot.broker_connected);
        assert!(snapshot.last_persisted_unix_ms > 0);
        assert_eq!(snapshot.last_error.as_deref(), Some("bad json"));
    }
}
