//! Performance counter aggregation.
//!
//! Producers call [`PerformanceMonitor::collect`] from any thread; when
//! collection is disabled the call is a relaxed atomic load and nothing
//! else. A housekeeper thread wakes on a configurable interval, snapshots
//! and zeroes every monitor, and batches the values into the storage
//! engine's `monitors` table tagged with the owning service name.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};

use crate::storage::StorageEngine;

/// Default housekeeper cadence.
pub const DEFAULT_WRITE_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Default)]
struct MonState {
    samples: u64,
    sum: i64,
    min: i64,
    max: i64,
}

/// One named performance counter.
#[derive(Debug, Default)]
pub struct PerfMon {
    state: Mutex<MonState>,
}

/// Snapshot taken when a monitor is flushed; the monitor is zeroed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonSnapshot {
    pub minimum: i64,
    pub maximum: i64,
    pub average: i64,
    pub samples: u64,
}

impl PerfMon {
    fn add_value(&self, value: i64) {
        let mut state = self.state.lock();
        if state.samples == 0 {
            state.min = value;
            state.max = value;
        } else {
            if value < state.min {
                state.min = value;
            }
            if value > state.max {
                state.max = value;
            }
        }
        state.sum += value;
        state.samples += 1;
    }

    fn take(&self) -> Option<MonSnapshot> {
        let mut state = self.state.lock();
        if state.samples == 0 {
            return None;
        }
        let snapshot = MonSnapshot {
            minimum: state.min,
            maximum: state.max,
            average: state.sum / state.samples as i64,
            samples: state.samples,
        };
        *state = MonState::default();
        Some(snapshot)
    }
}

/// Registry of performance counters for one service.
pub struct PerformanceMonitor {
    service: String,
    storage: Arc<StorageEngine>,
    collecting: Arc<AtomicBool>,
    monitors: Arc<DashMap<String, Arc<PerfMon>>>,
    interval: Duration,
    stop: Arc<(Mutex<bool>, Condvar)>,
    writer: Mutex<Option<JoinHandle<()>>>,
}

impl PerformanceMonitor {
    pub fn new(service: impl Into<String>, storage: Arc<StorageEngine>) -> Self {
        Self::with_interval(service, storage, DEFAULT_WRITE_INTERVAL)
    }

    pub fn with_interval(
        service: impl Into<String>,
        storage: Arc<StorageEngine>,
        interval: Duration,
    ) -> Self {
        Self {
            service: service.into(),
            storage,
            collecting: Arc::new(AtomicBool::new(false)),
            monitors: Arc::new(DashMap::new()),
            interval,
            stop: Arc::new((Mutex::new(false), Condvar::new())),
            writer: Mutex::new(None),
        }
    }

    /// Record a sample. A no-op unless collection is enabled; the fast path
    /// is a single relaxed load.
    pub fn collect(&self, name: &str, value: i64) {
        if !self.collecting.load(Ordering::Relaxed) {
            return;
        }
        self.do_collection(name, value);
    }

    fn do_collection(&self, name: &str, value: i64) {
        let monitor = self
            .monitors
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(PerfMon::default()))
            .clone();
        monitor.add_value(value);
    }

    /// Enable or disable collection. Enabling starts the housekeeper
    /// thread; disabling stops it without writing a partial interval.
    pub fn set_collecting(&self, state: bool) {
        self.collecting.store(state, Ordering::Relaxed);
        let mut writer = self.writer.lock();
        if state && writer.is_none() {
            *self.stop.0.lock() = false;
            let storage = Arc::clone(&self.storage);
            let monitors = Arc::clone(&self.monitors);
            let collecting = Arc::clone(&self.collecting);
            let stop = Arc::clone(&self.stop);
            let service = self.service.clone();
            let interval = self.interval;
            *writer = Some(std::thread::spawn(move || {
                tracing::info!(service = %service, "performance monitor writer started");
                loop {
                    let (lock, cv) = &*stop;
                    let mut stopped = lock.lock();
                    if !*stopped {
                        cv.wait_for(&mut stopped, interval);
                    }
                    if *stopped {
                        break;
                    }
                    drop(stopped);
                    if collecting.load(Ordering::Relaxed) {
                        write_counters(&storage, &service, &monitors);
                    }
                }
                tracing::info!(service = %service, "performance monitor writer stopped");
            }));
        } else if !state {
            if let Some(handle) = writer.take() {
                let (lock, cv) = &*self.stop;
                *lock.lock() = true;
                cv.notify_all();
                drop(writer);
                let _ = handle.join();
            }
        }
    }

    /// Flush all monitors through the storage engine now.
    pub fn write_counters(&self) {
        write_counters(&self.storage, &self.service, &self.monitors);
    }
}

impl Drop for PerformanceMonitor {
    fn drop(&mut self) {
        self.set_collecting(false);
    }
}

fn write_counters(
    storage: &StorageEngine,
    service: &str,
    monitors: &DashMap<String, Arc<PerfMon>>,
) {
    for entry in monitors.iter() {
        let Some(snapshot) = entry.value().take() else {
            continue;
        };
        let row = serde_json::json!({
            "minimum": snapshot.minimum,
            "maximum": snapshot.maximum,
            "average": snapshot.average,
            "samples": snapshot.samples,
            "service": service,
            "monitor": entry.key(),
            "ts": "now()",
        });
        if let Err(e) = storage.insert("monitors", &row.to_string()) {
            tracing::error!(monitor = %entry.key(), "failed to write performance monitor: {}", e);
        }
    }
}
