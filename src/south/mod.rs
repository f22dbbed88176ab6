//! South service: the reading ingest queue and filter pipeline.
//!
//! Producers queue readings from any thread; a drain thread wakes when the
//! queue reaches a size threshold or a wall-clock deadline expires, swaps
//! the queue for an empty one and runs the captured batch through the
//! filter pipeline into storage. A second thread batches per-asset
//! statistics. The pipeline can be replaced at runtime without dropping
//! readings.
//!
//! Lock order is `pipeline` → `queue` → `stats` and is never reversed; in
//! particular the drain thread releases the queue lock before it touches
//! the pipeline.

pub mod pipeline;
mod stats;

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use serde_json::Value;

use crate::model::{Reading, ReadingSet};
use crate::storage::StorageEngine;
use crate::tracker::AssetTracker;

pub use pipeline::{ConfigError, Filter, FilterError, FilterPipeline, FilterRegistry};

use stats::{StatsState, StatsWriter};

/// Tuning for the ingest service.
#[derive(Debug, Clone)]
pub struct IngestConfig {
    /// Drain deadline in milliseconds.
    pub timeout_ms: u64,
    /// Queue size waking the drain thread early.
    pub threshold: usize,
    /// Service name used for asset tracking and statistics.
    pub service_name: String,
    /// Configuration category whose changes rebuild the filter pipeline.
    pub pipeline_category: String,
    /// Statistics flush cadence in milliseconds.
    pub stats_interval_ms: u64,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 5000,
            threshold: 100,
            service_name: "South".to_string(),
            pipeline_category: "filter".to_string(),
            stats_interval_ms: 5000,
        }
    }
}

struct Shared {
    storage: Arc<StorageEngine>,
    tracker: Arc<dyn AssetTracker>,
    service_name: String,
    pipeline_category: String,
    timeout_ms: AtomicU64,
    threshold: AtomicUsize,
    stats_interval_ms: u64,
    running: AtomicBool,
    drain_done: AtomicBool,
    queue: Mutex<Vec<Reading>>,
    cv: Condvar,
    pipeline: Mutex<FilterPipeline>,
    registry: Mutex<FilterRegistry>,
    stats: Mutex<StatsState>,
    stats_cv: Condvar,
    stats_writer: StatsWriter,
    discarded: AtomicU64,
    tracked: Mutex<HashSet<String>>,
}

/// The ingest service. Owns the drain and statistics threads; dropping the
/// service shuts both down after the queued readings are persisted.
pub struct Ingest {
    shared: Arc<Shared>,
    drain: Option<JoinHandle<()>>,
    stats: Option<JoinHandle<()>>,
}

impl Ingest {
    /// Start the service with an empty filter registry.
    pub fn start(
        storage: Arc<StorageEngine>,
        tracker: Arc<dyn AssetTracker>,
        config: IngestConfig,
    ) -> Self {
        Self::with_registry(storage, tracker, FilterRegistry::new(), config)
    }

    /// Start the service with a registry of filter plugins available to
    /// pipeline configuration changes.
    pub fn with_registry(
        storage: Arc<StorageEngine>,
        tracker: Arc<dyn AssetTracker>,
        registry: FilterRegistry,
        config: IngestConfig,
    ) -> Self {
        let shared = Arc::new(Shared {
            stats_writer: StatsWriter::new(Arc::clone(&storage)),
            storage,
            tracker,
            service_name: config.service_name,
            pipeline_category: config.pipeline_category,
            timeout_ms: AtomicU64::new(config.timeout_ms),
            threshold: AtomicUsize::new(config.threshold),
            stats_interval_ms: config.stats_interval_ms,
            running: AtomicBool::new(true),
            drain_done: AtomicBool::new(false),
            queue: Mutex::new(Vec::new()),
            cv: Condvar::new(),
            pipeline: Mutex::new(FilterPipeline::new()),
            registry: Mutex::new(registry),
            stats: Mutex::new(StatsState::default()),
            stats_cv: Condvar::new(),
            discarded: AtomicU64::new(0),
            tracked: Mutex::new(HashSet::new()),
        });

        let drain_shared = Arc::clone(&shared);
        let drain = std::thread::spawn(move || drain_loop(&drain_shared));
        let stats_shared = Arc::clone(&shared);
        let stats = std::thread::spawn(move || stats_loop(&stats_shared));

        tracing::info!("ingest service started");
        Self {
            shared,
            drain: Some(drain),
            stats: Some(stats),
        }
    }

    /// Queue one reading. Returns false without queuing when the service is
    /// shutting down; the reading is counted as discarded.
    pub fn ingest(&self, reading: Reading) -> bool {
        if !self.shared.running.load(Ordering::SeqCst) {
            self.shared.discarded.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        let mut queue = self.shared.queue.lock();
        queue.push(reading);
        if queue.len() >= self.shared.threshold.load(Ordering::Relaxed) {
            self.shared.cv.notify_one();
        }
        true
    }

    /// Queue a batch of readings.
    pub fn ingest_many(&self, readings: Vec<Reading>) -> bool {
        if !self.shared.running.load(Ordering::SeqCst) {
            self.shared
                .discarded
                .fetch_add(readings.len() as u64, Ordering::Relaxed);
            return false;
        }
        let mut queue = self.shared.queue.lock();
        queue.extend(readings);
        if queue.len() >= self.shared.threshold.load(Ordering::Relaxed) {
            self.shared.cv.notify_one();
        }
        true
    }

    /// Observational queue length; producers are not blocked.
    pub fn queue_length(&self) -> usize {
        self.shared.queue.lock().len()
    }

    /// Readings rejected or lost since startup.
    pub fn discarded(&self) -> u64 {
        self.shared.discarded.load(Ordering::Relaxed)
    }

    pub fn set_timeout(&self, timeout_ms: u64) {
        self.shared.timeout_ms.store(timeout_ms, Ordering::Relaxed);
    }

    pub fn set_threshold(&self, threshold: usize) {
        self.shared.threshold.store(threshold, Ordering::Relaxed);
    }

    pub fn running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// Handle a configuration category change. A change to the pipeline
    /// category drains the queue through the old chain, then swaps in the
    /// newly built one; producers keep queuing throughout. Other categories
    /// are ignored.
    pub fn config_change(&self, category: &str, content: &str) -> Result<(), ConfigError> {
        if category != self.shared.pipeline_category {
            tracing::debug!(category, "ignoring configuration change");
            return Ok(());
        }
        let content: Value = serde_json::from_str(content).map_err(|_| ConfigError::Parse)?;
        // Build first: a bad configuration leaves the old pipeline running
        let new_pipeline = {
            let registry = self.shared.registry.lock();
            FilterPipeline::from_config(&content, &registry)?
        };
        let mut pipeline = self.shared.pipeline.lock();
        loop {
            let data = std::mem::take(&mut *self.shared.queue.lock());
            if data.is_empty() {
                break;
            }
            self.shared.process_batch(&mut pipeline, data);
        }
        let old = std::mem::replace(&mut *pipeline, new_pipeline);
        drop(pipeline);
        old.teardown();
        tracing::info!("filter pipeline reconfigured");
        Ok(())
    }

    /// Stop the service: producers fail fast from here on, the drain thread
    /// finishes the queued readings and both threads exit.
    pub fn shutdown(&mut self) {
        if !self.shared.running.swap(false, Ordering::SeqCst) {
            return;
        }
        // Drain first so the final batches reach the stats counters before
        // the stats thread takes its last flush
        self.shared.cv.notify_all();
        if let Some(handle) = self.drain.take() {
            let _ = handle.join();
        }
        self.shared.stats_cv.notify_all();
        if let Some(handle) = self.stats.take() {
            let _ = handle.join();
        }
        tracing::info!("ingest service stopped");
    }
}

impl Drop for Ingest {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl Shared {
    /// Run one captured batch through the pipeline and into storage,
    /// accounting for the outcome. Called with the pipeline lock held and
    /// the queue lock released.
    fn process_batch(&self, pipeline: &mut FilterPipeline, data: Vec<Reading>) {
        let queued = data.len();
        let set = if pipeline.is_empty() {
            ReadingSet::new(data)
        } else {
            match pipeline.apply(ReadingSet::new(data)) {
                Ok(set) => set,
                Err(e) => {
                    tracing::error!("filter pipeline discarded batch of {}: {}", queued, e);
                    self.discarded.fetch_add(queued as u64, Ordering::Relaxed);
                    self.stats_cv.notify_one();
                    return;
                }
            }
        };
        if set.is_empty() {
            return;
        }

        for reading in &set.readings {
            let mut tracked = self.tracked.lock();
            if tracked.insert(reading.asset_code.clone()) {
                self.tracker
                    .track(&self.service_name, &reading.asset_code, "Ingest");
            }
        }

        let payload = set.to_payload_json().to_string();
        match self.storage.append_readings(&payload) {
            Ok(_) => {
                let mut stats = self.stats.lock();
                for reading in &set.readings {
                    *stats
                        .pending
                        .entry(reading.asset_code.clone())
                        .or_insert(0) += 1;
                }
                stats.readings += set.len() as u64;
                drop(stats);
                self.stats_cv.notify_one();
            }
            Err(e) => {
                // No retry on the hot path; the batch is counted and dropped
                tracing::error!("failed to append {} readings: {}", set.len(), e);
                self.discarded.fetch_add(set.len() as u64, Ordering::Relaxed);
                self.stats_cv.notify_one();
            }
        }
    }
}

fn drain_loop(shared: &Shared) {
    loop {
        let data = {
            let mut queue = shared.queue.lock();
            if queue.len() < shared.threshold.load(Ordering::Relaxed)
                && shared.running.load(Ordering::SeqCst)
            {
                let timeout = Duration::from_millis(shared.timeout_ms.load(Ordering::Relaxed));
                shared.cv.wait_for(&mut queue, timeout);
            }
            std::mem::take(&mut *queue)
        };

        if !data.is_empty() {
            let mut pipeline = shared.pipeline.lock();
            shared.process_batch(&mut pipeline, data);
        }

        if !shared.running.load(Ordering::SeqCst) {
            // Finish anything queued between the swap and the flag check
            loop {
                let rest = std::mem::take(&mut *shared.queue.lock());
                if rest.is_empty() {
                    break;
                }
                let mut pipeline = shared.pipeline.lock();
                shared.process_batch(&mut pipeline, rest);
            }
            break;
        }
    }
    // Release the stats thread for its final flush
    shared.drain_done.store(true, Ordering::SeqCst);
    shared.stats_cv.notify_all();
    tracing::debug!("drain thread exiting");
}

fn stats_loop(shared: &Shared) {
    loop {
        let (pending, readings) = {
            let mut stats = shared.stats.lock();
            let draining = shared.running.load(Ordering::SeqCst)
                || !shared.drain_done.load(Ordering::SeqCst);
            if stats.pending.is_empty()
                && shared.discarded.load(Ordering::Relaxed) == 0
                && draining
            {
                let timeout = Duration::from_millis(shared.stats_interval_ms);
                shared.stats_cv.wait_for(&mut stats, timeout);
            }
            (
                std::mem::take(&mut stats.pending),
                std::mem::take(&mut stats.readings),
            )
        };
        let discarded = shared.discarded.swap(0, Ordering::Relaxed);
        if !pending.is_empty() || readings > 0 || discarded > 0 {
            shared.stats_writer.flush(pending, readings, discarded);
        }

        if !shared.running.load(Ordering::SeqCst) && shared.drain_done.load(Ordering::SeqCst) {
            // Final flush for counters recorded while flushing above
            let (pending, readings) = {
                let mut stats = shared.stats.lock();
                (
                    std::mem::take(&mut stats.pending),
                    std::mem::take(&mut stats.readings),
                )
            };
            let discarded = shared.discarded.swap(0, Ordering::Relaxed);
            if !pending.is_empty() || readings > 0 || discarded > 0 {
                shared.stats_writer.flush(pending, readings, discarded);
            }
            break;
        }
    }
    tracing::debug!("stats thread exiting");
}
