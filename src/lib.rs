//! Periscope: Edge Data Acquisition and Forwarding Core
//!
//! The core of an edge platform that continuously ingests timestamped sensor
//! readings from a south-side source, optionally transforms them through a
//! configurable filter pipeline, persists them into a PostgreSQL-backed
//! store, and forwards persisted readings northward as OMF linked-data
//! messages.
//!
//! # Components
//!
//! - **Ingest queue + filter pipeline** ([`south`]): a bounded
//!   multi-producer queue drained by a background thread that honours both a
//!   size threshold and a wall-clock deadline, feeding an ordered chain of
//!   transform filters.
//! - **Storage engine** ([`storage`]): a JSON query dialect
//!   (select/aggregate/where/group/timebucket/sort/limit) compiled to SQL
//!   against a readings table and arbitrary common tables, plus the append,
//!   fetch and purge paths for readings.
//! - **OMF linked-data emitter** ([`north`]): incremental, idempotent
//!   emission of container, asset and link messages interleaved with value
//!   messages, memoised per connection lifetime.
//! - **LazyJSON scanner** ([`lazyjson`]): a zero-copy, depth-tracking walker
//!   over JSON documents, used by the north path and filter inspection.
//! - **Performance monitor** ([`monitor`]): background min/avg/max
//!   aggregation of runtime counters, flushed through the storage engine.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use periscope::model::{DatapointValue, Reading};
//! use periscope::south::{Ingest, IngestConfig};
//! use periscope::storage::{LastError, StorageEngine};
//! use periscope::tracker::MemoryTracker;
//!
//! let sink = Arc::new(LastError::default());
//! let storage = Arc::new(StorageEngine::postgres(sink));
//! let tracker = Arc::new(MemoryTracker::default());
//! let mut ingest = Ingest::start(storage, tracker, IngestConfig::default());
//!
//! let mut reading = Reading::new("pump1", chrono::Utc::now());
//! reading.add_datapoint("pressure", DatapointValue::Float(87.2));
//! ingest.ingest(reading);
//!
//! ingest.shutdown();
//! ```

pub mod lazyjson;
pub mod model;
pub mod monitor;
pub mod north;
pub mod south;
pub mod storage;
pub mod tracker;

// Re-export commonly used types
pub use model::{Datapoint, DatapointValue, Reading, ReadingSet};
pub use north::OmfLinkedData;
pub use south::Ingest;
pub use storage::{StorageEngine, StorageError};
