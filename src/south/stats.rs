//! Ingest statistics flushed through the storage engine.
//!
//! Counters accumulate per asset between flushes; one update batch applies
//! them all with `value = value + N` expressions. Statistics rows are
//! created on first sight of a key and the check is cached so each key
//! costs one retrieve per process lifetime.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::json;

use crate::storage::StorageEngine;

/// Counters pending the next flush.
#[derive(Debug, Default)]
pub(crate) struct StatsState {
    pub pending: HashMap<String, u64>,
    pub readings: u64,
}

/// Writes accumulated counters to the statistics table.
pub(crate) struct StatsWriter {
    storage: Arc<StorageEngine>,
    cache: Mutex<HashSet<String>>,
}

impl StatsWriter {
    pub fn new(storage: Arc<StorageEngine>) -> Self {
        Self {
            storage,
            cache: Mutex::new(HashSet::new()),
        }
    }

    /// Apply one batch of counter increments. Keys whose row cannot be
    /// verified or created are skipped this round and retried next flush.
    pub fn flush(&self, pending: HashMap<String, u64>, readings: u64, discarded: u64) {
        let mut updates = Vec::new();
        for (key, count) in pending {
            if count == 0 {
                continue;
            }
            let description = format!("Readings ingested for asset {}", key);
            if self.ensure_entry(&key, &description) {
                updates.push(update_entry(&key, count));
            }
        }
        if readings > 0 && self.ensure_entry("READINGS", "Total readings ingested by the service")
        {
            updates.push(update_entry("READINGS", readings));
        }
        if discarded > 0 && self.ensure_entry("DISCARDED", "Readings discarded before storage") {
            updates.push(update_entry("DISCARDED", discarded));
        }
        if updates.is_empty() {
            return;
        }
        let payload = json!({ "updates": updates }).to_string();
        if let Err(e) = self.storage.update("statistics", &payload) {
            tracing::error!("failed to update statistics: {}", e);
        }
    }

    /// Verify the statistics row exists, creating it if needed. The result
    /// is cached so the verification runs once per key.
    fn ensure_entry(&self, key: &str, description: &str) -> bool {
        if self.cache.lock().contains(key) {
            return true;
        }
        let condition = json!({
            "where": {"column": "key", "condition": "=", "value": key}
        })
        .to_string();
        let exists = match self.storage.retrieve("statistics", &condition) {
            Ok(result) => result
                .get("count")
                .and_then(serde_json::Value::as_u64)
                .map_or(false, |count| count > 0),
            Err(e) => {
                tracing::error!(key, "failed to verify statistics entry: {}", e);
                return false;
            }
        };
        if !exists {
            let row = json!({
                "key": key,
                "description": description,
                "value": 0,
                "previous_value": 0,
            })
            .to_string();
            if let Err(e) = self.storage.insert("statistics", &row) {
                tracing::error!(key, "failed to create statistics entry: {}", e);
                return false;
            }
        }
        self.cache.lock().insert(key.to_string());
        true
    }
}

fn update_entry(key: &str, count: u64) -> serde_json::Value {
    json!({
        "expressions": [{"column": "value", "operator": "+", "value": count}],
        "where": {"column": "key", "condition": "=", "value": key}
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::backend::testing::MockBackend;
    use crate::storage::{ErrorSink, LastError};

    fn writer() -> (StatsWriter, Arc<crate::storage::backend::testing::MockState>) {
        let (mock, state) = MockBackend::new();
        let sink = Arc::new(LastError::default()) as Arc<dyn ErrorSink>;
        let storage = Arc::new(StorageEngine::new(Box::new(mock), sink));
        (StatsWriter::new(storage), state)
    }

    #[test]
    fn test_flush_creates_then_updates() {
        let (writer, state) = writer();
        let mut pending = HashMap::new();
        pending.insert("pump1".to_string(), 3);
        writer.flush(pending, 3, 0);

        let statements = state.statements();
        // retrieve for pump1, insert pump1, retrieve READINGS, insert
        // READINGS, then one batched update
        assert_eq!(statements.len(), 5);
        assert!(statements[0].contains("\"key\" = 'pump1'"));
        assert!(statements[1].starts_with("INSERT INTO foglamp.statistics"));
        assert!(statements[4].contains("\"value\" = \"value\" + 3"));
        assert!(statements[4].contains("'READINGS'"));
    }

    #[test]
    fn test_entry_verification_is_cached() {
        let (writer, state) = writer();
        state.push_query_result(serde_json::json!({"count": 1, "rows": [{"key": "pump1"}]}));
        let mut pending = HashMap::new();
        pending.insert("pump1".to_string(), 1);
        writer.flush(pending, 0, 0);
        let first_round = state.statements().len();

        let mut pending = HashMap::new();
        pending.insert("pump1".to_string(), 2);
        writer.flush(pending, 0, 0);
        let statements = state.statements();
        // Second flush adds only the update, no retrieve and no insert
        assert_eq!(statements.len(), first_round + 1);
        assert!(statements.last().unwrap().contains("\"value\" = \"value\" + 2"));
    }

    #[test]
    fn test_nothing_pending_writes_nothing() {
        let (writer, state) = writer();
        writer.flush(HashMap::new(), 0, 0);
        assert!(state.statements().is_empty());
    }

    #[test]
    fn test_discarded_counter_flushes() {
        let (writer, state) = writer();
        writer.flush(HashMap::new(), 0, 4);
        let statements = state.statements();
        assert!(statements
            .last()
            .unwrap()
            .contains("\"key\" = 'DISCARDED'"));
        assert!(statements.last().unwrap().contains("+ 4"));
    }
}
