//! North send task: fetch persisted readings, emit OMF, advance the cursor.
//!
//! One pass fetches a block of readings from storage by id, runs each
//! through the linked-data emitter, flushes the pending container
//! definitions and then posts the value batch. The cursor only advances
//! when the value batch lands, so a failed pass is retried from the same
//! position. A failed container flush prevents the value batch from being
//! sent at all.

use std::sync::Arc;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde_json::Value;

use crate::model::{DatapointValue, Reading};
use crate::storage::StorageEngine;

use super::linkdata::{OmfHints, OmfLinkedData, OMF_HINT};
use super::sender::Sender;

/// Forwards persisted readings to the OMF endpoint.
pub struct SendTask {
    storage: Arc<StorageEngine>,
    emitter: OmfLinkedData,
    sender: Box<dyn Sender>,
    data_path: String,
    headers: Vec<(String, String)>,
    block_size: u32,
    last_sent: u64,
}

impl SendTask {
    pub fn new(
        storage: Arc<StorageEngine>,
        sender: Box<dyn Sender>,
        data_path: impl Into<String>,
        block_size: u32,
    ) -> Self {
        Self {
            storage,
            emitter: OmfLinkedData::new(),
            sender,
            data_path: data_path.into(),
            headers: vec![(
                "Content-Type".to_string(),
                "application/json".to_string(),
            )],
            block_size,
            last_sent: 0,
        }
    }

    pub fn set_headers(&mut self, headers: Vec<(String, String)>) {
        self.headers = headers;
    }

    /// The id of the last reading confirmed sent; persisted by the host so
    /// forwarding resumes where it stopped.
    pub fn last_sent(&self) -> u64 {
        self.last_sent
    }

    pub fn set_last_sent(&mut self, id: u64) {
        self.last_sent = id;
    }

    /// Drop the per-connection schema state, forcing containers, assets and
    /// links to be re-established on the next pass.
    pub fn reset_connection(&mut self) {
        self.emitter.clear();
    }

    /// Run one fetch-and-forward pass. Returns the number of readings
    /// confirmed sent.
    pub fn run_once(&mut self) -> u64 {
        let result = match self.storage.fetch_readings(self.last_sent + 1, self.block_size) {
            Ok(result) => result,
            Err(e) => {
                tracing::error!("fetch for north send failed: {}", e);
                return 0;
            }
        };
        let rows = match result.get("rows").and_then(Value::as_array) {
            Some(rows) if !rows.is_empty() => rows,
            _ => return 0,
        };

        let mut fragments = Vec::new();
        let mut sent = 0u64;
        let mut max_id = self.last_sent;
        for row in rows {
            let Some((id, reading)) = reading_from_row(row) else {
                continue;
            };
            let hints = hints_for(&reading);
            let fragment = self
                .emitter
                .process_reading(&reading, "", hints.as_ref());
            if !fragment.is_empty() {
                fragments.push(fragment);
            }
            sent += 1;
            max_id = max_id.max(id);
        }
        if fragments.is_empty() {
            // Nothing emittable in the block; skip past it
            self.last_sent = max_id;
            return 0;
        }

        // Containers must be defined before the values that reference them
        if !self
            .emitter
            .flush_containers(&mut *self.sender, &self.data_path, &self.headers)
        {
            return 0;
        }

        let payload = format!("[{}]", fragments.join(","));
        match self
            .sender
            .send("POST", &self.data_path, &self.headers, &payload)
        {
            Ok((status, _)) if (200..300).contains(&status) => {
                self.last_sent = max_id;
                sent
            }
            Ok((status, body)) => {
                tracing::error!("Sending values, HTTP code {}: {}", status, body);
                0
            }
            Err(e) => {
                tracing::error!("Sending values, {}", e);
                0
            }
        }
    }
}

/// Rebuild a `Reading` from a fetched row. Rows missing the essentials are
/// skipped with a log line.
fn reading_from_row(row: &Value) -> Option<(u64, Reading)> {
    let id = row.get("id").and_then(Value::as_u64)?;
    let asset_code = row.get("asset_code").and_then(Value::as_str)?;
    let user_ts = row
        .get("user_ts")
        .and_then(Value::as_str)
        .and_then(parse_user_ts);
    let Some(user_ts) = user_ts else {
        tracing::error!(id, "fetched reading has an unparseable user_ts, skipped");
        return None;
    };
    let mut reading = Reading::new(asset_code, user_ts);
    if let Some(key) = row.get("read_key").and_then(Value::as_str) {
        if !key.is_empty() {
            reading = reading.with_read_key(key);
        }
    }
    let datapoints = row.get("reading").and_then(Value::as_object)?;
    for (name, value) in datapoints {
        reading.add_datapoint(name.clone(), DatapointValue::from_json(value));
    }
    Some((id, reading))
}

fn parse_user_ts(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f%:z") {
        return Some(ts.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

/// Hints travel in the reserved datapoint; both string and object forms
/// appear in the wild.
fn hints_for(reading: &Reading) -> Option<OmfHints> {
    match reading.datapoint(OMF_HINT)? {
        DatapointValue::Str(doc) => Some(OmfHints::parse(doc)),
        DatapointValue::Json(doc) => Some(OmfHints::parse(&doc.to_string())),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::super::sender::testing::MockSender;
    use super::*;
    use crate::storage::backend::testing::{MockBackend, MockState};
    use crate::storage::{ErrorSink, LastError};

    fn storage() -> (Arc<StorageEngine>, Arc<MockState>) {
        let (mock, state) = MockBackend::new();
        let sink = Arc::new(LastError::default()) as Arc<dyn ErrorSink>;
        (Arc::new(StorageEngine::new(Box::new(mock), sink)), state)
    }

    fn fetched_rows() -> serde_json::Value {
        serde_json::json!({"count": 2, "rows": [
            {"id": 11, "asset_code": "sensor", "read_key": "",
             "user_ts": "2024-01-02 03:04:05.100000+00:00",
             "ts": "2024-01-02 03:04:06.000000+00:00",
             "reading": {"temp": 21.5}},
            {"id": 12, "asset_code": "sensor", "read_key": "",
             "user_ts": "2024-01-02 03:04:06.100000+00:00",
             "ts": "2024-01-02 03:04:07.000000+00:00",
             "reading": {"temp": 22.0}}
        ]})
    }

    #[test]
    fn test_forward_pass_sends_containers_then_values() {
        let (storage, state) = storage();
        state.push_query_result(fetched_rows());
        let mut task = SendTask::new(storage, Box::new(MockSender::default()), "/omf/data", 10);

        let sent = task.run_once();
        assert_eq!(sent, 2);
        assert_eq!(task.last_sent(), 12);
        // The fetch used the cursor
        assert!(state.statements()[0].contains("WHERE id >= 1 "));
    }

    #[test]
    fn test_cursor_advances_between_passes() {
        let (storage, state) = storage();
        state.push_query_result(fetched_rows());
        state.push_query_result(serde_json::json!({"count": 0, "rows": []}));
        let mut task = SendTask::new(storage, Box::new(MockSender::default()), "/omf/data", 10);

        assert_eq!(task.run_once(), 2);
        assert_eq!(task.run_once(), 0);
        let statements = state.statements();
        assert!(statements[0].contains("WHERE id >= 1 "));
        assert!(statements[1].contains("WHERE id >= 13 "));
    }

    #[test]
    fn test_failed_container_flush_blocks_value_batch() {
        let (storage, state) = storage();
        state.push_query_result(fetched_rows());
        let mut sender = MockSender::default();
        sender.respond_with(500); // containers rejected
        let mut task = SendTask::new(storage, Box::new(sender), "/omf/data", 10);

        assert_eq!(task.run_once(), 0);
        // The cursor stays put so the pass is retried
        assert_eq!(task.last_sent(), 0);
    }

    #[test]
    fn test_failed_value_batch_keeps_cursor() {
        let (storage, state) = storage();
        state.push_query_result(fetched_rows());
        let mut sender = MockSender::default();
        sender.respond_with(204); // containers accepted
        sender.respond_with(503); // values rejected
        let mut task = SendTask::new(storage, Box::new(sender), "/omf/data", 10);

        assert_eq!(task.run_once(), 0);
        assert_eq!(task.last_sent(), 0);
    }

    #[test]
    fn test_storage_failure_is_zero_sent() {
        let (storage, state) = storage();
        state.push_query_error("connection lost", None);
        let mut task = SendTask::new(storage, Box::new(MockSender::default()), "/omf/data", 10);
        assert_eq!(task.run_once(), 0);
    }

    #[test]
    fn test_unemittable_block_is_skipped() {
        let (storage, state) = storage();
        // A reading whose only datapoint has an unsupported type
        state.push_query_result(serde_json::json!({"count": 1, "rows": [
            {"id": 7, "asset_code": "sensor", "read_key": "",
             "user_ts": "2024-01-02 03:04:05.100000+00:00",
             "ts": "2024-01-02 03:04:06.000000+00:00",
             "reading": {"blob": {"nested": true}}}
        ]}));
        let mut task = SendTask::new(storage, Box::new(MockSender::default()), "/omf/data", 10);
        // The asset record alone is still emitted, so the pass sends
        assert_eq!(task.run_once(), 1);
        assert_eq!(task.last_sent(), 7);
    }
}
