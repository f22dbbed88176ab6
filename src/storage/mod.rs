//! SQL-backed storage layer.
//!
//! Conditions, rows and update payloads arrive as JSON documents in the
//! dialect described in [`payload`]; they are compiled to SQL against the
//! fixed schema and executed through a [`Backend`]. Results come back as
//! `{"count": n, "rows": [...]}` documents with values decoded by column
//! type. Failures are logged, delivered to the injected [`ErrorSink`] and
//! returned as [`StorageError`].

pub mod backend;
pub mod payload;
pub mod readings;
pub mod sqlbuffer;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;

pub use backend::{Backend, BackendError, ErrorSink, LastError, PgBackend, StoredError};
pub use payload::PayloadError;
pub use readings::format_timestamp;
pub use sqlbuffer::SqlBuffer;

/// Storage operation failure. Backend messages carry the server's reason;
/// a `22P02` SQLSTATE is remapped to a conversion error on the retrieve
/// paths.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error(transparent)]
    Payload(#[from] PayloadError),
    #[error("{0}")]
    Backend(String),
    #[error("No rows where updated")]
    NoRowsUpdated,
}

/// Outcome of a purge pass over the readings table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PurgeSummary {
    pub removed: u64,
    #[serde(rename = "unsentPurged")]
    pub unsent_purged: u64,
    #[serde(rename = "unsentRetained")]
    pub unsent_retained: u64,
    pub readings: u64,
}

impl PurgeSummary {
    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// The storage engine: JSON dialect in, result-set JSON or row counts out.
///
/// The backend connection is owned by the engine and serialised behind a
/// mutex, so one engine can be shared across the ingest, north and monitor
/// threads.
pub struct StorageEngine {
    backend: Mutex<Box<dyn Backend>>,
    sink: Arc<dyn ErrorSink>,
    log_sql: AtomicBool,
}

impl StorageEngine {
    pub fn new(backend: Box<dyn Backend>, sink: Arc<dyn ErrorSink>) -> Self {
        Self {
            backend: Mutex::new(backend),
            sink,
            log_sql: AtomicBool::new(false),
        }
    }

    /// Engine over the default PostgreSQL backend, configured from
    /// `DB_CONNECTION`.
    pub fn postgres(sink: Arc<dyn ErrorSink>) -> Self {
        Self::new(Box::new(PgBackend::from_env()), sink)
    }

    /// Toggle statement logging at info level.
    pub fn set_log_sql(&self, enabled: bool) {
        self.log_sql.store(enabled, Ordering::Relaxed);
    }

    /// Query a common table.
    pub fn retrieve(&self, table: &str, condition: &str) -> Result<Value, StorageError> {
        let sql = self
            .check(payload::retrieve_sql(table, condition, false))?;
        self.log_statement("CommonRetrieve", &sql);
        self.run_query("retrieve", &sql, true)
    }

    /// Query the readings table, applying the canonical projection when the
    /// condition names no columns.
    pub fn retrieve_readings(&self, condition: &str) -> Result<Value, StorageError> {
        let sql = self
            .check(payload::retrieve_sql("readings", condition, true))?;
        self.log_statement("CommonRetrieve", &sql);
        self.run_query("retrieve", &sql, true)
    }

    /// Insert one row into a common table.
    pub fn insert(&self, table: &str, data: &str) -> Result<u64, StorageError> {
        let sql = self.check(payload::insert_sql(table, data))?;
        self.log_statement("CommonInsert", &sql);
        self.run_execute("insert", &sql)
    }

    /// Apply an update batch to a common table. Touching no rows is an
    /// error, as the callers that maintain counters rely on the row being
    /// there.
    pub fn update(&self, table: &str, payload: &str) -> Result<u64, StorageError> {
        let sql = self.check(payload::update_sql(table, payload))?;
        self.log_statement("CommonUpdate", &sql);
        let affected = self.run_execute("update", &sql)?;
        if affected == 0 {
            self.raise("update", "No rows where updated");
            return Err(StorageError::NoRowsUpdated);
        }
        Ok(affected)
    }

    /// Delete rows from a common table.
    pub fn delete(&self, table: &str, condition: &str) -> Result<u64, StorageError> {
        let sql = self.check(payload::delete_sql(table, condition))?;
        self.log_statement("CommonDelete", &sql);
        self.run_execute("delete", &sql)
    }

    /// Append a batch of readings. Rows failing validation are skipped; an
    /// entirely invalid batch appends nothing and reports zero rows.
    pub fn append_readings(&self, payload: &str) -> Result<u64, StorageError> {
        let sql = match self.check(readings::append_readings_sql(payload))? {
            Some(sql) => sql,
            None => return Ok(0),
        };
        self.log_statement("ReadingsAppend", &sql);
        self.run_execute("appendReadings", &sql)
    }

    /// Fetch a block of readings starting at `id`, ordered by id.
    pub fn fetch_readings(&self, id: u64, block_size: u32) -> Result<Value, StorageError> {
        let sql = readings::fetch_readings_sql(id, block_size);
        self.log_statement("ReadingsFetch", &sql);
        self.run_query("retrieve", &sql, false)
    }

    /// Purge readings older than `age` hours. With bit 0 of `flags` set,
    /// rows not yet sent (id ≥ `sent`) are retained regardless of age; with
    /// it clear they are purged and counted. An age of zero substitutes the
    /// age of the oldest reading.
    pub fn purge_readings(
        &self,
        age: u64,
        flags: u32,
        sent: u64,
    ) -> Result<PurgeSummary, StorageError> {
        let mut age = age;
        if age == 0 {
            let sql = readings::purge_oldest_age_sql();
            self.log_statement("ReadingsPurge", &sql);
            let result = self.run_query("purge", &sql, false)?;
            age = first_value_u64(&result).unwrap_or(0);
        }

        let mut unsent_purged = 0;
        if flags & 0x01 == 0 {
            // Count the unsent rows we are about to remove
            let sql = readings::purge_unsent_count_sql(age, sent);
            self.log_statement("ReadingsPurge", &sql);
            if let Ok(result) = self.run_query("retrieve", &sql, false) {
                unsent_purged = first_value_u64(&result).unwrap_or(0);
            }
        }

        let sql = readings::purge_delete_sql(age, flags, sent);
        self.log_statement("ReadingsPurge", &sql);
        let removed = self.run_execute("retrieve", &sql)?;

        let sql = readings::purge_retained_count_sql(sent);
        self.log_statement("ReadingsPurge", &sql);
        let unsent_retained = self
            .run_query("retrieve", &sql, false)
            .ok()
            .and_then(|r| first_value_u64(&r))
            .unwrap_or(0);

        let sql = readings::purge_total_count_sql();
        self.log_statement("ReadingsPurge", &sql);
        let readings = self
            .run_query("retrieve", &sql, false)
            .ok()
            .and_then(|r| first_value_u64(&r))
            .unwrap_or(0);

        Ok(PurgeSummary {
            removed,
            unsent_purged,
            unsent_retained,
            readings,
        })
    }

    /// Size of a table in bytes.
    pub fn table_size(&self, table: &str) -> Result<i64, StorageError> {
        let sql = readings::table_size_sql(table);
        let result = self.run_query("tableSize", &sql, false)?;
        first_value_u64(&result)
            .map(|v| v as i64)
            .ok_or_else(|| StorageError::Backend("table size unavailable".to_string()))
    }

    /// The sink storage errors are delivered to, for hosts that need to
    /// inspect it.
    pub fn error_sink(&self) -> Arc<dyn ErrorSink> {
        Arc::clone(&self.sink)
    }

    fn check<T>(&self, result: Result<T, PayloadError>) -> Result<T, StorageError> {
        result.map_err(|e| {
            self.raise(e.context(), &e.to_string());
            StorageError::Payload(e)
        })
    }

    fn run_query(
        &self,
        operation: &str,
        sql: &str,
        remap_conversion: bool,
    ) -> Result<Value, StorageError> {
        match self.backend.lock().query(sql) {
            Ok(value) => Ok(value),
            Err(e) => {
                let reason = remap(e, remap_conversion);
                self.raise(operation, &reason);
                Err(StorageError::Backend(reason))
            }
        }
    }

    fn run_execute(&self, operation: &str, sql: &str) -> Result<u64, StorageError> {
        match self.backend.lock().execute(sql) {
            Ok(count) => Ok(count),
            Err(e) => {
                let reason = remap(e, false);
                self.raise(operation, &reason);
                Err(StorageError::Backend(reason))
            }
        }
    }

    fn raise(&self, operation: &str, reason: &str) {
        tracing::error!("storage engine raising error: {}: {}", operation, reason);
        self.sink.report(operation, reason, false);
    }

    fn log_statement(&self, tag: &str, sql: &str) {
        if self.log_sql.load(Ordering::Relaxed) {
            tracing::info!("{}: {}", tag, sql);
        }
    }
}

fn remap(e: BackendError, remap_conversion: bool) -> String {
    if remap_conversion && e.sqlstate.as_deref() == Some("22P02") {
        "Unable to convert data to the required type".to_string()
    } else {
        e.message
    }
}

/// Pull the single value out of a one-row, one-column count result. Counts
/// arrive as numbers from decoded int columns and as strings from numeric
/// ones.
fn first_value_u64(result: &Value) -> Option<u64> {
    let row = result.get("rows")?.as_array()?.first()?;
    let value = row.as_object()?.values().next()?;
    match value {
        Value::Number(n) => n.as_u64().or_else(|| n.as_f64().map(|f| f as u64)),
        Value::String(s) => s.parse::<f64>().ok().map(|f| f.round() as u64),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::backend::testing::MockBackend;
    use super::*;

    fn engine() -> (StorageEngine, std::sync::Arc<backend::testing::MockState>, Arc<LastError>) {
        let (mock, state) = MockBackend::new();
        let sink = Arc::new(LastError::default());
        (
            StorageEngine::new(Box::new(mock), Arc::clone(&sink) as Arc<dyn ErrorSink>),
            state,
            sink,
        )
    }

    #[test]
    fn test_retrieve_routes_compiled_sql() {
        let (engine, state, _) = engine();
        state.push_query_result(serde_json::json!({"count": 1, "rows": [{"id": 1}]}));
        let result = engine.retrieve("config", "").unwrap();
        assert_eq!(result["count"], 1);
        assert_eq!(state.statements(), vec!["SELECT * FROM foglamp.config;"]);
    }

    #[test]
    fn test_bad_in_clause_reports_through_sink() {
        let (engine, state, sink) = engine();
        let err = engine
            .delete("t", r#"{"where":{"column":"c","condition":"in","value":[]}}"#)
            .unwrap_err();
        assert!(matches!(err, StorageError::Payload(_)));
        let stored = sink.last().unwrap();
        assert_eq!(stored.operation, "where clause");
        assert_eq!(
            stored.reason,
            "The \"value\" of a \"in\" condition must be an array and must not be empty."
        );
        assert!(!stored.retriable);
        // Nothing reached the backend
        assert!(state.statements().is_empty());
    }

    #[test]
    fn test_append_readings_returns_row_count() {
        let (engine, state, _) = engine();
        state.push_execute_result(2);
        let payload = r#"{"readings":[
            {"asset_code":"a","user_ts":"2024-01-02 03:04:05","reading":{"v":1}},
            {"asset_code":"b","user_ts":"2024-01-02 03:04:06","reading":{"v":2}}]}"#;
        assert_eq!(engine.append_readings(payload).unwrap(), 2);
        assert!(state.statements()[0].starts_with("INSERT INTO foglamp.readings"));
    }

    #[test]
    fn test_append_readings_empty_batch_is_zero_rows() {
        let (engine, state, _) = engine();
        let payload = r#"{"readings":[{"asset_code":"a","user_ts":"junk","reading":{}}]}"#;
        assert_eq!(engine.append_readings(payload).unwrap(), 0);
        assert!(state.statements().is_empty());
    }

    #[test]
    fn test_update_zero_rows_is_an_error() {
        let (engine, state, sink) = engine();
        state.push_execute_result(0);
        let payload =
            r#"{"values":{"value":1},"where":{"column":"key","condition":"=","value":"X"}}"#;
        let err = engine.update("statistics", payload).unwrap_err();
        assert!(matches!(err, StorageError::NoRowsUpdated));
        assert_eq!(sink.last().unwrap().reason, "No rows where updated");
    }

    #[test]
    fn test_purge_keeps_unsent_rows() {
        // Scenario: 5 rows older than the window, ids 10..14, sent cursor 12.
        // With the retain-unsent flag the two rows below the cursor go, the
        // three at or above it stay.
        let (engine, state, _) = engine();
        state.push_execute_result(2); // DELETE removes ids 10, 11
        state.push_query_result(serde_json::json!({"count":1,"rows":[{"count": 3}]})); // unsent
        state.push_query_result(serde_json::json!({"count":1,"rows":[{"count": 3}]})); // total

        let summary = engine.purge_readings(2, 1, 12).unwrap();
        assert_eq!(summary.removed, 2);
        assert_eq!(summary.unsent_purged, 0);
        assert_eq!(summary.unsent_retained, 3);
        assert_eq!(summary.readings, 3);

        let statements = state.statements();
        assert_eq!(
            statements[0],
            "DELETE FROM foglamp.readings WHERE user_ts < now() - INTERVAL '2 hours' \
             AND id < 12;"
        );
        assert_eq!(
            statements[1],
            "SELECT count(*) FROM foglamp.readings WHERE id > 12;"
        );
        assert_eq!(statements[2], "SELECT count(*) FROM foglamp.readings;");
    }

    #[test]
    fn test_purge_counts_unsent_when_not_retaining() {
        let (engine, state, _) = engine();
        state.push_query_result(serde_json::json!({"count":1,"rows":[{"count": 2}]})); // unsent purged
        state.push_execute_result(5);
        state.push_query_result(serde_json::json!({"count":1,"rows":[{"count": 0}]}));
        state.push_query_result(serde_json::json!({"count":1,"rows":[{"count": 0}]}));

        let summary = engine.purge_readings(2, 0, 12).unwrap();
        assert_eq!(summary.removed, 5);
        assert_eq!(summary.unsent_purged, 2);
        let statements = state.statements();
        assert_eq!(
            statements[0],
            "SELECT count(*) FROM foglamp.readings WHERE user_ts < now() - \
             INTERVAL '2 hours' AND id > 12;"
        );
        assert_eq!(
            statements[1],
            "DELETE FROM foglamp.readings WHERE user_ts < now() - INTERVAL '2 hours';"
        );
    }

    #[test]
    fn test_purge_zero_age_substitutes_oldest() {
        let (engine, state, _) = engine();
        // numeric columns decode as strings from a live backend
        state.push_query_result(serde_json::json!({"count":1,"rows":[{"round": "7"}]}));
        state.push_execute_result(1);

        let summary = engine.purge_readings(0, 1, 3).unwrap();
        assert_eq!(summary.removed, 1);
        let statements = state.statements();
        assert!(statements[0].contains("round(extract(epoch FROM (now() - min(user_ts)))/360)"));
        assert!(statements[1].contains("INTERVAL '7 hours'"));
    }

    #[test]
    fn test_purge_summary_json_shape() {
        let summary = PurgeSummary {
            removed: 2,
            unsent_purged: 0,
            unsent_retained: 3,
            readings: 3,
        };
        assert_eq!(
            summary.to_json(),
            serde_json::json!({
                "removed": 2, "unsentPurged": 0, "unsentRetained": 3, "readings": 3
            })
        );
    }

    #[test]
    fn test_fetch_readings_compiles_cursor_query() {
        let (engine, state, _) = engine();
        state.push_query_result(serde_json::json!({"count": 0, "rows": []}));
        engine.fetch_readings(100, 50).unwrap();
        assert_eq!(
            state.statements()[0],
            readings::fetch_readings_sql(100, 50)
        );
    }

    #[test]
    fn test_backend_failure_surfaces_and_reports() {
        let (engine, state, sink) = engine();
        state.push_execute_error("relation does not exist");
        let err = engine.insert("missing", r#"{"a":1}"#).unwrap_err();
        assert!(matches!(err, StorageError::Backend(_)));
        assert_eq!(sink.last().unwrap().operation, "insert");
        assert_eq!(sink.last().unwrap().reason, "relation does not exist");
    }

    #[test]
    fn test_retrieve_remaps_conversion_errors() {
        let (engine, state, sink) = engine();
        state.push_query_error("invalid input syntax", Some("22P02"));
        let err = engine.retrieve_readings(r#"{"limit": 1}"#).unwrap_err();
        match err {
            StorageError::Backend(reason) => {
                assert_eq!(reason, "Unable to convert data to the required type")
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert_eq!(
            sink.last().unwrap().reason,
            "Unable to convert data to the required type"
        );
    }
}
