//! SQL execution backends and result-set decoding.
//!
//! The engine composes plain SQL text and hands it to a [`Backend`].
//! [`PgBackend`] is the production implementation over a blocking
//! [`postgres::Client`]; queries run through the simple-query protocol so
//! values arrive in their text form, and a prepared statement supplies the
//! column types that drive decoding.

use std::time::{Duration, Instant};

use parking_lot::Mutex;
use postgres::types::Type;
use postgres::{Client, NoTls, SimpleQueryMessage};
use serde_json::Value;

use super::readings::format_timestamp;

/// Suppress repeated connection failure logs for this long.
const CONNECT_ERROR_THRESHOLD: Duration = Duration::from_secs(5 * 60);

/// Failure reported by a backend, carrying the SQLSTATE when the server
/// provided one.
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct BackendError {
    pub message: String,
    pub sqlstate: Option<String>,
}

impl BackendError {
    pub(crate) fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            sqlstate: None,
        }
    }
}

impl From<postgres::Error> for BackendError {
    fn from(e: postgres::Error) -> Self {
        let sqlstate = e.as_db_error().map(|db| db.code().code().to_string());
        Self {
            message: e.to_string(),
            sqlstate,
        }
    }
}

/// Executes compiled SQL. `query` returns the mapped
/// `{"count": n, "rows": [...]}` result set; `execute` returns the affected
/// row count, summed across statements for multi-statement batches.
pub trait Backend: Send {
    fn query(&mut self, sql: &str) -> Result<Value, BackendError>;
    fn execute(&mut self, sql: &str) -> Result<u64, BackendError>;
}

/// Mapping from a SQL column type to the decoding applied to its text
/// value. Everything unrecognised decodes as a plain string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Decoder {
    Integer,
    Float,
    Json,
    Timestamp,
    TrimChar,
    Text,
}

impl Decoder {
    pub(crate) fn for_type(ty: &Type) -> Self {
        if *ty == Type::INT2 || *ty == Type::INT4 || *ty == Type::INT8 {
            Decoder::Integer
        } else if *ty == Type::FLOAT4 || *ty == Type::FLOAT8 {
            Decoder::Float
        } else if *ty == Type::JSON || *ty == Type::JSONB {
            Decoder::Json
        } else if *ty == Type::TIMESTAMP || *ty == Type::TIMESTAMPTZ {
            Decoder::Timestamp
        } else if *ty == Type::BPCHAR {
            Decoder::TrimChar
        } else {
            Decoder::Text
        }
    }

    /// Decode one column value. SQL NULL and the empty string both decode
    /// to `""`, whatever the column type.
    pub(crate) fn decode(&self, raw: Option<&str>) -> Value {
        let raw = match raw {
            Some(s) if !s.is_empty() => s,
            _ => return Value::String(String::new()),
        };
        match self {
            Decoder::Integer => raw
                .parse::<i64>()
                .map(Value::from)
                .unwrap_or_else(|_| Value::String(raw.to_string())),
            Decoder::Float => raw
                .parse::<f64>()
                .ok()
                .and_then(serde_json::Number::from_f64)
                .map(Value::Number)
                .unwrap_or_else(|| Value::String(raw.to_string())),
            Decoder::Json => serde_json::from_str(raw).unwrap_or_else(|_| {
                tracing::error!("Failed to parse JSON column value: {}", raw);
                Value::String(raw.to_string())
            }),
            Decoder::Timestamp => Value::String(
                format_timestamp(raw).unwrap_or_else(|| raw.to_string()),
            ),
            Decoder::TrimChar => Value::String(raw.trim_matches(' ').to_string()),
            Decoder::Text => Value::String(raw.to_string()),
        }
    }
}

/// Blocking PostgreSQL backend.
///
/// The connection string comes from `DB_CONNECTION`, defaulting to the
/// legacy `dbname = foglamp` (retained for storage schema compatibility).
/// A lost connection is re-established on the next call; connection
/// failures are logged at most once per five minutes.
pub struct PgBackend {
    conninfo: String,
    client: Option<Client>,
    last_connect_log: Option<Instant>,
}

impl PgBackend {
    pub fn from_env() -> Self {
        let conninfo =
            std::env::var("DB_CONNECTION").unwrap_or_else(|_| "dbname = foglamp".to_string());
        Self::new(conninfo)
    }

    pub fn new(conninfo: impl Into<String>) -> Self {
        Self {
            conninfo: conninfo.into(),
            client: None,
            last_connect_log: None,
        }
    }

    fn client(&mut self) -> Result<&mut Client, BackendError> {
        if self.client.is_none() {
            match Client::connect(&self.conninfo, NoTls) {
                Ok(client) => self.client = Some(client),
                Err(e) => {
                    let log_due = self
                        .last_connect_log
                        .map_or(true, |t| t.elapsed() > CONNECT_ERROR_THRESHOLD);
                    if log_due {
                        tracing::error!("Failed to connect to the database: {}", e);
                        self.last_connect_log = Some(Instant::now());
                    }
                    return Err(BackendError::from(e));
                }
            }
        }
        self.client
            .as_mut()
            .ok_or_else(|| BackendError::new("no database connection"))
    }

    fn drop_if_closed(&mut self, e: &postgres::Error) {
        if e.is_closed() {
            self.client = None;
        }
    }
}

impl Backend for PgBackend {
    fn query(&mut self, sql: &str) -> Result<Value, BackendError> {
        let client = self.client()?;
        let result = (|| -> Result<Value, postgres::Error> {
            // The prepared statement supplies the column types; the simple
            // query protocol supplies the values in text form
            let statement = client.prepare(sql)?;
            let columns: Vec<(String, Decoder)> = statement
                .columns()
                .iter()
                .map(|c| (c.name().to_string(), Decoder::for_type(c.type_())))
                .collect();
            let mut rows = Vec::new();
            for message in client.simple_query(sql)? {
                if let SimpleQueryMessage::Row(row) = message {
                    let mut object = serde_json::Map::new();
                    for (i, (name, decoder)) in columns.iter().enumerate() {
                        object.insert(name.clone(), decoder.decode(row.get(i)));
                    }
                    rows.push(Value::Object(object));
                }
            }
            Ok(serde_json::json!({ "count": rows.len(), "rows": rows }))
        })();
        result.map_err(|e| {
            self.drop_if_closed(&e);
            BackendError::from(e)
        })
    }

    fn execute(&mut self, sql: &str) -> Result<u64, BackendError> {
        let client = self.client()?;
        let result = (|| -> Result<u64, postgres::Error> {
            let mut affected = 0;
            for message in client.simple_query(sql)? {
                if let SimpleQueryMessage::CommandComplete(n) = message {
                    affected += n;
                }
            }
            Ok(affected)
        })();
        result.map_err(|e| {
            self.drop_if_closed(&e);
            BackendError::from(e)
        })
    }
}

/// Capability for delivering storage errors to the host, replacing a
/// process-global error channel. Implementations must tolerate calls from
/// any thread.
pub trait ErrorSink: Send + Sync {
    fn report(&self, operation: &str, reason: &str, retriable: bool);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredError {
    pub operation: String,
    pub reason: String,
    pub retriable: bool,
}

/// Default sink keeping the most recent error for the management surface
/// to poll.
#[derive(Default)]
pub struct LastError {
    last: Mutex<Option<StoredError>>,
}

impl LastError {
    pub fn last(&self) -> Option<StoredError> {
        self.last.lock().clone()
    }

    pub fn clear(&self) {
        *self.last.lock() = None;
    }
}

impl ErrorSink for LastError {
    fn report(&self, operation: &str, reason: &str, retriable: bool) {
        *self.last.lock() = Some(StoredError {
            operation: operation.to_string(),
            reason: reason.to_string(),
            retriable,
        });
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decoder_table() {
        assert_eq!(Decoder::for_type(&Type::INT8), Decoder::Integer);
        assert_eq!(Decoder::for_type(&Type::INT2), Decoder::Integer);
        assert_eq!(Decoder::for_type(&Type::FLOAT4), Decoder::Float);
        assert_eq!(Decoder::for_type(&Type::JSONB), Decoder::Json);
        assert_eq!(Decoder::for_type(&Type::TIMESTAMPTZ), Decoder::Timestamp);
        assert_eq!(Decoder::for_type(&Type::BPCHAR), Decoder::TrimChar);
        assert_eq!(Decoder::for_type(&Type::NUMERIC), Decoder::Text);
        assert_eq!(Decoder::for_type(&Type::VARCHAR), Decoder::Text);
    }

    #[test]
    fn test_decode_values() {
        assert_eq!(Decoder::Integer.decode(Some("42")), serde_json::json!(42));
        assert_eq!(Decoder::Float.decode(Some("1.5")), serde_json::json!(1.5));
        assert_eq!(
            Decoder::Json.decode(Some(r#"{"v":7}"#)),
            serde_json::json!({"v": 7})
        );
        assert_eq!(
            Decoder::TrimChar.decode(Some("abc   ")),
            serde_json::json!("abc")
        );
        assert_eq!(
            Decoder::Text.decode(Some("123.4")),
            serde_json::json!("123.4")
        );
    }

    #[test]
    fn test_decode_null_and_empty_are_empty_string() {
        for decoder in [
            Decoder::Integer,
            Decoder::Float,
            Decoder::Json,
            Decoder::Timestamp,
            Decoder::Text,
        ] {
            assert_eq!(decoder.decode(None), serde_json::json!(""));
            assert_eq!(decoder.decode(Some("")), serde_json::json!(""));
        }
    }

    #[test]
    fn test_decode_timestamp_canonicalises() {
        assert_eq!(
            Decoder::Timestamp.decode(Some("2024-01-02 03:04:05.1")),
            serde_json::json!("2024-01-02 03:04:05.100000+00:00")
        );
    }

    #[test]
    fn test_last_error_sink() {
        let sink = LastError::default();
        assert!(sink.last().is_none());
        sink.report("retrieve", "boom", false);
        let stored = sink.last().unwrap();
        assert_eq!(stored.operation, "retrieve");
        assert_eq!(stored.reason, "boom");
        assert!(!stored.retriable);
        sink.clear();
        assert!(sink.last().is_none());
    }

    // Round-trip against a live database; skipped when DB_CONNECTION is
    // not set.
    #[test]
    fn test_pg_backend_round_trip() {
        if std::env::var("DB_CONNECTION").is_err() {
            return;
        }
        let mut backend = PgBackend::from_env();
        let result = backend.query("SELECT 1 AS one;").unwrap();
        assert_eq!(result["count"], 1);
        assert_eq!(result["rows"][0]["one"], 1);
    }
}
