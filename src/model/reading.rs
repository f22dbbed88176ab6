use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use super::value::{Datapoint, DatapointValue};

/// One timestamped observation for an asset.
///
/// `user_ts` is the device timestamp supplied by the source; `ts` is stamped
/// server-side at construction. Datapoint names are unique within a reading:
/// adding a duplicate name replaces the previous value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reading {
    pub asset_code: String,
    pub user_ts: DateTime<Utc>,
    pub ts: DateTime<Utc>,
    pub read_key: Option<String>,
    pub datapoints: Vec<Datapoint>,
}

impl Reading {
    pub fn new(asset_code: impl Into<String>, user_ts: DateTime<Utc>) -> Self {
        Self {
            asset_code: asset_code.into(),
            user_ts,
            ts: Utc::now(),
            read_key: None,
            datapoints: Vec::new(),
        }
    }

    pub fn with_read_key(mut self, key: impl Into<String>) -> Self {
        self.read_key = Some(key.into());
        self
    }

    pub fn add_datapoint(&mut self, name: impl Into<String>, value: DatapointValue) {
        let name = name.into();
        if let Some(existing) = self.datapoints.iter_mut().find(|dp| dp.name == name) {
            existing.value = value;
        } else {
            self.datapoints.push(Datapoint::new(name, value));
        }
    }

    pub fn datapoint(&self, name: &str) -> Option<&DatapointValue> {
        self.datapoints
            .iter()
            .find(|dp| dp.name == name)
            .map(|dp| &dp.value)
    }

    /// Device timestamp in the standard format `YYYY-MM-DD HH:MM:SS.uuuuuu`,
    /// with no timezone suffix.
    pub fn user_ts_standard(&self) -> String {
        self.user_ts.format("%Y-%m-%d %H:%M:%S%.6f").to_string()
    }

    /// The element shape consumed by the storage `append_readings` payload.
    pub fn to_payload_json(&self) -> serde_json::Value {
        let mut reading = serde_json::Map::new();
        for dp in &self.datapoints {
            reading.insert(dp.name.clone(), dp.value.to_json());
        }
        let mut obj = serde_json::Map::new();
        obj.insert(
            "asset_code".to_string(),
            serde_json::Value::String(self.asset_code.clone()),
        );
        obj.insert(
            "user_ts".to_string(),
            serde_json::Value::String(format!("{}+00:00", self.user_ts_standard())),
        );
        if let Some(key) = &self.read_key {
            obj.insert(
                "read_key".to_string(),
                serde_json::Value::String(key.clone()),
            );
        }
        obj.insert(
            "reading".to_string(),
            serde_json::Value::Object(reading),
        );
        serde_json::Value::Object(obj)
    }

    /// RFC 3339 rendering of the device timestamp, for log lines.
    pub fn user_ts_rfc3339(&self) -> String {
        self.user_ts.to_rfc3339_opts(SecondsFormat::Micros, true)
    }
}

/// The unit of work passed through the filter pipeline and on to storage.
#[derive(Debug, Clone, Default)]
pub struct ReadingSet {
    pub readings: Vec<Reading>,
}

impl ReadingSet {
    pub fn new(readings: Vec<Reading>) -> Self {
        Self { readings }
    }

    pub fn len(&self) -> usize {
        self.readings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.readings.is_empty()
    }

    /// The `{"readings": [...]}` payload for `append_readings`.
    pub fn to_payload_json(&self) -> serde_json::Value {
        serde_json::json!({
            "readings": self
                .readings
                .iter()
                .map(Reading::to_payload_json)
                .collect::<Vec<_>>()
        })
    }
}

impl From<Vec<Reading>> for ReadingSet {
    fn from(readings: Vec<Reading>) -> Self {
        Self { readings }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDateTime;

    fn ts(s: &str) -> DateTime<Utc> {
        NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f")
            .unwrap()
            .and_utc()
    }

    #[test]
    fn test_standard_format_has_six_fraction_digits() {
        let r = Reading::new("a", ts("2024-01-02 03:04:05.1"));
        assert_eq!(r.user_ts_standard(), "2024-01-02 03:04:05.100000");
    }

    #[test]
    fn test_duplicate_datapoint_replaces() {
        let mut r = Reading::new("a", Utc::now());
        r.add_datapoint("t", DatapointValue::Integer(1));
        r.add_datapoint("t", DatapointValue::Integer(2));
        assert_eq!(r.datapoints.len(), 1);
        assert_eq!(r.datapoint("t"), Some(&DatapointValue::Integer(2)));
    }

    #[test]
    fn test_payload_shape() {
        let mut r = Reading::new("pump1", ts("2024-01-02 03:04:05"));
        r.add_datapoint("v", DatapointValue::Integer(7));
        let payload = r.to_payload_json();
        assert_eq!(payload["asset_code"], "pump1");
        assert_eq!(payload["user_ts"], "2024-01-02 03:04:05.000000+00:00");
        assert_eq!(payload["reading"]["v"], 7);
        assert!(payload.get("read_key").is_none());
    }

    #[test]
    fn test_set_payload_wraps_readings_array() {
        let r = Reading::new("a", Utc::now());
        let set = ReadingSet::new(vec![r.clone(), r]);
        let payload = set.to_payload_json();
        assert_eq!(payload["readings"].as_array().unwrap().len(), 2);
    }
}
