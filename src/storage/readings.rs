//! SQL builders for the readings table: append, fetch and purge, plus the
//! canonical timestamp normalisation applied on the append path.

use chrono::NaiveDateTime;
use serde_json::Value;

use super::payload::{escape, is_function_call, PayloadError, SCHEMA_PREFIX};
use super::sqlbuffer::SqlBuffer;

/// Normalise a timestamp string to the canonical
/// `YYYY-MM-DD HH:MM:SS.uuuuuu±HH:MM` form.
///
/// Accepted grammar: `YYYY-MM-DD HH:MM:SS[.fraction][±HH[:MM]]`. The
/// fractional part is padded (or truncated) to exactly six digits; a missing
/// timezone defaults to `+00:00`; short timezone fields are padded, so
/// `+1` becomes `+01:00` and `+01:3` becomes `+01:30`.
///
/// ```
/// # use periscope::storage::format_timestamp;
/// assert_eq!(
///     format_timestamp("2019-03-01 10:03:01.1+00:00").as_deref(),
///     Some("2019-03-01 10:03:01.100000+00:00")
/// );
/// ```
pub fn format_timestamp(date: &str) -> Option<String> {
    let (dt, rest) = NaiveDateTime::parse_and_remainder(date, "%Y-%m-%d %H:%M:%S").ok()?;
    let mut out = dt.format("%Y-%m-%d %H:%M:%S").to_string();

    // Fractional seconds, padded to exactly six digits
    let mut rest = rest;
    let mut fraction = String::new();
    if let Some(tail) = rest.strip_prefix('.') {
        let digits = tail.chars().take_while(|c| c.is_ascii_digit()).count();
        fraction.push_str(&tail[..digits.min(6)]);
        rest = &tail[digits..];
    }
    while fraction.len() < 6 {
        fraction.push('0');
    }
    out.push('.');
    out.push_str(&fraction);

    // Timezone, defaulting to UTC
    let sign = match rest.chars().next() {
        Some(c @ ('+' | '-')) => c,
        _ => {
            out.push_str("+00:00");
            return Some(out);
        }
    };
    let rest = &rest[1..];
    let hour_len = rest
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .count()
        .min(2);
    if hour_len == 0 {
        out.push_str("+00:00");
        return Some(out);
    }
    let hours = &rest[..hour_len];
    let rest = &rest[hour_len..];
    out.push(sign);
    if hours.len() == 1 {
        out.push('0');
    }
    out.push_str(hours);
    out.push(':');
    let minutes: String = match rest.strip_prefix(':') {
        Some(tail) => tail
            .chars()
            .take_while(|c| c.is_ascii_digit())
            .take(2)
            .collect(),
        None => String::new(),
    };
    if minutes.is_empty() {
        out.push_str("00");
    } else {
        out.push_str(&minutes);
        if minutes.len() == 1 {
            out.push('0');
        }
    }
    Some(out)
}

/// Build the multi-row INSERT for `append_readings`.
///
/// Rows with an invalid or missing timestamp, asset code or reading body
/// are skipped with an error log; the rest of the batch proceeds. Returns
/// `Ok(None)` when no row survives validation.
pub(crate) fn append_readings_sql(payload: &str) -> Result<Option<String>, PayloadError> {
    const CTX: &str = "appendReadings";
    let document: Value = serde_json::from_str(payload)
        .map_err(|_| PayloadError::Parse { context: CTX })?;
    let readings = document
        .get("readings")
        .ok_or_else(|| schema(CTX, "Payload is missing a readings array"))?;
    let readings = readings
        .as_array()
        .ok_or_else(|| schema(CTX, "Payload is missing the readings array"))?;

    let mut sql = SqlBuffer::new();
    sql.append("INSERT INTO ");
    sql.append(SCHEMA_PREFIX);
    sql.append("readings ( user_ts, asset_code, read_key, reading ) VALUES ");

    let mut row = 0;
    for reading in readings {
        let reading = reading.as_object().ok_or_else(|| {
            schema(CTX, "Each reading in the readings array must be an object")
        })?;

        let user_ts = match reading.get("user_ts").and_then(Value::as_str) {
            Some(ts) => ts,
            None => {
                tracing::error!("Reading is missing a user_ts property, row skipped");
                continue;
            }
        };
        let asset_code = match reading.get("asset_code").and_then(Value::as_str) {
            Some(code) => code,
            None => {
                tracing::error!("Reading is missing an asset_code property, row skipped");
                continue;
            }
        };
        let body = match reading.get("reading") {
            Some(body) => body,
            None => {
                tracing::error!(asset_code, "Reading has no reading body, row skipped");
                continue;
            }
        };

        // Timestamps may be SQL function calls (now()), otherwise they are
        // normalised to the canonical form
        let ts_literal = if is_function_call(user_ts) {
            user_ts.to_string()
        } else {
            match format_timestamp(user_ts) {
                Some(formatted) => format!("'{}'", formatted),
                None => {
                    tracing::error!("Invalid date |{}|", user_ts);
                    continue;
                }
            }
        };

        if row > 0 {
            sql.append(", (");
        } else {
            sql.append_char('(');
        }
        row += 1;

        sql.append(&ts_literal);
        sql.append(",'");
        sql.append(&escape(asset_code));

        // The south REST surface passes the literal string "None" when no
        // read key is present
        match reading.get("read_key").and_then(Value::as_str) {
            Some(key) if key != "None" => {
                sql.append("', '");
                sql.append(&escape(key));
                sql.append("', '");
            }
            _ => {
                sql.append("', NULL, '");
            }
        }

        sql.append(&escape(&body.to_string()));
        sql.append("')");
    }

    if row == 0 {
        return Ok(None);
    }
    sql.append_char(';');
    Ok(Some(sql.coalesce()))
}

/// Cursor query for a block of readings, oldest first.
pub(crate) fn fetch_readings_sql(id: u64, block_size: u32) -> String {
    format!(
        "SELECT id, asset_code, read_key, reading, \
         user_ts AT TIME ZONE 'UTC' as \"user_ts\", \
         ts AT TIME ZONE 'UTC' as \"ts\" \
         FROM {prefix}readings WHERE id >= {id} ORDER BY id LIMIT {block_size};",
        prefix = SCHEMA_PREFIX,
    )
}

/// The zero-age substitution query. The historical `/360` divisor is kept
/// verbatim for compatibility with deployed purge schedules.
pub(crate) fn purge_oldest_age_sql() -> String {
    format!(
        "SELECT round(extract(epoch FROM (now() - min(user_ts)))/360) from {}readings;",
        SCHEMA_PREFIX
    )
}

pub(crate) fn purge_unsent_count_sql(age: u64, sent: u64) -> String {
    format!(
        "SELECT count(*) FROM {}readings WHERE user_ts < now() - INTERVAL '{} hours' AND id > {};",
        SCHEMA_PREFIX, age, sent
    )
}

pub(crate) fn purge_delete_sql(age: u64, flags: u32, sent: u64) -> String {
    let mut sql = SqlBuffer::new();
    sql.append("DELETE FROM ");
    sql.append(SCHEMA_PREFIX);
    sql.append("readings WHERE user_ts < now() - INTERVAL '");
    sql.append_u64(age);
    sql.append(" hours'");
    if flags & 0x01 == 0x01 {
        // Don't delete unsent rows
        sql.append(" AND id < ");
        sql.append_u64(sent);
    }
    sql.append_char(';');
    sql.coalesce()
}

pub(crate) fn purge_retained_count_sql(sent: u64) -> String {
    format!(
        "SELECT count(*) FROM {}readings WHERE id > {};",
        SCHEMA_PREFIX, sent
    )
}

pub(crate) fn purge_total_count_sql() -> String {
    format!("SELECT count(*) FROM {}readings;", SCHEMA_PREFIX)
}

pub(crate) fn table_size_sql(table: &str) -> String {
    format!(
        "SELECT pg_total_relation_size(relid) FROM pg_catalog.pg_statio_user_tables \
         WHERE relname = '{}';",
        escape(table)
    )
}

fn schema(context: &'static str, message: &str) -> PayloadError {
    PayloadError::Schema {
        context,
        message: message.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_timestamp_cases() {
        // Every accepted input shape, with and without fractions and zones
        let cases = [
            ("2019-01-01 10:01:01", "2019-01-01 10:01:01.000000+00:00"),
            ("2019-02-01 10:02:01.0", "2019-02-01 10:02:01.000000+00:00"),
            ("2019-02-02 10:02:02.841", "2019-02-02 10:02:02.841000+00:00"),
            (
                "2019-02-03 10:02:03.123456",
                "2019-02-03 10:02:03.123456+00:00",
            ),
            (
                "2019-03-01 10:03:01.1+00:00",
                "2019-03-01 10:03:01.100000+00:00",
            ),
            (
                "2019-03-02 10:03:02.123+00:00",
                "2019-03-02 10:03:02.123000+00:00",
            ),
            (
                "2019-03-04 10:03:04.123456+01:00",
                "2019-03-04 10:03:04.123456+01:00",
            ),
            (
                "2019-03-05 10:03:05.123456-01:00",
                "2019-03-05 10:03:05.123456-01:00",
            ),
            (
                "2019-03-04 10:03:04.123456+02:30",
                "2019-03-04 10:03:04.123456+02:30",
            ),
        ];
        for (input, expected) in cases {
            assert_eq!(format_timestamp(input).as_deref(), Some(expected), "{input}");
        }
    }

    #[test]
    fn test_format_timestamp_pads_short_timezone_fields() {
        assert_eq!(
            format_timestamp("2019-01-01 10:01:01.5+1").as_deref(),
            Some("2019-01-01 10:01:01.500000+01:00")
        );
        assert_eq!(
            format_timestamp("2019-01-01 10:01:01.5+01:3").as_deref(),
            Some("2019-01-01 10:01:01.500000+01:30")
        );
        assert_eq!(
            format_timestamp("2019-01-01 10:01:01.5-02").as_deref(),
            Some("2019-01-01 10:01:01.500000-02:00")
        );
    }

    #[test]
    fn test_format_timestamp_truncates_long_fractions() {
        assert_eq!(
            format_timestamp("2019-01-01 10:01:01.123456789").as_deref(),
            Some("2019-01-01 10:01:01.123456+00:00")
        );
    }

    #[test]
    fn test_format_timestamp_zone_without_fraction() {
        assert_eq!(
            format_timestamp("2019-01-01 10:01:01+02:00").as_deref(),
            Some("2019-01-01 10:01:01.000000+02:00")
        );
    }

    #[test]
    fn test_format_timestamp_is_a_fixed_point() {
        let inputs = [
            "2024-01-02 03:04:05.1",
            "2024-01-02 03:04:05.123456-02:30",
            "2024-01-02 03:04:05",
        ];
        for input in inputs {
            let once = format_timestamp(input).unwrap();
            let twice = format_timestamp(&once).unwrap();
            assert_eq!(once, twice);
        }
    }

    #[test]
    fn test_format_timestamp_rejects_garbage() {
        assert_eq!(format_timestamp("not a date"), None);
        assert_eq!(format_timestamp("2024-13-02 03:04:05"), None);
        assert_eq!(format_timestamp(""), None);
    }

    #[test]
    fn test_append_readings_sql() {
        let payload = r#"{"readings":[
            {"asset_code":"A1","user_ts":"2024-01-02 03:04:05.1","reading":{"v":7}}]}"#;
        let sql = append_readings_sql(payload).unwrap().unwrap();
        assert_eq!(
            sql,
            "INSERT INTO foglamp.readings ( user_ts, asset_code, read_key, reading ) \
             VALUES ('2024-01-02 03:04:05.100000+00:00','A1', NULL, '{\"v\":7}');"
        );
    }

    #[test]
    fn test_append_readings_read_key_and_none_sentinel() {
        let payload = r#"{"readings":[
            {"asset_code":"a","user_ts":"2024-01-02 03:04:05","read_key":"k1","reading":{}},
            {"asset_code":"b","user_ts":"2024-01-02 03:04:06","read_key":"None","reading":{}}]}"#;
        let sql = append_readings_sql(payload).unwrap().unwrap();
        assert!(sql.contains("'k1'"));
        assert!(sql.contains("'b', NULL,"));
    }

    #[test]
    fn test_append_readings_function_timestamp_passes_through() {
        let payload = r#"{"readings":[
            {"asset_code":"a","user_ts":"now()","reading":{"v":1}}]}"#;
        let sql = append_readings_sql(payload).unwrap().unwrap();
        assert!(sql.contains("VALUES (now(),'a'"));
    }

    #[test]
    fn test_append_readings_skips_invalid_date_but_keeps_batch() {
        let payload = r#"{"readings":[
            {"asset_code":"bad","user_ts":"yesterday","reading":{}},
            {"asset_code":"good","user_ts":"2024-01-02 03:04:05","reading":{"v":1}}]}"#;
        let sql = append_readings_sql(payload).unwrap().unwrap();
        assert!(!sql.contains("bad"));
        assert!(sql.contains("good"));
    }

    #[test]
    fn test_append_readings_all_rows_invalid() {
        let payload = r#"{"readings":[{"asset_code":"a","user_ts":"junk","reading":{}}]}"#;
        assert!(append_readings_sql(payload).unwrap().is_none());
    }

    #[test]
    fn test_append_readings_missing_array() {
        let err = append_readings_sql(r#"{"rows":[]}"#).unwrap_err();
        assert_eq!(err.to_string(), "Payload is missing a readings array");
    }

    #[test]
    fn test_fetch_readings_sql() {
        assert_eq!(
            fetch_readings_sql(10, 100),
            "SELECT id, asset_code, read_key, reading, \
             user_ts AT TIME ZONE 'UTC' as \"user_ts\", \
             ts AT TIME ZONE 'UTC' as \"ts\" \
             FROM foglamp.readings WHERE id >= 10 ORDER BY id LIMIT 100;"
        );
    }

    #[test]
    fn test_purge_delete_respects_unsent_flag() {
        assert_eq!(
            purge_delete_sql(2, 0, 12),
            "DELETE FROM foglamp.readings WHERE user_ts < now() - INTERVAL '2 hours';"
        );
        assert_eq!(
            purge_delete_sql(2, 1, 12),
            "DELETE FROM foglamp.readings WHERE user_ts < now() - INTERVAL '2 hours' \
             AND id < 12;"
        );
    }

    #[test]
    fn test_purge_zero_age_formula_is_preserved() {
        assert_eq!(
            purge_oldest_age_sql(),
            "SELECT round(extract(epoch FROM (now() - min(user_ts)))/360) \
             from foglamp.readings;"
        );
    }
}
