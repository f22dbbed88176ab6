//! JSON query dialect compiled to SQL.
//!
//! Conditions arrive as JSON documents with `where`, `return`, `aggregate`,
//! `group`, `sort`, `timebucket`, `limit`, `skip` and `modifier` keys and are
//! compiled into SQL text against the fixed schema. The compiler is pure:
//! every builder takes the parsed payload and appends to a [`SqlBuffer`],
//! so the generated SQL is testable without a database connection.

use std::borrow::Cow;
use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

use super::sqlbuffer::SqlBuffer;

/// Schema prefix applied to every table reference.
pub const SCHEMA_PREFIX: &str = "foglamp.";

/// Timestamp rendering applied to readings columns.
pub const TS_FORMAT: &str = "YYYY-MM-DD HH24:MI:SS.US";

/// String values matching this pattern are passed through as SQL function
/// calls rather than quoted literals.
static FUNCTION_CALL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-zA-Z][a-zA-Z0-9_]*\(.*\)$").expect("valid regex"));

/// Error compiling a payload into SQL. `context` identifies the clause the
/// error was raised from, mirroring the operation tags of the error sink.
#[derive(Debug, thiserror::Error)]
pub enum PayloadError {
    #[error("Failed to parse JSON payload")]
    Parse { context: &'static str },
    #[error("{message}")]
    Schema {
        context: &'static str,
        message: String,
    },
}

impl PayloadError {
    pub fn context(&self) -> &'static str {
        match self {
            PayloadError::Parse { context } => context,
            PayloadError::Schema { context, .. } => context,
        }
    }

    fn schema(context: &'static str, message: impl Into<String>) -> Self {
        PayloadError::Schema {
            context,
            message: message.into(),
        }
    }
}

pub(crate) fn is_function_call(s: &str) -> bool {
    FUNCTION_CALL.is_match(s)
}

/// Double any single quotes so the value can sit inside a quoted literal.
pub(crate) fn escape(s: &str) -> Cow<'_, str> {
    if s.contains('\'') {
        Cow::Owned(s.replace('\'', "''"))
    } else {
        Cow::Borrowed(s)
    }
}

/// Build the SELECT statement for `retrieve` / `retrieve_readings`.
pub(crate) fn retrieve_sql(
    table: &str,
    condition: &str,
    is_readings: bool,
) -> Result<String, PayloadError> {
    let mut sql = SqlBuffer::new();
    let mut constraints = SqlBuffer::new();

    if condition.trim().is_empty() {
        if is_readings {
            sql.append("SELECT ");
            append_readings_tuple(&mut sql);
            sql.append(" FROM ");
            sql.append(SCHEMA_PREFIX);
        } else {
            sql.append("SELECT * FROM ");
            sql.append(SCHEMA_PREFIX);
        }
        sql.append(table);
        sql.append_char(';');
        return Ok(sql.coalesce());
    }

    let document: Value = serde_json::from_str(condition)
        .map_err(|_| PayloadError::Parse { context: "retrieve" })?;

    sql.append("SELECT ");
    if let Some(modifier) = document.get("modifier").and_then(Value::as_str) {
        sql.append(modifier);
        sql.append_char(' ');
    }
    if let Some(aggregate) = document.get("aggregate") {
        append_aggregates(&document, aggregate, &mut sql, &mut constraints, is_readings)?;
    } else if let Some(columns) = document.get("return") {
        append_return_columns(columns, &mut sql, &mut constraints, is_readings)?;
    } else if is_readings {
        append_readings_tuple(&mut sql);
    } else {
        sql.append_char('*');
    }
    sql.append(" FROM ");
    sql.append(SCHEMA_PREFIX);
    sql.append(table);

    if let Some(where_clause) = document.get("where") {
        sql.append(" WHERE ");
        append_where_clause(where_clause, &mut sql)?;
        if !constraints.is_empty() {
            sql.append(" AND ");
            sql.append(&constraints.coalesce());
        }
    }
    append_modifiers(&document, &mut sql)?;
    sql.append_char(';');
    Ok(sql.coalesce())
}

/// The canonical projection used when no selector names columns on the
/// readings table.
fn append_readings_tuple(sql: &mut SqlBuffer) {
    sql.append("id, asset_code, read_key, reading, to_char(user_ts, '");
    sql.append(TS_FORMAT);
    sql.append("') as user_ts, to_char(ts, '");
    sql.append(TS_FORMAT);
    sql.append("') as ts");
}

/// Build the INSERT statement for a flat row object.
pub(crate) fn insert_sql(table: &str, data: &str) -> Result<String, PayloadError> {
    let document: Value = serde_json::from_str(data)
        .map_err(|_| PayloadError::Parse { context: "insert" })?;
    let object = document
        .as_object()
        .ok_or_else(|| PayloadError::schema("insert", "Payload must be a JSON object"))?;

    let mut sql = SqlBuffer::new();
    let mut values = SqlBuffer::new();
    sql.append("INSERT INTO ");
    sql.append(SCHEMA_PREFIX);
    sql.append(table);
    sql.append(" (");
    for (col, (name, value)) in object.iter().enumerate() {
        if col > 0 {
            sql.append(", ");
            values.append(", ");
        }
        sql.append_char('"');
        sql.append(name);
        sql.append_char('"');
        append_literal(value, &mut values);
    }
    sql.append(") values (");
    sql.append(&values.coalesce());
    sql.append(");");
    Ok(sql.coalesce())
}

/// Render an insert/update literal: function-call strings pass through,
/// other strings are quoted with `'` doubled, numbers are bare, objects and
/// arrays become quoted JSON.
fn append_literal(value: &Value, sql: &mut SqlBuffer) {
    match value {
        Value::String(s) => {
            if is_function_call(s) {
                sql.append(s);
            } else {
                sql.append_char('\'');
                sql.append(&escape(s));
                sql.append_char('\'');
            }
        }
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                sql.append_i64(i);
            } else if let Some(u) = n.as_u64() {
                sql.append_u64(u);
            } else if let Some(f) = n.as_f64() {
                sql.append_f64(f);
            }
        }
        Value::Object(_) | Value::Array(_) => {
            sql.append_char('\'');
            sql.append(&escape(&value.to_string()));
            sql.append_char('\'');
        }
        Value::Bool(b) => sql.append(if *b { "true" } else { "false" }),
        Value::Null => sql.append("NULL"),
    }
}

/// Build the UPDATE statement batch. A payload without an `updates` array
/// is treated as a single update and wrapped.
pub(crate) fn update_sql(table: &str, payload: &str) -> Result<String, PayloadError> {
    let document: Value = serde_json::from_str(payload)
        .map_err(|_| PayloadError::Parse { context: "update" })?;
    let wrapped;
    let updates = match document.get("updates") {
        Some(u) => u,
        None => {
            wrapped = serde_json::json!([document]);
            &wrapped
        }
    };
    let updates = updates
        .as_array()
        .ok_or_else(|| PayloadError::schema("update", "Payload is missing the updates array"))?;

    let mut sql = SqlBuffer::new();
    for update in updates {
        let update = update.as_object().ok_or_else(|| {
            PayloadError::schema("update", "Each entry in the update array must be an object")
        })?;
        sql.append("UPDATE ");
        sql.append(SCHEMA_PREFIX);
        sql.append(table);
        sql.append(" SET ");

        let mut col = 0;
        if let Some(values) = update.get("values").and_then(Value::as_object) {
            for (name, value) in values {
                if col > 0 {
                    sql.append(", ");
                }
                sql.append_char('"');
                sql.append(name);
                sql.append("\" = ");
                append_literal(value, &mut sql);
                col += 1;
            }
        }
        if let Some(exprs) = update.get("expressions") {
            let exprs = exprs.as_array().ok_or_else(|| {
                PayloadError::schema("update", "The property exressions must be an array")
            })?;
            for expr in exprs {
                if col > 0 {
                    sql.append(", ");
                }
                let expr = expr.as_object().ok_or_else(|| {
                    PayloadError::schema("update", "expressions must be an array of objects")
                })?;
                let column = expr.get("column").and_then(Value::as_str).ok_or_else(|| {
                    PayloadError::schema(
                        "update",
                        "Missing column property in expressions array item",
                    )
                })?;
                let operator = expr.get("operator").and_then(Value::as_str).ok_or_else(|| {
                    PayloadError::schema(
                        "update",
                        "Missing operator property in expressions array item",
                    )
                })?;
                let value = expr.get("value").ok_or_else(|| {
                    PayloadError::schema(
                        "update",
                        "Missing value property in expressions array item",
                    )
                })?;
                sql.append_char('"');
                sql.append(column);
                sql.append("\" = \"");
                sql.append(column);
                sql.append("\" ");
                sql.append(operator);
                sql.append_char(' ');
                match value {
                    Value::String(s) => {
                        if is_function_call(s) {
                            sql.append(s);
                        } else {
                            sql.append_char('\'');
                            sql.append(s);
                            sql.append_char('\'');
                        }
                    }
                    other => append_literal(other, &mut sql),
                }
                col += 1;
            }
        }
        if let Some(props) = update.get("json_properties") {
            let props = props.as_array().ok_or_else(|| {
                PayloadError::schema("update", "The property json_properties must be an array")
            })?;
            for prop in props {
                if col > 0 {
                    sql.append(", ");
                }
                let prop = prop.as_object().ok_or_else(|| {
                    PayloadError::schema("update", "json_properties must be an array of objects")
                })?;
                let column = prop.get("column").and_then(Value::as_str).ok_or_else(|| {
                    PayloadError::schema(
                        "update",
                        "Missing column property in json_properties array item",
                    )
                })?;
                let path = prop.get("path").ok_or_else(|| {
                    PayloadError::schema(
                        "update",
                        "Missing path property in json_properties array item",
                    )
                })?;
                let value = prop.get("value").ok_or_else(|| {
                    PayloadError::schema(
                        "update",
                        "Missing value property in json_properties array item",
                    )
                })?;
                sql.append_char('"');
                sql.append(column);
                sql.append("\" = jsonb_set(");
                sql.append(column);
                sql.append(", '{");
                let path = path.as_array().ok_or_else(|| {
                    PayloadError::schema("update", "The property path must be an array")
                })?;
                for (i, element) in path.iter().enumerate() {
                    if i > 0 {
                        sql.append_char(',');
                    }
                    let element = element.as_str().ok_or_else(|| {
                        PayloadError::schema("update", "The elements of path must all be strings")
                    })?;
                    sql.append(element);
                }
                sql.append("}', ");
                match value {
                    Value::String(s) => {
                        if is_function_call(s) {
                            sql.append(s);
                        } else {
                            sql.append("'\"");
                            sql.append(&escape(s));
                            sql.append("\"'");
                        }
                    }
                    other => append_literal(other, &mut sql),
                }
                sql.append_char(')');
                col += 1;
            }
        }
        if col == 0 {
            return Err(PayloadError::schema(
                "update",
                "Missing values or expressions object in payload",
            ));
        }
        let condition = update.get("condition").or_else(|| update.get("where"));
        if let Some(condition) = condition {
            sql.append(" WHERE ");
            append_where_clause(condition, &mut sql)?;
        }
        sql.append_char(';');
    }
    Ok(sql.coalesce())
}

/// Build the DELETE statement. An empty condition deletes every row; a
/// non-empty condition must carry a `where` clause.
pub(crate) fn delete_sql(table: &str, condition: &str) -> Result<String, PayloadError> {
    let mut sql = SqlBuffer::new();
    sql.append("DELETE FROM ");
    sql.append(SCHEMA_PREFIX);
    sql.append(table);
    if !condition.trim().is_empty() {
        let document: Value = serde_json::from_str(condition)
            .map_err(|_| PayloadError::Parse { context: "delete" })?;
        let where_clause = document.get("where").ok_or_else(|| {
            PayloadError::schema("delete", "JSON does not contain where clause")
        })?;
        sql.append(" WHERE ");
        append_where_clause(where_clause, &mut sql)?;
    }
    sql.append_char(';');
    Ok(sql.coalesce())
}

/// Compile a recursive `where` node.
pub(crate) fn append_where_clause(
    where_clause: &Value,
    sql: &mut SqlBuffer,
) -> Result<(), PayloadError> {
    const CTX: &str = "where clause";
    let object = where_clause.as_object().ok_or_else(|| {
        PayloadError::schema(CTX, "The \"where\" property must be a JSON object")
    })?;
    let column = object.get("column").and_then(Value::as_str).ok_or_else(|| {
        PayloadError::schema(CTX, "The \"where\" object is missing a \"column\" property")
    })?;
    let condition = object.get("condition").and_then(Value::as_str).ok_or_else(|| {
        PayloadError::schema(CTX, "The \"where\" object is missing a \"condition\" property")
    })?;
    let value = object.get("value").ok_or_else(|| {
        PayloadError::schema(CTX, "The \"where\" object is missing a \"value\" property")
    })?;

    // A column that parses as a numeric literal is emitted unquoted,
    // enabling WHERE 1 = 1
    if column.parse::<f64>().is_ok() {
        sql.append(column);
    } else {
        sql.append_char('"');
        sql.append(column);
        sql.append_char('"');
    }
    sql.append_char(' ');

    match condition {
        "older" => {
            let seconds = value.as_i64().ok_or_else(|| {
                PayloadError::schema(
                    CTX,
                    "The \"value\" of an \"older\" condition must be an integer",
                )
            })?;
            sql.append("< now() - INTERVAL '");
            sql.append_i64(seconds);
            sql.append(" seconds'");
        }
        "newer" => {
            let seconds = value.as_i64().ok_or_else(|| {
                PayloadError::schema(
                    CTX,
                    "The \"value\" of an \"newer\" condition must be an integer",
                )
            })?;
            sql.append("> now() - INTERVAL '");
            sql.append_i64(seconds);
            sql.append(" seconds'");
        }
        "in" | "not in" => {
            let items = value.as_array().filter(|a| !a.is_empty()).ok_or_else(|| {
                PayloadError::schema(
                    CTX,
                    format!(
                        "The \"value\" of a \"{}\" condition must be an array and must not be empty.",
                        condition
                    ),
                )
            })?;
            sql.append(condition);
            sql.append(" ( ");
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    sql.append(", ");
                }
                match item {
                    Value::Number(n) => {
                        if let Some(v) = n.as_i64() {
                            sql.append_i64(v);
                        } else if let Some(v) = n.as_f64() {
                            sql.append_f64(v);
                        }
                    }
                    Value::String(s) => {
                        sql.append_char('\'');
                        sql.append(&escape(s));
                        sql.append_char('\'');
                    }
                    _ => {
                        return Err(PayloadError::schema(
                            CTX,
                            format!(
                                "The \"value\" of a \"{}\" condition array element must be a string, integer or double.",
                                condition
                            ),
                        ));
                    }
                }
            }
            sql.append(" )");
        }
        _ => {
            sql.append(condition);
            sql.append_char(' ');
            match value {
                Value::Number(n) => {
                    if let Some(v) = n.as_i64() {
                        sql.append_i64(v);
                    } else if let Some(v) = n.as_f64() {
                        sql.append_f64(v);
                    }
                }
                Value::String(s) => {
                    sql.append_char('\'');
                    sql.append(&escape(s));
                    sql.append_char('\'');
                }
                _ => {}
            }
        }
    }

    if let Some(and) = object.get("and") {
        sql.append(" AND ");
        append_where_clause(and, sql)?;
    }
    if let Some(or) = object.get("or") {
        sql.append(" OR ");
        append_where_clause(or, sql)?;
    }
    Ok(())
}

/// Compile the `return` column list.
fn append_return_columns(
    columns: &Value,
    sql: &mut SqlBuffer,
    constraints: &mut SqlBuffer,
    is_readings: bool,
) -> Result<(), PayloadError> {
    const CTX: &str = "retrieve";
    let columns = columns.as_array().ok_or_else(|| {
        PayloadError::schema(CTX, "The property return must be an array")
    })?;
    for (col, item) in columns.iter().enumerate() {
        if col > 0 {
            sql.append(", ");
        }
        match item {
            Value::String(name) => {
                // Bare readings timestamps keep the canonical rendering
                if is_readings && (name == "user_ts" || name == "ts") {
                    append_to_char(name, TS_FORMAT, sql);
                    sql.append(" as ");
                    sql.append(name);
                } else {
                    sql.append_char('"');
                    sql.append(name);
                    sql.append_char('"');
                }
            }
            Value::Object(object) => {
                if let Some(column) = object.get("column") {
                    let column = column.as_str().ok_or_else(|| {
                        PayloadError::schema(CTX, "column must be a string")
                    })?;
                    if let Some(format) = object.get("format") {
                        let format = format.as_str().ok_or_else(|| {
                            PayloadError::schema(CTX, "format must be a string")
                        })?;
                        sql.append("to_char(\"");
                        sql.append(column);
                        sql.append("\", '");
                        sql.append(format);
                        sql.append("')");
                    } else if let Some(timezone) = object.get("timezone") {
                        let timezone = timezone.as_str().ok_or_else(|| {
                            PayloadError::schema(CTX, "timezone must be a string")
                        })?;
                        sql.append_char('"');
                        sql.append(column);
                        sql.append("\" AT TIME ZONE '");
                        sql.append(timezone);
                        sql.append_char('\'');
                    } else if is_readings && (column == "user_ts" || column == "ts") {
                        append_to_char(column, TS_FORMAT, sql);
                        if !object.contains_key("alias") {
                            sql.append(" AS \"");
                            sql.append(column);
                            sql.append_char('"');
                        }
                    } else {
                        sql.append_char('"');
                        sql.append(column);
                        sql.append_char('"');
                    }
                } else if let Some(json) = object.get("json") {
                    append_return_json(json, sql, constraints)?;
                } else {
                    return Err(PayloadError::schema(
                        CTX,
                        "return object must have either a column or json property",
                    ));
                }
                if let Some(alias) = object.get("alias").and_then(Value::as_str) {
                    sql.append(" AS \"");
                    sql.append(alias);
                    sql.append_char('"');
                }
            }
            _ => {
                return Err(PayloadError::schema(
                    CTX,
                    "return object must have either a column or json property",
                ));
            }
        }
    }
    Ok(())
}

fn append_to_char(column: &str, format: &str, sql: &mut SqlBuffer) {
    sql.append("to_char(");
    sql.append(column);
    sql.append(", '");
    sql.append(format);
    sql.append("')");
}

/// Compile a `{json: {column, properties}}` projection for the `return`
/// list, adding the `?` existence constraint for the final key.
fn append_return_json(
    json: &Value,
    sql: &mut SqlBuffer,
    constraints: &mut SqlBuffer,
) -> Result<(), PayloadError> {
    const CTX: &str = "retrieve";
    let object = json.as_object().ok_or_else(|| {
        PayloadError::schema(CTX, "The json property must be an object")
    })?;
    let column = object.get("column").and_then(Value::as_str).ok_or_else(|| {
        PayloadError::schema(CTX, "The json property is missing a column property")
    })?;
    let properties = object.get("properties").ok_or_else(|| {
        PayloadError::schema(CTX, "The json property is missing a properties property")
    })?;
    sql.append(column);
    sql.append("->");
    if !constraints.is_empty() {
        constraints.append(" AND ");
    }
    constraints.append(column);
    match properties {
        Value::Array(fields) => {
            let mut prev: Option<&str> = None;
            for (i, field) in fields.iter().enumerate() {
                let field = field.as_str().ok_or_else(|| {
                    PayloadError::schema(CTX, "The elements of properties must all be strings")
                })?;
                if i > 0 {
                    sql.append("->");
                }
                if let Some(p) = prev {
                    constraints.append("->'");
                    constraints.append(p);
                    constraints.append_char('\'');
                }
                sql.append_char('\'');
                sql.append(field);
                sql.append_char('\'');
                prev = Some(field);
            }
            constraints.append(" ? '");
            constraints.append(prev.unwrap_or_default());
            constraints.append_char('\'');
        }
        Value::String(field) => {
            sql.append_char('\'');
            sql.append(field);
            sql.append_char('\'');
            constraints.append(" ? '");
            constraints.append(field);
            constraints.append_char('\'');
        }
        _ => {
            return Err(PayloadError::schema(
                CTX,
                "The json property is missing a properties property",
            ));
        }
    }
    Ok(())
}

/// Compile the `aggregate` selector (object or array form), plus the
/// projections induced by `group` and `timebucket`.
fn append_aggregates(
    payload: &Value,
    aggregates: &Value,
    sql: &mut SqlBuffer,
    constraints: &mut SqlBuffer,
    is_readings: bool,
) -> Result<(), PayloadError> {
    const CTX: &str = "Select aggregation";
    match aggregates {
        Value::Object(object) => {
            let operation = object.get("operation").and_then(Value::as_str).ok_or_else(
                || PayloadError::schema(CTX, "Missing property \"operation\""),
            )?;
            if !object.contains_key("column") && !object.contains_key("json") {
                return Err(PayloadError::schema(
                    CTX,
                    "Missing property \"column\" or \"json\"",
                ));
            }
            sql.append(operation);
            sql.append_char('(');
            let mut json_column = None;
            if let Some(column) = object.get("column").and_then(Value::as_str) {
                if operation != "count" {
                    if is_readings && column == "user_ts" {
                        append_to_char("user_ts", TS_FORMAT, sql);
                    } else {
                        sql.append_char('"');
                        sql.append(column);
                        sql.append_char('"');
                    }
                } else {
                    // count() takes the column bare, allowing *
                    sql.append(column);
                }
            } else if let Some(json) = object.get("json") {
                json_column = Some(append_aggregate_json(json, sql, constraints, true)?);
            }
            sql.append(") AS \"");
            if let Some(alias) = object.get("alias").and_then(Value::as_str) {
                sql.append(alias);
            } else {
                sql.append(operation);
                sql.append_char('_');
                if let Some(column) = object.get("column").and_then(Value::as_str) {
                    sql.append(column);
                } else if let Some(column) = json_column {
                    sql.append(&column);
                }
            }
            sql.append_char('"');
        }
        Value::Array(items) => {
            for (index, item) in items.iter().enumerate() {
                let object = item.as_object().ok_or_else(|| {
                    PayloadError::schema(
                        CTX,
                        "Each element in the aggregate array must be an object",
                    )
                })?;
                if !object.contains_key("column") && !object.contains_key("json") {
                    return Err(PayloadError::schema(CTX, "Missing property \"column\""));
                }
                let operation = object.get("operation").and_then(Value::as_str).ok_or_else(
                    || PayloadError::schema(CTX, "Missing property \"operation\""),
                )?;
                if index > 0 {
                    sql.append(", ");
                }
                sql.append(operation);
                sql.append_char('(');
                let mut json_column = None;
                if let Some(column) = object.get("column").and_then(Value::as_str) {
                    if is_readings && column == "user_ts" {
                        append_to_char("user_ts", TS_FORMAT, sql);
                    } else {
                        sql.append_char('"');
                        sql.append(column);
                        sql.append_char('"');
                    }
                } else if let Some(json) = object.get("json") {
                    json_column = Some(append_aggregate_json(json, sql, constraints, false)?);
                }
                sql.append(") AS \"");
                if let Some(alias) = object.get("alias").and_then(Value::as_str) {
                    sql.append(alias);
                } else {
                    sql.append(operation);
                    sql.append_char('_');
                    if let Some(column) = object.get("column").and_then(Value::as_str) {
                        sql.append(column);
                    } else if let Some(column) = json_column {
                        sql.append(&column);
                    }
                }
                sql.append_char('"');
            }
        }
        _ => {
            return Err(PayloadError::schema(
                CTX,
                "Missing property \"operation\"",
            ));
        }
    }

    if let Some(group) = payload.get("group") {
        sql.append(", ");
        match group {
            Value::Object(grp) => {
                let column = grp.get("column").and_then(Value::as_str).unwrap_or_default();
                if let Some(format) = grp.get("format").and_then(Value::as_str) {
                    sql.append("to_char(\"");
                    sql.append(column);
                    sql.append("\", '");
                    sql.append(format);
                    sql.append("')");
                } else {
                    sql.append_char('"');
                    sql.append(column);
                    sql.append_char('"');
                }
                sql.append(" AS \"");
                sql.append(
                    grp.get("alias")
                        .and_then(Value::as_str)
                        .unwrap_or(column),
                );
                sql.append_char('"');
            }
            Value::String(column) => {
                sql.append_char('"');
                sql.append(column);
                sql.append_char('"');
            }
            _ => {}
        }
    }

    if let Some(tb) = payload.get("timebucket") {
        let tb = tb.as_object().ok_or_else(|| {
            PayloadError::schema(
                "Select data",
                "The \"timebucket\" property must be an object",
            )
        })?;
        let timestamp = tb.get("timestamp").and_then(Value::as_str).ok_or_else(|| {
            PayloadError::schema(
                "Select data",
                "The \"timebucket\" object must have a timestamp property",
            )
        })?;
        let has_format = tb.contains_key("format");
        if has_format {
            sql.append(", to_char(to_timestamp(");
        } else {
            sql.append(", to_timestamp(");
        }
        if let Some(size) = tb.get("size") {
            append_size(size, sql);
            sql.append(" * ");
        }
        sql.append("floor(extract(epoch from ");
        sql.append(timestamp);
        sql.append(") / ");
        match tb.get("size") {
            Some(size) => append_size(size, sql),
            None => sql.append_char('1'),
        }
        sql.append("))");
        if let Some(format) = tb.get("format").and_then(Value::as_str) {
            sql.append(", '");
            sql.append(format);
            sql.append("')");
        }
        sql.append(" AS \"");
        sql.append(tb.get("alias").and_then(Value::as_str).unwrap_or("timestamp"));
        sql.append_char('"');
    }
    Ok(())
}

/// Timebucket sizes arrive as either strings or numbers.
fn append_size(size: &Value, sql: &mut SqlBuffer) {
    match size {
        Value::String(s) => sql.append(s),
        Value::Number(n) => {
            if let Some(v) = n.as_i64() {
                sql.append_i64(v);
            } else if let Some(v) = n.as_f64() {
                sql.append_f64(v);
            }
        }
        _ => sql.append_char('1'),
    }
}

/// JSON-path projection inside an aggregate, cast to float. The `return`
/// form keeps `->` between keys; the aggregate form uses `->>` so the final
/// value is text, castable to float. Returns the column name for default
/// alias synthesis.
fn append_aggregate_json(
    json: &Value,
    sql: &mut SqlBuffer,
    constraints: &mut SqlBuffer,
    arrow_first: bool,
) -> Result<String, PayloadError> {
    const CTX: &str = "Select aggregation";
    let object = json.as_object().ok_or_else(|| {
        PayloadError::schema(CTX, "The json property must be an object")
    })?;
    let column = object.get("column").and_then(Value::as_str).ok_or_else(|| {
        PayloadError::schema(CTX, "The json property is missing a column property")
    })?;
    let properties = object.get("properties").ok_or_else(|| {
        PayloadError::schema(CTX, "The json property is missing a properties property")
    })?;
    sql.append("(\"");
    sql.append(column);
    sql.append_char('"');
    if !constraints.is_empty() {
        constraints.append(" AND ");
    }
    constraints.append(column);
    match properties {
        Value::Array(fields) => {
            let mut prev: Option<&str> = None;
            for (i, field) in fields.iter().enumerate() {
                let field = field.as_str().ok_or_else(|| {
                    PayloadError::schema(CTX, "The elements of properties must all be strings")
                })?;
                if i == 0 && arrow_first {
                    sql.append("->");
                } else {
                    sql.append("->>");
                }
                if let Some(p) = prev {
                    constraints.append("->>'");
                    constraints.append(p);
                    constraints.append_char('\'');
                }
                sql.append_char('\'');
                sql.append(field);
                sql.append_char('\'');
                prev = Some(field);
            }
            constraints.append(" ? '");
            constraints.append(prev.unwrap_or_default());
            constraints.append_char('\'');
        }
        Value::String(field) => {
            if arrow_first {
                sql.append("->");
            } else {
                sql.append("->>");
            }
            sql.append_char('\'');
            sql.append(field);
            sql.append_char('\'');
            constraints.append(" ? '");
            constraints.append(field);
            constraints.append_char('\'');
        }
        _ => {
            return Err(PayloadError::schema(
                CTX,
                "The json property is missing a properties property",
            ));
        }
    }
    sql.append(")::float");
    Ok(column.to_string())
}

/// Compile the trailing modifiers: GROUP BY, ORDER BY, timebucket grouping,
/// OFFSET and LIMIT.
fn append_modifiers(payload: &Value, sql: &mut SqlBuffer) -> Result<(), PayloadError> {
    if payload.get("timebucket").is_some() && payload.get("sort").is_some() {
        return Err(PayloadError::schema(
            "query modifiers",
            "Sort and timebucket modifiers can not be used in the same payload",
        ));
    }

    if let Some(group) = payload.get("group") {
        sql.append(" GROUP BY ");
        match group {
            Value::Object(grp) => {
                let column = grp.get("column").and_then(Value::as_str).unwrap_or_default();
                if let Some(format) = grp.get("format").and_then(Value::as_str) {
                    sql.append("to_char(\"");
                    sql.append(column);
                    sql.append("\", '");
                    sql.append(format);
                    sql.append("')");
                } else {
                    sql.append_char('"');
                    sql.append(column);
                    sql.append_char('"');
                }
            }
            Value::String(column) => {
                sql.append_char('"');
                sql.append(column);
                sql.append_char('"');
            }
            _ => {}
        }
    }

    if let Some(sort) = payload.get("sort") {
        sql.append(" ORDER BY ");
        match sort {
            Value::Object(_) => append_sort_entry(sort, sql)?,
            Value::Array(items) => {
                for (i, item) in items.iter().enumerate() {
                    if !item.is_object() {
                        return Err(PayloadError::schema(
                            "select sort",
                            "Each element in the sort array must be an object",
                        ));
                    }
                    if i > 0 {
                        sql.append(", ");
                    }
                    append_sort_entry(item, sql)?;
                }
            }
            _ => {
                return Err(PayloadError::schema(
                    "Select sort",
                    "Missing property \"column\"",
                ));
            }
        }
    }

    if let Some(tb) = payload.get("timebucket") {
        let tb = tb.as_object().ok_or_else(|| {
            PayloadError::schema(
                "Select data",
                "The \"timebucket\" property must be an object",
            )
        })?;
        let timestamp = tb.get("timestamp").and_then(Value::as_str).ok_or_else(|| {
            PayloadError::schema(
                "Select data",
                "The \"timebucket\" object must have a timestamp property",
            )
        })?;
        if payload.get("group").is_some() {
            sql.append(", ");
        } else {
            sql.append(" GROUP BY ");
        }
        append_epoch_floor(timestamp, tb.get("size"), sql);
        sql.append(" ORDER BY ");
        append_epoch_floor(timestamp, tb.get("size"), sql);
        sql.append(" DESC");
    }

    if let Some(skip) = payload.get("skip") {
        let skip = skip.as_i64().ok_or_else(|| {
            PayloadError::schema("skip", "Skip must be specfied as an integer")
        })?;
        sql.append(" OFFSET ");
        sql.append_i64(skip);
    }

    if let Some(limit) = payload.get("limit") {
        let limit = limit.as_i64().ok_or_else(|| {
            PayloadError::schema("limit", "Limit must be specfied as an integer")
        })?;
        sql.append(" LIMIT ");
        sql.append_i64(limit);
    }
    Ok(())
}

fn append_sort_entry(sort: &Value, sql: &mut SqlBuffer) -> Result<(), PayloadError> {
    let column = sort.get("column").and_then(Value::as_str).ok_or_else(|| {
        PayloadError::schema("Select sort", "Missing property \"column\"")
    })?;
    sql.append_char('"');
    sql.append(column);
    sql.append("\" ");
    sql.append(sort.get("direction").and_then(Value::as_str).unwrap_or("ASC"));
    Ok(())
}

fn append_epoch_floor(timestamp: &str, size: Option<&Value>, sql: &mut SqlBuffer) {
    sql.append("floor(extract(epoch from ");
    sql.append(timestamp);
    sql.append(") / ");
    match size {
        Some(size) => append_size(size, sql),
        None => sql.append_char('1'),
    }
    sql.append_char(')');
}
