//! Entity applier: writes a single event into the opaque domain tables.
//!
//! Schema-tolerant by design (§9 payload polymorphism) — columns are discovered
//! live via `PRAGMA table_info` rather than a static column registry, so the
//! applier never needs to know the full domain schema, only the two
//! conventions from §3 (`id` primary key, optional `deleted_at`).

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use log::debug;
use rusqlite::{params, params_from_iter, types::Value as SqlValue, Transaction};
use serde_json::{Map, Value};

use crate::envelope::ActionType;
use crate::error::EventError;
use crate::registry::{
    coerces_null_to_empty, is_csv_array_column, CASCADE_DEPENDENT_FK_COLUMN,
    CASCADE_DEPENDENT_TABLE, CASCADE_PARENT_ENTITY_TYPE,
};

/// A single event ready to apply, already normalized by the outbox/inbox layer.
pub struct ApplyEvent<'a> {
    pub action_type: ActionType,
    pub entity_type: &'a str,
    pub entity_id: &'a str,
    pub new_data: &'a Map<String, Value>,
    pub previous_data: Option<&'a Map<String, Value>>,
    pub client_timestamp: DateTime<Utc>,
}

/// Whether an existing row was overwritten, and its prior state if so.
#[derive(Debug, Clone, Default)]
pub struct ApplyOutcome {
    pub overwritten: bool,
    pub local_data: Option<Value>,
}

/// Host-supplied predicate for the allowed entity-type set (§6, collaborator interfaces).
pub type Validator<'a> = &'a dyn Fn(&str) -> bool;

pub fn apply_event(
    tx: &Transaction<'_>,
    event: &ApplyEvent<'_>,
    validator: Validator,
) -> Result<ApplyOutcome, EventError> {
    if !validator(event.entity_type) {
        return Err(EventError::new(format!("unknown entity type: {}", event.entity_type)));
    }
    if event.entity_id.is_empty() {
        return Err(EventError::new("empty entity_id"));
    }

    match event.action_type {
        ActionType::Create => apply_create(tx, event),
        ActionType::Update => apply_update(tx, event),
        ActionType::Delete => apply_delete(tx, event),
        ActionType::SoftDelete => apply_soft_delete(tx, event),
        ActionType::Restore => apply_restore(tx, event),
    }
}

fn sql_err(e: rusqlite::Error) -> EventError {
    EventError::new(format!("sqlite: {e}"))
}

fn apply_create(tx: &Transaction<'_>, event: &ApplyEvent<'_>) -> Result<ApplyOutcome, EventError> {
    if event.new_data.is_empty() {
        return Err(EventError::new("new_data must be a non-empty object"));
    }

    if event.entity_type == "issue_dependencies" {
        let proceed =
            resolve_dependency_cycle(tx, event.entity_id, event.new_data).map_err(sql_err)?;
        if !proceed {
            return Ok(ApplyOutcome::default());
        }
    }

    let table = event.entity_type;
    let existing = fetch_row(tx, table, event.entity_id).map_err(sql_err)?;
    let table_cols = table_columns(tx, table).map_err(sql_err)?;
    let known = filter_known_columns(table, &table_cols, event.new_data);

    if known.is_empty() {
        return Err(EventError::new("no known columns remain after dropping unknown columns"));
    }

    upsert_row(tx, table, event.entity_id, &known).map_err(sql_err)?;

    Ok(ApplyOutcome { overwritten: existing.is_some(), local_data: existing.map(Value::Object) })
}

fn apply_update(tx: &Transaction<'_>, event: &ApplyEvent<'_>) -> Result<ApplyOutcome, EventError> {
    if let Some(previous) = event.previous_data {
        if !previous.is_empty() {
            let changes = diff_fields(previous, event.new_data);
            if !changes.is_empty() {
                let table = event.entity_type;
                let existing = fetch_row(tx, table, event.entity_id).map_err(sql_err)?;
                if existing.is_none() {
                    return Ok(ApplyOutcome::default());
                }
                let table_cols = table_columns(tx, table).map_err(sql_err)?;
                let applied =
                    partial_update(tx, table, event.entity_id, &changes, &table_cols, table)
                        .map_err(sql_err)?;
                if applied {
                    return Ok(ApplyOutcome {
                        overwritten: true,
                        local_data: existing.map(Value::Object),
                    });
                }
                // Partial update matched no rows or touched no known columns; fall through.
            }
        }
    }
    apply_upsert_if_exists(tx, event)
}

fn apply_upsert_if_exists(
    tx: &Transaction<'_>,
    event: &ApplyEvent<'_>,
) -> Result<ApplyOutcome, EventError> {
    let table = event.entity_type;
    let existing = fetch_row(tx, table, event.entity_id).map_err(sql_err)?;
    if existing.is_none() {
        // update never resurrects a hard-deleted (or never-created) row.
        return Ok(ApplyOutcome::default());
    }
    if event.new_data.is_empty() {
        return Err(EventError::new("new_data must be a non-empty object"));
    }
    let table_cols = table_columns(tx, table).map_err(sql_err)?;
    let known = filter_known_columns(table, &table_cols, event.new_data);
    if known.is_empty() {
        return Err(EventError::new("no known columns remain after dropping unknown columns"));
    }
    upsert_row(tx, table, event.entity_id, &known).map_err(sql_err)?;
    Ok(ApplyOutcome { overwritten: true, local_data: existing.map(Value::Object) })
}

fn apply_delete(tx: &Transaction<'_>, event: &ApplyEvent<'_>) -> Result<ApplyOutcome, EventError> {
    let table = event.entity_type;
    if table == CASCADE_PARENT_ENTITY_TYPE {
        let now = Utc::now().to_rfc3339();
        // Cascades are not enforced by the store; soft-delete dependents first.
        let _ = tx
            .execute(
                &format!(
                    "UPDATE {CASCADE_DEPENDENT_TABLE} SET deleted_at = ?1 WHERE {CASCADE_DEPENDENT_FK_COLUMN} = ?2"
                ),
                params![now, event.entity_id],
            )
            .map_err(sql_err)?;
    }

    let existing = fetch_row(tx, table, event.entity_id).map_err(sql_err)?;
    tx.execute(&format!("DELETE FROM {table} WHERE id = ?1"), params![event.entity_id])
        .map_err(sql_err)?;

    Ok(ApplyOutcome { overwritten: existing.is_some(), local_data: existing.map(Value::Object) })
}

fn apply_soft_delete(
    tx: &Transaction<'_>,
    event: &ApplyEvent<'_>,
) -> Result<ApplyOutcome, EventError> {
    let table = event.entity_type;
    let table_cols = table_columns(tx, table).map_err(sql_err)?;
    if !table_cols.contains("deleted_at") {
        return Err(EventError::new(format!("{table} has no deleted_at column")));
    }
    let existing = fetch_row(tx, table, event.entity_id).map_err(sql_err)?;
    let ts = event.client_timestamp.to_rfc3339();
    let affected = tx
        .execute(
            &format!("UPDATE {table} SET deleted_at = ?1 WHERE id = ?2"),
            params![ts, event.entity_id],
        )
        .map_err(sql_err)?;

    Ok(ApplyOutcome {
        overwritten: existing.is_some() && affected > 0,
        local_data: existing.map(Value::Object),
    })
}

fn apply_restore(tx: &Transaction<'_>, event: &ApplyEvent<'_>) -> Result<ApplyOutcome, EventError> {
    let table = event.entity_type;
    let table_cols = table_columns(tx, table).map_err(sql_err)?;
    let existing = fetch_row(tx, table, event.entity_id).map_err(sql_err)?;
    let ts = event.client_timestamp.to_rfc3339();

    let affected = if table_cols.contains("updated_at") {
        tx.execute(
            &format!("UPDATE {table} SET deleted_at = NULL, updated_at = ?1 WHERE id = ?2"),
            params![ts, event.entity_id],
        )
        .map_err(sql_err)?
    } else {
        tx.execute(
            &format!("UPDATE {table} SET deleted_at = NULL WHERE id = ?1"),
            params![event.entity_id],
        )
        .map_err(sql_err)?
    };

    Ok(ApplyOutcome {
        overwritten: existing.is_some() && affected > 0,
        local_data: existing.map(Value::Object),
    })
}

/// DFS cycle check for `issue_dependencies` (§4.1, §9). Returns whether the
/// caller should proceed with the write (`true`) or the event was already
/// fully handled by deleting the losing reverse edge or being skipped (`false`).
fn resolve_dependency_cycle(
    tx: &Transaction<'_>,
    entity_id: &str,
    new_data: &Map<String, Value>,
) -> rusqlite::Result<bool> {
    let issue_id = match new_data.get("issue_id").and_then(Value::as_str) {
        Some(s) => s.to_string(),
        None => return Ok(true),
    };
    let depends_on_id = match new_data.get("depends_on_id").and_then(Value::as_str) {
        Some(s) => s.to_string(),
        None => return Ok(true),
    };

    if !would_create_cycle(tx, &issue_id, &depends_on_id)? {
        return Ok(true);
    }

    let reverse_id: Option<String> = tx
        .query_row(
            "SELECT id FROM issue_dependencies WHERE issue_id = ?1 AND depends_on_id = ?2",
            params![depends_on_id, issue_id],
            |r| r.get(0),
        )
        .ok();

    let Some(reverse_id) = reverse_id else {
        // Longer cycle with no direct reverse edge to remove; nothing to resolve
        // against, so let the write through (see DESIGN.md open question).
        return Ok(true);
    };

    let incoming_key = format!("{issue_id}|{depends_on_id}");
    let reverse_key = format!("{depends_on_id}|{issue_id}");

    if incoming_key < reverse_key {
        tx.execute("DELETE FROM issue_dependencies WHERE id = ?1", params![reverse_id])?;
        Ok(true)
    } else {
        debug!("dependency edge {entity_id} lost cycle tiebreak against {reverse_id}");
        Ok(false)
    }
}

fn would_create_cycle(
    tx: &Transaction<'_>,
    issue_id: &str,
    depends_on_id: &str,
) -> rusqlite::Result<bool> {
    let mut visited: HashSet<String> = HashSet::new();
    let mut stack = vec![depends_on_id.to_string()];
    while let Some(current) = stack.pop() {
        if current == issue_id {
            return Ok(true);
        }
        if !visited.insert(current.clone()) {
            continue;
        }
        let mut stmt =
            tx.prepare_cached("SELECT depends_on_id FROM issue_dependencies WHERE issue_id = ?1")?;
        let next_ids = stmt.query_map(params![current], |r| r.get::<_, String>(0))?;
        for next in next_ids {
            stack.push(next?);
        }
    }
    Ok(false)
}

fn is_valid_column_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

pub(crate) fn table_columns(tx: &Transaction<'_>, table: &str) -> rusqlite::Result<HashSet<String>> {
    let mut stmt = tx.prepare_cached(&format!("PRAGMA table_info({table})"))?;
    let rows = stmt.query_map([], |r| r.get::<_, String>(1))?;
    let mut cols = HashSet::new();
    for col in rows {
        cols.insert(col?);
    }
    Ok(cols)
}

fn filter_known_columns(
    entity_type: &str,
    table_cols: &HashSet<String>,
    data: &Map<String, Value>,
) -> Map<String, Value> {
    let mut known = Map::new();
    for (col, val) in data {
        if col == "id" {
            continue;
        }
        if !table_cols.contains(col) {
            debug!("dropping unknown column {entity_type}.{col}");
            continue;
        }
        known.insert(col.clone(), val.clone());
    }
    known
}

pub(crate) fn fetch_row(
    tx: &Transaction<'_>,
    table: &str,
    id: &str,
) -> rusqlite::Result<Option<Map<String, Value>>> {
    let mut stmt = tx.prepare_cached(&format!("SELECT * FROM {table} WHERE id = ?1"))?;
    let col_names: Vec<String> = stmt.column_names().iter().map(|s| s.to_string()).collect();
    let mut rows = stmt.query(params![id])?;
    if let Some(row) = rows.next()? {
        let mut map = Map::new();
        for (i, name) in col_names.iter().enumerate() {
            let v: SqlValue = row.get(i)?;
            map.insert(name.clone(), sql_value_to_json(v));
        }
        Ok(Some(map))
    } else {
        Ok(None)
    }
}

fn sql_value_to_json(v: SqlValue) -> Value {
    match v {
        SqlValue::Null => Value::Null,
        SqlValue::Integer(i) => Value::Number(i.into()),
        SqlValue::Real(f) => {
            serde_json::Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null)
        }
        SqlValue::Text(s) => Value::String(s),
        SqlValue::Blob(b) => Value::String(String::from_utf8_lossy(&b).into_owned()),
    }
}

fn normalize_value(entity_type: &str, column: &str, value: &Value) -> rusqlite::Result<SqlValue> {
    Ok(match value {
        Value::Null => {
            if coerces_null_to_empty(entity_type, column) {
                SqlValue::Text(String::new())
            } else {
                SqlValue::Null
            }
        }
        Value::Bool(b) => SqlValue::Integer(if *b { 1 } else { 0 }),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                SqlValue::Integer(i)
            } else if let Some(f) = n.as_f64() {
                SqlValue::Real(f)
            } else {
                SqlValue::Text(n.to_string())
            }
        }
        Value::String(s) => SqlValue::Text(s.clone()),
        Value::Array(items) => {
            if is_csv_array_column(entity_type, column) {
                let joined: Vec<String> = items
                    .iter()
                    .map(|v| match v {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    })
                    .collect();
                SqlValue::Text(joined.join(","))
            } else {
                SqlValue::Text(serde_json::to_string(value).unwrap_or_default())
            }
        }
        Value::Object(_) => SqlValue::Text(serde_json::to_string(value).unwrap_or_default()),
    })
}

fn upsert_row(
    tx: &Transaction<'_>,
    table: &str,
    id: &str,
    known: &Map<String, Value>,
) -> rusqlite::Result<()> {
    let mut columns = vec!["id".to_string()];
    let mut placeholders = vec!["?1".to_string()];
    let mut values = vec![SqlValue::Text(id.to_string())];

    for (col, val) in known {
        if !is_valid_column_name(col) {
            continue;
        }
        values.push(normalize_value(table, col, val)?);
        placeholders.push(format!("?{}", values.len()));
        columns.push(col.clone());
    }

    let update_clause = columns
        .iter()
        .skip(1)
        .map(|c| format!("{c} = excluded.{c}"))
        .collect::<Vec<_>>()
        .join(", ");

    let sql = if update_clause.is_empty() {
        format!(
            "INSERT INTO {table} ({}) VALUES ({}) ON CONFLICT(id) DO NOTHING",
            columns.join(", "),
            placeholders.join(", ")
        )
    } else {
        format!(
            "INSERT INTO {table} ({}) VALUES ({}) ON CONFLICT(id) DO UPDATE SET {update_clause}",
            columns.join(", "),
            placeholders.join(", ")
        )
    };

    tx.execute(&sql, params_from_iter(values))?;
    Ok(())
}

fn partial_update(
    tx: &Transaction<'_>,
    table: &str,
    id: &str,
    changes: &Map<String, Value>,
    table_cols: &HashSet<String>,
    entity_type: &str,
) -> rusqlite::Result<bool> {
    let mut set_clauses = Vec::new();
    let mut values = Vec::new();

    for (col, val) in changes {
        if col == "id" || !is_valid_column_name(col) {
            continue;
        }
        if !table_cols.contains(col) {
            debug!("dropping unknown column {entity_type}.{col}");
            continue;
        }
        values.push(normalize_value(entity_type, col, val)?);
        set_clauses.push(format!("{col} = ?{}", values.len()));
    }

    if set_clauses.is_empty() {
        return Ok(false);
    }

    values.push(SqlValue::Text(id.to_string()));
    let sql = format!(
        "UPDATE {table} SET {} WHERE id = ?{}",
        set_clauses.join(", "),
        values.len()
    );
    let affected = tx.execute(&sql, params_from_iter(values))?;
    Ok(affected > 0)
}

/// Field diff for partial updates (§4.1). Keys present in `new_data` that
/// changed (or are new) are included; keys dropped between `previous_data`
/// and `new_data` are included with a `null` value.
pub fn diff_fields(previous: &Map<String, Value>, new_data: &Map<String, Value>) -> Map<String, Value> {
    let mut changes = Map::new();
    for (key, value) in new_data {
        if key == "id" {
            continue;
        }
        match previous.get(key) {
            Some(prev_value) if prev_value == value => {}
            _ => {
                changes.insert(key.clone(), value.clone());
            }
        }
    }
    for key in previous.keys() {
        if key == "id" || new_data.contains_key(key) {
            continue;
        }
        changes.insert(key.clone(), Value::Null);
    }
    changes
}
