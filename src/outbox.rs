//! Outbox builder: client push side. Backfills orphan/stale entities, scans
//! the action log, and normalizes rows into outbound events (§4.3).

use chrono::{DateTime, Utc};
use log::warn;
use rusqlite::{params, OptionalExtension, Transaction};
use serde_json::{Map, Value};

use crate::applier::{fetch_row, table_columns};
use crate::envelope::{ActionType, Envelope, PushEvent};
use crate::error::SyncError;
use crate::ids::new_action_log_id;
use crate::registry::{map_action_type, normalize_entity_type, SYNCABLE_TABLES};
use crate::state;
use crate::timestamp::parse_timestamp;

/// Create the client-local action log. Safe to call multiple times.
pub fn init_schema(tx: &Transaction<'_>) -> Result<(), SyncError> {
    tx.execute_batch(
        r#"
CREATE TABLE IF NOT EXISTS action_log (
    action_id INTEGER PRIMARY KEY AUTOINCREMENT,
    row_id TEXT NOT NULL UNIQUE,
    session_id TEXT NOT NULL,
    action_type TEXT NOT NULL,
    entity_type TEXT NOT NULL,
    entity_id TEXT NOT NULL,
    previous_data TEXT,
    new_data TEXT,
    client_timestamp TEXT NOT NULL,
    undone INTEGER NOT NULL DEFAULT 0,
    synced_at TEXT,
    server_seq INTEGER
);
CREATE INDEX IF NOT EXISTS idx_action_log_pending ON action_log(synced_at, action_id);
"#,
    )?;
    Ok(())
}

struct ActionLogRow {
    action_id: i64,
    session_id: String,
    action_type: String,
    entity_type: String,
    entity_id: String,
    previous_data: Option<Value>,
    new_data: Option<Value>,
    client_timestamp: DateTime<Utc>,
}

/// Build the ordered sequence of outbound events for one push, including
/// backfill of entities that never had an action recorded (§4.3).
pub fn pending_events(
    tx: &Transaction<'_>,
    project_id: &str,
    device_id: &str,
    session_id: &str,
) -> Result<Vec<PushEvent>, SyncError> {
    let sync_state = state::get_or_init_sync_state(tx, project_id)?;
    if sync_state.last_pulled_server_seq == 0 {
        backfill_orphans(tx, session_id)?;
    }
    backfill_stale_issues(tx, session_id)?;

    let rows = scan_pending(tx)?;
    let mut events = Vec::with_capacity(rows.len());

    for row in rows {
        if row.entity_id.is_empty() {
            warn!("skipping action_log row {} with empty entity_id", row.action_id);
            continue;
        }
        let Some(canonical_entity_type) = normalize_entity_type(&row.entity_type) else {
            warn!("skipping action_log row {} with unrecognized entity_type {}", row.action_id, row.entity_type);
            continue;
        };
        let emitted_action = map_action_type(&row.action_type);
        let new_data = as_object(row.new_data);
        let previous_data = as_object(row.previous_data);

        events.push(PushEvent {
            client_action_id: row.action_id,
            device_id: device_id.to_string(),
            session_id: row.session_id.clone(),
            action_type: emitted_action,
            entity_type: canonical_entity_type.to_string(),
            entity_id: row.entity_id.clone(),
            payload: Envelope::new(new_data, previous_data),
            client_timestamp: row.client_timestamp,
        });
    }

    Ok(events)
}

fn as_object(value: Option<Value>) -> Map<String, Value> {
    match value {
        Some(Value::Object(map)) => map,
        _ => Map::new(),
    }
}

/// Step 1: synthesize `create` actions for rows that exist in a syncable table
/// but have no corresponding action-log row under any historical alias.
/// Gated to run only on a never-pulled replica; idempotent by construction
/// (rerunning finds no orphans because the synthetic rows it wrote now match).
fn backfill_orphans(tx: &Transaction<'_>, session_id: &str) -> Result<usize, SyncError> {
    let mut count = 0;
    for table in SYNCABLE_TABLES {
        if table_columns(tx, table.table)?.is_empty() {
            // Table not present in this deployment's schema; nothing to backfill.
            continue;
        }

        let alias_placeholders: Vec<String> =
            (0..table.aliases.len()).map(|i| format!("?{}", i + 1)).collect();
        let action_placeholders: Vec<String> = (0..table.create_action_types.len())
            .map(|i| format!("?{}", table.aliases.len() + i + 1))
            .collect();

        let sql = format!(
            "SELECT id FROM {} WHERE id NOT IN (
                SELECT entity_id FROM action_log
                WHERE entity_type IN ({}) AND action_type IN ({})
             )",
            table.table,
            alias_placeholders.join(", "),
            action_placeholders.join(", "),
        );

        let mut params_vec: Vec<&dyn rusqlite::ToSql> = Vec::new();
        for alias in table.aliases {
            params_vec.push(alias);
        }
        for action in table.create_action_types {
            params_vec.push(action);
        }

        let orphan_ids: Vec<String> = {
            let mut stmt = tx.prepare(&sql)?;
            let rows = stmt.query_map(params_vec.as_slice(), |r| r.get::<_, String>(0))?;
            let mut ids = Vec::new();
            for row in rows {
                ids.push(row?);
            }
            ids
        };

        for id in orphan_ids {
            let Some(row) = fetch_row(tx, table.table, &id)? else { continue };
            let timestamp = extract_timestamp(&row);
            match insert_synthetic_create(tx, session_id, table.canonical_entity_type, &id, &row, timestamp)
            {
                Ok(()) => count += 1,
                Err(e) => warn!("failed to backfill orphan {}/{id}: {e}", table.table),
            }
        }
    }
    Ok(count)
}

/// Step 2: issues whose `updated_at` outran their latest recorded action, or
/// whose latest action's `new_data` doesn't parse, get a fresh synthetic
/// `create` action carrying the current row (§4.3 step 2, issues only).
fn backfill_stale_issues(tx: &Transaction<'_>, session_id: &str) -> Result<usize, SyncError> {
    if table_columns(tx, "issues")?.is_empty() {
        return Ok(0);
    }
    let mut count = 0;
    let ids: Vec<String> = {
        let mut stmt = tx.prepare("SELECT id FROM issues")?;
        let rows = stmt.query_map([], |r| r.get::<_, String>(0))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        out
    };

    for id in ids {
        let Some(row) = fetch_row(tx, "issues", &id)? else { continue };
        let row_updated_at = row
            .get("updated_at")
            .and_then(Value::as_str)
            .and_then(|s| parse_timestamp(s).ok());

        let latest_action: Option<(Option<String>, String)> = tx
            .query_row(
                "SELECT new_data, client_timestamp FROM action_log
                 WHERE entity_type IN ('issue', 'issues') AND action_type IN ('create', 'update')
                   AND entity_id = ?1
                 ORDER BY client_timestamp DESC, action_id DESC LIMIT 1",
                params![id],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .optional()?;

        let is_stale = match &latest_action {
            None => true,
            Some((new_data, client_ts)) => {
                let parses = new_data
                    .as_ref()
                    .map(|s| serde_json::from_str::<Value>(s).is_ok())
                    .unwrap_or(false);
                if !parses {
                    true
                } else {
                    let action_ts = parse_timestamp(client_ts).ok();
                    match (row_updated_at, action_ts) {
                        (Some(updated), Some(acted)) => updated > acted,
                        _ => false,
                    }
                }
            }
        };

        if is_stale {
            let timestamp = extract_timestamp(&row);
            insert_synthetic_create(tx, session_id, "issues", &id, &row, timestamp)?;
            count += 1;
        }
    }
    Ok(count)
}

fn extract_timestamp(row: &Map<String, Value>) -> DateTime<Utc> {
    for col in ["created_at", "timestamp", "started_at"] {
        if let Some(s) = row.get(col).and_then(Value::as_str) {
            if let Ok(ts) = parse_timestamp(s) {
                return ts;
            }
        }
    }
    Utc::now()
}

fn insert_synthetic_create(
    tx: &Transaction<'_>,
    session_id: &str,
    canonical_entity_type: &str,
    entity_id: &str,
    row: &Map<String, Value>,
    timestamp: DateTime<Utc>,
) -> Result<(), SyncError> {
    let new_data = serde_json::to_string(&Value::Object(row.clone()))?;
    let row_id = new_action_log_id();
    tx.execute(
        "INSERT INTO action_log
            (row_id, session_id, action_type, entity_type, entity_id, previous_data, new_data,
             client_timestamp, undone)
         VALUES (?1, ?2, 'create', ?3, ?4, '{}', ?5, ?6, 0)",
        params![row_id, session_id, canonical_entity_type, entity_id, new_data, timestamp.to_rfc3339()],
    )?;
    Ok(())
}

fn scan_pending(tx: &Transaction<'_>) -> Result<Vec<ActionLogRow>, SyncError> {
    let mut stmt = tx.prepare(
        "SELECT action_id, session_id, action_type, entity_type, entity_id,
                previous_data, new_data, client_timestamp
         FROM action_log
         WHERE synced_at IS NULL AND undone = 0
         ORDER BY action_id ASC",
    )?;
    let rows = stmt.query_map([], |r| {
        let previous_data: Option<String> = r.get(5)?;
        let new_data: Option<String> = r.get(6)?;
        let client_ts: String = r.get(7)?;
        Ok(ActionLogRow {
            action_id: r.get(0)?,
            session_id: r.get(1)?,
            action_type: r.get(2)?,
            entity_type: r.get(3)?,
            entity_id: r.get(4)?,
            previous_data: previous_data.and_then(|s| serde_json::from_str(&s).ok()),
            new_data: new_data.and_then(|s| serde_json::from_str(&s).ok()),
            client_timestamp: parse_timestamp(&client_ts).unwrap_or_else(|_| Utc::now()),
        })
    })?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}
