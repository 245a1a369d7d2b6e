//! Sync state bootstrap: `sync_state`, `sync_conflicts`, and the schema-version
//! key/value table, generalized from the teacher's `init_schema`/`run_migrations`
//! shape to the tables this engine actually needs (§4.6).

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Transaction};

use crate::envelope::ConflictRecord;
use crate::error::SyncError;

/// Per-project sync cursor state.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncState {
    pub project_id: String,
    pub last_pushed_action_id: Option<i64>,
    pub last_pulled_server_seq: i64,
    pub last_sync_at: Option<DateTime<Utc>>,
}

/// Create required metadata tables and indexes. Safe to call multiple times.
pub fn init_schema(tx: &Transaction<'_>) -> Result<(), SyncError> {
    tx.execute_batch(
        r#"
CREATE TABLE IF NOT EXISTS sync_state (
    project_id TEXT PRIMARY KEY,
    last_pushed_action_id INTEGER,
    last_pulled_server_seq INTEGER NOT NULL DEFAULT 0,
    last_sync_at TEXT
);

CREATE TABLE IF NOT EXISTS sync_conflicts (
    conflict_id INTEGER PRIMARY KEY AUTOINCREMENT,
    project_id TEXT NOT NULL,
    entity_type TEXT NOT NULL,
    entity_id TEXT NOT NULL,
    server_seq INTEGER NOT NULL,
    local_data TEXT NOT NULL,
    remote_data TEXT NOT NULL,
    overwritten_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_sync_conflicts_project ON sync_conflicts(project_id, conflict_id);

CREATE TABLE IF NOT EXISTS sync_kv (
    k TEXT PRIMARY KEY,
    v TEXT NOT NULL
);
"#,
    )?;
    tx.execute(
        "INSERT INTO sync_kv(k, v) VALUES('schema_version', '1') ON CONFLICT(k) DO NOTHING",
        [],
    )?;
    Ok(())
}

/// Return the project's sync state, inserting a zeroed default row on first access.
pub fn get_or_init_sync_state(tx: &Transaction<'_>, project_id: &str) -> Result<SyncState, SyncError> {
    let existing = tx
        .query_row(
            "SELECT last_pushed_action_id, last_pulled_server_seq, last_sync_at
             FROM sync_state WHERE project_id = ?1",
            params![project_id],
            |r| {
                let last_sync_at: Option<String> = r.get(2)?;
                Ok((r.get::<_, Option<i64>>(0)?, r.get::<_, i64>(1)?, last_sync_at))
            },
        )
        .optional()?;

    if let Some((last_pushed, last_pulled, last_sync_at)) = existing {
        return Ok(SyncState {
            project_id: project_id.to_string(),
            last_pushed_action_id: last_pushed,
            last_pulled_server_seq: last_pulled,
            last_sync_at: last_sync_at
                .and_then(|s| crate::timestamp::parse_timestamp(&s).ok()),
        });
    }

    tx.execute(
        "INSERT INTO sync_state(project_id, last_pulled_server_seq) VALUES (?1, 0)",
        params![project_id],
    )?;
    Ok(SyncState {
        project_id: project_id.to_string(),
        last_pushed_action_id: None,
        last_pulled_server_seq: 0,
        last_sync_at: None,
    })
}

pub fn set_last_pulled(
    tx: &Transaction<'_>,
    project_id: &str,
    server_seq: i64,
    synced_at: DateTime<Utc>,
) -> Result<(), SyncError> {
    tx.execute(
        "UPDATE sync_state SET last_pulled_server_seq = ?1, last_sync_at = ?2 WHERE project_id = ?3",
        params![server_seq, synced_at.to_rfc3339(), project_id],
    )?;
    Ok(())
}

pub fn set_last_pushed(
    tx: &Transaction<'_>,
    project_id: &str,
    action_id: i64,
) -> Result<(), SyncError> {
    tx.execute(
        "UPDATE sync_state SET last_pushed_action_id = ?1 WHERE project_id = ?2",
        params![action_id, project_id],
    )?;
    Ok(())
}

/// Append a conflict record (§3, §4.4) within the caller's transaction.
pub fn record_conflict(
    tx: &Transaction<'_>,
    project_id: &str,
    conflict: &ConflictRecord,
) -> Result<(), SyncError> {
    tx.execute(
        "INSERT INTO sync_conflicts
            (project_id, entity_type, entity_id, server_seq, local_data, remote_data, overwritten_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            project_id,
            conflict.entity_type,
            conflict.entity_id,
            conflict.server_seq,
            conflict.local_data.to_string(),
            conflict.remote_data.to_string(),
            conflict.overwritten_at.to_rfc3339(),
        ],
    )?;
    Ok(())
}

pub fn list_conflicts(
    tx: &Transaction<'_>,
    project_id: &str,
) -> Result<Vec<ConflictRecord>, SyncError> {
    let mut stmt = tx.prepare(
        "SELECT entity_type, entity_id, server_seq, local_data, remote_data, overwritten_at
         FROM sync_conflicts WHERE project_id = ?1 ORDER BY conflict_id ASC",
    )?;
    let rows = stmt.query_map(params![project_id], |r| {
        let local_data: String = r.get(3)?;
        let remote_data: String = r.get(4)?;
        let overwritten_at: String = r.get(5)?;
        Ok(ConflictRecord {
            entity_type: r.get(0)?,
            entity_id: r.get(1)?,
            server_seq: r.get(2)?,
            local_data: serde_json::from_str(&local_data).unwrap_or(serde_json::Value::Null),
            remote_data: serde_json::from_str(&remote_data).unwrap_or(serde_json::Value::Null),
            overwritten_at: crate::timestamp::parse_timestamp(&overwritten_at)
                .unwrap_or_else(|_| Utc::now()),
        })
    })?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

/// Current integer schema version stored in `sync_kv`.
pub fn get_schema_version(tx: &Transaction<'_>) -> Result<i32, SyncError> {
    let ver: Option<String> = tx
        .query_row("SELECT v FROM sync_kv WHERE k = 'schema_version'", [], |r| r.get(0))
        .optional()?;
    Ok(ver.and_then(|s| s.parse::<i32>().ok()).unwrap_or(1))
}

/// Advance the stored schema version. No per-step migrations are defined by
/// this engine (the domain schema's own migrations are the host's concern);
/// this only lets the host version the sync metadata tables independently.
pub fn run_migrations(tx: &Transaction<'_>, target_version: i32) -> Result<(), SyncError> {
    if target_version < 1 {
        return Err(SyncError::State("invalid target_version"));
    }
    let current = get_schema_version(tx)?;
    if current >= target_version {
        return Ok(());
    }
    tx.execute(
        "INSERT INTO sync_kv(k, v) VALUES('schema_version', ?1)
         ON CONFLICT(k) DO UPDATE SET v = excluded.v",
        params![target_version.to_string()],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::Connection;

    fn db() -> Connection {
        let mut conn = Connection::open_in_memory().unwrap();
        let tx = conn.transaction().unwrap();
        init_schema(&tx).unwrap();
        tx.commit().unwrap();
        conn
    }

    #[test]
    fn first_access_creates_zeroed_row() {
        let mut conn = db();
        let tx = conn.transaction().unwrap();
        let state = get_or_init_sync_state(&tx, "proj-1").unwrap();
        assert_eq!(state.last_pulled_server_seq, 0);
        assert!(state.last_pushed_action_id.is_none());
        assert!(state.last_sync_at.is_none());
    }

    #[test]
    fn set_last_pulled_round_trips() {
        let mut conn = db();
        let tx = conn.transaction().unwrap();
        get_or_init_sync_state(&tx, "proj-1").unwrap();
        let now = Utc::now();
        set_last_pulled(&tx, "proj-1", 42, now).unwrap();
        let state = get_or_init_sync_state(&tx, "proj-1").unwrap();
        assert_eq!(state.last_pulled_server_seq, 42);
        assert!(state.last_sync_at.is_some());
    }

    #[test]
    fn conflicts_round_trip() {
        let mut conn = db();
        let tx = conn.transaction().unwrap();
        let conflict = ConflictRecord {
            entity_type: "issues".to_string(),
            entity_id: "td-9".to_string(),
            server_seq: 42,
            local_data: serde_json::json!({"title": "local"}),
            remote_data: serde_json::json!({"title": "remote"}),
            overwritten_at: Utc::now(),
        };
        record_conflict(&tx, "proj-1", &conflict).unwrap();
        let all = list_conflicts(&tx, "proj-1").unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].entity_id, "td-9");
        assert_eq!(all[0].server_seq, 42);
    }

    #[test]
    fn migrations_advance_version_once() {
        let mut conn = db();
        let tx = conn.transaction().unwrap();
        assert_eq!(get_schema_version(&tx).unwrap(), 1);
        run_migrations(&tx, 2).unwrap();
        assert_eq!(get_schema_version(&tx).unwrap(), 2);
        run_migrations(&tx, 1).unwrap();
        assert_eq!(get_schema_version(&tx).unwrap(), 2);
    }
}
