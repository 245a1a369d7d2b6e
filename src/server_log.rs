//! Server-side event log: append-only, per-device dedup, monotonic sequencing.

use chrono::Utc;
use rusqlite::{params, OptionalExtension, Transaction};

use crate::envelope::{InsertOutcome, PullPage, PushEvent, RejectedEvent, RemoteEvent};
use crate::error::SyncError;

/// Create the server event table. Safe to call multiple times.
pub fn init_schema(tx: &Transaction<'_>) -> Result<(), SyncError> {
    tx.execute_batch(
        r#"
CREATE TABLE IF NOT EXISTS server_events (
    server_seq INTEGER PRIMARY KEY AUTOINCREMENT,
    device_id TEXT NOT NULL,
    session_id TEXT NOT NULL,
    client_action_id INTEGER NOT NULL,
    action_type TEXT NOT NULL,
    entity_type TEXT NOT NULL,
    entity_id TEXT NOT NULL,
    payload TEXT NOT NULL,
    client_timestamp TEXT NOT NULL,
    server_timestamp TEXT NOT NULL,
    UNIQUE(device_id, session_id, client_action_id)
);
CREATE INDEX IF NOT EXISTS idx_server_events_entity ON server_events(entity_type, entity_id);
"#,
    )?;
    Ok(())
}

/// Accept a batch of events from one push, assigning monotonic sequences and
/// deduplicating by `(device_id, session_id, client_action_id)` (§4.2).
pub fn insert(tx: &Transaction<'_>, events: &[PushEvent]) -> Result<InsertOutcome, SyncError> {
    let mut outcome = InsertOutcome::default();

    for event in events {
        if event.device_id.is_empty() {
            outcome.rejected.push(RejectedEvent {
                client_action_id: event.client_action_id,
                reason: "empty device_id".to_string(),
                server_seq: None,
            });
            continue;
        }
        if event.session_id.is_empty() {
            outcome.rejected.push(RejectedEvent {
                client_action_id: event.client_action_id,
                reason: "empty session_id".to_string(),
                server_seq: None,
            });
            continue;
        }
        if event.entity_id.is_empty() {
            outcome.rejected.push(RejectedEvent {
                client_action_id: event.client_action_id,
                reason: "empty entity_id".to_string(),
                server_seq: None,
            });
            continue;
        }

        let existing_seq: Option<i64> = tx
            .query_row(
                "SELECT server_seq FROM server_events
                 WHERE device_id = ?1 AND session_id = ?2 AND client_action_id = ?3",
                params![event.device_id, event.session_id, event.client_action_id],
                |r| r.get(0),
            )
            .optional()?;

        if let Some(seq) = existing_seq {
            outcome.rejected.push(RejectedEvent {
                client_action_id: event.client_action_id,
                reason: "duplicate".to_string(),
                server_seq: Some(seq),
            });
            continue;
        }

        let payload = serde_json::to_string(&event.payload)?;
        let now = Utc::now();
        tx.execute(
            "INSERT INTO server_events
                (device_id, session_id, client_action_id, action_type, entity_type, entity_id,
                 payload, client_timestamp, server_timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                event.device_id,
                event.session_id,
                event.client_action_id,
                event.action_type.as_str(),
                event.entity_type,
                event.entity_id,
                payload,
                event.client_timestamp.to_rfc3339(),
                now.to_rfc3339(),
            ],
        )?;
        let seq = tx.last_insert_rowid();
        outcome.accepted_count += 1;
        outcome.acks.push((event.client_action_id, seq));
    }

    Ok(outcome)
}

/// Read events with `server_seq > after_seq`, ascending, up to `limit`, optionally
/// excluding one device's own events (§4.2).
pub fn events_since(
    tx: &Transaction<'_>,
    after_seq: i64,
    limit: i64,
    exclude_device: &str,
) -> Result<PullPage, SyncError> {
    let mut stmt = if exclude_device.is_empty() {
        tx.prepare(
            "SELECT server_seq, device_id, session_id, client_action_id, action_type,
                    entity_type, entity_id, payload, client_timestamp, server_timestamp
             FROM server_events
             WHERE server_seq > ?1
             ORDER BY server_seq ASC
             LIMIT ?2",
        )?
    } else {
        tx.prepare(
            "SELECT server_seq, device_id, session_id, client_action_id, action_type,
                    entity_type, entity_id, payload, client_timestamp, server_timestamp
             FROM server_events
             WHERE server_seq > ?1 AND device_id != ?3
             ORDER BY server_seq ASC
             LIMIT ?2",
        )?
    };

    let rows = if exclude_device.is_empty() {
        stmt.query_map(params![after_seq, limit], row_to_remote_event)?
    } else {
        stmt.query_map(params![after_seq, limit, exclude_device], row_to_remote_event)?
    };

    let mut events = Vec::new();
    for row in rows {
        events.push(row?);
    }

    let has_more = events.len() as i64 == limit;
    let last_server_seq = events.last().map(|e| e.server_seq).unwrap_or(after_seq);

    Ok(PullPage { events, last_server_seq, has_more })
}

fn row_to_remote_event(row: &rusqlite::Row<'_>) -> rusqlite::Result<RemoteEvent> {
    let payload_str: String = row.get(7)?;
    let payload: serde_json::Value =
        serde_json::from_str(&payload_str).unwrap_or(serde_json::Value::Null);
    let client_ts_str: String = row.get(8)?;
    let server_ts_str: String = row.get(9)?;
    Ok(RemoteEvent {
        server_seq: row.get(0)?,
        device_id: row.get(1)?,
        session_id: row.get(2)?,
        client_action_id: row.get(3)?,
        action_type: row.get(4)?,
        entity_type: row.get(5)?,
        entity_id: row.get(6)?,
        payload,
        client_timestamp: crate::timestamp::parse_timestamp(&client_ts_str)
            .unwrap_or_else(|_| Utc::now()),
        server_timestamp: crate::timestamp::parse_timestamp(&server_ts_str)
            .unwrap_or_else(|_| Utc::now()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{ActionType, Envelope};
    use rusqlite::Connection;
    use serde_json::{json, Map};

    fn push_event(device: &str, session: &str, action_id: i64, entity_id: &str) -> PushEvent {
        PushEvent {
            client_action_id: action_id,
            device_id: device.to_string(),
            session_id: session.to_string(),
            action_type: ActionType::Create,
            entity_type: "issues".to_string(),
            entity_id: entity_id.to_string(),
            payload: Envelope::new(
                json!({"title": "t"}).as_object().unwrap().clone(),
                Map::new(),
            ),
            client_timestamp: Utc::now(),
        }
    }

    fn db() -> Connection {
        let mut conn = Connection::open_in_memory().unwrap();
        let tx = conn.transaction().unwrap();
        init_schema(&tx).unwrap();
        tx.commit().unwrap();
        conn
    }

    #[test]
    fn accepts_and_assigns_monotonic_sequence() {
        let mut conn = db();
        let tx = conn.transaction().unwrap();
        let outcome =
            insert(&tx, &[push_event("dev-a", "s1", 1, "td-1"), push_event("dev-a", "s1", 2, "td-2")])
                .unwrap();
        assert_eq!(outcome.accepted_count, 2);
        assert_eq!(outcome.acks, vec![(1, 1), (2, 2)]);
        assert!(outcome.rejected.is_empty());
    }

    #[test]
    fn duplicate_push_is_rejected_with_original_seq() {
        let mut conn = db();
        let tx = conn.transaction().unwrap();
        insert(&tx, &[push_event("dev-a", "s1", 1, "td-1")]).unwrap();
        let outcome = insert(&tx, &[push_event("dev-a", "s1", 1, "td-1")]).unwrap();
        assert_eq!(outcome.accepted_count, 0);
        assert_eq!(outcome.rejected.len(), 1);
        assert_eq!(outcome.rejected[0].reason, "duplicate");
        assert_eq!(outcome.rejected[0].server_seq, Some(1));
    }

    #[test]
    fn rejects_empty_required_fields() {
        let mut conn = db();
        let tx = conn.transaction().unwrap();
        let outcome = insert(&tx, &[push_event("", "s1", 1, "td-1")]).unwrap();
        assert_eq!(outcome.rejected[0].reason, "empty device_id");
    }

    #[test]
    fn events_since_excludes_own_device() {
        let mut conn = db();
        let tx = conn.transaction().unwrap();
        insert(&tx, &[push_event("dev-a", "s1", 1, "td-1"), push_event("dev-b", "s1", 1, "td-2")])
            .unwrap();
        let page = events_since(&tx, 0, 10, "dev-a").unwrap();
        assert_eq!(page.events.len(), 1);
        assert_eq!(page.events[0].device_id, "dev-b");
        assert!(!page.has_more);
    }

    #[test]
    fn events_since_paginates_with_has_more() {
        let mut conn = db();
        let tx = conn.transaction().unwrap();
        let batch: Vec<PushEvent> =
            (1..=5).map(|i| push_event("dev-a", "s1", i, &format!("td-{i}"))).collect();
        insert(&tx, &batch).unwrap();
        let page = events_since(&tx, 0, 2, "").unwrap();
        assert_eq!(page.events.len(), 2);
        assert!(page.has_more);
        assert_eq!(page.last_server_seq, 2);
    }
}
