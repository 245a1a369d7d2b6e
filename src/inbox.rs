//! Inbox applier: client pull side. Turns a pulled page of remote events into
//! local writes via the entity applier, recording conflicts on overwrite (§4.4).

use chrono::{DateTime, Utc};

use crate::applier::{apply_event, ApplyEvent, ApplyOutcome, Validator};
use crate::envelope::{ActionType, ConflictRecord, FailedEvent, PullPage, RemoteEvent};
use crate::error::SyncError;
use crate::registry::map_action_type;
use crate::state::record_conflict;
use crate::timestamp::parse_timestamp;

/// Apply one pulled page to the local store within the caller's transaction.
///
/// `my_device_id` excludes a device's own events from conflict bookkeeping —
/// the server already excludes them from the page, but a caller pulling
/// without that filter (e.g. a replay) gets the same treatment here.
/// `last_sync_at` gates the LWW conflict check (§4.4): a null value never
/// conflicts (first sync), an unparseable local timestamp conflicts
/// conservatively.
pub fn apply_remote(
    tx: &rusqlite::Transaction<'_>,
    project_id: &str,
    page: &PullPage,
    my_device_id: &str,
    last_sync_at: Option<DateTime<Utc>>,
    validator: Validator,
) -> Result<crate::envelope::ApplyRemoteResult, SyncError> {
    let mut result = crate::envelope::ApplyRemoteResult::default();

    for event in &page.events {
        if event.device_id == my_device_id {
            result.last_applied_seq = event.server_seq;
            continue;
        }

        let action_type = resolve_action_type(event);
        let new_data = event
            .payload
            .get("new_data")
            .and_then(|v| v.as_object())
            .cloned()
            .unwrap_or_default();
        let previous_data = event
            .payload
            .get("previous_data")
            .and_then(|v| v.as_object())
            .cloned();

        let apply = ApplyEvent {
            action_type,
            entity_type: &event.entity_type,
            entity_id: &event.entity_id,
            new_data: &new_data,
            previous_data: previous_data.as_ref(),
            client_timestamp: event.client_timestamp,
        };

        match apply_event(tx, &apply, validator) {
            Ok(outcome) => {
                result.applied_count += 1;
                result.last_applied_seq = event.server_seq;
                maybe_record_conflict(tx, project_id, event, action_type, &outcome, last_sync_at, &mut result)?;
            }
            Err(e) => {
                result.last_applied_seq = event.server_seq;
                result.failed.push(FailedEvent { server_seq: event.server_seq, reason: e.reason });
            }
        }
    }

    Ok(result)
}

fn resolve_action_type(event: &RemoteEvent) -> ActionType {
    match event.action_type.as_str() {
        "create" => ActionType::Create,
        "update" => ActionType::Update,
        "delete" => ActionType::Delete,
        "soft_delete" => ActionType::SoftDelete,
        "restore" => ActionType::Restore,
        other => map_action_type(other),
    }
}

fn maybe_record_conflict(
    tx: &rusqlite::Transaction<'_>,
    project_id: &str,
    event: &RemoteEvent,
    action_type: ActionType,
    outcome: &ApplyOutcome,
    last_sync_at: Option<DateTime<Utc>>,
    result: &mut crate::envelope::ApplyRemoteResult,
) -> Result<(), SyncError> {
    if matches!(action_type, ActionType::Delete | ActionType::SoftDelete) {
        return Ok(());
    }
    if !outcome.overwritten {
        return Ok(());
    }
    let Some(local_data) = &outcome.local_data else { return Ok(()) };
    if !local_modified_since_sync(local_data, last_sync_at) {
        return Ok(());
    }

    result.overwrites_count += 1;
    let conflict = ConflictRecord {
        entity_type: event.entity_type.clone(),
        entity_id: event.entity_id.clone(),
        server_seq: event.server_seq,
        local_data: local_data.clone(),
        remote_data: event.payload.clone(),
        overwritten_at: Utc::now(),
    };
    record_conflict(tx, project_id, &conflict)?;
    result.conflicts.push(conflict);
    Ok(())
}

/// Whether the overwritten local row carries a timestamp newer than the last
/// successful sync, meaning the remote write clobbered an un-pushed local
/// edit (§4.4). No `last_sync_at` (first sync) never conflicts; a local row
/// with no parseable timestamp of its own is treated as modified, since there
/// is no safe way to prove otherwise.
fn local_modified_since_sync(
    local_data: &serde_json::Value,
    last_sync_at: Option<DateTime<Utc>>,
) -> bool {
    let Some(last_sync_at) = last_sync_at else { return false };
    for col in ["updated_at", "timestamp", "created_at"] {
        if let Some(s) = local_data.get(col).and_then(|v| v.as_str()) {
            match parse_timestamp(s) {
                Ok(ts) => return ts > last_sync_at,
                Err(_) => continue,
            }
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state;
    use rusqlite::Connection;
    use serde_json::json;

    fn db() -> Connection {
        let mut conn = Connection::open_in_memory().unwrap();
        let tx = conn.transaction().unwrap();
        state::init_schema(&tx).unwrap();
        tx.execute_batch(
            "CREATE TABLE issues (id TEXT PRIMARY KEY, title TEXT, updated_at TEXT, deleted_at TEXT);",
        )
        .unwrap();
        tx.commit().unwrap();
        conn
    }

    fn is_issues(entity_type: &str) -> bool {
        entity_type == "issues"
    }

    fn remote_event(
        seq: i64,
        action: &str,
        entity_id: &str,
        new_data: serde_json::Value,
        previous_data: serde_json::Value,
    ) -> RemoteEvent {
        RemoteEvent {
            server_seq: seq,
            device_id: "dev-remote".to_string(),
            session_id: "s1".to_string(),
            client_action_id: seq,
            action_type: action.to_string(),
            entity_type: "issues".to_string(),
            entity_id: entity_id.to_string(),
            payload: json!({"schema_version": 1, "new_data": new_data, "previous_data": previous_data}),
            client_timestamp: Utc::now(),
            server_timestamp: Utc::now(),
        }
    }

    #[test]
    fn applies_create_and_tracks_last_seq() {
        let mut conn = db();
        let tx = conn.transaction().unwrap();
        let page = PullPage {
            events: vec![remote_event(1, "create", "td-1", json!({"title": "hi"}), json!({}))],
            last_server_seq: 1,
            has_more: false,
        };
        let result = apply_remote(&tx, "proj-1", &page, "dev-local", None, &is_issues).unwrap();
        assert_eq!(result.applied_count, 1);
        assert_eq!(result.last_applied_seq, 1);
        assert!(result.conflicts.is_empty());
    }

    #[test]
    fn overwrite_after_last_sync_is_recorded_as_conflict() {
        let mut conn = db();
        let tx = conn.transaction().unwrap();
        let future_local_ts = Utc::now();
        tx.execute(
            "INSERT INTO issues (id, title, updated_at) VALUES ('td-2', 'local edit', ?1)",
            [future_local_ts.to_rfc3339()],
        )
        .unwrap();
        let last_sync_at = future_local_ts - chrono::Duration::seconds(10);

        let page = PullPage {
            events: vec![remote_event(5, "update", "td-2", json!({"title": "remote edit"}), json!({}))],
            last_server_seq: 5,
            has_more: false,
        };
        let result =
            apply_remote(&tx, "proj-1", &page, "dev-local", Some(last_sync_at), &is_issues).unwrap();
        assert_eq!(result.overwrites_count, 1);
        assert_eq!(result.conflicts.len(), 1);
        assert_eq!(result.conflicts[0].local_data["title"], "local edit");
        let conflicts_in_store = state::list_conflicts(&tx, "proj-1").unwrap();
        assert_eq!(conflicts_in_store.len(), 1);
    }

    #[test]
    fn conflict_gate_falls_through_unparseable_column_to_the_next() {
        let last_sync_at = Utc::now();
        let earlier = last_sync_at - chrono::Duration::seconds(10);
        let local_data = json!({"updated_at": "not-a-date", "created_at": earlier.to_rfc3339()});
        assert!(!local_modified_since_sync(&local_data, Some(last_sync_at)));

        let later = last_sync_at + chrono::Duration::seconds(10);
        let local_data = json!({"updated_at": "not-a-date", "created_at": later.to_rfc3339()});
        assert!(local_modified_since_sync(&local_data, Some(last_sync_at)));
    }

    #[test]
    fn delete_overwrite_never_records_conflict() {
        let mut conn = db();
        let tx = conn.transaction().unwrap();
        tx.execute("INSERT INTO issues (id, title) VALUES ('td-3', 'x')", []).unwrap();
        let page = PullPage {
            events: vec![remote_event(2, "delete", "td-3", json!({}), json!({}))],
            last_server_seq: 2,
            has_more: false,
        };
        let result = apply_remote(&tx, "proj-1", &page, "dev-local", Some(Utc::now()), &is_issues).unwrap();
        assert!(result.conflicts.is_empty());
        let count: i64 =
            tx.query_row("SELECT COUNT(*) FROM issues WHERE id='td-3'", [], |r| r.get(0)).unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn own_device_events_are_skipped_but_advance_cursor() {
        let mut conn = db();
        let tx = conn.transaction().unwrap();
        let mut event = remote_event(3, "create", "td-4", json!({"title": "mine"}), json!({}));
        event.device_id = "dev-local".to_string();
        let page = PullPage { events: vec![event], last_server_seq: 3, has_more: false };
        let result = apply_remote(&tx, "proj-1", &page, "dev-local", None, &is_issues).unwrap();
        assert_eq!(result.applied_count, 0);
        assert_eq!(result.last_applied_seq, 3);
        let count: i64 =
            tx.query_row("SELECT COUNT(*) FROM issues WHERE id='td-4'", [], |r| r.get(0)).unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn failed_event_still_advances_cursor() {
        let mut conn = db();
        let tx = conn.transaction().unwrap();
        let page = PullPage {
            events: vec![remote_event(9, "create", "td-9", json!({"title": "x"}), json!({}))],
            last_server_seq: 9,
            has_more: false,
        };
        let result = apply_remote(&tx, "proj-1", &page, "dev-local", None, &|_| false).unwrap();
        assert_eq!(result.applied_count, 0);
        assert_eq!(result.failed.len(), 1);
        assert_eq!(result.last_applied_seq, 9);
    }
}
