//! Push acknowledgements: stamp `action_log` rows with the server sequence
//! they were assigned, or with rejection metadata, once a push round-trips.

use rusqlite::{params, Transaction};

use crate::envelope::RejectedEvent;
use crate::error::SyncError;

/// Mark accepted action-log rows synced, recording the server sequence each
/// `client_action_id` (the action log's integer insertion key) was assigned.
/// An ack for a row that no longer exists locally (e.g. undone meanwhile) is
/// a no-op rather than an error.
pub fn record_acks(tx: &Transaction<'_>, acks: &[(i64, i64)]) -> Result<(), SyncError> {
    let now = chrono::Utc::now().to_rfc3339();
    for (client_action_id, server_seq) in acks {
        tx.execute(
            "UPDATE action_log SET synced_at = ?1, server_seq = ?2 WHERE action_id = ?3",
            params![now, server_seq, client_action_id],
        )?;
    }
    Ok(())
}

/// Duplicate rejections carry the original `server_seq` and are acked the
/// same as an accepted event — the row already exists on the server, so the
/// client should still mark it synced rather than retry it forever (§9 open
/// question: duplicates ack like a success). Any other rejection reason is
/// left unsynced so the next push retries it.
pub fn record_rejections(tx: &Transaction<'_>, rejected: &[RejectedEvent]) -> Result<(), SyncError> {
    let now = chrono::Utc::now().to_rfc3339();
    for rejection in rejected {
        if rejection.reason != "duplicate" {
            continue;
        }
        let Some(server_seq) = rejection.server_seq else { continue };
        tx.execute(
            "UPDATE action_log SET synced_at = ?1, server_seq = ?2 WHERE action_id = ?3",
            params![now, server_seq, rejection.client_action_id],
        )?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outbox;
    use rusqlite::Connection;

    fn db_with_pending_row() -> Connection {
        let mut conn = Connection::open_in_memory().unwrap();
        let tx = conn.transaction().unwrap();
        outbox::init_schema(&tx).unwrap();
        tx.execute(
            "INSERT INTO action_log (row_id, session_id, action_type, entity_type, entity_id, new_data, client_timestamp)
             VALUES ('al-1', 's1', 'create', 'issues', 'td-1', '{}', '2024-01-01T00:00:00Z')",
            [],
        )
        .unwrap();
        tx.commit().unwrap();
        conn
    }

    #[test]
    fn acks_stamp_synced_at_and_server_seq() {
        let mut conn = db_with_pending_row();
        let tx = conn.transaction().unwrap();
        record_acks(&tx, &[(1, 42)]).unwrap();
        let (synced_at, server_seq): (Option<String>, Option<i64>) = tx
            .query_row("SELECT synced_at, server_seq FROM action_log WHERE action_id = 1", [], |r| {
                Ok((r.get(0)?, r.get(1)?))
            })
            .unwrap();
        assert!(synced_at.is_some());
        assert_eq!(server_seq, Some(42));
    }

    #[test]
    fn ack_for_missing_row_is_a_no_op() {
        let mut conn = db_with_pending_row();
        let tx = conn.transaction().unwrap();
        record_acks(&tx, &[(999, 1)]).unwrap();
    }

    #[test]
    fn duplicate_rejection_acks_with_original_seq() {
        let mut conn = db_with_pending_row();
        let tx = conn.transaction().unwrap();
        record_rejections(
            &tx,
            &[RejectedEvent { client_action_id: 1, reason: "duplicate".to_string(), server_seq: Some(7) }],
        )
        .unwrap();
        let server_seq: Option<i64> =
            tx.query_row("SELECT server_seq FROM action_log WHERE action_id = 1", [], |r| r.get(0)).unwrap();
        assert_eq!(server_seq, Some(7));
    }

    #[test]
    fn non_duplicate_rejection_leaves_row_unsynced() {
        let mut conn = db_with_pending_row();
        let tx = conn.transaction().unwrap();
        record_rejections(
            &tx,
            &[RejectedEvent { client_action_id: 1, reason: "empty entity_id".to_string(), server_seq: None }],
        )
        .unwrap();
        let synced_at: Option<String> =
            tx.query_row("SELECT synced_at FROM action_log WHERE action_id = 1", [], |r| r.get(0)).unwrap();
        assert!(synced_at.is_none());
    }
}
