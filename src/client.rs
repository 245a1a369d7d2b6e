//! `SyncClient`: the facade a host binds its push/pull transport to, mirroring
//! the teacher's `SyncClient::sync_cycle` shape but carrying this engine's own
//! outbox/inbox/ack pipeline instead of an HLC oplog.

use chrono::{DateTime, Utc};
use rusqlite::Connection;

use crate::applier::Validator;
use crate::envelope::{ApplyRemoteResult, PullPage, PushEvent, RejectedEvent};
use crate::error::SyncError;
use crate::{ack, inbox, outbox, state};

/// Per-device identity the client binds once at construction.
pub struct SyncClient<'c> {
    conn: &'c Connection,
    project_id: String,
    device_id: String,
    session_id: String,
}

impl<'c> SyncClient<'c> {
    pub fn new(conn: &'c Connection, project_id: &str, device_id: &str, session_id: &str) -> Result<Self, SyncError> {
        {
            let tx = conn.unchecked_transaction()?;
            outbox::init_schema(&tx)?;
            state::init_schema(&tx)?;
            tx.commit()?;
        }
        Ok(Self {
            conn,
            project_id: project_id.to_string(),
            device_id: device_id.to_string(),
            session_id: session_id.to_string(),
        })
    }

    /// Run one full sync cycle: push pending local actions, then pull and
    /// apply everything newer than the last cursor, advancing both cursors
    /// as the push/pull closures succeed.
    pub fn sync_cycle<P, G>(
        &self,
        push: P,
        pull: G,
        pull_limit: i64,
        validator: Validator,
    ) -> Result<ApplyRemoteResult, SyncError>
    where
        P: Fn(&[PushEvent]) -> Result<(Vec<(i64, i64)>, Vec<RejectedEvent>), SyncError>,
        G: Fn(i64, i64) -> Result<PullPage, SyncError>,
    {
        // Outbox builder: its own read-write transaction, closed before the
        // push RPC runs so the round-trip never holds a local transaction open.
        let outbox_tx = self.conn.unchecked_transaction()?;
        let pending = outbox::pending_events(&outbox_tx, &self.project_id, &self.device_id, &self.session_id)?;
        outbox_tx.commit()?;

        if !pending.is_empty() {
            let (acks, rejected) = push(&pending)?;

            let ack_tx = self.conn.unchecked_transaction()?;
            ack::record_acks(&ack_tx, &acks)?;
            ack::record_rejections(&ack_tx, &rejected)?;
            if let Some((last_id, _)) = acks.last() {
                state::set_last_pushed(&ack_tx, &self.project_id, *last_id)?;
            }
            ack_tx.commit()?;
        }

        let cursor_tx = self.conn.unchecked_transaction()?;
        let sync_state = state::get_or_init_sync_state(&cursor_tx, &self.project_id)?;
        cursor_tx.commit()?;

        // Pull RPC also runs outside any held-open local transaction.
        let page = pull(sync_state.last_pulled_server_seq, pull_limit)?;

        // Inbox applier: one read-write transaction wrapping the whole batch,
        // so a partial failure still advances the cursor atomically with the
        // writes that did succeed.
        let apply_tx = self.conn.unchecked_transaction()?;
        let result = inbox::apply_remote(
            &apply_tx,
            &self.project_id,
            &page,
            &self.device_id,
            sync_state.last_sync_at,
            validator,
        )?;

        let now = Utc::now();
        if result.last_applied_seq > 0 {
            state::set_last_pulled(&apply_tx, &self.project_id, result.last_applied_seq, now)?;
        } else if !page.events.is_empty() {
            state::set_last_pulled(&apply_tx, &self.project_id, page.last_server_seq, now)?;
        }
        apply_tx.commit()?;

        Ok(result)
    }

    pub fn last_sync_at(&self) -> Result<Option<DateTime<Utc>>, SyncError> {
        let tx = self.conn.unchecked_transaction()?;
        let sync_state = state::get_or_init_sync_state(&tx, &self.project_id)?;
        Ok(sync_state.last_sync_at)
    }
}
