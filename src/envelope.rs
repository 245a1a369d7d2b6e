//! Shared record types and the JSON envelope carried as an event payload.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// `{ schema_version, new_data, previous_data }`, tolerant of unknown top-level fields.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Envelope {
    pub schema_version: i32,
    #[serde(default)]
    pub new_data: Map<String, Value>,
    #[serde(default)]
    pub previous_data: Map<String, Value>,
}

impl Envelope {
    pub fn new(new_data: Map<String, Value>, previous_data: Map<String, Value>) -> Self {
        Self { schema_version: 1, new_data, previous_data }
    }
}

/// Action types recognized by the entity applier, after outbox normalization (§4.3 step 5).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    Create,
    Update,
    Delete,
    SoftDelete,
    Restore,
}

impl ActionType {
    pub fn as_str(self) -> &'static str {
        match self {
            ActionType::Create => "create",
            ActionType::Update => "update",
            ActionType::Delete => "delete",
            ActionType::SoftDelete => "soft_delete",
            ActionType::Restore => "restore",
        }
    }
}

/// An event about to be pushed to the server; `client_action_id` is the action
/// log's integer insertion key, never the textual `al-...` id (§9, ack plumbing).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushEvent {
    pub client_action_id: i64,
    pub device_id: String,
    pub session_id: String,
    pub action_type: ActionType,
    pub entity_type: String,
    pub entity_id: String,
    pub payload: Envelope,
    pub client_timestamp: DateTime<Utc>,
}

/// An event as pulled from the server log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteEvent {
    pub server_seq: i64,
    pub device_id: String,
    pub session_id: String,
    pub client_action_id: i64,
    pub action_type: String,
    pub entity_type: String,
    pub entity_id: String,
    pub payload: Value,
    pub client_timestamp: DateTime<Utc>,
    pub server_timestamp: DateTime<Utc>,
}

/// Why an event was rejected by the server log, with the original sequence
/// when the rejection reason is `"duplicate"`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RejectedEvent {
    pub client_action_id: i64,
    pub reason: String,
    pub server_seq: Option<i64>,
}

/// Result of a server-side push batch.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InsertOutcome {
    pub accepted_count: usize,
    pub acks: Vec<(i64, i64)>,
    pub rejected: Vec<RejectedEvent>,
}

/// Result of a server-side pull page.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullPage {
    pub events: Vec<RemoteEvent>,
    pub last_server_seq: i64,
    pub has_more: bool,
}

/// Row appended to `sync_conflicts` when a remote event overwrites a locally-modified row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConflictRecord {
    pub entity_type: String,
    pub entity_id: String,
    pub server_seq: i64,
    pub local_data: Value,
    pub remote_data: Value,
    pub overwritten_at: DateTime<Utc>,
}

/// A single event the inbox applier could not apply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailedEvent {
    pub server_seq: i64,
    pub reason: String,
}

/// Result of applying one pulled batch to the local store.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApplyRemoteResult {
    pub applied_count: usize,
    pub last_applied_seq: i64,
    pub overwrites_count: usize,
    pub conflicts: Vec<ConflictRecord>,
    pub failed: Vec<FailedEvent>,
}
