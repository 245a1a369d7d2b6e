pub mod ack;
pub mod applier;
pub mod client;
pub mod envelope;
pub mod error;
pub mod ids;
pub mod inbox;
pub mod outbox;
pub mod registry;
pub mod server_log;
pub mod state;
pub mod timestamp;

pub use applier::{apply_event, ApplyEvent, ApplyOutcome, Validator};
pub use client::SyncClient;
pub use envelope::{
    ActionType, ApplyRemoteResult, ConflictRecord, Envelope, FailedEvent, InsertOutcome, PullPage,
    PushEvent, RejectedEvent, RemoteEvent,
};
pub use error::{EventError, SyncError};
pub use state::SyncState;
