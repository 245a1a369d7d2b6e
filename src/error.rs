use thiserror::Error;

/// Top-level error for anything that aborts the enclosing transaction outright.
///
/// Per-event problems (a bad payload, a duplicate push, an unknown entity type)
/// are never turned into a `SyncError` — they are collected into the `rejected`/
/// `failed` lists on the relevant result structures so one bad event cannot
/// abort an otherwise-good batch.
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("serde: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("invalid state: {0}")]
    State(&'static str),
}

/// Why a single event could not be applied or accepted.
///
/// Distinct from [`SyncError`]: producing one of these never aborts a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventError {
    pub reason: String,
}

impl EventError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self { reason: reason.into() }
    }
}

impl std::fmt::Display for EventError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.reason)
    }
}
