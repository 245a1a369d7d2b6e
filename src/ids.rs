//! Synthetic id generation for backfilled action-log rows (§3).
//!
//! This is the one place the engine manufactures an identifier; it is an
//! internal bookkeeping id for the action log, never an entity id.

use rand::Rng;

/// `al-<8 hex chars>`.
pub fn new_action_log_id() -> String {
    let suffix: u32 = rand::thread_rng().r#gen();
    format!("al-{suffix:08x}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn has_expected_shape() {
        let id = new_action_log_id();
        assert!(id.starts_with("al-"));
        assert_eq!(id.len(), 11);
        assert!(id[3..].chars().all(|c| c.is_ascii_hexdigit()));
    }
}
