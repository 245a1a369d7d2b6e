//! Compiled-in normalization tables.
//!
//! Every list here is append-only in spirit: removing an alias or special case
//! can silently re-emit backfill rows or mis-normalize a column that used to
//! work (§9, backfill orphan detection).

use crate::envelope::ActionType;

/// A table the outbox builder's backfill step knows how to scan.
pub struct SyncableTable {
    pub table: &'static str,
    pub canonical_entity_type: &'static str,
    pub aliases: &'static [&'static str],
    pub create_action_types: &'static [&'static str],
}

pub const SYNCABLE_TABLES: &[SyncableTable] = &[
    SyncableTable {
        table: "issues",
        canonical_entity_type: "issues",
        aliases: &["issue", "issues"],
        create_action_types: &["create"],
    },
    SyncableTable {
        table: "issue_dependencies",
        canonical_entity_type: "issue_dependencies",
        aliases: &["issue_dependency", "issue_dependencies", "dependency"],
        create_action_types: &["create", "add_dependency"],
    },
    SyncableTable {
        table: "files",
        canonical_entity_type: "files",
        aliases: &["file", "files"],
        create_action_types: &["create", "link_file"],
    },
    SyncableTable {
        table: "boards",
        canonical_entity_type: "boards",
        aliases: &["board", "boards"],
        create_action_types: &["create", "board_create"],
    },
    SyncableTable {
        table: "positions",
        canonical_entity_type: "positions",
        aliases: &["position", "positions", "board_position"],
        create_action_types: &["create", "board_add_issue", "board_set_position"],
    },
    SyncableTable {
        table: "work_sessions",
        canonical_entity_type: "work_sessions",
        aliases: &["work_session", "work_sessions"],
        create_action_types: &["create", "work_session_tag"],
    },
];

/// entity type (as stored in the action log) -> canonical entity type.
pub const ENTITY_TYPE_ALIASES: &[(&str, &str)] = &[
    ("issue", "issues"),
    ("issues", "issues"),
    ("issue_dependency", "issue_dependencies"),
    ("issue_dependencies", "issue_dependencies"),
    ("dependency", "issue_dependencies"),
    ("file", "files"),
    ("files", "files"),
    ("board", "boards"),
    ("boards", "boards"),
    ("position", "positions"),
    ("positions", "positions"),
    ("board_position", "positions"),
    ("work_session", "work_sessions"),
    ("work_sessions", "work_sessions"),
];

pub fn normalize_entity_type(stored: &str) -> Option<&'static str> {
    ENTITY_TYPE_ALIASES
        .iter()
        .find(|(alias, _)| *alias == stored)
        .map(|(_, canonical)| *canonical)
}

/// stored action -> emitted action (§4.3 step 5). Unknown actions default to `Update`.
pub const ACTION_TYPE_MAP: &[(&str, ActionType)] = &[
    ("create", ActionType::Create),
    ("handoff", ActionType::Create),
    ("add_dependency", ActionType::Create),
    ("link_file", ActionType::Create),
    ("board_create", ActionType::Create),
    ("board_update", ActionType::Create),
    ("board_add_issue", ActionType::Create),
    ("board_set_position", ActionType::Create),
    ("work_session_tag", ActionType::Create),
    ("remove_dependency", ActionType::Delete),
    ("unlink_file", ActionType::Delete),
    ("board_delete", ActionType::Delete),
    ("work_session_untag", ActionType::Delete),
    ("delete", ActionType::SoftDelete),
    ("board_unposition", ActionType::SoftDelete),
    ("board_remove_issue", ActionType::SoftDelete),
    ("soft_delete", ActionType::SoftDelete),
    ("restore", ActionType::Restore),
];

pub fn map_action_type(stored: &str) -> ActionType {
    ACTION_TYPE_MAP
        .iter()
        .find(|(action, _)| *action == stored)
        .map(|(_, mapped)| *mapped)
        .unwrap_or(ActionType::Update)
}

/// `(entity_type, column)` pairs whose array values join with commas instead of
/// serializing as JSON text (§4.1 field normalization).
pub const CSV_ARRAY_COLUMNS: &[(&str, &str)] = &[("issues", "labels")];

pub fn is_csv_array_column(entity_type: &str, column: &str) -> bool {
    CSV_ARRAY_COLUMNS.iter().any(|(e, c)| *e == entity_type && *c == column)
}

/// `issues` columns that are NOT NULL with an empty-string default; a null value
/// on write is coerced to `""` rather than rejected (§4.1 field normalization).
pub const ISSUES_NOT_NULL_EMPTY_DEFAULT: &[&str] =
    &["implementer_session", "reviewer_session", "creator_session"];

pub fn coerces_null_to_empty(entity_type: &str, column: &str) -> bool {
    entity_type == "issues" && ISSUES_NOT_NULL_EMPTY_DEFAULT.contains(&column)
}

/// The entity type whose hard delete must cascade a soft delete into a dependent
/// table because the store does not enforce foreign-key cascades (§4.1 `delete`).
pub const CASCADE_PARENT_ENTITY_TYPE: &str = "boards";
pub const CASCADE_DEPENDENT_TABLE: &str = "positions";
pub const CASCADE_DEPENDENT_FK_COLUMN: &str = "board_id";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_known_aliases() {
        assert_eq!(normalize_entity_type("issue"), Some("issues"));
        assert_eq!(normalize_entity_type("dependency"), Some("issue_dependencies"));
    }

    #[test]
    fn rejects_unknown_entity_type() {
        assert_eq!(normalize_entity_type("widgets"), None);
    }

    #[test]
    fn maps_known_actions() {
        assert_eq!(map_action_type("handoff"), ActionType::Create);
        assert_eq!(map_action_type("board_unposition"), ActionType::SoftDelete);
        assert_eq!(map_action_type("restore"), ActionType::Restore);
    }

    #[test]
    fn unknown_action_defaults_to_update() {
        assert_eq!(map_action_type("rename_field"), ActionType::Update);
    }

    #[test]
    fn labels_is_the_only_csv_column() {
        assert!(is_csv_array_column("issues", "labels"));
        assert!(!is_csv_array_column("issues", "tags"));
        assert!(!is_csv_array_column("files", "labels"));
    }
}
