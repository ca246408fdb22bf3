//! Field-level comparison of local and server snapshots.

use std::collections::BTreeSet;

use serde_json::{Map, Value};

use crate::models::WHOLE_ENTITY_FIELD;

/// Fields that diverged between `local` and `server`, sorted by name.
///
/// With a common ancestor a field conflicts only when both sides moved away
/// from the ancestor value and did not land on the same value. Without one,
/// every field present locally whose value differs on the server is reported.
/// Fields absent from the local snapshot are treated as untouched.
///
/// Snapshots that are not JSON objects (a deleted entity on either side) are
/// compared as a whole and reported as `*`.
pub fn detect(local: &Value, server: &Value, base: Option<&Value>) -> Vec<String> {
    let (Some(local), Some(server)) = (local.as_object(), server.as_object()) else {
        return if local == server {
            Vec::new()
        } else {
            vec![WHOLE_ENTITY_FIELD.to_string()]
        };
    };

    let base = base.and_then(Value::as_object);
    local
        .keys()
        .collect::<BTreeSet<_>>()
        .into_iter()
        .filter(|field| field_conflicts(field, local, server, base))
        .cloned()
        .collect()
}

fn field_conflicts(
    field: &str,
    local: &Map<String, Value>,
    server: &Map<String, Value>,
    base: Option<&Map<String, Value>>,
) -> bool {
    let local_value = local.get(field);
    let server_value = server.get(field);
    if local_value == server_value {
        return false;
    }

    match base {
        Some(base) => {
            let ancestor = base.get(field);
            local_value != ancestor && server_value != ancestor
        }
        None => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn without_base_reports_every_differing_field() {
        let local = json!({ "title": "Write report", "priority": 2, "done": false });
        let server = json!({ "title": "Write summary", "priority": 2, "done": true });
        assert_eq!(detect(&local, &server, None), vec!["done", "title"]);
    }

    #[test]
    fn with_base_ignores_one_sided_changes() {
        let base = json!({ "title": "Draft", "priority": 1, "done": false });
        let local = json!({ "title": "Final", "priority": 1, "done": false });
        let server = json!({ "title": "Draft", "priority": 3, "done": false });
        assert!(detect(&local, &server, Some(&base)).is_empty());
    }

    #[test]
    fn with_base_reports_fields_changed_on_both_sides() {
        let base = json!({ "title": "Draft", "priority": 1 });
        let local = json!({ "title": "Final", "priority": 2 });
        let server = json!({ "title": "Published", "priority": 1 });
        assert_eq!(detect(&local, &server, Some(&base)), vec!["title"]);
    }

    #[test]
    fn identical_edits_do_not_conflict() {
        let base = json!({ "title": "Draft" });
        let local = json!({ "title": "Final" });
        let server = json!({ "title": "Final" });
        assert!(detect(&local, &server, Some(&base)).is_empty());
    }

    #[test]
    fn server_only_fields_are_ignored() {
        let local = json!({ "title": "a" });
        let server = json!({ "title": "a", "updated_at": 99 });
        assert!(detect(&local, &server, None).is_empty());
    }

    #[test]
    fn deleted_side_is_a_whole_entity_conflict() {
        let server = json!({ "title": "still here" });
        assert_eq!(detect(&Value::Null, &server, None), vec!["*"]);
        assert_eq!(detect(&server, &Value::Null, None), vec!["*"]);
        assert!(detect(&Value::Null, &Value::Null, None).is_empty());
    }
}
