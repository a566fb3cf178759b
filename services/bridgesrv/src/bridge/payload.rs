//! Outbound payload

use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::Value;

use crate::entity::EntityDatabase;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ThingValue {
    pub value: String,
}

/// `{"op": "put", "things": {name: {"value": "..."}}}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PutPayload {
    pub op: String,
    pub things: BTreeMap<String, ThingValue>,
}

/// Text form of an entity value; null becomes ""
pub fn value_to_string(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        other => other.to_string(),
    }
}

/// Snapshot every named entity; unnamed ones are skipped
pub fn build_payload(database: &EntityDatabase) -> PutPayload {
    let mut things = BTreeMap::new();
    for poller in database.list_pollers() {
        for entity in poller.things {
            let Some(name) = entity.name.filter(|n| !n.is_empty()) else {
                continue;
            };
            things.insert(
                name,
                ThingValue {
                    value: value_to_string(&entity.value),
                },
            );
        }
    }
    PutPayload {
        op: "put".to_string(),
        things,
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::diagnostics::ErrorReporter;
    use crate::entity::{Entity, PollerEntities};
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;

    fn database(dir: &tempfile::TempDir) -> EntityDatabase {
        let reporter = ErrorReporter::new(dir.path().join("error.log"), Duration::from_secs(60));
        EntityDatabase::new(Arc::new(reporter))
    }

    #[test]
    fn test_payload_exact_json() {
        let dir = tempfile::tempdir().unwrap();
        let db = database(&dir);
        db.load(vec![PollerEntities::new(
            "p1",
            vec![
                Entity::new("a").with_name("T1").with_value(1),
                Entity::new("b").with_name("T2").with_value(2),
            ],
        )]);

        let json = serde_json::to_string(&build_payload(&db)).unwrap();
        assert_eq!(
            json,
            r#"{"op":"put","things":{"T1":{"value":"1"},"T2":{"value":"2"}}}"#
        );
    }

    #[test]
    fn test_unnamed_skipped_and_null_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let db = database(&dir);
        db.load(vec![
            PollerEntities::new("p1", vec![Entity::new("a"), Entity::new("b").with_name("B")]),
            PollerEntities::new("p2", vec![Entity::new("c").with_name("C").with_value("on")]),
        ]);

        let payload = build_payload(&db);
        assert_eq!(payload.things.len(), 2);
        assert_eq!(payload.things["B"].value, "");
        assert_eq!(payload.things["C"].value, "on");
    }

    #[test]
    fn test_value_to_string() {
        assert_eq!(value_to_string(&json!(null)), "");
        assert_eq!(value_to_string(&json!(12.5)), "12.5");
        assert_eq!(value_to_string(&json!(true)), "true");
        assert_eq!(value_to_string(&json!("x")), "x");
    }
}
