//! Entity and poller definitions as loaded from configuration

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

/// Accept `"40001"`, `40001` or `null` for identifier fields
pub(crate) fn de_id<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::Null => Ok(String::new()),
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "expected string or number id, got {}",
            other
        ))),
    }
}

/// A named value exposed to the remote backend ("thing")
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    /// Entity id; unique across the database
    #[serde(default, deserialize_with = "de_id")]
    pub mbid: String,

    /// Name used as key in the outbound payload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default)]
    pub value: Value,

    /// Position within the owning poller's read result (number or numeric string)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub register_index: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub meta: Map<String, Value>,

    /// Fields this service does not interpret, kept for round trips
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Entity {
    pub fn new(mbid: impl Into<String>) -> Self {
        Self {
            mbid: mbid.into(),
            ..Default::default()
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_value(mut self, value: impl Into<Value>) -> Self {
        self.value = value.into();
        self
    }

    pub fn with_register_index(mut self, index: usize) -> Self {
        self.register_index = Some(Value::from(index));
        self
    }

    /// Resolved register index; `None` when absent, negative or non-numeric
    pub fn register_index(&self) -> Option<usize> {
        match self.register_index.as_ref()? {
            Value::Number(n) => n.as_u64().map(|v| v as usize),
            Value::String(s) => s.trim().parse::<usize>().ok(),
            _ => None,
        }
    }
}

/// A poller's entity list
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PollerEntities {
    #[serde(default, deserialize_with = "de_id")]
    pub id: String,

    #[serde(default)]
    pub things: Vec<Entity>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl PollerEntities {
    pub fn new(id: impl Into<String>, things: Vec<Entity>) -> Self {
        Self {
            id: id.into(),
            things,
            extra: Map::new(),
        }
    }
}

/// Index lookup result
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IndexEntry {
    pub poller_id: String,
    pub entity: Entity,
}
