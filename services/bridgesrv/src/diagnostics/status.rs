//! Latest value/error per poller

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;

/// What a poller reads, as shown to operators
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RequestDescriptor {
    /// `holding` or `input`
    pub function: String,
    pub address: u16,
    pub count: u16,
    pub unit_id: u8,
}

/// Latest known state of one poller
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PollerStatus {
    pub last_value: Option<Vec<u16>>,
    pub last_error: Option<String>,
    pub last_request: Option<RequestDescriptor>,
    pub raw_request_hex: Option<String>,
    pub raw_response_hex: Option<String>,
    pub last_updated: Option<DateTime<Utc>>,
}

/// Partial update; absent fields leave the stored ones untouched
#[derive(Debug, Clone, Default)]
pub struct StatusUpdate {
    pub value: Option<Vec<u16>>,
    pub error: Option<String>,
    pub request: Option<RequestDescriptor>,
    pub raw_request_hex: Option<String>,
    pub raw_response_hex: Option<String>,
}

#[derive(Default)]
pub struct StatusStore {
    entries: Mutex<HashMap<String, PollerStatus>>,
}

impl StatusStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite the latest state of `poller_id`
    ///
    /// A new value clears the previous error.
    pub fn update(&self, poller_id: &str, update: StatusUpdate) {
        let mut entries = self.entries.lock();
        let entry = entries.entry(poller_id.to_string()).or_default();

        if let Some(request) = update.request {
            entry.last_request = Some(request);
        }
        if let Some(value) = update.value {
            entry.last_value = Some(value);
            entry.last_error = None;
        }
        if let Some(error) = update.error {
            entry.last_error = Some(error);
        }
        if let Some(hex) = update.raw_request_hex {
            entry.raw_request_hex = Some(hex);
        }
        if let Some(hex) = update.raw_response_hex {
            entry.raw_response_hex = Some(hex);
        }
        entry.last_updated = Some(Utc::now());
    }

    pub fn get(&self, poller_id: &str) -> Option<PollerStatus> {
        self.entries.lock().get(poller_id).cloned()
    }

    /// Copy of every entry, ordered by poller id
    pub fn snapshot(&self) -> BTreeMap<String, PollerStatus> {
        self.entries
            .lock()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    fn descriptor() -> RequestDescriptor {
        RequestDescriptor {
            function: "holding".to_string(),
            address: 100,
            count: 2,
            unit_id: 1,
        }
    }

    #[test]
    fn test_value_clears_error() {
        let store = StatusStore::new();
        store.update(
            "1-p",
            StatusUpdate {
                error: Some("timeout".to_string()),
                ..Default::default()
            },
        );
        assert_eq!(store.get("1-p").unwrap().last_error.as_deref(), Some("timeout"));

        store.update(
            "1-p",
            StatusUpdate {
                value: Some(vec![1, 2]),
                ..Default::default()
            },
        );
        let status = store.get("1-p").unwrap();
        assert_eq!(status.last_value, Some(vec![1, 2]));
        assert!(status.last_error.is_none());
    }

    #[test]
    fn test_error_keeps_last_value_and_request() {
        let store = StatusStore::new();
        store.update(
            "1-p",
            StatusUpdate {
                request: Some(descriptor()),
                value: Some(vec![7]),
                raw_request_hex: Some("0x00 0x01".to_string()),
                ..Default::default()
            },
        );
        store.update(
            "1-p",
            StatusUpdate {
                error: Some("refused".to_string()),
                ..Default::default()
            },
        );

        let status = store.get("1-p").unwrap();
        assert_eq!(status.last_value, Some(vec![7]));
        assert_eq!(status.last_request, Some(descriptor()));
        assert_eq!(status.raw_request_hex.as_deref(), Some("0x00 0x01"));
        assert!(status.last_updated.is_some());
    }

    #[test]
    fn test_snapshot_is_a_copy() {
        let store = StatusStore::new();
        store.update("b", StatusUpdate::default());
        store.update("a", StatusUpdate::default());

        let snapshot = store.snapshot();
        store.clear();
        assert_eq!(snapshot.keys().collect::<Vec<_>>(), vec!["a", "b"]);
        assert!(store.snapshot().is_empty());
    }
}
