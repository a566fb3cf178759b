//! Bounded logs of recent request/response exchanges

use std::collections::{BTreeMap, VecDeque};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;

/// Default capacity of the poll exchange log
pub const DEFAULT_POLL_CAPACITY: usize = 2000;
/// Default capacity of the bridge exchange log
pub const DEFAULT_BRIDGE_CAPACITY: usize = 500;

/// Ring buffer; the oldest entry is evicted once capacity is reached
pub struct ExchangeLog<T> {
    capacity: usize,
    entries: Mutex<VecDeque<T>>,
}

impl<T: Clone> ExchangeLog<T> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            entries: Mutex::new(VecDeque::with_capacity(capacity.min(256))),
        }
    }

    pub fn push(&self, entry: T) {
        let mut entries = self.entries.lock();
        while entries.len() >= self.capacity {
            entries.pop_front();
        }
        entries.push_back(entry);
    }

    /// Up to `limit` most recent entries, oldest first
    pub fn tail(&self, limit: usize) -> Vec<T> {
        let entries = self.entries.lock();
        let skip = entries.len().saturating_sub(limit);
        entries.iter().skip(skip).cloned().collect()
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ExchangeStatus {
    #[serde(rename = "OK")]
    Ok,
    #[serde(rename = "error")]
    Error,
}

/// One Modbus poll cycle
#[derive(Debug, Clone, Serialize)]
pub struct PollExchange {
    pub ts: DateTime<Utc>,
    pub poller_id: String,
    pub request: Option<String>,
    pub response: Option<String>,
    pub status: ExchangeStatus,
    pub note: Option<String>,
}

/// One HTTP exchange with the remote backend
///
/// `status` is `None` when the request never got a response.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BridgeExchange {
    pub ts: DateTime<Utc>,
    pub endpoint: String,
    pub status: Option<u16>,
    pub content_type: Option<String>,
    pub request: Option<String>,
    pub response: Option<String>,
    pub request_headers: BTreeMap<String, String>,
    pub response_headers: BTreeMap<String, String>,
    pub note: Option<String>,
}
