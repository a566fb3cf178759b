//! Sync bridge: pushes entity state to the remote backend
//!
//! - `payload`: `{op: "put", things: {...}}` from the entity database
//! - `auth`: login, token discovery and persistence
//! - `transport`: HTTP POST with exchange recording
//! - `runner`: send cycle with 401/403 re-login, periodic loop

pub mod auth;
pub mod payload;
pub mod runner;
pub mod transport;

pub use payload::{build_payload, PutPayload};
pub use runner::{BridgeRunner, BridgeStatus, SyncBridge};
pub use transport::{HttpReply, HttpTransport};
