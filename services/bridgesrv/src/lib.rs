//! Modbus-to-HTTP bridge service library
//!
//! Polls Modbus TCP devices, maps register values onto named entities and
//! pushes the aggregated entity state to a remote HTTP backend.
//!
//! ```text
//! ┌─────────────────┐    ┌─────────────────┐    ┌─────────────────┐
//! │ RegisterPoller  │───►│ EntityDatabase  │───►│   SyncBridge    │───► remote backend
//! │ (per poller)    │    │ (reconcile)     │    │ (auth + send)   │
//! └─────────────────┘    └─────────────────┘    └─────────────────┘
//!          │
//!          ▼
//! ┌─────────────────┐    ┌─────────────────┐
//! │ ConnectionPool  │    │ StatusStore /   │
//! │ ModbusTcpClient │    │ ExchangeLog     │
//! └─────────────────┘    └─────────────────┘
//! ```

pub mod bridge;
pub mod config;
pub mod diagnostics;
pub mod entity;
pub mod error;
pub mod polling;
pub mod protocols;
pub mod service;

pub use error::{BridgeError, ModbusError, Result};
pub use service::BridgeService;
