//! Operational diagnostics
//!
//! Nothing here feeds back into data-path decisions; each store has its own
//! lock independent of the entity database.

pub mod error_reporter;
pub mod exchange;
pub mod status;

pub use error_reporter::ErrorReporter;
pub use exchange::{BridgeExchange, ExchangeLog, ExchangeStatus, PollExchange};
pub use status::{PollerStatus, RequestDescriptor, StatusStore, StatusUpdate};
