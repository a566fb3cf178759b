//! Shared building blocks for the bridge services
//!
//! - logging: console + daily rolling file subscriber
//! - hex: frame rendering for diagnostics
//! - shutdown: signal handling wired to cancellation tokens

pub mod hex;
pub mod logging;
pub mod shutdown;

pub use logging::{init_with_config, LogConfig};
pub use shutdown::{cancel_on_shutdown, wait_for_shutdown};
