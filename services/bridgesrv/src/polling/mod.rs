//! Periodic register polling

pub mod manager;
pub mod poller;

pub use manager::PollingManager;
pub use poller::{PollCallback, PollSinks, PollerHandle, RegisterPoller};
