//! Entity database: semantic entities backed by Modbus registers

pub mod database;
pub mod types;

pub use database::{EntityDatabase, LoadReport, PollMeta};
pub use types::{Entity, IndexEntry, PollerEntities};
