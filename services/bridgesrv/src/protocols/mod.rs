//! Field protocol implementations

pub mod modbus;
