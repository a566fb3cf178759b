//! Modbus TCP client stack
//!
//! - `constants` / `pdu` / `frame`: wire encoding
//! - `client`: one transaction per call over a managed socket
//! - `pool`: descriptor-keyed client reuse plus the simulated mode
//! - `simulator`: in-process Modbus TCP server

pub mod client;
pub mod constants;
pub mod frame;
pub mod pdu;
pub mod pool;
pub mod simulator;

pub use client::{ModbusTcpClient, RegisterClient, SimulatedClient};
pub use pool::{ConnectionKey, ConnectionPool, HardwareMode};
pub use simulator::ModbusSimulator;
