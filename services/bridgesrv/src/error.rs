//! Error handling for the bridge service
//!
//! Two layers: [`ModbusError`] describes a single failed protocol transaction,
//! [`BridgeError`] is the service-level error every public operation returns.

use thiserror::Error;

use crate::protocols::modbus::constants::exception_name;

// ============================================================================
// Protocol layer
// ============================================================================

/// Failure of one Modbus TCP transaction
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ModbusError {
    /// Socket-level failure (connect, send, receive, peer closed)
    #[error("Connection error: {0}")]
    Connection(String),

    /// Connect or I/O exceeded the configured timeout
    #[error("Timeout error: {0}")]
    Timeout(String),

    /// Malformed header, short body or transaction id mismatch
    #[error("Framing error: {0}")]
    Framing(String),

    /// Device answered with the exception bit set
    #[error("Modbus exception: function 0x{function:02X}, code 0x{code:02X} ({})", exception_name(*code))]
    Exception { function: u8, code: u8 },

    /// Request rejected before any I/O
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Response carried a different function code than the request
    #[error("Unexpected function code: expected 0x{expected:02X}, got 0x{actual:02X}")]
    UnexpectedFunction { expected: u8, actual: u8 },
}

impl ModbusError {
    pub fn connection(msg: impl Into<String>) -> Self {
        ModbusError::Connection(msg.into())
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        ModbusError::Timeout(msg.into())
    }

    pub fn framing(msg: impl Into<String>) -> Self {
        ModbusError::Framing(msg.into())
    }

    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        ModbusError::InvalidArgument(msg.into())
    }

    /// Only transport failures are worth a reconnect and retry
    pub fn is_retryable(&self) -> bool {
        matches!(self, ModbusError::Connection(_) | ModbusError::Timeout(_))
    }
}

impl From<std::io::Error> for ModbusError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::TimedOut => ModbusError::Timeout(err.to_string()),
            _ => ModbusError::Connection(err.to_string()),
        }
    }
}

// ============================================================================
// Service layer
// ============================================================================

/// Bridge service error type
#[derive(Error, Debug)]
pub enum BridgeError {
    /// Configuration errors (parse, validation, missing fields)
    #[error("Configuration error: {0}")]
    Config(String),

    /// File system errors
    #[error("IO error: {0}")]
    Io(String),

    /// Field protocol errors
    #[error(transparent)]
    Modbus(#[from] ModbusError),

    /// Transport errors talking to the remote backend
    #[error("HTTP error: {0}")]
    Http(String),

    /// Login rejected or no token in the response
    #[error("Authentication error: {0}")]
    Auth(String),

    /// Serialization and conversion errors
    #[error("Data error: {0}")]
    Data(String),
}

/// Result type alias for the bridge service
pub type Result<T> = std::result::Result<T, BridgeError>;

impl BridgeError {
    pub fn config(msg: impl Into<String>) -> Self {
        BridgeError::Config(msg.into())
    }

    pub fn io(msg: impl Into<String>) -> Self {
        BridgeError::Io(msg.into())
    }

    pub fn http(msg: impl Into<String>) -> Self {
        BridgeError::Http(msg.into())
    }

    pub fn auth(msg: impl Into<String>) -> Self {
        BridgeError::Auth(msg.into())
    }

    pub fn data(msg: impl Into<String>) -> Self {
        BridgeError::Data(msg.into())
    }
}

// ============================================================================
// Conversions
// ============================================================================

impl From<std::io::Error> for BridgeError {
    fn from(err: std::io::Error) -> Self {
        BridgeError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for BridgeError {
    fn from(err: serde_json::Error) -> Self {
        BridgeError::Data(format!("JSON: {}", err))
    }
}

impl From<figment::Error> for BridgeError {
    fn from(err: figment::Error) -> Self {
        BridgeError::Config(err.to_string())
    }
}

impl From<reqwest::Error> for BridgeError {
    fn from(err: reqwest::Error) -> Self {
        BridgeError::Http(err.to_string())
    }
}
