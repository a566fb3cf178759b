//! Modbus TCP constants
//!
//! Size limits follow from the 253-byte PDU ceiling of the Modbus application
//! protocol (RS485 ADU of 256 bytes minus address and CRC).

// ============================================================================
// Frame Size Constants
// ============================================================================

/// MBAP header length as sent on the wire
/// Format: Transaction ID(2) + Protocol ID(2) + Length(2) + Unit ID(1) = 7 bytes
pub const MBAP_HEADER_LEN: usize = 7;

/// Protocol identifier carried in every MBAP header
pub const MODBUS_PROTOCOL_ID: u16 = 0;

/// Maximum PDU (function code + data) size
pub const MAX_PDU_SIZE: usize = 253;

/// Maximum MBAP length field value (Unit ID + PDU)
/// = 1 (Unit ID) + 253 (Max PDU) = 254
pub const MAX_MBAP_LENGTH: usize = 1 + MAX_PDU_SIZE;

// ============================================================================
// Register Operation Limits
// ============================================================================

/// Maximum number of registers for FC03/FC04
///
/// Response PDU: 1 (FC) + 1 (byte count) + N × 2 ≤ 253 → N ≤ 125
pub const MODBUS_MAX_READ_REGISTERS: u16 = 125;

/// Maximum number of registers for FC16
///
/// Request PDU: 1 (FC) + 2 (addr) + 2 (qty) + 1 (byte count) + N × 2 ≤ 253 → N ≤ 123
pub const MODBUS_MAX_WRITE_REGISTERS: u16 = 123;

// ============================================================================
// Function Codes
// ============================================================================

pub const FC_READ_HOLDING_REGISTERS: u8 = 0x03;
pub const FC_READ_INPUT_REGISTERS: u8 = 0x04;
pub const FC_WRITE_SINGLE_REGISTER: u8 = 0x06;
pub const FC_WRITE_MULTIPLE_REGISTERS: u8 = 0x10;

/// High bit of the function code marks an exception response
pub const EXCEPTION_FLAG: u8 = 0x80;

/// Standard name of a Modbus exception code
pub fn exception_name(code: u8) -> &'static str {
    match code {
        0x01 => "Illegal Function",
        0x02 => "Illegal Data Address",
        0x03 => "Illegal Data Value",
        0x04 => "Server Device Failure",
        0x05 => "Acknowledge",
        0x06 => "Server Device Busy",
        0x08 => "Memory Parity Error",
        0x0A => "Gateway Path Unavailable",
        0x0B => "Gateway Target Device Failed To Respond",
        _ => "Unknown Exception",
    }
}
