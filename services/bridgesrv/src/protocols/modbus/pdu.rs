//! Modbus PDU buffer, request builders and response parsers
//!
//! The PDU lives in a fixed-size stack array; builders validate quantities
//! before anything touches the socket.

use tracing::debug;

use super::constants::{
    EXCEPTION_FLAG, FC_READ_HOLDING_REGISTERS, FC_READ_INPUT_REGISTERS,
    FC_WRITE_MULTIPLE_REGISTERS, FC_WRITE_SINGLE_REGISTER, MAX_PDU_SIZE,
    MODBUS_MAX_READ_REGISTERS, MODBUS_MAX_WRITE_REGISTERS,
};
use crate::error::ModbusError;

type Result<T> = std::result::Result<T, ModbusError>;

/// PDU with stack-allocated fixed array
#[derive(Debug, Clone)]
pub struct ModbusPdu {
    data: [u8; MAX_PDU_SIZE],
    len: usize,
}

impl ModbusPdu {
    /// Create an empty PDU
    #[inline]
    pub fn new() -> Self {
        Self {
            data: [0; MAX_PDU_SIZE],
            len: 0,
        }
    }

    /// Create a PDU from a received byte slice
    pub fn from_slice(data: &[u8]) -> Result<Self> {
        if data.len() > MAX_PDU_SIZE {
            return Err(ModbusError::framing(format!(
                "PDU too large: {} bytes (max {})",
                data.len(),
                MAX_PDU_SIZE
            )));
        }

        let mut pdu = Self::new();
        pdu.data[..data.len()].copy_from_slice(data);
        pdu.len = data.len();
        Ok(pdu)
    }

    /// Push a single byte
    #[inline]
    pub fn push(&mut self, byte: u8) -> Result<()> {
        if self.len >= MAX_PDU_SIZE {
            return Err(ModbusError::invalid_argument("PDU buffer full"));
        }
        self.data[self.len] = byte;
        self.len += 1;
        Ok(())
    }

    /// Push u16 in big-endian
    #[inline]
    pub fn push_u16(&mut self, value: u16) -> Result<()> {
        self.push((value >> 8) as u8)?;
        self.push((value & 0xFF) as u8)
    }

    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.len]
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Function code (first byte)
    #[inline]
    pub fn function_code(&self) -> Option<u8> {
        if self.len > 0 {
            Some(self.data[0])
        } else {
            None
        }
    }

    #[inline]
    pub fn is_exception(&self) -> bool {
        self.function_code()
            .map(|fc| fc & EXCEPTION_FLAG != 0)
            .unwrap_or(false)
    }

    #[inline]
    pub fn exception_code(&self) -> Option<u8> {
        if self.is_exception() && self.len > 1 {
            Some(self.data[1])
        } else {
            None
        }
    }

    /// Human-readable function code description
    pub fn function_code_description(fc: u8) -> &'static str {
        match fc & !EXCEPTION_FLAG {
            0x03 => "Read Holding Registers",
            0x04 => "Read Input Registers",
            0x06 => "Write Single Register",
            0x10 => "Write Multiple Registers",
            _ => "Unknown Function",
        }
    }
}

impl Default for ModbusPdu {
    fn default() -> Self {
        Self::new()
    }
}

/// PDU builder - fluent API
#[derive(Default)]
pub struct PduBuilder {
    pdu: ModbusPdu,
}

impl PduBuilder {
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn function_code(mut self, fc: u8) -> Result<Self> {
        self.pdu.push(fc)?;
        Ok(self)
    }

    #[inline]
    pub fn address(mut self, addr: u16) -> Result<Self> {
        self.pdu.push_u16(addr)?;
        Ok(self)
    }

    #[inline]
    pub fn quantity(mut self, qty: u16) -> Result<Self> {
        self.pdu.push_u16(qty)?;
        Ok(self)
    }

    #[inline]
    pub fn byte(mut self, b: u8) -> Result<Self> {
        self.pdu.push(b)?;
        Ok(self)
    }

    /// Append register values big-endian
    pub fn registers(mut self, values: &[u16]) -> Result<Self> {
        for value in values {
            self.pdu.push_u16(*value)?;
        }
        Ok(self)
    }

    pub fn build(self) -> ModbusPdu {
        if let Some(fc) = self.pdu.function_code() {
            debug!(
                "PDU built: FC={:02X} ({}), total_len={}",
                fc,
                ModbusPdu::function_code_description(fc),
                self.pdu.len()
            );
        }
        self.pdu
    }
}

// ============================================================================
// Request builders
// ============================================================================

/// FC03/FC04 request. Count must be 1..=125.
pub fn build_read_request(function: u8, address: u16, count: u16) -> Result<ModbusPdu> {
    if function != FC_READ_HOLDING_REGISTERS && function != FC_READ_INPUT_REGISTERS {
        return Err(ModbusError::invalid_argument(format!(
            "Not a register read function: 0x{:02X}",
            function
        )));
    }
    if count == 0 || count > MODBUS_MAX_READ_REGISTERS {
        return Err(ModbusError::invalid_argument(format!(
            "Read count must be 1..={}, got {}",
            MODBUS_MAX_READ_REGISTERS, count
        )));
    }

    Ok(PduBuilder::new()
        .function_code(function)?
        .address(address)?
        .quantity(count)?
        .build())
}

/// FC06 request
pub fn build_write_single_request(address: u16, value: u16) -> Result<ModbusPdu> {
    Ok(PduBuilder::new()
        .function_code(FC_WRITE_SINGLE_REGISTER)?
        .address(address)?
        .quantity(value)?
        .build())
}

/// FC16 request. Value count must be 1..=123.
pub fn build_write_multiple_request(address: u16, values: &[u16]) -> Result<ModbusPdu> {
    if values.is_empty() || values.len() > MODBUS_MAX_WRITE_REGISTERS as usize {
        return Err(ModbusError::invalid_argument(format!(
            "Write count must be 1..={}, got {}",
            MODBUS_MAX_WRITE_REGISTERS,
            values.len()
        )));
    }

    let count = values.len() as u16;
    Ok(PduBuilder::new()
        .function_code(FC_WRITE_MULTIPLE_REGISTERS)?
        .address(address)?
        .quantity(count)?
        .byte((count * 2) as u8)?
        .registers(values)?
        .build())
}

// ============================================================================
// Response parsers
// ============================================================================

/// Map exception and function-code mismatch onto errors
fn check_function(pdu: &ModbusPdu, expected: u8) -> Result<()> {
    let fc = pdu
        .function_code()
        .ok_or_else(|| ModbusError::framing("Empty response PDU"))?;

    if pdu.is_exception() {
        return Err(ModbusError::Exception {
            function: fc & !EXCEPTION_FLAG,
            code: pdu.exception_code().unwrap_or(0),
        });
    }
    if fc != expected {
        return Err(ModbusError::UnexpectedFunction {
            expected,
            actual: fc,
        });
    }
    Ok(())
}

/// Decode an FC03/FC04 response into exactly `count` registers
pub fn parse_read_response(pdu: &ModbusPdu, function: u8, count: u16) -> Result<Vec<u16>> {
    check_function(pdu, function)?;

    let data = pdu.as_slice();
    if data.len() < 2 {
        return Err(ModbusError::framing("Read response missing byte count"));
    }
    let byte_count = data[1] as usize;
    let payload = &data[2..];
    if payload.len() < byte_count {
        return Err(ModbusError::framing(format!(
            "Byte count {} exceeds payload {}",
            byte_count,
            payload.len()
        )));
    }
    if byte_count != count as usize * 2 {
        return Err(ModbusError::framing(format!(
            "Expected {} data bytes for {} registers, got {}",
            count as usize * 2,
            count,
            byte_count
        )));
    }

    Ok(payload[..byte_count]
        .chunks_exact(2)
        .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
        .collect())
}

/// Validate an FC06/FC16 echo response
pub fn parse_write_response(pdu: &ModbusPdu, function: u8) -> Result<()> {
    check_function(pdu, function)?;
    if pdu.len() < 5 {
        return Err(ModbusError::framing(format!(
            "Write response too short: {} bytes",
            pdu.len()
        )));
    }
    Ok(())
}
