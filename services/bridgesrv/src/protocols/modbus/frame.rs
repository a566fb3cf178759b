//! MBAP framing for Modbus TCP

use bytes::{BufMut, Bytes, BytesMut};

use super::constants::{MAX_MBAP_LENGTH, MBAP_HEADER_LEN, MODBUS_PROTOCOL_ID};
use super::pdu::ModbusPdu;
use crate::error::ModbusError;

/// MBAP (Modbus Application Protocol) header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MbapHeader {
    pub transaction_id: u16,
    /// Always 0 for Modbus
    pub protocol_id: u16,
    /// Byte count of unit id + PDU
    pub length: u16,
    pub unit_id: u8,
}

impl MbapHeader {
    pub fn new(transaction_id: u16, unit_id: u8, pdu_length: usize) -> Self {
        Self {
            transaction_id,
            protocol_id: MODBUS_PROTOCOL_ID,
            length: pdu_length as u16 + 1,
            unit_id,
        }
    }

    pub fn write_to(&self, buf: &mut BytesMut) {
        buf.put_u16(self.transaction_id);
        buf.put_u16(self.protocol_id);
        buf.put_u16(self.length);
        buf.put_u8(self.unit_id);
    }

    /// Parse and validate a received header
    pub fn decode(data: &[u8]) -> Result<Self, ModbusError> {
        if data.len() < MBAP_HEADER_LEN {
            return Err(ModbusError::framing(format!(
                "MBAP header too short: {} bytes",
                data.len()
            )));
        }

        let header = Self {
            transaction_id: u16::from_be_bytes([data[0], data[1]]),
            protocol_id: u16::from_be_bytes([data[2], data[3]]),
            length: u16::from_be_bytes([data[4], data[5]]),
            unit_id: data[6],
        };

        if header.protocol_id != MODBUS_PROTOCOL_ID {
            return Err(ModbusError::framing(format!(
                "Invalid protocol ID: {}",
                header.protocol_id
            )));
        }
        // At least unit id + function code
        if header.length < 2 || header.length as usize > MAX_MBAP_LENGTH {
            return Err(ModbusError::framing(format!(
                "Invalid MBAP length: {}",
                header.length
            )));
        }

        Ok(header)
    }

    /// Number of PDU bytes following the header
    pub fn pdu_length(&self) -> usize {
        self.length.saturating_sub(1) as usize
    }
}

/// Header + PDU as one contiguous request frame
pub fn encode_frame(transaction_id: u16, unit_id: u8, pdu: &ModbusPdu) -> Bytes {
    let mut buf = BytesMut::with_capacity(MBAP_HEADER_LEN + pdu.len());
    MbapHeader::new(transaction_id, unit_id, pdu.len()).write_to(&mut buf);
    buf.put_slice(pdu.as_slice());
    buf.freeze()
}
