//! Modbus TCP client
//!
//! One request is in flight per connection: the connection lock is held from
//! transaction id assignment until the response has been validated.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use common::hex::encode_upper;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{debug, info, trace, warn};

use super::constants::{
    FC_READ_HOLDING_REGISTERS, FC_READ_INPUT_REGISTERS, FC_WRITE_MULTIPLE_REGISTERS,
    FC_WRITE_SINGLE_REGISTER, MBAP_HEADER_LEN,
};
use super::frame::{encode_frame, MbapHeader};
use super::pdu::{
    build_read_request, build_write_multiple_request, build_write_single_request,
    parse_read_response, parse_write_response, ModbusPdu,
};
use crate::error::ModbusError;

type Result<T> = std::result::Result<T, ModbusError>;

/// Raw frames of the most recent transaction, kept for diagnostics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LastFrames {
    pub request: Option<Vec<u8>>,
    pub response: Option<Vec<u8>>,
}

/// Register-level Modbus operations
///
/// `unit_id` overrides the client's default unit when given.
#[async_trait]
pub trait RegisterClient: Send + Sync {
    /// Open the connection if it is not open yet
    async fn connect(&self) -> Result<()>;

    /// Drop the connection; the next operation reconnects
    async fn close(&self);

    fn is_connected(&self) -> bool;

    /// FC03
    async fn read_holding_registers(
        &self,
        address: u16,
        count: u16,
        unit_id: Option<u8>,
    ) -> Result<Vec<u16>>;

    /// FC04
    async fn read_input_registers(
        &self,
        address: u16,
        count: u16,
        unit_id: Option<u8>,
    ) -> Result<Vec<u16>>;

    /// FC06
    async fn write_single_register(&self, address: u16, value: u16, unit_id: Option<u8>)
        -> Result<()>;

    /// FC16
    async fn write_multiple_registers(
        &self,
        address: u16,
        values: &[u16],
        unit_id: Option<u8>,
    ) -> Result<()>;

    /// Request/response of the last transaction, success or not
    fn last_frames(&self) -> LastFrames;

    /// FC03/FC04 read returning the frames of this transaction alongside the result
    ///
    /// Clients shared between pollers override this to capture the frames
    /// before another request can replace them.
    async fn read_with_frames(
        &self,
        function: u8,
        address: u16,
        count: u16,
        unit_id: Option<u8>,
    ) -> (Result<Vec<u16>>, LastFrames) {
        let result = match function {
            FC_READ_HOLDING_REGISTERS => {
                self.read_holding_registers(address, count, unit_id).await
            },
            FC_READ_INPUT_REGISTERS => self.read_input_registers(address, count, unit_id).await,
            other => Err(ModbusError::invalid_argument(format!(
                "Function 0x{:02X} is not a register read",
                other
            ))),
        };
        (result, self.last_frames())
    }
}

// ============================================================================
// TCP client
// ============================================================================

struct ClientState {
    stream: Option<TcpStream>,
    transaction_id: u16,
}

/// Modbus TCP client bound to one connection descriptor
pub struct ModbusTcpClient {
    host: String,
    port: u16,
    timeout: Duration,
    unit_id: u8,
    retries: u32,
    state: Mutex<ClientState>,
    connected: AtomicBool,
    last_frames: parking_lot::Mutex<LastFrames>,
}

impl ModbusTcpClient {
    pub fn new(
        host: impl Into<String>,
        port: u16,
        timeout: Duration,
        unit_id: u8,
        retries: u32,
    ) -> Self {
        Self {
            host: host.into(),
            port,
            timeout,
            unit_id,
            retries,
            state: Mutex::new(ClientState {
                stream: None,
                transaction_id: 0,
            }),
            connected: AtomicBool::new(false),
            last_frames: parking_lot::Mutex::new(LastFrames::default()),
        }
    }

    /// Start the transaction id counter at `last`; the first request uses `last + 1`
    #[cfg(test)]
    fn with_transaction_id(mut self, last: u16) -> Self {
        self.state.get_mut().transaction_id = last;
        self
    }

    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    async fn open(&self, state: &mut ClientState) -> Result<()> {
        let addr = self.endpoint();
        let stream = tokio::time::timeout(self.timeout, TcpStream::connect(addr.as_str()))
            .await
            .map_err(|_| ModbusError::timeout(format!("Connect to {} timed out", addr)))?
            .map_err(|e| ModbusError::connection(format!("Connect to {} failed: {}", addr, e)))?;
        let _ = stream.set_nodelay(true);

        state.stream = Some(stream);
        self.connected.store(true, Ordering::SeqCst);
        info!("Modbus connected: {}", addr);
        Ok(())
    }

    fn drop_stream(&self, state: &mut ClientState) {
        if state.stream.take().is_some() {
            debug!("Modbus connection dropped: {}", self.endpoint());
        }
        self.connected.store(false, Ordering::SeqCst);
    }

    /// Run one request, returning the frames captured under the connection lock
    async fn execute(&self, unit_id: u8, pdu: &ModbusPdu) -> (Result<ModbusPdu>, LastFrames) {
        let mut state = self.state.lock().await;
        let result = self.execute_locked(&mut state, unit_id, pdu).await;
        let frames = self.last_frames.lock().clone();
        (result, frames)
    }

    /// Reconnect-and-retry on transport failures
    async fn execute_locked(
        &self,
        state: &mut ClientState,
        unit_id: u8,
        pdu: &ModbusPdu,
    ) -> Result<ModbusPdu> {
        let attempts = self.retries.max(1);
        let mut last_error = None;

        for attempt in 1..=attempts {
            if state.stream.is_none() {
                if let Err(e) = self.open(state).await {
                    warn!(
                        "Modbus {} attempt {}/{}: {}",
                        self.endpoint(),
                        attempt,
                        attempts,
                        e
                    );
                    last_error = Some(e);
                    continue;
                }
            }

            match self.transact(state, unit_id, pdu).await {
                Ok(response) => return Ok(response),
                Err(e) if e.is_retryable() => {
                    warn!(
                        "Modbus {} attempt {}/{}: {}",
                        self.endpoint(),
                        attempt,
                        attempts,
                        e
                    );
                    self.drop_stream(state);
                    last_error = Some(e);
                },
                Err(e) => {
                    // The byte stream may be out of step after a bad frame
                    if matches!(e, ModbusError::Framing(_)) {
                        self.drop_stream(state);
                    }
                    return Err(e);
                },
            }
        }

        Err(last_error.unwrap_or_else(|| ModbusError::connection("No attempt was made")))
    }

    async fn transact(
        &self,
        state: &mut ClientState,
        unit_id: u8,
        pdu: &ModbusPdu,
    ) -> Result<ModbusPdu> {
        state.transaction_id = state.transaction_id.wrapping_add(1);
        let tid = state.transaction_id;
        let frame = encode_frame(tid, unit_id, pdu);

        {
            let mut last = self.last_frames.lock();
            last.request = Some(frame.to_vec());
            last.response = None;
        }
        trace!("Modbus TX [{}]: {}", tid, encode_upper(&frame));

        let timeout = self.timeout;
        let stream = state
            .stream
            .as_mut()
            .ok_or_else(|| ModbusError::connection("Not connected"))?;

        tokio::time::timeout(timeout, stream.write_all(&frame))
            .await
            .map_err(|_| ModbusError::timeout("Send timed out"))??;

        let mut header_buf = [0u8; MBAP_HEADER_LEN];
        read_exact_timed(stream, &mut header_buf, timeout).await?;
        let header = MbapHeader::decode(&header_buf)?;

        if header.transaction_id != tid {
            return Err(ModbusError::framing(format!(
                "Transaction id mismatch: sent {}, received {}",
                tid, header.transaction_id
            )));
        }
        if header.unit_id != unit_id {
            debug!(
                "Unit id differs in response: sent {}, received {}",
                unit_id, header.unit_id
            );
        }

        let mut body = vec![0u8; header.pdu_length()];
        read_exact_timed(stream, &mut body, timeout).await?;

        let mut response = Vec::with_capacity(MBAP_HEADER_LEN + body.len());
        response.extend_from_slice(&header_buf);
        response.extend_from_slice(&body);
        trace!("Modbus RX [{}]: {}", tid, encode_upper(&response));
        self.last_frames.lock().response = Some(response);

        ModbusPdu::from_slice(&body)
    }

    async fn read_registers(
        &self,
        function: u8,
        address: u16,
        count: u16,
        unit_id: Option<u8>,
    ) -> (Result<Vec<u16>>, LastFrames) {
        let request = match build_read_request(function, address, count) {
            Ok(request) => request,
            Err(e) => return (Err(e), LastFrames::default()),
        };
        let (response, frames) = self
            .execute(unit_id.unwrap_or(self.unit_id), &request)
            .await;
        let result = response.and_then(|pdu| parse_read_response(&pdu, function, count));
        (result, frames)
    }
}

async fn read_exact_timed(stream: &mut TcpStream, buf: &mut [u8], timeout: Duration) -> Result<()> {
    match tokio::time::timeout(timeout, stream.read_exact(buf)).await {
        Err(_) => Err(ModbusError::timeout("Receive timed out")),
        Ok(Err(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            Err(ModbusError::connection("Connection closed by peer"))
        },
        Ok(Err(e)) => Err(e.into()),
        Ok(Ok(_)) => Ok(()),
    }
}

#[async_trait]
impl RegisterClient for ModbusTcpClient {
    async fn connect(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.stream.is_some() {
            return Ok(());
        }
        self.open(&mut state).await
    }

    async fn close(&self) {
        let mut state = self.state.lock().await;
        if let Some(mut stream) = state.stream.take() {
            let _ = stream.shutdown().await;
            info!("Modbus closed: {}", self.endpoint());
        }
        self.connected.store(false, Ordering::SeqCst);
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn read_holding_registers(
        &self,
        address: u16,
        count: u16,
        unit_id: Option<u8>,
    ) -> Result<Vec<u16>> {
        self.read_registers(FC_READ_HOLDING_REGISTERS, address, count, unit_id)
            .await
            .0
    }

    async fn read_input_registers(
        &self,
        address: u16,
        count: u16,
        unit_id: Option<u8>,
    ) -> Result<Vec<u16>> {
        self.read_registers(FC_READ_INPUT_REGISTERS, address, count, unit_id)
            .await
            .0
    }

    async fn write_single_register(
        &self,
        address: u16,
        value: u16,
        unit_id: Option<u8>,
    ) -> Result<()> {
        let request = build_write_single_request(address, value)?;
        let response = self
            .execute(unit_id.unwrap_or(self.unit_id), &request)
            .await
            .0?;
        parse_write_response(&response, FC_WRITE_SINGLE_REGISTER)
    }

    async fn write_multiple_registers(
        &self,
        address: u16,
        values: &[u16],
        unit_id: Option<u8>,
    ) -> Result<()> {
        let request = build_write_multiple_request(address, values)?;
        let response = self
            .execute(unit_id.unwrap_or(self.unit_id), &request)
            .await
            .0?;
        parse_write_response(&response, FC_WRITE_MULTIPLE_REGISTERS)
    }

    fn last_frames(&self) -> LastFrames {
        self.last_frames.lock().clone()
    }

    async fn read_with_frames(
        &self,
        function: u8,
        address: u16,
        count: u16,
        unit_id: Option<u8>,
    ) -> (Result<Vec<u16>>, LastFrames) {
        self.read_registers(function, address, count, unit_id).await
    }
}

// ============================================================================
// Simulated client
// ============================================================================

/// Network-free client returning zero-filled reads
#[derive(Debug, Default)]
pub struct SimulatedClient;

#[async_trait]
impl RegisterClient for SimulatedClient {
    async fn connect(&self) -> Result<()> {
        Ok(())
    }

    async fn close(&self) {}

    fn is_connected(&self) -> bool {
        true
    }

    async fn read_holding_registers(
        &self,
        address: u16,
        count: u16,
        _unit_id: Option<u8>,
    ) -> Result<Vec<u16>> {
        build_read_request(FC_READ_HOLDING_REGISTERS, address, count)?;
        Ok(vec![0; count as usize])
    }

    async fn read_input_registers(
        &self,
        address: u16,
        count: u16,
        _unit_id: Option<u8>,
    ) -> Result<Vec<u16>> {
        build_read_request(FC_READ_INPUT_REGISTERS, address, count)?;
        Ok(vec![0; count as usize])
    }

    async fn write_single_register(
        &self,
        _address: u16,
        _value: u16,
        _unit_id: Option<u8>,
    ) -> Result<()> {
        Ok(())
    }

    async fn write_multiple_registers(
        &self,
        address: u16,
        values: &[u16],
        _unit_id: Option<u8>,
    ) -> Result<()> {
        build_write_multiple_request(address, values)?;
        Ok(())
    }

    fn last_frames(&self) -> LastFrames {
        LastFrames::default()
    }
}
