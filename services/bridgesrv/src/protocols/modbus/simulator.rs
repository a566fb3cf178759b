//! Modbus TCP simulator for testing
//!
//! A small in-process server answering FC03/FC04/FC06/FC16. Registers that were
//! never written read back as their position within the request plus one, so a
//! read of `count` registers yields `1..=count`.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::constants::{
    EXCEPTION_FLAG, FC_READ_HOLDING_REGISTERS, FC_READ_INPUT_REGISTERS,
    FC_WRITE_MULTIPLE_REGISTERS, FC_WRITE_SINGLE_REGISTER, MBAP_HEADER_LEN,
    MODBUS_MAX_READ_REGISTERS,
};
use super::frame::MbapHeader;

/// Misbehaviour injected into responses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimulatorFault {
    /// Answer with transaction id + 1
    TransactionIdMismatch,
    /// Answer every request with this exception code
    Exception(u8),
    /// Close the connection instead of answering
    Disconnect,
}

#[derive(Default)]
struct SimState {
    holding: HashMap<u16, u16>,
    input: HashMap<u16, u16>,
    received_transaction_ids: Vec<u16>,
    received_at: Vec<Instant>,
    response_delay: Option<Duration>,
    fault: Option<SimulatorFault>,
    /// How many requests the fault applies to; `None` means all
    fault_budget: Option<usize>,
    connections: usize,
}

impl SimState {
    fn take_fault(&mut self) -> Option<SimulatorFault> {
        let fault = self.fault?;
        match self.fault_budget {
            Some(0) => {
                self.fault = None;
                None
            },
            Some(n) => {
                self.fault_budget = Some(n - 1);
                Some(fault)
            },
            None => Some(fault),
        }
    }
}

/// Simple Modbus TCP simulator
#[derive(Clone, Default)]
pub struct ModbusSimulator {
    state: Arc<Mutex<SimState>>,
    shutdown: CancellationToken,
}

impl ModbusSimulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_holding_register(&self, address: u16, value: u16) {
        self.state.lock().holding.insert(address, value);
    }

    pub fn set_input_register(&self, address: u16, value: u16) {
        self.state.lock().input.insert(address, value);
    }

    pub fn holding_register(&self, address: u16) -> Option<u16> {
        self.state.lock().holding.get(&address).copied()
    }

    /// Inject a fault for every following request
    pub fn set_fault(&self, fault: Option<SimulatorFault>) {
        let mut state = self.state.lock();
        state.fault = fault;
        state.fault_budget = None;
    }

    /// Inject a fault for the next `times` requests only
    pub fn set_fault_times(&self, fault: SimulatorFault, times: usize) {
        let mut state = self.state.lock();
        state.fault = Some(fault);
        state.fault_budget = Some(times);
    }

    /// Transaction ids of every request seen so far
    pub fn received_transaction_ids(&self) -> Vec<u16> {
        self.state.lock().received_transaction_ids.clone()
    }

    /// Arrival time of every request seen so far
    pub fn request_times(&self) -> Vec<Instant> {
        self.state.lock().received_at.clone()
    }

    /// Hold each answer back for `delay`, emulating a slow device
    pub fn set_response_delay(&self, delay: Option<Duration>) {
        self.state.lock().response_delay = delay;
    }

    /// Number of accepted TCP connections
    pub fn connection_count(&self) -> usize {
        self.state.lock().connections
    }

    /// Bind on 127.0.0.1 (port 0 picks a free port) and serve in the background
    pub async fn start(&self, port: u16) -> std::io::Result<SocketAddr> {
        let listener = TcpListener::bind(("127.0.0.1", port)).await?;
        let local_addr = listener.local_addr()?;
        info!("Modbus simulator listening on {}", local_addr);

        let sim = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = sim.shutdown.cancelled() => break,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, addr)) => {
                            debug!("Simulator connection from {}", addr);
                            sim.state.lock().connections += 1;
                            let conn_sim = sim.clone();
                            tokio::spawn(async move { conn_sim.handle_connection(stream).await });
                        },
                        Err(e) => {
                            debug!("Simulator accept error: {}", e);
                            break;
                        },
                    },
                }
            }
        });

        Ok(local_addr)
    }

    /// Stop accepting and close open connections
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    async fn handle_connection(&self, mut stream: TcpStream) {
        loop {
            let mut header_buf = [0u8; MBAP_HEADER_LEN];
            let read = tokio::select! {
                _ = self.shutdown.cancelled() => return,
                read = stream.read_exact(&mut header_buf) => read,
            };
            if read.is_err() {
                return;
            }
            let Ok(header) = MbapHeader::decode(&header_buf) else {
                return;
            };
            let mut pdu = vec![0u8; header.pdu_length()];
            if stream.read_exact(&mut pdu).await.is_err() {
                return;
            }

            let (response, delay) = {
                let mut state = self.state.lock();
                state.received_transaction_ids.push(header.transaction_id);
                state.received_at.push(Instant::now());
                let delay = state.response_delay;
                let response = match state.take_fault() {
                    Some(SimulatorFault::Disconnect) => None,
                    Some(SimulatorFault::TransactionIdMismatch) => Some(build_response(
                        header.transaction_id.wrapping_add(1),
                        header.unit_id,
                        &answer(&mut state, &pdu),
                    )),
                    Some(SimulatorFault::Exception(code)) => Some(build_response(
                        header.transaction_id,
                        header.unit_id,
                        &[pdu.first().copied().unwrap_or(0) | EXCEPTION_FLAG, code],
                    )),
                    None => Some(build_response(
                        header.transaction_id,
                        header.unit_id,
                        &answer(&mut state, &pdu),
                    )),
                };
                (response, delay)
            };

            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }

            match response {
                Some(bytes) => {
                    if stream.write_all(&bytes).await.is_err() {
                        return;
                    }
                },
                None => return,
            }
        }
    }
}

fn be_u16(data: &[u8], offset: usize) -> Option<u16> {
    Some(u16::from_be_bytes([*data.get(offset)?, *data.get(offset + 1)?]))
}

/// Response PDU for a request PDU
fn answer(state: &mut SimState, pdu: &[u8]) -> Vec<u8> {
    let Some(&function) = pdu.first() else {
        return vec![EXCEPTION_FLAG, 0x01];
    };
    let (Some(address), Some(quantity)) = (be_u16(pdu, 1), be_u16(pdu, 3)) else {
        return vec![function | EXCEPTION_FLAG, 0x03];
    };

    match function {
        FC_READ_HOLDING_REGISTERS | FC_READ_INPUT_REGISTERS => {
            if quantity == 0 || quantity > MODBUS_MAX_READ_REGISTERS {
                return vec![function | EXCEPTION_FLAG, 0x03];
            }
            let table = if function == FC_READ_HOLDING_REGISTERS {
                &state.holding
            } else {
                &state.input
            };
            let mut out = vec![function, (quantity * 2) as u8];
            for i in 0..quantity {
                let value = table
                    .get(&address.wrapping_add(i))
                    .copied()
                    .unwrap_or(i + 1);
                out.extend_from_slice(&value.to_be_bytes());
            }
            out
        },
        FC_WRITE_SINGLE_REGISTER => {
            state.holding.insert(address, quantity);
            pdu[..5].to_vec()
        },
        FC_WRITE_MULTIPLE_REGISTERS => {
            for i in 0..quantity {
                if let Some(value) = be_u16(pdu, 6 + i as usize * 2) {
                    state.holding.insert(address.wrapping_add(i), value);
                }
            }
            pdu[..5].to_vec()
        },
        other => vec![other | EXCEPTION_FLAG, 0x01],
    }
}

fn build_response(transaction_id: u16, unit_id: u8, pdu: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(MBAP_HEADER_LEN + pdu.len());
    out.extend_from_slice(&transaction_id.to_be_bytes());
    out.extend_from_slice(&[0x00, 0x00]);
    out.extend_from_slice(&(pdu.len() as u16 + 1).to_be_bytes());
    out.push(unit_id);
    out.extend_from_slice(pdu);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_answer_sequential_fallback() {
        let mut state = SimState::default();
        let out = answer(&mut state, &[0x03, 0x00, 0x10, 0x00, 0x03]);
        assert_eq!(out, vec![0x03, 0x06, 0x00, 0x01, 0x00, 0x02, 0x00, 0x03]);
    }

    #[test]
    fn test_answer_write_then_read() {
        let mut state = SimState::default();
        let echo = answer(&mut state, &[0x06, 0x00, 0x05, 0x12, 0x34]);
        assert_eq!(echo, vec![0x06, 0x00, 0x05, 0x12, 0x34]);
        let out = answer(&mut state, &[0x03, 0x00, 0x05, 0x00, 0x01]);
        assert_eq!(out, vec![0x03, 0x02, 0x12, 0x34]);
    }

    #[test]
    fn test_unknown_function_is_exception() {
        let mut state = SimState::default();
        assert_eq!(answer(&mut state, &[0x2B, 0, 0, 0, 0]), vec![0xAB, 0x01]);
    }

    #[test]
    fn test_fault_budget_runs_out() {
        let mut state = SimState {
            fault: Some(SimulatorFault::Disconnect),
            fault_budget: Some(1),
            ..Default::default()
        };
        assert_eq!(state.take_fault(), Some(SimulatorFault::Disconnect));
        assert_eq!(state.take_fault(), None);
    }
}
