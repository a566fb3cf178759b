//! Connection pool keyed by connection descriptor
//!
//! Pollers that share (host, port, unit, timeout, retries) share one client and
//! therefore one socket; their transactions are serialized by the client lock.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::client::{ModbusTcpClient, RegisterClient, SimulatedClient};

/// How a device is reached
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HardwareMode {
    /// Real Modbus TCP device
    #[default]
    Tcp,
    /// No network, zero-filled reads
    Mock,
}

/// Pooling key; one client per distinct key
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionKey {
    pub host: String,
    pub port: u16,
    pub unit_id: u8,
    pub timeout_ms: u64,
    pub retries: u32,
}

impl ConnectionKey {
    pub fn new(host: &str, port: u16, unit_id: u8, timeout: Duration, retries: u32) -> Self {
        Self {
            host: host.to_string(),
            port,
            unit_id,
            timeout_ms: timeout.as_millis() as u64,
            retries,
        }
    }
}

#[derive(Default)]
pub struct ConnectionPool {
    clients: Mutex<HashMap<ConnectionKey, Arc<ModbusTcpClient>>>,
}

impl ConnectionPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pooled client for the descriptor, created and connected on first use
    ///
    /// A failed first connect is only logged; reads reconnect on demand.
    pub async fn get_client(
        &self,
        mode: HardwareMode,
        host: &str,
        port: u16,
        timeout: Duration,
        unit_id: u8,
        retries: u32,
    ) -> Arc<dyn RegisterClient> {
        if mode == HardwareMode::Mock {
            return Arc::new(SimulatedClient);
        }

        let key = ConnectionKey::new(host, port, unit_id, timeout, retries);
        let mut clients = self.clients.lock().await;
        if let Some(client) = clients.get(&key) {
            debug!("Reusing Modbus client {}:{} unit {}", host, port, unit_id);
            return client.clone();
        }

        let client = Arc::new(ModbusTcpClient::new(host, port, timeout, unit_id, retries));
        if let Err(e) = client.connect().await {
            warn!("Failed initial connect for {}:{}: {}", host, port, e);
        }
        clients.insert(key, client.clone());
        client
    }

    /// Close every pooled client and empty the pool
    pub async fn close_all(&self) {
        let drained: Vec<_> = {
            let mut clients = self.clients.lock().await;
            clients.drain().map(|(_, client)| client).collect()
        };
        let count = drained.len();
        for client in drained {
            client.close().await;
        }
        if count > 0 {
            info!("Closed {} Modbus connections", count);
        }
    }

    pub async fn len(&self) -> usize {
        self.clients.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.clients.lock().await.is_empty()
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_mode_is_not_pooled() {
        let pool = ConnectionPool::new();
        let client = pool
            .get_client(HardwareMode::Mock, "ignored", 502, Duration::from_secs(1), 1, 1)
            .await;
        assert_eq!(client.read_holding_registers(10, 3, None).await.unwrap(), vec![0, 0, 0]);
        assert!(pool.is_empty().await);
    }

    #[tokio::test]
    async fn test_same_descriptor_reuses_client_even_when_unreachable() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let pool = ConnectionPool::new();
        let timeout = Duration::from_millis(200);
        let a = pool
            .get_client(HardwareMode::Tcp, "127.0.0.1", port, timeout, 1, 1)
            .await;
        let b = pool
            .get_client(HardwareMode::Tcp, "127.0.0.1", port, timeout, 1, 1)
            .await;
        let c = pool
            .get_client(HardwareMode::Tcp, "127.0.0.1", port, timeout, 2, 1)
            .await;

        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(pool.len().await, 2);

        pool.close_all().await;
        assert!(pool.is_empty().await);
    }

    #[test]
    fn test_hardware_mode_serde() {
        let mode: HardwareMode = serde_json::from_str("\"mock\"").unwrap();
        assert_eq!(mode, HardwareMode::Mock);
        assert_eq!(HardwareMode::default(), HardwareMode::Tcp);
    }
}
