//! Builds pollers from a polling configuration and owns their lifecycle

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::info;

use super::poller::{PollCallback, PollSinks, PollerHandle, RegisterPoller};
use crate::config::PollingConfig;
use crate::protocols::modbus::ConnectionPool;

/// How long `stop` waits for each poller task
const STOP_WAIT: Duration = Duration::from_secs(1);

pub struct PollingManager {
    pool: Arc<ConnectionPool>,
    sinks: PollSinks,
    callback: Option<PollCallback>,
    handles: Mutex<Vec<PollerHandle>>,
    running: AtomicBool,
}

impl PollingManager {
    pub fn new(pool: Arc<ConnectionPool>, sinks: PollSinks) -> Self {
        Self {
            pool,
            sinks,
            callback: None,
            handles: Mutex::new(Vec::new()),
            running: AtomicBool::new(false),
        }
    }

    /// Callback handed to every poller started afterwards
    pub fn with_callback(mut self, callback: PollCallback) -> Self {
        self.callback = Some(callback);
        self
    }

    /// Start one task per configured poller; `false` if already running
    pub async fn start(&self, config: &PollingConfig) -> bool {
        let mut handles = self.handles.lock().await;
        if !handles.is_empty() {
            return false;
        }

        for plan in config.plans() {
            let client = self
                .pool
                .get_client(
                    plan.hw_mode,
                    &plan.host,
                    plan.port,
                    plan.timeout,
                    plan.unit_id,
                    plan.retries,
                )
                .await;

            let mut poller = RegisterPoller::new(&plan, client, self.sinks.clone());
            if let Some(callback) = &self.callback {
                poller = poller.with_callback(callback.clone());
            }
            handles.push(poller.spawn());
        }

        self.running.store(!handles.is_empty(), Ordering::SeqCst);
        info!("Polling started: {} pollers", handles.len());
        true
    }

    /// Stop every poller, wait briefly, close pooled connections
    ///
    /// Returns `false` when nothing was running.
    pub async fn stop(&self) -> bool {
        let stopping: Vec<PollerHandle> = {
            let mut handles = self.handles.lock().await;
            std::mem::take(&mut *handles)
        };
        self.running.store(false, Ordering::SeqCst);
        if stopping.is_empty() {
            return false;
        }

        for handle in &stopping {
            handle.stop();
        }
        let count = stopping.len();
        for handle in stopping {
            handle.join(STOP_WAIT).await;
        }

        self.pool.close_all().await;
        info!("Polling stopped: {} pollers", count);
        true
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub async fn poller_ids(&self) -> Vec<String> {
        self.handles
            .lock()
            .await
            .iter()
            .map(|h| h.id().to_string())
            .collect()
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::diagnostics::{ErrorReporter, ExchangeLog, StatusStore};
    use crate::entity::EntityDatabase;
    use serde_json::json;

    fn manager(dir: &tempfile::TempDir) -> PollingManager {
        let reporter = ErrorReporter::new(dir.path().join("error.log"), Duration::from_secs(60));
        PollingManager::new(
            Arc::new(ConnectionPool::new()),
            PollSinks {
                status: Arc::new(StatusStore::new()),
                exchanges: Arc::new(ExchangeLog::new(64)),
                database: Arc::new(EntityDatabase::new(Arc::new(reporter))),
            },
        )
    }

    fn mock_config() -> PollingConfig {
        serde_json::from_value(json!({
            "devices": [{
                "hw_mode": "mock",
                "unit_id": 2,
                "pollers": [
                    {"id": "a", "count": 2, "interval": 0.05},
                    {"id": "b", "function": "input", "interval": 0.05}
                ]
            }]
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn test_start_stop_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(&dir);
        assert!(!manager.is_running());
        assert!(!manager.stop().await);

        assert!(manager.start(&mock_config()).await);
        assert!(manager.is_running());
        assert!(!manager.start(&mock_config()).await);
        assert_eq!(manager.poller_ids().await, vec!["2-a", "2-b"]);

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(manager.stop().await);
        assert!(!manager.is_running());
        assert!(manager.poller_ids().await.is_empty());

        let status = manager.sinks.status.snapshot();
        assert_eq!(status["2-a"].last_value, Some(vec![0, 0]));
        assert_eq!(status["2-b"].last_value, Some(vec![0]));
    }

    #[tokio::test]
    async fn test_restart_after_stop() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(&dir);
        assert!(manager.start(&mock_config()).await);
        assert!(manager.stop().await);
        assert!(manager.start(&mock_config()).await);
        assert!(manager.stop().await);
    }
}
