//! Sync bridge cycle and its background loop

use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::auth::{authenticate, endpoint_url};
use super::payload::build_payload;
use super::transport::{HttpTransport, PostRequest};
use crate::config::{secs, SettingsStore, DEFAULT_BRIDGE_DURATION};
use crate::entity::EntityDatabase;
use crate::error::Result;

/// Pushes the entity snapshot to the backend
pub struct SyncBridge {
    database: Arc<EntityDatabase>,
    settings: Arc<dyn SettingsStore>,
    transport: Arc<HttpTransport>,
}

impl SyncBridge {
    pub fn new(
        database: Arc<EntityDatabase>,
        settings: Arc<dyn SettingsStore>,
        transport: Arc<HttpTransport>,
    ) -> Self {
        Self {
            database,
            settings,
            transport,
        }
    }

    pub fn settings(&self) -> &Arc<dyn SettingsStore> {
        &self.settings
    }

    pub fn transport(&self) -> &Arc<HttpTransport> {
        &self.transport
    }

    /// Log in and persist the token
    pub async fn authenticate(&self) -> Result<String> {
        authenticate(&self.transport, self.settings.as_ref()).await
    }

    /// One cycle: send, and on 401/403 log in and resend exactly once
    pub async fn send_once(&self) -> Result<(u16, String)> {
        let settings = self.settings.load()?;
        let endpoint = endpoint_url(&settings);
        let payload = build_payload(&self.database);
        let body = serde_json::to_string(&payload)?;
        debug!("Bridge payload: {} things", payload.things.len());

        let mut request = PostRequest::new(&endpoint, body.clone());
        request.token = settings.token.as_deref();
        let reply = self.transport.post_json(request).await?;

        if reply.status != 401 && reply.status != 403 {
            info!("Bridge send status={}", reply.status);
            return Ok((reply.status, reply.body));
        }

        warn!("Bridge send rejected ({}), re-authenticating", reply.status);
        let token = self.authenticate().await?;

        let mut retry = PostRequest::new(&endpoint, body);
        retry.token = Some(&token);
        retry.note = Some("retry after auth");
        let reply = self.transport.post_json(retry).await?;
        info!("Bridge resend status={}", reply.status);
        Ok((reply.status, reply.body))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BridgeStatus {
    pub running: bool,
}

struct RunningLoop {
    token: CancellationToken,
    task: JoinHandle<()>,
}

/// Owns the periodic bridge task
pub struct BridgeRunner {
    bridge: Arc<SyncBridge>,
    running: Mutex<Option<RunningLoop>>,
}

impl BridgeRunner {
    pub fn new(bridge: Arc<SyncBridge>) -> Self {
        Self {
            bridge,
            running: Mutex::new(None),
        }
    }

    pub fn bridge(&self) -> &Arc<SyncBridge> {
        &self.bridge
    }

    /// Spawn the loop; `false` if it is already running
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self) -> bool {
        let mut running = self.running.lock();
        if running.as_ref().is_some_and(|r| !r.task.is_finished()) {
            return false;
        }

        let token = CancellationToken::new();
        let task = tokio::spawn(run_loop(self.bridge.clone(), token.clone()));
        *running = Some(RunningLoop { token, task });
        info!("Bridge runner started");
        true
    }

    /// Cancel the loop and wait for it; `false` if it was not running
    ///
    /// An in-flight HTTP call finishes (or times out) first.
    pub async fn stop(&self) -> bool {
        let taken = self.running.lock().take();
        let Some(running) = taken else {
            return false;
        };
        running.token.cancel();
        if let Err(e) = running.task.await {
            warn!("Bridge task failed: {}", e);
        }
        info!("Bridge runner stopped");
        true
    }

    pub fn status(&self) -> BridgeStatus {
        let running = self
            .running
            .lock()
            .as_ref()
            .is_some_and(|r| !r.task.is_finished());
        BridgeStatus { running }
    }

    /// Single cycle outside the loop
    pub async fn trigger_once(&self) -> Result<(u16, String)> {
        self.bridge.send_once().await
    }
}

async fn run_loop(bridge: Arc<SyncBridge>, token: CancellationToken) {
    let period = match bridge.settings().duration() {
        Ok(period) => period,
        Err(e) => {
            warn!(
                "Bridge period unavailable ({}), using {}s",
                e, DEFAULT_BRIDGE_DURATION
            );
            DEFAULT_BRIDGE_DURATION
        },
    };
    info!("Bridge loop period {}s", period);

    let mut iteration: u64 = 0;
    while !token.is_cancelled() {
        iteration += 1;
        match bridge.send_once().await {
            Ok((status, _)) => debug!("Bridge iteration {} status={}", iteration, status),
            Err(e) => error!("Bridge iteration {} failed: {}", iteration, e),
        }

        if period > 0.0 && period.is_finite() {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(secs(period)) => {},
            }
        } else {
            token.cancelled().await;
        }
    }
    info!("Bridge loop exited after {} iterations", iteration);
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::config::{BridgeSettings, MemorySettingsStore};
    use crate::diagnostics::{ErrorReporter, ExchangeLog};
    use std::time::Duration;

    fn bridge(dir: &tempfile::TempDir, duration: f64) -> Arc<SyncBridge> {
        let reporter = ErrorReporter::new(dir.path().join("error.log"), Duration::from_secs(60));
        let database = Arc::new(EntityDatabase::new(Arc::new(reporter)));
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let settings = BridgeSettings {
            url: format!("http://127.0.0.1:{}", port),
            ..Default::default()
        };
        let store = Arc::new(MemorySettingsStore::with_duration(settings, duration));
        let transport =
            Arc::new(HttpTransport::new(Duration::from_secs(1), Arc::new(ExchangeLog::new(16))).unwrap());
        Arc::new(SyncBridge::new(database, store, transport))
    }

    #[tokio::test]
    async fn test_start_stop_status() {
        let dir = tempfile::tempdir().unwrap();
        let runner = BridgeRunner::new(bridge(&dir, 60.0));
        assert!(!runner.status().running);
        assert!(!runner.stop().await);

        assert!(runner.start());
        assert!(!runner.start());
        assert!(runner.status().running);

        tokio::time::sleep(Duration::from_millis(100)).await;
        let started = std::time::Instant::now();
        assert!(runner.stop().await);
        assert!(started.elapsed() < Duration::from_millis(500));
        assert!(!runner.status().running);
    }

    #[tokio::test]
    async fn test_failed_cycles_keep_loop_alive() {
        let dir = tempfile::tempdir().unwrap();
        let bridge = bridge(&dir, 0.05);
        let runner = BridgeRunner::new(bridge.clone());
        assert!(runner.start());
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(runner.status().running);
        assert!(runner.stop().await);

        let entries = bridge.transport().exchanges().tail(100);
        assert!(entries.len() >= 2);
        assert!(entries.iter().all(|e| e.status.is_none()));
    }

    #[tokio::test]
    async fn test_non_positive_period_waits_for_stop() {
        let dir = tempfile::tempdir().unwrap();
        let bridge = bridge(&dir, 0.0);
        let runner = BridgeRunner::new(bridge.clone());
        assert!(runner.start());
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(bridge.transport().exchanges().len(), 1);
        assert!(runner.stop().await);
    }
}
