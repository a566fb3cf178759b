//! Register poller
//!
//! One tokio task per poller. Cycles start on a fixed grid
//! (`next_deadline += interval` before the work), so a slow read does not shift
//! later cycles. The wait between cycles races the cancellation token; an
//! in-flight read is never interrupted.

use std::sync::Arc;
use std::time::Duration;

use common::hex::format_optional_frame;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{PollerPlan, RegisterFunction};
use crate::diagnostics::{
    ExchangeLog, ExchangeStatus, PollExchange, RequestDescriptor, StatusStore, StatusUpdate,
};
use crate::entity::{EntityDatabase, PollMeta};
use crate::error::ModbusError;
use crate::protocols::modbus::RegisterClient;

/// Invoked after each cycle's diagnostics and reconciliation: `(poller_id, result)`
pub type PollCallback =
    Arc<dyn Fn(&str, std::result::Result<&[u16], &ModbusError>) + Send + Sync>;

/// Shared sinks every poller writes into
#[derive(Clone)]
pub struct PollSinks {
    pub status: Arc<StatusStore>,
    pub exchanges: Arc<ExchangeLog<PollExchange>>,
    pub database: Arc<EntityDatabase>,
}

pub struct RegisterPoller {
    id: String,
    client: Arc<dyn RegisterClient>,
    function: RegisterFunction,
    address: u16,
    count: u16,
    unit_id: u8,
    interval: Duration,
    sinks: PollSinks,
    callback: Option<PollCallback>,
}

impl RegisterPoller {
    /// Build a poller and publish its request descriptor to the status store
    pub fn new(plan: &PollerPlan, client: Arc<dyn RegisterClient>, sinks: PollSinks) -> Self {
        let poller = Self {
            id: plan.id.clone(),
            client,
            function: plan.function,
            address: plan.address,
            count: plan.count,
            unit_id: plan.unit_id,
            interval: plan.interval,
            sinks,
            callback: None,
        };
        poller.sinks.status.update(
            &poller.id,
            StatusUpdate {
                request: Some(poller.descriptor()),
                ..Default::default()
            },
        );
        poller
    }

    pub fn with_callback(mut self, callback: PollCallback) -> Self {
        self.callback = Some(callback);
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    fn descriptor(&self) -> RequestDescriptor {
        RequestDescriptor {
            function: self.function.as_str().to_string(),
            address: self.address,
            count: self.count,
            unit_id: self.unit_id,
        }
    }

    /// Start the polling task
    pub fn spawn(self) -> PollerHandle {
        let token = CancellationToken::new();
        let id = self.id.clone();
        let task_token = token.clone();
        let task = tokio::spawn(async move { self.run(task_token).await });
        PollerHandle { id, token, task }
    }

    async fn run(self, token: CancellationToken) {
        info!(
            "Poller {} started: {} @{} x{} every {:?}",
            self.id,
            self.function.as_str(),
            self.address,
            self.count,
            self.interval
        );

        let mut next_deadline = Instant::now();
        while !token.is_cancelled() {
            next_deadline += self.interval;
            self.poll_once().await;

            tokio::select! {
                _ = token.cancelled() => break,
                _ = sleep_until(next_deadline) => {},
            }
        }

        info!("Poller {} stopped", self.id);
    }

    /// One read with diagnostics, reconciliation and callback
    pub async fn poll_once(&self) -> std::result::Result<Vec<u16>, ModbusError> {
        let (result, frames) = self
            .client
            .read_with_frames(
                self.function.function_code(),
                self.address,
                self.count,
                Some(self.unit_id),
            )
            .await;

        let request_hex = format_optional_frame(frames.request.as_deref());
        let response_hex = format_optional_frame(frames.response.as_deref());

        match &result {
            Ok(values) => {
                self.sinks.status.update(
                    &self.id,
                    StatusUpdate {
                        value: Some(values.clone()),
                        request: Some(self.descriptor()),
                        raw_request_hex: request_hex.clone(),
                        raw_response_hex: response_hex.clone(),
                        ..Default::default()
                    },
                );
                self.sinks.exchanges.push(PollExchange {
                    ts: chrono::Utc::now(),
                    poller_id: self.id.clone(),
                    request: request_hex.clone(),
                    response: response_hex.clone(),
                    status: ExchangeStatus::Ok,
                    note: None,
                });

                let meta = PollMeta {
                    base_address: Some(u32::from(self.address)),
                    request: request_hex,
                    response: response_hex,
                };
                let updated = self.sinks.database.reconcile(&self.id, values, &meta);
                debug!("Poller {}: {} entities updated", self.id, updated);
            },
            Err(e) => {
                self.sinks.status.update(
                    &self.id,
                    StatusUpdate {
                        error: Some(e.to_string()),
                        request: Some(self.descriptor()),
                        raw_request_hex: request_hex.clone(),
                        raw_response_hex: response_hex.clone(),
                        ..Default::default()
                    },
                );
                self.sinks.exchanges.push(PollExchange {
                    ts: chrono::Utc::now(),
                    poller_id: self.id.clone(),
                    request: request_hex,
                    response: response_hex,
                    status: ExchangeStatus::Error,
                    note: Some(e.to_string()),
                });
                warn!("Poller {} read failed: {}", self.id, e);
            },
        }

        if let Some(callback) = &self.callback {
            callback(&self.id, result.as_deref());
        }
        result
    }
}

/// Control handle of a running poller
pub struct PollerHandle {
    id: String,
    token: CancellationToken,
    task: JoinHandle<()>,
}

impl PollerHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Request the task to exit after its current read
    pub fn stop(&self) {
        self.token.cancel();
    }

    pub fn stopped(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the task to exit; `false` on timeout
    pub async fn join(self, timeout: Duration) -> bool {
        match tokio::time::timeout(timeout, self.task).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                warn!("Poller {} task failed: {}", self.id, e);
                true
            },
            Err(_) => {
                warn!("Poller {} did not stop within {:?}", self.id, timeout);
                false
            },
        }
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::diagnostics::ErrorReporter;
    use crate::entity::{Entity, PollerEntities};
    use crate::protocols::modbus::pool::HardwareMode;
    use crate::protocols::modbus::SimulatedClient;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn plan(id: &str, interval: Duration) -> PollerPlan {
        PollerPlan {
            id: id.to_string(),
            device_id: "dev".to_string(),
            hw_mode: HardwareMode::Mock,
            host: "127.0.0.1".to_string(),
            port: 502,
            timeout: Duration::from_secs(1),
            retries: 1,
            unit_id: 1,
            function: RegisterFunction::Holding,
            address: 10,
            count: 2,
            interval,
        }
    }

    fn sinks(dir: &tempfile::TempDir) -> PollSinks {
        let reporter = ErrorReporter::new(dir.path().join("error.log"), Duration::from_secs(60));
        PollSinks {
            status: Arc::new(StatusStore::new()),
            exchanges: Arc::new(ExchangeLog::new(16)),
            database: Arc::new(EntityDatabase::new(Arc::new(reporter))),
        }
    }

    #[tokio::test]
    async fn test_new_publishes_descriptor() {
        let dir = tempfile::tempdir().unwrap();
        let sinks = sinks(&dir);
        let _poller = RegisterPoller::new(
            &plan("1-a", Duration::from_secs(1)),
            Arc::new(SimulatedClient),
            sinks.clone(),
        );

        let status = sinks.status.get("1-a").unwrap();
        let request = status.last_request.unwrap();
        assert_eq!(request.function, "holding");
        assert_eq!(request.address, 10);
        assert!(status.last_value.is_none());
    }

    #[tokio::test]
    async fn test_poll_once_updates_everything_before_callback() {
        let dir = tempfile::tempdir().unwrap();
        let sinks = sinks(&dir);
        sinks.database.load(vec![PollerEntities::new(
            "1-a",
            vec![Entity::new("x").with_register_index(1)],
        )]);

        let seen = Arc::new(AtomicUsize::new(0));
        let seen_cb = seen.clone();
        let db = sinks.database.clone();
        let callback: PollCallback =
            Arc::new(move |id: &str, result: Result<&[u16], &ModbusError>| {
                assert_eq!(id, "1-a");
                assert_eq!(result.unwrap(), &[0, 0]);
                // Reconciliation already happened
                assert!(db.get_by_entity_id("x").unwrap().entity.updated_at.is_some());
                seen_cb.fetch_add(1, Ordering::SeqCst);
            });

        let poller = RegisterPoller::new(
            &plan("1-a", Duration::from_secs(1)),
            Arc::new(SimulatedClient),
            sinks.clone(),
        )
        .with_callback(callback);

        assert_eq!(poller.poll_once().await.unwrap(), vec![0, 0]);
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert_eq!(sinks.exchanges.len(), 1);
        assert_eq!(sinks.exchanges.tail(1)[0].status, ExchangeStatus::Ok);
        assert_eq!(sinks.status.get("1-a").unwrap().last_value, Some(vec![0, 0]));
    }

    #[tokio::test]
    async fn test_failure_is_recorded_and_loop_continues() {
        let dir = tempfile::tempdir().unwrap();
        let sinks = sinks(&dir);
        let mut bad = plan("1-bad", Duration::from_millis(20));
        bad.count = 0;

        let poller = RegisterPoller::new(&bad, Arc::new(SimulatedClient), sinks.clone());
        let handle = poller.spawn();
        tokio::time::sleep(Duration::from_millis(90)).await;
        assert!(!handle.is_finished());
        handle.stop();
        assert!(handle.join(Duration::from_secs(1)).await);

        let entries = sinks.exchanges.tail(100);
        assert!(entries.len() >= 2);
        assert!(entries.iter().all(|e| e.status == ExchangeStatus::Error));
        assert!(sinks.status.get("1-bad").unwrap().last_error.is_some());
    }

    #[tokio::test]
    async fn test_stop_mid_wait_is_prompt() {
        let dir = tempfile::tempdir().unwrap();
        let poller = RegisterPoller::new(
            &plan("1-slow", Duration::from_secs(30)),
            Arc::new(SimulatedClient),
            sinks(&dir),
        );
        let handle = poller.spawn();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let started = std::time::Instant::now();
        handle.stop();
        assert!(handle.stopped());
        assert!(handle.join(Duration::from_secs(1)).await);
        assert!(started.elapsed() < Duration::from_millis(100));
    }
}
