//! Composition root
//!
//! Builds the shared stores once and hands references to the pollers and the
//! bridge. Everything a REST facade or the CLI needs goes through here.

use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tracing::info;

use crate::bridge::{BridgeRunner, BridgeStatus, HttpTransport, SyncBridge};
use crate::config::{EntityConfig, JsonSettingsFile, PollingConfig, ServiceConfig, SettingsStore};
use crate::diagnostics::{
    BridgeExchange, ErrorReporter, ExchangeLog, PollExchange, PollerStatus, StatusStore,
};
use crate::entity::{EntityDatabase, IndexEntry, LoadReport, PollerEntities};
use crate::error::{BridgeError, Result};
use crate::polling::{PollCallback, PollSinks, PollingManager};
use crate::protocols::modbus::ConnectionPool;

/// Named read-only views for operational inspection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InspectView {
    Database,
    Index,
    Status,
    Packets,
    BridgePackets,
    Settings,
}

impl InspectView {
    pub const ALL: [InspectView; 6] = [
        InspectView::Database,
        InspectView::Index,
        InspectView::Status,
        InspectView::Packets,
        InspectView::BridgePackets,
        InspectView::Settings,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            InspectView::Database => "database",
            InspectView::Index => "index",
            InspectView::Status => "status",
            InspectView::Packets => "packets",
            InspectView::BridgePackets => "bridge-packets",
            InspectView::Settings => "settings",
        }
    }
}

impl FromStr for InspectView {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|v| v.as_str() == s)
            .ok_or_else(|| {
                let names: Vec<&str> = Self::ALL.iter().map(InspectView::as_str).collect();
                BridgeError::data(format!(
                    "unknown view '{}', expected one of: {}",
                    s,
                    names.join(", ")
                ))
            })
    }
}

/// Walk a dotted path (`a.0.b`) into a JSON value
pub fn select_path(mut value: Value, path: &str) -> Result<Value> {
    for segment in path.split('.').filter(|s| !s.is_empty()) {
        value = match value {
            Value::Object(mut map) => map.remove(segment),
            Value::Array(mut items) => segment
                .parse::<usize>()
                .ok()
                .filter(|&i| i < items.len())
                .map(|i| items.swap_remove(i)),
            _ => None,
        }
        .ok_or_else(|| BridgeError::data(format!("path segment '{}' not found", segment)))?;
    }
    Ok(value)
}

fn to_json<T: Serialize>(value: &T) -> Result<Value> {
    Ok(serde_json::to_value(value)?)
}

pub struct BridgeService {
    config: ServiceConfig,
    database: Arc<EntityDatabase>,
    status: Arc<StatusStore>,
    poll_exchanges: Arc<ExchangeLog<PollExchange>>,
    bridge_exchanges: Arc<ExchangeLog<BridgeExchange>>,
    settings: Arc<dyn SettingsStore>,
    polling: PollingManager,
    runner: BridgeRunner,
}

impl BridgeService {
    /// Settings come from the entity/bridge document named in `config`
    pub fn from_config(config: ServiceConfig) -> Result<Self> {
        let settings = Arc::new(JsonSettingsFile::new(config.entity_config.clone()));
        Self::new(config, settings)
    }

    pub fn new(config: ServiceConfig, settings: Arc<dyn SettingsStore>) -> Result<Self> {
        let reporter = Arc::new(ErrorReporter::new(
            config.error_log.clone(),
            config.error_dedupe_window(),
        ));
        let database = Arc::new(EntityDatabase::new(reporter));
        let status = Arc::new(StatusStore::new());
        let poll_exchanges = Arc::new(ExchangeLog::new(config.poll_exchange_capacity));
        let bridge_exchanges = Arc::new(ExchangeLog::new(config.bridge_exchange_capacity));

        let polling = PollingManager::new(
            Arc::new(ConnectionPool::new()),
            PollSinks {
                status: status.clone(),
                exchanges: poll_exchanges.clone(),
                database: database.clone(),
            },
        );

        let transport = Arc::new(HttpTransport::new(
            config.http_timeout(),
            bridge_exchanges.clone(),
        )?);
        let bridge = Arc::new(SyncBridge::new(database.clone(), settings.clone(), transport));

        Ok(Self {
            config,
            database,
            status,
            poll_exchanges,
            bridge_exchanges,
            settings,
            polling,
            runner: BridgeRunner::new(bridge),
        })
    }

    /// Callback for every poll cycle of pollers started afterwards
    pub fn with_poll_callback(mut self, callback: PollCallback) -> Self {
        self.polling = self.polling.with_callback(callback);
        self
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub fn database(&self) -> &Arc<EntityDatabase> {
        &self.database
    }

    // ========================================================================
    // Entity database
    // ========================================================================

    pub fn list_pollers(&self) -> Vec<PollerEntities> {
        self.database.list_pollers()
    }

    pub fn entity_index_snapshot(&self) -> BTreeMap<String, IndexEntry> {
        self.database.entity_index_snapshot()
    }

    /// Replace the database contents in one step
    pub fn reload(&self, pollers: Vec<PollerEntities>) -> LoadReport {
        self.database.load(pollers)
    }

    /// Load pollers from an entity/bridge document
    pub fn load_entities_from(&self, path: &Path) -> Result<LoadReport> {
        let config = EntityConfig::from_file(path)?;
        info!("Entity config {}: {} pollers", path.display(), config.pollers.len());
        Ok(self.reload(config.pollers))
    }

    /// Load pollers from the configured entity document
    pub fn load_entities_from_file(&self) -> Result<LoadReport> {
        let path = self.config.entity_config.clone();
        self.load_entities_from(&path)
    }

    // ========================================================================
    // Diagnostics
    // ========================================================================

    pub fn status_snapshot(&self) -> BTreeMap<String, PollerStatus> {
        self.status.snapshot()
    }

    pub fn exchange_tail(&self, limit: usize) -> Vec<PollExchange> {
        self.poll_exchanges.tail(limit)
    }

    pub fn bridge_exchange_tail(&self, limit: usize) -> Vec<BridgeExchange> {
        self.bridge_exchanges.tail(limit)
    }

    pub fn clear_exchange_log(&self) {
        self.poll_exchanges.clear();
    }

    pub fn clear_bridge_exchange_log(&self) {
        self.bridge_exchanges.clear();
    }

    // ========================================================================
    // Polling
    // ========================================================================

    /// `false` if polling is already running
    pub async fn start_polling(&self, config: &PollingConfig) -> bool {
        self.polling.start(config).await
    }

    /// Read the configured polling document and start it
    pub async fn start_polling_from_file(&self) -> Result<bool> {
        let config = PollingConfig::from_file(&self.config.polling_config)?;
        Ok(self.start_polling(&config).await)
    }

    /// `false` if nothing was running
    pub async fn stop_polling(&self) -> bool {
        self.polling.stop().await
    }

    pub fn polling_running(&self) -> bool {
        self.polling.is_running()
    }

    // ========================================================================
    // Bridge
    // ========================================================================

    /// `false` if the bridge loop is already running
    pub fn start_bridge(&self) -> bool {
        self.runner.start()
    }

    /// `false` if the bridge loop was not running
    pub async fn stop_bridge(&self) -> bool {
        self.runner.stop().await
    }

    pub fn bridge_status(&self) -> BridgeStatus {
        self.runner.status()
    }

    /// One send cycle: `(http status, response body)`
    pub async fn trigger_bridge_once(&self) -> Result<(u16, String)> {
        self.runner.trigger_once().await
    }

    /// Authenticate and persist the token
    pub async fn login(&self) -> Result<String> {
        self.runner.bridge().authenticate().await
    }

    /// Stop the bridge loop and every poller
    pub async fn shutdown(&self) {
        self.stop_bridge().await;
        self.stop_polling().await;
        info!("Bridge service stopped");
    }

    // ========================================================================
    // Inspection
    // ========================================================================

    /// Render a view as JSON, optionally narrowed by a dotted path
    pub fn inspect(&self, view: InspectView, path: Option<&str>) -> Result<Value> {
        let rendered = match view {
            InspectView::Database => to_json(&self.list_pollers())?,
            InspectView::Index => to_json(&self.entity_index_snapshot())?,
            InspectView::Status => to_json(&self.status_snapshot())?,
            InspectView::Packets => to_json(&self.exchange_tail(self.poll_exchanges.capacity()))?,
            InspectView::BridgePackets => {
                to_json(&self.bridge_exchange_tail(self.bridge_exchanges.capacity()))?
            },
            InspectView::Settings => to_json(&self.settings.load()?.masked())?,
        };
        match path {
            Some(path) => select_path(rendered, path),
            None => Ok(rendered),
        }
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::config::{BridgeSettings, MemorySettingsStore};
    use crate::entity::Entity;
    use serde_json::json;

    fn service(dir: &tempfile::TempDir) -> BridgeService {
        let config = ServiceConfig {
            error_log: dir.path().join("error.log"),
            ..Default::default()
        };
        let settings = BridgeSettings {
            url: "http://backend".to_string(),
            username: Some("u".to_string()),
            password: Some("secret".to_string()),
            token: Some("tok".to_string()),
            ..Default::default()
        };
        BridgeService::new(config, Arc::new(MemorySettingsStore::new(settings))).unwrap()
    }

    #[test]
    fn test_view_names() {
        for view in InspectView::ALL {
            assert_eq!(view.as_str().parse::<InspectView>().unwrap(), view);
        }
        assert!("globals".parse::<InspectView>().is_err());
    }

    #[test]
    fn test_select_path() {
        let value = json!({"a": [{"b": 1}, {"b": 2}]});
        assert_eq!(select_path(value.clone(), "a.1.b").unwrap(), json!(2));
        assert_eq!(select_path(value.clone(), "").unwrap(), value);
        assert!(select_path(value.clone(), "a.5").is_err());
        assert!(select_path(value, "a.x").is_err());
    }

    #[test]
    fn test_inspect_views() {
        let dir = tempfile::tempdir().unwrap();
        let service = service(&dir);
        service.reload(vec![PollerEntities::new(
            "1-p",
            vec![Entity::new("40001").with_name("Temp")],
        )]);

        let name = service
            .inspect(InspectView::Index, Some("40001.entity.name"))
            .unwrap();
        assert_eq!(name, json!("Temp"));

        let settings = service.inspect(InspectView::Settings, None).unwrap();
        assert_eq!(settings["password"], json!("***"));
        assert_eq!(settings["token"], json!("***"));
        assert_eq!(settings["username"], json!("u"));

        assert_eq!(service.inspect(InspectView::Packets, None).unwrap(), json!([]));
    }

    #[tokio::test]
    async fn test_mock_polling_through_facade() {
        let dir = tempfile::tempdir().unwrap();
        let service = service(&dir);
        service.reload(vec![PollerEntities::new(
            "1-p",
            vec![Entity::new("t").with_register_index(0)],
        )]);
        let config: PollingConfig = serde_json::from_value(json!({
            "devices": [{"hw_mode": "mock", "pollers": [{"id": "p", "count": 1, "interval": 0.05}]}]
        }))
        .unwrap();

        assert!(service.start_polling(&config).await);
        assert!(service.polling_running());
        tokio::time::sleep(std::time::Duration::from_millis(120)).await;
        service.shutdown().await;
        assert!(!service.polling_running());

        let entry = service.database().get_by_entity_id("t").unwrap();
        assert_eq!(entry.entity.value, json!(0));
        assert!(!service.exchange_tail(10).is_empty());
        service.clear_exchange_log();
        assert!(service.exchange_tail(10).is_empty());
    }
}
