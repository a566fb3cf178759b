//! Configuration for the bridge service
//!
//! - [`ServiceConfig`]: process settings, layered with figment
//! - [`PollingConfig`]: devices and their register pollers
//! - [`EntityConfig`]: entity lists per poller plus the remote backend settings
//! - [`SettingsStore`]: where bridge settings are read and the token is persisted

use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::{
    providers::{Env, Format, Json, Serialized, Toml},
    Figment,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::entity::types::{de_id, PollerEntities};
use crate::error::{BridgeError, Result};
use crate::protocols::modbus::constants::{FC_READ_HOLDING_REGISTERS, FC_READ_INPUT_REGISTERS};
use crate::protocols::modbus::HardwareMode;

/// Bridge period when the document does not set `duration`
pub const DEFAULT_BRIDGE_DURATION: f64 = 30.0;

/// Seconds from configuration to a `Duration`; negative or non-finite becomes zero
pub fn secs(value: f64) -> Duration {
    Duration::try_from_secs_f64(value).unwrap_or(Duration::ZERO)
}

// ============================================================================
// Service configuration
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Default log level when RUST_LOG is unset
    pub log_level: String,
    /// Directory for rolling log files; console only when unset
    pub log_dir: Option<PathBuf>,
    pub log_json: bool,
    /// Devices and pollers
    pub polling_config: PathBuf,
    /// Entities and remote backend settings
    pub entity_config: PathBuf,
    /// Missing-entity diagnostic log
    pub error_log: PathBuf,
    pub error_dedupe_secs: u64,
    pub poll_exchange_capacity: usize,
    pub bridge_exchange_capacity: usize,
    /// Per-request HTTP timeout in seconds
    pub http_timeout_secs: f64,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_dir: None,
            log_json: false,
            polling_config: PathBuf::from("config/polling.json"),
            entity_config: PathBuf::from("config/entities.json"),
            error_log: PathBuf::from("error.log"),
            error_dedupe_secs: 60,
            poll_exchange_capacity: crate::diagnostics::exchange::DEFAULT_POLL_CAPACITY,
            bridge_exchange_capacity: crate::diagnostics::exchange::DEFAULT_BRIDGE_CAPACITY,
            http_timeout_secs: 10.0,
        }
    }
}

impl ServiceConfig {
    pub fn http_timeout(&self) -> Duration {
        secs(self.http_timeout_secs)
    }

    pub fn error_dedupe_window(&self) -> Duration {
        Duration::from_secs(self.error_dedupe_secs)
    }
}

/// Load service configuration
///
/// Priority (highest to lowest):
/// 1. `BRIDGESRV_*` environment variables
/// 2. `explicit` file (TOML or JSON by extension)
/// 3. `bridgesrv.toml` in the working directory
/// 4. Defaults
pub fn load_service_config(explicit: Option<&Path>) -> Result<ServiceConfig> {
    let mut figment = Figment::from(Serialized::defaults(ServiceConfig::default()))
        .merge(Toml::file("bridgesrv.toml"));

    if let Some(path) = explicit {
        if !path.exists() {
            return Err(BridgeError::config(format!(
                "Config file not found: {}",
                path.display()
            )));
        }
        figment = match path.extension().and_then(|s| s.to_str()) {
            Some("json") => figment.merge(Json::file(path)),
            Some("toml") => figment.merge(Toml::file(path)),
            other => {
                return Err(BridgeError::config(format!(
                    "Unsupported config file format: {}",
                    other.unwrap_or("<none>")
                )))
            },
        };
    }

    let config: ServiceConfig = figment.merge(Env::prefixed("BRIDGESRV_")).extract()?;
    debug!("Service config: {:?}", config);
    Ok(config)
}

// ============================================================================
// Polling configuration
// ============================================================================

/// Register table a poller reads
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegisterFunction {
    /// FC03
    #[default]
    Holding,
    /// FC04
    Input,
}

impl RegisterFunction {
    pub fn as_str(&self) -> &'static str {
        match self {
            RegisterFunction::Holding => "holding",
            RegisterFunction::Input => "input",
        }
    }

    pub fn function_code(&self) -> u8 {
        match self {
            RegisterFunction::Holding => FC_READ_HOLDING_REGISTERS,
            RegisterFunction::Input => FC_READ_INPUT_REGISTERS,
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    502
}
fn default_timeout() -> f64 {
    3.0
}
fn default_retries() -> u32 {
    1
}
fn default_unit_id() -> u8 {
    1
}
fn default_count() -> u16 {
    1
}
fn default_interval() -> f64 {
    1.0
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PollerConfig {
    #[serde(default, deserialize_with = "de_id")]
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub function: RegisterFunction,
    #[serde(default)]
    pub address: u16,
    #[serde(default = "default_count")]
    pub count: u16,
    /// Seconds between cycle starts
    #[serde(default = "default_interval")]
    pub interval: f64,
    /// Ignored; the device's unit id applies
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit_id: Option<u8>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceConfig {
    #[serde(default, deserialize_with = "de_id")]
    pub id: String,
    #[serde(default)]
    pub hw_mode: HardwareMode,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Seconds
    #[serde(default = "default_timeout")]
    pub timeout: f64,
    #[serde(default = "default_retries")]
    pub retries: u32,
    #[serde(default = "default_unit_id")]
    pub unit_id: u8,
    #[serde(default)]
    pub pollers: Vec<PollerConfig>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PollingConfig {
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,
}

/// Everything needed to run one poller
#[derive(Debug, Clone, PartialEq)]
pub struct PollerPlan {
    /// `"{unit_id}-{local_id}"`
    pub id: String,
    pub device_id: String,
    pub hw_mode: HardwareMode,
    pub host: String,
    pub port: u16,
    pub timeout: Duration,
    pub retries: u32,
    pub unit_id: u8,
    pub function: RegisterFunction,
    pub address: u16,
    pub count: u16,
    pub interval: Duration,
}

impl PollingConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(BridgeError::config(format!(
                "Polling config not found: {}",
                path.display()
            )));
        }
        let config: PollingConfig = Figment::new().merge(Json::file(path)).extract()?;
        info!(
            "Polling config {}: {} devices",
            path.display(),
            config.devices.len()
        );
        Ok(config)
    }

    /// Flatten devices into per-poller plans
    pub fn plans(&self) -> Vec<PollerPlan> {
        let mut plans = Vec::new();
        let mut position = 0usize;

        for device in &self.devices {
            for poller in &device.pollers {
                position += 1;
                if let Some(unit) = poller.unit_id {
                    if unit != device.unit_id {
                        warn!(
                            "Poller unit_id {} ignored, device {} uses unit {}",
                            unit, device.id, device.unit_id
                        );
                    }
                }

                let local_id = if !poller.id.trim().is_empty() {
                    poller.id.clone()
                } else if let Some(name) = poller.name.as_ref().filter(|n| !n.trim().is_empty()) {
                    name.clone()
                } else {
                    format!("poller-{}", position)
                };

                let interval = if poller.interval > 0.0 && poller.interval.is_finite() {
                    secs(poller.interval)
                } else {
                    warn!(
                        "Poller {} interval {} invalid, using {}s",
                        local_id,
                        poller.interval,
                        default_interval()
                    );
                    secs(default_interval())
                };

                plans.push(PollerPlan {
                    id: format!("{}-{}", device.unit_id, local_id),
                    device_id: device.id.clone(),
                    hw_mode: device.hw_mode,
                    host: device.host.clone(),
                    port: device.port,
                    timeout: secs(device.timeout),
                    retries: device.retries,
                    unit_id: device.unit_id,
                    function: poller.function,
                    address: poller.address,
                    count: poller.count,
                    interval,
                });
            }
        }

        plans
    }
}

// ============================================================================
// Entity and bridge configuration
// ============================================================================

fn default_auth_path() -> String {
    "auth".to_string()
}

fn default_duration() -> f64 {
    DEFAULT_BRIDGE_DURATION
}

/// Remote backend settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BridgeSettings {
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub context: String,
    #[serde(rename = "authPath", default = "default_auth_path")]
    pub auth_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            url: String::new(),
            context: String::new(),
            auth_path: default_auth_path(),
            username: None,
            password: None,
            token: None,
            extra: Map::new(),
        }
    }
}

impl BridgeSettings {
    /// Reject settings that cannot reach or log into the backend
    pub fn validate(&self) -> Result<()> {
        let mut missing = Vec::new();
        if self.url.trim().is_empty() {
            missing.push("url");
        }
        if self.username.as_deref().map_or(true, str::is_empty) {
            missing.push("username");
        }
        if self.password.as_deref().map_or(true, str::is_empty) {
            missing.push("password");
        }
        if missing.is_empty() {
            Ok(())
        } else {
            Err(BridgeError::config(format!(
                "settings missing: {}",
                missing.join(", ")
            )))
        }
    }

    /// Copy safe to show to operators
    pub fn masked(&self) -> Self {
        let mask = |v: &Option<String>| v.as_ref().map(|_| "***".to_string());
        Self {
            password: mask(&self.password),
            token: mask(&self.token),
            ..self.clone()
        }
    }
}

/// Entity/bridge document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityConfig {
    #[serde(default)]
    pub pollers: Vec<PollerEntities>,
    #[serde(default)]
    pub settings: BridgeSettings,
    /// Bridge period in seconds; `<= 0` waits until stopped
    #[serde(default = "default_duration")]
    pub duration: f64,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Default for EntityConfig {
    fn default() -> Self {
        Self {
            pollers: Vec::new(),
            settings: BridgeSettings::default(),
            duration: DEFAULT_BRIDGE_DURATION,
            extra: Map::new(),
        }
    }
}

impl EntityConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            BridgeError::config(format!("Cannot read {}: {}", path.display(), e))
        })?;
        Ok(serde_json::from_str(&content)?)
    }
}

/// Write JSON to `path` through a temp file in the same directory
pub fn write_json_atomic(path: &Path, document: &Value) -> Result<()> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    std::fs::create_dir_all(&dir)?;

    let mut temp = tempfile::NamedTempFile::new_in(&dir)?;
    serde_json::to_writer_pretty(temp.as_file_mut(), document)?;
    temp.as_file_mut().sync_all()?;
    temp.persist(path)
        .map_err(|e| BridgeError::io(format!("Cannot replace {}: {}", path.display(), e)))?;
    Ok(())
}

// ============================================================================
// Settings store
// ============================================================================

/// Source of bridge settings and sink for the cached token
pub trait SettingsStore: Send + Sync {
    fn load(&self) -> Result<BridgeSettings>;

    fn store_token(&self, token: &str) -> Result<()>;

    /// Seconds between bridge cycles
    fn duration(&self) -> Result<f64> {
        Ok(DEFAULT_BRIDGE_DURATION)
    }
}

/// Settings backed by the entity/bridge JSON document
pub struct JsonSettingsFile {
    path: PathBuf,
}

impl JsonSettingsFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_document(&self) -> Result<Value> {
        let content = std::fs::read_to_string(&self.path).map_err(|e| {
            BridgeError::config(format!("Cannot read {}: {}", self.path.display(), e))
        })?;
        Ok(serde_json::from_str(&content)?)
    }
}

impl SettingsStore for JsonSettingsFile {
    fn load(&self) -> Result<BridgeSettings> {
        Ok(EntityConfig::from_file(&self.path)?.settings)
    }

    /// Rewrites the whole document; fields this service does not know survive
    fn store_token(&self, token: &str) -> Result<()> {
        let mut document = self.read_document()?;
        let root = document
            .as_object_mut()
            .ok_or_else(|| BridgeError::config("Entity config root is not an object"))?;
        let settings = root
            .entry("settings")
            .or_insert_with(|| Value::Object(Map::new()));
        let settings_map = settings
            .as_object_mut()
            .ok_or_else(|| BridgeError::config("settings is not an object"))?;
        settings_map.insert("token".to_string(), Value::String(token.to_string()));

        let parsed: BridgeSettings = serde_json::from_value(settings.clone())?;
        parsed.validate()?;

        write_json_atomic(&self.path, &document)?;
        info!("Token persisted to {}", self.path.display());
        Ok(())
    }

    fn duration(&self) -> Result<f64> {
        Ok(EntityConfig::from_file(&self.path)?.duration)
    }
}

/// In-memory settings
pub struct MemorySettingsStore {
    settings: Mutex<BridgeSettings>,
    duration: f64,
}

impl MemorySettingsStore {
    pub fn new(settings: BridgeSettings) -> Self {
        Self::with_duration(settings, DEFAULT_BRIDGE_DURATION)
    }

    pub fn with_duration(settings: BridgeSettings, duration: f64) -> Self {
        Self {
            settings: Mutex::new(settings),
            duration,
        }
    }
}

impl SettingsStore for MemorySettingsStore {
    fn load(&self) -> Result<BridgeSettings> {
        Ok(self.settings.lock().clone())
    }

    fn store_token(&self, token: &str) -> Result<()> {
        self.settings.lock().token = Some(token.to_string());
        Ok(())
    }

    fn duration(&self) -> Result<f64> {
        Ok(self.duration)
    }
}
