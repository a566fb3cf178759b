//! Modbus-to-HTTP bridge service (`bridgesrv`)
//!
//! Polls Modbus TCP devices, maps registers onto entities and pushes entity
//! state to a remote HTTP backend.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use tracing::{error, info, warn};

use bridgesrv::config::{load_service_config, EntityConfig, PollingConfig, ServiceConfig};
use bridgesrv::entity::database::validate_pollers;
use bridgesrv::service::InspectView;
use bridgesrv::BridgeService;
use common::logging::parse_level;
use common::{cancel_on_shutdown, init_with_config, LogConfig};
use tokio_util::sync::CancellationToken;

#[derive(Parser, Debug)]
#[command(author, version, about = "bridgesrv - Modbus TCP to HTTP bridge")]
struct Args {
    /// Service configuration file (TOML or JSON)
    #[arg(short, long, value_name = "FILE", env = "BRIDGESRV_CONFIG")]
    config: Option<PathBuf>,

    /// Override the polling configuration path
    #[arg(long, value_name = "FILE")]
    polling: Option<PathBuf>,

    /// Override the entity/bridge configuration path
    #[arg(long, value_name = "FILE")]
    entities: Option<PathBuf>,

    /// Override the log level
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Poll devices and run the bridge until Ctrl+C/SIGTERM (default)
    Run {
        /// Start polling only
        #[arg(long)]
        no_bridge: bool,
    },
    /// Send one bridge cycle and print the response
    Once,
    /// Authenticate and store the token
    Login,
    /// Check both configuration files and exit
    Validate,
    /// Print a diagnostic view as JSON
    Inspect {
        /// database, index, status, packets, bridge-packets or settings
        view: String,
        /// Dotted path inside the view, e.g. `1-temps.last_value.0`
        path: Option<String>,
        /// Poll for this many seconds before rendering
        #[arg(long, value_name = "SECS")]
        sample: Option<f64>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = load_service_config(args.config.as_deref())
        .context("Failed to load service configuration")?;
    if let Some(path) = args.polling.clone() {
        config.polling_config = path;
    }
    if let Some(path) = args.entities.clone() {
        config.entity_config = path;
    }
    if let Some(level) = args.log_level.clone() {
        config.log_level = level;
    }

    init_with_config(LogConfig {
        service_name: "bridgesrv".to_string(),
        log_dir: config.log_dir.clone(),
        level: parse_level(&config.log_level),
        enable_json: config.log_json,
    })
    .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))?;

    info!("bridgesrv v{}", env!("CARGO_PKG_VERSION"));

    match args.command.unwrap_or(Commands::Run { no_bridge: false }) {
        Commands::Run { no_bridge } => run(config, no_bridge).await,
        Commands::Once => once(config).await,
        Commands::Login => login(config).await,
        Commands::Validate => validate(&config),
        Commands::Inspect { view, path, sample } => {
            inspect(config, &view, path.as_deref(), sample).await
        },
    }
}

fn build_service(config: ServiceConfig) -> anyhow::Result<BridgeService> {
    let service = BridgeService::from_config(config).context("Failed to build service")?;
    let path = service.config().entity_config.clone();
    let report = service
        .load_entities_from_file()
        .with_context(|| format!("Failed to load entities from {}", path.display()))?;
    if !report.is_clean() {
        warn!(
            "{} duplicate entity ids; last declaration wins",
            report.duplicates.len()
        );
    }
    Ok(service)
}

async fn run(config: ServiceConfig, no_bridge: bool) -> anyhow::Result<()> {
    let service = build_service(config)?;

    let started = service
        .start_polling_from_file()
        .await
        .context("Failed to start polling")?;
    if !started {
        warn!("Polling already running");
    }
    if !no_bridge {
        service.start_bridge();
    }

    info!("bridgesrv running, press Ctrl+C to stop");
    let token = CancellationToken::new();
    let watcher = cancel_on_shutdown(token.clone());
    token.cancelled().await;
    let _ = watcher.await;

    service.shutdown().await;
    Ok(())
}

async fn once(config: ServiceConfig) -> anyhow::Result<()> {
    let service = build_service(config)?;
    let (status, body) = service
        .trigger_bridge_once()
        .await
        .context("Bridge cycle failed")?;
    println!("{}", status);
    println!("{}", body);
    Ok(())
}

async fn login(config: ServiceConfig) -> anyhow::Result<()> {
    let service = BridgeService::from_config(config).context("Failed to build service")?;
    service.login().await.context("Login failed")?;
    info!("Token stored");
    Ok(())
}

fn validate(config: &ServiceConfig) -> anyhow::Result<()> {
    let polling = PollingConfig::from_file(&config.polling_config)
        .context("Invalid polling configuration")?;
    let plans = polling.plans();
    info!(
        "{}: {} devices, {} pollers",
        config.polling_config.display(),
        polling.devices.len(),
        plans.len()
    );

    let entities = EntityConfig::from_file(&config.entity_config)
        .context("Invalid entity configuration")?;
    let report = validate_pollers(&entities.pollers);
    info!(
        "{}: {} pollers, {} entities, {} generated ids",
        config.entity_config.display(),
        report.pollers,
        report.entities,
        report.generated_ids
    );
    if let Err(e) = entities.settings.validate() {
        warn!("Bridge settings incomplete: {}", e);
    }

    if !report.is_clean() {
        for dup in &report.duplicates {
            error!(
                "Duplicate entity id {} in {} and {}",
                dup.mbid, dup.shadowed_poller, dup.winning_poller
            );
        }
        bail!("{} duplicate entity ids", report.duplicates.len());
    }

    info!("Validation completed successfully");
    Ok(())
}

async fn inspect(
    config: ServiceConfig,
    view: &str,
    path: Option<&str>,
    sample: Option<f64>,
) -> anyhow::Result<()> {
    let view: InspectView = view.parse()?;
    let service = build_service(config)?;

    if let Some(secs) = sample.filter(|s| *s > 0.0) {
        service
            .start_polling_from_file()
            .await
            .context("Failed to start polling")?;
        tokio::time::sleep(Duration::from_secs_f64(secs.min(3600.0))).await;
        service.stop_polling().await;
    }

    let rendered = service.inspect(view, path)?;
    println!("{}", serde_json::to_string_pretty(&rendered)?);
    Ok(())
}
