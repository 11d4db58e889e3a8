//! Hub entity runtime server
//!
//! Builds every component once from `hub.yaml`, hands them to the
//! [`EntityRuntime`], and runs until Ctrl-C.
//!
//! Usage: `hubrt [CONFIG_DIR]` (defaults to `$HUB_CONFIG_DIR`, then `.`)

use anyhow::{Context, Result};
use hub_config::HubConfig;
use hub_core::{new_id, Protocol};
use hub_event_bus::EventBus;
use hub_registries::{AppRegistry, CapabilityCatalog, DeviceRegistry, DriverRegistry};
use hub_runtime::{
    EntityRuntime, IntegrationRegistry, RuntimeComponents, RuntimeConfig, VirtualIntegration,
    DEFAULT_HTTP_TIMEOUT,
};
use hub_sandbox::{LocationInfo, SandboxConfig, SandboxEngine};
use hub_scheduler::Scheduler;
use hub_storage::{DirSourceStore, JsonRepository, MemoryEventStore, Storage, StorageFile};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Storage key of the generated location id
const LOCATION_KEY: &str = "hub.location";
const LOCATION_VERSION: u32 = 1;

/// Id of the integration that owns devices without a radio
const VIRTUAL_INTEGRATION: &str = "virtual";

fn config_dir() -> PathBuf {
    std::env::args_os()
        .nth(1)
        .or_else(|| std::env::var_os("HUB_CONFIG_DIR"))
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
}

/// The configured location id, or the one generated on first start
async fn location_id(config: &HubConfig, storage: &Storage) -> Result<String> {
    if let Some(id) = &config.location.id {
        return Ok(id.clone());
    }
    if let Some(file) = storage
        .load::<String>(LOCATION_KEY, LOCATION_VERSION)
        .await?
    {
        return Ok(file.data);
    }

    let id = new_id();
    storage
        .save(&StorageFile::new(LOCATION_KEY, id.clone(), LOCATION_VERSION))
        .await?;
    info!(location_id = %id, "Generated location id");
    Ok(id)
}

/// Build the runtime and every port it depends on
async fn build_runtime(config: &HubConfig) -> Result<Arc<EntityRuntime>> {
    let storage = Arc::new(Storage::new(config.data_path()));
    storage.ensure_dir().await?;

    let catalog = Arc::new(CapabilityCatalog::builtin()?);
    let drivers = Arc::new(DriverRegistry::new(
        Arc::new(JsonRepository::open(storage.clone()).await?),
        catalog,
    ));
    let devices = Arc::new(DeviceRegistry::new(Arc::new(
        JsonRepository::open(storage.clone()).await?,
    )));
    let apps = Arc::new(AppRegistry::new(Arc::new(
        JsonRepository::open(storage.clone()).await?,
    )));
    let scheduler = Arc::new(Scheduler::with_system_clock(Arc::new(
        JsonRepository::open(storage.clone()).await?,
    )));
    let events = Arc::new(
        MemoryEventStore::open(storage.clone(), config.events.retain_per_source).await?,
    );

    let integrations = Arc::new(IntegrationRegistry::new());
    integrations.register(Arc::new(VirtualIntegration::new(
        VIRTUAL_INTEGRATION,
        vec![Protocol::Zigbee, Protocol::Zwave, Protocol::Lan],
    )));

    let components = RuntimeComponents {
        drivers,
        devices,
        apps,
        subscriptions: Arc::new(JsonRepository::open(storage.clone()).await?),
        scheduler,
        sources: Arc::new(DirSourceStore::new(
            config.drivers_path(),
            config.apps_path(),
        )),
        events,
        bus: Arc::new(EventBus::new()),
        sandbox: SandboxEngine::new(SandboxConfig {
            timeout: config.sandbox.timeout(),
            instruction_budget: config.sandbox.instruction_budget,
        }),
        integrations,
    };

    let runtime_config = RuntimeConfig {
        location: LocationInfo {
            id: location_id(config, &storage).await?,
            name: config.location.name.clone(),
            latitude: config.location.latitude,
            longitude: config.location.longitude,
            ..LocationInfo::default()
        },
        fallback_driver: config.fingerprint.fallback_driver.clone(),
        http_timeout: DEFAULT_HTTP_TIMEOUT,
    };

    Ok(EntityRuntime::new(components, runtime_config))
}

#[tokio::main]
async fn main() -> Result<()> {
    let config_dir = config_dir();
    let config = HubConfig::load(&config_dir)
        .with_context(|| format!("loading configuration from {}", config_dir.display()))?;

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .context("invalid log filter")?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();

    info!(config_dir = %config_dir.display(), "Starting hub entity runtime");

    let runtime = build_runtime(&config).await?;
    let loaded = runtime.initialize().await?;
    info!(definitions = loaded, location = %runtime.location().name, "Hub is running");

    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");
    runtime.shutdown().await?;

    Ok(())
}
