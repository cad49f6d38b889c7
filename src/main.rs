mod auto;
mod cancel;
mod config;
mod error;
mod interlock;
mod relay;
mod schedule;
mod scheduler;
mod sensor;
mod state;
mod store;
mod web;

use anyhow::{Context, Result};
use std::env;
use std::sync::{Arc, Mutex, RwLock};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use auto::AutoController;
use interlock::Irrigator;
use relay::RelayPort;
use scheduler::ScheduleEngine;
use sensor::SensorPort;
use state::{AlertLevel, AlertSink, EventLog};
use store::ScheduleStore;
use web::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // ── Config ──────────────────────────────────────────────────────
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());
    let cfg = config::load(&config_path)?;
    let zone_ids = cfg.enabled_zone_ids();
    info!(
        config = %config_path,
        zones = zone_ids.len(),
        "irrigation rig starting"
    );

    // ── Hardware ────────────────────────────────────────────────────
    let mut relay = build_relay()?;
    // Fail-safe default before anything else runs.
    relay.all_off().context("startup all-off failed")?;
    let sensors: Arc<Mutex<Box<dyn SensorPort>>> =
        Arc::new(Mutex::new(build_sensors(&zone_ids)?));

    // ── Shared state ────────────────────────────────────────────────
    let events = EventLog::shared();
    events
        .write()
        .await
        .record(state::EventKind::System, "rig started");

    // Config seeds the thresholds; runtime edits saved in a previous run
    // overlay them.
    let mut seeded = cfg.thresholds();
    let saved = state::load_thresholds(std::path::Path::new(&cfg.system.threshold_file))
        .context("threshold file load failed")?;
    seeded.extend(saved);
    let thresholds: state::SharedThresholds = Arc::new(RwLock::new(seeded));

    let alerts: AlertSink = Arc::new(|alert| match alert.level {
        AlertLevel::Warning => warn!(kind = ?alert.kind, "{}", alert.message),
        AlertLevel::Critical => error!(kind = ?alert.kind, "{}", alert.message),
    });

    // ── Core services ───────────────────────────────────────────────
    let irrigator = Arc::new(Irrigator::new(
        relay,
        Arc::clone(&events),
        cfg.irrigator_config(),
    ));

    let store = Arc::new(ScheduleStore::load(
        cfg.system.schedule_file.clone(),
        cfg.known_zone_ids(),
    )?);

    let controller = AutoController::new(
        Arc::clone(&irrigator),
        Arc::clone(&sensors),
        Arc::clone(&thresholds),
        Arc::clone(&events),
        alerts,
        zone_ids,
        cfg.auto_config(),
    );

    let engine = ScheduleEngine::new(
        Arc::clone(&store),
        Arc::clone(&irrigator),
        sensors,
        thresholds,
        Arc::clone(&events),
        cfg.engine_config(),
    );
    engine.start().await;

    // ── Web server ──────────────────────────────────────────────────
    let app_state = AppState {
        controller: Arc::clone(&controller),
        engine: Arc::clone(&engine),
        store,
        irrigator: Arc::clone(&irrigator),
        known_zones: cfg.known_zone_ids(),
    };
    let bind = cfg.server.bind.clone();
    let server = tokio::spawn(async move {
        if let Err(e) = web::serve(app_state, &bind).await {
            error!("web server error: {e:#}");
        }
    });

    // ── Shutdown ────────────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    info!("shutdown requested");
    irrigator.emergency_stop();
    engine.stop().await;
    controller.shutdown().await;
    server.abort();
    info!("all outputs off, goodbye");
    Ok(())
}

#[cfg(feature = "gpio")]
fn build_relay() -> Result<Box<dyn RelayPort>> {
    use relay::{Mcp23017RelayBank, RelayOutput};

    // One MCP23017 at 0x20: pump on pin 0, zone valves on pins 1..=8.
    let mut map = vec![(RelayOutput::Pump, 0x20, 0)];
    for zone in 1..=8u8 {
        map.push((RelayOutput::Zone(zone), 0x20, zone));
    }
    let bank = Mcp23017RelayBank::new(&map).context("relay bank init failed")?;
    Ok(Box::new(bank))
}

#[cfg(not(feature = "gpio"))]
fn build_relay() -> Result<Box<dyn RelayPort>> {
    info!("gpio feature disabled, using mock relay bank");
    Ok(Box::new(relay::MockRelayBank::with_zones(8)))
}

#[cfg(feature = "sim")]
fn build_sensors(zone_ids: &[u8]) -> Result<Box<dyn SensorPort>> {
    Ok(Box::new(sensor::SimSensorBus::new(zone_ids)))
}

#[cfg(not(feature = "sim"))]
fn build_sensors(_zone_ids: &[u8]) -> Result<Box<dyn SensorPort>> {
    anyhow::bail!("no sensor bus driver in this build; enable the sim feature")
}
