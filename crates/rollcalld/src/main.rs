use std::sync::Arc;

use anyhow::{Context, Result};
use rollcall_core::{OnnxFaceEncoder, QualityGate, SystemClock};
use rollcall_store::{Database, ProfileStore};
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;
mod engine;
mod service;

use dbus_interface::{AttendanceInterface, BUS_NAME, OBJECT_PATH};
use service::AttendanceService;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("rollcalld starting");

    let config = config::Config::from_env();

    let encoder = OnnxFaceEncoder::load(&config.detector_model_path(), &config.encoder_model_path())
        .context("loading face models")?;
    tracing::info!(dir = %config.model_dir.display(), "face models loaded");

    let engine = engine::spawn_engine(encoder, QualityGate::new(config.quality_thresholds()))?;

    let db = Database::open(&config.db_path)
        .with_context(|| format!("opening database {}", config.db_path.display()))?;
    let profiles = ProfileStore::open(&config.faces_dir)
        .with_context(|| format!("opening profile store {}", config.faces_dir.display()))?;

    let service = Arc::new(AttendanceService::new(
        engine,
        profiles,
        db,
        config.match_threshold,
        Arc::new(SystemClock),
    ));
    service.reload()?;

    let builder = if config.session_bus {
        zbus::connection::Builder::session()?
    } else {
        zbus::connection::Builder::system()?
    };
    let _conn = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, AttendanceInterface::new(service))?
        .build()
        .await
        .context("registering on D-Bus")?;

    tracing::info!(
        bus = BUS_NAME,
        session = config.session_bus,
        threshold = config.match_threshold,
        "rollcalld ready"
    );

    tokio::signal::ctrl_c().await?;
    tracing::info!("rollcalld shutting down");

    Ok(())
}
