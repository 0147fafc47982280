//! Billboard playback endpoint.
//!
//! Fetches the operator's curated media schedule, caches assets locally,
//! and keeps one mpv instance showing them fullscreen until a signal or the
//! supervisor-restart deadline stops the process.

mod api;
mod auth;
mod cache;
mod config;
mod controller;
mod identity;
mod mpv;
mod playlist;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::signal::unix::{signal, SignalKind};
use tracing::{info, warn};

use crate::api::{ApiClient, Auth};
use crate::auth::Signer;
use crate::cache::AssetCache;
use crate::config::Config;
use crate::controller::Controller;
use crate::identity::DeviceIdentity;
use crate::mpv::PlayerDriver;
use crate::playlist::StateDir;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.env"));
    let cfg = Config::load(&config_path)?;

    let auth = match &cfg.auth_header {
        Some(value) => {
            info!("using legacy static authorization header");
            Auth::Static(value.clone())
        }
        None => {
            let identity = DeviceIdentity::discover().context("device identity unavailable")?;
            info!("device id: {}", identity.device_id);
            Auth::Hmac(Signer::new(&identity))
        }
    };

    let api = Arc::new(ApiClient::new(
        cfg.api_base.clone(),
        cfg.billboard_id.clone(),
        auth,
    )?);
    let cache = Arc::new(AssetCache::new(cfg.cache_dir.clone(), cfg.max_cache_mb)?);
    let state_dir = StateDir::open(cfg.state_dir.clone())?;
    let player = PlayerDriver::new(&cfg);

    let heartbeat = spawn_heartbeat(api.clone(), cfg.heartbeat_seconds);
    let mut controller = Controller::new(&cfg, api, cache, state_dir, player);

    let mut sigterm = signal(SignalKind::terminate()).context("cannot install SIGTERM handler")?;
    let outcome = tokio::select! {
        result = controller.run() => result,
        _ = tokio::signal::ctrl_c() => {
            info!("SIGINT received, shutting down");
            Ok(())
        }
        _ = sigterm.recv() => {
            info!("SIGTERM received, shutting down");
            Ok(())
        }
    };

    if let Some(task) = heartbeat {
        task.abort();
    }
    controller.shutdown().await;
    info!("exited cleanly");
    outcome
}

/// Periodic "this device is alive" ping; 0 disables it.
fn spawn_heartbeat(api: Arc<ApiClient>, interval_secs: u64) -> Option<tokio::task::JoinHandle<()>> {
    if interval_secs == 0 {
        return None;
    }
    Some(tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(e) = api.heartbeat().await {
                warn!("heartbeat failed: {e}");
            }
        }
    }))
}
