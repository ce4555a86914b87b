//! NIMBUS: resilient multi-provider weather aggregator
//!
//! Entry point. Loads configuration, initialises structured logging,
//! builds the weather service with its maintenance task and serves the
//! HTTP API until Ctrl+C.

use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::path::Path;
use tracing::{info, warn};

use nimbus::api;
use nimbus::config::AppConfig;
use nimbus::service::WeatherService;

const DEFAULT_CONFIG_PATH: &str = "config.toml";

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (non-fatal if missing)
    let _ = dotenv::dotenv();

    let config_path = std::env::var("NIMBUS_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
    let config_exists = Path::new(&config_path).exists();
    let cfg = if config_exists { AppConfig::load(&config_path)? } else { AppConfig::default() };

    init_logging();

    if !config_exists {
        warn!(path = %config_path, "Config file not found, using defaults");
    }
    info!(
        fresh_ttl_minutes = cfg.service.fresh_ttl_minutes,
        stale_ttl_hours = cfg.service.stale_ttl_hours,
        call_timeout_secs = cfg.service.call_timeout_secs,
        radar = cfg.radar.enabled,
        "NIMBUS starting up"
    );

    let service = WeatherService::from_config(&cfg).context("Failed to build weather service")?;
    service.init();

    if cfg.server.enabled {
        let addr: SocketAddr = format!("{}:{}", cfg.server.host, cfg.server.port)
            .parse()
            .with_context(|| format!("Invalid server address {}:{}", cfg.server.host, cfg.server.port))?;
        api::serve(service.clone(), addr, shutdown_signal()).await?;
    } else {
        info!("API server disabled. Press Ctrl+C to stop.");
        shutdown_signal().await;
    }

    service.shutdown().await;
    let cache = service.cache_stats();
    info!(
        cache_entries = cache.size,
        cache_hit_rate = format!("{:.1}%", cache.hit_rate() * 100.0),
        "NIMBUS shut down cleanly."
    );
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for shutdown signal");
        return;
    }
    info!("Shutdown signal received.");
}

/// Initialise the `tracing` subscriber.
fn init_logging() {
    use tracing_subscriber::{fmt, EnvFilter};

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("nimbus=info"));

    let json_logging = std::env::var("NIMBUS_LOG_JSON").is_ok();

    if json_logging {
        fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .with_thread_ids(true)
            .init();
    } else {
        fmt()
            .with_env_filter(env_filter)
            .with_target(true)
            .init();
    }
}
