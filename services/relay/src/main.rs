//! Preview Relay
//!
//! UDP relay routing clients to per-pull-request preview environments.
//!
//! This service:
//! - Reads the environment id (`pr-<digits>`) from each client's first packet
//! - Resolves the environment to one backend through a short-TTL cache
//! - Pins the client endpoint to that backend for the session's lifetime
//! - Relays datagrams both ways
//! - Answers TCP health checks with `OK`

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use preview_relay::config::Config;
use preview_relay::health::HealthListener;
use preview_relay::relay::Relay;
use preview_relay::resolver;
use preview_relay::shutdown::{wait_for_signal, Shutdown};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env().context("Invalid relay configuration")?;

    // Initialize tracing (prefer RUST_LOG, fallback to RELAY_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting preview relay");
    info!(
        listen_addr = %config.listen_addr,
        health_addr = %config.health_addr,
        resolver = ?config.resolver,
        namespace = %config.namespace,
        region = %config.region,
        cache_ttl_ms = config.cache_ttl.as_millis() as u64,
        "Configuration loaded"
    );

    let resolver =
        Arc::new(resolver::from_config(&config).context("Failed to set up resolver")?);

    let relay = match Relay::bind(config.relay_config(), resolver).await {
        Ok(relay) => Arc::new(relay),
        Err(e) => {
            error!(bind_addr = %config.listen_addr, error = %e, "Failed to bind relay");
            return Err(e.into());
        }
    };

    let health = match HealthListener::bind(config.health_addr).await {
        Ok(health) => health,
        Err(e) => {
            error!(bind_addr = %config.health_addr, error = %e, "Failed to bind health listener");
            return Err(e.into());
        }
    };

    let shutdown = Shutdown::new(config.shutdown_timeout);

    let relay_task = {
        let relay = Arc::clone(&relay);
        let rx = shutdown.subscribe();
        tokio::spawn(async move {
            if let Err(e) = relay.run(rx).await {
                error!(error = %e, "Relay error");
            }
        })
    };

    let health_task = {
        let rx = shutdown.subscribe();
        tokio::spawn(async move {
            if let Err(e) = health.run(rx).await {
                error!(error = %e, "Health listener error");
            }
        })
    };

    let maintenance_task = tokio::spawn(Arc::clone(&relay).run_maintenance(shutdown.subscribe()));

    let signal = wait_for_signal()
        .await
        .context("Failed to install signal handlers")?;
    info!(signal, "Received shutdown signal");

    shutdown
        .run(&relay, vec![relay_task, health_task, maintenance_task])
        .await;

    Ok(())
}
