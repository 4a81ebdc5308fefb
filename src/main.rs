//! Wsfarm - Entry Point
//!
//! Loads the proxy roster, starts the pool manager and monitor, and waits for
//! a shutdown signal.

use std::io::{self, Write};
use std::sync::Arc;

use tokio::signal;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod config;
mod error;
mod identity;
mod models;
mod pool;
mod session;

use config::Config;
use error::FarmError;
use pool::{HealthTracker, PoolHandle, PoolManager, PoolMonitor, ProxySelector, RandomSelector};

#[tokio::main]
async fn main() -> error::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "wsfarm=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting wsfarm");

    // Load configuration
    let config = Config::from_env()?;
    info!("Configuration loaded");

    // Load the proxy roster
    let roster = models::load_roster(&config.pool.proxy_file)?;
    if roster.is_empty() {
        return Err(FarmError::NoProxiesAvailable);
    }
    info!(
        "Loaded {} proxies from {}",
        roster.len(),
        config.pool.proxy_file
    );

    let user_id = resolve_user_id()?;

    // Shared pool state
    let health = Arc::new(HealthTracker::new());
    let selector: Arc<dyn ProxySelector> = Arc::new(RandomSelector::new());
    selector.refresh(roster.clone()).await?;
    info!("Using selection strategy: {}", selector.strategy_name());

    // Create shutdown channel
    let (shutdown_tx, _) = watch::channel(false);

    // Start the pool manager
    let manager = PoolManager::new(
        roster,
        user_id,
        config.pool.max_connections,
        config.worker.clone(),
        config.endpoint.clone(),
        selector.clone(),
        health.clone(),
    );
    let (pool_handle, commands) = PoolHandle::channel();
    let manager_shutdown = shutdown_tx.subscribe();
    let manager_task = tokio::spawn(async move {
        manager.run(commands, manager_shutdown).await;
    });

    // Start the pool monitor
    let monitor = PoolMonitor::new(
        config.pool.check_interval,
        pool_handle.clone(),
        health.clone(),
    );
    let monitor_shutdown = shutdown_tx.subscribe();
    let monitor_task = tokio::spawn(async move {
        monitor.run(monitor_shutdown).await;
    });

    info!(
        "Pool started - capacity: {}, endpoint: {}",
        config.pool.max_connections, config.endpoint.url
    );

    // Wait for shutdown signal
    shutdown_signal().await;
    info!("Shutdown signal received");

    // Send shutdown signal to all services
    let _ = shutdown_tx.send(true);

    // Wait for all tasks to complete
    let _ = tokio::join!(manager_task, monitor_task);

    info!("wsfarm stopped");
    Ok(())
}

/// User id from the environment, or an interactive prompt
fn resolve_user_id() -> error::Result<String> {
    if let Ok(id) = std::env::var("USER_ID") {
        let id = id.trim().to_string();
        if !id.is_empty() {
            return Ok(id);
        }
    }

    print!("Enter your User ID: ");
    io::stdout().flush()?;
    let mut line = String::new();
    io::stdin().read_line(&mut line)?;
    let id = line.trim().to_string();
    if id.is_empty() {
        return Err(FarmError::InvalidConfig("user id must not be empty".into()));
    }
    Ok(id)
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
