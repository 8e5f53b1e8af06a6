//! Swap deputy - relays hashed-timelock swaps between Binance Chain and Kava

use anyhow::Result;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};

use swap_deputy::config::Settings;
use swap_deputy::metrics::MetricsServer;
use swap_deputy::{api, DeputyService};

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    info!("Starting swap deputy v{}", env!("CARGO_PKG_VERSION"));

    let settings = Settings::load()?;
    info!(
        "Loaded configuration for {} chains and {} pairs",
        settings.enabled_chains().len(),
        settings.pairs.len()
    );

    let service = Arc::new(DeputyService::connect(settings.clone()).await?);
    info!("Chain connections initialized");

    // Resolves pending transactions before any engine runs
    service.start().await?;

    let mut handles = Vec::new();
    handles.push(tokio::spawn({
        let service = service.clone();
        let config = settings.api.clone();
        async move {
            if let Err(e) = api::run_server(config, service).await {
                error!("API server error: {}", e);
            }
        }
    }));

    if settings.metrics.enabled {
        let server = MetricsServer::new(settings.metrics.port);
        handles.push(tokio::spawn(async move {
            if let Err(e) = server.run().await {
                error!("Metrics server error: {}", e);
            }
        }));
    }

    handles.push(tokio::spawn({
        let service = service.clone();
        let interval = settings.deputy.health_check_interval_secs;
        async move {
            loop {
                tokio::time::sleep(tokio::time::Duration::from_secs(interval)).await;

                for (chain, healthy) in service.chains().health_check().await {
                    if !healthy {
                        warn!("Chain {} health check failed", chain);
                    }
                }

                if let Err(e) = service.ledger().health_check().await {
                    warn!("Database health check failed: {}", e);
                }
            }
        }
    }));

    info!("Swap deputy is running");
    info!("API server: http://{}:{}", settings.api.host, settings.api.port);
    if settings.metrics.enabled {
        info!("Metrics: http://0.0.0.0:{}/metrics", settings.metrics.port);
    }

    shutdown_signal().await;

    info!("Shutdown signal received, stopping...");
    service.stop().await;
    for handle in handles {
        handle.abort();
    }

    info!("Swap deputy stopped");
    Ok(())
}

fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,swap_deputy=debug,sqlx=warn,hyper=warn"));

    let json = std::env::var("LOG_FORMAT").is_ok_and(|format| format == "json");
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(fmt::layer().json().with_target(true).with_thread_ids(true))
            .init();
    } else {
        registry
            .with(fmt::layer().with_target(true).with_thread_ids(true))
            .init();
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
