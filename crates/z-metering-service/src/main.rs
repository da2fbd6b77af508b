//! Z-Metering Service - HTTP API for plan credits and subscriptions
//!
//! This is the main entry point for the z-metering service.

use std::sync::Arc;
use std::time::Duration;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use z_metering_engine::{MeteringEngine, TracingSink, UsageSink};
use z_metering_service::sink::DEFAULT_SINK_CAPACITY;
use z_metering_service::{
    create_router, spawn_sweeper, AppState, HttpSink, ServiceConfig, StorageBackend,
};
use z_metering_store::{MemoryStore, Store};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,z_metering=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Z-Metering Service");

    // Load configuration from environment
    let config = ServiceConfig::from_env();

    tracing::info!(
        listen_addr = %config.listen_addr,
        storage_backend = ?config.storage_backend,
        data_dir = %config.data_dir,
        observability_configured = %config.observability_url.is_some(),
        allow_past_due = %config.allow_past_due,
        "Service configuration loaded"
    );

    let store = open_store(&config)?;
    let catalog = config.load_catalog()?;
    let costs = config.load_costs()?;

    let sink: Arc<dyn UsageSink> = match &config.observability_url {
        Some(url) => {
            let (sink, _forwarder) = HttpSink::spawn(
                url.clone(),
                config.observability_api_key.clone(),
                DEFAULT_SINK_CAPACITY,
            )?;
            Arc::new(sink)
        }
        None => {
            tracing::warn!("Observability not configured - usage records stay local");
            Arc::new(TracingSink)
        }
    };

    let engine = Arc::new(
        MeteringEngine::builder(store)
            .catalog(catalog)
            .costs(costs)
            .sink(sink)
            .config(config.engine_config())
            .build(),
    );

    let _sweeper = spawn_sweeper(
        engine.clone(),
        Duration::from_secs(config.sweep_interval_seconds),
    );

    // Build app state and router
    let state = AppState::new(engine, config.clone());
    let app = create_router(state);
    tracing::info!("Router configured with all API endpoints");

    // Start HTTP server
    tracing::info!(listen_addr = %config.listen_addr, "Starting HTTP server");
    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

/// Open the configured storage backend.
fn open_store(config: &ServiceConfig) -> Result<Arc<dyn Store>, Box<dyn std::error::Error>> {
    match config.storage_backend {
        StorageBackend::Memory => {
            tracing::warn!("Using in-memory store - state is lost on restart");
            Ok(Arc::new(MemoryStore::new()))
        }
        #[cfg(feature = "rocksdb-backend")]
        StorageBackend::RocksDb => {
            tracing::info!(path = %config.data_dir, "Opening RocksDB store");
            Ok(Arc::new(z_metering_store::RocksStore::open(&config.data_dir)?))
        }
        #[cfg(not(feature = "rocksdb-backend"))]
        StorageBackend::RocksDb => {
            Err("STORAGE_BACKEND=rocksdb requires the rocksdb-backend feature".into())
        }
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
