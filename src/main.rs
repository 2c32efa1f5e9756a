//! Vigil - monitoring and security analytics for a fleet of authentication
//! services.
//!
//! Starts the background pipeline loops and the admin HTTP API in one
//! process. On Ctrl-C the server stops accepting requests, every loop is
//! cancelled and awaited, and only then is the database pool closed.
//!
//! # API Endpoints
//!
//! - `GET /health` - Health check
//! - `POST /aggregation/trigger/*` - On-demand aggregation, analysis, cleanup
//! - `GET /monitoring/*`, `/security/*`, `/health-monitoring/*` - Read-only queries

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use vigil::aggregation::Aggregator;
use vigil::api::{self, AppState};
use vigil::collection::CollectionOrchestrator;
use vigil::collectors::{AccessLogTailer, HealthProber, ViolationScanner};
use vigil::config::Config;
use vigil::counters::{CounterStore, RedisCounterStore};
use vigil::crypto::{AesGcmCipher, Cipher};
use vigil::retention::RetentionEngine;
use vigil::scheduler::{
    AGGREGATION_RETRY, COLLECTION_RETRY, CLEANUP_INTERVAL, CLEANUP_RETRY, Cadence, CleanupJob,
    HourlyAggregationJob, LoopSpec, SECURITY_INTERVAL, SECURITY_RETRY, Scheduler,
};
use vigil::security::{DetectionConfig, SecurityAnalyzer};
use vigil::storage::Storage;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive("vigil=info".parse()?))
        .init();

    let config = Config::from_env()?;
    info!(
        port = config.port,
        db_url = %config.database_url,
        access_log = %config.access_log_path,
        "Starting vigil"
    );

    let storage = Storage::new(&config.database_url).await?;
    info!("Database initialized");

    let counters: Arc<dyn CounterStore> = Arc::new(RedisCounterStore::new(&config.redis_url)?);
    let cipher: Arc<dyn Cipher> = Arc::new(AesGcmCipher::new(&config.crypto_master_key)?);

    let aggregator = Aggregator::new(storage.clone());
    let analyzer = SecurityAnalyzer::new(storage.clone(), DetectionConfig::default());
    let retention = RetentionEngine::new(storage.clone(), config.retention_days);

    let orchestrator = CollectionOrchestrator::new(
        storage.clone(),
        AccessLogTailer::new(&config.access_log_path),
        ViolationScanner::new(counters.clone()),
        HealthProber::new(storage.clone(), counters.clone(), cipher, config.probe_timeout),
        config.violation_threshold,
    );

    let mut scheduler = Scheduler::new();
    scheduler.start(
        orchestrator,
        LoopSpec {
            cadence: Cadence::Every(config.collection_interval),
            retry_delay: COLLECTION_RETRY,
        },
    );
    scheduler.start(
        HourlyAggregationJob::new(aggregator.clone()),
        LoopSpec {
            cadence: Cadence::Hourly,
            retry_delay: AGGREGATION_RETRY,
        },
    );
    scheduler.start(
        analyzer.clone(),
        LoopSpec {
            cadence: Cadence::Every(SECURITY_INTERVAL),
            retry_delay: SECURITY_RETRY,
        },
    );
    scheduler.start(
        CleanupJob::new(retention.clone(), ViolationScanner::new(counters)),
        LoopSpec {
            cadence: Cadence::Every(CLEANUP_INTERVAL),
            retry_delay: CLEANUP_RETRY,
        },
    );

    let app = api::router(AppState {
        storage: storage.clone(),
        aggregator,
        analyzer,
        retention,
    });

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "Vigil is listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Shutting down background loops");
    scheduler.shutdown().await;
    storage.close().await;
    info!("Shutdown complete");

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}
