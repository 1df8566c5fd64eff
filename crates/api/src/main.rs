//! Beacon API server binary entrypoint.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use beacon_common::config::AppConfig;
use beacon_common::db::{create_pool, run_migrations};
use beacon_common::redis_pool::create_redis_pool;
use beacon_engine::intake::IntakeService;
use beacon_engine::ledger::{DeliveryLedger, PgAttemptStore};
use beacon_engine::queue::RedisJobQueue;
use beacon_engine::scheduler::DispatchScheduler;
use beacon_engine::store::{NotificationStore, PgNotificationStore};

use beacon_api::routes::create_router;
use beacon_api::state::AppState;

/// Largest accepted request body.
const MAX_BODY_BYTES: usize = 256 * 1024;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("beacon_api=debug,beacon_engine=debug,tower_http=debug")
        }))
        .init();

    tracing::info!("Starting Beacon API server...");

    let config = AppConfig::from_env()?;

    let pool = create_pool(&config.database_url, config.db_max_connections).await?;
    run_migrations(&pool).await?;

    let redis = create_redis_pool(&config.redis_url).await?;
    let queue = Arc::new(RedisJobQueue::new(
        redis.clone(),
        &config.queue_prefix,
        Duration::from_millis(config.job_lease_ms),
    ));

    let notifications: Arc<dyn NotificationStore> = Arc::new(PgNotificationStore::new(pool.clone()));
    let intake = IntakeService::new(notifications.clone(), DispatchScheduler::new(queue));
    let ledger = DeliveryLedger::new(Arc::new(PgAttemptStore::new(pool)), notifications.clone());

    let state = AppState::new(intake, ledger, notifications).with_redis(redis);

    let app = create_router(state)
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let addr: SocketAddr = config.api_bind_addr.parse()?;
    tracing::info!("API server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for shutdown signal");
            }
            tracing::info!("Received shutdown signal, stopping gracefully...");
        })
        .await?;

    tracing::info!("Beacon API server stopped.");
    Ok(())
}
