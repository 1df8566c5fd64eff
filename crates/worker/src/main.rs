use std::sync::Arc;
use std::time::Duration;

use beacon_common::config::AppConfig;
use beacon_common::{db, redis_pool};
use beacon_engine::directory::PgDeviceDirectory;
use beacon_engine::ledger::{DeliveryLedger, PgAttemptStore};
use beacon_engine::processor::NotificationProcessor;
use beacon_engine::queue::{JobQueue, RedisJobQueue};
use beacon_engine::retry::RetryCoordinator;
use beacon_engine::store::{NotificationStore, PgNotificationStore};
use beacon_worker::consumer::JobConsumer;
use beacon_worker::supervisor::RetrySupervisor;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "beacon_worker=info,beacon_engine=info,beacon_notifier=info".into()),
        )
        .json()
        .init();

    tracing::info!("Beacon worker starting...");

    let config = AppConfig::from_env()?;

    let pool = db::create_pool(&config.database_url, config.db_max_connections).await?;
    db::run_migrations(&pool).await?;

    let redis = redis_pool::create_redis_pool(&config.redis_url).await?;
    let queue: Arc<dyn JobQueue> = Arc::new(RedisJobQueue::new(
        redis,
        &config.queue_prefix,
        Duration::from_millis(config.job_lease_ms),
    ));

    let notifications: Arc<dyn NotificationStore> = Arc::new(PgNotificationStore::new(pool.clone()));
    let ledger = DeliveryLedger::new(
        Arc::new(PgAttemptStore::new(pool.clone())),
        notifications.clone(),
    );
    let adapters = beacon_notifier::build_registry(&config)?;
    let processor = NotificationProcessor::new(
        notifications,
        Arc::new(PgDeviceDirectory::new(pool)),
        ledger,
        adapters,
    );

    let supervisor = config
        .retry_supervisor_enabled
        .then(|| RetrySupervisor::new(RetryCoordinator::new(queue.clone())));

    let consumer = JobConsumer::new(
        queue,
        processor,
        supervisor,
        config.worker_concurrency,
        config.worker_poll_interval_ms,
    );

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let mut consumer_task = tokio::spawn(async move { consumer.run(shutdown_rx).await });

    // Run with graceful shutdown on Ctrl+C
    tokio::select! {
        result = &mut consumer_task => {
            if let Err(e) = result? {
                tracing::error!(error = %e, "Job consumer exited with error");
                return Err(e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received shutdown signal, stopping gracefully...");
            shutdown_tx.send(true)?;
            consumer_task.await??;
        }
    }

    tracing::info!("Beacon worker stopped.");
    Ok(())
}
