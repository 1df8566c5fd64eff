//! Shared application state for the Axum API server.

use std::sync::Arc;

use redis::aio::ConnectionManager;

use beacon_engine::intake::IntakeService;
use beacon_engine::ledger::DeliveryLedger;
use beacon_engine::store::NotificationStore;

/// Application state shared across all route handlers via Axum `State`.
#[derive(Clone)]
pub struct AppState {
    pub intake: IntakeService,
    pub ledger: DeliveryLedger,
    pub notifications: Arc<dyn NotificationStore>,
    /// Queue connection, probed by the health check when present
    pub redis: Option<ConnectionManager>,
}

impl AppState {
    pub fn new(
        intake: IntakeService,
        ledger: DeliveryLedger,
        notifications: Arc<dyn NotificationStore>,
    ) -> Self {
        Self {
            intake,
            ledger,
            notifications,
            redis: None,
        }
    }

    pub fn with_redis(mut self, redis: ConnectionManager) -> Self {
        self.redis = Some(redis);
        self
    }
}
