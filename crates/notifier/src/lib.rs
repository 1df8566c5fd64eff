//! Platform delivery adapters.
//!
//! - Android via Firebase Cloud Messaging HTTP v1
//! - iOS via APNs
//!
//! An adapter is only registered when its credentials are configured. Devices
//! on a platform without an adapter are recorded as `UNKNOWN_PLATFORM`.

pub mod apns;
pub mod fcm;

use std::sync::Arc;
use std::time::Duration;

use beacon_common::config::AppConfig;
use beacon_common::delivery::AdapterRegistry;

use crate::apns::{ApnsAdapter, ApnsConfig};
use crate::fcm::{FcmAdapter, FcmConfig};

/// Build the adapter registry from configuration.
pub fn build_registry(config: &AppConfig) -> anyhow::Result<AdapterRegistry> {
    let timeout = Duration::from_millis(config.push_request_timeout_ms);
    let mut registry = AdapterRegistry::new();

    match (&config.fcm_project_id, &config.fcm_access_token) {
        (Some(project_id), Some(access_token)) => {
            registry.register(Arc::new(FcmAdapter::new(FcmConfig {
                base_url: fcm::DEFAULT_BASE_URL.to_string(),
                project_id: project_id.clone(),
                access_token: access_token.clone(),
                timeout,
            })?));
            tracing::info!(project_id = %project_id, "FCM adapter registered");
        }
        _ => tracing::warn!("FCM credentials not configured, Android delivery disabled"),
    }

    match (&config.apns_topic, &config.apns_auth_token) {
        (Some(topic), Some(auth_token)) => {
            let base_url = if config.apns_sandbox {
                apns::SANDBOX_BASE_URL
            } else {
                apns::PRODUCTION_BASE_URL
            };
            registry.register(Arc::new(ApnsAdapter::new(ApnsConfig {
                base_url: base_url.to_string(),
                topic: topic.clone(),
                auth_token: auth_token.clone(),
                timeout,
            })?));
            tracing::info!(topic = %topic, sandbox = config.apns_sandbox, "APNs adapter registered");
        }
        _ => tracing::warn!("APNs credentials not configured, iOS delivery disabled"),
    }

    Ok(registry)
}
