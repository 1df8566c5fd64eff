//! Apple Push Notification service adapter for iOS devices.
//!
//! Uses token-based provider authentication; the token is minted elsewhere
//! and handed in through configuration.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{Map, Value, json};

use beacon_common::delivery::DeliveryAdapter;
use beacon_common::error::DeliveryError;
use beacon_common::types::{Device, NotificationContent, Platform};

pub const APNS_ERROR: &str = "APNS_ERROR";

pub const PRODUCTION_BASE_URL: &str = "https://api.push.apple.com";
pub const SANDBOX_BASE_URL: &str = "https://api.sandbox.push.apple.com";

#[derive(Debug, Clone)]
pub struct ApnsConfig {
    pub base_url: String,
    /// Bundle id the notifications are addressed to
    pub topic: String,
    pub auth_token: String,
    pub timeout: Duration,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    reason: String,
}

/// `aps` dictionary plus custom keys at the top level.
fn payload(content: &NotificationContent) -> Value {
    let mut aps = Map::new();
    aps.insert(
        "alert".to_string(),
        json!({ "title": content.title, "body": content.body }),
    );
    aps.insert("sound".to_string(), json!("default"));
    if content.image_url.is_some() {
        aps.insert("mutable-content".to_string(), json!(1));
    }

    let mut root = Map::new();
    if let Some(Value::Object(fields)) = &content.data {
        root.extend(fields.clone());
    }
    if let Some(link) = &content.deep_link {
        root.insert("deep_link".to_string(), json!(link));
    }
    if let Some(image) = &content.image_url {
        root.insert("image_url".to_string(), json!(image));
    }
    root.insert("aps".to_string(), Value::Object(aps));

    Value::Object(root)
}

pub struct ApnsAdapter {
    client: Client,
    config: ApnsConfig,
}

impl ApnsAdapter {
    pub fn new(config: ApnsConfig) -> anyhow::Result<Self> {
        let client = Client::builder().timeout(config.timeout).build()?;
        Ok(Self { client, config })
    }
}

#[async_trait]
impl DeliveryAdapter for ApnsAdapter {
    fn platform(&self) -> Platform {
        Platform::Ios
    }

    async fn send(
        &self,
        device: &Device,
        content: &NotificationContent,
    ) -> Result<Value, DeliveryError> {
        let url = format!(
            "{}/3/device/{}",
            self.config.base_url.trim_end_matches('/'),
            device.device_token
        );

        let response = self
            .client
            .post(url)
            .bearer_auth(&self.config.auth_token)
            .header("apns-topic", &self.config.topic)
            .header("apns-push-type", "alert")
            .header("apns-priority", "10")
            .json(&payload(content))
            .send()
            .await
            .map_err(|e| DeliveryError::new(APNS_ERROR, format!("request failed: {e}")))?;

        let status = response.status();
        let apns_id = response
            .headers()
            .get("apns-id")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        if !status.is_success() {
            let reason = response
                .json::<ErrorBody>()
                .await
                .map(|body| body.reason)
                .unwrap_or_else(|_| status.to_string());
            tracing::debug!(device_id = %device.id, %status, reason, "APNs rejected notification");
            return Err(DeliveryError::new(APNS_ERROR, reason));
        }

        Ok(json!({ "apns_id": apns_id }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::Path;
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::post;
    use axum::{Json, Router};

    fn device() -> Device {
        Device {
            id: "d1".into(),
            user_id: "u1".into(),
            device_token: "abc123".into(),
            platform: "ios".into(),
            timezone: None,
            notification_preferences: None,
        }
    }

    fn content() -> NotificationContent {
        NotificationContent {
            title: "Hi".into(),
            body: "There".into(),
            image_url: Some("https://img.example/x.png".into()),
            deep_link: None,
            data: Some(json!({"order_id": 7})),
        }
    }

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, router).await.unwrap() });
        format!("http://{addr}")
    }

    fn adapter(base_url: String) -> ApnsAdapter {
        ApnsAdapter::new(ApnsConfig {
            base_url,
            topic: "com.example.app".into(),
            auth_token: "jwt".into(),
            timeout: Duration::from_secs(5),
        })
        .unwrap()
    }

    #[test]
    fn test_payload_shape() {
        let body = payload(&content());
        assert_eq!(body["aps"]["alert"]["title"], "Hi");
        assert_eq!(body["aps"]["mutable-content"], 1);
        assert_eq!(body["order_id"], 7);
        assert_eq!(body["image_url"], "https://img.example/x.png");
    }

    #[tokio::test]
    async fn test_send_success_returns_apns_id() {
        let router = Router::new().route(
            "/3/device/{token}",
            post(|Path(token): Path<String>, headers: HeaderMap| async move {
                assert_eq!(token, "abc123");
                assert_eq!(headers["apns-topic"], "com.example.app");
                assert_eq!(headers["authorization"], "Bearer jwt");
                ([("apns-id", "EC1BF194-B3B2-424A-89A9-5A918A6E6B5B")], StatusCode::OK)
            }),
        );
        let base = serve(router).await;

        let response = adapter(base).send(&device(), &content()).await.unwrap();
        assert_eq!(
            response,
            json!({"apns_id": "EC1BF194-B3B2-424A-89A9-5A918A6E6B5B"})
        );
    }

    #[tokio::test]
    async fn test_send_error_carries_reason() {
        let router = Router::new().route(
            "/3/device/{token}",
            post(|| async { (StatusCode::BAD_REQUEST, Json(json!({"reason": "BadDeviceToken"}))) }),
        );
        let base = serve(router).await;

        let err = adapter(base).send(&device(), &content()).await.unwrap_err();
        assert_eq!(err.code, APNS_ERROR);
        assert_eq!(err.message, "BadDeviceToken");
    }
}
