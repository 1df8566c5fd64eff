//! Firebase Cloud Messaging (HTTP v1) adapter for Android devices.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use beacon_common::delivery::DeliveryAdapter;
use beacon_common::error::DeliveryError;
use beacon_common::types::{Device, NotificationContent, Platform};

pub const FCM_ERROR: &str = "FCM_ERROR";

pub const DEFAULT_BASE_URL: &str = "https://fcm.googleapis.com";

#[derive(Debug, Clone)]
pub struct FcmConfig {
    pub base_url: String,
    pub project_id: String,
    /// OAuth2 bearer token for the Firebase service account
    pub access_token: String,
    pub timeout: Duration,
}

#[derive(Debug, Serialize)]
struct SendRequest<'a> {
    message: Message<'a>,
}

#[derive(Debug, Serialize)]
struct Message<'a> {
    token: &'a str,
    notification: FcmNotification<'a>,
    #[serde(skip_serializing_if = "Map::is_empty")]
    data: Map<String, Value>,
}

#[derive(Debug, Serialize)]
struct FcmNotification<'a> {
    title: &'a str,
    body: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    image: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct SendResponse {
    name: String,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

/// FCM data payloads only carry string values.
fn string_data(content: &NotificationContent) -> Map<String, Value> {
    let mut data = Map::new();

    if let Some(Value::Object(fields)) = &content.data {
        for (key, value) in fields {
            let text = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            data.insert(key.clone(), Value::String(text));
        }
    }
    if let Some(link) = &content.deep_link {
        data.insert("deep_link".to_string(), Value::String(link.clone()));
    }

    data
}

pub struct FcmAdapter {
    client: Client,
    config: FcmConfig,
}

impl FcmAdapter {
    pub fn new(config: FcmConfig) -> anyhow::Result<Self> {
        let client = Client::builder().timeout(config.timeout).build()?;
        Ok(Self { client, config })
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/v1/projects/{}/messages:send",
            self.config.base_url.trim_end_matches('/'),
            self.config.project_id
        )
    }
}

#[async_trait]
impl DeliveryAdapter for FcmAdapter {
    fn platform(&self) -> Platform {
        Platform::Android
    }

    async fn send(
        &self,
        device: &Device,
        content: &NotificationContent,
    ) -> Result<Value, DeliveryError> {
        let request = SendRequest {
            message: Message {
                token: &device.device_token,
                notification: FcmNotification {
                    title: &content.title,
                    body: &content.body,
                    image: content.image_url.as_deref(),
                },
                data: string_data(content),
            },
        };

        let response = self
            .client
            .post(self.endpoint())
            .bearer_auth(&self.config.access_token)
            .json(&request)
            .send()
            .await
            .map_err(|e| DeliveryError::new(FCM_ERROR, format!("request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let reason = match response.json::<ErrorEnvelope>().await {
                Ok(envelope) => {
                    let code = envelope.error.status.unwrap_or_else(|| status.to_string());
                    match envelope.error.message {
                        Some(message) => format!("{code}: {message}"),
                        None => code,
                    }
                }
                Err(_) => status.to_string(),
            };
            tracing::debug!(device_id = %device.id, %status, reason, "FCM rejected message");
            return Err(DeliveryError::new(FCM_ERROR, reason));
        }

        let sent: SendResponse = response
            .json()
            .await
            .map_err(|e| DeliveryError::new(FCM_ERROR, format!("unreadable response: {e}")))?;

        Ok(json!({ "message_id": sent.name }))
    }
}
