// SMS gateway adapter. JSON POST to the provider with a bearer key; the
// provider's message id comes back as the dispatch receipt.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::info;
use uuid::Uuid;

use crate::config::SmsConfig;
use crate::queue::{SmsPayload, WorkKind};

use super::{DispatchReceipt, Gateway, GatewayError};

#[derive(Debug, Clone)]
pub struct SmsGateway {
    client: reqwest::Client,
    api_url: String,
    api_key: String,
    sender: String,
}

#[derive(Debug, Deserialize)]
struct SmsResponse {
    message_id: Option<String>,
}

impl SmsGateway {
    pub fn new(config: &SmsConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();

        Self {
            client,
            api_url: config.api_url.clone(),
            api_key: config.api_key.clone(),
            sender: config.sender.clone(),
        }
    }
}

#[async_trait]
impl Gateway for SmsGateway {
    fn kind(&self) -> WorkKind {
        WorkKind::Sms
    }

    async fn send(
        &self,
        dispatch_ref: Uuid,
        payload: &serde_json::Value,
    ) -> Result<DispatchReceipt, GatewayError> {
        let sms: SmsPayload = serde_json::from_value(payload.clone())
            .map_err(|e| GatewayError::Data(format!("invalid sms payload: {}", e)))?;

        if sms.to.trim().is_empty() {
            return Err(GatewayError::Data("missing destination number".into()));
        }

        let response = self
            .client
            .post(format!("{}/messages", self.api_url))
            .bearer_auth(&self.api_key)
            .json(&json!({
                "to": sms.to,
                "from": self.sender,
                "message": sms.message,
                "reference": dispatch_ref,
            }))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(GatewayError::Http {
                status: status.as_u16(),
            });
        }

        let body: SmsResponse = response.json().await.map_err(|e| GatewayError::Provider {
            message: format!("unreadable response: {}", e),
        })?;

        info!(to = %sms.to, reference = %dispatch_ref, "SMS accepted by provider");

        Ok(DispatchReceipt {
            provider_ref: body.message_id,
        })
    }
}
