// Payment gateway adapter. The work item id rides along as the idempotency
// key so a retried charge can never settle twice.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::info;
use uuid::Uuid;

use crate::config::PaymentConfig;
use crate::queue::{PaymentPayload, WorkKind};

use super::{DispatchReceipt, Gateway, GatewayError};

#[derive(Debug, Clone)]
pub struct PaymentGateway {
    client: reqwest::Client,
    api_url: String,
    api_key: String,
}

#[derive(Debug, Deserialize)]
struct ChargeResponse {
    charge_id: Option<String>,
    status: Option<String>,
}

impl PaymentGateway {
    pub fn new(config: &PaymentConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();

        Self {
            client,
            api_url: config.api_url.clone(),
            api_key: config.api_key.clone(),
        }
    }
}

#[async_trait]
impl Gateway for PaymentGateway {
    fn kind(&self) -> WorkKind {
        WorkKind::Payment
    }

    async fn send(
        &self,
        dispatch_ref: Uuid,
        payload: &serde_json::Value,
    ) -> Result<DispatchReceipt, GatewayError> {
        let charge: PaymentPayload = serde_json::from_value(payload.clone())
            .map_err(|e| GatewayError::Data(format!("invalid payment payload: {}", e)))?;

        let response = self
            .client
            .post(format!("{}/charges", self.api_url))
            .bearer_auth(&self.api_key)
            .header("Idempotency-Key", dispatch_ref.to_string())
            .json(&json!({
                "invoice_id": charge.invoice_id,
                "account_id": charge.account_id,
                "amount": charge.amount,
                "currency": charge.currency,
            }))
            .send()
            .await?;

        let status = response.status();
        if status.as_u16() == 422 {
            // Unprocessable charge (closed account, bad method) will not heal
            // on retry.
            return Err(GatewayError::Data("charge rejected by gateway".into()));
        }
        if !status.is_success() {
            return Err(GatewayError::Http {
                status: status.as_u16(),
            });
        }

        let body: ChargeResponse = response.json().await.map_err(|e| GatewayError::Provider {
            message: format!("unreadable response: {}", e),
        })?;

        if matches!(body.status.as_deref(), Some("failed") | Some("declined")) {
            return Err(GatewayError::Provider {
                message: format!("charge {}", body.status.unwrap_or_default()),
            });
        }

        info!(invoice = %charge.invoice_id, reference = %dispatch_ref, "Charge accepted by gateway");

        Ok(DispatchReceipt {
            provider_ref: body.charge_id,
        })
    }
}
