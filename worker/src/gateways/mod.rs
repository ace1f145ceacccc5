// External Gateway Adapters - narrow contracts over the provider APIs
//
// The worker core only depends on these traits; the concrete adapters talk
// HTTP/SMTP with client-side timeouts so a slow provider is a failure, never
// a hang. Transient vs. permanent classification lives on GatewayError and
// drives the retry queue's outcome mapping.

pub mod email;
pub mod payment;
pub mod radius;
pub mod render;
pub mod sms;

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

use uplink_shared::SessionState;

use crate::queue::WorkKind;

pub use email::SmtpEmailGateway;
pub use payment::PaymentGateway;
pub use radius::RadiusGateway;
pub use render::HttpDocumentRenderer;
pub use sms::SmsGateway;

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("Gateway request timed out")]
    Timeout,
    #[error("Gateway returned HTTP {status}")]
    Http { status: u16 },
    #[error("Network error: {0}")]
    Network(String),
    #[error("Provider error: {message}")]
    Provider { message: String },
    #[error("Data error: {0}")]
    Data(String),
}

impl GatewayError {
    /// Transient errors are worth retrying; a data error never is.
    pub fn is_transient(&self) -> bool {
        !matches!(self, GatewayError::Data(_))
    }
}

impl From<reqwest::Error> for GatewayError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            GatewayError::Timeout
        } else if let Some(status) = err.status() {
            GatewayError::Http {
                status: status.as_u16(),
            }
        } else {
            GatewayError::Network(err.to_string())
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct DispatchReceipt {
    /// Provider-side reference (message id, charge id) when one is returned.
    pub provider_ref: Option<String>,
}

/// One dispatch adapter per work-item kind. `dispatch_ref` is stable across
/// retries of the same item and doubles as the provider idempotency key.
#[async_trait]
pub trait Gateway: Send + Sync {
    fn kind(&self) -> WorkKind;

    async fn send(
        &self,
        dispatch_ref: Uuid,
        payload: &serde_json::Value,
    ) -> Result<DispatchReceipt, GatewayError>;
}

/// RADIUS control plane: forced disconnect and re-authorization.
#[async_trait]
pub trait RadiusControl: Send + Sync {
    async fn disconnect(&self, username: &str) -> Result<(), GatewayError>;

    async fn authorize(&self, username: &str) -> Result<(), GatewayError>;
}

/// Authoritative source of subscriber session state. Per-subject failure is
/// part of the signature so one unreachable subject never blocks the batch.
#[async_trait]
pub trait SessionAuthority: Send + Sync {
    async fn session_states(
        &self,
        subjects: &[String],
    ) -> Vec<(String, Result<SessionState, GatewayError>)>;
}

#[derive(Debug, Clone)]
pub struct RenderedDocument {
    pub filename: String,
    pub content: Vec<u8>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct NoticeDocument {
    pub account_name: String,
    pub invoice_number: String,
    pub amount_due: String,
    pub due_date: String,
    pub days_overdue: i32,
    pub notice_kind: String,
}

/// Renders the PDF that rides along an overdue-notice email.
#[async_trait]
pub trait DocumentRenderer: Send + Sync {
    async fn render_notice(&self, notice: &NoticeDocument)
        -> Result<RenderedDocument, GatewayError>;
}
