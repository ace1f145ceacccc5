// Email gateway adapter over a pooled SMTP transport. Notices carry an
// optional PDF attachment alongside the text/HTML alternative parts.

use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use lettre::{
    message::{header::ContentType, Attachment, Mailbox, MultiPart, SinglePart},
    transport::smtp::{authentication::Credentials, PoolConfig},
    AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
};
use tracing::info;
use uuid::Uuid;

use crate::config::SmtpConfig;
use crate::queue::{EmailPayload, WorkKind};

use super::{DispatchReceipt, Gateway, GatewayError};

#[derive(Debug, Clone)]
pub struct SmtpEmailGateway {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from_email: String,
    from_name: String,
}

impl SmtpEmailGateway {
    pub fn new(config: &SmtpConfig) -> Self {
        let creds = Credentials::new(config.username.clone(), config.password.clone());

        let transport = AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&config.host)
            .port(config.port)
            .credentials(creds)
            .pool_config(PoolConfig::new().max_size(10))
            .timeout(Some(Duration::from_secs(10)))
            .build();

        Self {
            transport,
            from_email: config.from_email.clone(),
            from_name: config.from_name.clone(),
        }
    }

    fn build_message(&self, email: &EmailPayload) -> Result<Message, GatewayError> {
        let from = format!("{} <{}>", self.from_name, self.from_email)
            .parse::<Mailbox>()
            .map_err(|e| GatewayError::Data(format!("invalid sender address: {}", e)))?;

        let to = match &email.to_name {
            Some(name) => format!("{} <{}>", name, email.to),
            None => email.to.clone(),
        }
        .parse::<Mailbox>()
        .map_err(|e| GatewayError::Data(format!("invalid recipient address: {}", e)))?;

        let alternative = MultiPart::alternative()
            .singlepart(
                SinglePart::builder()
                    .header(ContentType::TEXT_PLAIN)
                    .body(email.text_body.clone().unwrap_or_default()),
            )
            .singlepart(
                SinglePart::builder()
                    .header(ContentType::TEXT_HTML)
                    .body(email.html_body.clone()),
            );

        let builder = Message::builder().from(from).to(to).subject(&email.subject);

        let message = match &email.attachment {
            Some(attachment) => {
                let content = BASE64.decode(&attachment.content).map_err(|e| {
                    GatewayError::Data(format!("attachment is not valid base64: {}", e))
                })?;
                let content_type = ContentType::parse("application/pdf")
                    .map_err(|e| GatewayError::Data(format!("bad content type: {}", e)))?;

                builder.multipart(
                    MultiPart::mixed().multipart(alternative).singlepart(
                        Attachment::new(attachment.filename.clone()).body(content, content_type),
                    ),
                )
            }
            None => builder.multipart(alternative),
        }
        .map_err(|e| GatewayError::Data(format!("could not build message: {}", e)))?;

        Ok(message)
    }
}

#[async_trait]
impl Gateway for SmtpEmailGateway {
    fn kind(&self) -> WorkKind {
        WorkKind::Email
    }

    async fn send(
        &self,
        dispatch_ref: Uuid,
        payload: &serde_json::Value,
    ) -> Result<DispatchReceipt, GatewayError> {
        let email: EmailPayload = serde_json::from_value(payload.clone())
            .map_err(|e| GatewayError::Data(format!("invalid email payload: {}", e)))?;

        if email.to.trim().is_empty() {
            return Err(GatewayError::Data("missing recipient address".into()));
        }

        let message = self.build_message(&email)?;

        match self.transport.send(message).await {
            Ok(response) => {
                info!(to = %email.to, reference = %dispatch_ref, "Email accepted by SMTP relay");
                Ok(DispatchReceipt {
                    provider_ref: response.message().next().map(|s| s.to_string()),
                })
            }
            Err(e) => Err(GatewayError::Provider {
                message: e.to_string(),
            }),
        }
    }
}
