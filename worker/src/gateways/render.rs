// Document renderer adapter. Posts the notice fields to a render service and
// gets raw PDF bytes back.

use std::time::Duration;

use async_trait::async_trait;

use super::{DocumentRenderer, GatewayError, NoticeDocument, RenderedDocument};

#[derive(Debug, Clone)]
pub struct HttpDocumentRenderer {
    client: reqwest::Client,
    api_url: String,
}

impl HttpDocumentRenderer {
    pub fn new(api_url: String) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();

        Self { client, api_url }
    }
}

#[async_trait]
impl DocumentRenderer for HttpDocumentRenderer {
    async fn render_notice(
        &self,
        notice: &NoticeDocument,
    ) -> Result<RenderedDocument, GatewayError> {
        let response = self
            .client
            .post(format!("{}/render/notice", self.api_url))
            .json(notice)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(GatewayError::Http {
                status: status.as_u16(),
            });
        }

        let content = response.bytes().await.map_err(GatewayError::from)?.to_vec();
        if content.is_empty() {
            return Err(GatewayError::Provider {
                message: "render service returned an empty document".into(),
            });
        }

        Ok(RenderedDocument {
            filename: format!("{}-{}.pdf", notice.notice_kind, notice.invoice_number),
            content,
        })
    }
}
