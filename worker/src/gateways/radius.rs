// RADIUS control-plane adapter. Serves two contracts: forced session control
// (disconnect/authorize) and the session-state snapshot the sync engine polls.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::{info, warn};

use uplink_shared::SessionState;

use crate::config::RadiusConfig;

use super::{GatewayError, RadiusControl, SessionAuthority};

#[derive(Debug, Clone)]
pub struct RadiusGateway {
    client: reqwest::Client,
    api_url: String,
    api_secret: String,
}

#[derive(Debug, Deserialize)]
struct SessionRow {
    username: String,
    state: String,
}

#[derive(Debug, Deserialize)]
struct SessionsResponse {
    sessions: Vec<SessionRow>,
}

impl RadiusGateway {
    pub fn new(config: &RadiusConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();

        Self {
            client,
            api_url: config.api_url.clone(),
            api_secret: config.api_secret.clone(),
        }
    }

    async fn control(&self, action: &str, username: &str) -> Result<(), GatewayError> {
        let response = self
            .client
            .post(format!("{}/sessions/{}", self.api_url, action))
            .bearer_auth(&self.api_secret)
            .json(&json!({ "username": username }))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(GatewayError::Http {
                status: status.as_u16(),
            });
        }

        info!(username, action, "RADIUS control call accepted");
        Ok(())
    }
}

#[async_trait]
impl RadiusControl for RadiusGateway {
    async fn disconnect(&self, username: &str) -> Result<(), GatewayError> {
        self.control("disconnect", username).await
    }

    async fn authorize(&self, username: &str) -> Result<(), GatewayError> {
        self.control("authorize", username).await
    }
}

#[async_trait]
impl SessionAuthority for RadiusGateway {
    async fn session_states(
        &self,
        subjects: &[String],
    ) -> Vec<(String, Result<SessionState, GatewayError>)> {
        // One snapshot call for the whole batch; a subject the server does not
        // mention is offline, not an error.
        let snapshot = async {
            let response = self
                .client
                .get(format!("{}/sessions", self.api_url))
                .bearer_auth(&self.api_secret)
                .send()
                .await?;

            let status = response.status();
            if !status.is_success() {
                return Err(GatewayError::Http {
                    status: status.as_u16(),
                });
            }

            let body: SessionsResponse =
                response.json().await.map_err(|e| GatewayError::Provider {
                    message: format!("unreadable session snapshot: {}", e),
                })?;
            Ok(body)
        }
        .await;

        match snapshot {
            Ok(body) => {
                let online: std::collections::HashMap<&str, SessionState> = body
                    .sessions
                    .iter()
                    .map(|row| {
                        (
                            row.username.as_str(),
                            SessionState::parse(&row.state).unwrap_or(SessionState::Unknown),
                        )
                    })
                    .collect();

                subjects
                    .iter()
                    .map(|subject| {
                        let state = online
                            .get(subject.as_str())
                            .copied()
                            .unwrap_or(SessionState::Offline);
                        (subject.clone(), Ok(state))
                    })
                    .collect()
            }
            Err(e) => {
                warn!(error = %e, "RADIUS session snapshot failed for the whole batch");
                let message = e.to_string();
                subjects
                    .iter()
                    .map(|subject| {
                        (
                            subject.clone(),
                            Err(GatewayError::Provider {
                                message: message.clone(),
                            }),
                        )
                    })
                    .collect()
            }
        }
    }
}
