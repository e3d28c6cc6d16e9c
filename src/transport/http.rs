//! HTTP push backend.
//!
//! Delivers samples to a monitoring endpoint as JSON with:
//! - Retry logic with exponential backoff
//! - Request compression (gzip)
//! - Error handling and rate limiting

use super::{Transport, TransportError};
use crate::sender::MetricValue;
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Configuration for the HTTP push backend
#[derive(Debug, Clone)]
pub struct HttpPushConfig {
    /// Ingest endpoint URL
    pub endpoint: String,

    /// API key for authentication
    pub api_key: String,

    /// Per-request timeout
    pub timeout: Duration,

    /// Maximum number of retries per sample
    pub max_retries: u32,

    /// Enable gzip compression
    pub compress: bool,
}

impl HttpPushConfig {
    pub fn new(endpoint: String, api_key: String) -> Self {
        Self {
            endpoint,
            api_key,
            timeout: Duration::from_secs(10),
            max_retries: 3,
            compress: true,
        }
    }
}

/// One sample on the wire
#[derive(Serialize)]
struct PushSample<'a> {
    agent: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    host: Option<&'a str>,
    key: &'a str,
    value: &'a MetricValue,
    clock: i64,
}

/// HTTP push transport
pub struct HttpPushBackend {
    client: Client,
    config: HttpPushConfig,
    agent_id: String,
}

impl HttpPushBackend {
    /// Create a backend. `identity` is any stable string describing the
    /// monitored instance (the redacted connection string); it is hashed
    /// into the agent id sent with every sample.
    pub fn new(config: HttpPushConfig, identity: &str) -> Result<Self, TransportError> {
        let client = Client::builder()
            .timeout(config.timeout)
            .gzip(config.compress)
            .user_agent(format!("pgmon-agent/{}", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            client,
            config,
            agent_id: agent_id(identity),
        })
    }

    async fn send_request(&self, body: &[u8]) -> Result<(), TransportError> {
        let response = self
            .client
            .post(&self.config.endpoint)
            .header("Content-Type", "application/json")
            .header("Authorization", format!("Bearer {}", self.config.api_key))
            .header("X-Agent-Version", env!("CARGO_PKG_VERSION"))
            .body(body.to_vec())
            .send()
            .await?;

        let status = response.status();

        debug!(status = %status, "Received response from push endpoint");

        match status {
            StatusCode::OK | StatusCode::CREATED | StatusCode::ACCEPTED => Ok(()),

            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                let message = response.text().await.unwrap_or_default();
                Err(TransportError::Auth(message))
            }

            StatusCode::TOO_MANY_REQUESTS => {
                let retry_after = response
                    .headers()
                    .get("Retry-After")
                    .and_then(|v| v.to_str().ok())
                    .and_then(|s| s.parse::<u64>().ok())
                    .map(Duration::from_secs);

                Err(TransportError::RateLimited { retry_after })
            }

            _ => {
                let message = response.text().await.unwrap_or_default();
                Err(TransportError::Server {
                    status: status.as_u16(),
                    message,
                })
            }
        }
    }

    /// Verify the endpoint is reachable and the key is accepted.
    pub async fn test_connection(&self) -> Result<(), TransportError> {
        debug!("Testing connection to push endpoint");

        let response = self
            .client
            .get(format!(
                "{}/health",
                self.config.endpoint.trim_end_matches("/ingest")
            ))
            .header("Authorization", format!("Bearer {}", self.config.api_key))
            .send()
            .await?;

        if response.status().is_success() {
            info!("Connection to push endpoint verified");
            Ok(())
        } else if response.status() == StatusCode::UNAUTHORIZED {
            Err(TransportError::Auth("Invalid API key".to_string()))
        } else {
            Err(TransportError::Server {
                status: response.status().as_u16(),
                message: "Health check failed".to_string(),
            })
        }
    }
}

#[async_trait]
impl Transport for HttpPushBackend {
    fn name(&self) -> &str {
        "http"
    }

    async fn send(
        &self,
        key: &str,
        value: &MetricValue,
        host: Option<&str>,
        clock: i64,
    ) -> Result<(), TransportError> {
        let sample = PushSample {
            agent: &self.agent_id,
            host,
            key,
            value,
            clock,
        };
        let body = serde_json::to_vec(&sample)?;

        let mut last_error = None;
        let mut retry_delay = Duration::from_secs(1);

        for attempt in 0..=self.config.max_retries {
            if attempt > 0 {
                warn!(attempt, key, "Retrying sample delivery after failure");
                tokio::time::sleep(retry_delay).await;
                retry_delay *= 2; // Exponential backoff
            }

            match self.send_request(&body).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    // Don't retry on auth errors
                    if matches!(e, TransportError::Auth(_)) {
                        return Err(e);
                    }

                    // Handle rate limiting
                    if let TransportError::RateLimited { retry_after } = &e {
                        if let Some(duration) = retry_after {
                            retry_delay = *duration;
                        }
                    }

                    error!(error = %e, attempt, key, "Sample delivery attempt failed");
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or(TransportError::MaxRetriesExceeded))
    }
}

/// Stable agent identifier: first 16 bytes of the identity hash.
fn agent_id(identity: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(identity.as_bytes());
    let digest = hasher.finalize();
    hex::encode(&digest[..16])
}
