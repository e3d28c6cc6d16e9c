//! Push-transport backends.
//!
//! A transport accepts one transformed sample at a time and delivers it
//! to a monitoring backend. From the sender's perspective delivery is
//! fire-and-forget: errors are reported back only so the fan-out loop
//! can log them.

mod console;
mod http;

pub use console::ConsoleBackend;
pub use http::{HttpPushBackend, HttpPushConfig};

use crate::sender::MetricValue;
use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur during delivery
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Server returned error {status}: {message}")]
    Server { status: u16, message: String },

    #[error("Rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Option<Duration> },

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Payload serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Max retries exceeded")]
    MaxRetriesExceeded,
}

/// One delivery target for transformed samples.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Short backend name used in log events.
    fn name(&self) -> &str;

    /// Deliver one sample.
    async fn send(
        &self,
        key: &str,
        value: &MetricValue,
        host: Option<&str>,
        clock: i64,
    ) -> Result<(), TransportError>;
}
