//! Console backend for dry runs: prints samples instead of shipping
//! them.

use super::{Transport, TransportError};
use crate::sender::{to_json, MetricValue};
use async_trait::async_trait;

pub struct ConsoleBackend;

#[async_trait]
impl Transport for ConsoleBackend {
    fn name(&self) -> &str {
        "console"
    }

    async fn send(
        &self,
        key: &str,
        value: &MetricValue,
        host: Option<&str>,
        clock: i64,
    ) -> Result<(), TransportError> {
        println!("{} {} {} {}", clock, host.unwrap_or("-"), key, to_json(value)?);
        Ok(())
    }
}
