//! Autovacuum worker gauge via the operation catalog.
//!
//! Runs the `count_autovacuum` operation, so it exercises the
//! fallback/capability SQL selection end to end.

use super::{Plugin, PluginError};
use crate::pool::CapabilityPool;
use crate::sender::{Delta, MetricSender};
use async_trait::async_trait;

const KEY: &str = "pgsql.autovacuum[count]";

pub struct AutovacuumWorkers;

#[async_trait]
impl Plugin for AutovacuumWorkers {
    fn name(&self) -> &str {
        "autovacuum"
    }

    async fn run(&self, pool: &CapabilityPool, sender: &MetricSender) -> Result<(), PluginError> {
        let rows = pool.run_operation("count_autovacuum", None).await?;
        let count = rows
            .into_iter()
            .next()
            .and_then(|row| row.into_iter().next())
            .and_then(|field| field.as_i64())
            .ok_or_else(|| {
                PluginError::ResultShape("count_autovacuum returned no count".to_string())
            })?;

        sender.send(KEY, count, Delta::None, None, None).await;
        Ok(())
    }
}
