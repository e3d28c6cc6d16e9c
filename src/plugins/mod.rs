//! Metric plugins.
//!
//! A plugin is a one-shot handler: fetch data through the capability
//! pool, map columns to metric keys, hand the samples to the sender.
//! All collection state (caching, baselines) lives in the pool and the
//! sender, never in plugins.

mod activity;
mod instance;

pub use activity::AutovacuumWorkers;
pub use instance::InstanceStats;

use crate::pool::{CapabilityPool, PoolError};
use crate::sender::MetricSender;
use async_trait::async_trait;
use thiserror::Error;

/// Errors a plugin can report back to the poll loop
#[derive(Error, Debug)]
pub enum PluginError {
    #[error("Data source error: {0}")]
    Pool(#[from] PoolError),

    #[error("Unexpected result shape: {0}")]
    ResultShape(String),
}

/// One metric collection handler, invoked once per poll cycle.
#[async_trait]
pub trait Plugin: Send + Sync {
    /// Short plugin name used in log events.
    fn name(&self) -> &str;

    /// Collect and emit this plugin's metrics.
    async fn run(&self, pool: &CapabilityPool, sender: &MetricSender) -> Result<(), PluginError>;
}

/// The plugin set a stock agent runs.
pub fn default_plugins() -> Vec<Box<dyn Plugin>> {
    vec![Box::new(InstanceStats), Box::new(AutovacuumWorkers)]
}
