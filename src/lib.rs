//! pgmon-agent - PostgreSQL metrics collection agent.
//!
//! This crate collects metrics from one or more PostgreSQL databases and
//! pushes them to a monitoring backend.
//!
//! # Architecture
//!
//! - [`pool::CapabilityPool`] owns one lazily created connection per
//!   logical database and caches capability probes (server version,
//!   recovery state, bootstrap state, vendor flavor) that decide which
//!   SQL variant a plugin runs.
//! - [`sender::MetricSender`] converts counter samples into changes or
//!   per-second rates against a per-(host, key) baseline and fans the
//!   result out to every registered [`transport::Transport`] backend.
//! - [`plugins::Plugin`] implementations are one-shot handlers invoked
//!   once per poll cycle: query the pool, map columns to metric keys,
//!   hand samples to the sender.
//!
//! # Example
//!
//! ```no_run
//! use pgmon_agent::config::Config;
//! use pgmon_agent::plugins::default_plugins;
//! use pgmon_agent::pool::CapabilityPool;
//! use pgmon_agent::sender::MetricSender;
//! use pgmon_agent::transport::ConsoleBackend;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::from_env()?;
//!
//!     let pool = CapabilityPool::new(config.postgres.settings());
//!     let sender = MetricSender::new();
//!     sender.set_backends(vec![Arc::new(ConsoleBackend)]);
//!
//!     for plugin in default_plugins() {
//!         plugin.run(&pool, &sender).await?;
//!     }
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod connection;
pub mod plugins;
pub mod pool;
pub mod sender;
pub mod transport;

pub use config::Config;
pub use pool::CapabilityPool;
pub use sender::MetricSender;
