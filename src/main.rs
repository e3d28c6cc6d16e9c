//! pgmon-agent - PostgreSQL metrics collection agent.
//!
//! Usage:
//!   pgmon-agent [OPTIONS]
//!
//! Options:
//!   -c, --config <FILE>    Path to configuration file
//!   --dry-run              Collect metrics once and print to stdout
//!   --test-connection      Test database and push endpoint connections
//!   -v, --verbose          Enable verbose logging
//!   -V, --version          Print version information
//!   -h, --help             Print help

use anyhow::{Context, Result};
use clap::Parser;
use pgmon_agent::config::Config;
use pgmon_agent::plugins::{default_plugins, Plugin};
use pgmon_agent::pool::CapabilityPool;
use pgmon_agent::sender::MetricSender;
use pgmon_agent::transport::{ConsoleBackend, HttpPushBackend, HttpPushConfig};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, Level};
use tracing_subscriber::{fmt, EnvFilter};

/// pgmon-agent - PostgreSQL metrics collector
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Run two collection cycles and print samples to stdout (no upload)
    #[arg(long)]
    dry_run: bool,

    /// Test database and push endpoint connections, then exit
    #[arg(long)]
    test_connection: bool,

    /// Enable verbose logging (debug level)
    #[arg(short, long)]
    verbose: bool,

    /// Output logs in JSON format
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Load configuration
    let config = load_config(&args)?;

    // Setup logging
    setup_logging(&args, &config);

    info!(version = env!("CARGO_PKG_VERSION"), "Starting pgmon-agent");

    let settings = config.postgres.settings();
    let pool = CapabilityPool::new(settings.clone())
        .with_query_timeout(config.postgres.query_timeout());

    // Handle test connection mode
    if args.test_connection {
        return test_connections(&config, &pool).await;
    }

    let sender =
        MetricSender::new().with_send_timeout(Duration::from_secs(config.push.send_timeout));
    let plugins = default_plugins();

    // Handle dry-run mode: two cycles so delta metrics get past their
    // baseline seeding.
    if args.dry_run {
        sender.set_backends(vec![Arc::new(ConsoleBackend)]);
        run_cycle(&pool, &sender, &plugins).await;
        tokio::time::sleep(Duration::from_secs(1)).await;
        run_cycle(&pool, &sender, &plugins).await;
        return Ok(());
    }

    let mut push_config = HttpPushConfig::new(
        config.push.endpoint.clone(),
        config.push.api_key.clone(),
    );
    push_config.timeout = Duration::from_secs(config.push.timeout);
    push_config.max_retries = config.push.retries;
    let backend = HttpPushBackend::new(push_config, &settings.display())
        .context("Failed to create push backend")?;
    sender.set_backends(vec![Arc::new(backend)]);

    // Setup shutdown signal handling
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    info!(
        interval_secs = config.collection.interval().as_secs(),
        "Starting metrics collection loop"
    );

    let mut ticker = interval(config.collection.interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                run_cycle(&pool, &sender, &plugins).await;
            }
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }

    info!("pgmon-agent stopped");
    Ok(())
}

/// One poll cycle: every plugin in turn. A failing plugin is logged and
/// does not abort the cycle.
async fn run_cycle(pool: &CapabilityPool, sender: &MetricSender, plugins: &[Box<dyn Plugin>]) {
    debug!("Starting metrics collection cycle");

    let start = std::time::Instant::now();

    for plugin in plugins {
        if let Err(e) = plugin.run(pool, sender).await {
            error!(plugin = plugin.name(), error = %e, "Plugin failed");
        }
    }

    info!(
        duration_ms = start.elapsed().as_millis(),
        plugins = plugins.len(),
        "Metrics cycle completed"
    );
}

fn load_config(args: &Args) -> Result<Config> {
    if let Some(ref path) = args.config {
        Config::from_file(path).context(format!("Failed to load config from {:?}", path))
    } else {
        Config::from_env().context("Failed to load config from environment")
    }
}

fn setup_logging(args: &Args, config: &Config) {
    let level = if args.verbose {
        Level::DEBUG
    } else {
        config.logging.level.into()
    };

    let filter = EnvFilter::from_default_env()
        .add_directive(format!("pgmon_agent={}", level).parse().unwrap())
        .add_directive("sqlx=warn".parse().unwrap())
        .add_directive("reqwest=warn".parse().unwrap());

    let use_json =
        args.json_logs || config.logging.format == pgmon_agent::config::LogFormat::Json;

    if use_json {
        fmt()
            .json()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    } else {
        fmt()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    }
}

async fn test_connections(config: &Config, pool: &CapabilityPool) -> Result<()> {
    println!("Testing database connection...");

    match pool.server_version(None).await {
        Ok(version) => {
            let recovery = pool.in_recovery(None).await.unwrap_or(false);
            println!("  Database: OK (version: {}, in recovery: {})", version, recovery);
        }
        Err(e) => {
            eprintln!("  Database: FAILED - {}", e);
            return Err(e.into());
        }
    }

    println!("\nTesting push endpoint connection...");

    let push_config = HttpPushConfig::new(
        config.push.endpoint.clone(),
        config.push.api_key.clone(),
    );
    let backend = HttpPushBackend::new(push_config, "test-connection")?;

    match backend.test_connection().await {
        Ok(()) => println!("  Push endpoint: OK"),
        Err(e) => {
            eprintln!("  Push endpoint: FAILED - {}", e);
            return Err(e.into());
        }
    }

    println!("\nAll connections verified successfully!");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
