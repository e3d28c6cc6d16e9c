//! PostgreSQL integration tests
//!
//! These tests verify the capability pool against a real database.
//!
//! # Requirements
//!
//! - Docker installed and running
//! - Or a reachable PostgreSQL instance
//!
//! # Running
//!
//! ```bash
//! # Start PostgreSQL in Docker
//! docker run --rm -d \
//!     --name pgmon-test-pg \
//!     -e POSTGRES_PASSWORD=testpass \
//!     -p 5432:5432 \
//!     postgres:16-alpine
//!
//! # Run tests
//! PGHOST=127.0.0.1 PGUSER=postgres PGPASSWORD=testpass \
//!     cargo test --test integration postgres
//!
//! # Cleanup
//! docker stop pgmon-test-pg
//! ```

use pgmon_agent::connection::{ConnectionSettings, SslMode};
use pgmon_agent::pool::CapabilityPool;
use std::env;

/// Build connection settings from PG* environment variables
fn get_test_settings() -> Option<ConnectionSettings> {
    let host = env::var("PGHOST").ok()?;
    Some(ConnectionSettings {
        host,
        port: env::var("PGPORT").ok().and_then(|p| p.parse().ok()).unwrap_or(5432),
        user: env::var("PGUSER").unwrap_or_else(|_| "postgres".to_string()),
        password: env::var("PGPASSWORD").ok(),
        database: env::var("PGDATABASE").unwrap_or_else(|_| "postgres".to_string()),
        ssl_mode: SslMode::Prefer,
    })
}

/// Skip test if no database is configured
macro_rules! require_database {
    () => {
        match get_test_settings() {
            Some(settings) => settings,
            None => {
                eprintln!("Skipping test: PGHOST not set");
                return;
            }
        }
    };
}

#[tokio::test]
async fn test_postgres_connection_and_version() {
    let settings = require_database!();

    let pool = CapabilityPool::new(settings);
    let version = pool.server_version(None).await;
    assert!(version.is_ok(), "Failed to query version: {:?}", version.err());

    let version = version.unwrap();
    assert!(
        pool.server_version_greater("9.6", None).await.unwrap(),
        "Unexpectedly old server: {}",
        version
    );

    println!("Detected version: {}", version);
}

#[tokio::test]
async fn test_postgres_probes() {
    let settings = require_database!();

    let pool = CapabilityPool::new(settings);

    // A fresh docker container is a primary without the helper schema.
    assert!(!pool.in_recovery(None).await.expect("recovery probe"));
    assert!(!pool.is_bootstrapped(None).await.expect("bootstrap probe"));

    // Stock PostgreSQL is not a vendor build.
    assert!(!pool.is_pgpro(None).await);
    assert!(!pool.is_pgpro_ee(None).await);

    // plpgsql ships with every PostgreSQL.
    assert!(pool
        .extension_installed("plpgsql", None)
        .await
        .expect("extension probe"));
    assert!(!pool
        .extension_installed("no_such_extension", None)
        .await
        .expect("extension probe"));
}

#[tokio::test]
async fn test_postgres_database_listing() {
    let settings = require_database!();

    let pool = CapabilityPool::new(settings);
    let databases = pool.databases().await.expect("listing succeeds");

    for excluded in ["template0", "template1", "postgres"] {
        assert!(
            !databases.iter().any(|name| name == excluded),
            "excluded database {} was listed",
            excluded
        );
    }
}

#[tokio::test]
async fn test_postgres_run_operation_fallback() {
    let settings = require_database!();

    let pool = CapabilityPool::new(settings);

    // No bootstrap schema in a fresh container: the fallback SQL runs.
    let rows = pool
        .run_operation("count_autovacuum", None)
        .await
        .expect("operation runs");

    let count = rows[0][0].as_i64().expect("count decodes");
    assert!(count >= 0);
}
