//! Data-source capability layer.
//!
//! [`CapabilityPool`] owns one lazily created connection per logical
//! database and answers capability questions about each of them: server
//! version, recovery state, whether the `pgmon` helper schema is
//! installed, vendor flavor, extension presence. Probing a production
//! server costs a round trip on every poll cycle, so answers that cannot
//! change at runtime are cached for the process lifetime, while answers
//! that can (recovery, bootstrap) are re-checked after a bounded number
//! of calls.

pub mod catalog;
pub mod version;

pub use catalog::{CatalogError, Operation, OperationCatalog};
pub use version::ServerVersion;

use crate::connection::{
    Connection, ConnectionError, ConnectionSettings, Connector, Field, Row, SqlxConnector,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// System databases never reported by [`CapabilityPool::databases`].
pub const EXCLUDED_DATABASES: [&str; 3] = ["template0", "template1", "postgres"];

/// Table created by `pgmon-agent bootstrap`; its presence means the
/// helper schema is installed.
pub const BOOTSTRAP_TABLE: &str = "pgmon_config";

/// Calls served from cache before a recovery/bootstrap probe re-queries.
const PROBE_CACHE_LIMIT: u32 = 10;

const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(30);

const SERVER_VERSION_SQL: &str = "show server_version";
const RECOVERY_SQL: &str = "select pg_catalog.pg_is_in_recovery()";
const BOOTSTRAP_SQL: &str =
    "select count(*)::bigint from pg_catalog.pg_class where relname = 'pgmon_config'";
const PGPRO_VERSION_SQL: &str = "select pgpro_version()";
const PGPRO_EDITION_SQL: &str = "select pgpro_edition()";
const DATABASES_SQL: &str = "select datname from pg_catalog.pg_database";

/// Errors surfaced by the capability pool
#[derive(Error, Debug)]
pub enum PoolError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error("Query timed out after {0:?}")]
    Timeout(Duration),

    #[error("Unknown operation: '{0}'")]
    UnknownOperation(String),

    #[error("Invalid version string: '{0}'")]
    InvalidVersion(String),

    #[error("Unexpected result from {probe} probe query")]
    UnexpectedResult { probe: &'static str },
}

/// What a probe-by-failure check learned.
///
/// A server that answers the probe query with an error genuinely lacks
/// the capability; a probe that never reached the server proves nothing.
/// Both surface as "absent" to callers, but the distinction is kept here
/// so connectivity loss is visible in logs.
#[derive(Debug, Clone, PartialEq, Eq)]
enum ProbeOutcome {
    Supported,
    Unsupported,
    ProbeError,
}

impl ProbeOutcome {
    fn supported(&self) -> bool {
        matches!(self, ProbeOutcome::Supported)
    }
}

struct TtlEntry<T> {
    value: T,
    hits: u32,
}

/// Call-count bounded cache: a stored value is served at most `limit`
/// times, then the next lookup misses and the caller re-queries.
struct TtlCache<T> {
    entries: HashMap<String, TtlEntry<T>>,
    limit: u32,
}

impl<T: Clone> TtlCache<T> {
    fn new(limit: u32) -> Self {
        Self {
            entries: HashMap::new(),
            limit,
        }
    }

    fn get(&mut self, db: &str) -> Option<T> {
        let entry = self.entries.get_mut(db)?;
        if entry.hits < self.limit {
            entry.hits += 1;
            Some(entry.value.clone())
        } else {
            None
        }
    }

    fn put(&mut self, db: &str, value: T) {
        self.entries.insert(db.to_string(), TtlEntry { value, hits: 0 });
    }
}

struct ProbeCaches {
    server_version: HashMap<String, ServerVersion>,
    recovery: TtlCache<bool>,
    bootstrap: TtlCache<bool>,
    pgpro: HashMap<String, ProbeOutcome>,
    pgpro_ee: HashMap<String, bool>,
}

impl ProbeCaches {
    fn new() -> Self {
        Self {
            server_version: HashMap::new(),
            recovery: TtlCache::new(PROBE_CACHE_LIMIT),
            bootstrap: TtlCache::new(PROBE_CACHE_LIMIT),
            pgpro: HashMap::new(),
            pgpro_ee: HashMap::new(),
        }
    }
}

/// Connection registry plus capability probes for every monitored
/// database on one instance.
pub struct CapabilityPool {
    settings: ConnectionSettings,
    connector: Box<dyn Connector>,
    connections: tokio::sync::Mutex<HashMap<String, Arc<dyn Connection>>>,
    caches: Mutex<ProbeCaches>,
    catalog: OperationCatalog,
    query_timeout: Duration,
}

impl CapabilityPool {
    /// Pool backed by sqlx with the built-in operation catalog.
    pub fn new(settings: ConnectionSettings) -> Self {
        Self::with_connector(
            settings,
            Box::new(SqlxConnector::new()),
            OperationCatalog::builtin(),
        )
    }

    /// Pool with an explicit connector and catalog. Tests inject mock
    /// connectors here.
    pub fn with_connector(
        settings: ConnectionSettings,
        connector: Box<dyn Connector>,
        catalog: OperationCatalog,
    ) -> Self {
        Self {
            settings,
            connector,
            connections: tokio::sync::Mutex::new(HashMap::new()),
            caches: Mutex::new(ProbeCaches::new()),
            catalog,
            query_timeout: DEFAULT_QUERY_TIMEOUT,
        }
    }

    pub fn with_query_timeout(mut self, timeout: Duration) -> Self {
        self.query_timeout = timeout;
        self
    }

    pub fn catalog(&self) -> &OperationCatalog {
        &self.catalog
    }

    fn resolve_db<'a>(&'a self, db: Option<&'a str>) -> &'a str {
        db.unwrap_or(&self.settings.database)
    }

    fn caches(&self) -> MutexGuard<'_, ProbeCaches> {
        self.caches.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The connection for `db`, created on first use. Holding the
    /// registry lock across `open` guarantees at most one live
    /// connection per database name.
    async fn connection(&self, db: &str) -> Result<Arc<dyn Connection>, PoolError> {
        let mut connections = self.connections.lock().await;
        if let Some(connection) = connections.get(db) {
            return Ok(connection.clone());
        }
        let settings = self.settings.with_database(db);
        let connection = self.connector.open(&settings).await?;
        connections.insert(db.to_string(), connection.clone());
        Ok(connection)
    }

    /// Execute `sql` against `db` (default database when `None`).
    /// Errors propagate to the caller unchanged; there is no retry.
    pub async fn query(&self, sql: &str, db: Option<&str>) -> Result<Vec<Row>, PoolError> {
        let db = self.resolve_db(db);
        let connection = self.connection(db).await?;
        match tokio::time::timeout(self.query_timeout, connection.query(sql)).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(PoolError::Timeout(self.query_timeout)),
        }
    }

    /// Redacted connection string for `db`, opening the connection if
    /// needed.
    pub async fn connection_string(&self, db: Option<&str>) -> Result<String, PoolError> {
        let db = self.resolve_db(db);
        Ok(self.connection(db).await?.connection_string())
    }

    /// Server version for `db`, queried once and cached for the process
    /// lifetime.
    pub async fn server_version(&self, db: Option<&str>) -> Result<ServerVersion, PoolError> {
        let db = self.resolve_db(db).to_string();
        if let Some(version) = self.caches().server_version.get(&db) {
            return Ok(version.clone());
        }

        let rows = self.query(SERVER_VERSION_SQL, Some(&db)).await?;
        let raw = match first_field(rows, "server_version")? {
            Field::Text(s) => s,
            _ => return Err(PoolError::UnexpectedResult { probe: "server_version" }),
        };
        let version: ServerVersion = raw
            .parse()
            .map_err(|_| PoolError::InvalidVersion(raw.clone()))?;

        self.caches().server_version.insert(db, version.clone());
        Ok(version)
    }

    /// Whether the server version is at least `version`.
    pub async fn server_version_greater(
        &self,
        version: &str,
        db: Option<&str>,
    ) -> Result<bool, PoolError> {
        let threshold: ServerVersion = version
            .parse()
            .map_err(|_| PoolError::InvalidVersion(version.to_string()))?;
        Ok(self.server_version(db).await? >= threshold)
    }

    /// Whether the server version is at most `version`.
    pub async fn server_version_less(
        &self,
        version: &str,
        db: Option<&str>,
    ) -> Result<bool, PoolError> {
        let threshold: ServerVersion = version
            .parse()
            .map_err(|_| PoolError::InvalidVersion(version.to_string()))?;
        Ok(self.server_version(db).await? <= threshold)
    }

    /// Whether the server is in recovery (standby). Cached with a call
    /// count bound so a promotion is noticed within a few poll cycles
    /// without querying every time.
    pub async fn in_recovery(&self, db: Option<&str>) -> Result<bool, PoolError> {
        let db = self.resolve_db(db).to_string();
        if let Some(value) = self.caches().recovery.get(&db) {
            return Ok(value);
        }

        let rows = self.query(RECOVERY_SQL, Some(&db)).await?;
        let value = first_field(rows, "recovery")?
            .as_bool()
            .ok_or(PoolError::UnexpectedResult { probe: "recovery" })?;

        self.caches().recovery.put(&db, value);
        Ok(value)
    }

    /// Whether the `pgmon` helper schema is installed in `db`. Same call
    /// count bound as [`in_recovery`](Self::in_recovery), since bootstrap
    /// can be installed while the agent runs.
    pub async fn is_bootstrapped(&self, db: Option<&str>) -> Result<bool, PoolError> {
        let db = self.resolve_db(db).to_string();
        if let Some(value) = self.caches().bootstrap.get(&db) {
            return Ok(value);
        }

        let rows = self.query(BOOTSTRAP_SQL, Some(&db)).await?;
        let count = first_field(rows, "bootstrap")?
            .as_i64()
            .ok_or(PoolError::UnexpectedResult { probe: "bootstrap" })?;
        let found = count == 1;

        if found {
            info!(db = %db, "found pgmon bootstrap");
        } else {
            info!(db = %db, "pgmon bootstrap not found");
            info!("hint: run `pgmon-agent bootstrap` to operate without superuser rights");
        }

        self.caches().bootstrap.put(&db, found);
        Ok(found)
    }

    /// Whether the server is a Postgres Pro build. Probed by failure:
    /// the vendor function either answers or errors, and the answer is
    /// cached for the process lifetime.
    pub async fn is_pgpro(&self, db: Option<&str>) -> bool {
        let db = self.resolve_db(db).to_string();
        if let Some(outcome) = self.caches().pgpro.get(&db).cloned() {
            return outcome.supported();
        }

        let outcome = match self.query(PGPRO_VERSION_SQL, Some(&db)).await {
            Ok(_) => ProbeOutcome::Supported,
            Err(PoolError::Connection(
                ConnectionError::QueryError(message) | ConnectionError::PermissionError(message),
            )) => {
                debug!(db = %db, message = %message, "server rejected pgpro probe");
                ProbeOutcome::Unsupported
            }
            Err(error) => {
                warn!(
                    db = %db,
                    error = %error,
                    "pgpro probe did not reach the server, treating vendor capability as absent"
                );
                ProbeOutcome::ProbeError
            }
        };

        let supported = outcome.supported();
        self.caches().pgpro.insert(db, outcome);
        supported
    }

    /// Whether the server is a Postgres Pro Enterprise build. Never
    /// issues the edition query on non-pgpro servers.
    pub async fn is_pgpro_ee(&self, db: Option<&str>) -> bool {
        if !self.is_pgpro(db).await {
            return false;
        }

        let db = self.resolve_db(db).to_string();
        if let Some(value) = self.caches().pgpro_ee.get(&db) {
            return *value;
        }

        let enterprise = match self.query(PGPRO_EDITION_SQL, Some(&db)).await {
            Ok(rows) => matches!(
                first_field(rows, "pgpro_edition"),
                Ok(Field::Text(edition)) if edition.eq_ignore_ascii_case("enterprise")
            ),
            Err(error) => {
                warn!(db = %db, error = %error, "pgpro edition probe failed");
                false
            }
        };

        self.caches().pgpro_ee.insert(db, enterprise);
        enterprise
    }

    /// Whether `name` is an installed extension in `db`. Always queries;
    /// extensions come and go with schema changes.
    pub async fn extension_installed(
        &self,
        name: &str,
        db: Option<&str>,
    ) -> Result<bool, PoolError> {
        let sql = format!(
            "select count(*)::bigint from pg_catalog.pg_extension where extname = '{}'",
            quote_literal(name)
        );
        let rows = self.query(&sql, db).await?;
        let count = first_field(rows, "extension")?
            .as_i64()
            .ok_or(PoolError::UnexpectedResult { probe: "extension" })?;
        Ok(count == 1)
    }

    /// Every database on the instance except the system set, in catalog
    /// order.
    pub async fn databases(&self) -> Result<Vec<String>, PoolError> {
        let rows = self.query(DATABASES_SQL, None).await?;
        let mut databases = Vec::new();
        for row in rows {
            if let Some(Field::Text(name)) = row.into_iter().next() {
                if !EXCLUDED_DATABASES.contains(&name.as_str()) {
                    databases.push(name);
                }
            }
        }
        Ok(databases)
    }

    /// SQL text for a named operation: the capability form when the
    /// helper schema is installed in `db`, the direct form otherwise.
    pub async fn resolve_operation(
        &self,
        name: &str,
        db: Option<&str>,
    ) -> Result<String, PoolError> {
        let operation = self
            .catalog
            .get(name)
            .ok_or_else(|| PoolError::UnknownOperation(name.to_string()))?;
        if self.is_bootstrapped(db).await? {
            Ok(operation.capability_sql.clone())
        } else {
            Ok(operation.fallback_sql.clone())
        }
    }

    /// Resolve and execute a named operation.
    pub async fn run_operation(&self, name: &str, db: Option<&str>) -> Result<Vec<Row>, PoolError> {
        let sql = self.resolve_operation(name, db).await?;
        self.query(&sql, db).await
    }
}

fn first_field(rows: Vec<Row>, probe: &'static str) -> Result<Field, PoolError> {
    rows.into_iter()
        .next()
        .and_then(|row| row.into_iter().next())
        .ok_or(PoolError::UnexpectedResult { probe })
}

fn quote_literal(value: &str) -> String {
    value.replace('\'', "''")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{MockConnection, MockConnector};
    use mockall::predicate::eq;

    fn pool_with(connection: MockConnection) -> CapabilityPool {
        let connection: Arc<dyn Connection> = Arc::new(connection);
        let mut connector = MockConnector::new();
        connector
            .expect_open()
            .returning(move |_| Ok(connection.clone()));
        CapabilityPool::with_connector(
            ConnectionSettings::default(),
            Box::new(connector),
            OperationCatalog::builtin(),
        )
    }

    fn text_row(value: &str) -> Vec<Row> {
        vec![vec![Field::Text(value.to_string())]]
    }

    fn int_row(value: i64) -> Vec<Row> {
        vec![vec![Field::Int(value)]]
    }

    #[tokio::test]
    async fn test_one_connection_per_database() {
        let mut connection = MockConnection::new();
        connection
            .expect_query()
            .returning(|_| Ok(vec![vec![Field::Int(1)]]));
        let connection: Arc<dyn Connection> = Arc::new(connection);

        let mut connector = MockConnector::new();
        connector
            .expect_open()
            .times(1)
            .returning(move |_| Ok(connection.clone()));

        let pool = CapabilityPool::with_connector(
            ConnectionSettings::default(),
            Box::new(connector),
            OperationCatalog::builtin(),
        );

        for _ in 0..3 {
            pool.query("select 1", None).await.expect("query succeeds");
        }
    }

    #[tokio::test]
    async fn test_server_version_cached_permanently() {
        let mut connection = MockConnection::new();
        connection
            .expect_query()
            .with(eq(SERVER_VERSION_SQL))
            .times(1)
            .returning(|_| Ok(text_row("15.4")));

        let pool = pool_with(connection);
        for _ in 0..5 {
            let version = pool.server_version(None).await.expect("version resolves");
            assert_eq!(version.parts(), &[15, 4]);
        }
    }

    #[tokio::test]
    async fn test_version_comparison_is_numeric() {
        let mut connection = MockConnection::new();
        connection
            .expect_query()
            .with(eq(SERVER_VERSION_SQL))
            .times(1)
            .returning(|_| Ok(text_row("10.1")));

        let pool = pool_with(connection);
        assert!(pool.server_version_greater("9.6", None).await.unwrap());
        assert!(pool.server_version_greater("10.1", None).await.unwrap());
        assert!(pool.server_version_less("10.2", None).await.unwrap());
        assert!(!pool.server_version_less("9.6", None).await.unwrap());
    }

    #[tokio::test]
    async fn test_recovery_probe_requeries_after_cache_limit() {
        let mut connection = MockConnection::new();
        // Call 1 queries, calls 2..=11 are served from cache, call 12
        // exhausts the limit and queries again.
        connection
            .expect_query()
            .with(eq(RECOVERY_SQL))
            .times(2)
            .returning(|_| Ok(vec![vec![Field::Bool(false)]]));

        let pool = pool_with(connection);
        for _ in 0..12 {
            assert!(!pool.in_recovery(None).await.expect("probe succeeds"));
        }
    }

    #[tokio::test]
    async fn test_bootstrap_probe_requeries_after_cache_limit() {
        let mut connection = MockConnection::new();
        connection
            .expect_query()
            .with(eq(BOOTSTRAP_SQL))
            .times(2)
            .returning(|_| Ok(int_row(1)));

        let pool = pool_with(connection);
        for _ in 0..12 {
            assert!(pool.is_bootstrapped(None).await.expect("probe succeeds"));
        }
    }

    #[tokio::test]
    async fn test_resolve_operation_picks_fallback_without_bootstrap() {
        let mut connection = MockConnection::new();
        connection
            .expect_query()
            .with(eq(BOOTSTRAP_SQL))
            .times(1)
            .returning(|_| Ok(int_row(0)));

        let pool = pool_with(connection);
        let names: Vec<String> = pool.catalog().names().map(str::to_string).collect();
        for name in names {
            let expected = pool.catalog().get(&name).unwrap().fallback_sql.clone();
            let resolved = pool.resolve_operation(&name, None).await.unwrap();
            assert_eq!(resolved, expected, "operation {name}");
        }
    }

    #[tokio::test]
    async fn test_resolve_operation_picks_capability_with_bootstrap() {
        let mut connection = MockConnection::new();
        connection
            .expect_query()
            .with(eq(BOOTSTRAP_SQL))
            .times(1)
            .returning(|_| Ok(int_row(1)));

        let pool = pool_with(connection);
        let names: Vec<String> = pool.catalog().names().map(str::to_string).collect();
        for name in names {
            let expected = pool.catalog().get(&name).unwrap().capability_sql.clone();
            let resolved = pool.resolve_operation(&name, None).await.unwrap();
            assert_eq!(resolved, expected, "operation {name}");
        }
    }

    #[tokio::test]
    async fn test_unknown_operation_is_distinguishable() {
        let pool = pool_with(MockConnection::new());
        let err = pool.resolve_operation("no_such_thing", None).await.unwrap_err();
        assert!(matches!(err, PoolError::UnknownOperation(name) if name == "no_such_thing"));
    }

    #[tokio::test]
    async fn test_run_operation_executes_resolved_sql() {
        let mut connection = MockConnection::new();
        connection
            .expect_query()
            .with(eq(BOOTSTRAP_SQL))
            .times(1)
            .returning(|_| Ok(int_row(0)));
        let fallback = OperationCatalog::builtin()
            .get("count_autovacuum")
            .unwrap()
            .fallback_sql
            .clone();
        connection
            .expect_query()
            .with(eq(fallback))
            .times(1)
            .returning(|_| Ok(int_row(3)));

        let pool = pool_with(connection);
        let rows = pool.run_operation("count_autovacuum", None).await.unwrap();
        assert_eq!(rows[0][0], Field::Int(3));
    }

    #[tokio::test]
    async fn test_databases_filters_system_set() {
        let mut connection = MockConnection::new();
        connection
            .expect_query()
            .with(eq(DATABASES_SQL))
            .returning(|_| {
                Ok(vec![
                    vec![Field::Text("template0".to_string())],
                    vec![Field::Text("app1".to_string())],
                    vec![Field::Text("template1".to_string())],
                    vec![Field::Text("postgres".to_string())],
                    vec![Field::Text("app2".to_string())],
                ])
            });

        let pool = pool_with(connection);
        let databases = pool.databases().await.expect("listing succeeds");
        assert_eq!(databases, vec!["app1".to_string(), "app2".to_string()]);
    }

    #[tokio::test]
    async fn test_pgpro_probe_by_failure_is_cached() {
        let mut connection = MockConnection::new();
        connection
            .expect_query()
            .with(eq(PGPRO_VERSION_SQL))
            .times(1)
            .returning(|_| {
                Err(ConnectionError::QueryError(
                    "function pgpro_version() does not exist".to_string(),
                ))
            });

        let pool = pool_with(connection);
        assert!(!pool.is_pgpro(None).await);
        // Second call answers from cache; a re-probe would trip times(1).
        assert!(!pool.is_pgpro(None).await);
    }

    #[tokio::test]
    async fn test_pgpro_ee_short_circuits_without_edition_probe() {
        let mut connection = MockConnection::new();
        connection
            .expect_query()
            .with(eq(PGPRO_VERSION_SQL))
            .times(1)
            .returning(|_| {
                Err(ConnectionError::QueryError(
                    "function pgpro_version() does not exist".to_string(),
                ))
            });
        connection
            .expect_query()
            .with(eq(PGPRO_EDITION_SQL))
            .times(0)
            .returning(|_| Ok(text_row("enterprise")));

        let pool = pool_with(connection);
        assert!(!pool.is_pgpro_ee(None).await);
    }

    #[tokio::test]
    async fn test_pgpro_ee_matches_edition_case_insensitively() {
        let mut connection = MockConnection::new();
        connection
            .expect_query()
            .with(eq(PGPRO_VERSION_SQL))
            .times(1)
            .returning(|_| Ok(text_row("PostgresPro 15.4.1")));
        connection
            .expect_query()
            .with(eq(PGPRO_EDITION_SQL))
            .times(1)
            .returning(|_| Ok(text_row("Enterprise")));

        let pool = pool_with(connection);
        assert!(pool.is_pgpro_ee(None).await);
        // Cached permanently.
        assert!(pool.is_pgpro_ee(None).await);
    }

    #[tokio::test]
    async fn test_extension_check_never_cached() {
        let mut connection = MockConnection::new();
        connection
            .expect_query()
            .times(2)
            .returning(|_| Ok(int_row(1)));

        let pool = pool_with(connection);
        assert!(pool.extension_installed("pg_buffercache", None).await.unwrap());
        assert!(pool.extension_installed("pg_buffercache", None).await.unwrap());
    }

    #[tokio::test]
    async fn test_extension_name_is_literal_quoted() {
        let mut connection = MockConnection::new();
        connection
            .expect_query()
            .withf(|sql: &str| sql.contains("extname = 'it''s'"))
            .times(1)
            .returning(|_| Ok(int_row(0)));

        let pool = pool_with(connection);
        assert!(!pool.extension_installed("it's", None).await.unwrap());
    }

    #[tokio::test]
    async fn test_query_timeout_is_enforced() {
        struct StallingConnection;

        #[async_trait::async_trait]
        impl Connection for StallingConnection {
            async fn query(&self, _sql: &str) -> Result<Vec<Row>, ConnectionError> {
                std::future::pending().await
            }

            fn connection_string(&self) -> String {
                "postgres://stall".to_string()
            }
        }

        let mut connector = MockConnector::new();
        connector
            .expect_open()
            .returning(|_| Ok(Arc::new(StallingConnection) as Arc<dyn Connection>));

        let pool = CapabilityPool::with_connector(
            ConnectionSettings::default(),
            Box::new(connector),
            OperationCatalog::builtin(),
        )
        .with_query_timeout(Duration::from_millis(50));

        let err = pool.query("select 1", None).await.unwrap_err();
        assert!(matches!(err, PoolError::Timeout(_)));
    }
}
