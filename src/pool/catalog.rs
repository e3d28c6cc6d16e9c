//! Registry of dual-form SQL operations.
//!
//! Every operation a plugin can run by name has two SQL texts: a direct
//! form that needs catalog privileges, and a helper-function form that
//! works once the `pgmon` bootstrap schema is installed. The pool picks
//! the variant at call time based on the bootstrap probe.

use indexmap::IndexMap;
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum CatalogError {
    #[error("Operation '{0}' is already registered")]
    Duplicate(String),

    #[error("Operation '{0}' has an empty SQL variant")]
    EmptySql(String),

    #[error("Operation '{0}' registers the same SQL for both variants")]
    IdenticalVariants(String),
}

/// One named operation with its two SQL forms.
#[derive(Debug, Clone)]
pub struct Operation {
    /// Direct form, runnable with superuser/catalog access.
    pub fallback_sql: String,
    /// Helper-function form, runnable after bootstrap.
    pub capability_sql: String,
}

/// Name -> operation map, validated on every insert and iterated in
/// registration order.
#[derive(Debug, Clone, Default)]
pub struct OperationCatalog {
    operations: IndexMap<String, Operation>,
}

const BUILTIN_OPERATIONS: &[(&str, &str, &str)] = &[
    (
        "replication_lag_master",
        "select 1 as replication_lag_master",
        "select public.pgmon_timestamp_master_update()",
    ),
    (
        "replication_lag_slave",
        "select extract(epoch from now() - pg_last_xact_replay_timestamp())::float8",
        "select public.pgmon_timestamp_get()",
    ),
    (
        "count_wal_files",
        "select count(*)::bigint from pg_catalog.pg_ls_waldir()",
        "select public.pgmon_count_wal_files()",
    ),
    (
        "count_autovacuum",
        "select count(*)::bigint from pg_catalog.pg_stat_activity \
         where query like '%autovacuum%' and state <> 'idle' \
         and pid <> pg_catalog.pg_backend_pid()",
        "select public.pgmon_count_autovacuum()",
    ),
    (
        "buffer_cache",
        "select sum(1)::bigint * 8 * 1024 as size, \
         sum(case when usagecount > 1 then 1 else 0 end)::bigint * 8 * 1024 as twice_used, \
         sum(case isdirty when true then 1 else 0 end)::bigint * 8 * 1024 as dirty \
         from public.pg_buffercache",
        "select size, twice_used, dirty from public.pgmon_buffer_cache()",
    ),
];

impl OperationCatalog {
    pub fn empty() -> Self {
        Self::default()
    }

    /// The agent's built-in operation set.
    pub fn builtin() -> Self {
        let mut catalog = Self::empty();
        for (name, fallback, capability) in BUILTIN_OPERATIONS {
            catalog
                .insert(name, fallback, capability)
                .expect("builtin operation table is valid");
        }
        catalog
    }

    /// Register an operation, validating both variants.
    pub fn insert(
        &mut self,
        name: &str,
        fallback_sql: &str,
        capability_sql: &str,
    ) -> Result<(), CatalogError> {
        if fallback_sql.trim().is_empty() || capability_sql.trim().is_empty() {
            return Err(CatalogError::EmptySql(name.to_string()));
        }
        if fallback_sql == capability_sql {
            return Err(CatalogError::IdenticalVariants(name.to_string()));
        }
        if self.operations.contains_key(name) {
            return Err(CatalogError::Duplicate(name.to_string()));
        }
        self.operations.insert(
            name.to_string(),
            Operation {
                fallback_sql: fallback_sql.to_string(),
                capability_sql: capability_sql.to_string(),
            },
        );
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Operation> {
        self.operations.get(name)
    }

    /// Operation names in registration order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.operations.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }
}
