//! sqlx-backed PostgreSQL connections.

use super::{Connection, ConnectionError, ConnectionSettings, Connector, Field, Row};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Column, Row as _, TypeInfo};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Size of the sqlx pool behind each logical database. Plugins run
/// sequentially, so one spare connection is enough headroom.
const MAX_POOL_CONNECTIONS: u32 = 2;

const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(30);

/// A PostgreSQL connection backed by a small sqlx pool.
pub struct PgConnection {
    pool: PgPool,
    conn_str: String,
}

#[async_trait]
impl Connection for PgConnection {
    async fn query(&self, sql: &str) -> Result<Vec<Row>, ConnectionError> {
        let rows = sqlx::query(sql).fetch_all(&self.pool).await?;
        rows.iter().map(decode_row).collect()
    }

    fn connection_string(&self) -> String {
        self.conn_str.clone()
    }
}

/// Production [`Connector`] that opens sqlx pools.
#[derive(Default)]
pub struct SqlxConnector;

impl SqlxConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Connector for SqlxConnector {
    async fn open(
        &self,
        settings: &ConnectionSettings,
    ) -> Result<Arc<dyn Connection>, ConnectionError> {
        info!(target = %settings.display(), "Connecting to PostgreSQL database");

        let pool = PgPoolOptions::new()
            .min_connections(1)
            .max_connections(MAX_POOL_CONNECTIONS)
            .acquire_timeout(ACQUIRE_TIMEOUT)
            .connect(&settings.url())
            .await
            .map_err(|e| ConnectionError::ConnectError(e.to_string()))?;

        Ok(Arc::new(PgConnection {
            pool,
            conn_str: settings.display(),
        }))
    }
}

fn decode_row(row: &PgRow) -> Result<Row, ConnectionError> {
    let mut fields = Vec::with_capacity(row.columns().len());
    for (idx, column) in row.columns().iter().enumerate() {
        fields.push(decode_field(row, idx, column.type_info().name())?);
    }
    Ok(fields)
}

/// Decode one column by its PostgreSQL type name.
///
/// Catalog and plugin SQL casts aggregates to concrete types, so the
/// listed arms cover everything the agent runs; anything else comes back
/// as `Null` rather than failing the whole row.
fn decode_field(row: &PgRow, idx: usize, type_name: &str) -> Result<Field, ConnectionError> {
    let field = match type_name {
        "BOOL" => row
            .try_get::<Option<bool>, _>(idx)?
            .map_or(Field::Null, Field::Bool),
        "INT2" => row
            .try_get::<Option<i16>, _>(idx)?
            .map_or(Field::Null, |v| Field::Int(i64::from(v))),
        "INT4" => row
            .try_get::<Option<i32>, _>(idx)?
            .map_or(Field::Null, |v| Field::Int(i64::from(v))),
        "INT8" => row
            .try_get::<Option<i64>, _>(idx)?
            .map_or(Field::Null, Field::Int),
        "OID" => row
            .try_get::<Option<sqlx::postgres::types::Oid>, _>(idx)?
            .map_or(Field::Null, |v| Field::Int(i64::from(v.0))),
        "FLOAT4" => row
            .try_get::<Option<f32>, _>(idx)?
            .map_or(Field::Null, |v| Field::Float(f64::from(v))),
        "FLOAT8" => row
            .try_get::<Option<f64>, _>(idx)?
            .map_or(Field::Null, Field::Float),
        "TEXT" | "VARCHAR" | "NAME" | "BPCHAR" => row
            .try_get::<Option<String>, _>(idx)?
            .map_or(Field::Null, Field::Text),
        "TIMESTAMPTZ" => row
            .try_get::<Option<DateTime<Utc>>, _>(idx)?
            .map_or(Field::Null, |v| Field::Int(v.timestamp())),
        "TIMESTAMP" => row
            .try_get::<Option<NaiveDateTime>, _>(idx)?
            .map_or(Field::Null, |v| Field::Int(v.and_utc().timestamp())),
        other => {
            debug!(column = idx, pg_type = other, "unhandled column type, decoding as null");
            Field::Null
        }
    };
    Ok(field)
}
