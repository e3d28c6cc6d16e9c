//! Instance-wide activity counters from `pg_stat_database`.

use super::{Plugin, PluginError};
use crate::pool::CapabilityPool;
use crate::sender::{Delta, MetricSender};
use async_trait::async_trait;

/// (column, metric key, transform) per emitted item.
const ITEMS: &[(&str, &str, Delta)] = &[
    ("xact_commit", "pgsql.transactions[total]", Delta::SpeedPerSecond),
    ("blks_hit", "pgsql.blocks[hit]", Delta::SpeedPerSecond),
    ("blks_read", "pgsql.blocks[read]", Delta::SpeedPerSecond),
    ("conflicts", "pgsql.events[conflicts]", Delta::SimpleChange),
    ("deadlocks", "pgsql.events[deadlocks]", Delta::SimpleChange),
    ("xact_rollback", "pgsql.events[xact_rollback]", Delta::SimpleChange),
    ("temp_bytes", "pgsql.temp[bytes]", Delta::SimpleChange),
    ("temp_files", "pgsql.temp[files]", Delta::SimpleChange),
    ("tup_deleted", "pgsql.tuples[deleted]", Delta::SpeedPerSecond),
    ("tup_fetched", "pgsql.tuples[fetched]", Delta::SpeedPerSecond),
    ("tup_inserted", "pgsql.tuples[inserted]", Delta::SpeedPerSecond),
    ("tup_returned", "pgsql.tuples[returned]", Delta::SpeedPerSecond),
    ("tup_updated", "pgsql.tuples[updated]", Delta::SpeedPerSecond),
];

pub struct InstanceStats;

impl InstanceStats {
    fn sql() -> String {
        let columns: Vec<String> = ITEMS
            .iter()
            .map(|(column, _, _)| format!("sum({0})::bigint as {0}", column))
            .collect();
        format!("select {} from pg_stat_database", columns.join(", "))
    }

    /// Fetch one sample per item, in `ITEMS` order.
    async fn collect(
        &self,
        pool: &CapabilityPool,
    ) -> Result<Vec<(&'static str, i64, Delta)>, PluginError> {
        let rows = pool.query(&Self::sql(), None).await?;
        let row = rows.into_iter().next().ok_or_else(|| {
            PluginError::ResultShape("pg_stat_database returned no rows".to_string())
        })?;

        if row.len() != ITEMS.len() {
            return Err(PluginError::ResultShape(format!(
                "expected {} columns from pg_stat_database, got {}",
                ITEMS.len(),
                row.len()
            )));
        }

        let mut samples = Vec::with_capacity(ITEMS.len());
        for ((_, key, delta), field) in ITEMS.iter().zip(row) {
            // Statistics not yet populated come back null; skip them.
            if let Some(value) = field.as_i64() {
                samples.push((*key, value, *delta));
            }
        }
        Ok(samples)
    }
}

#[async_trait]
impl Plugin for InstanceStats {
    fn name(&self) -> &str {
        "instance"
    }

    async fn run(&self, pool: &CapabilityPool, sender: &MetricSender) -> Result<(), PluginError> {
        for (key, value, delta) in self.collect(pool).await? {
            sender.send(key, value, delta, None, None).await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{
        Connection, ConnectionSettings, Field, MockConnection, MockConnector,
    };
    use crate::pool::OperationCatalog;
    use std::sync::Arc;

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

    #[test]
    fn test_sql_shape() {
        let sql = InstanceStats::sql();
        assert!(sql.starts_with("select sum(xact_commit)::bigint as xact_commit"));
        assert!(sql.ends_with("from pg_stat_database"));
    }

    #[tokio::test]
    async fn test_collect_maps_columns_to_keys() {
        let mut connection = MockConnection::new();
        connection.expect_query().returning(|_| {
            Ok(vec![(0..ITEMS.len() as i64).map(Field::Int).collect()])
        });

        let samples = InstanceStats.collect(&pool_with(connection)).await.unwrap();
        assert_eq!(samples.len(), ITEMS.len());
        assert_eq!(samples[0], ("pgsql.transactions[total]", 0, Delta::SpeedPerSecond));
        assert_eq!(samples[3], ("pgsql.events[conflicts]", 3, Delta::SimpleChange));
    }

    #[tokio::test]
    async fn test_collect_skips_null_columns() {
        let mut connection = MockConnection::new();
        connection.expect_query().returning(|_| {
            let mut row: Vec<Field> = (0..ITEMS.len() as i64).map(Field::Int).collect();
            row[1] = Field::Null;
            Ok(vec![row])
        });

        let samples = InstanceStats.collect(&pool_with(connection)).await.unwrap();
        assert_eq!(samples.len(), ITEMS.len() - 1);
    }

    #[tokio::test]
    async fn test_collect_rejects_short_rows() {
        let mut connection = MockConnection::new();
        connection
            .expect_query()
            .returning(|_| Ok(vec![vec![Field::Int(1)]]));

        let err = InstanceStats.collect(&pool_with(connection)).await.unwrap_err();
        assert!(matches!(err, PluginError::ResultShape(_)));
    }

    #[tokio::test]
    async fn test_first_run_only_seeds_baselines() {
        let mut connection = MockConnection::new();
        connection.expect_query().returning(|_| {
            Ok(vec![(0..ITEMS.len() as i64).map(Field::Int).collect()])
        });
        let pool = pool_with(connection);
        let sender = MetricSender::new();

        InstanceStats.run(&pool, &sender).await.unwrap();

        assert_eq!(sender.baseline_count(), ITEMS.len());
    }
}
