use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use metrics::counter;
use sqlx::Row;
use tracing::{debug, info, instrument, warn};

use jobstore_core::{StorageError, StorageOptions, StorageResult};

use crate::background::BackgroundComponent;
use crate::database::{placeholders, with_pool, DatabasePool};
use crate::distributed_lock::DistributedLockManager;
use crate::shutdown::ShutdownSignal;

pub const COUNTERS_AGGREGATOR_LOCK: &str = "locks:counters-aggregator";

const UPSERT_AGGREGATE_SQL: &str = r#"
    INSERT INTO aggregated_counter (key, value, expire_at)
    VALUES ($1, $2, $3)
    ON CONFLICT (key) DO UPDATE SET
        value = aggregated_counter.value + excluded.value,
        expire_at = CASE
            WHEN excluded.expire_at IS NULL THEN aggregated_counter.expire_at
            WHEN aggregated_counter.expire_at IS NULL THEN excluded.expire_at
            WHEN aggregated_counter.expire_at > excluded.expire_at THEN aggregated_counter.expire_at
            ELSE excluded.expire_at
        END
"#;

/// 批次的第一条语句必须是写操作：SQLite 在事务开始时就拿到写锁，
/// PostgreSQL 锁住读到的增量行
const CLAIM_BATCH_SQL: &str = r#"
    UPDATE counter SET value = value
    WHERE id IN (SELECT id FROM counter ORDER BY id LIMIT $1)
    RETURNING id, key, value, expire_at
"#;

/// 一轮聚合的统计
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AggregationStats {
    pub batches: u64,
    pub rows_aggregated: u64,
    pub keys_updated: u64,
}

/// 同一个键在一个批次中的增量汇总
#[derive(Debug, Clone, PartialEq)]
struct KeyDelta {
    value: i64,
    expire_at: Option<DateTime<Utc>>,
}

/// 计数器聚合器
///
/// 把 `counter` 表中的增量行折叠进 `aggregated_counter`，每个批次一个事务：
/// 锁定并读取一批增量、按键累加到聚合行、按读取到的ID删除增量。删除只针对读到的ID，
/// 并发插入的新增量留给下一批处理。
#[derive(Debug, Clone)]
pub struct CountersAggregator {
    pool: DatabasePool,
    locks: DistributedLockManager,
    options: Arc<StorageOptions>,
}

impl CountersAggregator {
    pub fn new(pool: DatabasePool, locks: DistributedLockManager, options: Arc<StorageOptions>) -> Self {
        Self {
            pool,
            locks,
            options,
        }
    }

    /// 执行一轮完整聚合，直到增量表中没有更多行或收到关闭信号
    #[instrument(skip_all)]
    pub async fn aggregate_once(&self, shutdown: &ShutdownSignal) -> StorageResult<AggregationStats> {
        let guard = self
            .locks
            .acquire(COUNTERS_AGGREGATOR_LOCK, self.options.background_lock_timeout())
            .await?;

        let result = self.aggregate_batches(shutdown).await;

        if let Err(e) = guard.release().await {
            warn!("Failed to release {}: {}", COUNTERS_AGGREGATOR_LOCK, e);
        }

        let stats = result?;
        if stats.rows_aggregated > 0 {
            info!(
                "Aggregated {} counter rows into {} keys in {} batches",
                stats.rows_aggregated, stats.keys_updated, stats.batches
            );
        } else {
            debug!("No counter rows to aggregate");
        }
        Ok(stats)
    }

    async fn aggregate_batches(&self, shutdown: &ShutdownSignal) -> StorageResult<AggregationStats> {
        let batch_size = u64::from(self.options.aggregation_batch_size);
        let mut stats = AggregationStats::default();

        loop {
            if shutdown.is_shutdown() {
                debug!("Counter aggregation interrupted by shutdown");
                break;
            }

            let (rows, keys) = self.aggregate_batch().await?;
            if rows == 0 {
                break;
            }

            stats.batches += 1;
            stats.rows_aggregated += rows;
            stats.keys_updated += keys;
            counter!("jobstore_counters_aggregated_total").increment(rows);

            if rows < batch_size {
                break;
            }
            if !shutdown.sleep(self.options.batch_delay()).await {
                break;
            }
        }

        Ok(stats)
    }

    /// 聚合一个批次，返回 (增量行数, 更新的键数)
    async fn aggregate_batch(&self) -> StorageResult<(u64, u64)> {
        let batch_size = i64::from(self.options.aggregation_batch_size);

        with_pool!(&self.pool, pool => {
            let mut tx = pool.begin().await?;

            let rows = sqlx::query(CLAIM_BATCH_SQL)
                .bind(batch_size)
                .fetch_all(&mut *tx)
                .await?;

            if rows.is_empty() {
                tx.commit().await?;
                return Ok((0, 0));
            }

            let mut ids = Vec::with_capacity(rows.len());
            let mut deltas: BTreeMap<String, KeyDelta> = BTreeMap::new();
            for row in &rows {
                ids.push(row.try_get::<i64, _>("id")?);
                fold_delta(
                    &mut deltas,
                    row.try_get::<String, _>("key")?,
                    row.try_get::<i64, _>("value")?,
                    row.try_get::<Option<DateTime<Utc>>, _>("expire_at")?,
                );
            }

            for (key, delta) in &deltas {
                sqlx::query(UPSERT_AGGREGATE_SQL)
                    .bind(key.as_str())
                    .bind(delta.value)
                    .bind(delta.expire_at)
                    .execute(&mut *tx)
                    .await?;
            }

            let delete_sql = format!(
                "DELETE FROM counter WHERE id IN ({})",
                placeholders(1, ids.len())
            );
            let mut delete = sqlx::query(&delete_sql);
            for id in &ids {
                delete = delete.bind(*id);
            }
            let deleted = delete.execute(&mut *tx).await?.rows_affected();

            if deleted != ids.len() as u64 {
                tx.rollback().await?;
                return Err(StorageError::ConcurrentModification(format!(
                    "聚合期间计数器行被并发删除: 读取 {} 行，删除 {} 行",
                    ids.len(),
                    deleted
                )));
            }

            tx.commit().await?;
            debug!("Folded {} counter rows into {} keys", ids.len(), deltas.len());
            Ok((ids.len() as u64, deltas.len() as u64))
        })
    }
}

/// 累加一个增量行；过期时间取非空值中较晚的一个
fn fold_delta(
    deltas: &mut BTreeMap<String, KeyDelta>,
    key: String,
    value: i64,
    expire_at: Option<DateTime<Utc>>,
) {
    let entry = deltas.entry(key).or_insert(KeyDelta {
        value: 0,
        expire_at: None,
    });
    entry.value += value;
    entry.expire_at = match (entry.expire_at, expire_at) {
        (Some(current), Some(incoming)) => Some(current.max(incoming)),
        (current, incoming) => current.or(incoming),
    };
}

#[async_trait]
impl BackgroundComponent for CountersAggregator {
    fn name(&self) -> &'static str {
        "CountersAggregator"
    }

    fn interval(&self) -> Duration {
        self.options.counters_aggregate_interval()
    }

    async fn execute(&self, shutdown: &ShutdownSignal) -> StorageResult<()> {
        match self.aggregate_once(shutdown).await {
            Ok(_) => Ok(()),
            Err(e) if e.is_lock_timeout() => {
                debug!("Counter aggregation is running elsewhere, skipping this pass");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_fold_delta_sums_and_keeps_latest_expiry() {
        let early = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let late = Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap();

        let mut deltas = BTreeMap::new();
        fold_delta(&mut deltas, "stats:succeeded".to_string(), 1, Some(early));
        fold_delta(&mut deltas, "stats:succeeded".to_string(), 1, None);
        fold_delta(&mut deltas, "stats:succeeded".to_string(), -1, Some(late));
        fold_delta(&mut deltas, "stats:failed".to_string(), 5, None);

        assert_eq!(
            deltas.get("stats:succeeded"),
            Some(&KeyDelta {
                value: 1,
                expire_at: Some(late)
            })
        );
        assert_eq!(
            deltas.get("stats:failed"),
            Some(&KeyDelta {
                value: 5,
                expire_at: None
            })
        );
    }
}
