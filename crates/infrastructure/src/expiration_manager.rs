use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use metrics::counter;
use sqlx::Row;
use tracing::{debug, info, instrument, warn};

use jobstore_core::{Clock, StorageOptions, StorageResult};

use crate::background::BackgroundComponent;
use crate::database::{placeholders, with_pool, DatabasePool};
use crate::distributed_lock::DistributedLockManager;
use crate::shutdown::ShutdownSignal;

pub const EXPIRATION_MANAGER_LOCK: &str = "locks:expiration-manager";

/// 带 `expire_at` 列、可以直接按批删除的表
pub const EXPIRABLE_TABLES: [&str; 5] = [
    "aggregated_counter",
    "counter",
    "list_entry",
    "set_entry",
    "hash_entry",
];

/// 作业子表，删除作业前先删除这些行
const JOB_CHILD_TABLES: [&str; 3] = ["job_parameter", "job_state", "job_queue"];

/// 先以写操作锁定一批过期作业，避免 SQLite 事务从读锁升级时遇到 busy
const CLAIM_EXPIRED_JOBS_SQL: &str = r#"
    UPDATE job SET expire_at = expire_at
    WHERE id IN (
        SELECT id FROM job WHERE expire_at IS NOT NULL AND expire_at < $1 ORDER BY id LIMIT $2
    )
    RETURNING id
"#;

/// 一轮清理的统计
#[derive(Debug, Clone, Default)]
pub struct ExpirationStats {
    /// 每张表删除的行数
    pub removed: BTreeMap<&'static str, u64>,
    /// 清理耗时
    pub duration: Duration,
}

impl ExpirationStats {
    pub fn total_removed(&self) -> u64 {
        self.removed.values().sum()
    }

    pub fn removed_from(&self, table: &str) -> u64 {
        self.removed.get(table).copied().unwrap_or(0)
    }

    /// 是否有清理操作
    pub fn has_cleanup(&self) -> bool {
        self.total_removed() > 0
    }
}

/// 过期数据清理器
///
/// 负责删除 `expire_at` 已过的行，防止临时数据无限增长。每张表按批删除，
/// 直到某一批不足批次大小为止；作业按批在单个事务中连同子表一起删除。
#[derive(Debug, Clone)]
pub struct ExpirationManager {
    pool: DatabasePool,
    clock: Arc<dyn Clock>,
    locks: DistributedLockManager,
    options: Arc<StorageOptions>,
}

impl ExpirationManager {
    pub fn new(
        pool: DatabasePool,
        clock: Arc<dyn Clock>,
        locks: DistributedLockManager,
        options: Arc<StorageOptions>,
    ) -> Self {
        Self {
            pool,
            clock,
            locks,
            options,
        }
    }

    /// 执行一轮清理
    #[instrument(skip_all)]
    pub async fn expire_once(&self, shutdown: &ShutdownSignal) -> StorageResult<ExpirationStats> {
        let guard = self
            .locks
            .acquire(EXPIRATION_MANAGER_LOCK, self.options.background_lock_timeout())
            .await?;

        let start_time = Instant::now();
        let result = self.sweep(shutdown).await;

        if let Err(e) = guard.release().await {
            warn!("Failed to release {}: {}", EXPIRATION_MANAGER_LOCK, e);
        }

        let mut stats = result?;
        stats.duration = start_time.elapsed();

        if stats.has_cleanup() {
            info!(
                "Expiration completed: {} rows removed in {:?} ({:?})",
                stats.total_removed(),
                stats.duration,
                stats.removed
            );
        } else {
            debug!("Expiration completed: nothing to remove");
        }
        Ok(stats)
    }

    async fn sweep(&self, shutdown: &ShutdownSignal) -> StorageResult<ExpirationStats> {
        let mut stats = ExpirationStats::default();

        for table in EXPIRABLE_TABLES {
            if shutdown.is_shutdown() {
                debug!("Expiration interrupted by shutdown");
                return Ok(stats);
            }
            let removed = self.drain(shutdown, table).await?;
            stats.removed.insert(table, removed);
        }

        if shutdown.is_shutdown() {
            debug!("Expiration interrupted by shutdown");
            return Ok(stats);
        }
        let removed = self.drain(shutdown, "job").await?;
        stats.removed.insert("job", removed);

        Ok(stats)
    }

    /// 对单张表循环删除，直到不足一批或收到关闭信号
    async fn drain(&self, shutdown: &ShutdownSignal, table: &'static str) -> StorageResult<u64> {
        let batch_size = u64::from(self.options.expiration_batch_size);
        let mut total = 0;

        loop {
            let removed = if table == "job" {
                self.expire_jobs_batch().await?
            } else {
                self.expire_table_batch(table).await?
            };

            total += removed;
            if removed > 0 {
                counter!("jobstore_expired_rows_total", "table" => table).increment(removed);
                debug!("Removed {} expired rows from {}", removed, table);
            }

            if removed < batch_size {
                break;
            }
            if !shutdown.sleep(self.options.batch_delay()).await {
                break;
            }
        }

        Ok(total)
    }

    async fn expire_table_batch(&self, table: &str) -> StorageResult<u64> {
        let now = self.clock.now();
        let batch_size = i64::from(self.options.expiration_batch_size);
        let sql = format!(
            "DELETE FROM {table} WHERE id IN (\
                SELECT id FROM {table} WHERE expire_at IS NOT NULL AND expire_at < $1 \
                ORDER BY id LIMIT $2)"
        );

        let removed = with_pool!(&self.pool, pool => {
            sqlx::query(&sql)
                .bind(now)
                .bind(batch_size)
                .execute(pool)
                .await?
                .rows_affected()
        });
        Ok(removed)
    }

    /// 在一个事务中删除一批过期作业及其参数、状态历史和队列条目
    async fn expire_jobs_batch(&self) -> StorageResult<u64> {
        let now = self.clock.now();
        let batch_size = i64::from(self.options.expiration_batch_size);

        with_pool!(&self.pool, pool => {
            let mut tx = pool.begin().await?;

            let rows = sqlx::query(CLAIM_EXPIRED_JOBS_SQL)
                .bind(now)
                .bind(batch_size)
                .fetch_all(&mut *tx)
                .await?;

            if rows.is_empty() {
                tx.commit().await?;
                return Ok(0);
            }

            let mut ids = Vec::with_capacity(rows.len());
            for row in &rows {
                ids.push(row.try_get::<i64, _>("id")?);
            }
            let in_list = placeholders(1, ids.len());

            for child in JOB_CHILD_TABLES {
                let sql = format!("DELETE FROM {child} WHERE job_id IN ({in_list})");
                let mut query = sqlx::query(&sql);
                for id in &ids {
                    query = query.bind(*id);
                }
                query.execute(&mut *tx).await?;
            }

            let sql = format!("DELETE FROM job WHERE id IN ({in_list})");
            let mut query = sqlx::query(&sql);
            for id in &ids {
                query = query.bind(*id);
            }
            let removed = query.execute(&mut *tx).await?.rows_affected();

            tx.commit().await?;
            Ok(removed)
        })
    }
}

#[async_trait]
impl BackgroundComponent for ExpirationManager {
    fn name(&self) -> &'static str {
        "ExpirationManager"
    }

    fn interval(&self) -> Duration {
        self.options.job_expiration_check_interval()
    }

    async fn execute(&self, shutdown: &ShutdownSignal) -> StorageResult<()> {
        match self.expire_once(shutdown).await {
            Ok(_) => Ok(()),
            Err(e) if e.is_lock_timeout() => {
                debug!("Expiration is running elsewhere, skipping this pass");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}
