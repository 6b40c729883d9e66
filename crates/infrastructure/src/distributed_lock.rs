use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use metrics::counter;
use rand::Rng;
use tokio::time::Instant;
use tracing::{debug, instrument, warn};

use jobstore_core::clock::to_chrono;
use jobstore_core::{Clock, StorageError, StorageResult};

use crate::database::{with_pool, DatabasePool};

/// 基于 `distributed_lock` 表的协作式互斥锁
///
/// 资源名是表的主键，插入成功即持有锁。持有时间超过 `staleness` 的行被视为
/// 持有者已经退出，可以被强制删除后重新获取。慢但仍然存活的持有者也会被抢占。
/// 锁不可重入：同一调用方重复获取会像其他竞争者一样等待直到超时。
#[derive(Debug, Clone)]
pub struct DistributedLockManager {
    pool: DatabasePool,
    clock: Arc<dyn Clock>,
    staleness: Duration,
    poll_interval: Duration,
}

impl DistributedLockManager {
    pub fn new(
        pool: DatabasePool,
        clock: Arc<dyn Clock>,
        staleness: Duration,
        poll_interval: Duration,
    ) -> Self {
        Self {
            pool,
            clock,
            staleness,
            poll_interval,
        }
    }

    /// 获取锁，最多等待 `timeout`
    #[instrument(skip(self))]
    pub async fn acquire(
        &self,
        resource: &str,
        timeout: Duration,
    ) -> StorageResult<DistributedLockGuard> {
        let deadline = Instant::now() + timeout;

        loop {
            let acquired_at = self.clock.now();
            match self.try_insert(resource, acquired_at).await {
                Ok(()) => {
                    counter!("jobstore_lock_acquisitions_total").increment(1);
                    debug!("Acquired distributed lock {}", resource);
                    return Ok(DistributedLockGuard {
                        resource: resource.to_string(),
                        acquired_at,
                        pool: self.pool.clone(),
                        released: false,
                    });
                }
                Err(e) if is_unique_violation(&e) => {}
                Err(e) => return Err(StorageError::Database(e)),
            }

            if self.remove_stale(resource, acquired_at).await? {
                counter!("jobstore_lock_stale_takeovers_total").increment(1);
                warn!(
                    "Removed stale distributed lock {} (held longer than {:?})",
                    resource, self.staleness
                );
                continue;
            }

            let now = Instant::now();
            if now >= deadline {
                counter!("jobstore_lock_timeouts_total").increment(1);
                return Err(StorageError::LockTimeout {
                    resource: resource.to_string(),
                    timeout,
                });
            }

            let delay = self.poll_delay().min(deadline - now);
            tokio::time::sleep(delay).await;
        }
    }

    async fn try_insert(&self, resource: &str, acquired_at: DateTime<Utc>) -> Result<(), sqlx::Error> {
        with_pool!(&self.pool, pool => {
            sqlx::query("INSERT INTO distributed_lock (resource, created_at) VALUES ($1, $2)")
                .bind(resource)
                .bind(acquired_at)
                .execute(pool)
                .await?;
        });
        Ok(())
    }

    /// 删除早于失效阈值的锁行，返回是否删除了行
    async fn remove_stale(&self, resource: &str, now: DateTime<Utc>) -> StorageResult<bool> {
        let threshold = now - to_chrono(self.staleness);
        let affected = with_pool!(&self.pool, pool => {
            sqlx::query("DELETE FROM distributed_lock WHERE resource = $1 AND created_at < $2")
                .bind(resource)
                .bind(threshold)
                .execute(pool)
                .await?
                .rows_affected()
        });
        Ok(affected > 0)
    }

    /// 轮询间隔加上最多一半间隔的随机抖动
    fn poll_delay(&self) -> Duration {
        let base = self.poll_interval.as_millis() as u64;
        let jitter = rand::rng().random_range(0..=base / 2);
        Duration::from_millis(base + jitter)
    }
}

/// 已持有的分布式锁
///
/// 释放只删除与本次获取时间戳一致的行，被抢占后不会误删新持有者的锁。
/// 未显式释放就被丢弃时，会在当前运行时上尝试后台释放。
#[derive(Debug)]
pub struct DistributedLockGuard {
    resource: String,
    acquired_at: DateTime<Utc>,
    pool: DatabasePool,
    released: bool,
}

impl DistributedLockGuard {
    pub fn resource(&self) -> &str {
        &self.resource
    }

    pub fn acquired_at(&self) -> DateTime<Utc> {
        self.acquired_at
    }

    /// 释放锁，返回锁行是否仍归本次持有
    ///
    /// 返回 `false` 表示锁已经因超时被他人接管，属于正常情况。
    pub async fn release(mut self) -> StorageResult<bool> {
        self.released = true;
        let owned = delete_lock_row(&self.pool, &self.resource, self.acquired_at).await?;
        if owned {
            debug!("Released distributed lock {}", self.resource);
        } else {
            warn!(
                "Distributed lock {} was taken over before release",
                self.resource
            );
        }
        Ok(owned)
    }
}

impl Drop for DistributedLockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }

        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(
                "Distributed lock {} dropped outside a runtime; it will expire after the staleness threshold",
                self.resource
            );
            return;
        };

        let pool = self.pool.clone();
        let resource = std::mem::take(&mut self.resource);
        let acquired_at = self.acquired_at;
        handle.spawn(async move {
            match delete_lock_row(&pool, &resource, acquired_at).await {
                Ok(true) => debug!("Released dropped distributed lock {}", resource),
                Ok(false) => warn!("Dropped distributed lock {} was already taken over", resource),
                Err(e) => warn!("Failed to release dropped distributed lock {}: {}", resource, e),
            }
        });
    }
}

async fn delete_lock_row(
    pool: &DatabasePool,
    resource: &str,
    acquired_at: DateTime<Utc>,
) -> StorageResult<bool> {
    let affected = with_pool!(pool, pool => {
        sqlx::query("DELETE FROM distributed_lock WHERE resource = $1 AND created_at = $2")
            .bind(resource)
            .bind(acquired_at)
            .execute(pool)
            .await?
            .rows_affected()
    });
    Ok(affected > 0)
}

fn is_unique_violation(error: &sqlx::Error) -> bool {
    match error {
        sqlx::Error::Database(db_error) => db_error.is_unique_violation(),
        _ => false,
    }
}
