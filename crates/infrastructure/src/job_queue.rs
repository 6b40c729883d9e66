use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use metrics::counter;
use sqlx::Row;
use tracing::{debug, instrument};
use uuid::Uuid;

use jobstore_core::clock::to_chrono;
use jobstore_core::{Clock, FetchedJob, StorageError, StorageResult};

use crate::database::{placeholders, with_pool, DatabasePool};

/// 单次领取中，因竞争失败而重新选择候选条目的最大次数
pub const MAX_CLAIM_ATTEMPTS: usize = 8;

pub(crate) const INSERT_QUEUE_ENTRY_SQL: &str =
    "INSERT INTO job_queue (job_id, queue) VALUES ($1, $2) RETURNING id";

const CLAIM_SQL: &str = r#"
    UPDATE job_queue
    SET fetched_at = $1, fetch_token = $2
    WHERE id = $3 AND (fetched_at IS NULL OR fetched_at < $4)
"#;

/// 基于数据库表的多消费者队列
///
/// 领取不使用 `SELECT ... FOR UPDATE`，而是用“领取时间 + 领取令牌”标记条目：
/// 领取时间早于 `now - invisibility_timeout` 的条目视为被遗弃，可以再次领取。
#[derive(Debug, Clone)]
pub struct JobQueue {
    pool: DatabasePool,
    clock: Arc<dyn Clock>,
}

impl JobQueue {
    pub fn new(pool: DatabasePool, clock: Arc<dyn Clock>) -> Self {
        Self { pool, clock }
    }

    /// 将作业放入队列，返回队列条目ID
    #[instrument(skip(self))]
    pub async fn enqueue(&self, queue: &str, job_id: i64) -> StorageResult<i64> {
        let id: i64 = with_pool!(&self.pool, pool => {
            sqlx::query(INSERT_QUEUE_ENTRY_SQL)
                .bind(job_id)
                .bind(queue)
                .fetch_one(pool)
                .await?
                .try_get::<i64, _>("id")?
        });

        counter!("jobstore_queue_enqueued_total", "queue" => queue.to_string()).increment(1);
        debug!("Enqueued job {} to queue {} as entry {}", job_id, queue, id);
        Ok(id)
    }

    /// 领取下一个可用条目
    ///
    /// 队列按调用方给出的顺序排定优先级，同一队列内按条目ID从小到大。
    /// 没有可领取的条目时立即返回 `None`，轮询和退避由调用方负责。
    #[instrument(skip(self))]
    pub async fn fetch_next(
        &self,
        queues: &[String],
        invisibility_timeout: Duration,
    ) -> StorageResult<Option<FetchedJob>> {
        let queues = normalize_queues(queues)?;
        let timeout = to_chrono(invisibility_timeout);

        for attempt in 1..=MAX_CLAIM_ATTEMPTS {
            let now = self.clock.now();
            let cutoff = now - timeout;

            let Some((id, job_id, queue)) = self.select_candidate(&queues, cutoff).await? else {
                debug!("No job available in queues {:?}", queues);
                return Ok(None);
            };

            let token = Uuid::new_v4();
            if self.try_claim(id, now, token, cutoff).await? {
                counter!("jobstore_queue_claims_total", "queue" => queue.clone()).increment(1);
                debug!(
                    "Claimed queue entry {} (job {}) from queue {} on attempt {}",
                    id, job_id, queue, attempt
                );
                return Ok(Some(FetchedJob {
                    id,
                    job_id,
                    queue,
                    fetch_token: token,
                    fetched_at: now,
                }));
            }

            counter!("jobstore_queue_claim_conflicts_total").increment(1);
            debug!(
                "Lost claim race for queue entry {} (attempt {}), retrying",
                id, attempt
            );
        }

        debug!(
            "Gave up after {} lost claim races in queues {:?}",
            MAX_CLAIM_ATTEMPTS, queues
        );
        Ok(None)
    }

    /// 确认：删除仍由该领取令牌持有的队列条目
    ///
    /// 条目已被他人重新领取时返回 `false`，不做任何修改。
    #[instrument(skip(self, fetched), fields(entry_id = %fetched.id, job_id = %fetched.job_id))]
    pub async fn remove_from_queue(&self, fetched: &FetchedJob) -> StorageResult<bool> {
        let result = with_pool!(&self.pool, pool => {
            sqlx::query("DELETE FROM job_queue WHERE id = $1 AND fetch_token = $2")
                .bind(fetched.id)
                .bind(fetched.fetch_token.to_string())
                .execute(pool)
                .await?
                .rows_affected()
        });

        let removed = result > 0;
        if !removed {
            debug!("Queue entry {} is no longer owned by this claim", fetched.id);
        }
        Ok(removed)
    }

    /// 归还：清除领取标记，让条目立即可以被再次领取
    #[instrument(skip(self, fetched), fields(entry_id = %fetched.id, job_id = %fetched.job_id))]
    pub async fn requeue(&self, fetched: &FetchedJob) -> StorageResult<bool> {
        let result = with_pool!(&self.pool, pool => {
            sqlx::query(
                "UPDATE job_queue SET fetched_at = NULL, fetch_token = NULL WHERE id = $1 AND fetch_token = $2",
            )
            .bind(fetched.id)
            .bind(fetched.fetch_token.to_string())
            .execute(pool)
            .await?
            .rows_affected()
        });

        let requeued = result > 0;
        if !requeued {
            debug!("Queue entry {} is no longer owned by this claim", fetched.id);
        }
        Ok(requeued)
    }

    async fn select_candidate(
        &self,
        queues: &[String],
        cutoff: DateTime<Utc>,
    ) -> StorageResult<Option<(i64, i64, String)>> {
        let in_list = placeholders(2, queues.len());
        let priority = (0..queues.len())
            .map(|i| format!("WHEN ${} THEN {}", i + 2, i))
            .collect::<Vec<_>>()
            .join(" ");
        let sql = format!(
            "SELECT id, job_id, queue FROM job_queue \
             WHERE queue IN ({in_list}) AND (fetched_at IS NULL OR fetched_at < $1) \
             ORDER BY CASE queue {priority} END, id \
             LIMIT 1"
        );

        let candidate = with_pool!(&self.pool, pool => {
            let mut query = sqlx::query(&sql).bind(cutoff);
            for queue in queues {
                query = query.bind(queue.as_str());
            }
            match query.fetch_optional(pool).await? {
                Some(row) => Some((
                    row.try_get::<i64, _>("id")?,
                    row.try_get::<i64, _>("job_id")?,
                    row.try_get::<String, _>("queue")?,
                )),
                None => None,
            }
        });

        Ok(candidate)
    }

    /// 条件更新：只有条目在更新时仍满足可领取条件才会成功
    async fn try_claim(
        &self,
        id: i64,
        now: DateTime<Utc>,
        token: Uuid,
        cutoff: DateTime<Utc>,
    ) -> StorageResult<bool> {
        let affected = with_pool!(&self.pool, pool => {
            sqlx::query(CLAIM_SQL)
                .bind(now)
                .bind(token.to_string())
                .bind(id)
                .bind(cutoff)
                .execute(pool)
                .await?
                .rows_affected()
        });
        Ok(affected == 1)
    }
}

/// 去重并保留调用方给出的顺序；空列表属于配置错误
pub fn normalize_queues(queues: &[String]) -> StorageResult<Vec<String>> {
    let mut normalized: Vec<String> = Vec::with_capacity(queues.len());
    for queue in queues {
        if queue.is_empty() {
            return Err(StorageError::Configuration("队列名称不能为空".to_string()));
        }
        if !normalized.contains(queue) {
            normalized.push(queue.clone());
        }
    }

    if normalized.is_empty() {
        return Err(StorageError::Configuration(
            "至少需要指定一个队列".to_string(),
        ));
    }
    Ok(normalized)
}
