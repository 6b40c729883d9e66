use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use sqlx::Row;
use tracing::{debug, info, instrument};

use jobstore_core::clock::to_chrono;
use jobstore_core::{
    Clock, CreateJob, FetchedJob, JobData, JobStateRecord, NewState, ServerData, ServerRecord,
    StateData, StorageError, StorageOptions, StorageResult,
};

use crate::database::{with_pool, DatabasePool};
use crate::distributed_lock::{DistributedLockGuard, DistributedLockManager};
use crate::job_queue::JobQueue;
use crate::write_transaction::{
    WriteTransaction, INSERT_JOB_STATE_SQL, UPDATE_JOB_STATE_ID_SQL, UPDATE_JOB_STATE_NAME_SQL,
};

/// 存储连接
///
/// 面向宿主框架的操作入口：作业创建与查询、状态变更、参数、队列领取、
/// 分布式锁、服务器心跳以及计数器/集合/列表/哈希的读取。
/// 组合操作都在单个事务中完成，失败时整体回滚。
#[derive(Debug, Clone)]
pub struct StorageConnection {
    pool: DatabasePool,
    clock: Arc<dyn Clock>,
    queue: JobQueue,
    locks: DistributedLockManager,
    options: Arc<StorageOptions>,
}

impl StorageConnection {
    pub fn new(
        pool: DatabasePool,
        clock: Arc<dyn Clock>,
        locks: DistributedLockManager,
        options: Arc<StorageOptions>,
    ) -> Self {
        let queue = JobQueue::new(pool.clone(), clock.clone());
        Self {
            pool,
            clock,
            queue,
            locks,
            options,
        }
    }

    pub fn queue(&self) -> &JobQueue {
        &self.queue
    }

    pub fn create_write_transaction(&self) -> WriteTransaction {
        WriteTransaction::new(self.pool.clone(), self.clock.clone())
    }

    // ---- 作业 ----

    /// 创建作业，连同参数和可选的初始状态在一个事务中写入
    #[instrument(skip(self, job), fields(parameters = job.parameters.len()))]
    pub async fn create_job(&self, job: CreateJob) -> StorageResult<i64> {
        let now = self.clock.now();
        let expire_at = job.expire_in.map(|d| now + to_chrono(d));
        let state_data = match &job.initial_state {
            Some(state) => Some(serde_json::to_string(&state.data)?),
            None => None,
        };

        let job_id = with_pool!(&self.pool, pool => {
            let mut tx = pool.begin().await?;

            let job_id = sqlx::query(
                "INSERT INTO job (invocation_data, arguments, created_at, expire_at) \
                 VALUES ($1, $2, $3, $4) RETURNING id",
            )
            .bind(job.invocation_data.as_slice())
            .bind(job.arguments.as_slice())
            .bind(now)
            .bind(expire_at)
            .fetch_one(&mut *tx)
            .await?
            .try_get::<i64, _>("id")?;

            for (name, value) in &job.parameters {
                sqlx::query("INSERT INTO job_parameter (job_id, name, value) VALUES ($1, $2, $3)")
                    .bind(job_id)
                    .bind(name.as_str())
                    .bind(value.as_str())
                    .execute(&mut *tx)
                    .await?;
            }

            if let Some(state) = &job.initial_state {
                sqlx::query(UPDATE_JOB_STATE_NAME_SQL)
                    .bind(job_id)
                    .bind(state.name.as_str())
                    .execute(&mut *tx)
                    .await?;

                let state_id = sqlx::query(INSERT_JOB_STATE_SQL)
                    .bind(job_id)
                    .bind(state.name.as_str())
                    .bind(state.reason.as_deref())
                    .bind(state_data.as_deref())
                    .bind(now)
                    .fetch_one(&mut *tx)
                    .await?
                    .try_get::<i64, _>("id")?;

                sqlx::query(UPDATE_JOB_STATE_ID_SQL)
                    .bind(job_id)
                    .bind(state_id)
                    .execute(&mut *tx)
                    .await?;
            }

            tx.commit().await?;
            job_id
        });

        debug!("Created job {}", job_id);
        Ok(job_id)
    }

    #[instrument(skip(self))]
    pub async fn get_job_data(&self, job_id: i64) -> StorageResult<Option<JobData>> {
        let job = with_pool!(&self.pool, pool => {
            let row = sqlx::query(
                "SELECT id, state_name, invocation_data, arguments, created_at, expire_at \
                 FROM job WHERE id = $1",
            )
            .bind(job_id)
            .fetch_optional(pool)
            .await?;

            match row {
                Some(row) => Some(JobData {
                    id: row.try_get("id")?,
                    state_name: row.try_get("state_name")?,
                    invocation_data: row.try_get("invocation_data")?,
                    arguments: row.try_get("arguments")?,
                    created_at: row.try_get("created_at")?,
                    expire_at: row.try_get("expire_at")?,
                }),
                None => None,
            }
        });
        Ok(job)
    }

    /// 作业当前状态；作业不存在或还没有状态时返回 `None`
    #[instrument(skip(self))]
    pub async fn get_state_data(&self, job_id: i64) -> StorageResult<Option<StateData>> {
        let state = with_pool!(&self.pool, pool => {
            let row = sqlx::query(
                "SELECT s.name, s.reason, s.data FROM job j \
                 INNER JOIN job_state s ON s.id = j.state_id \
                 WHERE j.id = $1",
            )
            .bind(job_id)
            .fetch_optional(pool)
            .await?;

            match row {
                Some(row) => Some(StateData {
                    name: row.try_get("name")?,
                    reason: row.try_get("reason")?,
                    data: parse_state_data(row.try_get("data")?)?,
                }),
                None => None,
            }
        });
        Ok(state)
    }

    /// 按写入顺序返回作业的全部状态历史
    #[instrument(skip(self))]
    pub async fn get_state_history(&self, job_id: i64) -> StorageResult<Vec<JobStateRecord>> {
        let history = with_pool!(&self.pool, pool => {
            let rows = sqlx::query(
                "SELECT id, job_id, name, reason, data, created_at FROM job_state \
                 WHERE job_id = $1 ORDER BY id",
            )
            .bind(job_id)
            .fetch_all(pool)
            .await?;

            let mut history = Vec::with_capacity(rows.len());
            for row in &rows {
                history.push(JobStateRecord {
                    id: row.try_get("id")?,
                    job_id: row.try_get("job_id")?,
                    name: row.try_get("name")?,
                    reason: row.try_get("reason")?,
                    data: parse_state_data(row.try_get("data")?)?,
                    created_at: row.try_get("created_at")?,
                });
            }
            history
        });
        Ok(history)
    }

    /// 设置作业参数，同名参数后写覆盖先写
    #[instrument(skip(self, value))]
    pub async fn set_job_parameter(&self, job_id: i64, name: &str, value: &str) -> StorageResult<()> {
        with_pool!(&self.pool, pool => {
            sqlx::query(
                "INSERT INTO job_parameter (job_id, name, value) VALUES ($1, $2, $3) \
                 ON CONFLICT (job_id, name) DO UPDATE SET value = excluded.value",
            )
            .bind(job_id)
            .bind(name)
            .bind(value)
            .execute(pool)
            .await?;
        });
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn get_job_parameter(&self, job_id: i64, name: &str) -> StorageResult<Option<String>> {
        let value = with_pool!(&self.pool, pool => {
            sqlx::query("SELECT value FROM job_parameter WHERE job_id = $1 AND name = $2")
                .bind(job_id)
                .bind(name)
                .fetch_optional(pool)
                .await?
                .map(|row| row.try_get::<Option<String>, _>("value"))
                .transpose()?
                .flatten()
        });
        Ok(value)
    }

    /// 单独提交一次状态变更
    pub async fn set_job_state(&self, job_id: i64, state: NewState) -> StorageResult<()> {
        let mut transaction = self.create_write_transaction();
        transaction.set_job_state(job_id, state);
        transaction.commit().await
    }

    // ---- 队列与锁 ----

    /// 使用配置的不可见超时领取下一个作业
    pub async fn fetch_next_job(&self, queues: &[String]) -> StorageResult<Option<FetchedJob>> {
        self.queue
            .fetch_next(queues, self.options.invisibility_timeout())
            .await
    }

    pub async fn fetch_next_job_with_timeout(
        &self,
        queues: &[String],
        invisibility_timeout: Duration,
    ) -> StorageResult<Option<FetchedJob>> {
        self.queue.fetch_next(queues, invisibility_timeout).await
    }

    pub async fn remove_from_queue(&self, fetched: &FetchedJob) -> StorageResult<bool> {
        self.queue.remove_from_queue(fetched).await
    }

    pub async fn requeue(&self, fetched: &FetchedJob) -> StorageResult<bool> {
        self.queue.requeue(fetched).await
    }

    pub async fn acquire_distributed_lock(
        &self,
        resource: &str,
        timeout: Duration,
    ) -> StorageResult<DistributedLockGuard> {
        self.locks.acquire(resource, timeout).await
    }

    // ---- 服务器 ----

    #[instrument(skip(self, data))]
    pub async fn announce_server(&self, server_id: &str, data: &ServerData) -> StorageResult<()> {
        let now = self.clock.now();
        let payload = serde_json::to_string(data)?;
        with_pool!(&self.pool, pool => {
            sqlx::query(
                "INSERT INTO server (id, data, last_heartbeat) VALUES ($1, $2, $3) \
                 ON CONFLICT (id) DO UPDATE SET data = excluded.data, last_heartbeat = excluded.last_heartbeat",
            )
            .bind(server_id)
            .bind(payload.as_str())
            .bind(now)
            .execute(pool)
            .await?;
        });
        info!("Server {} announced with queues {:?}", server_id, data.queues);
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn heartbeat(&self, server_id: &str) -> StorageResult<()> {
        let now = self.clock.now();
        let affected = with_pool!(&self.pool, pool => {
            sqlx::query("UPDATE server SET last_heartbeat = $2 WHERE id = $1")
                .bind(server_id)
                .bind(now)
                .execute(pool)
                .await?
                .rows_affected()
        });

        if affected == 0 {
            return Err(StorageError::ServerNotFound {
                id: server_id.to_string(),
            });
        }
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn remove_server(&self, server_id: &str) -> StorageResult<bool> {
        let affected = with_pool!(&self.pool, pool => {
            sqlx::query("DELETE FROM server WHERE id = $1")
                .bind(server_id)
                .execute(pool)
                .await?
                .rows_affected()
        });
        Ok(affected > 0)
    }

    /// 删除心跳超过 `timeout` 的服务器，返回删除数量
    #[instrument(skip(self))]
    pub async fn remove_timed_out_servers(&self, timeout: Duration) -> StorageResult<u64> {
        let cutoff = self.clock.now() - to_chrono(timeout);
        let removed = with_pool!(&self.pool, pool => {
            sqlx::query("DELETE FROM server WHERE last_heartbeat < $1")
                .bind(cutoff)
                .execute(pool)
                .await?
                .rows_affected()
        });

        if removed > 0 {
            info!("Removed {} timed out servers", removed);
        }
        Ok(removed)
    }

    pub async fn get_servers(&self) -> StorageResult<Vec<ServerRecord>> {
        let servers = with_pool!(&self.pool, pool => {
            let rows = sqlx::query("SELECT id, data, last_heartbeat FROM server ORDER BY id")
                .fetch_all(pool)
                .await?;

            let mut servers = Vec::with_capacity(rows.len());
            for row in &rows {
                let data: String = row.try_get("data")?;
                servers.push(ServerRecord {
                    id: row.try_get("id")?,
                    data: serde_json::from_str(&data)?,
                    last_heartbeat: row.try_get("last_heartbeat")?,
                });
            }
            servers
        });
        Ok(servers)
    }

    // ---- 读取 ----

    /// 计数器的真实值：聚合值加上尚未聚合的增量
    #[instrument(skip(self))]
    pub async fn get_counter(&self, key: &str) -> StorageResult<i64> {
        let value = with_pool!(&self.pool, pool => {
            sqlx::query(
                "SELECT CAST(COALESCE(SUM(v.value), 0) AS BIGINT) AS total FROM (\
                    SELECT value FROM counter WHERE key = $1 \
                    UNION ALL \
                    SELECT value FROM aggregated_counter WHERE key = $1\
                 ) v",
            )
            .bind(key)
            .fetch_one(pool)
            .await?
            .try_get::<i64, _>("total")?
        });
        Ok(value)
    }

    pub async fn get_all_items_from_set(&self, key: &str) -> StorageResult<BTreeSet<String>> {
        let items = with_pool!(&self.pool, pool => {
            let rows = sqlx::query("SELECT value FROM set_entry WHERE key = $1")
                .bind(key)
                .fetch_all(pool)
                .await?;

            let mut items = BTreeSet::new();
            for row in &rows {
                items.insert(row.try_get::<String, _>("value")?);
            }
            items
        });
        Ok(items)
    }

    /// 分数在 `[from_score, to_score]` 内、分数最低的成员
    pub async fn get_first_by_lowest_score_from_set(
        &self,
        key: &str,
        from_score: f64,
        to_score: f64,
    ) -> StorageResult<Option<String>> {
        if to_score < from_score {
            return Err(StorageError::Configuration(
                "分数上限不能小于下限".to_string(),
            ));
        }

        let value = with_pool!(&self.pool, pool => {
            sqlx::query(
                "SELECT value FROM set_entry WHERE key = $1 AND score BETWEEN $2 AND $3 \
                 ORDER BY score, id LIMIT 1",
            )
            .bind(key)
            .bind(from_score)
            .bind(to_score)
            .fetch_optional(pool)
            .await?
            .map(|row| row.try_get::<String, _>("value"))
            .transpose()?
        });
        Ok(value)
    }

    pub async fn get_set_count(&self, key: &str) -> StorageResult<i64> {
        let count = with_pool!(&self.pool, pool => {
            sqlx::query("SELECT COUNT(*) AS total FROM set_entry WHERE key = $1")
                .bind(key)
                .fetch_one(pool)
                .await?
                .try_get::<i64, _>("total")?
        });
        Ok(count)
    }

    /// 哈希的全部字段；哈希不存在时返回 `None`
    pub async fn get_all_entries_from_hash(
        &self,
        key: &str,
    ) -> StorageResult<Option<HashMap<String, String>>> {
        let entries = with_pool!(&self.pool, pool => {
            let rows = sqlx::query("SELECT field, value FROM hash_entry WHERE key = $1")
                .bind(key)
                .fetch_all(pool)
                .await?;

            let mut entries = HashMap::with_capacity(rows.len());
            for row in &rows {
                entries.insert(
                    row.try_get::<String, _>("field")?,
                    row.try_get::<Option<String>, _>("value")?.unwrap_or_default(),
                );
            }
            entries
        });

        if entries.is_empty() {
            return Ok(None);
        }
        Ok(Some(entries))
    }

    pub async fn get_value_from_hash(&self, key: &str, field: &str) -> StorageResult<Option<String>> {
        let value = with_pool!(&self.pool, pool => {
            sqlx::query("SELECT value FROM hash_entry WHERE key = $1 AND field = $2")
                .bind(key)
                .bind(field)
                .fetch_optional(pool)
                .await?
                .map(|row| row.try_get::<Option<String>, _>("value"))
                .transpose()?
                .flatten()
        });
        Ok(value)
    }

    /// 列表全部元素，最新插入的在前
    pub async fn get_all_items_from_list(&self, key: &str) -> StorageResult<Vec<String>> {
        let items = with_pool!(&self.pool, pool => {
            let rows = sqlx::query("SELECT value FROM list_entry WHERE key = $1 ORDER BY id DESC")
                .bind(key)
                .fetch_all(pool)
                .await?;

            let mut items = Vec::with_capacity(rows.len());
            for row in &rows {
                items.push(row.try_get::<String, _>("value")?);
            }
            items
        });
        Ok(items)
    }
}

fn parse_state_data(raw: Option<String>) -> StorageResult<HashMap<String, String>> {
    match raw {
        Some(raw) if !raw.is_empty() => Ok(serde_json::from_str(&raw)?),
        _ => Ok(HashMap::new()),
    }
}

