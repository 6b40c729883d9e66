use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use metrics::counter;
use sqlx::Row;
use tracing::{debug, instrument};

use jobstore_core::clock::to_chrono;
use jobstore_core::{Clock, NewState, StorageError, StorageResult};

use crate::database::{with_pool, DatabasePool};
use crate::job_queue::INSERT_QUEUE_ENTRY_SQL;

pub(crate) const UPDATE_JOB_STATE_NAME_SQL: &str = "UPDATE job SET state_name = $2 WHERE id = $1";
pub(crate) const INSERT_JOB_STATE_SQL: &str = r#"
    INSERT INTO job_state (job_id, name, reason, data, created_at)
    VALUES ($1, $2, $3, $4, $5)
    RETURNING id
"#;
pub(crate) const UPDATE_JOB_STATE_ID_SQL: &str = "UPDATE job SET state_id = $2 WHERE id = $1";

/// 带 `key` 和 `expire_at` 列的集合类表
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyedTable {
    Set,
    List,
    Hash,
}

impl KeyedTable {
    pub fn table_name(&self) -> &'static str {
        match self {
            KeyedTable::Set => "set_entry",
            KeyedTable::List => "list_entry",
            KeyedTable::Hash => "hash_entry",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum WriteCommand {
    ExpireJob { job_id: i64, expire_in: Duration },
    PersistJob { job_id: i64 },
    SetJobState { job_id: i64, state: NewState },
    AddToQueue { queue: String, job_id: i64 },
    Counter { key: String, value: i64, expire_in: Option<Duration> },
    AddToSet { key: String, value: String, score: f64 },
    RemoveFromSet { key: String, value: String },
    InsertToList { key: String, value: String },
    RemoveFromList { key: String, value: String },
    TrimList { key: String, keep_start: i64, keep_end: i64 },
    SetRangeInHash { key: String, fields: Vec<(String, String)> },
    RemoveHash { key: String },
    ExpireKey { table: KeyedTable, key: String, expire_in: Duration },
    PersistKey { table: KeyedTable, key: String },
}

/// 写事务
///
/// 先在内存中缓存命令，`commit()` 时在一个数据库事务中按顺序执行；任何一条失败
/// 都会回滚整个批次。状态变更和入队通常放在同一个写事务中提交。
#[derive(Debug)]
pub struct WriteTransaction {
    pool: DatabasePool,
    clock: Arc<dyn Clock>,
    commands: Vec<WriteCommand>,
}

impl WriteTransaction {
    pub fn new(pool: DatabasePool, clock: Arc<dyn Clock>) -> Self {
        Self {
            pool,
            clock,
            commands: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn expire_job(&mut self, job_id: i64, expire_in: Duration) -> &mut Self {
        self.commands.push(WriteCommand::ExpireJob { job_id, expire_in });
        self
    }

    pub fn persist_job(&mut self, job_id: i64) -> &mut Self {
        self.commands.push(WriteCommand::PersistJob { job_id });
        self
    }

    /// 写入状态历史并同步更新作业的当前状态
    pub fn set_job_state(&mut self, job_id: i64, state: NewState) -> &mut Self {
        self.commands.push(WriteCommand::SetJobState { job_id, state });
        self
    }

    pub fn add_to_queue(&mut self, queue: impl Into<String>, job_id: i64) -> &mut Self {
        self.commands.push(WriteCommand::AddToQueue {
            queue: queue.into(),
            job_id,
        });
        self
    }

    pub fn increment_counter(&mut self, key: impl Into<String>, expire_in: Option<Duration>) -> &mut Self {
        self.commands.push(WriteCommand::Counter {
            key: key.into(),
            value: 1,
            expire_in,
        });
        self
    }

    pub fn decrement_counter(&mut self, key: impl Into<String>, expire_in: Option<Duration>) -> &mut Self {
        self.commands.push(WriteCommand::Counter {
            key: key.into(),
            value: -1,
            expire_in,
        });
        self
    }

    /// 添加集合成员；成员已存在时只更新分数
    pub fn add_to_set(&mut self, key: impl Into<String>, value: impl Into<String>, score: f64) -> &mut Self {
        self.commands.push(WriteCommand::AddToSet {
            key: key.into(),
            value: value.into(),
            score,
        });
        self
    }

    pub fn remove_from_set(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.commands.push(WriteCommand::RemoveFromSet {
            key: key.into(),
            value: value.into(),
        });
        self
    }

    pub fn insert_to_list(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.commands.push(WriteCommand::InsertToList {
            key: key.into(),
            value: value.into(),
        });
        self
    }

    /// 删除列表中所有等于 `value` 的元素
    pub fn remove_from_list(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.commands.push(WriteCommand::RemoveFromList {
            key: key.into(),
            value: value.into(),
        });
        self
    }

    /// 只保留按最新优先排序后下标在 `[keep_start, keep_end]` 之间的元素
    pub fn trim_list(&mut self, key: impl Into<String>, keep_start: usize, keep_end: usize) -> &mut Self {
        self.commands.push(WriteCommand::TrimList {
            key: key.into(),
            keep_start: keep_start as i64,
            keep_end: keep_end as i64,
        });
        self
    }

    pub fn set_range_in_hash<K, F, V>(&mut self, key: K, fields: impl IntoIterator<Item = (F, V)>) -> &mut Self
    where
        K: Into<String>,
        F: Into<String>,
        V: Into<String>,
    {
        self.commands.push(WriteCommand::SetRangeInHash {
            key: key.into(),
            fields: fields
                .into_iter()
                .map(|(field, value)| (field.into(), value.into()))
                .collect(),
        });
        self
    }

    pub fn remove_hash(&mut self, key: impl Into<String>) -> &mut Self {
        self.commands.push(WriteCommand::RemoveHash { key: key.into() });
        self
    }

    pub fn expire(&mut self, table: KeyedTable, key: impl Into<String>, expire_in: Duration) -> &mut Self {
        self.commands.push(WriteCommand::ExpireKey {
            table,
            key: key.into(),
            expire_in,
        });
        self
    }

    pub fn persist(&mut self, table: KeyedTable, key: impl Into<String>) -> &mut Self {
        self.commands.push(WriteCommand::PersistKey {
            table,
            key: key.into(),
        });
        self
    }

    /// 在一个事务中提交所有命令
    #[instrument(skip(self), fields(commands = self.commands.len()))]
    pub async fn commit(self) -> StorageResult<()> {
        if self.commands.is_empty() {
            return Ok(());
        }

        let now = self.clock.now();
        with_pool!(&self.pool, pool => {
            let mut tx = pool.begin().await?;

            for command in &self.commands {
                match command {
                    WriteCommand::ExpireJob { job_id, expire_in } => {
                        sqlx::query("UPDATE job SET expire_at = $2 WHERE id = $1")
                            .bind(*job_id)
                            .bind(expires_at(now, *expire_in))
                            .execute(&mut *tx)
                            .await?;
                    }
                    WriteCommand::PersistJob { job_id } => {
                        sqlx::query("UPDATE job SET expire_at = NULL WHERE id = $1")
                            .bind(*job_id)
                            .execute(&mut *tx)
                            .await?;
                    }
                    WriteCommand::SetJobState { job_id, state } => {
                        let updated = sqlx::query(UPDATE_JOB_STATE_NAME_SQL)
                            .bind(*job_id)
                            .bind(state.name.as_str())
                            .execute(&mut *tx)
                            .await?
                            .rows_affected();
                        if updated == 0 {
                            tx.rollback().await?;
                            return Err(StorageError::JobNotFound { id: *job_id });
                        }

                        let state_id = sqlx::query(INSERT_JOB_STATE_SQL)
                            .bind(*job_id)
                            .bind(state.name.as_str())
                            .bind(state.reason.as_deref())
                            .bind(serde_json::to_string(&state.data)?)
                            .bind(now)
                            .fetch_one(&mut *tx)
                            .await?
                            .try_get::<i64, _>("id")?;

                        sqlx::query(UPDATE_JOB_STATE_ID_SQL)
                            .bind(*job_id)
                            .bind(state_id)
                            .execute(&mut *tx)
                            .await?;
                    }
                    WriteCommand::AddToQueue { queue, job_id } => {
                        sqlx::query(INSERT_QUEUE_ENTRY_SQL)
                            .bind(*job_id)
                            .bind(queue.as_str())
                            .fetch_one(&mut *tx)
                            .await?;
                    }
                    WriteCommand::Counter { key, value, expire_in } => {
                        sqlx::query("INSERT INTO counter (key, value, expire_at) VALUES ($1, $2, $3)")
                            .bind(key.as_str())
                            .bind(*value)
                            .bind(expire_in.map(|d| expires_at(now, d)))
                            .execute(&mut *tx)
                            .await?;
                    }
                    WriteCommand::AddToSet { key, value, score } => {
                        sqlx::query(
                            "INSERT INTO set_entry (key, value, score) VALUES ($1, $2, $3) \
                             ON CONFLICT (key, value) DO UPDATE SET score = excluded.score",
                        )
                        .bind(key.as_str())
                        .bind(value.as_str())
                        .bind(*score)
                        .execute(&mut *tx)
                        .await?;
                    }
                    WriteCommand::RemoveFromSet { key, value } => {
                        sqlx::query("DELETE FROM set_entry WHERE key = $1 AND value = $2")
                            .bind(key.as_str())
                            .bind(value.as_str())
                            .execute(&mut *tx)
                            .await?;
                    }
                    WriteCommand::InsertToList { key, value } => {
                        sqlx::query("INSERT INTO list_entry (key, value) VALUES ($1, $2)")
                            .bind(key.as_str())
                            .bind(value.as_str())
                            .execute(&mut *tx)
                            .await?;
                    }
                    WriteCommand::RemoveFromList { key, value } => {
                        sqlx::query("DELETE FROM list_entry WHERE key = $1 AND value = $2")
                            .bind(key.as_str())
                            .bind(value.as_str())
                            .execute(&mut *tx)
                            .await?;
                    }
                    WriteCommand::TrimList { key, keep_start, keep_end } => {
                        sqlx::query(
                            "DELETE FROM list_entry WHERE id IN (\
                                SELECT id FROM (\
                                    SELECT id, ROW_NUMBER() OVER (ORDER BY id DESC) AS row_num \
                                    FROM list_entry WHERE key = $1\
                                ) ranked \
                                WHERE ranked.row_num NOT BETWEEN $2 AND $3)",
                        )
                        .bind(key.as_str())
                        .bind(*keep_start + 1)
                        .bind(*keep_end + 1)
                        .execute(&mut *tx)
                        .await?;
                    }
                    WriteCommand::SetRangeInHash { key, fields } => {
                        for (field, value) in fields {
                            sqlx::query(
                                "INSERT INTO hash_entry (key, field, value) VALUES ($1, $2, $3) \
                                 ON CONFLICT (key, field) DO UPDATE SET value = excluded.value",
                            )
                            .bind(key.as_str())
                            .bind(field.as_str())
                            .bind(value.as_str())
                            .execute(&mut *tx)
                            .await?;
                        }
                    }
                    WriteCommand::RemoveHash { key } => {
                        sqlx::query("DELETE FROM hash_entry WHERE key = $1")
                            .bind(key.as_str())
                            .execute(&mut *tx)
                            .await?;
                    }
                    WriteCommand::ExpireKey { table, key, expire_in } => {
                        let sql = format!("UPDATE {} SET expire_at = $2 WHERE key = $1", table.table_name());
                        sqlx::query(&sql)
                            .bind(key.as_str())
                            .bind(expires_at(now, *expire_in))
                            .execute(&mut *tx)
                            .await?;
                    }
                    WriteCommand::PersistKey { table, key } => {
                        let sql = format!("UPDATE {} SET expire_at = NULL WHERE key = $1", table.table_name());
                        sqlx::query(&sql)
                            .bind(key.as_str())
                            .execute(&mut *tx)
                            .await?;
                    }
                }
            }

            tx.commit().await?;
        });

        counter!("jobstore_write_transactions_total").increment(1);
        debug!("Committed write transaction with {} commands", self.commands.len());
        Ok(())
    }
}

fn expires_at(now: DateTime<Utc>, expire_in: Duration) -> DateTime<Utc> {
    now + to_chrono(expire_in)
}
