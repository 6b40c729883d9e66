#![allow(dead_code)]

use std::sync::Arc;

use anyhow::Result;
use chrono::{TimeZone, Utc};
use tempfile::TempDir;

use jobstore_core::{DatabaseConfig, ManualClock, StorageOptions};
use jobstore_infrastructure::{DatabasePool, JobStorage, ShutdownManager};

pub const SQLITE_SCHEMA: &[&str] = &[
    r#"CREATE TABLE job (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        state_id INTEGER,
        state_name TEXT,
        invocation_data BLOB NOT NULL,
        arguments BLOB NOT NULL,
        created_at TEXT NOT NULL,
        expire_at TEXT
    )"#,
    r#"CREATE TABLE job_state (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        job_id INTEGER NOT NULL REFERENCES job (id),
        name TEXT NOT NULL,
        reason TEXT,
        data TEXT,
        created_at TEXT NOT NULL
    )"#,
    r#"CREATE TABLE job_parameter (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        job_id INTEGER NOT NULL REFERENCES job (id),
        name TEXT NOT NULL,
        value TEXT,
        UNIQUE (job_id, name)
    )"#,
    r#"CREATE TABLE job_queue (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        job_id INTEGER NOT NULL REFERENCES job (id),
        queue TEXT NOT NULL,
        fetched_at TEXT,
        fetch_token TEXT
    )"#,
    r#"CREATE TABLE counter (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        key TEXT NOT NULL,
        value INTEGER NOT NULL,
        expire_at TEXT
    )"#,
    r#"CREATE TABLE aggregated_counter (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        key TEXT NOT NULL UNIQUE,
        value INTEGER NOT NULL,
        expire_at TEXT
    )"#,
    r#"CREATE TABLE distributed_lock (
        resource TEXT NOT NULL UNIQUE,
        created_at TEXT NOT NULL
    )"#,
    r#"CREATE TABLE hash_entry (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        key TEXT NOT NULL,
        field TEXT NOT NULL,
        value TEXT,
        expire_at TEXT,
        UNIQUE (key, field)
    )"#,
    r#"CREATE TABLE list_entry (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        key TEXT NOT NULL,
        value TEXT NOT NULL,
        expire_at TEXT
    )"#,
    r#"CREATE TABLE set_entry (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        key TEXT NOT NULL,
        value TEXT NOT NULL,
        score REAL NOT NULL,
        expire_at TEXT,
        UNIQUE (key, value)
    )"#,
    r#"CREATE TABLE server (
        id TEXT PRIMARY KEY,
        data TEXT NOT NULL,
        last_heartbeat TEXT NOT NULL
    )"#,
    "CREATE INDEX ix_job_queue_queue_fetched_at ON job_queue (queue, fetched_at)",
    "CREATE INDEX ix_counter_key ON counter (key)",
];

pub const POSTGRES_SCHEMA: &[&str] = &[
    r#"CREATE TABLE job (
        id BIGSERIAL PRIMARY KEY,
        state_id BIGINT,
        state_name TEXT,
        invocation_data BYTEA NOT NULL,
        arguments BYTEA NOT NULL,
        created_at TIMESTAMPTZ NOT NULL,
        expire_at TIMESTAMPTZ
    )"#,
    r#"CREATE TABLE job_state (
        id BIGSERIAL PRIMARY KEY,
        job_id BIGINT NOT NULL REFERENCES job (id),
        name TEXT NOT NULL,
        reason TEXT,
        data TEXT,
        created_at TIMESTAMPTZ NOT NULL
    )"#,
    r#"CREATE TABLE job_parameter (
        id BIGSERIAL PRIMARY KEY,
        job_id BIGINT NOT NULL REFERENCES job (id),
        name TEXT NOT NULL,
        value TEXT,
        UNIQUE (job_id, name)
    )"#,
    r#"CREATE TABLE job_queue (
        id BIGSERIAL PRIMARY KEY,
        job_id BIGINT NOT NULL REFERENCES job (id),
        queue TEXT NOT NULL,
        fetched_at TIMESTAMPTZ,
        fetch_token TEXT
    )"#,
    r#"CREATE TABLE counter (
        id BIGSERIAL PRIMARY KEY,
        key TEXT NOT NULL,
        value BIGINT NOT NULL,
        expire_at TIMESTAMPTZ
    )"#,
    r#"CREATE TABLE aggregated_counter (
        id BIGSERIAL PRIMARY KEY,
        key TEXT NOT NULL UNIQUE,
        value BIGINT NOT NULL,
        expire_at TIMESTAMPTZ
    )"#,
    r#"CREATE TABLE distributed_lock (
        resource TEXT PRIMARY KEY,
        created_at TIMESTAMPTZ NOT NULL
    )"#,
    r#"CREATE TABLE hash_entry (
        id BIGSERIAL PRIMARY KEY,
        key TEXT NOT NULL,
        field TEXT NOT NULL,
        value TEXT,
        expire_at TIMESTAMPTZ,
        UNIQUE (key, field)
    )"#,
    r#"CREATE TABLE list_entry (
        id BIGSERIAL PRIMARY KEY,
        key TEXT NOT NULL,
        value TEXT NOT NULL,
        expire_at TIMESTAMPTZ
    )"#,
    r#"CREATE TABLE set_entry (
        id BIGSERIAL PRIMARY KEY,
        key TEXT NOT NULL,
        value TEXT NOT NULL,
        score DOUBLE PRECISION NOT NULL,
        expire_at TIMESTAMPTZ,
        UNIQUE (key, value)
    )"#,
    r#"CREATE TABLE server (
        id TEXT PRIMARY KEY,
        data TEXT NOT NULL,
        last_heartbeat TIMESTAMPTZ NOT NULL
    )"#,
    "CREATE INDEX ix_job_queue_queue_fetched_at ON job_queue (queue, fetched_at)",
    "CREATE INDEX ix_counter_key ON counter (key)",
];

/// 创建测试所需的表
pub async fn apply_schema(pool: &DatabasePool) -> Result<()> {
    match pool {
        DatabasePool::PostgreSQL(pool) => {
            for statement in POSTGRES_SCHEMA {
                sqlx::query(statement).execute(pool).await?;
            }
        }
        DatabasePool::SQLite(pool) => {
            for statement in SQLITE_SCHEMA {
                sqlx::query(statement).execute(pool).await?;
            }
        }
    }
    Ok(())
}

/// 表中的行数
pub async fn count_rows(pool: &DatabasePool, table: &str) -> Result<i64> {
    let sql = format!("SELECT COUNT(*) FROM {table}");
    let count = match pool {
        DatabasePool::PostgreSQL(pool) => sqlx::query_scalar::<_, i64>(&sql).fetch_one(pool).await?,
        DatabasePool::SQLite(pool) => sqlx::query_scalar::<_, i64>(&sql).fetch_one(pool).await?,
    };
    Ok(count)
}

/// 测试使用的固定起始时间
pub fn start_time() -> chrono::DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
}

/// 测试用选项：小批次、无批次间停顿、短轮询
pub fn test_options() -> StorageOptions {
    StorageOptions {
        invisibility_timeout_seconds: 30,
        aggregation_batch_size: 100,
        expiration_batch_size: 100,
        batch_delay_millis: 0,
        distributed_lock_staleness_seconds: 60,
        lock_poll_interval_millis: 10,
        background_lock_timeout_seconds: 1,
        shutdown_grace_period_seconds: 5,
        ..StorageOptions::default()
    }
}

/// 基于临时SQLite文件和手动时钟的存储
pub struct TestStorage {
    pub storage: JobStorage,
    pub clock: ManualClock,
    pub shutdown: ShutdownManager,
    _dir: TempDir,
}

impl TestStorage {
    pub async fn sqlite() -> Result<Self> {
        Self::sqlite_with_options(test_options()).await
    }

    pub async fn sqlite_with_options(options: StorageOptions) -> Result<Self> {
        let dir = TempDir::new()?;
        let database = DatabaseConfig {
            url: format!("sqlite:{}", dir.path().join("jobstore.db").display()),
            max_connections: 8,
            connection_timeout_seconds: 10,
            ..DatabaseConfig::default()
        };

        let clock = ManualClock::new(start_time());
        let storage =
            JobStorage::connect_with_clock(&database, options, Arc::new(clock.clone())).await?;
        apply_schema(storage.pool()).await?;

        Ok(Self {
            storage,
            clock,
            shutdown: ShutdownManager::new(),
            _dir: dir,
        })
    }

    pub fn pool(&self) -> &DatabasePool {
        self.storage.pool()
    }
}

/// 聚合计数器行的过期时间
pub async fn aggregated_expire_at(
    pool: &DatabasePool,
    key: &str,
) -> Result<Option<chrono::DateTime<Utc>>> {
    let sql = "SELECT expire_at FROM aggregated_counter WHERE key = $1";
    let expire_at = match pool {
        DatabasePool::PostgreSQL(pool) => {
            sqlx::query_scalar::<_, Option<chrono::DateTime<Utc>>>(sql)
                .bind(key)
                .fetch_one(pool)
                .await?
        }
        DatabasePool::SQLite(pool) => {
            sqlx::query_scalar::<_, Option<chrono::DateTime<Utc>>>(sql)
                .bind(key)
                .fetch_one(pool)
                .await?
        }
    };
    Ok(expire_at)
}
