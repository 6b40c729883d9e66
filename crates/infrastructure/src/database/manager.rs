use std::str::FromStr;
use std::time::Duration;

use sqlx::postgres::PgPoolOptions;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use tracing::{debug, info, warn};

use jobstore_core::config::models::database::is_valid_identifier;
use jobstore_core::{is_transient_database_error, DatabaseConfig, StorageError, StorageResult};

/// Database type detection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatabaseType {
    PostgreSQL,
    SQLite,
}

impl DatabaseType {
    pub fn from_url(url: &str) -> Self {
        if url.starts_with("postgres://") || url.starts_with("postgresql://") {
            DatabaseType::PostgreSQL
        } else {
            DatabaseType::SQLite
        }
    }
}

/// Database connection pool
///
/// 克隆只复制连接池句柄，底层连接共享。
#[derive(Debug, Clone)]
pub enum DatabasePool {
    PostgreSQL(sqlx::PgPool),
    SQLite(sqlx::SqlitePool),
}

impl DatabasePool {
    /// 按配置建立连接池，瞬时故障按 `connect_retries` 重试
    pub async fn connect(config: &DatabaseConfig) -> StorageResult<Self> {
        if let Some(schema) = &config.schema_name {
            if !is_valid_identifier(schema) {
                return Err(StorageError::Configuration(format!(
                    "无效的schema名称: {schema}"
                )));
            }
        }

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match Self::try_connect(config).await {
                Ok(pool) => {
                    info!(
                        "Connected to {} ({:?}) on attempt {}",
                        describe_url(&config.url),
                        pool.database_type(),
                        attempt
                    );
                    return Ok(pool);
                }
                Err(e) if is_transient_database_error(&e) && attempt <= config.connect_retries => {
                    let backoff = Duration::from_millis(500 * u64::from(attempt));
                    warn!(
                        "Failed to connect to {} (attempt {}): {}. Retrying in {:?}",
                        describe_url(&config.url),
                        attempt,
                        e,
                        backoff
                    );
                    tokio::time::sleep(backoff).await;
                }
                Err(e) => return Err(StorageError::Database(e)),
            }
        }
    }

    async fn try_connect(config: &DatabaseConfig) -> Result<Self, sqlx::Error> {
        let acquire_timeout = Duration::from_secs(config.connection_timeout_seconds);
        let idle_timeout = Duration::from_secs(config.idle_timeout_seconds);

        match DatabaseType::from_url(&config.url) {
            DatabaseType::PostgreSQL => {
                let mut options = PgPoolOptions::new()
                    .max_connections(config.max_connections)
                    .min_connections(config.min_connections)
                    .acquire_timeout(acquire_timeout)
                    .idle_timeout(Some(idle_timeout));

                if let Some(schema) = config.schema_name.clone() {
                    options = options.after_connect(move |conn, _meta| {
                        let statement = format!("SET search_path TO {schema}");
                        Box::pin(async move {
                            sqlx::query(&statement).execute(conn).await?;
                            Ok(())
                        })
                    });
                }

                let pool = options.connect(&config.url).await?;
                Ok(DatabasePool::PostgreSQL(pool))
            }
            DatabaseType::SQLite => {
                let connect_options = SqliteConnectOptions::from_str(&config.url)?
                    .create_if_missing(true)
                    .foreign_keys(true)
                    .journal_mode(SqliteJournalMode::Wal)
                    .busy_timeout(acquire_timeout);

                let pool = SqlitePoolOptions::new()
                    .max_connections(config.max_connections)
                    .min_connections(config.min_connections)
                    .acquire_timeout(acquire_timeout)
                    .idle_timeout(Some(idle_timeout))
                    .connect_with(connect_options)
                    .await?;
                Ok(DatabasePool::SQLite(pool))
            }
        }
    }

    pub fn database_type(&self) -> DatabaseType {
        match self {
            DatabasePool::PostgreSQL(_) => DatabaseType::PostgreSQL,
            DatabasePool::SQLite(_) => DatabaseType::SQLite,
        }
    }

    pub async fn health_check(&self) -> StorageResult<()> {
        match self {
            DatabasePool::PostgreSQL(pool) => {
                sqlx::query("SELECT 1").execute(pool).await?;
            }
            DatabasePool::SQLite(pool) => {
                sqlx::query("SELECT 1").execute(pool).await?;
            }
        }
        debug!("Database health check passed");
        Ok(())
    }

    pub async fn close(&self) {
        match self {
            DatabasePool::PostgreSQL(pool) => pool.close().await,
            DatabasePool::SQLite(pool) => pool.close().await,
        }
    }
}

/// 连接串的可读描述，只保留主机、端口和数据库名，不包含凭据
pub fn describe_url(url: &str) -> String {
    match DatabaseType::from_url(url) {
        DatabaseType::PostgreSQL => match url::Url::parse(url) {
            Ok(parsed) => {
                let host = parsed.host_str().unwrap_or("localhost");
                let database = parsed.path().trim_start_matches('/');
                match parsed.port() {
                    Some(port) => format!("PostgreSQL: {host}:{port}/{database}"),
                    None => format!("PostgreSQL: {host}/{database}"),
                }
            }
            Err(_) => "PostgreSQL: <unparseable connection string>".to_string(),
        },
        DatabaseType::SQLite => {
            let path = url
                .trim_start_matches("sqlite://")
                .trim_start_matches("sqlite:");
            let path = path.split('?').next().unwrap_or(path);
            format!("SQLite: {path}")
        }
    }
}
