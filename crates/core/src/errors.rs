use std::time::Duration;

use thiserror::Error;

/// 任务存储错误类型定义
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("数据库错误: {0}")]
    Database(#[from] sqlx::Error),

    #[error("配置错误: {0}")]
    Configuration(String),

    #[error("获取分布式锁超时: {resource} (等待 {timeout:?})")]
    LockTimeout { resource: String, timeout: Duration },

    #[error("任务未找到: {id}")]
    JobNotFound { id: i64 },

    #[error("服务器未找到: {id}")]
    ServerNotFound { id: String },

    #[error("并发修改冲突: {0}")]
    ConcurrentModification(String),

    #[error("序列化错误: {0}")]
    Serialization(String),

    #[error("内部错误: {0}")]
    Internal(String),
}

impl StorageError {
    /// 是否为锁等待超时，调用方可以据此决定重试还是放弃
    pub fn is_lock_timeout(&self) -> bool {
        matches!(self, StorageError::LockTimeout { .. })
    }

    /// 是否为可重试的连接类错误
    pub fn is_transient(&self) -> bool {
        match self {
            StorageError::Database(e) => is_transient_database_error(e),
            _ => false,
        }
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(e: serde_json::Error) -> Self {
        StorageError::Serialization(e.to_string())
    }
}

/// 判断sqlx错误是否属于瞬时连接故障
pub fn is_transient_database_error(error: &sqlx::Error) -> bool {
    matches!(
        error,
        sqlx::Error::Io(_) | sqlx::Error::Tls(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed
    )
}

/// 统一的Result类型
pub type StorageResult<T> = std::result::Result<T, StorageError>;
