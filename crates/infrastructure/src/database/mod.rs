//! 连接提供者
//!
//! 所有SQL只写一遍：占位符统一使用 `$n`，时间戳由 [`Clock`](jobstore_core::Clock)
//! 绑定而不是依赖数据库的 `NOW()`，因此同一条语句可以同时在PostgreSQL和SQLite上执行。

pub mod manager;

pub use manager::{describe_url, DatabasePool, DatabaseType};

/// 对两种连接池执行同一段代码
///
/// `$p` 在PostgreSQL分支中绑定为 `&PgPool`，在SQLite分支中绑定为 `&SqlitePool`，
/// 代码体会分别针对两种驱动展开编译。
macro_rules! with_pool {
    ($pool:expr, $p:ident => $body:expr) => {
        match $pool {
            $crate::database::DatabasePool::PostgreSQL($p) => $body,
            $crate::database::DatabasePool::SQLite($p) => $body,
        }
    };
}

pub(crate) use with_pool;

/// 生成 `$start, $start+1, ...` 形式的占位符列表
pub(crate) fn placeholders(start: usize, count: usize) -> String {
    (start..start + count)
        .map(|i| format!("${i}"))
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_placeholders() {
        assert_eq!(placeholders(1, 3), "$1, $2, $3");
        assert_eq!(placeholders(4, 1), "$4");
        assert_eq!(placeholders(2, 0), "");
    }
}
