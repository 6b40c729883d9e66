use std::time::Duration;

use serde::{Deserialize, Serialize};

/// 存储引擎选项
///
/// 所有时间类配置使用秒或毫秒整数，便于在TOML和环境变量中书写；
/// 代码中通过对应的访问方法取得 `Duration`。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageOptions {
    /// 已领取但未确认的队列条目在多久之后可以被重新领取
    pub invisibility_timeout_seconds: u64,
    /// 计数器聚合间隔
    pub counters_aggregate_interval_seconds: u64,
    /// 过期数据清理间隔
    pub job_expiration_check_interval_seconds: u64,
    /// 单个聚合事务最多折叠的增量行数
    pub aggregation_batch_size: u32,
    /// 单个清理批次最多删除的行数
    pub expiration_batch_size: u32,
    /// 批次之间的停顿，避免长时间占用繁忙的表
    pub batch_delay_millis: u64,
    /// 分布式锁被视为遗弃的持有时长
    pub distributed_lock_staleness_seconds: u64,
    /// 分布式锁轮询间隔（另加随机抖动）
    pub lock_poll_interval_millis: u64,
    /// 后台组件获取分布式锁的等待时间
    pub background_lock_timeout_seconds: u64,
    /// 关闭时等待后台任务结束的时间
    pub shutdown_grace_period_seconds: u64,
}

impl Default for StorageOptions {
    fn default() -> Self {
        Self {
            invisibility_timeout_seconds: 1800,
            counters_aggregate_interval_seconds: 300,
            job_expiration_check_interval_seconds: 3600,
            aggregation_batch_size: 1000,
            expiration_batch_size: 1000,
            batch_delay_millis: 500,
            distributed_lock_staleness_seconds: 600,
            lock_poll_interval_millis: 100,
            background_lock_timeout_seconds: 5,
            shutdown_grace_period_seconds: 30,
        }
    }
}

impl StorageOptions {
    pub fn invisibility_timeout(&self) -> Duration {
        Duration::from_secs(self.invisibility_timeout_seconds)
    }

    pub fn counters_aggregate_interval(&self) -> Duration {
        Duration::from_secs(self.counters_aggregate_interval_seconds)
    }

    pub fn job_expiration_check_interval(&self) -> Duration {
        Duration::from_secs(self.job_expiration_check_interval_seconds)
    }

    pub fn batch_delay(&self) -> Duration {
        Duration::from_millis(self.batch_delay_millis)
    }

    pub fn distributed_lock_staleness(&self) -> Duration {
        Duration::from_secs(self.distributed_lock_staleness_seconds)
    }

    pub fn lock_poll_interval(&self) -> Duration {
        Duration::from_millis(self.lock_poll_interval_millis)
    }

    pub fn background_lock_timeout(&self) -> Duration {
        Duration::from_secs(self.background_lock_timeout_seconds)
    }

    pub fn shutdown_grace_period(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_period_seconds)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.invisibility_timeout_seconds == 0 {
            return Err(anyhow::anyhow!("不可见超时必须大于0"));
        }

        if self.counters_aggregate_interval_seconds == 0 {
            return Err(anyhow::anyhow!("计数器聚合间隔必须大于0"));
        }

        if self.job_expiration_check_interval_seconds == 0 {
            return Err(anyhow::anyhow!("过期清理间隔必须大于0"));
        }

        if self.aggregation_batch_size == 0 || self.expiration_batch_size == 0 {
            return Err(anyhow::anyhow!("批次大小必须大于0"));
        }

        if self.distributed_lock_staleness_seconds == 0 {
            return Err(anyhow::anyhow!("分布式锁失效阈值必须大于0"));
        }

        if self.lock_poll_interval_millis == 0 {
            return Err(anyhow::anyhow!("分布式锁轮询间隔必须大于0"));
        }

        Ok(())
    }
}
