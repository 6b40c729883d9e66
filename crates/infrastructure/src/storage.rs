use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::join_all;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use jobstore_core::{Clock, DatabaseConfig, StorageError, StorageOptions, StorageResult, SystemClock};

use crate::background::{run_component, BackgroundComponent};
use crate::connection::StorageConnection;
use crate::counters_aggregator::CountersAggregator;
use crate::database::{describe_url, DatabasePool};
use crate::distributed_lock::DistributedLockManager;
use crate::expiration_manager::ExpirationManager;
use crate::shutdown::ShutdownManager;

/// 作业存储实例
///
/// 持有连接池和后台组件（计数器聚合、过期清理）。`start()` 为每个组件启动一个
/// 长期任务，`shutdown()` 发出关闭信号并在宽限期内等待进行中的一轮结束。
pub struct JobStorage {
    pool: DatabasePool,
    clock: Arc<dyn Clock>,
    options: Arc<StorageOptions>,
    description: String,
    shutdown: ShutdownManager,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl JobStorage {
    /// 使用系统时钟连接存储
    pub async fn connect(database: &DatabaseConfig, options: StorageOptions) -> StorageResult<Self> {
        Self::connect_with_clock(database, options, Arc::new(SystemClock)).await
    }

    pub async fn connect_with_clock(
        database: &DatabaseConfig,
        options: StorageOptions,
        clock: Arc<dyn Clock>,
    ) -> StorageResult<Self> {
        database
            .validate()
            .map_err(|e| StorageError::Configuration(format!("{e:#}")))?;
        let pool = DatabasePool::connect(database).await?;
        Self::from_pool(pool, options, clock, describe_url(&database.url))
    }

    /// 基于已有连接池创建存储实例
    pub fn from_pool(
        pool: DatabasePool,
        options: StorageOptions,
        clock: Arc<dyn Clock>,
        description: impl Into<String>,
    ) -> StorageResult<Self> {
        options
            .validate()
            .map_err(|e| StorageError::Configuration(format!("{e:#}")))?;

        Ok(Self {
            pool,
            clock,
            options: Arc::new(options),
            description: description.into(),
            shutdown: ShutdownManager::new(),
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn pool(&self) -> &DatabasePool {
        &self.pool
    }

    pub fn options(&self) -> &StorageOptions {
        &self.options
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        self.clock.clone()
    }

    pub fn lock_manager(&self) -> DistributedLockManager {
        DistributedLockManager::new(
            self.pool.clone(),
            self.clock.clone(),
            self.options.distributed_lock_staleness(),
            self.options.lock_poll_interval(),
        )
    }

    pub fn connection(&self) -> StorageConnection {
        StorageConnection::new(
            self.pool.clone(),
            self.clock.clone(),
            self.lock_manager(),
            self.options.clone(),
        )
    }

    pub fn counters_aggregator(&self) -> CountersAggregator {
        CountersAggregator::new(self.pool.clone(), self.lock_manager(), self.options.clone())
    }

    pub fn expiration_manager(&self) -> ExpirationManager {
        ExpirationManager::new(
            self.pool.clone(),
            self.clock.clone(),
            self.lock_manager(),
            self.options.clone(),
        )
    }

    /// 存储托管的后台组件
    pub fn components(&self) -> Vec<Arc<dyn BackgroundComponent>> {
        vec![
            Arc::new(self.expiration_manager()),
            Arc::new(self.counters_aggregator()),
        ]
    }

    /// 启动后台组件，重复调用不会重复启动
    pub fn start(&self) -> StorageResult<()> {
        if self.shutdown.is_shutdown() {
            return Err(StorageError::Internal("存储已关闭，不能再次启动".to_string()));
        }

        let mut tasks = self
            .tasks
            .lock()
            .map_err(|_| StorageError::Internal("后台任务列表锁已损坏".to_string()))?;
        if !tasks.is_empty() {
            warn!("Background components are already running");
            return Ok(());
        }

        for component in self.components() {
            info!("Spawning background component {}", component.name());
            tasks.push(tokio::spawn(run_component(component, self.shutdown.signal())));
        }

        info!("Job storage {} started", self.description);
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.tasks
            .lock()
            .map(|tasks| tasks.iter().any(|task| !task.is_finished()))
            .unwrap_or(false)
    }

    /// 使用配置的宽限期关闭
    pub async fn shutdown(&self) {
        self.shutdown_with_grace(self.options.shutdown_grace_period())
            .await
    }

    /// 发出关闭信号，等待后台任务结束；超过宽限期的任务会被中止
    pub async fn shutdown_with_grace(&self, grace: Duration) {
        self.shutdown.shutdown();

        let tasks: Vec<JoinHandle<()>> = match self.tasks.lock() {
            Ok(mut tasks) => tasks.drain(..).collect(),
            Err(poisoned) => poisoned.into_inner().drain(..).collect(),
        };
        if tasks.is_empty() {
            return;
        }

        let abort_handles: Vec<_> = tasks.iter().map(|task| task.abort_handle()).collect();
        match tokio::time::timeout(grace, join_all(tasks)).await {
            Ok(results) => {
                for result in results {
                    if let Err(e) = result {
                        warn!("Background component ended abnormally: {}", e);
                    }
                }
                info!("Job storage {} stopped", self.description);
            }
            Err(_) => {
                warn!(
                    "Background components did not stop within {:?}, aborting",
                    grace
                );
                for handle in abort_handles {
                    handle.abort();
                }
            }
        }
    }

    pub async fn health_check(&self) -> StorageResult<()> {
        self.pool.health_check().await
    }

    /// 关闭连接池
    pub async fn close(&self) {
        self.pool.close().await
    }
}

impl fmt::Display for JobStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.description)
    }
}

impl fmt::Debug for JobStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobStorage")
            .field("description", &self.description)
            .field("options", &self.options)
            .finish()
    }
}
