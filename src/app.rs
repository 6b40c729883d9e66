use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use jobstore_core::{AppConfig, ServerData, StorageError};
use jobstore_infrastructure::{JobStorage, ShutdownSignal, StorageConnection};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// 应用运行模式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppMode {
    /// 常驻运行后台组件并维持服务器心跳
    Serve,
    /// 执行一轮计数器聚合后退出
    AggregateOnce,
    /// 执行一轮过期清理后退出
    ExpireOnce,
    /// 检查数据库连接后退出
    Health,
}

impl AppMode {
    pub const NAMES: [&'static str; 4] = ["serve", "aggregate-once", "expire-once", "health"];
}

impl FromStr for AppMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "serve" => Ok(AppMode::Serve),
            "aggregate-once" => Ok(AppMode::AggregateOnce),
            "expire-once" => Ok(AppMode::ExpireOnce),
            "health" => Ok(AppMode::Health),
            _ => Err(anyhow::anyhow!("不支持的运行模式: {s}")),
        }
    }
}

impl fmt::Display for AppMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AppMode::Serve => "serve",
            AppMode::AggregateOnce => "aggregate-once",
            AppMode::ExpireOnce => "expire-once",
            AppMode::Health => "health",
        };
        f.write_str(name)
    }
}

/// 主应用程序
pub struct Application {
    config: AppConfig,
    mode: AppMode,
    storage: Arc<JobStorage>,
    server_id: String,
}

impl Application {
    /// 连接存储并创建应用实例
    pub async fn new(config: AppConfig, mode: AppMode) -> Result<Self> {
        info!("初始化应用程序，模式: {}", mode);

        let storage = JobStorage::connect(&config.database, config.storage.clone())
            .await
            .context("连接作业存储失败")?;
        let server_id = config
            .server
            .server_id
            .clone()
            .unwrap_or_else(generate_server_id);

        Ok(Self {
            config,
            mode,
            storage: Arc::new(storage),
            server_id,
        })
    }

    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    /// 运行应用程序
    pub async fn run(&self, shutdown: ShutdownSignal) -> Result<()> {
        info!("启动应用程序，模式: {}，存储: {}", self.mode, self.storage);

        let result = match self.mode {
            AppMode::Serve => self.serve(shutdown).await,
            AppMode::AggregateOnce => self.aggregate_once(shutdown).await,
            AppMode::ExpireOnce => self.expire_once(shutdown).await,
            AppMode::Health => self.health().await,
        };

        self.storage.close().await;
        result
    }

    async fn serve(&self, mut shutdown: ShutdownSignal) -> Result<()> {
        self.storage.start().context("启动后台组件失败")?;

        let connection = self.storage.connection();
        let data = ServerData {
            worker_count: self.config.server.worker_count,
            queues: self.config.server.queues.clone(),
            started_at: Utc::now(),
        };
        connection
            .announce_server(&self.server_id, &data)
            .await
            .context("注册服务器失败")?;
        info!("服务器 {} 已注册", self.server_id);

        let mut ticker = interval(Duration::from_secs(
            self.config.server.heartbeat_interval_seconds,
        ));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // 第一次tick立即完成，注册时已经写入心跳
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.wait() => break,
                _ = ticker.tick() => {
                    self.heartbeat(&connection, &data).await;
                }
            }
        }

        info!("停止服务器 {}", self.server_id);
        match connection.remove_server(&self.server_id).await {
            Ok(true) => debug!("Server {} removed", self.server_id),
            Ok(false) => warn!("Server {} was already removed", self.server_id),
            Err(e) => error!("Failed to remove server {}: {}", self.server_id, e),
        }

        self.storage.shutdown().await;
        Ok(())
    }

    /// 刷新心跳并清理失联的服务器；心跳行被其他节点清理掉时重新注册
    async fn heartbeat(&self, connection: &StorageConnection, data: &ServerData) {
        match connection.heartbeat(&self.server_id).await {
            Ok(()) => debug!("Heartbeat sent for server {}", self.server_id),
            Err(StorageError::ServerNotFound { .. }) => {
                warn!(
                    "Server {} was removed by another node, announcing again",
                    self.server_id
                );
                if let Err(e) = connection.announce_server(&self.server_id, data).await {
                    error!("Failed to re-announce server {}: {}", self.server_id, e);
                }
            }
            Err(e) => error!("Heartbeat failed for server {}: {}", self.server_id, e),
        }

        let timeout = Duration::from_secs(self.config.server.server_timeout_seconds);
        if let Err(e) = connection.remove_timed_out_servers(timeout).await {
            error!("Failed to remove timed out servers: {}", e);
        }
    }

    async fn aggregate_once(&self, shutdown: ShutdownSignal) -> Result<()> {
        let stats = self
            .storage
            .counters_aggregator()
            .aggregate_once(&shutdown)
            .await
            .context("计数器聚合失败")?;
        info!(
            "计数器聚合完成: {} 批，{} 行，{} 个键",
            stats.batches, stats.rows_aggregated, stats.keys_updated
        );
        Ok(())
    }

    async fn expire_once(&self, shutdown: ShutdownSignal) -> Result<()> {
        let stats = self
            .storage
            .expiration_manager()
            .expire_once(&shutdown)
            .await
            .context("过期清理失败")?;
        info!(
            "过期清理完成: 共删除 {} 行，耗时 {:?}",
            stats.total_removed(),
            stats.duration
        );
        Ok(())
    }

    async fn health(&self) -> Result<()> {
        self.storage
            .health_check()
            .await
            .context("数据库健康检查失败")?;
        info!("数据库连接正常: {}", self.storage);
        Ok(())
    }
}

/// 安装 Prometheus 指标导出器
pub fn init_metrics(bind_address: &str) -> Result<()> {
    let address: SocketAddr = bind_address
        .parse()
        .with_context(|| format!("无效的指标监听地址: {bind_address}"))?;

    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(address)
        .install()
        .map_err(|e| anyhow::anyhow!("安装Prometheus指标导出器失败: {e}"))?;

    info!("Prometheus metrics exporter listening on {}", address);
    Ok(())
}

/// 主机名 + 进程号 + 随机后缀，保证同一主机上的多个进程互不冲突
pub fn generate_server_id() -> String {
    let host = hostname::get()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "unknown-host".to_string());
    format!("{}:{}:{}", host, std::process::id(), uuid::Uuid::new_v4())
}

/// 按命令行覆盖配置中的日志设置
pub fn apply_overrides(
    config: &mut AppConfig,
    log_level: Option<&String>,
    log_format: Option<&String>,
) -> Result<()> {
    if let Some(level) = log_level {
        config.observability.log_level = level.clone();
    }
    if let Some(format) = log_format {
        config.observability.log_format = format.parse()?;
    }
    Ok(())
}
