use serde::{Deserialize, Serialize};

/// 后台服务器（进程）配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// 为空时使用 主机名:进程号:随机后缀
    pub server_id: Option<String>,
    pub queues: Vec<String>,
    pub worker_count: u32,
    pub heartbeat_interval_seconds: u64,
    /// 心跳超过该时长的服务器记录会被移除
    pub server_timeout_seconds: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            server_id: None,
            queues: vec!["default".to_string()],
            worker_count: 20,
            heartbeat_interval_seconds: 30,
            server_timeout_seconds: 300,
        }
    }
}

impl ServerConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.queues.is_empty() {
            return Err(anyhow::anyhow!("至少需要配置一个队列"));
        }

        if self.queues.iter().any(|q| q.trim().is_empty()) {
            return Err(anyhow::anyhow!("队列名称不能为空"));
        }

        if self.heartbeat_interval_seconds == 0 {
            return Err(anyhow::anyhow!("心跳间隔必须大于0"));
        }

        if self.server_timeout_seconds <= self.heartbeat_interval_seconds {
            return Err(anyhow::anyhow!("服务器超时时间必须大于心跳间隔"));
        }

        Ok(())
    }
}
