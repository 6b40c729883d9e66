use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 服务器公告内容，以JSON形式保存在 server.data 列
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerData {
    pub worker_count: u32,
    pub queues: Vec<String>,
    pub started_at: DateTime<Utc>,
}

/// 已注册的服务器
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerRecord {
    pub id: String,
    pub data: ServerData,
    pub last_heartbeat: DateTime<Utc>,
}
