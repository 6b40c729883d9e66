use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// 已被当前消费者领取的队列条目
///
/// `fetch_token` 在每次领取时重新生成，确认（删除）和归还操作都以它为条件，
/// 防止超时后被他人重新领取的条目被旧的领取者误操作。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchedJob {
    pub id: i64,
    pub job_id: i64,
    pub queue: String,
    pub fetch_token: Uuid,
    pub fetched_at: DateTime<Utc>,
}
