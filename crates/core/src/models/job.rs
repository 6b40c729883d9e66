use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 作业记录
///
/// `invocation_data` 和 `arguments` 是调用方序列化后的不透明载荷，
/// 存储层只负责原样保存和读取。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobData {
    pub id: i64,
    pub state_name: Option<String>,
    pub invocation_data: Vec<u8>,
    pub arguments: Vec<u8>,
    pub created_at: DateTime<Utc>,
    pub expire_at: Option<DateTime<Utc>>,
}

/// 创建作业请求
#[derive(Debug, Clone, Default)]
pub struct CreateJob {
    pub invocation_data: Vec<u8>,
    pub arguments: Vec<u8>,
    pub parameters: HashMap<String, String>,
    /// 创建时同时写入的初始状态
    pub initial_state: Option<NewState>,
    /// 作业在创建后多久过期，None 表示永不过期
    pub expire_in: Option<Duration>,
}

impl CreateJob {
    pub fn new(invocation_data: impl Into<Vec<u8>>, arguments: impl Into<Vec<u8>>) -> Self {
        Self {
            invocation_data: invocation_data.into(),
            arguments: arguments.into(),
            ..Default::default()
        }
    }

    pub fn with_parameter(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.insert(name.into(), value.into());
        self
    }

    pub fn with_initial_state(mut self, state: NewState) -> Self {
        self.initial_state = Some(state);
        self
    }

    pub fn expire_in(mut self, expire_in: Duration) -> Self {
        self.expire_in = Some(expire_in);
        self
    }
}

/// 待写入的作业状态
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct NewState {
    pub name: String,
    pub reason: Option<String>,
    pub data: HashMap<String, String>,
}

impl NewState {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn with_data(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }
}

/// 作业当前状态
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateData {
    pub name: String,
    pub reason: Option<String>,
    pub data: HashMap<String, String>,
}

/// 状态历史记录中的一条
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStateRecord {
    pub id: i64,
    pub job_id: i64,
    pub name: String,
    pub reason: Option<String>,
    pub data: HashMap<String, String>,
    pub created_at: DateTime<Utc>,
}

impl From<JobStateRecord> for StateData {
    fn from(record: JobStateRecord) -> Self {
        Self {
            name: record.name,
            reason: record.reason,
            data: record.data,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_job_builder() {
        let job = CreateJob::new(b"Type.Method".to_vec(), b"[1,2]".to_vec())
            .with_parameter("CurrentCulture", "en-US")
            .with_initial_state(NewState::new("Enqueued").with_data("Queue", "default"))
            .expire_in(Duration::from_secs(60));

        assert_eq!(job.invocation_data, b"Type.Method");
        assert_eq!(job.parameters.get("CurrentCulture").map(String::as_str), Some("en-US"));
        let state = job.initial_state.unwrap();
        assert_eq!(state.name, "Enqueued");
        assert_eq!(state.data.get("Queue").map(String::as_str), Some("default"));
        assert_eq!(job.expire_in, Some(Duration::from_secs(60)));
    }
}
