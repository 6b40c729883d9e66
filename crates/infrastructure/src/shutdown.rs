use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info};

/// 关闭信号管理器
///
/// 基于 `watch` 通道：关闭后订阅的接收者也能立即观察到关闭状态。
#[derive(Debug, Clone)]
pub struct ShutdownManager {
    sender: Arc<watch::Sender<bool>>,
}

impl ShutdownManager {
    pub fn new() -> Self {
        let (sender, _) = watch::channel(false);
        Self {
            sender: Arc::new(sender),
        }
    }

    /// 订阅关闭信号
    pub fn signal(&self) -> ShutdownSignal {
        ShutdownSignal {
            receiver: self.sender.subscribe(),
        }
    }

    /// 触发关闭，重复调用无副作用
    pub fn shutdown(&self) {
        if self.sender.send_replace(true) {
            debug!("Shutdown already triggered");
            return;
        }
        info!(
            "Shutdown signal sent to {} subscribers",
            self.sender.receiver_count()
        );
    }

    pub fn is_shutdown(&self) -> bool {
        *self.sender.borrow()
    }
}

impl Default for ShutdownManager {
    fn default() -> Self {
        Self::new()
    }
}

/// 后台任务持有的关闭信号
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    receiver: watch::Receiver<bool>,
}

impl ShutdownSignal {
    pub fn is_shutdown(&self) -> bool {
        *self.receiver.borrow()
    }

    /// 等待关闭信号；管理器被销毁同样视为关闭
    pub async fn wait(&mut self) {
        let _ = self.receiver.wait_for(|stopped| *stopped).await;
    }

    /// 休眠指定时长，期间收到关闭信号则提前返回 `false`
    pub async fn sleep(&self, duration: Duration) -> bool {
        if self.is_shutdown() {
            return false;
        }
        let mut signal = self.clone();
        tokio::select! {
            _ = tokio::time::sleep(duration) => true,
            _ = signal.wait() => false,
        }
    }
}
