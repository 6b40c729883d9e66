use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use metrics::counter;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, info};

use jobstore_core::StorageResult;

use crate::shutdown::ShutdownSignal;

/// 由存储实例托管的后台组件
///
/// 每个组件对应一个长期运行的任务：按 `interval()` 周期调用 `execute`，
/// 上一轮结束前不会开始下一轮。组件在批次之间应检查关闭信号。
#[async_trait]
pub trait BackgroundComponent: Send + Sync {
    fn name(&self) -> &'static str;

    fn interval(&self) -> Duration;

    async fn execute(&self, shutdown: &ShutdownSignal) -> StorageResult<()>;
}

/// 组件主循环，收到关闭信号后退出
pub async fn run_component(component: Arc<dyn BackgroundComponent>, mut shutdown: ShutdownSignal) {
    let name = component.name();
    info!(
        "Starting background component {} with interval {:?}",
        name,
        component.interval()
    );

    let mut ticker = interval(component.interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if shutdown.is_shutdown() {
                    break;
                }
                if let Err(e) = component.execute(&shutdown).await {
                    counter!("jobstore_background_failures_total", "component" => name).increment(1);
                    error!("Background component {} failed: {}", name, e);
                }
            }
            _ = shutdown.wait() => {
                info!("Background component {} shutdown requested", name);
                break;
            }
        }
    }

    info!("Background component {} stopped", name);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shutdown::ShutdownManager;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingComponent {
        runs: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl BackgroundComponent for CountingComponent {
        fn name(&self) -> &'static str {
            "CountingComponent"
        }

        fn interval(&self) -> Duration {
            Duration::from_millis(10)
        }

        async fn execute(&self, _shutdown: &ShutdownSignal) -> StorageResult<()> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(jobstore_core::StorageError::Internal("boom".to_string()));
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_component_runs_until_shutdown() {
        let component = Arc::new(CountingComponent {
            runs: AtomicUsize::new(0),
            fail: false,
        });
        let manager = ShutdownManager::new();
        let handle = tokio::spawn(run_component(component.clone(), manager.signal()));

        tokio::time::sleep(Duration::from_millis(60)).await;
        manager.shutdown();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("component should stop promptly")
            .unwrap();

        assert!(component.runs.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn test_failures_do_not_stop_the_loop() {
        let component = Arc::new(CountingComponent {
            runs: AtomicUsize::new(0),
            fail: true,
        });
        let manager = ShutdownManager::new();
        let handle = tokio::spawn(run_component(component.clone(), manager.signal()));

        tokio::time::sleep(Duration::from_millis(60)).await;
        manager.shutdown();
        handle.await.unwrap();

        assert!(component.runs.load(Ordering::SeqCst) >= 2);
    }
}
