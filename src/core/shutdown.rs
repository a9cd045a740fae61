//! 优雅关闭
//!
//! 收到 Ctrl+C / SIGTERM 或输入流结束后，先让所有机器人原地停车，再退出进程。

use std::future::Future;
use std::sync::Arc;

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::fleet::FleetAdapter;

/// 关闭信号管理器
#[derive(Clone)]
pub struct ShutdownManager {
    token: CancellationToken,
    reason_tx: broadcast::Sender<ShutdownReason>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ShutdownReason {
    /// Ctrl+C
    Interrupt,
    /// SIGTERM
    Terminate,
    /// 控制消息输入流结束
    InputClosed,
    Fatal(String),
}

impl ShutdownManager {
    pub fn new() -> Self {
        let (reason_tx, _) = broadcast::channel(1);
        Self {
            token: CancellationToken::new(),
            reason_tx,
        }
    }

    /// 关闭时被取消的 token；机器人工作者与传输任务持有它的子 token
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn shutdown(&self, reason: ShutdownReason) {
        tracing::info!(?reason, "Shutting down");
        let _ = self.reason_tx.send(reason);
        self.token.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ShutdownReason> {
        self.reason_tx.subscribe()
    }

    pub async fn wait_for_shutdown(&self) {
        self.token.cancelled().await;
    }

    /// 监听 Ctrl+C 与 SIGTERM
    pub fn install_signal_handlers(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Received Ctrl+C, holding robots before exit");
                manager.shutdown(ShutdownReason::Interrupt);
            }
        });

        #[cfg(unix)]
        {
            let manager = Arc::clone(self);
            tokio::spawn(async move {
                use tokio::signal::unix::{signal, SignalKind};
                if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
                    sigterm.recv().await;
                    tracing::info!("Received SIGTERM, holding robots before exit");
                    manager.shutdown(ShutdownReason::Terminate);
                }
            });
        }
    }
}

impl Default for ShutdownManager {
    fn default() -> Self {
        Self::new()
    }
}

/// 关闭时执行的清理步骤
#[async_trait::async_trait]
pub trait ShutdownCleanup: Send + Sync {
    async fn cleanup(&self) -> anyhow::Result<()>;

    fn name(&self) -> &'static str;
}

/// 按注册顺序执行清理，每一步有超时
pub struct ShutdownCoordinator {
    manager: Arc<ShutdownManager>,
    steps: Vec<Arc<dyn ShutdownCleanup>>,
    timeout_secs: u64,
}

impl ShutdownCoordinator {
    pub fn new(manager: Arc<ShutdownManager>) -> Self {
        Self {
            manager,
            steps: Vec::new(),
            timeout_secs: 5,
        }
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    pub fn register<T: ShutdownCleanup + 'static>(&mut self, step: T) {
        self.steps.push(Arc::new(step));
    }

    pub async fn run_cleanup(&self) {
        let timeout = std::time::Duration::from_secs(self.timeout_secs);
        for step in &self.steps {
            match tokio::time::timeout(timeout, step.cleanup()).await {
                Ok(Ok(())) => tracing::info!("Cleanup step '{}' finished", step.name()),
                Ok(Err(e)) => tracing::warn!("Cleanup step '{}' failed: {}", step.name(), e),
                Err(_) => tracing::warn!(
                    "Cleanup step '{}' timed out after {}s",
                    step.name(),
                    self.timeout_secs
                ),
            }
        }
    }

    pub fn manager(&self) -> &Arc<ShutdownManager> {
        &self.manager
    }
}

/// 让车队所有机器人原地停车
pub struct HoldPositionCleanup {
    fleet: Arc<FleetAdapter>,
}

impl HoldPositionCleanup {
    pub fn new(fleet: Arc<FleetAdapter>) -> Self {
        Self { fleet }
    }
}

#[async_trait::async_trait]
impl ShutdownCleanup for HoldPositionCleanup {
    async fn cleanup(&self) -> anyhow::Result<()> {
        self.fleet.hold_all().await;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "HoldPosition"
    }
}

/// 运行应用直到其结束或收到关闭信号，然后执行清理
pub async fn run_with_graceful_shutdown<F, Fut>(
    manager: Arc<ShutdownManager>,
    app: F,
    cleanup: impl FnOnce() -> Fut,
) where
    F: Future<Output = ()>,
    Fut: Future<Output = ()>,
{
    manager.install_signal_handlers();

    tokio::select! {
        _ = app => tracing::info!("Adapter finished"),
        _ = manager.wait_for_shutdown() => tracing::info!("Shutdown signal received"),
    }

    cleanup().await;
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::config::AdapterConfig;
    use crate::driver::testing::{telemetry, RecordingDriver};
    use crate::driver::{FleetState, RobotMode};
    use crate::fleet::FleetAdapterBuilder;
    use crate::graph::tests::line_graph;

    struct Step {
        order: Arc<AtomicUsize>,
        seen: Arc<AtomicUsize>,
        delay_secs: u64,
    }

    #[async_trait::async_trait]
    impl ShutdownCleanup for Step {
        async fn cleanup(&self) -> anyhow::Result<()> {
            tokio::time::sleep(std::time::Duration::from_secs(self.delay_secs)).await;
            self.seen
                .store(self.order.fetch_add(1, Ordering::SeqCst) + 1, Ordering::SeqCst);
            Ok(())
        }

        fn name(&self) -> &'static str {
            "Step"
        }
    }

    #[test]
    fn test_shutdown_cancels_token_and_reports_reason() {
        let manager = ShutdownManager::new();
        let token = manager.token();
        let mut reasons = manager.subscribe();
        assert!(!manager.is_shutdown());

        manager.shutdown(ShutdownReason::InputClosed);
        assert!(token.is_cancelled());
        assert_eq!(reasons.try_recv().unwrap(), ShutdownReason::InputClosed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_cleanup_step_times_out() {
        let order = Arc::new(AtomicUsize::new(0));
        let slow = Arc::new(AtomicUsize::new(0));
        let fast = Arc::new(AtomicUsize::new(0));
        let mut coordinator = ShutdownCoordinator::new(Arc::new(ShutdownManager::new())).with_timeout(1);
        coordinator.register(Step {
            order: order.clone(),
            seen: slow.clone(),
            delay_secs: 30,
        });
        coordinator.register(Step {
            order: order.clone(),
            seen: fast.clone(),
            delay_secs: 0,
        });

        coordinator.run_cleanup().await;
        assert_eq!(slow.load(Ordering::SeqCst), 0);
        assert_eq!(fast.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_hold_position_cleanup_stops_robots() {
        let driver = Arc::new(RecordingDriver::default());
        let fleet = Arc::new(
            FleetAdapterBuilder::new(AdapterConfig::default(), line_graph(), driver.clone()).build(),
        );
        fleet.handle_fleet_state(FleetState {
            name: "fleet".to_string(),
            robots: vec![telemetry("r1", "", RobotMode::Idle, 5.0, 0.0, &[])],
        });

        let mut coordinator = ShutdownCoordinator::new(Arc::new(ShutdownManager::new()));
        coordinator.register(HoldPositionCleanup::new(fleet.clone()));
        coordinator.run_cleanup().await;

        let paths = driver.paths();
        assert_eq!(paths.len(), 1);
        assert_eq!(paths[0].path[0].x, 5.0);
    }
}
