//! Fleet Adapter 入口
//!
//! 加载配置与导航图，stdin 读入 JSON-lines 控制消息，stdout 写出命令与状态；
//! 收到关闭信号或输入结束时让所有机器人原地停车后退出。

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use fleet_adapter::config::load_config;
use fleet_adapter::core::{
    run_with_graceful_shutdown, HoldPositionCleanup, ShutdownCoordinator, ShutdownManager,
    ShutdownReason,
};
use fleet_adapter::fleet::transport::{forward_status, read_inbound, write_outbound, JsonLinesPublisher};
use fleet_adapter::graph::NavigationGraph;
use fleet_adapter::{observability, FleetAdapterBuilder};
use tokio::io::BufReader;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init();

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = load_config(config_path).context("Failed to load config")?;
    let graph_file = config
        .fleet
        .nav_graph_file
        .clone()
        .context("fleet.nav_graph_file is not set")?;
    let graph = NavigationGraph::load(&graph_file)
        .with_context(|| format!("Failed to load navigation graph {}", graph_file.display()))?;

    let (publisher, outbound) = JsonLinesPublisher::new();
    let fleet = Arc::new(
        FleetAdapterBuilder::new(config, graph, Arc::new(publisher.clone()))
            .with_devices(Arc::new(publisher.clone()))
            .with_lane_publisher(Arc::new(publisher.clone()))
            .build(),
    );
    tracing::info!("Fleet adapter [{}] ready", fleet.name());

    let manager = Arc::new(ShutdownManager::new());
    let token = manager.token();
    let writer = tokio::spawn(write_outbound(outbound, tokio::io::stdout()));
    tokio::spawn(forward_status(
        fleet.subscribe_status(),
        publisher,
        token.child_token(),
    ));

    let mut coordinator = ShutdownCoordinator::new(manager.clone()).with_timeout(10);
    coordinator.register(HoldPositionCleanup::new(fleet.clone()));

    let reader_fleet = fleet.clone();
    let reader_manager = manager.clone();
    let app = async move {
        let stdin = BufReader::new(tokio::io::stdin());
        if let Err(e) = read_inbound(stdin, reader_fleet, token.child_token()).await {
            tracing::error!("Inbound stream failed: {}", e);
            reader_manager.shutdown(ShutdownReason::Fatal(e.to_string()));
            return;
        }
        reader_manager.shutdown(ShutdownReason::InputClosed);
    };

    run_with_graceful_shutdown(manager, app, || async move {
        coordinator.run_cleanup().await;
    })
    .await;

    // 所有发布端释放后写出任务结束
    drop(fleet);
    let _ = tokio::time::timeout(std::time::Duration::from_secs(1), writer).await;
    Ok(())
}
