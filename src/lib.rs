//! Fleet Adapter - 多机器人共享导航图的车队适配器
//!
//! 模块划分：
//! - **config**: 适配器配置加载（TOML + 环境变量）
//! - **core**: 错误与恢复、调度时钟、优雅关闭
//! - **graph**: 导航图与邻近查询
//! - **traffic**: 轨迹、行程与共享调度
//! - **planning**: 规划契约与最短路径规划器
//! - **negotiation**: 交通冲突协商
//! - **driver**: 驱动消息与遥测对账
//! - **phases**: 任务阶段状态机（GoToPlace、MoveRobot、停靠、门、电梯、动作）
//! - **robot**: 每个机器人的串行工作者
//! - **fleet**: 车队适配器、构建器与 JSON-lines 传输

pub mod config;
pub mod core;
pub mod driver;
pub mod fleet;
pub mod graph;
pub mod negotiation;
pub mod observability;
pub mod phases;
pub mod planning;
pub mod robot;
pub mod traffic;

pub use fleet::{FleetAdapter, FleetAdapterBuilder};
