//! 车队适配器错误类型与恢复动作
//!
//! 与 RecoveryEngine 配合：根据 FleetError 决定 Resend / Replan / Skip / Reject / Abort。

use thiserror::Error;

/// 适配器运行过程中可能出现的错误（通信、失效、规划、契约违背、越界输入）
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FleetError {
    /// 驱动尚未确认最新命令（关联 ID 不匹配）
    #[error("Robot [{robot}] has not acknowledged command [{command}]")]
    CommandUnacknowledged { robot: String, command: String },

    /// 驱动上报内部故障模式
    #[error("Fleet driver reported a fault for robot [{robot}]")]
    DriverFault { robot: String },

    /// 超时未收到进度
    #[error("Command handle for robot [{robot}] seems to be unresponsive")]
    Unresponsive { robot: String },

    /// 车道关闭使当前计划失效
    #[error("Lanes {lanes:?} closed on the path of robot [{robot}]")]
    LaneClosed { robot: String, lanes: Vec<usize> },

    #[error("Cannot find a plan for robot [{robot}] to reach [{goal}]")]
    PlanningFailed { robot: String, goal: String },

    #[error("Unable to find any path for robot [{robot}] to get from waypoint [{from}] to waypoint [{to}]")]
    NoPath { robot: String, from: String, to: String },

    /// 契约违背：导航图中不存在该停靠点
    #[error("Dock [{0}] does not exist on the navigation graph")]
    UnknownDock(String),

    /// 契约违背：电量百分比不在 [0,100]
    #[error("Battery percentage [{0}] is outside of the valid range [0,100]")]
    BatteryOutOfRange(f64),

    /// 越界输入：机器人位置无法落到导航图上
    #[error("Robot [{robot}] cannot be placed on the navigation graph: {hint}")]
    OffGraph { robot: String, hint: String },

    #[error("Could not find robot [{robot}] in fleet [{fleet}]")]
    UnknownRobot { robot: String, fleet: String },

    #[error("Phase cancelled")]
    Cancelled,

    #[error("Config error: {0}")]
    ConfigError(String),

    #[error("Graph error: {0}")]
    GraphError(String),
}

/// 恢复引擎根据错误类型给出的建议动作
#[derive(Debug, Clone, PartialEq)]
pub enum RecoveryAction {
    /// 在宽限期后重发当前命令，不对用户可见
    Resend,
    /// 请求重新规划（失效不是错误，而是恢复动作）
    Replan,
    /// 丢弃本次更新，保留之前的状态
    Skip,
    /// 拒绝接纳该输入（附带诊断）
    Reject(String),
    /// 终止当前阶段并向上报告错误
    Abort(String),
}
