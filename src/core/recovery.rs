//! 错误恢复引擎
//!
//! 根据 FleetError 类型返回 RecoveryAction，供机器人工作循环决定是重发、重规划、跳过、拒绝还是终止。

use crate::core::{FleetError, RecoveryAction};

/// 语义化错误恢复：将错误映射为可执行动作
#[derive(Debug, Default)]
pub struct RecoveryEngine;

impl RecoveryEngine {
    pub fn new() -> Self {
        Self
    }

    /// 根据错误类型返回建议的恢复动作
    pub fn handle(&self, err: &FleetError) -> RecoveryAction {
        match err {
            FleetError::CommandUnacknowledged { .. } => RecoveryAction::Resend,
            FleetError::DriverFault { .. }
            | FleetError::Unresponsive { .. }
            | FleetError::LaneClosed { .. } => RecoveryAction::Replan,
            FleetError::BatteryOutOfRange(_) => RecoveryAction::Skip,
            FleetError::OffGraph { hint, .. } => RecoveryAction::Reject(hint.clone()),
            FleetError::UnknownRobot { .. } => RecoveryAction::Reject(err.to_string()),
            // 规划失败意味着目标与导航图不一致，不自动重试
            FleetError::PlanningFailed { .. }
            | FleetError::NoPath { .. }
            | FleetError::UnknownDock(_) => RecoveryAction::Abort(err.to_string()),
            FleetError::Cancelled => RecoveryAction::Abort("cancelled".to_string()),
            _ => RecoveryAction::Abort(err.to_string()),
        }
    }
}
