//! 任务阶段：阶段状态机及其子阶段
//!
//! 阶段分为待开始（`PendingPhase`）与进行中（`ActivePhase`）两种形态。
//! 所有输入（驱动进度、计时器、计划结果、设备状态）以 `PhaseInput` 形式由机器人工作者
//! 串行投递，阶段之间不共享可变状态，也没有回调。

pub mod dock_robot;
pub mod door;
pub mod go_to_place;
pub mod lift;
pub mod move_robot;
pub mod perform_action;
pub mod sequence;

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use crate::core::FleetError;
use crate::driver::{CommandId, DoorState, LiftState};
use crate::negotiation::{NegotiationId, Responder, TableView};
use crate::planning::Plan;
use crate::robot::RobotContext;
use crate::traffic::{Duration, ItineraryVersion, Time};

pub use dock_robot::PendingDockRobot;
pub use door::{PendingDoorClose, PendingDoorOpen};
pub use go_to_place::{plan_sub_phases, PendingGoToPlace, SubPhase};
pub use lift::PendingRequestLift;
pub use move_robot::PendingMoveRobot;
pub use perform_action::PendingPerformAction;
pub use sequence::TaskSequence;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseState {
    Active,
    Completed,
    Failed,
}

/// 人类可读的阶段状态
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseStatus {
    pub robot: String,
    pub state: PhaseState,
    pub status: String,
    pub start_time: Time,
    pub end_time: Time,
}

/// 投递给阶段的输入
#[derive(Debug, Clone)]
pub enum PhaseInput {
    Progress {
        command: CommandId,
        path_index: usize,
        estimate: std::time::Duration,
    },
    PathFinished { command: CommandId },
    DockFinished { command: CommandId },
    ActionFinished,
    /// 计时器触发，携带启动计时器时分配的 ID
    Tick(u64),
    /// 计划作业结果；`request` 不是最新请求时被忽略
    PlanReady { request: u64, plan: Option<Plan> },
    Door(DoorState),
    Lift(LiftState),
}

#[derive(Debug, Clone, PartialEq)]
pub enum PhaseOutcome {
    Completed,
    Failed(FleetError),
}

/// 阶段开始的结果：进入运行，或立即结束
pub enum Started {
    Running(Box<dyn ActivePhase>),
    Done(PhaseOutcome),
}

pub trait PendingPhase: Send {
    fn description(&self) -> &str;

    fn estimate_duration(&self) -> Duration;

    fn begin(self: Box<Self>, ctx: &mut RobotContext) -> Started;
}

/// 进行中的阶段；除 `handle` 外的钩子默认不做任何事
pub trait ActivePhase: Send {
    fn description(&self) -> &str;

    /// 处理一个输入，返回 Some 表示阶段结束
    fn handle(&mut self, ctx: &mut RobotContext, input: &PhaseInput) -> Option<PhaseOutcome>;

    /// 取消；不再下发新的驱动命令
    fn cancel(&mut self, ctx: &mut RobotContext);

    fn estimate_remaining_time(&self, ctx: &RobotContext) -> Duration;

    fn emergency_alarm(&mut self, _ctx: &mut RobotContext, _on: bool) -> Option<PhaseOutcome> {
        None
    }

    /// 响应协商；返回 false 表示本阶段不参与协商
    fn respond(
        &mut self,
        _ctx: &mut RobotContext,
        _table: TableView,
        _responder: Arc<dyn Responder>,
    ) -> bool {
        false
    }

    /// 执行仲裁批准的方案，并通过 `reply` 返回提交后的行程版本
    ///
    /// `negotiation` 不是本阶段当前的应答时回复 None，不做任何事。
    fn approve(
        &mut self,
        _ctx: &mut RobotContext,
        _negotiation: NegotiationId,
        _plan: Plan,
        reply: oneshot::Sender<Option<ItineraryVersion>>,
    ) -> Option<PhaseOutcome> {
        let _ = reply.send(None);
        None
    }

    fn replan(&mut self, _ctx: &mut RobotContext) -> Option<PhaseOutcome> {
        None
    }

    fn interrupt(&mut self, _ctx: &mut RobotContext) {}

    fn resume(&mut self, _ctx: &mut RobotContext) -> Option<PhaseOutcome> {
        None
    }
}
