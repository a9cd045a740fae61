//! GoToPlace：把机器人送到目标路点
//!
//! 开始时立即请求计划；计划就绪后按路点事件拆成子阶段序列（移动、停靠、门、电梯）
//! 并提交到共享调度。紧急警报期间改为紧急靠边计划，警报解除后重新规划，
//! 只有非紧急计划的子阶段全部完成才算本阶段完成。
//!
//! 协商应答被分配一个 `NegotiationId`；只有当前应答的批准会被执行，
//! 暂停、取消或完成后的批准一律回复 None。

use std::sync::Arc;

use tokio::sync::oneshot;
use tokio_util::sync::DropGuard;

use super::{
    ActivePhase, PendingDockRobot, PendingDoorClose, PendingDoorOpen, PendingMoveRobot,
    PendingPhase, PendingRequestLift, PhaseInput, PhaseOutcome, PhaseState, Started,
    TaskSequence,
};
use crate::core::FleetError;
use crate::graph::Event;
use crate::negotiation::{NegotiationId, NegotiationJob, ProgressEvaluator, Responder, TableView};
use crate::planning::{Goal, Plan, PlanStart, PlanWaypoint};
use crate::robot::RobotContext;
use crate::traffic::{from_seconds, Duration, ItineraryVersion, PlanId};

/// 计划拆分出的子阶段
#[derive(Debug, Clone, PartialEq)]
pub enum SubPhase {
    Move(Vec<PlanWaypoint>),
    Dock(String),
    DoorOpen(String),
    DoorClose(String),
    RequestLift { lift: String, floor: String },
}

impl SubPhase {
    /// 路点事件对应的设备子阶段；尚不支持的事件返回 None
    fn for_event(event: &Event) -> Option<Self> {
        match event {
            Event::Dock { dock_name } => Some(Self::Dock(dock_name.clone())),
            Event::DoorOpen { name } => Some(Self::DoorOpen(name.clone())),
            Event::DoorClose { name } => Some(Self::DoorClose(name.clone())),
            Event::LiftDoorOpen {
                lift_name,
                floor_name,
            } => Some(Self::RequestLift {
                lift: lift_name.clone(),
                floor: floor_name.clone(),
            }),
            Event::LiftDoorClose { .. }
            | Event::LiftMove { .. }
            | Event::LiftSessionBegin { .. }
            | Event::LiftSessionEnd { .. } => None,
        }
    }

    fn into_pending(
        self,
        ctx: &RobotContext,
        plan_id: PlanId,
        tail_period: Option<Duration>,
    ) -> Box<dyn PendingPhase> {
        match self {
            Self::Move(waypoints) => Box::new(PendingMoveRobot::new(
                &ctx.graph,
                waypoints,
                plan_id,
                tail_period,
            )),
            Self::Dock(dock_name) => Box::new(PendingDockRobot::new(dock_name)),
            Self::DoorOpen(door) => Box::new(PendingDoorOpen::new(door)),
            Self::DoorClose(door) => Box::new(PendingDoorClose::new(door)),
            Self::RequestLift { lift, floor } => Box::new(PendingRequestLift::new(lift, floor)),
        }
    }
}

/// 按路点事件切分计划
///
/// 带事件的路点结束当前移动段（该路点属于这一段），随后接事件对应的设备子阶段，
/// 下一段从其后的路点开始。
pub fn plan_sub_phases(waypoints: &[PlanWaypoint]) -> Vec<SubPhase> {
    let mut phases = Vec::new();
    let mut run = Vec::new();
    for wp in waypoints {
        run.push(wp.clone());
        if let Some(event) = &wp.event {
            phases.push(SubPhase::Move(std::mem::take(&mut run)));
            phases.extend(SubPhase::for_event(event));
        }
    }
    if !run.is_empty() {
        phases.push(SubPhase::Move(run));
    }
    phases
}

pub struct PendingGoToPlace {
    description: String,
    goal: Goal,
    estimate: f64,
}

impl PendingGoToPlace {
    /// 从机器人当前位置估计代价；无法到达的目标在此直接拒绝
    pub fn make(ctx: &RobotContext, goal: Goal) -> Result<Self, FleetError> {
        Self::make_from(ctx, &ctx.location, goal)
    }

    /// 从给定起点估计代价，用于任务中前一阶段结束的位置
    pub fn make_from(ctx: &RobotContext, starts: &[PlanStart], goal: Goal) -> Result<Self, FleetError> {
        let Some(estimate) = ctx.planner.estimate_cost(starts, &goal) else {
            let err = FleetError::NoPath {
                robot: ctx.name.clone(),
                from: starts
                    .first()
                    .map(|start| ctx.graph.waypoint_name(start.waypoint))
                    .unwrap_or_else(|| "unknown".to_string()),
                to: ctx.graph.waypoint_name(goal.waypoint),
            };
            tracing::error!("{}", err);
            return Err(err);
        };

        Ok(Self {
            description: format!("Sending robot to [{}]", ctx.graph.waypoint_name(goal.waypoint)),
            goal,
            estimate,
        })
    }
}

impl PendingPhase for PendingGoToPlace {
    fn description(&self) -> &str {
        &self.description
    }

    fn estimate_duration(&self) -> Duration {
        from_seconds(self.estimate)
    }

    fn begin(self: Box<Self>, ctx: &mut RobotContext) -> Started {
        let now = ctx.now();
        ctx.publish(
            PhaseState::Active,
            format!("Planning a move to [{}]", ctx.graph.waypoint_name(self.goal.waypoint)),
            now,
            now + from_seconds(self.estimate),
        );

        let mut active = ActiveGoToPlace {
            description: self.description,
            goal: self.goal,
            latest_estimate: self.estimate,
            plan: None,
            subtasks: None,
            emergency_active: ctx.emergency,
            plan_request: None,
            pending_emergency: false,
            executing_emergency: false,
            plan_job: None,
            negotiation: None,
            negotiation_job: None,
            paused: ctx.is_interrupted(),
        };
        if !active.paused {
            active.find_plan(ctx);
        }
        Started::Running(Box::new(active))
    }
}

/// 等待批准的协商应答
#[derive(Debug, Clone, Copy)]
struct Proposal {
    id: NegotiationId,
    emergency: bool,
}

struct ActiveGoToPlace {
    description: String,
    goal: Goal,
    latest_estimate: f64,
    plan: Option<Plan>,
    subtasks: Option<TaskSequence>,
    emergency_active: bool,
    /// 最新的计划请求；其它请求的结果被丢弃
    plan_request: Option<u64>,
    /// 最新的计划请求是否为紧急靠边
    pending_emergency: bool,
    /// 正在执行的子阶段来自紧急靠边计划
    executing_emergency: bool,
    plan_job: Option<DropGuard>,
    negotiation: Option<Proposal>,
    negotiation_job: Option<DropGuard>,
    /// 被中断，等待恢复
    paused: bool,
}

impl ActiveGoToPlace {
    fn find_plan(&mut self, ctx: &mut RobotContext) {
        if self.emergency_active {
            return self.find_emergency_plan(ctx);
        }

        let request = ctx.next_request_id();
        let planner = ctx.planner.clone();
        let starts = ctx.location.clone();
        let goal = self.goal.clone();
        let constraints = ctx.plan_constraints();
        self.plan_request = Some(request);
        self.pending_emergency = false;
        self.plan_job = Some(ctx.spawn_plan(request, async move {
            planner.plan(&starts, &goal, &constraints).await
        }));
    }

    fn find_emergency_plan(&mut self, ctx: &mut RobotContext) {
        let now = ctx.now();
        ctx.publish(PhaseState::Active, "Planning an emergency pullover", now, now);

        let request = ctx.next_request_id();
        let planner = ctx.planner.clone();
        let starts = ctx.location.clone();
        let constraints = ctx.plan_constraints();
        self.plan_request = Some(request);
        self.pending_emergency = true;
        self.plan_job = Some(ctx.spawn_plan(request, async move {
            planner.emergency_pullover(&starts, &constraints).await
        }));
    }

    fn cancel_subtasks(&mut self, ctx: &mut RobotContext) {
        if let Some(mut subtasks) = self.subtasks.take() {
            subtasks.cancel(ctx);
        }
    }

    /// 丢弃进行中的协商应答，之后到达的批准回复 None
    fn drop_negotiation(&mut self) {
        self.negotiation = None;
        self.negotiation_job = None;
    }

    /// 提交计划并开始其子阶段
    fn execute_plan(&mut self, ctx: &mut RobotContext, plan: Plan, emergency: bool) -> Option<PhaseOutcome> {
        self.cancel_subtasks(ctx);
        self.plan_request = None;
        self.plan_job = None;
        self.executing_emergency = emergency;

        let plan_id = ctx.itinerary.assign_plan_id();
        ctx.itinerary.set(plan_id, plan.itinerary.clone());

        let tail_period = ctx
            .settings
            .motion
            .tail_period_ms
            .map(|ms| Duration::milliseconds(ms as i64));
        let sub_phases = plan_sub_phases(&plan.waypoints);
        let last_move = sub_phases
            .iter()
            .rposition(|phase| matches!(phase, SubPhase::Move(_)));
        let pending = sub_phases
            .into_iter()
            .enumerate()
            .map(|(i, phase)| {
                let tail = if Some(i) == last_move { tail_period } else { None };
                phase.into_pending(ctx, plan_id, tail)
            })
            .collect();

        tracing::debug!(
            robot = %ctx.name,
            plan_id,
            cost = plan.cost,
            emergency,
            "Executing plan for [{}]",
            self.description
        );
        self.plan = Some(plan);
        let mut subtasks = TaskSequence::new(self.description.clone(), pending);
        let outcome = subtasks.begin(ctx);
        self.subtasks = Some(subtasks);
        self.settle(ctx, outcome)
    }

    fn settle(&mut self, ctx: &mut RobotContext, outcome: Option<PhaseOutcome>) -> Option<PhaseOutcome> {
        match outcome? {
            PhaseOutcome::Completed => {
                self.subtasks = None;
                if self.executing_emergency {
                    // 靠边完成不算到达；警报解除后的新计划完成才算
                    return None;
                }
                self.drop_negotiation();
                let now = ctx.now();
                ctx.publish(PhaseState::Completed, "Arrived at destination", now, now);
                Some(PhaseOutcome::Completed)
            }
            failed => {
                self.subtasks = None;
                self.drop_negotiation();
                Some(failed)
            }
        }
    }
}

impl ActivePhase for ActiveGoToPlace {
    fn description(&self) -> &str {
        &self.description
    }

    fn handle(&mut self, ctx: &mut RobotContext, input: &PhaseInput) -> Option<PhaseOutcome> {
        match input {
            PhaseInput::PlanReady { request, plan } => {
                if self.plan_request != Some(*request) {
                    return None;
                }
                self.plan_request = None;
                self.plan_job = None;
                match plan {
                    Some(plan) => self.execute_plan(ctx, plan.clone(), self.pending_emergency),
                    None => {
                        let err = FleetError::PlanningFailed {
                            robot: ctx.name.clone(),
                            goal: ctx.graph.waypoint_name(self.goal.waypoint),
                        };
                        tracing::error!("{}", err);
                        let now = ctx.now();
                        ctx.publish(PhaseState::Failed, "Cannot find a plan", now, now);
                        self.cancel_subtasks(ctx);
                        self.drop_negotiation();
                        Some(PhaseOutcome::Failed(err))
                    }
                }
            }
            other => {
                let outcome = self.subtasks.as_mut()?.handle(ctx, other);
                self.settle(ctx, outcome)
            }
        }
    }

    fn cancel(&mut self, ctx: &mut RobotContext) {
        self.cancel_subtasks(ctx);
        self.plan_request = None;
        self.plan_job = None;
        self.drop_negotiation();
    }

    fn estimate_remaining_time(&self, ctx: &RobotContext) -> Duration {
        match &self.plan {
            Some(plan) => plan
                .finish_time()
                .map(|finish| finish - ctx.now())
                .unwrap_or_else(Duration::zero),
            None => from_seconds(self.latest_estimate),
        }
    }

    fn emergency_alarm(&mut self, ctx: &mut RobotContext, on: bool) -> Option<PhaseOutcome> {
        if self.emergency_active == on {
            return None;
        }
        self.emergency_active = on;
        // 为另一种模式算出的方案不再有效
        self.drop_negotiation();
        if self.paused {
            return None;
        }

        if on {
            self.cancel_subtasks(ctx);
        }
        self.find_plan(ctx);
        None
    }

    fn respond(
        &mut self,
        ctx: &mut RobotContext,
        table: TableView,
        responder: Arc<dyn Responder>,
    ) -> bool {
        if self.paused {
            return false;
        }

        let evaluator = ProgressEvaluator::for_table(&ctx.settings.negotiation, &table);
        let (goal, estimate) = if self.emergency_active {
            (None, None)
        } else {
            (Some(self.goal.clone()), Some(self.latest_estimate))
        };
        let id = ctx.next_request_id();
        self.negotiation = Some(Proposal {
            id,
            emergency: self.emergency_active,
        });
        let job = NegotiationJob {
            id,
            planner: ctx.planner.clone(),
            starts: ctx.location.clone(),
            goal,
            constraints: ctx.plan_constraints(),
            table,
            evaluator,
            estimate,
        };
        self.negotiation_job = Some(ctx.spawn_job(job.run(responder, ctx.events_sender())));
        true
    }

    fn approve(
        &mut self,
        ctx: &mut RobotContext,
        negotiation: NegotiationId,
        plan: Plan,
        reply: oneshot::Sender<Option<ItineraryVersion>>,
    ) -> Option<PhaseOutcome> {
        let proposal = match self.negotiation {
            Some(proposal) if proposal.id == negotiation && !self.paused => proposal,
            _ => {
                tracing::debug!(
                    robot = %ctx.name,
                    negotiation,
                    paused = self.paused,
                    "Ignoring approval for [{}]",
                    self.description
                );
                let _ = reply.send(None);
                return None;
            }
        };
        self.drop_negotiation();
        let outcome = self.execute_plan(ctx, plan, proposal.emergency);
        let _ = reply.send(Some(ctx.itinerary.version()));
        outcome
    }

    fn replan(&mut self, ctx: &mut RobotContext) -> Option<PhaseOutcome> {
        if self.paused {
            return None;
        }
        self.find_plan(ctx);
        None
    }

    fn interrupt(&mut self, ctx: &mut RobotContext) {
        if self.paused {
            return;
        }
        self.paused = true;
        self.cancel_subtasks(ctx);
        self.plan_request = None;
        self.plan_job = None;
        self.drop_negotiation();
        let now = ctx.now();
        ctx.publish(PhaseState::Active, "Interrupted", now, now);
    }

    fn resume(&mut self, ctx: &mut RobotContext) -> Option<PhaseOutcome> {
        if !self.paused {
            return None;
        }
        self.paused = false;
        self.find_plan(ctx);
        None
    }
}
