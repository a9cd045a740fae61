//! 阶段序列：按顺序运行待开始阶段，前一个完成后开始下一个

use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::oneshot;

use super::{ActivePhase, PendingPhase, PhaseInput, PhaseOutcome, Started};
use crate::negotiation::{NegotiationId, Responder, TableView};
use crate::planning::Plan;
use crate::robot::RobotContext;
use crate::traffic::{Duration, ItineraryVersion};

pub struct TaskSequence {
    description: String,
    pending: VecDeque<Box<dyn PendingPhase>>,
    active: Option<Box<dyn ActivePhase>>,
}

impl TaskSequence {
    pub fn new(description: impl Into<String>, phases: Vec<Box<dyn PendingPhase>>) -> Self {
        Self {
            description: description.into(),
            pending: phases.into(),
            active: None,
        }
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn active_description(&self) -> Option<&str> {
        self.active.as_ref().map(|a| a.description())
    }

    /// 开始第一个阶段；返回 Some 表示序列立即结束
    pub fn begin(&mut self, ctx: &mut RobotContext) -> Option<PhaseOutcome> {
        self.advance(ctx)
    }

    fn advance(&mut self, ctx: &mut RobotContext) -> Option<PhaseOutcome> {
        while let Some(next) = self.pending.pop_front() {
            tracing::debug!(robot = %ctx.name, phase = next.description(), "Beginning phase");
            match next.begin(ctx) {
                Started::Running(active) => {
                    self.active = Some(active);
                    return None;
                }
                Started::Done(PhaseOutcome::Completed) => continue,
                Started::Done(failed) => {
                    self.pending.clear();
                    return Some(failed);
                }
            }
        }
        Some(PhaseOutcome::Completed)
    }

    /// 当前阶段结束后推进序列
    fn settle(&mut self, ctx: &mut RobotContext, outcome: Option<PhaseOutcome>) -> Option<PhaseOutcome> {
        match outcome? {
            PhaseOutcome::Completed => {
                self.active = None;
                self.advance(ctx)
            }
            failed => {
                self.active = None;
                self.pending.clear();
                Some(failed)
            }
        }
    }

    pub fn handle(&mut self, ctx: &mut RobotContext, input: &PhaseInput) -> Option<PhaseOutcome> {
        let outcome = self.active.as_mut()?.handle(ctx, input);
        self.settle(ctx, outcome)
    }

    pub fn cancel(&mut self, ctx: &mut RobotContext) {
        self.pending.clear();
        if let Some(mut active) = self.active.take() {
            active.cancel(ctx);
        }
    }

    pub fn estimate_remaining_time(&self, ctx: &RobotContext) -> Duration {
        let active = self
            .active
            .as_ref()
            .map(|a| a.estimate_remaining_time(ctx))
            .unwrap_or_else(Duration::zero);
        self.pending
            .iter()
            .fold(active, |total, phase| total + phase.estimate_duration())
    }

    pub fn emergency_alarm(&mut self, ctx: &mut RobotContext, on: bool) -> Option<PhaseOutcome> {
        let outcome = self.active.as_mut()?.emergency_alarm(ctx, on);
        self.settle(ctx, outcome)
    }

    pub fn respond(
        &mut self,
        ctx: &mut RobotContext,
        table: TableView,
        responder: Arc<dyn Responder>,
    ) -> bool {
        match self.active.as_mut() {
            Some(active) => active.respond(ctx, table, responder),
            None => false,
        }
    }

    pub fn approve(
        &mut self,
        ctx: &mut RobotContext,
        negotiation: NegotiationId,
        plan: Plan,
        reply: oneshot::Sender<Option<ItineraryVersion>>,
    ) -> Option<PhaseOutcome> {
        let Some(active) = self.active.as_mut() else {
            let _ = reply.send(None);
            return None;
        };
        let outcome = active.approve(ctx, negotiation, plan, reply);
        self.settle(ctx, outcome)
    }

    pub fn replan(&mut self, ctx: &mut RobotContext) -> Option<PhaseOutcome> {
        let outcome = self.active.as_mut()?.replan(ctx);
        self.settle(ctx, outcome)
    }

    pub fn interrupt(&mut self, ctx: &mut RobotContext) {
        if let Some(active) = self.active.as_mut() {
            active.interrupt(ctx);
        }
    }

    pub fn resume(&mut self, ctx: &mut RobotContext) -> Option<PhaseOutcome> {
        let outcome = self.active.as_mut()?.resume(ctx);
        self.settle(ctx, outcome)
    }
}
