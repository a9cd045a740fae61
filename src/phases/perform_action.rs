//! PerformAction：把机器人交给外部动作（如遥操作），直到收到完成通知

use super::{ActivePhase, PendingPhase, PhaseInput, PhaseOutcome, PhaseState, Started};
use crate::robot::RobotContext;
use crate::traffic::Duration;

pub struct PendingPerformAction {
    category: String,
    description: String,
}

impl PendingPerformAction {
    pub fn new(category: impl Into<String>) -> Self {
        let category = category.into();
        Self {
            description: format!("Performing action [{category}]"),
            category,
        }
    }
}

impl PendingPhase for PendingPerformAction {
    fn description(&self) -> &str {
        &self.description
    }

    fn estimate_duration(&self) -> Duration {
        Duration::zero()
    }

    fn begin(self: Box<Self>, ctx: &mut RobotContext) -> Started {
        ctx.driver.set_action_execution(self.category.clone());
        let now = ctx.now();
        ctx.publish(PhaseState::Active, self.description.clone(), now, now);
        Started::Running(Box::new(ActivePerformAction {
            description: self.description,
        }))
    }
}

struct ActivePerformAction {
    description: String,
}

impl ActivePhase for ActivePerformAction {
    fn description(&self) -> &str {
        &self.description
    }

    fn handle(&mut self, ctx: &mut RobotContext, input: &PhaseInput) -> Option<PhaseOutcome> {
        if !matches!(input, PhaseInput::ActionFinished) {
            return None;
        }
        let now = ctx.now();
        ctx.publish(PhaseState::Completed, "Action finished", now, now);
        Some(PhaseOutcome::Completed)
    }

    fn cancel(&mut self, _ctx: &mut RobotContext) {}

    fn estimate_remaining_time(&self, _ctx: &RobotContext) -> Duration {
        Duration::zero()
    }
}
