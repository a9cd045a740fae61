//! RequestLift：请求电梯到达目标楼层并开门

use std::time::Duration as StdDuration;

use tokio_util::sync::DropGuard;

use super::{ActivePhase, PendingPhase, PhaseInput, PhaseOutcome, PhaseState, Started};
use crate::driver::{DoorMode, LiftRequest, LiftRequestType};
use crate::robot::RobotContext;
use crate::traffic::Duration;

pub struct PendingRequestLift {
    lift: String,
    floor: String,
    description: String,
}

impl PendingRequestLift {
    pub fn new(lift: impl Into<String>, floor: impl Into<String>) -> Self {
        let lift = lift.into();
        let floor = floor.into();
        Self {
            description: format!("Requesting lift [{lift}] to [{floor}]"),
            lift,
            floor,
        }
    }
}

impl PendingPhase for PendingRequestLift {
    fn description(&self) -> &str {
        &self.description
    }

    fn estimate_duration(&self) -> Duration {
        Duration::seconds(10)
    }

    fn begin(self: Box<Self>, ctx: &mut RobotContext) -> Started {
        let timer = ctx.next_request_id();
        let retry = ctx.start_ticker(
            timer,
            StdDuration::from_millis(ctx.settings.devices.request_retry_ms.max(1)),
        );
        let active = ActiveRequestLift {
            session: ctx.requester_id(),
            lift: self.lift,
            floor: self.floor,
            description: self.description,
            timer,
            _retry: retry,
        };
        active.request(ctx, LiftRequestType::AgvMode);

        let now = ctx.now();
        ctx.publish(PhaseState::Active, active.description.clone(), now, now);
        Started::Running(Box::new(active))
    }
}

struct ActiveRequestLift {
    session: String,
    lift: String,
    floor: String,
    description: String,
    timer: u64,
    _retry: DropGuard,
}

impl ActiveRequestLift {
    fn request(&self, ctx: &RobotContext, request_type: LiftRequestType) {
        ctx.devices.request_lift(LiftRequest {
            lift_name: self.lift.clone(),
            session_id: self.session.clone(),
            request_type,
            destination_floor: self.floor.clone(),
            door_state: DoorMode::Open,
        });
    }
}

impl ActivePhase for ActiveRequestLift {
    fn description(&self) -> &str {
        &self.description
    }

    fn handle(&mut self, ctx: &mut RobotContext, input: &PhaseInput) -> Option<PhaseOutcome> {
        match input {
            PhaseInput::Lift(state)
                if state.lift_name == self.lift
                    && state.current_floor == self.floor
                    && state.door_state == DoorMode::Open
                    && state.session_id == self.session =>
            {
                let now = ctx.now();
                ctx.publish(
                    PhaseState::Completed,
                    format!("Lift [{}] arrived at [{}]", self.lift, self.floor),
                    now,
                    now,
                );
                Some(PhaseOutcome::Completed)
            }
            PhaseInput::Tick(timer) if *timer == self.timer => {
                self.request(ctx, LiftRequestType::AgvMode);
                None
            }
            _ => None,
        }
    }

    fn cancel(&mut self, ctx: &mut RobotContext) {
        self.request(ctx, LiftRequestType::EndSession);
    }

    fn estimate_remaining_time(&self, _ctx: &RobotContext) -> Duration {
        Duration::seconds(10)
    }
}
