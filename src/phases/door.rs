//! 门：DoorOpen 等待门打开，DoorClose 释放门

use std::time::Duration as StdDuration;

use tokio_util::sync::DropGuard;

use super::{ActivePhase, PendingPhase, PhaseInput, PhaseOutcome, PhaseState, Started};
use crate::driver::{DoorMode, DoorRequest};
use crate::robot::RobotContext;
use crate::traffic::Duration;

fn door_request(ctx: &RobotContext, door: &str, mode: DoorMode) {
    ctx.devices.request_door(DoorRequest {
        door_name: door.to_string(),
        requester_id: ctx.requester_id(),
        requested_mode: mode,
    });
}

pub struct PendingDoorOpen {
    door: String,
    description: String,
}

impl PendingDoorOpen {
    pub fn new(door: impl Into<String>) -> Self {
        let door = door.into();
        Self {
            description: format!("Opening [door:{door}]"),
            door,
        }
    }
}

impl PendingPhase for PendingDoorOpen {
    fn description(&self) -> &str {
        &self.description
    }

    fn estimate_duration(&self) -> Duration {
        Duration::seconds(4)
    }

    fn begin(self: Box<Self>, ctx: &mut RobotContext) -> Started {
        door_request(ctx, &self.door, DoorMode::Open);
        let timer = ctx.next_request_id();
        let retry = ctx.start_ticker(
            timer,
            StdDuration::from_millis(ctx.settings.devices.request_retry_ms.max(1)),
        );
        let now = ctx.now();
        ctx.publish(PhaseState::Active, self.description.clone(), now, now);
        Started::Running(Box::new(ActiveDoorOpen {
            door: self.door,
            description: self.description,
            timer,
            _retry: retry,
        }))
    }
}

struct ActiveDoorOpen {
    door: String,
    description: String,
    timer: u64,
    _retry: DropGuard,
}

impl ActivePhase for ActiveDoorOpen {
    fn description(&self) -> &str {
        &self.description
    }

    fn handle(&mut self, ctx: &mut RobotContext, input: &PhaseInput) -> Option<PhaseOutcome> {
        match input {
            PhaseInput::Door(state)
                if state.door_name == self.door && state.current_mode == DoorMode::Open =>
            {
                let now = ctx.now();
                ctx.publish(
                    PhaseState::Completed,
                    format!("[door:{}] is open", self.door),
                    now,
                    now,
                );
                Some(PhaseOutcome::Completed)
            }
            PhaseInput::Tick(timer) if *timer == self.timer => {
                door_request(ctx, &self.door, DoorMode::Open);
                None
            }
            _ => None,
        }
    }

    fn cancel(&mut self, ctx: &mut RobotContext) {
        // 释放门
        door_request(ctx, &self.door, DoorMode::Closed);
    }

    fn estimate_remaining_time(&self, _ctx: &RobotContext) -> Duration {
        Duration::seconds(4)
    }
}

pub struct PendingDoorClose {
    door: String,
    description: String,
}

impl PendingDoorClose {
    pub fn new(door: impl Into<String>) -> Self {
        let door = door.into();
        Self {
            description: format!("Closing [door:{door}]"),
            door,
        }
    }
}

impl PendingPhase for PendingDoorClose {
    fn description(&self) -> &str {
        &self.description
    }

    fn estimate_duration(&self) -> Duration {
        Duration::zero()
    }

    fn begin(self: Box<Self>, ctx: &mut RobotContext) -> Started {
        door_request(ctx, &self.door, DoorMode::Closed);
        let now = ctx.now();
        ctx.publish(PhaseState::Completed, self.description, now, now);
        Started::Done(PhaseOutcome::Completed)
    }
}
