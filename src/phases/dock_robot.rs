//! DockRobot：请求停靠并等待驱动报告停靠结束

use super::{ActivePhase, PendingPhase, PhaseInput, PhaseOutcome, PhaseState, Started};
use crate::driver::CommandId;
use crate::robot::RobotContext;
use crate::traffic::Duration;

pub struct PendingDockRobot {
    dock_name: String,
    description: String,
}

impl PendingDockRobot {
    pub fn new(dock_name: impl Into<String>) -> Self {
        let dock_name = dock_name.into();
        Self {
            description: format!("Docking robot into [{dock_name}]"),
            dock_name,
        }
    }
}

impl PendingPhase for PendingDockRobot {
    fn description(&self) -> &str {
        &self.description
    }

    fn estimate_duration(&self) -> Duration {
        Duration::zero()
    }

    fn begin(self: Box<Self>, ctx: &mut RobotContext) -> Started {
        let now = ctx.now();
        match ctx.driver.dock(&self.dock_name) {
            Ok(command) => {
                ctx.publish(PhaseState::Active, self.description.clone(), now, now);
                Started::Running(Box::new(ActiveDockRobot {
                    dock_name: self.dock_name,
                    description: self.description,
                    command,
                }))
            }
            Err(err) => {
                ctx.publish(PhaseState::Failed, err.to_string(), now, now);
                Started::Done(PhaseOutcome::Failed(err))
            }
        }
    }
}

struct ActiveDockRobot {
    dock_name: String,
    description: String,
    command: CommandId,
}

impl ActivePhase for ActiveDockRobot {
    fn description(&self) -> &str {
        &self.description
    }

    fn handle(&mut self, ctx: &mut RobotContext, input: &PhaseInput) -> Option<PhaseOutcome> {
        match input {
            PhaseInput::DockFinished { command } if *command == self.command => {
                let now = ctx.now();
                ctx.publish(
                    PhaseState::Completed,
                    format!("Finished docking into [{}]", self.dock_name),
                    now,
                    now,
                );
                Some(PhaseOutcome::Completed)
            }
            _ => None,
        }
    }

    fn cancel(&mut self, ctx: &mut RobotContext) {
        tracing::debug!(robot = %ctx.name, dock = %self.dock_name, "Docking cancelled");
    }

    fn estimate_remaining_time(&self, _ctx: &RobotContext) -> Duration {
        Duration::zero()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AdapterConfig;
    use crate::core::FleetError;
    use crate::graph::tests::line_graph;
    use crate::graph::Event;
    use crate::phases::testing::harness;

    #[tokio::test]
    async fn test_dock_completes_on_matching_command() {
        let mut graph = line_graph();
        graph.lanes[2].entry.event = Some(Event::Dock {
            dock_name: "dock_b".to_string(),
        });
        let mut h = harness(graph, AdapterConfig::default());

        let Started::Running(mut phase) = Box::new(PendingDockRobot::new("dock_b")).begin(&mut h.ctx)
        else {
            panic!("dock should start");
        };
        let command: CommandId = h.driver.modes()[0].task_id.parse().unwrap();

        assert!(phase
            .handle(&mut h.ctx, &PhaseInput::DockFinished { command: command + 1 })
            .is_none());
        assert_eq!(
            phase.handle(&mut h.ctx, &PhaseInput::DockFinished { command }),
            Some(PhaseOutcome::Completed)
        );
    }

    #[tokio::test]
    async fn test_unknown_dock_fails_phase() {
        let mut h = harness(line_graph(), AdapterConfig::default());
        match Box::new(PendingDockRobot::new("nowhere")).begin(&mut h.ctx) {
            Started::Done(PhaseOutcome::Failed(FleetError::UnknownDock(name))) => {
                assert_eq!(name, "nowhere")
            }
            _ => panic!("unknown dock should fail"),
        }
        assert!(h.driver.modes().is_empty());
    }
}
