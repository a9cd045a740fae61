//! MoveRobot：驱动一条连续的路径命令
//!
//! 跟踪机器人到达的路点，超时未收到进度时请求重新规划（调度时钟停滞时不判定超时），
//! 并根据到达估计修正共享行程的累计延迟。

use std::time::Duration as StdDuration;

use tokio::time::Instant;
use tokio_util::sync::DropGuard;

use super::{ActivePhase, PendingPhase, PhaseInput, PhaseOutcome, PhaseState, Started};
use crate::core::FleetError;
use crate::driver::CommandId;
use crate::graph::NavigationGraph;
use crate::planning::PlanWaypoint;
use crate::robot::RobotContext;
use crate::traffic::{from_std, Duration, PlanId, Time};

/// 路点的可读名称：有名字用 `[name]`，否则用坐标
pub(crate) fn destination(wp: &PlanWaypoint, graph: &NavigationGraph) -> String {
    if let Some(name) = wp
        .graph_index
        .and_then(|i| graph.waypoint(i))
        .and_then(|w| w.name.as_ref())
    {
        return format!("[{name}]");
    }
    format!("({:.3}, {:.3})", wp.position[0], wp.position[1])
}

pub struct PendingMoveRobot {
    description: String,
    waypoints: Vec<PlanWaypoint>,
    plan_id: PlanId,
    tail_period: Option<Duration>,
}

impl PendingMoveRobot {
    pub fn new(
        graph: &NavigationGraph,
        waypoints: Vec<PlanWaypoint>,
        plan_id: PlanId,
        tail_period: Option<Duration>,
    ) -> Self {
        let description = match waypoints.last() {
            Some(last) => format!("Move to {}", destination(last, graph)),
            None => "Move nowhere".to_string(),
        };
        Self {
            description,
            waypoints,
            plan_id,
            tail_period,
        }
    }

    pub(crate) fn start(self, ctx: &mut RobotContext) -> ActiveMoveRobot {
        let command = ctx.driver.follow_path(self.waypoints.clone());
        let update_timeout = StdDuration::from_secs(ctx.settings.motion.update_timeout_secs);
        let timer = ctx.next_request_id();
        let liveness = ctx.start_ticker(
            timer,
            (update_timeout / 4).max(StdDuration::from_millis(10)),
        );

        let now = ctx.now();
        let finish = self.waypoints.last().map(|w| w.time).unwrap_or(now);
        ctx.publish(PhaseState::Active, self.description.clone(), now, finish);

        ActiveMoveRobot {
            description: self.description,
            waypoints: self.waypoints,
            plan_id: self.plan_id,
            tail_period: self.tail_period,
            delay_min_change: Duration::milliseconds(ctx.settings.motion.delay_min_change_ms as i64),
            command,
            timer,
            _liveness: liveness,
            update_timeout,
            last_progress: Instant::now(),
            last_update_time: now,
            stale: false,
            next_path_index: 0,
            last_tail_bump: None,
        }
    }
}

impl PendingPhase for PendingMoveRobot {
    fn description(&self) -> &str {
        &self.description
    }

    fn estimate_duration(&self) -> Duration {
        match (self.waypoints.first(), self.waypoints.last()) {
            (Some(first), Some(last)) => last.time - first.time,
            _ => Duration::zero(),
        }
    }

    fn begin(self: Box<Self>, ctx: &mut RobotContext) -> Started {
        if self.waypoints.is_empty() {
            return Started::Done(PhaseOutcome::Completed);
        }
        Started::Running(Box::new(self.start(ctx)))
    }
}

pub(crate) struct ActiveMoveRobot {
    description: String,
    waypoints: Vec<PlanWaypoint>,
    plan_id: PlanId,
    tail_period: Option<Duration>,
    delay_min_change: Duration,
    command: CommandId,
    timer: u64,
    _liveness: DropGuard,
    update_timeout: StdDuration,
    /// 最近一次进度的墙钟时间
    last_progress: Instant,
    /// 最近一次进度的调度时间
    last_update_time: Time,
    /// 本次失活已请求过重新规划
    stale: bool,
    next_path_index: usize,
    pub(crate) last_tail_bump: Option<Time>,
}

impl ActiveMoveRobot {
    pub(crate) fn command(&self) -> CommandId {
        self.command
    }

    fn check_liveness(&mut self, ctx: &mut RobotContext) {
        if self.stale || self.last_progress.elapsed() < self.update_timeout {
            return;
        }

        let now = ctx.now();
        if now < self.last_update_time + from_std(self.update_timeout) {
            // 调度时钟停滞或变慢（例如仿真暂停），继续等待
            return;
        }

        self.last_update_time = now;
        self.stale = true;
        tracing::warn!(
            "Requesting replan for [{}] because {}",
            ctx.requester_id(),
            FleetError::Unresponsive {
                robot: ctx.name.clone()
            }
        );
        ctx.publish(PhaseState::Active, "Requesting replan", now, now);
        ctx.request_replan();
    }

    fn on_progress(&mut self, ctx: &mut RobotContext, path_index: usize, estimate: StdDuration) {
        self.last_progress = Instant::now();
        self.last_update_time = ctx.now();
        self.stale = false;

        let now = ctx.now();
        let last_index = self.waypoints.len() - 1;

        if path_index == last_index && estimate < StdDuration::from_secs(1) {
            if let Some(tail) = self.tail_period {
                let due = self
                    .last_tail_bump
                    .map(|bump| bump + tail < now)
                    .unwrap_or(true);
                if due {
                    self.last_tail_bump = Some(now);
                    if let Some(delay) = ctx.itinerary.cumulative_delay(self.plan_id) {
                        ctx.itinerary
                            .set_cumulative_delay(self.plan_id, delay + tail, Duration::zero());
                    }
                }
            }
        }

        if path_index != self.next_path_index {
            self.next_path_index = path_index;
            let status = match self.waypoints.get(path_index) {
                Some(wp) => format!("Heading towards {}", destination(wp, &ctx.graph)),
                None => format!(
                    "Current path index was specified as [{}] but that exceeds the limit of [{}]",
                    path_index, last_index
                ),
            };
            let finish = self.waypoints[last_index].time;
            ctx.publish(PhaseState::Active, status, now, finish);
        }

        let Some(target) = self.waypoints.get(path_index) else {
            return;
        };

        if self.plan_id != ctx.itinerary.current_plan_id() {
            // 已被更新的计划取代，不再修改延迟
            return;
        }

        let delay = now + from_std(estimate) - target.time;
        ctx.itinerary
            .set_cumulative_delay(self.plan_id, delay, self.delay_min_change);

        for (route_id, route) in ctx.itinerary.itinerary().iter().enumerate() {
            let points = &route.trajectory.points;
            if let Some(index) = route.trajectory.find(now).filter(|i| *i > 0) {
                let checkpoint = if points[index].time == now {
                    index
                } else {
                    index - 1
                };
                ctx.itinerary.reached(self.plan_id, route_id, checkpoint);
            }
        }
    }

    fn on_finished(&mut self, ctx: &mut RobotContext) {
        if let Some(last) = self.waypoints.last() {
            for checkpoint in &last.arrival_checkpoints {
                ctx.itinerary
                    .reached(self.plan_id, checkpoint.route_id, checkpoint.checkpoint_id);
            }
        }
        let now = ctx.now();
        ctx.publish(PhaseState::Completed, "move robot success", now, now);
    }
}

impl ActivePhase for ActiveMoveRobot {
    fn description(&self) -> &str {
        &self.description
    }

    fn handle(&mut self, ctx: &mut RobotContext, input: &PhaseInput) -> Option<PhaseOutcome> {
        match input {
            PhaseInput::Progress {
                command,
                path_index,
                estimate,
            } if *command == self.command => {
                self.on_progress(ctx, *path_index, *estimate);
                None
            }
            PhaseInput::PathFinished { command } if *command == self.command => {
                self.on_finished(ctx);
                Some(PhaseOutcome::Completed)
            }
            PhaseInput::Tick(timer) if *timer == self.timer => {
                self.check_liveness(ctx);
                None
            }
            _ => None,
        }
    }

    fn cancel(&mut self, ctx: &mut RobotContext) {
        tracing::debug!(robot = %ctx.name, command = self.command, "Move cancelled");
    }

    fn estimate_remaining_time(&self, ctx: &RobotContext) -> Duration {
        let Some(last) = self.waypoints.last() else {
            return Duration::zero();
        };
        let delay = ctx
            .itinerary
            .cumulative_delay(self.plan_id)
            .unwrap_or_else(Duration::zero);
        last.time + delay - ctx.now()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AdapterConfig;
    use crate::graph::tests::line_graph;
    use crate::phases::testing::{harness, Harness};
    use crate::planning::Checkpoint;
    use crate::robot::RobotEvent;
    use crate::traffic::{Route, ScheduleParticipant, Trajectory, TrajectoryPoint};

    fn seconds(s: i64) -> Duration {
        Duration::seconds(s)
    }

    /// A(t0) -> B(t0+5s) -> C(t0+10s)
    fn waypoints(t0: Time) -> Vec<PlanWaypoint> {
        [(0usize, 0.0, 0i64), (1, 5.0, 5), (2, 10.0, 10)]
            .iter()
            .map(|(index, x, t)| PlanWaypoint {
                position: [*x, 0.0, 0.0],
                time: t0 + seconds(*t),
                graph_index: Some(*index),
                approach_lanes: if *index == 0 { vec![] } else { vec![*index * 2 - 2] },
                event: None,
                arrival_checkpoints: vec![Checkpoint {
                    route_id: 0,
                    checkpoint_id: *index,
                }],
            })
            .collect()
    }

    fn commit(h: &Harness, waypoints: &[PlanWaypoint]) -> PlanId {
        let plan_id = h.itinerary.assign_plan_id();
        let trajectory = Trajectory::new(
            waypoints
                .iter()
                .map(|w| TrajectoryPoint {
                    time: w.time,
                    position: w.position,
                })
                .collect(),
        );
        h.itinerary.set(plan_id, vec![Route::new("L1", trajectory)]);
        plan_id
    }

    fn progress(command: CommandId, path_index: usize, secs: f64) -> PhaseInput {
        PhaseInput::Progress {
            command,
            path_index,
            estimate: StdDuration::from_secs_f64(secs),
        }
    }

    /// 把队列中的计时器事件交给阶段处理，返回重新规划请求的数量
    fn pump(h: &mut Harness, phase: &mut ActiveMoveRobot) -> usize {
        let mut replans = 0;
        while let Ok(event) = h.rx.try_recv() {
            match event {
                RobotEvent::Phase(input) => {
                    phase.handle(&mut h.ctx, &input);
                }
                RobotEvent::Replan => replans += 1,
                _ => {}
            }
        }
        replans
    }

    #[tokio::test]
    async fn test_move_delay_applied_for_current_plan() {
        let mut h = harness(line_graph(), AdapterConfig::default());
        let t0 = h.ctx.now();
        let wps = waypoints(t0);
        let plan_id = commit(&h, &wps);
        let mut phase = PendingMoveRobot::new(&h.ctx.graph, wps, plan_id, None).start(&mut h.ctx);
        assert_eq!(h.driver.paths().len(), 1);

        phase.handle(&mut h.ctx, &progress(phase.command(), 1, 8.0));
        assert_eq!(h.itinerary.cumulative_delay(plan_id), Some(seconds(3)));
    }

    #[tokio::test]
    async fn test_move_delay_ignored_for_superseded_plan() {
        let mut h = harness(line_graph(), AdapterConfig::default());
        let t0 = h.ctx.now();
        let wps = waypoints(t0);
        let plan_id = commit(&h, &wps);
        let mut phase =
            PendingMoveRobot::new(&h.ctx.graph, wps.clone(), plan_id, None).start(&mut h.ctx);
        let newer = commit(&h, &wps);
        let version = h.itinerary.version();

        phase.handle(&mut h.ctx, &progress(phase.command(), 1, 8.0));
        assert_eq!(h.itinerary.version(), version);
        assert_eq!(h.itinerary.cumulative_delay(newer), Some(Duration::zero()));

        // 进度状态仍然发布
        let mut statuses = Vec::new();
        while let Ok(status) = h.status.try_recv() {
            statuses.push(status.status);
        }
        assert!(statuses.contains(&"Heading towards [B]".to_string()));
    }

    #[tokio::test]
    async fn test_move_ignores_progress_for_other_command() {
        let mut h = harness(line_graph(), AdapterConfig::default());
        let t0 = h.ctx.now();
        let wps = waypoints(t0);
        let plan_id = commit(&h, &wps);
        let mut phase = PendingMoveRobot::new(&h.ctx.graph, wps, plan_id, None).start(&mut h.ctx);

        phase.handle(&mut h.ctx, &progress(phase.command() + 7, 1, 8.0));
        assert_eq!(h.itinerary.cumulative_delay(plan_id), Some(Duration::zero()));
        assert!(phase
            .handle(&mut h.ctx, &PhaseInput::PathFinished { command: phase.command() + 7 })
            .is_none());
    }

    #[tokio::test]
    async fn test_move_marks_checkpoints_on_finish() {
        let mut h = harness(line_graph(), AdapterConfig::default());
        let t0 = h.ctx.now();
        let wps = waypoints(t0);
        let plan_id = commit(&h, &wps);
        let mut phase = PendingMoveRobot::new(&h.ctx.graph, wps, plan_id, None).start(&mut h.ctx);

        let outcome = phase.handle(&mut h.ctx, &PhaseInput::PathFinished { command: phase.command() });
        assert_eq!(outcome, Some(PhaseOutcome::Completed));
        assert_eq!(h.itinerary.reached_checkpoints().get(&0), Some(&2));
    }

    #[tokio::test]
    async fn test_move_reaches_passed_trajectory_points() {
        let mut h = harness(line_graph(), AdapterConfig::default());
        let t0 = h.ctx.now();
        let wps = waypoints(t0);
        let plan_id = commit(&h, &wps);
        let mut phase = PendingMoveRobot::new(&h.ctx.graph, wps, plan_id, None).start(&mut h.ctx);

        h.clock.advance(seconds(6));
        phase.handle(&mut h.ctx, &progress(phase.command(), 2, 4.0));
        assert_eq!(h.itinerary.reached_checkpoints().get(&0), Some(&1));
    }

    #[tokio::test]
    async fn test_tail_bump_at_most_once_per_period() {
        let mut h = harness(line_graph(), AdapterConfig::default());
        let t0 = h.ctx.now();
        let wps = waypoints(t0);
        let plan_id = commit(&h, &wps);
        let mut phase = PendingMoveRobot::new(&h.ctx.graph, wps, plan_id, Some(seconds(2)))
            .start(&mut h.ctx);

        phase.handle(&mut h.ctx, &progress(phase.command(), 2, 0.5));
        assert_eq!(phase.last_tail_bump, Some(t0));

        h.clock.advance(seconds(1));
        phase.handle(&mut h.ctx, &progress(phase.command(), 2, 0.5));
        assert_eq!(phase.last_tail_bump, Some(t0));

        h.clock.advance(Duration::milliseconds(1500));
        phase.handle(&mut h.ctx, &progress(phase.command(), 2, 0.5));
        assert_eq!(phase.last_tail_bump, Some(t0 + Duration::milliseconds(2500)));

        // 估计用时超过 1 秒时不保活
        h.clock.advance(seconds(5));
        phase.handle(&mut h.ctx, &progress(phase.command(), 2, 3.0));
        assert_eq!(phase.last_tail_bump, Some(t0 + Duration::milliseconds(2500)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unresponsive_driver_requests_one_replan() {
        let mut h = harness(line_graph(), AdapterConfig::default());
        let t0 = h.ctx.now();
        let wps = waypoints(t0);
        let plan_id = commit(&h, &wps);
        let mut phase = PendingMoveRobot::new(&h.ctx.graph, wps, plan_id, None).start(&mut h.ctx);

        tokio::time::sleep(StdDuration::from_secs(11)).await;
        h.clock.advance(seconds(11));
        assert_eq!(pump(&mut h, &mut phase), 1);

        tokio::time::sleep(StdDuration::from_secs(11)).await;
        h.clock.advance(seconds(11));
        assert_eq!(pump(&mut h, &mut phase), 0);

        // 收到进度后重新计时
        phase.handle(&mut h.ctx, &progress(phase.command(), 1, 3.0));
        tokio::time::sleep(StdDuration::from_secs(11)).await;
        h.clock.advance(seconds(11));
        assert_eq!(pump(&mut h, &mut phase), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_frozen_clock_suppresses_replan() {
        let mut h = harness(line_graph(), AdapterConfig::default());
        let t0 = h.ctx.now();
        let wps = waypoints(t0);
        let plan_id = commit(&h, &wps);
        let mut phase = PendingMoveRobot::new(&h.ctx.graph, wps, plan_id, None).start(&mut h.ctx);

        tokio::time::sleep(StdDuration::from_secs(30)).await;
        assert_eq!(pump(&mut h, &mut phase), 0);
    }
}
