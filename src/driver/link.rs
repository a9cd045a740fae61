//! DriverLink：单个机器人的命令/遥测关系
//!
//! - 路径与停靠命令带单调递增的关联 ID，驱动未确认时按宽限期重发
//! - 每次遥测整体替换上一次，按当前意图（跟随路径 / 停靠 / 空闲）对账
//! - 车道关闭、驱动故障转换为重新规划请求

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use super::messages::{
    DriverChannel, InterruptKind, InterruptRequest, Location, ModeParameter, ModeRequest,
    PathRequest, RobotMode, RobotTelemetry,
};
use super::{CommandId, DriverEvent, Position};
use crate::config::DriverSection;
use crate::core::FleetError;
use crate::fleet::SpeedLimits;
use crate::graph::NavigationGraph;
use crate::planning::PlanWaypoint;
use crate::traffic::{interpolate, Route, ScheduleParticipant, VehicleTraits};

/// 机器人当前的命令意图
enum Intent {
    Idle,
    Following {
        command: CommandId,
        request: PathRequest,
        waypoints: Vec<PlanWaypoint>,
        requested_at: Instant,
    },
    Docking {
        command: CommandId,
        request: ModeRequest,
        waypoint: usize,
        requested_at: Instant,
        scheduled_at: Option<Instant>,
    },
}

pub struct DriverLink {
    fleet_name: String,
    robot_name: String,
    graph: Arc<NavigationGraph>,
    traits: VehicleTraits,
    settings: DriverSection,
    channel: Arc<dyn DriverChannel>,
    itinerary: Arc<dyn ScheduleParticipant>,
    speed_limits: SpeedLimits,
    current_command: CommandId,
    intent: Intent,
    last_known: Option<RobotTelemetry>,
    target_plan_index: Option<usize>,
    /// 驱动故障只触发一次重新规划，直到下一条路径命令
    fault_latched: bool,
    interruptions: HashMap<String, Vec<String>>,
    action: Option<String>,
    events: Vec<DriverEvent>,
}

impl DriverLink {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        fleet_name: impl Into<String>,
        robot_name: impl Into<String>,
        graph: Arc<NavigationGraph>,
        traits: VehicleTraits,
        settings: DriverSection,
        channel: Arc<dyn DriverChannel>,
        itinerary: Arc<dyn ScheduleParticipant>,
        speed_limits: SpeedLimits,
    ) -> Self {
        Self {
            fleet_name: fleet_name.into(),
            robot_name: robot_name.into(),
            graph,
            traits,
            settings,
            channel,
            itinerary,
            speed_limits,
            current_command: 0,
            intent: Intent::Idle,
            last_known: None,
            target_plan_index: None,
            fault_latched: false,
            interruptions: HashMap::new(),
            action: None,
            events: Vec::new(),
        }
    }

    pub fn robot_name(&self) -> &str {
        &self.robot_name
    }

    pub fn last_known(&self) -> Option<&RobotTelemetry> {
        self.last_known.as_ref()
    }

    pub fn target_plan_index(&self) -> Option<usize> {
        self.target_plan_index
    }

    /// 取走对账产生的事件
    pub fn take_events(&mut self) -> Vec<DriverEvent> {
        std::mem::take(&mut self.events)
    }

    fn resend_after(&self) -> Duration {
        Duration::from_millis(self.settings.command_resend_ms)
    }

    fn next_command(&mut self) -> CommandId {
        self.current_command += 1;
        self.current_command
    }

    /// 接近该路点的车道中最小的限速；限速覆盖优先于导航图
    fn approach_speed_limit(&self, lanes: &[usize]) -> Option<f64> {
        lanes
            .iter()
            .filter_map(|l| {
                self.speed_limits
                    .get(*l)
                    .or_else(|| self.graph.lane(*l).and_then(|lane| lane.speed_limit))
            })
            .reduce(f64::min)
    }

    /// 下发新路径，替换正在执行的任何命令
    pub fn follow_path(&mut self, waypoints: Vec<PlanWaypoint>) -> CommandId {
        let command = self.next_command();
        let path = waypoints
            .iter()
            .map(|wp| Location {
                t: wp.time,
                x: wp.position[0],
                y: wp.position[1],
                yaw: wp.position[2],
                level_name: wp
                    .graph_index
                    .and_then(|i| self.graph.waypoint(i))
                    .map(|w| w.map_name.clone())
                    .unwrap_or_default(),
                approach_speed_limit: self.approach_speed_limit(&wp.approach_lanes),
            })
            .collect();

        let request = PathRequest {
            fleet_name: self.fleet_name.clone(),
            robot_name: self.robot_name.clone(),
            task_id: command.to_string(),
            path,
        };

        self.fault_latched = false;
        self.target_plan_index = None;
        self.channel.send_path(request.clone());
        self.intent = Intent::Following {
            command,
            request,
            waypoints,
            requested_at: Instant::now(),
        };
        tracing::debug!(robot = %self.robot_name, command, "Path command sent");
        command
    }

    /// 原地停车：下发只含最后已知位置的路径
    pub fn stop(&mut self) {
        self.intent = Intent::Idle;
        let Some(location) = self.last_known.as_ref().map(|s| s.location.clone()) else {
            tracing::warn!(
                robot = %self.robot_name,
                "Cannot ask robot [{}] to stop because we have never received a state from it",
                self.robot_name
            );
            return;
        };

        let command = self.next_command();
        self.channel.send_path(PathRequest {
            fleet_name: self.fleet_name.clone(),
            robot_name: self.robot_name.clone(),
            task_id: command.to_string(),
            path: vec![location],
        });
    }

    /// 请求停靠；停靠点不在导航图上时不下发命令并返回错误
    pub fn dock(&mut self, dock_name: &str) -> Result<CommandId, FleetError> {
        self.intent = Intent::Idle;
        let Some(lane) = self.graph.find_dock_lane(dock_name) else {
            let err = FleetError::UnknownDock(dock_name.to_string());
            tracing::error!(robot = %self.robot_name, "{}", err);
            return Err(err);
        };
        let waypoint = self.graph.lanes[lane].entry.waypoint;

        let command = self.next_command();
        let request = ModeRequest {
            fleet_name: self.fleet_name.clone(),
            robot_name: self.robot_name.clone(),
            task_id: command.to_string(),
            mode: RobotMode::Docking,
            parameters: vec![ModeParameter {
                name: "docking".to_string(),
                value: dock_name.to_string(),
            }],
        };
        self.channel.send_mode(request.clone());
        tracing::info!(
            "Requesting robot [{}] of [{}] to dock into waypoint [{}]",
            self.robot_name,
            self.fleet_name,
            self.graph.waypoint_name(waypoint)
        );

        self.intent = Intent::Docking {
            command,
            request,
            waypoint,
            requested_at: Instant::now(),
            scheduled_at: None,
        };
        Ok(command)
    }

    /// 对账一次遥测
    pub fn reconcile(&mut self, telemetry: RobotTelemetry) {
        self.last_known = Some(telemetry.clone());
        self.update_battery(telemetry.battery_percent);
        self.target_plan_index = None;

        match self.intent {
            Intent::Following { .. } => self.reconcile_following(&telemetry),
            Intent::Docking { .. } => self.reconcile_docking(&telemetry),
            Intent::Idle => self.estimate_state(&telemetry.location),
        }
    }

    fn update_battery(&mut self, percent: f64) {
        let soc = percent / 100.0;
        if (0.0..=1.0).contains(&soc) {
            self.events.push(DriverEvent::BatterySoc(soc));
        } else {
            tracing::error!(
                robot = %self.robot_name,
                "{}; the battery state of charge will not be updated",
                FleetError::BatteryOutOfRange(percent)
            );
        }
    }

    fn reconcile_following(&mut self, telemetry: &RobotTelemetry) {
        let resend_after = self.resend_after();
        let Intent::Following {
            command,
            request,
            requested_at,
            ..
        } = &mut self.intent
        else {
            return;
        };
        let command = *command;

        if telemetry.task_id != request.task_id {
            let now = Instant::now();
            if now.duration_since(*requested_at) > resend_after {
                *requested_at = now;
                tracing::debug!(
                    robot = %self.robot_name,
                    "{}, resending",
                    FleetError::CommandUnacknowledged {
                        robot: self.robot_name.clone(),
                        command: request.task_id.clone(),
                    }
                );
                self.channel.send_path(request.clone());
            }
            self.estimate_state(&telemetry.location);
            return;
        }

        if telemetry.mode == RobotMode::AdapterError {
            if self.fault_latched {
                return;
            }
            tracing::info!(
                "Fleet driver [{}] reported a need to replan for [{}]",
                self.fleet_name,
                self.robot_name
            );
            self.fault_latched = true;
            self.estimate_state(&telemetry.location);
            self.events.push(DriverEvent::ReplanRequested);
            return;
        }

        if telemetry.path.is_empty() {
            self.check_path_finish(telemetry, command);
            return;
        }

        self.estimate_path_traveling(telemetry, command);
    }

    fn reconcile_docking(&mut self, telemetry: &RobotTelemetry) {
        let resend_after = self.resend_after();
        let refresh = Duration::from_millis(self.settings.dock_schedule_refresh_ms);
        let now = Instant::now();
        let Intent::Docking {
            command,
            request,
            waypoint,
            requested_at,
            scheduled_at,
        } = &mut self.intent
        else {
            return;
        };

        if telemetry.task_id != request.task_id {
            if now.duration_since(*requested_at) > resend_after {
                *requested_at = now;
                self.channel.send_mode(request.clone());
            }
            return;
        }

        if telemetry.mode != RobotMode::Docking {
            let (command, waypoint) = (*command, *waypoint);
            self.intent = Intent::Idle;
            self.events.push(DriverEvent::Position(Position::Waypoint {
                waypoint,
                yaw: telemetry.location.yaw,
            }));
            self.events.push(DriverEvent::DockFinished { command });
            tracing::info!(robot = %self.robot_name, "Docking finished");
            return;
        }

        // 停靠过程中把驱动上报的剩余路径写入共享调度
        let due = scheduled_at
            .map(|at| now.duration_since(at) > refresh)
            .unwrap_or(true);
        if telemetry.path.is_empty() || !due {
            return;
        }

        let l = &telemetry.location;
        let positions: Vec<[f64; 3]> = std::iter::once([l.x, l.y, l.yaw])
            .chain(telemetry.path.iter().map(|p| [p.x, p.y, p.yaw]))
            .collect();
        let trajectory = interpolate::positions(&self.traits, l.t, &positions);
        if trajectory.len() < 2 {
            return;
        }

        *scheduled_at = Some(now);
        let plan_id = self.itinerary.assign_plan_id();
        self.itinerary
            .set(plan_id, vec![Route::new(l.level_name.clone(), trajectory)]);
    }

    /// 仅根据位姿估计位置
    fn estimate_state(&mut self, location: &Location) {
        self.events.push(DriverEvent::Position(Position::Free {
            map: location.level_name.clone(),
            position: [location.x, location.y, location.yaw],
        }));
    }

    fn estimate_path_traveling(&mut self, telemetry: &RobotTelemetry, command: CommandId) {
        let Intent::Following { waypoints, .. } = &self.intent else {
            return;
        };
        if waypoints.is_empty() {
            return;
        }

        let index = waypoints
            .len()
            .saturating_sub(telemetry.path.len())
            .min(waypoints.len() - 1);
        let target = &waypoints[index];
        let l = &telemetry.location;
        let position = [l.x, l.y, l.yaw];

        let estimated = if !target.approach_lanes.is_empty() {
            Position::Lanes {
                position,
                lanes: target.approach_lanes.clone(),
            }
        } else {
            match target.graph_index.and_then(|i| self.graph.waypoint(i).map(|w| (i, w))) {
                Some((i, wp))
                    if crate::graph::distance(wp.location, [l.x, l.y])
                        <= self.settings.max_merge_waypoint_distance =>
                {
                    Position::Waypoint {
                        waypoint: i,
                        yaw: l.yaw,
                    }
                }
                _ => Position::Free {
                    map: l.level_name.clone(),
                    position,
                },
            }
        };

        let next = &telemetry.path[0];
        let remaining = ((next.x - l.x).powi(2) + (next.y - l.y).powi(2)).sqrt();
        let seconds = remaining / self.traits.linear_velocity.max(1e-6);

        self.target_plan_index = Some(index);
        self.events.push(DriverEvent::Position(estimated));
        self.events.push(DriverEvent::Progress {
            command,
            path_index: index,
            estimate: Duration::from_secs_f64(seconds),
        });
    }

    fn check_path_finish(&mut self, telemetry: &RobotTelemetry, command: CommandId) {
        let Intent::Following { waypoints, .. } = &self.intent else {
            return;
        };
        let l = &telemetry.location;

        let estimated = match waypoints.last() {
            Some(last) => {
                let error = ((last.position[0] - l.x).powi(2) + (last.position[1] - l.y).powi(2)).sqrt();
                if error > self.settings.finish_tolerance {
                    tracing::warn!(
                        robot = %self.robot_name,
                        "The robot is off from its final destination by [{:.3}m]",
                        error
                    );
                }
                match last.graph_index {
                    Some(waypoint) => Position::Waypoint {
                        waypoint,
                        yaw: l.yaw,
                    },
                    None => Position::Free {
                        map: l.level_name.clone(),
                        position: [l.x, l.y, l.yaw],
                    },
                }
            }
            None => Position::Free {
                map: l.level_name.clone(),
                position: [l.x, l.y, l.yaw],
            },
        };

        self.intent = Intent::Idle;
        self.events.push(DriverEvent::Position(estimated));
        self.events.push(DriverEvent::PathFinished { command });
    }

    /// 处理新关闭的车道：机器人在被关闭车道上时视为倒回，任何受影响的计划都请求重新规划
    pub fn on_lane_closures(&mut self, closed: &HashSet<usize>) {
        let (Intent::Following { waypoints, .. }, Some(target_index)) =
            (&self.intent, self.target_plan_index)
        else {
            return;
        };
        let Some(target) = waypoints.get(target_index) else {
            return;
        };

        let mut need_to_replan = false;
        let mut reversal: Option<Position> = None;
        for lane_index in &target.approach_lanes {
            if !closed.contains(lane_index) {
                continue;
            }
            need_to_replan = true;

            let (Some(lane), Some(state)) = (self.graph.lane(*lane_index), &self.last_known)
            else {
                continue;
            };
            let loc = &state.location;
            let p = [loc.x, loc.y];
            let p0 = self.graph.waypoints[lane.entry.waypoint].location;
            let p1 = self.graph.waypoints[lane.exit.waypoint].location;
            let d = [p1[0] - p0[0], p1[1] - p0[1]];
            let dot = |a: [f64; 2], b: [f64; 2]| (a[0] - b[0]) * d[0] + (a[1] - b[1]) * d[1];

            let before_blocked_lane = dot(p, p0) < 0.0;
            let after_blocked_lane = dot(p, p1) >= 0.0;
            if before_blocked_lane || after_blocked_lane {
                continue;
            }

            // 机器人正处在被关闭的车道上，需要倒回车道起点
            let position = [p[0], p[1], loc.yaw];
            reversal = Some(
                match self.graph.lane_from(lane.exit.waypoint, lane.entry.waypoint) {
                    Some(reverse) => Position::Lanes {
                        position,
                        lanes: vec![reverse],
                    },
                    None => Position::Returning {
                        position,
                        waypoint: lane.entry.waypoint,
                    },
                },
            );
        }

        if !need_to_replan {
            need_to_replan = waypoints[target_index..]
                .iter()
                .any(|wp| wp.approach_lanes.iter().any(|l| closed.contains(l)));
        }

        if let Some(position) = reversal {
            self.events.push(DriverEvent::Position(position));
        }
        if need_to_replan {
            tracing::info!(robot = %self.robot_name, "Lane closure invalidated the current path");
            self.events.push(DriverEvent::ReplanRequested);
        }
    }

    /// 处理中断/恢复请求；未知 ID 的恢复请求被忽略
    pub fn interrupt(&mut self, request: &InterruptRequest) {
        match (self.interruptions.contains_key(&request.interrupt_id), request.kind) {
            (false, InterruptKind::Resume) | (true, InterruptKind::Interrupt) => {}
            (false, InterruptKind::Interrupt) => {
                self.interruptions
                    .insert(request.interrupt_id.clone(), request.labels.clone());
                tracing::info!(
                    "[{}] is interrupted for {}!",
                    self.robot_name,
                    request.interrupt_id
                );
                self.events.push(DriverEvent::Interrupted {
                    id: request.interrupt_id.clone(),
                    labels: request.labels.clone(),
                });
            }
            (true, InterruptKind::Resume) => {
                self.interruptions.remove(&request.interrupt_id);
                tracing::info!(
                    "Asking [{}] to resume for {}",
                    self.robot_name,
                    request.interrupt_id
                );
                self.events.push(DriverEvent::Resumed {
                    id: request.interrupt_id.clone(),
                    labels: request.labels.clone(),
                });
            }
        }
    }

    pub fn interruption_count(&self) -> usize {
        self.interruptions.len()
    }

    /// 登记正在执行的动作（遥操作等）
    pub fn set_action_execution(&mut self, action: impl Into<String>) {
        self.action = Some(action.into());
    }

    /// 完成正在执行的动作；没有动作时不做任何事
    pub fn complete_action(&mut self) {
        let Some(action) = self.action.take() else {
            return;
        };
        tracing::info!(
            "Robot [{}] has completed the action it was performing",
            self.robot_name
        );
        self.events.push(DriverEvent::ActionFinished { action });
    }
}
