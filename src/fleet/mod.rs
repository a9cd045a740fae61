//! 车队适配器：接入遥测与控制消息，管理每个机器人的工作者
//!
//! 不属于本车队（或本车队中未知机器人）的控制消息被忽略，不会报错。

pub mod builder;
pub mod lanes;
pub mod transport;

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use futures_util::future::join_all;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::AdapterConfig;
use crate::core::{Clock, FleetError, RecoveryAction, RecoveryEngine};
use crate::driver::{
    ClosedLanes, DeviceChannel, DoorState, DriverChannel, DriverLink, FleetState,
    InterruptRequest, LaneRequest, LaneStatePublisher, LiftState, ModeRequest, RobotMode,
    RobotTelemetry, SpeedLimitRequest,
};
use crate::graph::{proximity, NavigationGraph};
use crate::negotiation::{Responder, TableView};
use crate::phases::{PhaseInput, PhaseStatus};
use crate::planning::Planner;
use crate::robot::{RobotContext, RobotEvent, RobotHandle, RobotWorker, TaskRequest};
use crate::traffic::{ScheduleDatabase, VehicleTraits};

pub use builder::FleetAdapterBuilder;
pub use lanes::{ClosedLaneSet, SpeedLimits};

pub struct FleetAdapter {
    name: String,
    graph: Arc<NavigationGraph>,
    traits: VehicleTraits,
    planner: Arc<dyn Planner>,
    schedule: Arc<dyn ScheduleDatabase>,
    clock: Arc<dyn Clock>,
    driver: Arc<dyn DriverChannel>,
    devices: Arc<dyn DeviceChannel>,
    lane_publisher: Arc<dyn LaneStatePublisher>,
    settings: Arc<AdapterConfig>,
    closed_lanes: ClosedLaneSet,
    speed_limits: SpeedLimits,
    robots: RwLock<HashMap<String, RobotHandle>>,
    /// 已提示过无法接入的机器人
    rejected: Mutex<HashSet<String>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    status: broadcast::Sender<PhaseStatus>,
    emergency: AtomicBool,
    recovery: RecoveryEngine,
    shutdown: CancellationToken,
}

impl FleetAdapter {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn graph(&self) -> &Arc<NavigationGraph> {
        &self.graph
    }

    pub fn closed_lanes(&self) -> &ClosedLaneSet {
        &self.closed_lanes
    }

    pub fn subscribe_status(&self) -> broadcast::Receiver<PhaseStatus> {
        self.status.subscribe()
    }

    pub fn robot_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.read_robots().keys().cloned().collect();
        names.sort();
        names
    }

    fn read_robots(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, RobotHandle>> {
        self.robots.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn robot(&self, name: &str) -> Option<RobotHandle> {
        self.read_robots().get(name).cloned()
    }

    fn broadcast(&self, mut event: impl FnMut() -> RobotEvent) {
        for handle in self.read_robots().values() {
            handle.send(event());
        }
    }

    fn unknown_robot(&self, robot: &str) -> FleetError {
        FleetError::UnknownRobot {
            robot: robot.to_string(),
            fleet: self.name.clone(),
        }
    }

    /// 处理一份车队状态；未知机器人尝试接入
    pub fn handle_fleet_state(&self, state: FleetState) {
        if state.name != self.name {
            return;
        }
        for telemetry in state.robots {
            match self.robot(&telemetry.name) {
                Some(handle) => {
                    handle.send(RobotEvent::Telemetry(telemetry));
                }
                None => {
                    // 失败已记录；之后的遥测会再次尝试
                    let _ = self.admit(telemetry);
                }
            }
        }
    }

    /// 用首条遥测把机器人接入导航图并启动其工作者
    pub fn admit(&self, telemetry: RobotTelemetry) -> Result<(), FleetError> {
        let l = &telemetry.location;
        let now = self.clock.now();
        let starts = self.graph.plan_starts(
            &l.level_name,
            [l.x, l.y, l.yaw],
            now,
            self.settings.driver.max_merge_waypoint_distance,
            self.settings.driver.max_merge_lane_distance,
        );

        if starts.is_empty() {
            let err = FleetError::OffGraph {
                robot: telemetry.name.clone(),
                hint: proximity::off_graph_hint(&l.level_name, l.x, l.y, &self.graph),
            };
            let first = self
                .rejected
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(telemetry.name.clone());
            if first {
                if let RecoveryAction::Reject(hint) = self.recovery.handle(&err) {
                    tracing::error!(
                        "Unable to compute a StartSet for robot [{}] using level_name [{}] and location [{}, {}, {}] specified in the RobotState message. {}",
                        telemetry.name,
                        l.level_name,
                        l.x,
                        l.y,
                        l.yaw,
                        hint
                    );
                }
            }
            return Err(err);
        }

        let name = telemetry.name.clone();
        let itinerary = self.schedule.register(&name);
        let participant = itinerary.id();
        let link = DriverLink::new(
            &self.name,
            &name,
            self.graph.clone(),
            self.traits,
            self.settings.driver.clone(),
            self.driver.clone(),
            itinerary.clone(),
            self.speed_limits.clone(),
        );

        let (tx, rx) = mpsc::unbounded_channel();
        let mut ctx = RobotContext::new(
            name.clone(),
            self.name.clone(),
            self.graph.clone(),
            self.planner.clone(),
            itinerary,
            self.clock.clone(),
            link,
            self.devices.clone(),
            self.closed_lanes.clone(),
            self.settings.clone(),
            starts,
            tx.clone(),
            self.status.clone(),
        );
        ctx.emergency = self.emergency.load(Ordering::SeqCst);

        let worker = RobotWorker::new(ctx, rx, self.shutdown.child_token()).spawn();
        self.workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(worker);

        let handle = RobotHandle::new(name.clone(), tx);
        handle.send(RobotEvent::Telemetry(telemetry));
        self.robots
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.clone(), handle);
        self.rejected
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&name);

        tracing::info!(
            "Added a robot named [{}] with participant ID [{}]",
            name,
            participant
        );
        Ok(())
    }

    /// 先关闭再开放车道，发布快照，并把新关闭的车道通知给所有机器人
    pub fn handle_lane_request(&self, request: LaneRequest) {
        if request.fleet_name != self.name {
            return;
        }

        let newly_closed = self
            .closed_lanes
            .apply(&request.close_lanes, &request.open_lanes);
        self.lane_publisher.publish_closed_lanes(ClosedLanes {
            fleet_name: self.name.clone(),
            closed_lanes: self.closed_lanes.snapshot(),
        });

        if !newly_closed.is_empty() {
            tracing::info!(fleet = %self.name, lanes = ?newly_closed, "Lanes closed");
            self.broadcast(|| RobotEvent::LanesClosed(newly_closed.clone()));
        }
    }

    pub fn handle_speed_limits(&self, request: SpeedLimitRequest) {
        if request.fleet_name != self.name {
            return;
        }
        for limit in &request.speed_limits {
            self.speed_limits.set(limit.lane_index, limit.speed_limit);
        }
        for lane in &request.remove_limits {
            self.speed_limits.remove(*lane);
        }
    }

    pub fn handle_interrupt(&self, request: InterruptRequest) {
        if request.fleet_name != self.name {
            return;
        }
        match self.robot(&request.robot_name) {
            Some(handle) => {
                handle.send(RobotEvent::Interrupt(request));
            }
            None => {
                let err = self.unknown_robot(&request.robot_name);
                tracing::warn!("{}, ignoring interrupt [{}]", err, request.interrupt_id);
            }
        }
    }

    /// 外部动作完成通知：发给本车队某机器人的 Idle 模式请求
    pub fn handle_mode_request(&self, request: ModeRequest) {
        if request.fleet_name != self.name || request.mode != RobotMode::Idle {
            return;
        }
        if let Some(handle) = self.robot(&request.robot_name) {
            handle.send(RobotEvent::ActionCompleted);
        }
    }

    pub fn set_emergency(&self, on: bool) {
        if self.emergency.swap(on, Ordering::SeqCst) == on {
            return;
        }
        tracing::warn!(fleet = %self.name, on, "Emergency alarm changed");
        self.broadcast(|| RobotEvent::EmergencyAlarm(on));
    }

    pub fn handle_door_state(&self, state: DoorState) {
        self.broadcast(|| RobotEvent::Phase(PhaseInput::Door(state.clone())));
    }

    pub fn handle_lift_state(&self, state: LiftState) {
        self.broadcast(|| RobotEvent::Phase(PhaseInput::Lift(state.clone())));
    }

    pub fn submit_task(&self, robot: &str, task: TaskRequest) -> Result<(), FleetError> {
        let handle = self.robot(robot).ok_or_else(|| self.unknown_robot(robot))?;
        handle.send(RobotEvent::Submit(task));
        Ok(())
    }

    /// 仲裁入口：把协商表交给机器人工作者
    pub fn negotiate(
        &self,
        robot: &str,
        table: TableView,
        responder: Arc<dyn Responder>,
    ) -> Result<(), FleetError> {
        let handle = self.robot(robot).ok_or_else(|| self.unknown_robot(robot))?;
        handle.send(RobotEvent::Negotiate { table, responder });
        Ok(())
    }

    /// 所有机器人原地停车，等待工作者退出
    pub async fn hold_all(&self) {
        let handles: Vec<RobotHandle> = self.read_robots().values().cloned().collect();
        join_all(handles.iter().map(|handle| {
            tracing::info!(robot = handle.name(), "Holding robot in place");
            handle.hold_position()
        }))
        .await;
        let workers: Vec<JoinHandle<()>> = std::mem::take(
            &mut *self.workers.lock().unwrap_or_else(PoisonError::into_inner),
        );
        for worker in workers {
            if let Err(e) = worker.await {
                tracing::warn!("Robot worker ended abnormally: {}", e);
            }
        }
    }

    /// 取消所有工作者（不等待）
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}
