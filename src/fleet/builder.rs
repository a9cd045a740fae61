//! 车队适配器构建器：统一组装规划器、调度、时钟与外部通道

use std::collections::{HashMap, HashSet};
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex, RwLock};

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use super::{ClosedLaneSet, FleetAdapter, SpeedLimits};
use crate::config::AdapterConfig;
use crate::core::{Clock, RecoveryEngine, SystemClock};
use crate::driver::{
    ClosedLanes, DeviceChannel, DoorRequest, DriverChannel, LaneStatePublisher, LiftRequest,
};
use crate::graph::NavigationGraph;
use crate::planning::{Planner, ShortestPathPlanner};
use crate::traffic::{InMemorySchedule, ScheduleDatabase};

/// 未接入门、电梯与车道状态通道时使用：只记录日志
struct LogOnly;

impl DeviceChannel for LogOnly {
    fn request_door(&self, request: DoorRequest) {
        tracing::warn!(door = %request.door_name, "No device channel configured for door request");
    }

    fn request_lift(&self, request: LiftRequest) {
        tracing::warn!(lift = %request.lift_name, "No device channel configured for lift request");
    }
}

impl LaneStatePublisher for LogOnly {
    fn publish_closed_lanes(&self, lanes: ClosedLanes) {
        tracing::info!(fleet = %lanes.fleet_name, closed = ?lanes.closed_lanes, "Closed lanes");
    }
}

pub struct FleetAdapterBuilder {
    config: AdapterConfig,
    graph: Arc<NavigationGraph>,
    driver: Arc<dyn DriverChannel>,
    planner: Option<Arc<dyn Planner>>,
    schedule: Option<Arc<dyn ScheduleDatabase>>,
    clock: Option<Arc<dyn Clock>>,
    devices: Option<Arc<dyn DeviceChannel>>,
    lane_publisher: Option<Arc<dyn LaneStatePublisher>>,
    status_capacity: usize,
}

impl FleetAdapterBuilder {
    pub fn new(config: AdapterConfig, graph: NavigationGraph, driver: Arc<dyn DriverChannel>) -> Self {
        Self {
            config,
            graph: Arc::new(graph),
            driver,
            planner: None,
            schedule: None,
            clock: None,
            devices: None,
            lane_publisher: None,
            status_capacity: 256,
        }
    }

    /// 替换默认的最短路径规划器
    pub fn with_planner(mut self, planner: Arc<dyn Planner>) -> Self {
        self.planner = Some(planner);
        self
    }

    pub fn with_schedule(mut self, schedule: Arc<dyn ScheduleDatabase>) -> Self {
        self.schedule = Some(schedule);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn with_devices(mut self, devices: Arc<dyn DeviceChannel>) -> Self {
        self.devices = Some(devices);
        self
    }

    pub fn with_lane_publisher(mut self, publisher: Arc<dyn LaneStatePublisher>) -> Self {
        self.lane_publisher = Some(publisher);
        self
    }

    pub fn with_status_capacity(mut self, capacity: usize) -> Self {
        self.status_capacity = capacity.max(1);
        self
    }

    pub fn build(self) -> FleetAdapter {
        let traits = self.config.traits.vehicle_traits();
        let planner = self
            .planner
            .unwrap_or_else(|| Arc::new(ShortestPathPlanner::new(self.graph.clone(), traits)));
        let (status, _) = broadcast::channel(self.status_capacity);

        tracing::info!(
            fleet = %self.config.fleet.name,
            waypoints = self.graph.num_waypoints(),
            lanes = self.graph.num_lanes(),
            "Fleet adapter built"
        );

        FleetAdapter {
            name: self.config.fleet.name.clone(),
            graph: self.graph,
            traits,
            planner,
            schedule: self
                .schedule
                .unwrap_or_else(|| Arc::new(InMemorySchedule::new())),
            clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
            driver: self.driver,
            devices: self.devices.unwrap_or_else(|| Arc::new(LogOnly)),
            lane_publisher: self.lane_publisher.unwrap_or_else(|| Arc::new(LogOnly)),
            settings: Arc::new(self.config),
            closed_lanes: ClosedLaneSet::new(),
            speed_limits: SpeedLimits::new(),
            robots: RwLock::new(HashMap::new()),
            rejected: Mutex::new(HashSet::new()),
            workers: Mutex::new(Vec::new()),
            status,
            emergency: AtomicBool::new(false),
            recovery: RecoveryEngine::new(),
            shutdown: CancellationToken::new(),
        }
    }
}
