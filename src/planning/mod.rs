//! 规划契约：起点、目标、计划与 Planner 接口
//!
//! 规划器本身是外部协作者；`ShortestPathPlanner` 是二进制与测试使用的参考实现。

pub mod shortest_path;

use std::collections::HashSet;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::graph::Event;
use crate::negotiation::TableView;
use crate::traffic::{CheckpointId, ParticipantId, Route, RouteId, Time};

pub use shortest_path::ShortestPathPlanner;

/// 规划起点
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanStart {
    pub time: Time,
    /// 起点路点（机器人在车道上时为车道出口）
    pub waypoint: usize,
    pub orientation: f64,
    /// 机器人不在路点上时的实际位置
    pub location: Option<[f64; 2]>,
    /// 机器人所在车道
    pub lane: Option<usize>,
}

impl PlanStart {
    pub fn at_waypoint(time: Time, waypoint: usize, orientation: f64) -> Self {
        Self {
            time,
            waypoint,
            orientation,
            location: None,
            lane: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Goal {
    pub waypoint: usize,
    #[serde(default)]
    pub orientation: Option<f64>,
}

impl Goal {
    pub fn new(waypoint: usize) -> Self {
        Self {
            waypoint,
            orientation: None,
        }
    }
}

/// 共享调度中的检查点
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub route_id: RouteId,
    pub checkpoint_id: CheckpointId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanWaypoint {
    /// [x, y, yaw]
    pub position: [f64; 3],
    pub time: Time,
    pub graph_index: Option<usize>,
    /// 到达该路点所经过的车道
    pub approach_lanes: Vec<usize>,
    pub event: Option<Event>,
    pub arrival_checkpoints: Vec<Checkpoint>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub waypoints: Vec<PlanWaypoint>,
    pub itinerary: Vec<Route>,
    /// 代价（秒）
    pub cost: f64,
}

impl Plan {
    /// 计划的结束时间
    pub fn finish_time(&self) -> Option<Time> {
        self.itinerary
            .last()
            .and_then(|route| route.trajectory.finish_time())
    }
}

/// 规划约束
#[derive(Debug, Clone, Default)]
pub struct PlanConstraints {
    pub closed_lanes: HashSet<usize>,
    pub participant: Option<ParticipantId>,
}

/// 规划器契约；返回 None 表示不存在可行计划
#[async_trait]
pub trait Planner: Send + Sync {
    /// 忽略交通的代价估计，用于任务接纳
    fn estimate_cost(&self, starts: &[PlanStart], goal: &Goal) -> Option<f64>;

    async fn plan(
        &self,
        starts: &[PlanStart],
        goal: &Goal,
        constraints: &PlanConstraints,
    ) -> Option<Plan>;

    async fn emergency_pullover(
        &self,
        starts: &[PlanStart],
        constraints: &PlanConstraints,
    ) -> Option<Plan>;

    /// 协商中提出的方案；没有目标时提出紧急靠边
    ///
    /// 默认实现不读取协商表，是否让步由调用方按代价容忍度决定。
    async fn negotiate(
        &self,
        starts: &[PlanStart],
        goal: Option<&Goal>,
        constraints: &PlanConstraints,
        _table: &TableView,
    ) -> Option<Plan> {
        match goal {
            Some(goal) => self.plan(starts, goal, constraints).await,
            None => self.emergency_pullover(starts, constraints).await,
        }
    }
}
