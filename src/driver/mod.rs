//! 驱动链路：命令下发、遥测对账与中断
//!
//! `DriverLink` 由机器人工作者独占（`&mut self`），对账结果以 `DriverEvent` 形式
//! 放入发件箱，由工作者在每次处理完输入后取走并分发给当前阶段。

pub mod link;
pub mod messages;
#[cfg(test)]
pub(crate) mod testing;

use serde::{Deserialize, Serialize};

use crate::config::DriverSection;
use crate::graph::NavigationGraph;
use crate::planning::PlanStart;
use crate::traffic::Time;

pub use link::DriverLink;
pub use messages::{
    ClosedLanes, DeviceChannel, DoorMode, DoorRequest, DoorState, DriverChannel, FleetState,
    InterruptKind, InterruptRequest, LaneRequest, LaneStatePublisher, LiftRequest,
    LiftRequestType, LiftState, Location, ModeParameter, ModeRequest, PathRequest, RobotMode,
    RobotTelemetry, SpeedLimitRequest, SpeedLimitedLane,
};

/// 下发给驱动的命令关联 ID
pub type CommandId = u64;

/// 估计出的机器人在图上的位置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Position {
    /// 停在路点上
    Waypoint { waypoint: usize, yaw: f64 },
    /// 在若干车道上行驶
    Lanes { position: [f64; 3], lanes: Vec<usize> },
    /// 需要返回某路点（没有可用的反向车道）
    Returning { position: [f64; 3], waypoint: usize },
    /// 脱离计划，仅知道地图与位姿
    Free { map: String, position: [f64; 3] },
}

impl Position {
    /// 转换为规划起点集合；无法落到图上时返回空
    pub fn to_starts(
        &self,
        graph: &NavigationGraph,
        time: Time,
        settings: &DriverSection,
    ) -> Vec<PlanStart> {
        match self {
            Position::Waypoint { waypoint, yaw } => {
                vec![PlanStart::at_waypoint(time, *waypoint, *yaw)]
            }
            Position::Lanes { position, lanes } => lanes
                .iter()
                .filter_map(|l| graph.lane(*l).map(|lane| (*l, lane.exit.waypoint)))
                .map(|(lane, waypoint)| PlanStart {
                    time,
                    waypoint,
                    orientation: position[2],
                    location: Some([position[0], position[1]]),
                    lane: Some(lane),
                })
                .collect(),
            Position::Returning { position, waypoint } => vec![PlanStart {
                time,
                waypoint: *waypoint,
                orientation: position[2],
                location: Some([position[0], position[1]]),
                lane: None,
            }],
            Position::Free { map, position } => graph.plan_starts(
                map,
                *position,
                time,
                settings.max_merge_waypoint_distance,
                settings.max_merge_lane_distance,
            ),
        }
    }
}

/// 对账产生的事件
#[derive(Debug, Clone, PartialEq)]
pub enum DriverEvent {
    Position(Position),
    /// 沿路径行进：下一个目标路点索引与预计到达用时
    Progress {
        command: CommandId,
        path_index: usize,
        estimate: std::time::Duration,
    },
    PathFinished { command: CommandId },
    DockFinished { command: CommandId },
    ActionFinished { action: String },
    /// 驱动故障或车道关闭，需要重新规划
    ReplanRequested,
    BatterySoc(f64),
    Interrupted { id: String, labels: Vec<String> },
    Resumed { id: String, labels: Vec<String> },
}
