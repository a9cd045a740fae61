//! 与车队驱动、设备及车道控制交换的消息
//!
//! 字段命名沿用车队驱动协议；JSON 编码由 `fleet::transport` 负责。

use serde::{Deserialize, Serialize};

use crate::traffic::Time;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub t: Time,
    pub x: f64,
    pub y: f64,
    pub yaw: f64,
    #[serde(default)]
    pub level_name: String,
    /// 到达该点途中的限速
    #[serde(default)]
    pub approach_speed_limit: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RobotMode {
    Idle,
    Charging,
    Moving,
    Paused,
    Waiting,
    Emergency,
    GoingHome,
    Docking,
    /// 驱动内部故障，需要重新规划
    AdapterError,
}

/// 单个机器人的遥测
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RobotTelemetry {
    pub name: String,
    /// 驱动最近确认的命令关联 ID
    #[serde(default)]
    pub task_id: String,
    pub mode: RobotMode,
    pub battery_percent: f64,
    pub location: Location,
    /// 剩余路径
    #[serde(default)]
    pub path: Vec<Location>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FleetState {
    pub name: String,
    #[serde(default)]
    pub robots: Vec<RobotTelemetry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PathRequest {
    pub fleet_name: String,
    pub robot_name: String,
    pub task_id: String,
    pub path: Vec<Location>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModeParameter {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModeRequest {
    pub fleet_name: String,
    pub robot_name: String,
    #[serde(default)]
    pub task_id: String,
    pub mode: RobotMode,
    #[serde(default)]
    pub parameters: Vec<ModeParameter>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LaneRequest {
    pub fleet_name: String,
    #[serde(default)]
    pub open_lanes: Vec<usize>,
    #[serde(default)]
    pub close_lanes: Vec<usize>,
}

/// 关闭车道快照
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClosedLanes {
    pub fleet_name: String,
    pub closed_lanes: Vec<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SpeedLimitedLane {
    pub lane_index: usize,
    pub speed_limit: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpeedLimitRequest {
    pub fleet_name: String,
    #[serde(default)]
    pub speed_limits: Vec<SpeedLimitedLane>,
    #[serde(default)]
    pub remove_limits: Vec<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterruptKind {
    Interrupt,
    Resume,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterruptRequest {
    pub fleet_name: String,
    pub robot_name: String,
    pub interrupt_id: String,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(rename = "type")]
    pub kind: InterruptKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DoorMode {
    Closed,
    Moving,
    Open,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DoorRequest {
    pub door_name: String,
    pub requester_id: String,
    pub requested_mode: DoorMode,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DoorState {
    pub door_name: String,
    pub current_mode: DoorMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LiftRequestType {
    AgvMode,
    EndSession,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiftRequest {
    pub lift_name: String,
    pub session_id: String,
    pub request_type: LiftRequestType,
    pub destination_floor: String,
    pub door_state: DoorMode,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiftState {
    pub lift_name: String,
    pub current_floor: String,
    pub door_state: DoorMode,
    /// 当前占用电梯的会话
    #[serde(default)]
    pub session_id: String,
}

/// 发往单个车队驱动的命令通道
pub trait DriverChannel: Send + Sync {
    fn send_path(&self, request: PathRequest);

    fn send_mode(&self, request: ModeRequest);
}

/// 门与电梯请求通道
pub trait DeviceChannel: Send + Sync {
    fn request_door(&self, request: DoorRequest);

    fn request_lift(&self, request: LiftRequest);
}

/// 关闭车道快照的发布者
pub trait LaneStatePublisher: Send + Sync {
    fn publish_closed_lanes(&self, snapshot: ClosedLanes);
}
