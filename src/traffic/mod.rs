//! 交通调度基础类型：时间、轨迹、路线、车辆运动参数
//!
//! 共享调度的存储引擎不在本 crate 内，这里只定义参与者契约（`ScheduleParticipant`）
//! 以及一个内存实现，供单进程部署与测试使用。

pub mod interpolate;
pub mod schedule;

use serde::{Deserialize, Serialize};

pub use schedule::{
    InMemoryItinerary, InMemorySchedule, ScheduleDatabase, ScheduleParticipant,
};

/// 调度时间
pub type Time = chrono::DateTime<chrono::Utc>;
/// 有符号时长（累计延迟可以为负）
pub type Duration = chrono::Duration;

pub type ParticipantId = u64;
pub type PlanId = u64;
pub type RouteId = usize;
pub type CheckpointId = usize;
pub type ItineraryVersion = u64;

/// 将 std 时长转换为调度时长
pub fn from_std(d: std::time::Duration) -> Duration {
    Duration::microseconds(d.as_micros().min(i64::MAX as u128) as i64)
}

pub fn to_seconds(d: Duration) -> f64 {
    d.num_microseconds()
        .map(|us| us as f64 / 1e6)
        .unwrap_or(d.num_milliseconds() as f64 / 1e3)
}

pub fn from_seconds(s: f64) -> Duration {
    Duration::microseconds((s * 1e6).round() as i64)
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrajectoryPoint {
    pub time: Time,
    /// [x, y, yaw]
    pub position: [f64; 3],
}

/// 按时间排序的轨迹点序列
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Trajectory {
    pub points: Vec<TrajectoryPoint>,
}

impl Trajectory {
    pub fn new(points: Vec<TrajectoryPoint>) -> Self {
        Self { points }
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn start_time(&self) -> Option<Time> {
        self.points.first().map(|p| p.time)
    }

    pub fn finish_time(&self) -> Option<Time> {
        self.points.last().map(|p| p.time)
    }

    /// 第一个时间不早于 `time` 的轨迹点索引
    pub fn find(&self, time: Time) -> Option<usize> {
        self.points.iter().position(|p| p.time >= time)
    }
}

/// 某张地图上的一段轨迹
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Route {
    pub map: String,
    pub trajectory: Trajectory,
}

impl Route {
    pub fn new(map: impl Into<String>, trajectory: Trajectory) -> Self {
        Self {
            map: map.into(),
            trajectory,
        }
    }
}

/// 车辆运动参数
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VehicleTraits {
    pub linear_velocity: f64,
    pub linear_acceleration: f64,
    pub angular_velocity: f64,
    pub angular_acceleration: f64,
}

impl Default for VehicleTraits {
    fn default() -> Self {
        Self {
            linear_velocity: 0.7,
            linear_acceleration: 0.3,
            angular_velocity: 0.5,
            angular_acceleration: 1.5,
        }
    }
}
