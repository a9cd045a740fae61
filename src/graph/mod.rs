//! 导航图：路点、车道与车道事件
//!
//! 导航图加载后只读，由所有机器人工作者通过 `Arc<NavigationGraph>` 共享。
//! 文件格式按扩展名选择：`.toml` 使用 toml，其余按 JSON 解析。

pub mod proximity;

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::planning::PlanStart;
use crate::traffic::Time;

pub use proximity::{nearest, off_graph_hint, Proximity, ProximityKind};

/// 导航图加载错误
#[derive(Error, Debug)]
pub enum GraphError {
    #[error("Failed to read navigation graph [{path}]: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse navigation graph: {0}")]
    Parse(String),

    #[error("Lane [{lane}] refers to missing waypoint [{waypoint}]")]
    MissingWaypoint { lane: usize, waypoint: usize },
}

/// 车道入口/出口上挂载的事件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    Dock { dock_name: String },
    DoorOpen { name: String },
    DoorClose { name: String },
    LiftDoorOpen { lift_name: String, floor_name: String },
    LiftDoorClose { lift_name: String, floor_name: String },
    LiftMove { lift_name: String, floor_name: String },
    LiftSessionBegin { lift_name: String, floor_name: String },
    LiftSessionEnd { lift_name: String, floor_name: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Waypoint {
    #[serde(default)]
    pub name: Option<String>,
    pub map_name: String,
    pub location: [f64; 2],
    #[serde(default)]
    pub parking_spot: bool,
    #[serde(default)]
    pub charger: bool,
}

/// 车道端点：路点索引与可选事件
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LaneNode {
    pub waypoint: usize,
    #[serde(default)]
    pub event: Option<Event>,
}

impl LaneNode {
    pub fn new(waypoint: usize) -> Self {
        Self {
            waypoint,
            event: None,
        }
    }
}

/// 有向车道
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lane {
    pub entry: LaneNode,
    pub exit: LaneNode,
    #[serde(default)]
    pub speed_limit: Option<f64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NavigationGraph {
    #[serde(default)]
    pub waypoints: Vec<Waypoint>,
    #[serde(default)]
    pub lanes: Vec<Lane>,
    /// 名称 -> 路点索引
    #[serde(skip)]
    keys: HashMap<String, usize>,
}

impl NavigationGraph {
    pub fn new(waypoints: Vec<Waypoint>, lanes: Vec<Lane>) -> Result<Self, GraphError> {
        let mut graph = Self {
            waypoints,
            lanes,
            keys: HashMap::new(),
        };
        graph.index()?;
        Ok(graph)
    }

    /// 从文件加载导航图
    pub fn load(path: impl AsRef<Path>) -> Result<Self, GraphError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| GraphError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let is_toml = path
            .extension()
            .map(|ext| ext.eq_ignore_ascii_case("toml"))
            .unwrap_or(false);
        if is_toml {
            Self::from_toml_str(&text)
        } else {
            Self::from_json_str(&text)
        }
    }

    pub fn from_json_str(text: &str) -> Result<Self, GraphError> {
        let graph: Self =
            serde_json::from_str(text).map_err(|e| GraphError::Parse(e.to_string()))?;
        Self::new(graph.waypoints, graph.lanes)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, GraphError> {
        let graph: Self = toml::from_str(text).map_err(|e| GraphError::Parse(e.to_string()))?;
        Self::new(graph.waypoints, graph.lanes)
    }

    fn index(&mut self) -> Result<(), GraphError> {
        for (i, lane) in self.lanes.iter().enumerate() {
            for wp in [lane.entry.waypoint, lane.exit.waypoint] {
                if wp >= self.waypoints.len() {
                    return Err(GraphError::MissingWaypoint { lane: i, waypoint: wp });
                }
            }
        }
        self.keys = self
            .waypoints
            .iter()
            .enumerate()
            .filter_map(|(i, wp)| wp.name.clone().map(|name| (name, i)))
            .collect();
        Ok(())
    }

    pub fn num_waypoints(&self) -> usize {
        self.waypoints.len()
    }

    pub fn num_lanes(&self) -> usize {
        self.lanes.len()
    }

    pub fn waypoint(&self, index: usize) -> Option<&Waypoint> {
        self.waypoints.get(index)
    }

    pub fn lane(&self, index: usize) -> Option<&Lane> {
        self.lanes.get(index)
    }

    pub fn find_waypoint(&self, name: &str) -> Option<usize> {
        self.keys.get(name).copied()
    }

    /// 路点显示名：有名称用名称，否则 `#索引`
    pub fn waypoint_name(&self, index: usize) -> String {
        self.waypoints
            .get(index)
            .and_then(|wp| wp.name.clone())
            .unwrap_or_else(|| format!("#{index}"))
    }

    /// 查找从 `from` 到 `to` 的车道
    pub fn lane_from(&self, from: usize, to: usize) -> Option<usize> {
        self.lanes
            .iter()
            .position(|lane| lane.entry.waypoint == from && lane.exit.waypoint == to)
    }

    /// 以某路点为起点的车道
    pub fn lanes_from(&self, waypoint: usize) -> impl Iterator<Item = usize> + '_ {
        self.lanes
            .iter()
            .enumerate()
            .filter(move |(_, lane)| lane.entry.waypoint == waypoint)
            .map(|(i, _)| i)
    }

    /// 入口事件为该停靠点的车道
    pub fn find_dock_lane(&self, dock_name: &str) -> Option<usize> {
        self.lanes.iter().position(|lane| {
            matches!(&lane.entry.event, Some(Event::Dock { dock_name: name }) if name == dock_name)
        })
    }

    /// 计算机器人在图上的起点集合
    ///
    /// 依次尝试：距离不超过 `max_merge_waypoint_distance` 的路点；
    /// 投影落在线段内且距离不超过 `max_merge_lane_distance` 的所有车道（起点为车道出口）；
    /// 距离不超过 `max_merge_lane_distance` 的最近路点。都不满足时返回空集合。
    pub fn plan_starts(
        &self,
        map_name: &str,
        pose: [f64; 3],
        time: Time,
        max_merge_waypoint_distance: f64,
        max_merge_lane_distance: f64,
    ) -> Vec<PlanStart> {
        let p = [pose[0], pose[1]];
        let yaw = pose[2];

        let mut closest: Option<(usize, f64)> = None;
        for (i, wp) in self.waypoints.iter().enumerate() {
            if wp.map_name != map_name {
                continue;
            }
            let dist = distance(wp.location, p);
            if closest.map(|(_, d)| dist < d).unwrap_or(true) {
                closest = Some((i, dist));
            }
        }

        if let Some((index, dist)) = closest {
            if dist <= max_merge_waypoint_distance {
                return vec![PlanStart::at_waypoint(time, index, yaw)];
            }
        }

        let mut starts = Vec::new();
        for (i, lane) in self.lanes.iter().enumerate() {
            let wp0 = &self.waypoints[lane.entry.waypoint];
            let wp1 = &self.waypoints[lane.exit.waypoint];
            if wp0.map_name != map_name || wp1.map_name != map_name {
                continue;
            }
            if let Some(dist) = proximity::distance_to_segment(p, wp0.location, wp1.location) {
                if dist <= max_merge_lane_distance {
                    starts.push(PlanStart {
                        time,
                        waypoint: lane.exit.waypoint,
                        orientation: yaw,
                        location: Some(p),
                        lane: Some(i),
                    });
                }
            }
        }

        if !starts.is_empty() {
            return starts;
        }

        match closest {
            Some((index, dist)) if dist <= max_merge_lane_distance => {
                let mut start = PlanStart::at_waypoint(time, index, yaw);
                start.location = Some(p);
                vec![start]
            }
            _ => Vec::new(),
        }
    }
}

pub(crate) fn distance(a: [f64; 2], b: [f64; 2]) -> f64 {
    ((a[0] - b[0]).powi(2) + (a[1] - b[1]).powi(2)).sqrt()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn wp(name: &str, x: f64, y: f64) -> Waypoint {
        Waypoint {
            name: Some(name.to_string()),
            map_name: "L1".to_string(),
            location: [x, y],
            parking_spot: false,
            charger: false,
        }
    }

    pub(crate) fn lane(entry: usize, exit: usize) -> Lane {
        Lane {
            entry: LaneNode::new(entry),
            exit: LaneNode::new(exit),
            speed_limit: None,
        }
    }

    /// A(0,0) - B(5,0) - C(10,0) 双向车道
    pub(crate) fn line_graph() -> NavigationGraph {
        NavigationGraph::new(
            vec![wp("A", 0.0, 0.0), wp("B", 5.0, 0.0), wp("C", 10.0, 0.0)],
            vec![lane(0, 1), lane(1, 0), lane(1, 2), lane(2, 1)],
        )
        .unwrap()
    }

    #[test]
    fn test_graph_lane_lookup() {
        let graph = line_graph();
        assert_eq!(graph.lane_from(0, 1), Some(0));
        assert_eq!(graph.lane_from(2, 1), Some(3));
        assert_eq!(graph.lane_from(0, 2), None);
        assert_eq!(graph.find_waypoint("C"), Some(2));
        assert_eq!(graph.lanes_from(1).collect::<Vec<_>>(), vec![1, 2]);
    }

    #[test]
    fn test_graph_waypoint_name_falls_back_to_index() {
        let mut waypoints = vec![wp("A", 0.0, 0.0)];
        waypoints.push(Waypoint {
            name: None,
            ..wp("unused", 1.0, 0.0)
        });
        let graph = NavigationGraph::new(waypoints, vec![]).unwrap();
        assert_eq!(graph.waypoint_name(0), "A");
        assert_eq!(graph.waypoint_name(1), "#1");
    }

    #[test]
    fn test_graph_rejects_lane_to_missing_waypoint() {
        let err = NavigationGraph::new(vec![wp("A", 0.0, 0.0)], vec![lane(0, 3)]).unwrap_err();
        assert!(matches!(err, GraphError::MissingWaypoint { lane: 0, waypoint: 3 }));
    }

    #[test]
    fn test_graph_load_json_with_events() {
        let text = r#"{
            "waypoints": [
                {"name": "A", "map_name": "L1", "location": [0.0, 0.0]},
                {"name": "dock", "map_name": "L1", "location": [1.0, 0.0], "charger": true}
            ],
            "lanes": [
                {"entry": {"waypoint": 0, "event": {"type": "dock", "dock_name": "charger_1"}},
                 "exit": {"waypoint": 1}, "speed_limit": 0.5}
            ]
        }"#;
        let graph = NavigationGraph::from_json_str(text).unwrap();
        assert_eq!(graph.find_dock_lane("charger_1"), Some(0));
        assert_eq!(graph.find_dock_lane("charger_2"), None);
        assert_eq!(graph.lanes[0].speed_limit, Some(0.5));
        assert!(graph.waypoints[1].charger);
    }

    #[test]
    fn test_graph_load_toml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("graph.toml");
        std::fs::write(
            &path,
            r#"
[[waypoints]]
name = "A"
map_name = "L1"
location = [0.0, 0.0]

[[waypoints]]
name = "B"
map_name = "L1"
location = [3.0, 4.0]

[[lanes]]
entry = { waypoint = 0, event = { type = "door_open", name = "door_1" } }
exit = { waypoint = 1 }
"#,
        )
        .unwrap();
        let graph = NavigationGraph::load(&path).unwrap();
        assert_eq!(graph.num_waypoints(), 2);
        assert_eq!(
            graph.lanes[0].entry.event,
            Some(Event::DoorOpen { name: "door_1".to_string() })
        );
    }

    #[test]
    fn test_plan_starts_on_waypoint() {
        let graph = line_graph();
        let starts = graph.plan_starts("L1", [5.05, 0.0, 0.3], chrono::Utc::now(), 0.1, 1.0);
        assert_eq!(starts.len(), 1);
        assert_eq!(starts[0].waypoint, 1);
        assert!(starts[0].lane.is_none());
        assert_eq!(starts[0].orientation, 0.3);
    }

    #[test]
    fn test_plan_starts_on_lanes() {
        let graph = line_graph();
        let starts = graph.plan_starts("L1", [2.0, 0.5, 0.0], chrono::Utc::now(), 0.1, 1.0);
        // A->B 与 B->A 都经过该位置
        let mut lanes: Vec<_> = starts.iter().filter_map(|s| s.lane).collect();
        lanes.sort();
        assert_eq!(lanes, vec![0, 1]);
        assert!(starts.iter().all(|s| s.location == Some([2.0, 0.5])));
    }

    #[test]
    fn test_plan_starts_empty_when_far_or_other_map() {
        let graph = line_graph();
        assert!(graph
            .plan_starts("L1", [2.0, 7.0, 0.0], chrono::Utc::now(), 0.1, 1.0)
            .is_empty());
        assert!(graph
            .plan_starts("L2", [0.0, 0.0, 0.0], chrono::Utc::now(), 0.1, 1.0)
            .is_empty());
    }

    #[test]
    fn test_bundled_sample_graph_loads() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("config/nav_graph.toml");
        let graph = NavigationGraph::load(path).unwrap();
        assert_eq!(graph.num_waypoints(), 4);
        assert_eq!(graph.find_dock_lane("charger_dock"), Some(4));
        assert_eq!(graph.waypoint_name(3), "charger");
    }
}
