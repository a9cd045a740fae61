//! 图邻近查询：仅用于机器人无法落到导航图上时生成诊断提示，不参与控制决策。

use super::{distance, NavigationGraph};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProximityKind {
    Waypoint,
    Lane,
}

/// 最近的图元素及距离
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Proximity {
    pub distance: f64,
    pub index: usize,
    pub kind: ProximityKind,
}

/// 点到线段的垂直距离；投影不在线段内或线段退化时返回 None
pub(crate) fn distance_to_segment(p: [f64; 2], p0: [f64; 2], p1: [f64; 2]) -> Option<f64> {
    let dp = [p[0] - p0[0], p[1] - p0[1]];
    let dp1 = [p1[0] - p0[0], p1[1] - p0[1]];
    let length = (dp1[0] * dp1[0] + dp1[1] * dp1[1]).sqrt();
    if length < 1e-8 {
        return None;
    }

    let u = (dp[0] * dp1[0] + dp[1] * dp1[1]) / length;
    if u < 0.0 || length < u {
        return None;
    }

    let offset = [dp[0] - u * dp1[0] / length, dp[1] - u * dp1[1] / length];
    Some((offset[0] * offset[0] + offset[1] * offset[1]).sqrt())
}

/// 查找同一地图上距离 (x, y) 最近的路点或车道
pub fn nearest(map_name: &str, x: f64, y: f64, graph: &NavigationGraph) -> Option<Proximity> {
    let p = [x, y];
    let mut output: Option<Proximity> = None;
    let mut consider = |candidate: Proximity| {
        if output.map(|o| candidate.distance < o.distance).unwrap_or(true) {
            output = Some(candidate);
        }
    };

    for (i, wp) in graph.waypoints.iter().enumerate() {
        if wp.map_name != map_name {
            continue;
        }
        consider(Proximity {
            distance: distance(wp.location, p),
            index: i,
            kind: ProximityKind::Waypoint,
        });
    }

    for (i, lane) in graph.lanes.iter().enumerate() {
        let wp0 = &graph.waypoints[lane.entry.waypoint];
        let wp1 = &graph.waypoints[lane.exit.waypoint];
        if wp0.map_name != map_name && wp1.map_name != map_name {
            continue;
        }
        if let Some(dist) = distance_to_segment(p, wp0.location, wp1.location) {
            consider(Proximity {
                distance: dist,
                index: i,
                kind: ProximityKind::Lane,
            });
        }
    }

    output
}

/// 生成机器人无法接入导航图时的诊断提示
pub fn off_graph_hint(map_name: &str, x: f64, y: f64, graph: &NavigationGraph) -> String {
    match nearest(map_name, x, y, graph) {
        None => format!("None of the waypoints in the graph are on a map called [{map_name}]."),
        Some(Proximity {
            distance,
            index,
            kind: ProximityKind::Lane,
        }) => {
            let lane = &graph.lanes[index];
            format!(
                "The closest lane on the navigation graph [{index}] connects waypoint [{}] to [{}] and is a distance of [{distance:.6}m] from the robot.",
                graph.waypoint_name(lane.entry.waypoint),
                graph.waypoint_name(lane.exit.waypoint),
            )
        }
        Some(Proximity {
            distance,
            index,
            kind: ProximityKind::Waypoint,
        }) => format!(
            "The closest waypoint on the navigation graph [{}] is a distance of [{distance:.6}m] from the robot.",
            graph.waypoint_name(index),
        ),
    }
}
