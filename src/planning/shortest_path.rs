//! 参考规划器：按行驶时间计算最短路径（Dijkstra），跳过关闭车道。
//!
//! 不考虑其他机器人的行程；冲突由外部协商仲裁解决。

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;

use super::{Checkpoint, Goal, Plan, PlanConstraints, PlanStart, PlanWaypoint, Planner};
use crate::graph::{Event, NavigationGraph};
use crate::traffic::interpolate::segment_seconds;
use crate::traffic::{from_seconds, Route, Trajectory, TrajectoryPoint, VehicleTraits};

#[derive(Debug, Clone, Copy, PartialEq)]
struct Entry {
    cost: f64,
    waypoint: usize,
}

impl Eq for Entry {}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .cost
            .partial_cmp(&self.cost)
            .unwrap_or(Ordering::Equal)
            .then_with(|| other.waypoint.cmp(&self.waypoint))
    }
}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// 最短时间规划器
pub struct ShortestPathPlanner {
    graph: Arc<NavigationGraph>,
    traits: VehicleTraits,
}

/// 单源搜索结果：每个路点的代价与前驱车道
struct Search {
    cost: Vec<f64>,
    via: Vec<Option<usize>>,
}

impl ShortestPathPlanner {
    pub fn new(graph: Arc<NavigationGraph>, traits: VehicleTraits) -> Self {
        Self { graph, traits }
    }

    fn lane_seconds(&self, lane: usize) -> f64 {
        let lane = &self.graph.lanes[lane];
        let a = self.graph.waypoints[lane.entry.waypoint].location;
        let b = self.graph.waypoints[lane.exit.waypoint].location;
        let mut seconds = segment_seconds(&self.traits, [a[0], a[1], 0.0], [b[0], b[1], 0.0]);
        if let Some(limit) = lane.speed_limit.filter(|l| *l > 0.0 && *l < self.traits.linear_velocity) {
            seconds *= self.traits.linear_velocity / limit;
        }
        seconds
    }

    fn search(&self, source: usize, closed: &HashSet<usize>) -> Search {
        let n = self.graph.num_waypoints();
        let mut cost = vec![f64::INFINITY; n];
        let mut via = vec![None; n];
        let mut heap = BinaryHeap::new();
        if source < n {
            cost[source] = 0.0;
            heap.push(Entry { cost: 0.0, waypoint: source });
        }

        while let Some(Entry { cost: c, waypoint }) = heap.pop() {
            if c > cost[waypoint] {
                continue;
            }
            for lane in self.graph.lanes_from(waypoint) {
                if closed.contains(&lane) {
                    continue;
                }
                let next = self.graph.lanes[lane].exit.waypoint;
                let candidate = c + self.lane_seconds(lane);
                if candidate < cost[next] {
                    cost[next] = candidate;
                    via[next] = Some(lane);
                    heap.push(Entry { cost: candidate, waypoint: next });
                }
            }
        }

        Search { cost, via }
    }

    /// 从起点的实际位置到起点路点的代价
    fn approach_seconds(&self, start: &PlanStart) -> f64 {
        match (start.location, self.graph.waypoint(start.waypoint)) {
            (Some(p), Some(wp)) => segment_seconds(
                &self.traits,
                [p[0], p[1], 0.0],
                [wp.location[0], wp.location[1], 0.0],
            ),
            _ => 0.0,
        }
    }

    /// 沿最短路径选择代价最小的起点，返回 (起点, 车道序列, 代价)
    fn best_route(
        &self,
        starts: &[PlanStart],
        closed: &HashSet<usize>,
        mut target: impl FnMut(&Search) -> Option<usize>,
    ) -> Option<(PlanStart, Vec<usize>, usize, f64)> {
        let mut best: Option<(PlanStart, Vec<usize>, usize, f64)> = None;
        for start in starts {
            let search = self.search(start.waypoint, closed);
            let Some(goal) = target(&search) else {
                continue;
            };
            let total = self.approach_seconds(start) + search.cost[goal];
            if !total.is_finite() {
                continue;
            }
            if best.as_ref().map(|b| total < b.3).unwrap_or(true) {
                let mut lanes = Vec::new();
                let mut cursor = goal;
                while let Some(lane) = search.via[cursor] {
                    lanes.push(lane);
                    cursor = self.graph.lanes[lane].entry.waypoint;
                }
                lanes.reverse();
                best = Some((start.clone(), lanes, goal, total));
            }
        }
        best
    }

    fn map_of(&self, waypoint: usize) -> String {
        self.graph
            .waypoint(waypoint)
            .map(|wp| wp.map_name.clone())
            .unwrap_or_default()
    }

    /// 把起点与车道序列展开成带时间的计划
    fn build_plan(
        &self,
        start: &PlanStart,
        lanes: &[usize],
        goal_orientation: Option<f64>,
        cost: f64,
    ) -> Plan {
        let mut waypoints: Vec<PlanWaypoint> = Vec::new();
        let mut maps: Vec<String> = Vec::new();

        let start_wp = &self.graph.waypoints[start.waypoint];
        let mut pose = match start.location {
            Some(p) => [p[0], p[1], start.orientation],
            None => [start_wp.location[0], start_wp.location[1], start.orientation],
        };
        let mut time = start.time;

        let first_event = |lane: Option<&usize>| -> Option<Event> {
            lane.and_then(|l| self.graph.lanes[*l].entry.event.clone())
        };

        if start.location.is_some() {
            // 机器人不在路点上：先记录当前位置，再驶向起点路点
            waypoints.push(PlanWaypoint {
                position: pose,
                time,
                graph_index: None,
                approach_lanes: Vec::new(),
                event: None,
                arrival_checkpoints: Vec::new(),
            });
            maps.push(self.map_of(start.waypoint));

            let next = [start_wp.location[0], start_wp.location[1], pose[2]];
            time += from_seconds(segment_seconds(&self.traits, pose, next));
            pose = next;
            waypoints.push(PlanWaypoint {
                position: pose,
                time,
                graph_index: Some(start.waypoint),
                approach_lanes: start.lane.into_iter().collect(),
                event: first_event(lanes.first()),
                arrival_checkpoints: Vec::new(),
            });
        } else {
            waypoints.push(PlanWaypoint {
                position: pose,
                time,
                graph_index: Some(start.waypoint),
                approach_lanes: Vec::new(),
                event: first_event(lanes.first()),
                arrival_checkpoints: Vec::new(),
            });
        }
        maps.push(self.map_of(start.waypoint));

        for (i, &lane_index) in lanes.iter().enumerate() {
            let lane = &self.graph.lanes[lane_index];
            let from = self.graph.waypoints[lane.entry.waypoint].location;
            let to = self.graph.waypoints[lane.exit.waypoint].location;
            let heading = (to[1] - from[1]).atan2(to[0] - from[0]);
            let yaw = if i + 1 == lanes.len() {
                goal_orientation.unwrap_or(heading)
            } else {
                heading
            };
            let next = [to[0], to[1], yaw];
            let mut dt = segment_seconds(&self.traits, pose, next);
            if let Some(limit) = lane.speed_limit.filter(|l| *l > 0.0 && *l < self.traits.linear_velocity) {
                dt *= self.traits.linear_velocity / limit;
            }
            time += from_seconds(dt);
            pose = next;

            // 到达事件优先，其次是下一条车道的入口事件
            let event = lane
                .exit
                .event
                .clone()
                .or_else(|| first_event(lanes.get(i + 1)));
            waypoints.push(PlanWaypoint {
                position: pose,
                time,
                graph_index: Some(lane.exit.waypoint),
                approach_lanes: vec![lane_index],
                event,
                arrival_checkpoints: Vec::new(),
            });
            maps.push(self.map_of(lane.exit.waypoint));
        }

        // 按地图切分路线，检查点为 (路线, 轨迹索引)
        let mut itinerary: Vec<Route> = Vec::new();
        for (waypoint, map) in waypoints.iter_mut().zip(maps.iter()) {
            if itinerary.last().map(|r| &r.map != map).unwrap_or(true) {
                itinerary.push(Route::new(map.clone(), Trajectory::default()));
            }
            let route_id = itinerary.len() - 1;
            if let Some(route) = itinerary.last_mut() {
                waypoint.arrival_checkpoints.push(Checkpoint {
                    route_id,
                    checkpoint_id: route.trajectory.len(),
                });
                route.trajectory.points.push(TrajectoryPoint {
                    time: waypoint.time,
                    position: waypoint.position,
                });
            }
        }

        Plan {
            waypoints,
            itinerary,
            cost,
        }
    }
}

#[async_trait]
impl Planner for ShortestPathPlanner {
    fn estimate_cost(&self, starts: &[PlanStart], goal: &Goal) -> Option<f64> {
        self.best_route(starts, &HashSet::new(), |search| {
            search
                .cost
                .get(goal.waypoint)
                .filter(|c| c.is_finite())
                .map(|_| goal.waypoint)
        })
        .map(|(_, _, _, cost)| cost)
    }

    async fn plan(
        &self,
        starts: &[PlanStart],
        goal: &Goal,
        constraints: &PlanConstraints,
    ) -> Option<Plan> {
        let (start, lanes, _, cost) = self.best_route(starts, &constraints.closed_lanes, |search| {
            search
                .cost
                .get(goal.waypoint)
                .filter(|c| c.is_finite())
                .map(|_| goal.waypoint)
        })?;
        Some(self.build_plan(&start, &lanes, goal.orientation, cost))
    }

    async fn emergency_pullover(
        &self,
        starts: &[PlanStart],
        constraints: &PlanConstraints,
    ) -> Option<Plan> {
        let parking: Vec<usize> = self
            .graph
            .waypoints
            .iter()
            .enumerate()
            .filter(|(_, wp)| wp.parking_spot)
            .map(|(i, _)| i)
            .collect();

        let nearest_parking = |search: &Search| {
            parking
                .iter()
                .copied()
                .filter(|i| search.cost[*i].is_finite())
                .min_by(|a, b| {
                    search.cost[*a]
                        .partial_cmp(&search.cost[*b])
                        .unwrap_or(Ordering::Equal)
                })
        };

        if let Some((start, lanes, _, cost)) =
            self.best_route(starts, &constraints.closed_lanes, nearest_parking)
        {
            return Some(self.build_plan(&start, &lanes, None, cost));
        }

        // 没有可达的停车位时原地停车
        let start = starts.first()?;
        Some(self.build_plan(start, &[], None, 0.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::tests::line_graph;
    use crate::graph::{Lane, LaneNode, Waypoint};

    fn planner(graph: NavigationGraph) -> ShortestPathPlanner {
        ShortestPathPlanner::new(
            Arc::new(graph),
            VehicleTraits {
                linear_velocity: 1.0,
                angular_velocity: 1.0,
                ..VehicleTraits::default()
            },
        )
    }

    fn start_at(waypoint: usize) -> PlanStart {
        PlanStart::at_waypoint(chrono::Utc::now(), waypoint, 0.0)
    }

    #[tokio::test]
    async fn test_plan_along_line() {
        let planner = planner(line_graph());
        let plan = planner
            .plan(&[start_at(0)], &Goal::new(2), &PlanConstraints::default())
            .await
            .unwrap();
        let indices: Vec<_> = plan.waypoints.iter().map(|w| w.graph_index).collect();
        assert_eq!(indices, vec![Some(0), Some(1), Some(2)]);
        assert_eq!(plan.waypoints[1].approach_lanes, vec![0]);
        assert_eq!(plan.waypoints[2].approach_lanes, vec![2]);
        assert!((plan.cost - 10.0).abs() < 1e-9);
        assert_eq!(plan.itinerary.len(), 1);
        assert_eq!(plan.itinerary[0].trajectory.len(), 3);
        assert_eq!(
            plan.waypoints[2].arrival_checkpoints,
            vec![Checkpoint { route_id: 0, checkpoint_id: 2 }]
        );
    }

    #[tokio::test]
    async fn test_plan_respects_closed_lanes() {
        let planner = planner(line_graph());
        let constraints = PlanConstraints {
            closed_lanes: [2].into_iter().collect(),
            participant: None,
        };
        assert!(planner
            .plan(&[start_at(0)], &Goal::new(2), &constraints)
            .await
            .is_none());
        // 估计忽略车道关闭
        assert!(planner.estimate_cost(&[start_at(0)], &Goal::new(2)).is_some());
    }

    #[tokio::test]
    async fn test_plan_carries_lane_events() {
        let mut graph = line_graph();
        graph.lanes[2].entry.event = Some(Event::DoorOpen { name: "d1".to_string() });
        let planner = planner(graph);
        let plan = planner
            .plan(&[start_at(0)], &Goal::new(2), &PlanConstraints::default())
            .await
            .unwrap();
        assert_eq!(plan.waypoints[1].event, Some(Event::DoorOpen { name: "d1".to_string() }));
        assert!(plan.waypoints[0].event.is_none());
        assert!(plan.waypoints[2].event.is_none());
    }

    #[tokio::test]
    async fn test_plan_from_lane_start_begins_at_location() {
        let planner = planner(line_graph());
        let start = PlanStart {
            time: chrono::Utc::now(),
            waypoint: 1,
            orientation: 0.0,
            location: Some([2.0, 0.0]),
            lane: Some(0),
        };
        let plan = planner
            .plan(&[start], &Goal::new(2), &PlanConstraints::default())
            .await
            .unwrap();
        assert_eq!(plan.waypoints[0].graph_index, None);
        assert_eq!(plan.waypoints[1].graph_index, Some(1));
        assert_eq!(plan.waypoints[1].approach_lanes, vec![0]);
        assert!((plan.cost - 8.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_emergency_pullover_to_parking_or_in_place() {
        let planner_without_parking = planner(line_graph());
        let plan = planner_without_parking
            .emergency_pullover(&[start_at(1)], &PlanConstraints::default())
            .await
            .unwrap();
        assert_eq!(plan.waypoints.len(), 1);
        assert_eq!(plan.waypoints[0].graph_index, Some(1));

        let graph = NavigationGraph::new(
            vec![
                Waypoint {
                    name: Some("A".to_string()),
                    map_name: "L1".to_string(),
                    location: [0.0, 0.0],
                    parking_spot: false,
                    charger: false,
                },
                Waypoint {
                    name: Some("P".to_string()),
                    map_name: "L1".to_string(),
                    location: [2.0, 0.0],
                    parking_spot: true,
                    charger: false,
                },
            ],
            vec![Lane {
                entry: LaneNode::new(0),
                exit: LaneNode::new(1),
                speed_limit: None,
            }],
        )
        .unwrap();
        let plan = planner(graph)
            .emergency_pullover(&[start_at(0)], &PlanConstraints::default())
            .await
            .unwrap();
        assert_eq!(plan.waypoints.last().unwrap().graph_index, Some(1));
    }
}
