//! 匀速轨迹插值
//!
//! 每段用时取平移与转向二者中较长者；用时为零的段（重复点）被跳过，
//! 因此结果可能少于两个点，调用方需要自行检查。

use super::{from_seconds, Time, Trajectory, TrajectoryPoint, VehicleTraits};

fn shortest_angle(from: f64, to: f64) -> f64 {
    let mut d = to - from;
    while d > std::f64::consts::PI {
        d -= 2.0 * std::f64::consts::PI;
    }
    while d < -std::f64::consts::PI {
        d += 2.0 * std::f64::consts::PI;
    }
    d
}

/// 两个位姿之间的行驶用时（秒）
pub fn segment_seconds(traits: &VehicleTraits, from: [f64; 3], to: [f64; 3]) -> f64 {
    let dx = to[0] - from[0];
    let dy = to[1] - from[1];
    let linear = (dx * dx + dy * dy).sqrt() / traits.linear_velocity.max(1e-6);
    let angular = shortest_angle(from[2], to[2]).abs() / traits.angular_velocity.max(1e-6);
    linear.max(angular)
}

/// 沿给定位置序列生成轨迹
pub fn positions(traits: &VehicleTraits, start: Time, positions: &[[f64; 3]]) -> Trajectory {
    let mut points: Vec<TrajectoryPoint> = Vec::with_capacity(positions.len());
    let mut time = start;
    for position in positions {
        if let Some(last) = points.last() {
            let dt = segment_seconds(traits, last.position, *position);
            if dt <= 1e-6 {
                continue;
            }
            time += from_seconds(dt);
        }
        points.push(TrajectoryPoint {
            time,
            position: *position,
        });
    }
    Trajectory::new(points)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn traits() -> VehicleTraits {
        VehicleTraits {
            linear_velocity: 1.0,
            angular_velocity: 1.0,
            ..VehicleTraits::default()
        }
    }

    #[test]
    fn test_interpolate_constant_speed() {
        let start = chrono::Utc::now();
        let trajectory = positions(&traits(), start, &[[0.0, 0.0, 0.0], [3.0, 4.0, 0.0]]);
        assert_eq!(trajectory.len(), 2);
        assert_eq!(trajectory.finish_time(), Some(start + from_seconds(5.0)));
    }

    #[test]
    fn test_interpolate_skips_duplicate_points() {
        let start = chrono::Utc::now();
        let trajectory = positions(&traits(), start, &[[1.0, 1.0, 0.0], [1.0, 1.0, 0.0]]);
        assert_eq!(trajectory.len(), 1);
    }

    #[test]
    fn test_interpolate_turn_in_place_takes_time() {
        let start = chrono::Utc::now();
        let trajectory = positions(&traits(), start, &[[0.0, 0.0, 0.0], [0.0, 0.0, 1.5]]);
        assert_eq!(trajectory.len(), 2);
        assert_eq!(trajectory.finish_time(), Some(start + from_seconds(1.5)));
    }
}
