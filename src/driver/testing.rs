//! 单元测试共用的记录型通道

use std::sync::Mutex;

use super::messages::{
    DeviceChannel, DoorRequest, DriverChannel, LiftRequest, Location, ModeRequest, PathRequest,
    RobotMode, RobotTelemetry,
};

#[derive(Default)]
pub(crate) struct RecordingDriver {
    paths: Mutex<Vec<PathRequest>>,
    modes: Mutex<Vec<ModeRequest>>,
}

impl RecordingDriver {
    pub(crate) fn paths(&self) -> Vec<PathRequest> {
        self.paths.lock().unwrap().clone()
    }

    pub(crate) fn modes(&self) -> Vec<ModeRequest> {
        self.modes.lock().unwrap().clone()
    }
}

impl DriverChannel for RecordingDriver {
    fn send_path(&self, request: PathRequest) {
        self.paths.lock().unwrap().push(request);
    }

    fn send_mode(&self, request: ModeRequest) {
        self.modes.lock().unwrap().push(request);
    }
}

#[derive(Default)]
pub(crate) struct RecordingDevices {
    doors: Mutex<Vec<DoorRequest>>,
    lifts: Mutex<Vec<LiftRequest>>,
}

impl RecordingDevices {
    pub(crate) fn doors(&self) -> Vec<DoorRequest> {
        self.doors.lock().unwrap().clone()
    }

    pub(crate) fn lifts(&self) -> Vec<LiftRequest> {
        self.lifts.lock().unwrap().clone()
    }
}

impl DeviceChannel for RecordingDevices {
    fn request_door(&self, request: DoorRequest) {
        self.doors.lock().unwrap().push(request);
    }

    fn request_lift(&self, request: LiftRequest) {
        self.lifts.lock().unwrap().push(request);
    }
}

fn location(x: f64, y: f64) -> Location {
    Location {
        t: chrono::Utc::now(),
        x,
        y,
        yaw: 0.0,
        level_name: "L1".to_string(),
        approach_speed_limit: None,
    }
}

pub(crate) fn telemetry(
    name: &str,
    task_id: &str,
    mode: RobotMode,
    x: f64,
    y: f64,
    path: &[(f64, f64)],
) -> RobotTelemetry {
    RobotTelemetry {
        name: name.to_string(),
        task_id: task_id.to_string(),
        mode,
        battery_percent: 80.0,
        location: location(x, y),
        path: path.iter().map(|(x, y)| location(*x, *y)).collect(),
    }
}
