//! JSON-lines 传输：stdin 读入控制消息，stdout 写出命令与状态
//!
//! 每行一个以 `message` 字段区分的 JSON 对象。

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

use super::FleetAdapter;
use crate::core::FleetError;
use crate::driver::{
    ClosedLanes, DeviceChannel, DoorRequest, DoorState, DriverChannel, FleetState,
    InterruptRequest, LaneRequest, LaneStatePublisher, LiftRequest, LiftState, ModeRequest,
    PathRequest, SpeedLimitRequest,
};
use crate::phases::PhaseStatus;
use crate::robot::TaskRequest;

/// 读入的消息
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "message", rename_all = "snake_case")]
pub enum Inbound {
    FleetState(FleetState),
    LaneRequest(LaneRequest),
    SpeedLimitRequest(SpeedLimitRequest),
    InterruptRequest(InterruptRequest),
    ModeRequest(ModeRequest),
    SubmitTask { robot_name: String, task: TaskRequest },
    EmergencyAlarm { on: bool },
    DoorState(DoorState),
    LiftState(LiftState),
}

impl Inbound {
    /// 交给车队适配器处理
    pub fn dispatch(self, adapter: &FleetAdapter) -> Result<(), FleetError> {
        match self {
            Inbound::FleetState(state) => adapter.handle_fleet_state(state),
            Inbound::LaneRequest(request) => adapter.handle_lane_request(request),
            Inbound::SpeedLimitRequest(request) => adapter.handle_speed_limits(request),
            Inbound::InterruptRequest(request) => adapter.handle_interrupt(request),
            Inbound::ModeRequest(request) => adapter.handle_mode_request(request),
            Inbound::SubmitTask { robot_name, task } => adapter.submit_task(&robot_name, task)?,
            Inbound::EmergencyAlarm { on } => adapter.set_emergency(on),
            Inbound::DoorState(state) => adapter.handle_door_state(state),
            Inbound::LiftState(state) => adapter.handle_lift_state(state),
        }
        Ok(())
    }
}

/// 写出的消息
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "message", rename_all = "snake_case")]
pub enum Outbound {
    PathRequest(PathRequest),
    ModeRequest(ModeRequest),
    ClosedLanes(ClosedLanes),
    DoorRequest(DoorRequest),
    LiftRequest(LiftRequest),
    Status(PhaseStatus),
}

/// 解析一行输入；空行返回 None
pub fn parse_line(line: &str) -> Result<Option<Inbound>, serde_json::Error> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    serde_json::from_str(line).map(Some)
}

/// 把驱动、设备与车道快照发布为待写出的消息
#[derive(Clone)]
pub struct JsonLinesPublisher {
    tx: mpsc::UnboundedSender<Outbound>,
}

impl JsonLinesPublisher {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn publish(&self, message: Outbound) {
        if self.tx.send(message).is_err() {
            tracing::debug!("Outbound writer closed, dropping message");
        }
    }
}

impl DriverChannel for JsonLinesPublisher {
    fn send_path(&self, request: PathRequest) {
        self.publish(Outbound::PathRequest(request));
    }

    fn send_mode(&self, request: ModeRequest) {
        self.publish(Outbound::ModeRequest(request));
    }
}

impl DeviceChannel for JsonLinesPublisher {
    fn request_door(&self, request: DoorRequest) {
        self.publish(Outbound::DoorRequest(request));
    }

    fn request_lift(&self, request: LiftRequest) {
        self.publish(Outbound::LiftRequest(request));
    }
}

impl LaneStatePublisher for JsonLinesPublisher {
    fn publish_closed_lanes(&self, lanes: ClosedLanes) {
        self.publish(Outbound::ClosedLanes(lanes));
    }
}

/// 逐行读取并分发，直到输入结束或收到关闭信号
pub async fn read_inbound<R>(
    reader: R,
    adapter: Arc<FleetAdapter>,
    shutdown: CancellationToken,
) -> std::io::Result<()>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    loop {
        let line = tokio::select! {
            _ = shutdown.cancelled() => break,
            line = lines.next_line() => line?,
        };
        let Some(line) = line else {
            tracing::info!("Inbound stream closed");
            break;
        };

        match parse_line(&line) {
            Ok(Some(message)) => {
                if let Err(e) = message.dispatch(&adapter) {
                    tracing::warn!("Rejected inbound message: {}", e);
                }
            }
            Ok(None) => {}
            Err(e) => tracing::warn!("Malformed inbound message: {}", e),
        }
    }
    Ok(())
}

/// 把状态流转成待写出的消息
pub async fn forward_status(
    mut status: broadcast::Receiver<PhaseStatus>,
    publisher: JsonLinesPublisher,
    shutdown: CancellationToken,
) {
    loop {
        let received = tokio::select! {
            _ = shutdown.cancelled() => break,
            received = status.recv() => received,
        };
        match received {
            Ok(status) => publisher.publish(Outbound::Status(status)),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "Status stream lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

/// 每条消息写成一行 JSON
pub async fn write_outbound<W>(mut rx: mpsc::UnboundedReceiver<Outbound>, mut writer: W) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(message) = rx.recv().await {
        let mut line = serde_json::to_vec(&message)?;
        line.push(b'\n');
        writer.write_all(&line).await?;
        writer.flush().await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AdapterConfig;
    use crate::fleet::FleetAdapterBuilder;
    use crate::graph::tests::line_graph;

    #[test]
    fn test_parse_lane_request_line() {
        let line = r#"{"message": "lane_request", "fleet_name": "fleet", "close_lanes": [2]}"#;
        let message = parse_line(line).unwrap().unwrap();
        assert_eq!(
            message,
            Inbound::LaneRequest(LaneRequest {
                fleet_name: "fleet".to_string(),
                open_lanes: vec![],
                close_lanes: vec![2],
            })
        );
        assert!(parse_line("   ").unwrap().is_none());
        assert!(parse_line("{\"message\": \"unknown\"}").is_err());
    }

    #[test]
    fn test_parse_submit_task_line() {
        let line = r#"{"message": "submit_task", "robot_name": "r1",
            "task": {"task_id": "t1", "phases": [{"type": "dock", "dock_name": "d"}]}}"#;
        match parse_line(line).unwrap() {
            Some(Inbound::SubmitTask { robot_name, task }) => {
                assert_eq!(robot_name, "r1");
                assert_eq!(task.phases.len(), 1);
            }
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_lane_request_round_trip_through_streams() {
        let (publisher, rx) = JsonLinesPublisher::new();
        let adapter = Arc::new(
            FleetAdapterBuilder::new(AdapterConfig::default(), line_graph(), Arc::new(publisher.clone()))
                .with_devices(Arc::new(publisher.clone()))
                .with_lane_publisher(Arc::new(publisher.clone()))
                .build(),
        );

        let input = b"{\"message\":\"lane_request\",\"fleet_name\":\"fleet\",\"close_lanes\":[3,1]}\nnot json\n";
        read_inbound(&input[..], adapter.clone(), CancellationToken::new())
            .await
            .unwrap();
        drop(adapter);
        drop(publisher);

        let mut output = Vec::new();
        write_outbound(rx, &mut output).await.unwrap();
        let text = String::from_utf8(output).unwrap();
        assert_eq!(
            text,
            "{\"message\":\"closed_lanes\",\"fleet_name\":\"fleet\",\"closed_lanes\":[1,3]}\n"
        );
    }
}
