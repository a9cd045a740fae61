//! 机器人：每个机器人一个串行工作者
//!
//! 遥测、车道关闭、中断、计划结果、协商与任务请求都作为 `RobotEvent` 排入同一个队列，
//! 由 `RobotWorker` 依次处理，机器人内部状态因此无需加锁。

pub mod context;
pub mod worker;

use std::collections::HashSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};

use crate::driver::{InterruptRequest, RobotTelemetry};
use crate::negotiation::{NegotiationId, Responder, TableView};
use crate::phases::PhaseInput;
use crate::planning::Plan;
use crate::traffic::ItineraryVersion;

pub use context::RobotContext;
pub use worker::RobotWorker;

/// 投递给机器人工作者的事件
pub enum RobotEvent {
    Telemetry(RobotTelemetry),
    /// 新关闭的车道
    LanesClosed(HashSet<usize>),
    Interrupt(InterruptRequest),
    /// 外部动作（遥操作）完成通知
    ActionCompleted,
    Phase(PhaseInput),
    Replan,
    Negotiate {
        table: TableView,
        responder: Arc<dyn Responder>,
    },
    NegotiationApproved {
        negotiation: NegotiationId,
        plan: Plan,
        reply: oneshot::Sender<Option<ItineraryVersion>>,
    },
    EmergencyAlarm(bool),
    Submit(TaskRequest),
    /// 取消任务、原地停车并退出工作者
    Shutdown(oneshot::Sender<()>),
}

/// 由若干阶段组成的任务
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRequest {
    /// 未指定时自动生成
    #[serde(default = "new_task_id")]
    pub task_id: String,
    pub phases: Vec<PhaseRequest>,
}

fn new_task_id() -> String {
    format!("task_{}", uuid::Uuid::new_v4())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PhaseRequest {
    GoToPlace {
        /// 目标路点名称
        waypoint: String,
        #[serde(default)]
        orientation: Option<f64>,
    },
    Dock {
        dock_name: String,
    },
    PerformAction {
        category: String,
    },
}

/// 机器人工作者的发送端
#[derive(Clone)]
pub struct RobotHandle {
    name: String,
    tx: mpsc::UnboundedSender<RobotEvent>,
}

impl RobotHandle {
    pub fn new(name: impl Into<String>, tx: mpsc::UnboundedSender<RobotEvent>) -> Self {
        Self {
            name: name.into(),
            tx,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// 投递事件；工作者已退出时返回 false
    pub fn send(&self, event: RobotEvent) -> bool {
        self.tx.send(event).is_ok()
    }

    /// 让机器人原地停车并等待工作者退出
    pub async fn hold_position(&self) {
        let (done, rx) = oneshot::channel();
        if self.send(RobotEvent::Shutdown(done)) {
            let _ = rx.await;
        }
    }
}
