//! 机器人上下文：阶段运行所需的共享资源与单工作者内的可变状态
//!
//! 只在所属机器人的工作者内被访问；跨机器人共享的只有关闭车道集合与调度存储。

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::{CancellationToken, DropGuard};

use super::RobotEvent;
use crate::config::AdapterConfig;
use crate::core::Clock;
use crate::driver::{DeviceChannel, DriverLink};
use crate::fleet::ClosedLaneSet;
use crate::graph::NavigationGraph;
use crate::phases::{PhaseInput, PhaseState, PhaseStatus};
use crate::planning::{Plan, PlanConstraints, PlanStart, Planner};
use crate::traffic::{ScheduleParticipant, Time};

pub struct RobotContext {
    pub name: String,
    pub fleet: String,
    pub graph: Arc<NavigationGraph>,
    pub planner: Arc<dyn Planner>,
    pub itinerary: Arc<dyn ScheduleParticipant>,
    pub clock: Arc<dyn Clock>,
    pub driver: DriverLink,
    pub devices: Arc<dyn DeviceChannel>,
    pub closed_lanes: ClosedLaneSet,
    pub settings: Arc<AdapterConfig>,
    /// 当前估计的起点集合
    pub location: Vec<PlanStart>,
    pub battery_soc: Option<f64>,
    /// 紧急警报是否生效
    pub emergency: bool,
    events: mpsc::UnboundedSender<RobotEvent>,
    status: broadcast::Sender<PhaseStatus>,
    next_request: u64,
}

impl RobotContext {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: String,
        fleet: String,
        graph: Arc<NavigationGraph>,
        planner: Arc<dyn Planner>,
        itinerary: Arc<dyn ScheduleParticipant>,
        clock: Arc<dyn Clock>,
        driver: DriverLink,
        devices: Arc<dyn DeviceChannel>,
        closed_lanes: ClosedLaneSet,
        settings: Arc<AdapterConfig>,
        location: Vec<PlanStart>,
        events: mpsc::UnboundedSender<RobotEvent>,
        status: broadcast::Sender<PhaseStatus>,
    ) -> Self {
        Self {
            name,
            fleet,
            graph,
            planner,
            itinerary,
            clock,
            driver,
            devices,
            closed_lanes,
            settings,
            location,
            battery_soc: None,
            emergency: false,
            events,
            status,
            next_request: 0,
        }
    }

    pub fn now(&self) -> Time {
        self.clock.now()
    }

    /// 向设备发请求时使用的请求者 ID
    pub fn requester_id(&self) -> String {
        format!("{}/{}", self.fleet, self.name)
    }

    /// 是否有未恢复的中断；中断令牌只由 DriverLink 记录
    pub fn is_interrupted(&self) -> bool {
        self.driver.interruption_count() > 0
    }

    /// 分配一个工作者内唯一的请求 ID（计划作业、计时器）
    pub fn next_request_id(&mut self) -> u64 {
        self.next_request += 1;
        self.next_request
    }

    pub fn events_sender(&self) -> mpsc::UnboundedSender<RobotEvent> {
        self.events.clone()
    }

    pub fn subscribe_status(&self) -> broadcast::Receiver<PhaseStatus> {
        self.status.subscribe()
    }

    /// 请求重新规划；排入自身队列，避免在阶段处理中重入
    pub fn request_replan(&self) {
        let _ = self.events.send(RobotEvent::Replan);
    }

    pub fn publish(&self, state: PhaseState, status: impl Into<String>, start_time: Time, end_time: Time) {
        let status = PhaseStatus {
            robot: self.name.clone(),
            state,
            status: status.into(),
            start_time,
            end_time,
        };
        tracing::debug!(robot = %self.name, state = ?status.state, "{}", status.status);
        // 没有订阅者时发送失败是正常的
        let _ = self.status.send(status);
    }

    /// 当前规划约束
    pub fn plan_constraints(&self) -> PlanConstraints {
        PlanConstraints {
            closed_lanes: self.closed_lanes.to_set(),
            participant: Some(self.itinerary.id()),
        }
    }

    /// 周期性地向自身队列投递 `Tick(key)`；返回的守卫被丢弃时计时器停止
    pub fn start_ticker(&self, key: u64, period: Duration) -> DropGuard {
        let token = CancellationToken::new();
        let cancelled = token.clone();
        let tx = self.events.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                tokio::select! {
                    _ = cancelled.cancelled() => break,
                    _ = interval.tick() => {
                        if tx.send(RobotEvent::Phase(PhaseInput::Tick(key))).is_err() {
                            break;
                        }
                    }
                }
            }
        });
        token.drop_guard()
    }

    /// 在后台运行作业；守卫被丢弃时作业被取消
    pub fn spawn_job<F>(&self, job: F) -> DropGuard
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let token = CancellationToken::new();
        let cancelled = token.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancelled.cancelled() => {}
                _ = job => {}
            }
        });
        token.drop_guard()
    }

    /// 后台求解计划，结果以 `PlanReady { request, .. }` 投递回工作者
    pub fn spawn_plan<F>(&self, request: u64, search: F) -> DropGuard
    where
        F: Future<Output = Option<Plan>> + Send + 'static,
    {
        let tx = self.events.clone();
        self.spawn_job(async move {
            let plan = search.await;
            let _ = tx.send(RobotEvent::Phase(PhaseInput::PlanReady { request, plan }));
        })
    }
}
