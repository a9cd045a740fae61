//! 机器人工作者：串行处理一个机器人的全部事件
//!
//! 每处理一个事件后取走 `DriverLink` 的发件箱并分发给当前任务；
//! 任务结束后按到达顺序开始下一个任务。

use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::{PhaseRequest, RobotContext, RobotEvent, TaskRequest};
use crate::core::{FleetError, RecoveryAction, RecoveryEngine};
use crate::driver::DriverEvent;
use crate::negotiation::{Responder, TableView};
use crate::phases::{
    PendingDockRobot, PendingGoToPlace, PendingPerformAction, PendingPhase, PhaseInput,
    PhaseOutcome, PhaseState, TaskSequence,
};
use crate::planning::{Goal, PlanStart};

struct ActiveTask {
    id: String,
    sequence: TaskSequence,
}

pub struct RobotWorker {
    ctx: RobotContext,
    rx: mpsc::UnboundedReceiver<RobotEvent>,
    queue: VecDeque<TaskRequest>,
    task: Option<ActiveTask>,
    recovery: RecoveryEngine,
    shutdown: CancellationToken,
}

impl RobotWorker {
    pub fn new(
        ctx: RobotContext,
        rx: mpsc::UnboundedReceiver<RobotEvent>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            ctx,
            rx,
            queue: VecDeque::new(),
            task: None,
            recovery: RecoveryEngine::new(),
            shutdown,
        }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    pub async fn run(mut self) {
        tracing::info!(robot = %self.ctx.name, fleet = %self.ctx.fleet, "Robot worker started");
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    self.hold();
                    break;
                }
                event = self.rx.recv() => match event {
                    Some(RobotEvent::Shutdown(done)) => {
                        self.hold();
                        let _ = done.send(());
                        break;
                    }
                    Some(event) => {
                        self.handle(event);
                        self.dispatch_driver_events();
                    }
                    None => break,
                },
            }
        }
        tracing::info!(robot = %self.ctx.name, "Robot worker stopped");
    }

    /// 取消任务并原地停车
    fn hold(&mut self) {
        if let Some(mut task) = self.task.take() {
            task.sequence.cancel(&mut self.ctx);
        }
        self.queue.clear();
        self.ctx.driver.stop();
    }

    fn handle(&mut self, event: RobotEvent) {
        match event {
            RobotEvent::Telemetry(telemetry) => self.ctx.driver.reconcile(telemetry),
            RobotEvent::LanesClosed(lanes) => self.ctx.driver.on_lane_closures(&lanes),
            RobotEvent::Interrupt(request) => self.ctx.driver.interrupt(&request),
            RobotEvent::ActionCompleted => self.ctx.driver.complete_action(),
            RobotEvent::Phase(input) => self.with_task(|task, ctx| task.handle(ctx, &input)),
            RobotEvent::Replan => self.with_task(|task, ctx| task.replan(ctx)),
            RobotEvent::Negotiate { table, responder } => self.negotiate(table, responder),
            RobotEvent::NegotiationApproved {
                negotiation,
                plan,
                reply,
            } => {
                if self.task.is_none() {
                    let _ = reply.send(None);
                    return;
                }
                self.with_task(|task, ctx| task.approve(ctx, negotiation, plan, reply));
            }
            RobotEvent::EmergencyAlarm(on) => {
                self.ctx.emergency = on;
                self.with_task(|task, ctx| task.emergency_alarm(ctx, on));
            }
            RobotEvent::Submit(request) => {
                tracing::info!(robot = %self.ctx.name, task = %request.task_id, "Task queued");
                self.queue.push_back(request);
                self.start_next();
            }
            RobotEvent::Shutdown(done) => {
                self.hold();
                let _ = done.send(());
            }
        }
    }

    fn negotiate(&mut self, table: TableView, responder: Arc<dyn Responder>) {
        let responded = match self.task.as_mut() {
            Some(task) => task.sequence.respond(&mut self.ctx, table, responder.clone()),
            None => false,
        };
        if !responded {
            // 没有可以让步的阶段，坚持当前行程
            tracing::debug!(robot = %self.ctx.name, "Responding to negotiation with current itinerary");
            responder.submit(self.ctx.itinerary.itinerary(), None);
        }
    }

    fn with_task<F>(&mut self, f: F)
    where
        F: FnOnce(&mut TaskSequence, &mut RobotContext) -> Option<PhaseOutcome>,
    {
        let Some(task) = self.task.as_mut() else {
            return;
        };
        if let Some(outcome) = f(&mut task.sequence, &mut self.ctx) {
            if let Some(task) = self.task.take() {
                self.report(&task.id, outcome);
            }
            self.start_next();
        }
    }

    fn dispatch_driver_events(&mut self) {
        loop {
            let events = self.ctx.driver.take_events();
            if events.is_empty() {
                break;
            }
            for event in events {
                self.on_driver_event(event);
            }
        }
    }

    fn on_driver_event(&mut self, event: DriverEvent) {
        match event {
            DriverEvent::Position(position) => {
                let starts =
                    position.to_starts(&self.ctx.graph, self.ctx.now(), &self.ctx.settings.driver);
                if starts.is_empty() {
                    tracing::debug!(robot = %self.ctx.name, ?position, "Position is off the graph");
                } else {
                    self.ctx.location = starts;
                }
            }
            DriverEvent::Progress {
                command,
                path_index,
                estimate,
            } => {
                let input = PhaseInput::Progress {
                    command,
                    path_index,
                    estimate,
                };
                self.with_task(|task, ctx| task.handle(ctx, &input));
            }
            DriverEvent::PathFinished { command } => {
                self.with_task(|task, ctx| task.handle(ctx, &PhaseInput::PathFinished { command }));
            }
            DriverEvent::DockFinished { command } => {
                self.with_task(|task, ctx| task.handle(ctx, &PhaseInput::DockFinished { command }));
            }
            DriverEvent::ActionFinished { .. } => {
                self.with_task(|task, ctx| task.handle(ctx, &PhaseInput::ActionFinished));
            }
            DriverEvent::ReplanRequested => {
                let now = self.ctx.now();
                self.ctx.publish(PhaseState::Active, "Requesting replan", now, now);
                self.with_task(|task, ctx| task.replan(ctx));
            }
            DriverEvent::BatterySoc(soc) => self.ctx.battery_soc = Some(soc),
            DriverEvent::Interrupted { id, labels } => {
                // DriverLink 已登记该中断
                if self.ctx.driver.interruption_count() == 1 {
                    tracing::info!(robot = %self.ctx.name, interrupt = %id, ?labels, "Pausing robot");
                    self.with_task(|task, ctx| {
                        task.interrupt(ctx);
                        None
                    });
                    self.ctx.driver.stop();
                }
            }
            DriverEvent::Resumed { id, .. } => {
                if !self.ctx.is_interrupted() {
                    tracing::info!(robot = %self.ctx.name, interrupt = %id, "Resuming robot");
                    self.with_task(|task, ctx| task.resume(ctx));
                }
            }
        }
    }

    /// 依次开始排队的任务，直到有一个进入运行
    fn start_next(&mut self) {
        while self.task.is_none() {
            let Some(request) = self.queue.pop_front() else {
                return;
            };

            let phases = match self.build_phases(&request) {
                Ok(phases) => phases,
                Err(err) => {
                    self.report(&request.task_id, PhaseOutcome::Failed(err));
                    continue;
                }
            };

            tracing::info!(robot = %self.ctx.name, task = %request.task_id, "Beginning task");
            let mut sequence = TaskSequence::new(format!("Task [{}]", request.task_id), phases);
            match sequence.begin(&mut self.ctx) {
                None => {
                    self.task = Some(ActiveTask {
                        id: request.task_id,
                        sequence,
                    })
                }
                Some(outcome) => self.report(&request.task_id, outcome),
            }
        }
    }

    fn build_phases(&self, request: &TaskRequest) -> Result<Vec<Box<dyn PendingPhase>>, FleetError> {
        let mut starts = self.ctx.location.clone();
        let mut phases: Vec<Box<dyn PendingPhase>> = Vec::new();
        for phase in &request.phases {
            match phase {
                PhaseRequest::GoToPlace {
                    waypoint,
                    orientation,
                } => {
                    let index = self.ctx.graph.find_waypoint(waypoint).ok_or_else(|| {
                        FleetError::GraphError(format!("Unknown waypoint [{waypoint}]"))
                    })?;
                    let goal = Goal {
                        waypoint: index,
                        orientation: *orientation,
                    };
                    phases.push(Box::new(PendingGoToPlace::make_from(&self.ctx, &starts, goal)?));
                    starts = vec![PlanStart::at_waypoint(
                        self.ctx.now(),
                        index,
                        orientation.unwrap_or_default(),
                    )];
                }
                PhaseRequest::Dock { dock_name } => {
                    phases.push(Box::new(PendingDockRobot::new(dock_name.clone())));
                    if let Some(lane) = self.ctx.graph.find_dock_lane(dock_name) {
                        let exit = self.ctx.graph.lanes[lane].exit.waypoint;
                        starts = vec![PlanStart::at_waypoint(self.ctx.now(), exit, 0.0)];
                    }
                }
                PhaseRequest::PerformAction { category } => {
                    phases.push(Box::new(PendingPerformAction::new(category.clone())));
                }
            }
        }
        Ok(phases)
    }

    fn report(&self, task_id: &str, outcome: PhaseOutcome) {
        let now = self.ctx.now();
        match outcome {
            PhaseOutcome::Completed => {
                tracing::info!(robot = %self.ctx.name, task = %task_id, "Task completed");
                self.ctx.publish(
                    PhaseState::Completed,
                    format!("Task [{task_id}] completed"),
                    now,
                    now,
                );
            }
            PhaseOutcome::Failed(err) => {
                let reason = match self.recovery.handle(&err) {
                    RecoveryAction::Abort(reason) | RecoveryAction::Reject(reason) => reason,
                    action => {
                        tracing::warn!(?action, "Recovery action not applicable to a finished task");
                        err.to_string()
                    }
                };
                tracing::error!(robot = %self.ctx.name, task = %task_id, "Task failed: {}", reason);
                self.ctx.publish(
                    PhaseState::Failed,
                    format!("Task [{task_id}] failed: {reason}"),
                    now,
                    now,
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::config::AdapterConfig;
    use crate::driver::testing::telemetry;
    use crate::driver::RobotMode;
    use crate::graph::tests::line_graph;
    use crate::negotiation::{Approval, VersionedKey};
    use crate::phases::testing::harness;
    use crate::phases::PhaseStatus;
    use crate::traffic::{ParticipantId, Route, ScheduleParticipant};

    #[derive(Default)]
    struct RecordingResponder {
        submissions: Mutex<Vec<(usize, bool)>>,
        approvals: Mutex<Vec<Approval>>,
        forfeits: Mutex<Vec<Vec<ParticipantId>>>,
    }

    impl RecordingResponder {
        fn answered(&self) -> bool {
            !self.submissions.lock().unwrap().is_empty() || !self.forfeits.lock().unwrap().is_empty()
        }

        fn take_approval(&self) -> Approval {
            self.approvals.lock().unwrap().pop().unwrap()
        }
    }

    impl Responder for RecordingResponder {
        fn submit(&self, itinerary: Vec<Route>, approval: Option<Approval>) {
            self.submissions
                .lock()
                .unwrap()
                .push((itinerary.len(), approval.is_some()));
            self.approvals.lock().unwrap().extend(approval);
        }

        fn forfeit(&self, blockers: Vec<ParticipantId>) {
            self.forfeits.lock().unwrap().push(blockers);
        }
    }

    fn go_to(task_id: &str, waypoint: &str) -> RobotEvent {
        RobotEvent::Submit(TaskRequest {
            task_id: task_id.to_string(),
            phases: vec![PhaseRequest::GoToPlace {
                waypoint: waypoint.to_string(),
                orientation: None,
            }],
        })
    }

    async fn wait_for_paths(driver: &crate::driver::testing::RecordingDriver, count: usize) {
        while driver.paths().len() < count {
            tokio::task::yield_now().await;
        }
    }

    /// 发起协商并等待应答
    async fn negotiate(tx: &mpsc::UnboundedSender<RobotEvent>) -> Arc<RecordingResponder> {
        let responder = Arc::new(RecordingResponder::default());
        tx.send(RobotEvent::Negotiate {
            table: table(),
            responder: responder.clone(),
        })
        .ok();
        while !responder.answered() {
            tokio::task::yield_now().await;
        }
        responder
    }

    async fn settle_worker() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    fn interrupt(id: &str, kind: crate::driver::InterruptKind) -> RobotEvent {
        RobotEvent::Interrupt(crate::driver::InterruptRequest {
            fleet_name: "fleet".to_string(),
            robot_name: "r1".to_string(),
            interrupt_id: id.to_string(),
            labels: vec![],
            kind,
        })
    }

    fn table() -> TableView {
        TableView {
            participant: 0,
            parent_id: None,
            sequence: vec![
                VersionedKey {
                    participant: 1,
                    version: 0,
                },
                VersionedKey {
                    participant: 0,
                    version: 0,
                },
            ],
        }
    }

    async fn next_status(rx: &mut tokio::sync::broadcast::Receiver<PhaseStatus>, state: PhaseState) -> PhaseStatus {
        loop {
            let status = rx.recv().await.unwrap();
            if status.state == state {
                return status;
            }
        }
    }

    #[tokio::test]
    async fn test_idle_robot_negotiates_stubbornly() {
        let h = harness(line_graph(), AdapterConfig::default());
        let tx = h.ctx.events_sender();
        let handle = RobotWorker::new(h.ctx, h.rx, CancellationToken::new()).spawn();

        let responder = Arc::new(RecordingResponder::default());
        tx.send(RobotEvent::Negotiate {
            table: table(),
            responder: responder.clone(),
        })
        .ok();
        let (done, rx) = tokio::sync::oneshot::channel();
        tx.send(RobotEvent::Shutdown(done)).ok();
        rx.await.unwrap();
        handle.await.unwrap();

        assert_eq!(*responder.submissions.lock().unwrap(), vec![(0, false)]);
        assert!(responder.forfeits.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_waypoint_fails_task() {
        let mut h = harness(line_graph(), AdapterConfig::default());
        let tx = h.ctx.events_sender();
        let _worker = RobotWorker::new(h.ctx, h.rx, CancellationToken::new()).spawn();

        tx.send(RobotEvent::Submit(TaskRequest {
            task_id: "t1".to_string(),
            phases: vec![PhaseRequest::GoToPlace {
                waypoint: "Z".to_string(),
                orientation: None,
            }],
        }))
        .ok();

        let status = next_status(&mut h.status, PhaseState::Failed).await;
        assert_eq!(status.status, "Task [t1] failed: Graph error: Unknown waypoint [Z]");
    }

    #[tokio::test]
    async fn test_task_runs_to_completion() {
        let mut h = harness(line_graph(), AdapterConfig::default());
        let tx = h.ctx.events_sender();
        let driver = h.driver.clone();
        let _worker = RobotWorker::new(h.ctx, h.rx, CancellationToken::new()).spawn();

        tx.send(RobotEvent::Submit(TaskRequest {
            task_id: "t1".to_string(),
            phases: vec![PhaseRequest::GoToPlace {
                waypoint: "C".to_string(),
                orientation: None,
            }],
        }))
        .ok();

        // 等待计划下发
        while driver.paths().is_empty() {
            tokio::task::yield_now().await;
        }
        let command = driver.paths()[0].task_id.clone();
        tx.send(RobotEvent::Telemetry(telemetry(
            "r1",
            &command,
            RobotMode::Moving,
            10.0,
            0.0,
            &[],
        )))
        .ok();

        let status = next_status(&mut h.status, PhaseState::Completed).await;
        assert_eq!(status.robot, "r1");
        let status = loop {
            let status = next_status(&mut h.status, PhaseState::Completed).await;
            if status.status.starts_with("Task") {
                break status;
            }
        };
        assert_eq!(status.status, "Task [t1] completed");
    }

    #[tokio::test]
    async fn test_interrupt_holds_robot_and_resume_replans() {
        let h = harness(line_graph(), AdapterConfig::default());
        let tx = h.ctx.events_sender();
        let driver = h.driver.clone();
        let _worker = RobotWorker::new(h.ctx, h.rx, CancellationToken::new()).spawn();

        tx.send(RobotEvent::Telemetry(telemetry("r1", "", RobotMode::Idle, 0.0, 0.0, &[])))
            .ok();
        tx.send(RobotEvent::Submit(TaskRequest {
            task_id: "t1".to_string(),
            phases: vec![PhaseRequest::GoToPlace {
                waypoint: "C".to_string(),
                orientation: None,
            }],
        }))
        .ok();
        while driver.paths().is_empty() {
            tokio::task::yield_now().await;
        }

        let interrupt = |kind| crate::driver::InterruptRequest {
            fleet_name: "fleet".to_string(),
            robot_name: "r1".to_string(),
            interrupt_id: "i1".to_string(),
            labels: vec![],
            kind,
        };
        tx.send(RobotEvent::Interrupt(interrupt(crate::driver::InterruptKind::Interrupt)))
            .ok();
        while driver.paths().len() < 2 {
            tokio::task::yield_now().await;
        }
        // 原地停车：只含当前位置的路径
        assert_eq!(driver.paths()[1].path.len(), 1);

        tx.send(RobotEvent::Interrupt(interrupt(crate::driver::InterruptKind::Resume)))
            .ok();
        while driver.paths().len() < 3 {
            tokio::task::yield_now().await;
        }
        assert_eq!(driver.paths()[2].path.len(), 3);
    }
    #[tokio::test]
    async fn test_active_task_submits_proposal_with_approval() {
        let h = harness(line_graph(), AdapterConfig::default());
        let tx = h.ctx.events_sender();
        let driver = h.driver.clone();
        let _worker = RobotWorker::new(h.ctx, h.rx, CancellationToken::new()).spawn();

        tx.send(go_to("t1", "C")).ok();
        wait_for_paths(&driver, 1).await;

        let responder = negotiate(&tx).await;
        assert_eq!(*responder.submissions.lock().unwrap(), vec![(1, true)]);
        assert!(responder.forfeits.lock().unwrap().is_empty());
        assert_eq!(responder.take_approval().plan().waypoints.len(), 3);
    }

    #[tokio::test]
    async fn test_costly_proposal_forfeits_to_rivals() {
        let mut config = AdapterConfig::default();
        config.negotiation.compliant_leeway_base = 0.1;
        config.negotiation.compliant_leeway_multiplier = 1.0;
        let h = harness(line_graph(), config);
        let tx = h.ctx.events_sender();
        let driver = h.driver.clone();
        let _worker = RobotWorker::new(h.ctx, h.rx, CancellationToken::new()).spawn();

        tx.send(go_to("t1", "C")).ok();
        wait_for_paths(&driver, 1).await;

        let responder = negotiate(&tx).await;
        assert!(responder.submissions.lock().unwrap().is_empty());
        assert_eq!(*responder.forfeits.lock().unwrap(), vec![vec![1]]);
    }

    #[tokio::test]
    async fn test_alarm_proposes_emergency_pullover() {
        let h = harness(line_graph(), AdapterConfig::default());
        let tx = h.ctx.events_sender();
        let driver = h.driver.clone();
        let _worker = RobotWorker::new(h.ctx, h.rx, CancellationToken::new()).spawn();

        tx.send(go_to("t1", "C")).ok();
        wait_for_paths(&driver, 1).await;
        tx.send(RobotEvent::EmergencyAlarm(true)).ok();
        wait_for_paths(&driver, 2).await;

        let responder = negotiate(&tx).await;
        assert!(responder.forfeits.lock().unwrap().is_empty());
        // 没有停车位：原地靠边
        assert_eq!(responder.take_approval().plan().waypoints.len(), 1);
    }

    #[tokio::test]
    async fn test_approval_round_trips_through_worker() {
        let h = harness(line_graph(), AdapterConfig::default());
        let tx = h.ctx.events_sender();
        let driver = h.driver.clone();
        let itinerary = h.itinerary.clone();
        let _worker = RobotWorker::new(h.ctx, h.rx, CancellationToken::new()).spawn();

        tx.send(go_to("t1", "C")).ok();
        wait_for_paths(&driver, 1).await;
        let before = itinerary.version();

        let approval = negotiate(&tx).await.take_approval();
        let version = approval.approve().await;
        assert_eq!(version, Some(itinerary.version()));
        assert!(itinerary.version() > before);
        assert_eq!(driver.paths().len(), 2);
    }

    #[tokio::test]
    async fn test_approval_after_task_finished_is_rejected() {
        let mut h = harness(line_graph(), AdapterConfig::default());
        let tx = h.ctx.events_sender();
        let driver = h.driver.clone();
        let _worker = RobotWorker::new(h.ctx, h.rx, CancellationToken::new()).spawn();

        tx.send(go_to("t1", "C")).ok();
        wait_for_paths(&driver, 1).await;
        let approval = negotiate(&tx).await.take_approval();

        let command = driver.paths()[0].task_id.clone();
        tx.send(RobotEvent::Telemetry(telemetry("r1", &command, RobotMode::Moving, 10.0, 0.0, &[])))
            .ok();
        loop {
            let status = next_status(&mut h.status, PhaseState::Completed).await;
            if status.status == "Task [t1] completed" {
                break;
            }
        }

        // 下一个任务不接受上一个任务的方案
        tx.send(go_to("t2", "A")).ok();
        wait_for_paths(&driver, 2).await;
        assert_eq!(approval.approve().await, None);
        settle_worker().await;
        assert_eq!(driver.paths().len(), 2);
    }

    #[tokio::test]
    async fn test_interrupted_robot_rejects_approval() {
        let h = harness(line_graph(), AdapterConfig::default());
        let tx = h.ctx.events_sender();
        let driver = h.driver.clone();
        let _worker = RobotWorker::new(h.ctx, h.rx, CancellationToken::new()).spawn();

        tx.send(RobotEvent::Telemetry(telemetry("r1", "", RobotMode::Idle, 0.0, 0.0, &[])))
            .ok();
        tx.send(go_to("t1", "C")).ok();
        wait_for_paths(&driver, 1).await;
        let approval = negotiate(&tx).await.take_approval();

        tx.send(interrupt("i1", crate::driver::InterruptKind::Interrupt)).ok();
        wait_for_paths(&driver, 2).await;
        assert_eq!(approval.approve().await, None);

        // 中断期间坚持当前行程，不给出可批准的方案
        let responder = negotiate(&tx).await;
        assert!(!responder.submissions.lock().unwrap()[0].1);
        settle_worker().await;
        assert_eq!(driver.paths().len(), 2);
    }

    #[tokio::test]
    async fn test_resume_waits_for_every_interruption() {
        let h = harness(line_graph(), AdapterConfig::default());
        let tx = h.ctx.events_sender();
        let driver = h.driver.clone();
        let _worker = RobotWorker::new(h.ctx, h.rx, CancellationToken::new()).spawn();

        tx.send(RobotEvent::Telemetry(telemetry("r1", "", RobotMode::Idle, 0.0, 0.0, &[])))
            .ok();
        tx.send(go_to("t1", "C")).ok();
        wait_for_paths(&driver, 1).await;

        tx.send(interrupt("i1", crate::driver::InterruptKind::Interrupt)).ok();
        wait_for_paths(&driver, 2).await;
        // 第二个中断不再重复停车
        tx.send(interrupt("i2", crate::driver::InterruptKind::Interrupt)).ok();
        tx.send(interrupt("i1", crate::driver::InterruptKind::Resume)).ok();
        settle_worker().await;
        assert_eq!(driver.paths().len(), 2);

        tx.send(interrupt("i2", crate::driver::InterruptKind::Resume)).ok();
        wait_for_paths(&driver, 3).await;
        assert_eq!(driver.paths()[2].path.len(), 3);
    }
}
