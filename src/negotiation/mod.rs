//! 协商集成：向外部仲裁提交方案，并在批准后把方案提交到共享调度
//!
//! 仲裁通过 `FleetAdapter::negotiate` 把 `TableView` 与 `Responder` 交给机器人工作者；
//! 批准回调 `Approval::approve` 回到机器人工作者上执行，与计划执行串行化。
//! 批准携带发起应答时分配的 `NegotiationId`，阶段只执行与自己当前应答匹配的批准。

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};

use crate::config::NegotiationSection;
use crate::planning::{Goal, Plan, PlanConstraints, PlanStart, Planner};
use crate::robot::RobotEvent;
use crate::traffic::{ItineraryVersion, ParticipantId, Route};

/// 一次协商应答的 ID；批准只交给发起该应答的阶段
pub type NegotiationId = u64;

/// 协商表序列中的一项
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionedKey {
    pub participant: ParticipantId,
    pub version: ItineraryVersion,
}

/// 仲裁维护的协商表在本机器人视角下的投影
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableView {
    pub participant: ParticipantId,
    /// 嵌套协商时的父表
    pub parent_id: Option<u64>,
    pub sequence: Vec<VersionedKey>,
}

impl TableView {
    /// 表中除自己以外的参与者
    pub fn rivals(&self) -> Vec<ParticipantId> {
        self.sequence
            .iter()
            .map(|key| key.participant)
            .filter(|p| *p != self.participant)
            .collect()
    }
}

/// 仲裁提供的应答接口
pub trait Responder: Send + Sync {
    /// 提交方案；带 Approval 时仲裁批准后应调用 `approve`
    fn submit(&self, itinerary: Vec<Route>, approval: Option<Approval>);

    /// 放弃本轮协商
    fn forfeit(&self, blockers: Vec<ParticipantId>);
}

/// 方案批准句柄
pub struct Approval {
    negotiation: NegotiationId,
    plan: Plan,
    robot: mpsc::UnboundedSender<RobotEvent>,
}

impl Approval {
    pub fn new(negotiation: NegotiationId, plan: Plan, robot: mpsc::UnboundedSender<RobotEvent>) -> Self {
        Self {
            negotiation,
            plan,
            robot,
        }
    }

    pub fn negotiation(&self) -> NegotiationId {
        self.negotiation
    }

    pub fn plan(&self) -> &Plan {
        &self.plan
    }

    /// 在机器人工作者上执行方案，返回提交后的行程版本；阶段已结束时返回 None
    pub async fn approve(self) -> Option<ItineraryVersion> {
        let (reply, rx) = oneshot::channel();
        self.robot
            .send(RobotEvent::NegotiationApproved {
                negotiation: self.negotiation,
                plan: self.plan,
                reply,
            })
            .ok()?;
        rx.await.ok().flatten()
    }
}

impl std::fmt::Debug for Approval {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Approval")
            .field("negotiation", &self.negotiation)
            .field("cost", &self.plan.cost)
            .finish()
    }
}

/// 方案代价容忍度；协商嵌套越深，容忍度越大
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressEvaluator {
    pub compliant_leeway_base: f64,
    pub compliant_leeway_multiplier: f64,
    pub max_cost_threshold: f64,
}

impl ProgressEvaluator {
    pub fn new(settings: &NegotiationSection) -> Self {
        Self {
            compliant_leeway_base: settings.compliant_leeway_base,
            compliant_leeway_multiplier: settings.compliant_leeway_multiplier,
            max_cost_threshold: settings.max_cost_threshold,
        }
    }

    /// 按协商表深度放大容忍度
    pub fn for_table(settings: &NegotiationSection, table: &TableView) -> Self {
        let mut evaluator = Self::new(settings);
        if table.parent_id.is_some() && table.sequence.len() >= 2 {
            let parent = &table.sequence[table.sequence.len() - 2];
            evaluator.compliant_leeway_base *= (parent.version + 1) as f64;
        }
        evaluator
    }

    /// 代价上限：估计值乘以容忍系数，且不超过估计值加阈值
    pub fn max_cost(&self, estimate: f64) -> f64 {
        let leeway = self.compliant_leeway_base * self.compliant_leeway_multiplier;
        (estimate * leeway).min(estimate + self.max_cost_threshold)
    }

    pub fn accepts(&self, cost: f64, estimate: Option<f64>) -> bool {
        match estimate {
            Some(estimate) => cost <= self.max_cost(estimate),
            None => true,
        }
    }
}

/// 一次协商作业的输入
pub struct NegotiationJob {
    pub id: NegotiationId,
    pub planner: Arc<dyn Planner>,
    pub starts: Vec<PlanStart>,
    /// None 表示紧急靠边
    pub goal: Option<Goal>,
    pub constraints: PlanConstraints,
    pub table: TableView,
    pub evaluator: ProgressEvaluator,
    pub estimate: Option<f64>,
}

impl NegotiationJob {
    /// 求解并应答仲裁
    pub async fn run(self, responder: Arc<dyn Responder>, robot: mpsc::UnboundedSender<RobotEvent>) {
        let plan = self
            .planner
            .negotiate(&self.starts, self.goal.as_ref(), &self.constraints, &self.table)
            .await;

        match plan {
            Some(plan) if self.evaluator.accepts(plan.cost, self.estimate) => {
                tracing::debug!(cost = plan.cost, "Submitting negotiation proposal");
                responder.submit(
                    plan.itinerary.clone(),
                    Some(Approval::new(self.id, plan, robot)),
                );
            }
            Some(plan) => {
                tracing::info!(
                    cost = plan.cost,
                    max_cost = self.estimate.map(|e| self.evaluator.max_cost(e)),
                    "Negotiation proposal too costly, forfeiting"
                );
                responder.forfeit(self.table.rivals());
            }
            None => {
                tracing::info!("No negotiation proposal found, forfeiting");
                responder.forfeit(self.table.rivals());
            }
        }
    }
}
