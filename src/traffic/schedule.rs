//! 共享调度参与者契约与内存实现
//!
//! 同一时刻只有一个"当前"计划 ID；延迟修正只对当前计划生效，
//! 被新计划取代的 MoveRobot 发来的更新会被忽略。

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use super::{
    CheckpointId, Duration, ItineraryVersion, ParticipantId, PlanId, Route, RouteId,
};

/// 共享调度中一个机器人的行程
pub trait ScheduleParticipant: Send + Sync {
    fn id(&self) -> ParticipantId;

    fn name(&self) -> &str;

    /// 分配一个新的计划 ID（单调递增）
    fn assign_plan_id(&self) -> PlanId;

    fn current_plan_id(&self) -> PlanId;

    /// 提交新行程；`plan_id` 早于当前计划时拒绝并返回 false
    fn set(&self, plan_id: PlanId, routes: Vec<Route>) -> bool;

    fn itinerary(&self) -> Vec<Route>;

    fn cumulative_delay(&self, plan_id: PlanId) -> Option<Duration>;

    /// 修改累计延迟；计划不是当前计划或变化小于 `min_change` 时不修改
    fn set_cumulative_delay(&self, plan_id: PlanId, delay: Duration, min_change: Duration)
        -> bool;

    /// 标记已经通过的检查点
    fn reached(&self, plan_id: PlanId, route: RouteId, checkpoint: CheckpointId);

    /// 每条路线已到达的最大检查点
    fn reached_checkpoints(&self) -> HashMap<RouteId, CheckpointId>;

    fn version(&self) -> ItineraryVersion;
}

#[derive(Debug)]
struct ItineraryState {
    last_assigned: PlanId,
    current_plan_id: PlanId,
    routes: Vec<Route>,
    delay: Duration,
    reached: HashMap<RouteId, CheckpointId>,
    version: ItineraryVersion,
}

impl Default for ItineraryState {
    fn default() -> Self {
        Self {
            last_assigned: 0,
            current_plan_id: 0,
            routes: Vec::new(),
            delay: Duration::zero(),
            reached: HashMap::new(),
            version: 0,
        }
    }
}

/// 行程的内存实现
#[derive(Debug)]
pub struct InMemoryItinerary {
    id: ParticipantId,
    name: String,
    state: Mutex<ItineraryState>,
}

impl InMemoryItinerary {
    pub fn new(id: ParticipantId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            state: Mutex::new(ItineraryState::default()),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, ItineraryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl ScheduleParticipant for InMemoryItinerary {
    fn id(&self) -> ParticipantId {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn assign_plan_id(&self) -> PlanId {
        let mut state = self.state();
        state.last_assigned += 1;
        state.last_assigned
    }

    fn current_plan_id(&self) -> PlanId {
        self.state().current_plan_id
    }

    fn set(&self, plan_id: PlanId, routes: Vec<Route>) -> bool {
        let mut state = self.state();
        if plan_id < state.current_plan_id {
            tracing::warn!(
                participant = %self.name,
                plan_id,
                current = state.current_plan_id,
                "Ignoring itinerary for an outdated plan"
            );
            return false;
        }
        state.current_plan_id = plan_id;
        state.last_assigned = state.last_assigned.max(plan_id);
        state.routes = routes;
        state.delay = Duration::zero();
        state.reached.clear();
        state.version += 1;
        true
    }

    fn itinerary(&self) -> Vec<Route> {
        self.state().routes.clone()
    }

    fn cumulative_delay(&self, plan_id: PlanId) -> Option<Duration> {
        let state = self.state();
        (state.current_plan_id == plan_id).then_some(state.delay)
    }

    fn set_cumulative_delay(
        &self,
        plan_id: PlanId,
        delay: Duration,
        min_change: Duration,
    ) -> bool {
        let mut state = self.state();
        if state.current_plan_id != plan_id {
            return false;
        }
        let change = delay - state.delay;
        if change < min_change && -change < min_change {
            return false;
        }
        state.delay = delay;
        state.version += 1;
        true
    }

    fn reached(&self, plan_id: PlanId, route: RouteId, checkpoint: CheckpointId) {
        let mut state = self.state();
        if state.current_plan_id != plan_id {
            return;
        }
        let entry = state.reached.entry(route).or_insert(checkpoint);
        if *entry < checkpoint {
            *entry = checkpoint;
        }
    }

    fn reached_checkpoints(&self) -> HashMap<RouteId, CheckpointId> {
        self.state().reached.clone()
    }

    fn version(&self) -> ItineraryVersion {
        self.state().version
    }
}

/// 调度数据库：为机器人注册参与者
pub trait ScheduleDatabase: Send + Sync {
    fn register(&self, name: &str) -> Arc<dyn ScheduleParticipant>;

    fn participant(&self, id: ParticipantId) -> Option<Arc<dyn ScheduleParticipant>>;
}

/// 进程内调度数据库
#[derive(Default)]
pub struct InMemorySchedule {
    participants: Mutex<Vec<Arc<InMemoryItinerary>>>,
}

impl InMemorySchedule {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ScheduleDatabase for InMemorySchedule {
    fn register(&self, name: &str) -> Arc<dyn ScheduleParticipant> {
        let mut participants = self.participants.lock().unwrap_or_else(PoisonError::into_inner);
        let id = participants.len() as ParticipantId;
        let participant = Arc::new(InMemoryItinerary::new(id, name));
        participants.push(Arc::clone(&participant));
        tracing::debug!(participant = name, id, "Registered schedule participant");
        participant
    }

    fn participant(&self, id: ParticipantId) -> Option<Arc<dyn ScheduleParticipant>> {
        let participants = self.participants.lock().unwrap_or_else(PoisonError::into_inner);
        participants
            .get(id as usize)
            .map(|p| Arc::clone(p) as Arc<dyn ScheduleParticipant>)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(v: i64) -> Duration {
        Duration::milliseconds(v)
    }

    #[test]
    fn test_itinerary_rejects_outdated_plan() {
        let itinerary = InMemoryItinerary::new(0, "r1");
        let first = itinerary.assign_plan_id();
        let second = itinerary.assign_plan_id();
        assert!(itinerary.set(second, vec![]));
        assert!(!itinerary.set(first, vec![]));
        assert_eq!(itinerary.current_plan_id(), second);
    }

    #[test]
    fn test_delay_ignored_for_stale_plan() {
        let itinerary = InMemoryItinerary::new(0, "r1");
        let old = itinerary.assign_plan_id();
        itinerary.set(old, vec![]);
        let new = itinerary.assign_plan_id();
        itinerary.set(new, vec![]);

        let version = itinerary.version();
        assert!(!itinerary.set_cumulative_delay(old, ms(5_000), ms(100)));
        assert_eq!(itinerary.cumulative_delay(new), Some(Duration::zero()));
        assert_eq!(itinerary.cumulative_delay(old), None);
        assert_eq!(itinerary.version(), version);
    }

    #[test]
    fn test_delay_min_change_threshold() {
        let itinerary = InMemoryItinerary::new(0, "r1");
        let plan = itinerary.assign_plan_id();
        itinerary.set(plan, vec![]);

        assert!(!itinerary.set_cumulative_delay(plan, ms(50), ms(100)));
        assert!(itinerary.set_cumulative_delay(plan, ms(150), ms(100)));
        assert!(!itinerary.set_cumulative_delay(plan, ms(200), ms(100)));
        assert!(itinerary.set_cumulative_delay(plan, ms(-10), ms(100)));
        assert_eq!(itinerary.cumulative_delay(plan), Some(ms(-10)));
    }

    #[test]
    fn test_reached_keeps_maximum() {
        let itinerary = InMemoryItinerary::new(0, "r1");
        let plan = itinerary.assign_plan_id();
        itinerary.set(plan, vec![]);
        itinerary.reached(plan, 0, 3);
        itinerary.reached(plan, 0, 1);
        itinerary.reached(plan + 1, 0, 9);
        assert_eq!(itinerary.reached_checkpoints().get(&0), Some(&3));
    }

    #[test]
    fn test_schedule_registers_participants() {
        let schedule = InMemorySchedule::new();
        let a = schedule.register("a");
        let b = schedule.register("b");
        assert_ne!(a.id(), b.id());
        assert_eq!(schedule.participant(b.id()).unwrap().name(), "b");
        assert!(schedule.participant(7).is_none());
    }
}
