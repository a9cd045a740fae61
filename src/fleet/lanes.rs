//! 车队级共享车道状态：关闭车道集合与限速覆盖
//!
//! 两者被所有机器人工作者并发读取，只通过短暂持有的锁做幂等修改。

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock};

/// 当前不可通行的车道
#[derive(Debug, Clone, Default)]
pub struct ClosedLaneSet {
    inner: Arc<RwLock<HashSet<usize>>>,
}

impl ClosedLaneSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// 先关闭再开放，返回本次新关闭的车道
    pub fn apply(&self, close: &[usize], open: &[usize]) -> HashSet<usize> {
        let mut lanes = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let mut newly_closed = HashSet::new();
        for lane in close {
            if lanes.insert(*lane) {
                newly_closed.insert(*lane);
            }
        }
        for lane in open {
            lanes.remove(lane);
            newly_closed.remove(lane);
        }
        newly_closed
    }

    pub fn contains(&self, lane: usize) -> bool {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&lane)
    }

    /// 有序快照
    pub fn snapshot(&self) -> Vec<usize> {
        let lanes = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        let mut snapshot: Vec<usize> = lanes.iter().copied().collect();
        snapshot.sort_unstable();
        snapshot
    }

    pub fn to_set(&self) -> HashSet<usize> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// 车道限速覆盖；存在时替代导航图上的限速
#[derive(Debug, Clone, Default)]
pub struct SpeedLimits {
    inner: Arc<RwLock<HashMap<usize, f64>>>,
}

impl SpeedLimits {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, lane: usize, limit: f64) {
        self.inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(lane, limit);
    }

    pub fn remove(&self, lane: usize) {
        self.inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&lane);
    }

    pub fn get(&self, lane: usize) -> Option<f64> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&lane)
            .copied()
    }
}
