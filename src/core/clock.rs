//! 调度时钟
//!
//! 共享调度使用的时间（可能是仿真时间），与 tokio 的墙钟计时器区分开：
//! MoveRobot 的失活检测依赖两者的差异来判断仿真是否暂停。

use std::sync::{Mutex, PoisonError};

use crate::traffic::{Duration, Time};

/// 调度时间来源
pub trait Clock: Send + Sync {
    fn now(&self) -> Time;
}

/// 系统时钟
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Time {
        chrono::Utc::now()
    }
}

/// 手动推进的时钟（测试与离线仿真用）
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<Time>,
}

impl ManualClock {
    pub fn new(start: Time) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, dt: Duration) {
        let mut now = self.now.lock().unwrap_or_else(PoisonError::into_inner);
        *now += dt;
    }

    pub fn set(&self, time: Time) {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner) = time;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Time {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
