//! 核心层：错误与恢复、调度时钟、优雅关闭

pub mod clock;
pub mod error;
pub mod recovery;
pub mod shutdown;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{FleetError, RecoveryAction};
pub use recovery::RecoveryEngine;
pub use shutdown::{
    run_with_graceful_shutdown, HoldPositionCleanup, ShutdownCleanup, ShutdownCoordinator,
    ShutdownManager, ShutdownReason,
};
