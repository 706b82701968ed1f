//! 维护窗口开关。

use std::sync::atomic::{AtomicBool, Ordering};
use tracing::info;

/// 维护模式标志：关闭（Closed）时拒绝所有上传。
///
/// 只有状态真正变化时才记录日志，重复设置同一状态为空操作。
#[derive(Debug, Default)]
pub struct MaintenanceGate {
    closed: AtomicBool,
}

impl MaintenanceGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// 设置维护模式，返回状态是否发生了变化。
    pub fn set(&self, closed: bool) -> bool {
        let previous = self.closed.swap(closed, Ordering::AcqRel);
        if previous == closed {
            return false;
        }
        if closed {
            info!("entering maintenance mode");
        } else {
            info!("leaving maintenance mode");
        }
        true
    }
}
