//! 上传文件名前缀使用的时间戳令牌。

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// 单调递增的不透明整数令牌来源。
pub trait TimestampSource: Send + Sync {
    fn next_token(&self) -> u64;
}

impl<F> TimestampSource for F
where
    F: Fn() -> u64 + Send + Sync,
{
    fn next_token(&self) -> u64 {
        self()
    }
}

/// 以 Unix 纳秒为基准、严格递增的进程内时钟。
///
/// 墙钟回拨或同一纳秒内的多次调用都会在上一次的值上加一，
/// 因此令牌在进程内唯一且按到达顺序排序。
#[derive(Debug, Default)]
pub struct MonotonicClock {
    last: AtomicU64,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TimestampSource for MonotonicClock {
    fn next_token(&self) -> u64 {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| u64::try_from(d.as_nanos()).unwrap_or(u64::MAX))
            .unwrap_or_default();
        let mut previous = self.last.load(Ordering::Relaxed);
        loop {
            let next = now.max(previous.saturating_add(1));
            match self.last.compare_exchange_weak(
                previous,
                next,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return next,
                Err(actual) => previous = actual,
            }
        }
    }
}
