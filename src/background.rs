//! 维护窗口与密钥重载的定时任务。

use chrono::{DateTime, Duration as ChronoDuration, NaiveTime, Utc};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

use crate::api::UploadApi;
use crate::config::ServerConfig;

/// 每天固定的 UTC 时刻（`HH:MM` 或 `HH:MM:SS`）。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DailySchedule {
    time: NaiveTime,
}

impl DailySchedule {
    pub fn new(time: NaiveTime) -> Self {
        Self { time }
    }

    /// 严格晚于 `now` 的下一次触发时刻。
    pub fn next_after(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let today = now.date_naive().and_time(self.time).and_utc();
        if today > now {
            today
        } else {
            today + ChronoDuration::days(1)
        }
    }

    /// 距离下一次触发的时长。
    pub fn delay_from(&self, now: DateTime<Utc>) -> Duration {
        (self.next_after(now) - now).to_std().unwrap_or_default()
    }
}

impl FromStr for DailySchedule {
    type Err = chrono::ParseError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let value = value.trim();
        NaiveTime::parse_from_str(value, "%H:%M:%S")
            .or_else(|_| NaiveTime::parse_from_str(value, "%H:%M"))
            .map(Self::new)
    }
}

impl fmt::Display for DailySchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.time.format("%H:%M:%S"))
    }
}

/// 判断 `now` 是否落在 `[start, end)` 维护窗口内（支持跨越午夜）。
pub fn within_window(start: DailySchedule, end: DailySchedule, now: DateTime<Utc>) -> bool {
    let t = now.time();
    if start.time <= end.time {
        start.time <= t && t < end.time
    } else {
        t >= start.time || t < end.time
    }
}

/// 启动时根据当前时刻确定维护开关的初始状态。
pub fn apply_initial_window(api: &UploadApi, config: &ServerConfig, now: DateTime<Utc>) {
    if let (Some(start), Some(end)) = (config.maintenance_start, config.maintenance_end)
        && within_window(start, end, now)
    {
        info!(%start, %end, "starting inside maintenance window");
        api.set_maintenance_mode(true);
    }
}

/// 启动后台任务（维护窗口开始/结束与密钥重载）。
pub fn spawn_background_tasks(api: Arc<UploadApi>, config: &ServerConfig) {
    if let Some(schedule) = config.maintenance_start {
        let api = api.clone();
        info!(%schedule, "scheduling maintenance window start");
        spawn_daily(schedule, move || {
            let api = api.clone();
            async move {
                api.set_maintenance_mode(true);
            }
        });
    }

    if let Some(schedule) = config.maintenance_end {
        let api = api.clone();
        info!(%schedule, "scheduling maintenance window end");
        spawn_daily(schedule, move || {
            let api = api.clone();
            async move {
                api.set_maintenance_mode(false);
            }
        });
    }

    if let Some(schedule) = config.reload_key {
        info!(%schedule, "scheduling otp key reload");
        spawn_daily(schedule, move || {
            let api = api.clone();
            async move {
                if let Err(err) = api.reload_key().await {
                    error!(error = %err, "scheduled otp key reload failed, keeping previous key");
                }
            }
        });
    }
}

fn spawn_daily<F, Fut>(schedule: DailySchedule, mut job: F)
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(schedule.delay_from(Utc::now())).await;
            job().await;
        }
    });
}
