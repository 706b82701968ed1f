//! 日志初始化：支持环境变量覆盖与默认值。
//!
//! 上传成功的通知日志使用 `notification` target，可单独过滤，
//! 例如 `RUST_LOG=warn,notification=info`。

use std::fs::OpenOptions;
use std::io;
use std::path::Path;
use std::sync::Arc;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use crate::metrics::LogMetrics;

/// 初始化 tracing 日志订阅与默认过滤规则。
///
/// 指定 `log_file` 时日志同时追加写入该文件（无颜色）；
/// 提供 `metrics` 时告警与错误日志计入其计数器。
pub fn init_logging(log_file: Option<&Path>, metrics: Option<&LogMetrics>) -> io::Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let file_layer = match log_file {
        Some(path) => {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            Some(
                tracing_subscriber::fmt::layer()
                    .with_writer(Arc::new(file))
                    .with_ansi(false),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .with(file_layer)
        .with(metrics.map(LogMetrics::layer))
        .init();
    Ok(())
}
