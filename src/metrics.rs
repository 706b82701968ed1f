//! 日志告警计数与 Prometheus 指标导出。
//!
//! 计数器由 tracing layer 在每条 `WARN`/`ERROR` 日志上递增，
//! 配置了指标路径时经 HTTP 以文本格式导出。

use axum::extract::Extension;
use axum::http::header;
use axum::response::{IntoResponse, Response};
use prometheus::{Encoder, IntCounter, Opts, Registry, TextEncoder};
use std::sync::Arc;
use thiserror::Error;
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, Layer};

use crate::error::ApiError;

pub const WARNINGS_LOGGED: &str = "bsat53uploadserver_warnings_Logged";
pub const ERRORS_LOGGED: &str = "bsat53uploadserver_errors_Logged";

#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("failed to register metric: {0}")]
    Registration(#[from] prometheus::Error),
    #[error("failed to encode metrics: {0}")]
    Encoding(String),
}

/// 进程级日志计数器，使用独立的 registry。
#[derive(Clone)]
pub struct LogMetrics {
    registry: Registry,
    warnings: IntCounter,
    errors: IntCounter,
}

impl LogMetrics {
    pub fn new() -> Result<Self, MetricsError> {
        let registry = Registry::new();
        let warnings = IntCounter::with_opts(Opts::new(
            WARNINGS_LOGGED,
            "The number of warning messages logged since the process started",
        ))?;
        let errors = IntCounter::with_opts(Opts::new(
            ERRORS_LOGGED,
            "The number of error messages logged since the process started",
        ))?;
        registry.register(Box::new(warnings.clone()))?;
        registry.register(Box::new(errors.clone()))?;
        Ok(Self {
            registry,
            warnings,
            errors,
        })
    }

    /// 返回与本实例共享计数器的 tracing layer。
    pub fn layer(&self) -> LogCounterLayer {
        LogCounterLayer {
            warnings: self.warnings.clone(),
            errors: self.errors.clone(),
        }
    }

    /// 以 Prometheus 文本格式导出全部指标。
    pub fn encode_text(&self) -> Result<String, MetricsError> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(|err| MetricsError::Encoding(err.to_string()))?;
        String::from_utf8(buffer).map_err(|err| MetricsError::Encoding(err.to_string()))
    }
}

/// 按日志级别递增计数器。
pub struct LogCounterLayer {
    warnings: IntCounter,
    errors: IntCounter,
}

impl<S: Subscriber> Layer<S> for LogCounterLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        match *event.metadata().level() {
            Level::WARN => self.warnings.inc(),
            Level::ERROR => self.errors.inc(),
            _ => {}
        }
    }
}

/// `GET {metrics_url}`
pub async fn serve_metrics(
    Extension(metrics): Extension<Arc<LogMetrics>>,
) -> Result<Response, ApiError> {
    let body = metrics
        .encode_text()
        .map_err(|err| ApiError::Internal(err.to_string()))?;
    Ok((
        [(header::CONTENT_TYPE, TextEncoder::new().format_type().to_string())],
        body,
    )
        .into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_subscriber::layer::SubscriberExt;

    #[test]
    fn counts_warnings_and_errors_only() {
        let metrics = LogMetrics::new().expect("metrics");
        let subscriber = tracing_subscriber::registry().with(metrics.layer());
        tracing::subscriber::with_default(subscriber, || {
            tracing::info!("upload accepted");
            tracing::warn!("failed to restrict upload permissions");
            tracing::error!("upload failed");
            tracing::error!("upload failed again");
        });

        assert_eq!(metrics.warnings.get(), 1);
        assert_eq!(metrics.errors.get(), 2);

        let text = metrics.encode_text().expect("encode");
        assert!(text.contains(&format!("{WARNINGS_LOGGED} 1")), "{text}");
        assert!(text.contains(&format!("{ERRORS_LOGGED} 2")), "{text}");
    }

    #[test]
    fn instances_do_not_share_counters() {
        let first = LogMetrics::new().expect("metrics");
        let second = LogMetrics::new().expect("metrics");
        first.warnings.inc();
        assert_eq!(second.warnings.get(), 0);
    }
}
