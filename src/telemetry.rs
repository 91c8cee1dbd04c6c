//! 日志与追踪系统
//! 初始化结构化日志和指标收集

use crate::config::AppConfig;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// 初始化日志与追踪系统
pub fn init_telemetry(config: &AppConfig) {
    // 从环境变量构建过滤器
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.logging.level));

    // 根据配置选择日志格式
    let log_layer = match config.logging.format.to_lowercase().as_str() {
        "json" => tracing_subscriber::fmt::layer()
            .json()
            .with_target(false)
            .with_span_events(tracing_subscriber::fmt::format::FmtSpan::CLOSE)
            .boxed(),
        "pretty" => tracing_subscriber::fmt::layer()
            .pretty()
            .with_target(false)
            .boxed(),
        _ => tracing_subscriber::fmt::layer().with_target(false).boxed(),
    };

    // 初始化 subscriber
    tracing_subscriber::registry()
        .with(env_filter)
        .with(log_layer)
        .init();

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        level = %config.logging.level,
        format = %config.logging.format,
        "Telemetry initialized"
    );
}

/// 指标名称
pub mod metric_names {
    pub const LOGIN_SUCCESS: &str = "auth.login.success";
    pub const LOGIN_FAILURE: &str = "auth.login.failure";
    pub const LOCKOUT: &str = "auth.lockout";
    pub const WORKFLOW_TRANSITION: &str = "workflow.transition";
    pub const WORKFLOW_DENIED: &str = "workflow.denied";
    pub const SIGNATURE_INTEGRITY_FAILURE: &str = "audit.signature.integrity_failure";
    pub const SESSION_CACHE_SIZE: &str = "session.cache.size";
    pub const SESSIONS_EXPIRED: &str = "session.expired";
}

/// 初始化指标；未安装 recorder 时各宏为空操作，由宿主进程决定导出方式
pub fn init_metrics() {
    tracing::debug!(
        counters = ?[
            metric_names::LOGIN_SUCCESS,
            metric_names::LOGIN_FAILURE,
            metric_names::LOCKOUT,
            metric_names::WORKFLOW_TRANSITION,
            metric_names::WORKFLOW_DENIED,
            metric_names::SIGNATURE_INTEGRITY_FAILURE,
            metric_names::SESSIONS_EXPIRED,
        ],
        "Metrics initialized"
    );
    metrics::gauge!(metric_names::SESSION_CACHE_SIZE).set(0.0);
}
