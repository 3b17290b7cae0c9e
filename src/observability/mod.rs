//! 可观测性：tracing 订阅器初始化
//!
//! 默认 info 级别，可通过 RUST_LOG 覆盖；重复调用为 no-op。

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::LogFormat;

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

/// 人类可读格式
pub fn init() {
    init_with_format(LogFormat::Pretty);
}

/// 按配置选择 pretty / JSON 行输出
pub fn init_with_format(format: LogFormat) {
    let registry = tracing_subscriber::registry().with(env_filter());
    let _ = match format {
        LogFormat::Pretty => registry.with(fmt::layer()).try_init(),
        LogFormat::Json => registry
            .with(fmt::layer().json().with_target(false))
            .try_init(),
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_twice_is_noop() {
        init_with_format(LogFormat::Json);
        init();
        tracing::info!("observability initialized");
    }
}
