//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `HIVE__*` 覆盖（双下划线表示嵌套，如 `HIVE__SCHEDULER__MAX_CONCURRENCY=8`）。

use std::path::PathBuf;

use serde::Deserialize;

use crate::core::{HiveError, Result};

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    #[serde(default)]
    pub scheduler: SchedulerSection,
    #[serde(default)]
    pub retry: RetrySection,
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerSection,
    #[serde(default)]
    pub healing: HealingSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

/// [scheduler] 段：并发上限
#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerSection {
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
}

fn default_max_concurrency() -> usize {
    4
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
        }
    }
}

/// [retry] 段：重试次数与退避
#[derive(Debug, Clone, Deserialize)]
pub struct RetrySection {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// 单次退避上限
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default)]
    pub jitter: bool,
}

fn default_max_retries() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    100
}

fn default_max_delay_ms() -> u64 {
    10_000
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            jitter: false,
        }
    }
}

/// [circuit_breaker] 段：连续失败阈值与冷却时间
#[derive(Debug, Clone, Deserialize)]
pub struct CircuitBreakerSection {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
}

fn default_failure_threshold() -> u32 {
    3
}

fn default_cooldown_secs() -> u64 {
    60
}

impl Default for CircuitBreakerSection {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            cooldown_secs: default_cooldown_secs(),
        }
    }
}

/// [healing] 段：自愈日志导出位置（JSONL），未设置则不导出
#[derive(Debug, Clone, Deserialize, Default)]
pub struct HealingSection {
    pub export_path: Option<PathBuf>,
}

/// [logging] 段
#[derive(Debug, Clone, Deserialize, Default)]
pub struct LoggingSection {
    #[serde(default)]
    pub format: LogFormat,
}

/// 日志输出格式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl AppConfig {
    /// 拒绝会让调度或熔断失去意义的取值
    pub fn validate(&self) -> Result<()> {
        if self.scheduler.max_concurrency == 0 {
            return Err(HiveError::InvalidConfig(
                "scheduler.max_concurrency must be greater than 0".to_string(),
            ));
        }
        if self.circuit_breaker.failure_threshold == 0 {
            return Err(HiveError::InvalidConfig(
                "circuit_breaker.failure_threshold must be greater than 0".to_string(),
            ));
        }
        if self.retry.max_delay_ms < self.retry.base_delay_ms {
            return Err(HiveError::InvalidConfig(
                "retry.max_delay_ms must not be smaller than retry.base_delay_ms".to_string(),
            ));
        }
        Ok(())
    }
}

/// 从 config 目录加载配置，环境变量 HIVE__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 HIVE__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("HIVE")
            .separator("__")
            .try_parsing(true),
    );

    let cfg: AppConfig = builder.build()?.try_deserialize()?;
    cfg.validate()?;
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.scheduler.max_concurrency, 4);
        assert_eq!(cfg.retry.max_retries, 3);
        assert_eq!(cfg.circuit_breaker.failure_threshold, 3);
        assert_eq!(cfg.circuit_breaker.cooldown_secs, 60);
        assert_eq!(cfg.logging.format, LogFormat::Pretty);
        assert!(cfg.healing.export_path.is_none());
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_concurrency() {
        let mut cfg = AppConfig::default();
        cfg.scheduler.max_concurrency = 0;
        assert!(matches!(cfg.validate(), Err(HiveError::InvalidConfig(_))));
    }

    #[test]
    fn test_validate_rejects_zero_threshold() {
        let mut cfg = AppConfig::default();
        cfg.circuit_breaker.failure_threshold = 0;
        assert!(matches!(cfg.validate(), Err(HiveError::InvalidConfig(_))));
    }

    #[test]
    fn test_load_from_explicit_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "[scheduler]\nmax_concurrency = 2\n\n[circuit_breaker]\nfailure_threshold = 5\ncooldown_secs = 10\n\n[logging]\nformat = \"json\""
        )
        .unwrap();

        let cfg = load_config(Some(file.path().to_path_buf())).unwrap();
        assert_eq!(cfg.scheduler.max_concurrency, 2);
        assert_eq!(cfg.circuit_breaker.failure_threshold, 5);
        assert_eq!(cfg.circuit_breaker.cooldown_secs, 10);
        assert_eq!(cfg.logging.format, LogFormat::Json);
        // 未出现的段保持默认
        assert_eq!(cfg.retry.base_delay_ms, 100);
    }
}
