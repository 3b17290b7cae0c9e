//! 编排核心错误类型
//!
//! 作业本身的失败不会变成 HiveError：它们以字符串形式记录在 Job 上（见 scheduler）。
//! 这里只覆盖配置、导出/导入与调度入参等「调用方错误」。

use thiserror::Error;

/// 编排核心可能返回给调用方的错误
#[derive(Error, Debug)]
pub enum HiveError {
    #[error("Config error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Invalid config: {0}")]
    InvalidConfig(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// 调用方指定的 job id 已存在
    #[error("Duplicate job id: {0}")]
    DuplicateJob(String),
}

pub type Result<T> = std::result::Result<T, HiveError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = HiveError::DuplicateJob("job_1".to_string());
        assert_eq!(err.to_string(), "Duplicate job id: job_1");

        let err = HiveError::InvalidConfig("max_concurrency must be > 0".to_string());
        assert!(err.to_string().contains("max_concurrency"));
    }

    #[test]
    fn test_error_from_json() {
        let json_err = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        let err: HiveError = json_err.into();
        assert!(matches!(err, HiveError::Json(_)));
    }
}
