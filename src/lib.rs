//! Hive - 具备自愈能力的异步作业编排核心
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 作业模型、生命周期事件、指标与有界并发调度器
//! - **observability**: tracing 日志初始化
//! - **resilience**: 失败分类、诊断、重试、按 agent 熔断、自愈日志

pub mod config;
pub mod core;
pub mod observability;
pub mod resilience;

pub use crate::core::{AsyncScheduler, HiveError, Job, JobOptions, JobStatus, Result};
pub use crate::resilience::{CircuitBreaker, HealingLog, RetryEngine, SelfHealer};
