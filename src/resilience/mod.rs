//! 韧性层：失败分类、诊断、重试、熔断与自愈日志

pub mod circuit_breaker;
pub mod diagnoser;
pub mod healer;
pub mod healing_log;
pub mod retry;
pub mod taxonomy;

pub use circuit_breaker::{AgentHealth, BreakerConfig, CircuitBreaker, CircuitState};
pub use diagnoser::{Diagnoser, Diagnosis, Impact};
pub use healer::{HealingReport, SelfHealer};
pub use healing_log::{HealingEvent, HealingLog, HealingSummary};
pub use retry::{RetryEngine, RetryPolicy, RetryResult};
pub use taxonomy::{classify_error, ClassifiedFailure, FailureCategory, FailureContext};
