//! 核心调度层：作业模型、生命周期事件、指标与异步调度器

pub mod error;
pub mod events;
pub mod job;
pub mod metrics;
pub mod scheduler;

pub use error::{HiveError, Result};
pub use events::{ChannelEventSink, EventSink, JobEventType, SchedulerEvent, TracingEventSink};
pub use job::{Job, JobId, JobOptions, JobStatus};
pub use metrics::SchedulerMetrics;
pub use scheduler::{AsyncScheduler, FailureHook, SchedulerConfig};
