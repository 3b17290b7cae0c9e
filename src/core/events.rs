//! 作业生命周期事件与事件出口
//!
//! 调度器只调用 `EventSink::publish`，事件最终落到哪里（总线、日志、指标导出）由调用方决定。

use std::fmt;

use serde::Serialize;
use tokio::sync::mpsc;

use super::job::{Job, JobId};

/// 生命周期事件类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum JobEventType {
    #[serde(rename = "job.scheduled")]
    Scheduled,
    #[serde(rename = "job.started")]
    Started,
    #[serde(rename = "job.completed")]
    Completed,
    #[serde(rename = "job.failed")]
    Failed,
    #[serde(rename = "job.cancelled")]
    Cancelled,
}

impl JobEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobEventType::Scheduled => "job.scheduled",
            JobEventType::Started => "job.started",
            JobEventType::Completed => "job.completed",
            JobEventType::Failed => "job.failed",
            JobEventType::Cancelled => "job.cancelled",
        }
    }
}

impl fmt::Display for JobEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 单条生命周期事件（可序列化为 JSON 供下游消费）
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SchedulerEvent {
    pub event_type: JobEventType,
    pub job_id: JobId,
    pub data: serde_json::Value,
    /// 毫秒时间戳
    pub timestamp_ms: i64,
}

impl SchedulerEvent {
    pub fn new(event_type: JobEventType, job_id: impl Into<JobId>, data: serde_json::Value) -> Self {
        Self {
            event_type,
            job_id: job_id.into(),
            data,
            timestamp_ms: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// 根据作业快照生成事件，data 携带该阶段相关字段
    pub fn for_job(event_type: JobEventType, job: &Job) -> Self {
        let data = match event_type {
            JobEventType::Scheduled => serde_json::json!({
                "name": job.name,
                "priority": job.priority,
                "agent_id": job.agent_id,
            }),
            JobEventType::Started => serde_json::json!({
                "name": job.name,
                "started_at": job.started_at,
            }),
            JobEventType::Completed => serde_json::json!({
                "name": job.name,
                "result": job.result,
                "duration_ms": duration_ms(job),
            }),
            JobEventType::Failed => serde_json::json!({
                "name": job.name,
                "error": job.error,
                "duration_ms": duration_ms(job),
            }),
            JobEventType::Cancelled => serde_json::json!({ "name": job.name }),
        };
        Self::new(event_type, job.id.clone(), data)
    }
}

fn duration_ms(job: &Job) -> Option<i64> {
    match (job.started_at, job.ended_at) {
        (Some(start), Some(end)) => Some(end - start),
        _ => None,
    }
}

/// 事件出口
pub trait EventSink: Send + Sync {
    fn publish(&self, event: SchedulerEvent);
}

/// 通过 tokio 无界通道转发事件
#[derive(Debug, Clone)]
pub struct ChannelEventSink {
    tx: mpsc::UnboundedSender<SchedulerEvent>,
}

impl ChannelEventSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<SchedulerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl EventSink for ChannelEventSink {
    fn publish(&self, event: SchedulerEvent) {
        // 接收端已关闭时静默丢弃
        let _ = self.tx.send(event);
    }
}

/// 将事件写入 tracing 日志
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn publish(&self, event: SchedulerEvent) {
        match event.event_type {
            JobEventType::Failed => tracing::warn!(
                event_type = %event.event_type,
                job_id = %event.job_id,
                data = %event.data,
                "job event"
            ),
            _ => tracing::info!(
                event_type = %event.event_type,
                job_id = %event.job_id,
                data = %event.data,
                "job event"
            ),
        }
    }
}
