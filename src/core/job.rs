//! 作业定义
//!
//! Job 的状态只能向前推进：PENDING -> RUNNING -> {COMPLETED | FAILED}，
//! 或 PENDING -> {CANCELLED | FAILED}（熔断拒绝时不经过 RUNNING）。

use std::fmt;
use std::future::Future;
use std::pin::Pin;

use serde::{Deserialize, Serialize};

/// 作业 ID
pub type JobId = String;

/// 作业执行结果：成功值统一为 JSON，失败为错误消息
pub type JobOutput = Result<serde_json::Value, String>;

/// 调度器持有的作业体：零参数、只调用一次的异步闭包
pub type JobWork = Box<dyn FnOnce() -> Pin<Box<dyn Future<Output = JobOutput> + Send>> + Send>;

/// 作业状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    /// 等待执行
    Pending,
    /// 正在执行
    Running,
    /// 已完成
    Completed,
    /// 执行失败
    Failed,
    /// 已取消
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled)
    }

    /// 状态机允许的下一步
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Pending, JobStatus::Running)
                | (JobStatus::Pending, JobStatus::Cancelled)
                | (JobStatus::Pending, JobStatus::Failed)
                | (JobStatus::Running, JobStatus::Completed)
                | (JobStatus::Running, JobStatus::Failed)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobStatus::Pending => write!(f, "PENDING"),
            JobStatus::Running => write!(f, "RUNNING"),
            JobStatus::Completed => write!(f, "COMPLETED"),
            JobStatus::Failed => write!(f, "FAILED"),
            JobStatus::Cancelled => write!(f, "CANCELLED"),
        }
    }
}

/// 调度选项
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobOptions {
    /// 数值越小越先启动
    pub priority: i32,
    pub name: String,
    /// 不指定时自动生成 `job_<uuid>`
    pub id: Option<JobId>,
    /// 关联的下游 agent，调度器据此咨询熔断器
    pub agent_id: Option<String>,
}

impl JobOptions {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_id(mut self, id: impl Into<JobId>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_agent(mut self, agent_id: impl Into<String>) -> Self {
        self.agent_id = Some(agent_id.into());
        self
    }
}

/// 作业快照（不含作业体）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub name: String,
    pub priority: i32,
    pub agent_id: Option<String>,
    pub status: JobStatus,
    /// 仅 COMPLETED 时有值
    pub result: Option<serde_json::Value>,
    /// 仅 FAILED 时有值
    pub error: Option<String>,
    /// 毫秒时间戳
    pub scheduled_at: i64,
    pub started_at: Option<i64>,
    pub ended_at: Option<i64>,
    /// 插入序号，优先级相同时按它排序
    pub sequence: u64,
}

impl Job {
    pub fn new(options: JobOptions, sequence: u64) -> Self {
        Self {
            id: options
                .id
                .unwrap_or_else(|| format!("job_{}", uuid::Uuid::new_v4())),
            name: options.name,
            priority: options.priority,
            agent_id: options.agent_id,
            status: JobStatus::Pending,
            result: None,
            error: None,
            scheduled_at: chrono::Utc::now().timestamp_millis(),
            started_at: None,
            ended_at: None,
            sequence,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.status.is_terminal()
    }

    /// 排序键：(priority, 插入序号)
    pub fn order_key(&self) -> (i32, u64) {
        (self.priority, self.sequence)
    }

    /// 推进状态并打时间戳；非法转换返回 false 且不改动
    pub(crate) fn transition(&mut self, next: JobStatus) -> bool {
        if !self.status.can_transition_to(next) {
            return false;
        }
        let now = chrono::Utc::now().timestamp_millis();
        match next {
            JobStatus::Running => self.started_at = Some(now),
            _ => self.ended_at = Some(now),
        }
        self.status = next;
        true
    }

    pub(crate) fn complete(&mut self, value: serde_json::Value) -> bool {
        let ok = self.transition(JobStatus::Completed);
        if ok {
            self.result = Some(value);
        }
        ok
    }

    pub(crate) fn fail(&mut self, error: impl Into<String>) -> bool {
        let ok = self.transition(JobStatus::Failed);
        if ok {
            self.error = Some(error.into());
        }
        ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_creation_defaults() {
        let job = Job::new(JobOptions::new("report").with_priority(2), 7);
        assert!(job.id.starts_with("job_"));
        assert_eq!(job.name, "report");
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.order_key(), (2, 7));
        assert!(job.result.is_none() && job.error.is_none());
        assert!(job.started_at.is_none() && job.ended_at.is_none());
    }

    #[test]
    fn test_caller_supplied_id() {
        let job = Job::new(JobOptions::new("x").with_id("custom-1").with_agent("mailer"), 0);
        assert_eq!(job.id, "custom-1");
        assert_eq!(job.agent_id.as_deref(), Some("mailer"));
    }

    #[test]
    fn test_happy_path_transitions() {
        let mut job = Job::new(JobOptions::default(), 0);
        assert!(job.transition(JobStatus::Running));
        assert!(job.started_at.is_some());
        assert!(job.complete(serde_json::json!(42)));
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.result, Some(serde_json::json!(42)));
        assert!(job.error.is_none());
        assert!(job.ended_at.is_some());
    }

    #[test]
    fn test_terminal_states_are_final() {
        let mut job = Job::new(JobOptions::default(), 0);
        assert!(job.transition(JobStatus::Cancelled));
        assert!(!job.transition(JobStatus::Running));
        assert!(!job.transition(JobStatus::Pending));
        assert!(!job.fail("late"));
        assert_eq!(job.status, JobStatus::Cancelled);
        assert!(job.error.is_none());
    }

    #[test]
    fn test_running_cannot_be_cancelled() {
        let mut job = Job::new(JobOptions::default(), 0);
        job.transition(JobStatus::Running);
        assert!(!job.transition(JobStatus::Cancelled));
        assert!(job.fail("boom"));
        assert_eq!(job.error.as_deref(), Some("boom"));
        assert!(job.result.is_none());
    }

    #[test]
    fn test_status_display() {
        assert_eq!(JobStatus::Pending.to_string(), "PENDING");
        assert_eq!(JobStatus::Cancelled.to_string(), "CANCELLED");
        assert!(JobStatus::Failed.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
    }
}
