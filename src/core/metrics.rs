//! 调度器指标
//!
//! 计数只增不减；由调度器在锁内更新，读取得到的是一致快照。

use std::time::Duration;

use serde::Serialize;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SchedulerMetrics {
    pub jobs_scheduled: u64,
    pub jobs_completed: u64,
    pub jobs_failed: u64,
    pub jobs_cancelled: u64,
    /// 所有已执行作业的累计耗时
    pub total_execution_time: Duration,
}

impl SchedulerMetrics {
    /// 已执行（完成或失败）作业的平均耗时
    pub fn average_execution_time(&self) -> Option<Duration> {
        let finished = self.jobs_completed + self.jobs_failed;
        if finished == 0 {
            return None;
        }
        u32::try_from(finished)
            .ok()
            .map(|n| self.total_execution_time / n)
    }
}
