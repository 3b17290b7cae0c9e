//! 自愈事件日志
//!
//! 只追加、不修改、不删除。支持按类别过滤、汇总统计，以及每行一个 JSON 对象（JSONL）的导出，
//! 供外部可观测性工具采集。export_jsonl 是增量导出：每个事件只写出一次。

use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use serde::{Deserialize, Serialize};

use super::taxonomy::FailureCategory;
use crate::core::Result;

pub const OUTCOME_SUCCESS: &str = "success";
pub const OUTCOME_FAILURE: &str = "failure";
/// 熔断拒绝，未执行
pub const OUTCOME_BLOCKED: &str = "blocked";

/// 一次「分类 + 恢复」循环的记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealingEvent {
    pub event_id: String,
    pub error_category: FailureCategory,
    /// "success" / "failure" / 其它
    pub outcome: String,
    /// 毫秒时间戳
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// 采用的首要策略
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy: Option<String>,
}

impl HealingEvent {
    pub fn new(error_category: FailureCategory, outcome: impl Into<String>) -> Self {
        Self {
            event_id: format!("heal_{}", uuid::Uuid::new_v4()),
            error_category,
            outcome: outcome.into(),
            timestamp: chrono::Utc::now().timestamp_millis(),
            agent_id: None,
            message: None,
            strategy: None,
        }
    }

    pub fn success(error_category: FailureCategory) -> Self {
        Self::new(error_category, OUTCOME_SUCCESS)
    }

    pub fn failure(error_category: FailureCategory) -> Self {
        Self::new(error_category, OUTCOME_FAILURE)
    }

    pub fn with_agent(mut self, agent_id: impl Into<String>) -> Self {
        self.agent_id = Some(agent_id.into());
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_strategy(mut self, strategy: impl Into<String>) -> Self {
        self.strategy = Some(strategy.into());
        self
    }

    pub fn is_success(&self) -> bool {
        self.outcome == OUTCOME_SUCCESS
    }
}

/// 汇总统计
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealingSummary {
    pub total_events: usize,
    pub by_category: BTreeMap<FailureCategory, usize>,
    pub success_rate: f64,
}

#[derive(Debug, Default)]
struct LogState {
    events: Vec<HealingEvent>,
    /// 已通过 export_jsonl 写出的事件数
    exported: usize,
}

/// 只追加的自愈日志
#[derive(Debug, Default)]
pub struct HealingLog {
    state: Mutex<LogState>,
}

impl HealingLog {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, LogState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn record(&self, event: HealingEvent) {
        tracing::info!(
            event_id = %event.event_id,
            category = %event.error_category,
            outcome = %event.outcome,
            "healing event recorded"
        );
        self.lock().events.push(event);
    }

    pub fn len(&self) -> usize {
        self.lock().events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().events.is_empty()
    }

    /// 成功占比；空日志视为 1.0（没有记录到失败）
    pub fn success_rate(&self) -> f64 {
        success_rate(&self.lock().events)
    }

    pub fn events(&self) -> Vec<HealingEvent> {
        self.lock().events.clone()
    }

    pub fn events_by_category(&self, category: FailureCategory) -> Vec<HealingEvent> {
        self.lock()
            .events
            .iter()
            .filter(|e| e.error_category == category)
            .cloned()
            .collect()
    }

    pub fn summary(&self) -> HealingSummary {
        let state = self.lock();
        let events = &state.events;
        let mut by_category = BTreeMap::new();
        for event in events.iter() {
            *by_category.entry(event.error_category).or_insert(0) += 1;
        }
        HealingSummary {
            total_events: events.len(),
            by_category,
            success_rate: success_rate(events),
        }
    }

    /// 每行一个 HealingEvent 的 JSON
    pub fn to_jsonl(&self) -> Result<String> {
        let mut buf = Vec::new();
        self.write_jsonl(&mut buf)?;
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }

    /// 写出全部事件（快照）
    pub fn write_jsonl<W: Write>(&self, writer: W) -> Result<()> {
        write_events(&self.lock().events, writer)
    }

    /// 把上次导出之后新增的事件追加到文件（不存在则创建），返回本次写出的条数
    pub fn export_jsonl(&self, path: impl AsRef<Path>) -> Result<usize> {
        let mut state = self.lock();
        let pending = &state.events[state.exported..];
        if pending.is_empty() {
            return Ok(0);
        }
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path.as_ref())?;
        write_events(pending, std::io::BufWriter::new(file))?;
        let count = pending.len();
        let total = state.events.len();
        state.exported = total;
        Ok(count)
    }

    /// 从 JSONL 文本重建日志，空行跳过
    pub fn from_jsonl(text: &str) -> Result<Self> {
        let mut events = Vec::new();
        for line in text.lines().filter(|l| !l.trim().is_empty()) {
            events.push(serde_json::from_str(line)?);
        }
        Ok(Self {
            state: Mutex::new(LogState {
                events,
                exported: 0,
            }),
        })
    }
}

fn write_events<W: Write>(events: &[HealingEvent], mut writer: W) -> Result<()> {
    for event in events {
        serde_json::to_writer(&mut writer, event)?;
        writer.write_all(b"\n")?;
    }
    writer.flush()?;
    Ok(())
}

fn success_rate(events: &[HealingEvent]) -> f64 {
    if events.is_empty() {
        return 1.0;
    }
    let successes = events.iter().filter(|e| e.is_success()).count();
    successes as f64 / events.len() as f64
}
