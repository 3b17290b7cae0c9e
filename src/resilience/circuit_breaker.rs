//! 按 agent 的熔断器
//!
//! CLOSED --连续失败达到阈值--> OPEN --冷却期满后的下一次 allow()--> HALF_OPEN
//! HALF_OPEN --成功--> CLOSED；HALF_OPEN --失败--> OPEN
//!
//! OPEN -> HALF_OPEN 在 allow() 内惰性判定，没有后台计时任务。未注册的 agent 一律放行。
//! HALF_OPEN 期间只放行一次试探调用；试探超过一个冷却期仍未回报结果时，再放行下一次。

use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::config::CircuitBreakerSection;

/// 熔断状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "CLOSED"),
            CircuitState::Open => write!(f, "OPEN"),
            CircuitState::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

/// 单个 agent 的健康快照
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentHealth {
    pub agent_id: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub total_successes: u64,
    pub total_failures: u64,
    /// 毫秒时间戳
    pub last_failure_at: Option<i64>,
}

impl AgentHealth {
    fn new(agent_id: &str) -> Self {
        Self {
            agent_id: agent_id.to_string(),
            state: CircuitState::Closed,
            consecutive_failures: 0,
            consecutive_successes: 0,
            total_successes: 0,
            total_failures: 0,
            last_failure_at: None,
        }
    }
}

/// 熔断参数
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub cooldown: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self::from(&CircuitBreakerSection::default())
    }
}

impl From<&CircuitBreakerSection> for BreakerConfig {
    fn from(section: &CircuitBreakerSection) -> Self {
        Self {
            failure_threshold: section.failure_threshold.max(1),
            cooldown: Duration::from_secs(section.cooldown_secs),
        }
    }
}

struct AgentEntry {
    health: AgentHealth,
    /// 进入 OPEN 的时刻（单调时钟，用于冷却判定）
    opened_at: Option<Instant>,
    /// HALF_OPEN 下放行试探调用的时刻
    trial_started_at: Option<Instant>,
}

impl AgentEntry {
    fn new(agent_id: &str) -> Self {
        Self {
            health: AgentHealth::new(agent_id),
            opened_at: None,
            trial_started_at: None,
        }
    }

    fn trip(&mut self, now: Instant) {
        self.health.state = CircuitState::Open;
        self.opened_at = Some(now);
        self.trial_started_at = None;
        tracing::warn!(
            agent_id = %self.health.agent_id,
            consecutive_failures = self.health.consecutive_failures,
            "circuit opened"
        );
    }
}

/// 熔断器：持有所有已注册 agent 的健康状态
pub struct CircuitBreaker {
    config: BreakerConfig,
    agents: Mutex<HashMap<String, AgentEntry>>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            agents: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_threshold(failure_threshold: u32, cooldown: Duration) -> Self {
        Self::new(BreakerConfig {
            failure_threshold: failure_threshold.max(1),
            cooldown,
        })
    }

    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    // 临界区内只做纯数据更新，锁中毒时数据仍然一致
    fn lock(&self) -> MutexGuard<'_, HashMap<String, AgentEntry>> {
        self.agents.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// 注册 agent（幂等）
    pub fn register(&self, agent_id: &str) {
        self.lock()
            .entry(agent_id.to_string())
            .or_insert_with(|| AgentEntry::new(agent_id));
    }

    /// 是否放行本次调用；冷却期满的 OPEN 在此转为 HALF_OPEN
    pub fn allow(&self, agent_id: &str) -> bool {
        let mut agents = self.lock();
        let Some(entry) = agents.get_mut(agent_id) else {
            return true;
        };

        let cooldown = self.config.cooldown;
        let state = entry.health.state;
        match state {
            CircuitState::Closed => true,
            CircuitState::HalfOpen => {
                let stale = entry
                    .trial_started_at
                    .map_or(true, |at| at.elapsed() >= cooldown);
                if stale {
                    entry.trial_started_at = Some(Instant::now());
                    tracing::info!(agent_id, "previous trial unreported, allowing another");
                }
                stale
            }
            CircuitState::Open => {
                let cooled = entry.opened_at.map_or(true, |at| at.elapsed() >= cooldown);
                if cooled {
                    entry.health.state = CircuitState::HalfOpen;
                    entry.trial_started_at = Some(Instant::now());
                    tracing::info!(agent_id, "circuit half-open, allowing trial call");
                }
                cooled
            }
        }
    }

    pub fn record_success(&self, agent_id: &str) {
        let mut agents = self.lock();
        let entry = agents
            .entry(agent_id.to_string())
            .or_insert_with(|| AgentEntry::new(agent_id));
        let health = &mut entry.health;

        health.total_successes += 1;
        match health.state {
            CircuitState::HalfOpen => {
                health.state = CircuitState::Closed;
                health.consecutive_failures = 0;
                health.consecutive_successes = 0;
                entry.opened_at = None;
                entry.trial_started_at = None;
                tracing::info!(agent_id, "circuit closed after successful trial");
            }
            CircuitState::Closed => {
                health.consecutive_failures = 0;
                health.consecutive_successes += 1;
            }
            // 熔断前放出的调用迟到的成功：只计总数，连续计数留给试探调用决定
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(&self, agent_id: &str) {
        let now = Instant::now();
        let mut agents = self.lock();
        let entry = agents
            .entry(agent_id.to_string())
            .or_insert_with(|| AgentEntry::new(agent_id));

        entry.health.total_failures += 1;
        entry.health.consecutive_failures += 1;
        entry.health.consecutive_successes = 0;
        entry.health.last_failure_at = Some(chrono::Utc::now().timestamp_millis());

        let state = entry.health.state;
        match state {
            CircuitState::HalfOpen => entry.trip(now),
            CircuitState::Closed
                if entry.health.consecutive_failures >= self.config.failure_threshold =>
            {
                entry.trip(now)
            }
            CircuitState::Closed => {}
            // 已经 OPEN：计数照常累加，冷却起点不变
            CircuitState::Open => {}
        }
    }

    /// 强制回到 CLOSED 并清零计数
    pub fn reset(&self, agent_id: &str) {
        let mut agents = self.lock();
        let entry = agents
            .entry(agent_id.to_string())
            .or_insert_with(|| AgentEntry::new(agent_id));
        entry.health = AgentHealth::new(agent_id);
        entry.opened_at = None;
        entry.trial_started_at = None;
        tracing::info!(agent_id, "circuit reset");
    }

    pub fn get_health(&self, agent_id: &str) -> Option<AgentHealth> {
        self.lock().get(agent_id).map(|e| e.health.clone())
    }

    /// 当前状态（不触发惰性转换）
    pub fn state(&self, agent_id: &str) -> Option<CircuitState> {
        self.lock().get(agent_id).map(|e| e.health.state)
    }

    pub fn agents(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.lock().keys().cloned().collect();
        ids.sort();
        ids
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(BreakerConfig::default())
    }
}
