//! 自愈执行器
//!
//! 把熔断、重试、诊断、自愈日志串成一条链：
//! 熔断放行 -> 重试执行 -> 回报熔断结果 -> 诊断最后一次错误 -> 追加 HealingEvent。
//! 同时实现调度器的 FailureHook，作业失败时自动诊断并落日志。

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;

use super::circuit_breaker::{BreakerConfig, CircuitBreaker};
use super::diagnoser::{Diagnoser, Diagnosis};
use super::healing_log::{HealingEvent, HealingLog, OUTCOME_BLOCKED, OUTCOME_FAILURE, OUTCOME_SUCCESS};
use super::retry::{RetryEngine, RetryPolicy, RetryResult};
use super::taxonomy::{FailureCategory, FailureContext};
use crate::config::AppConfig;
use crate::core::{FailureHook, Job};

/// 一次自愈执行的结果
#[derive(Debug, Clone)]
pub struct HealingReport<T> {
    pub retry: RetryResult<T>,
    /// 有失败时才有诊断
    pub diagnosis: Option<Diagnosis>,
    /// 熔断拒绝，work 未执行
    pub blocked: bool,
}

impl<T> HealingReport<T> {
    pub fn succeeded(&self) -> bool {
        self.retry.success
    }
}

pub struct SelfHealer {
    retry: RetryEngine,
    breaker: Arc<CircuitBreaker>,
    diagnoser: Diagnoser,
    log: Arc<HealingLog>,
}

impl SelfHealer {
    pub fn new(retry: RetryEngine, breaker: Arc<CircuitBreaker>, log: Arc<HealingLog>) -> Self {
        Self {
            retry,
            breaker,
            diagnoser: Diagnoser::new(),
            log,
        }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(
            RetryEngine::new(RetryPolicy::from(&config.retry)),
            Arc::new(CircuitBreaker::new(BreakerConfig::from(&config.circuit_breaker))),
            Arc::new(HealingLog::new()),
        )
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub fn log(&self) -> &Arc<HealingLog> {
        &self.log
    }

    /// 带熔断与重试地执行 work；首次即成功时不落日志
    pub async fn run<F, Fut, T, E>(&self, agent_id: Option<&str>, work: F) -> HealingReport<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: fmt::Display,
    {
        if let Some(agent_id) = agent_id {
            if !self.breaker.allow(agent_id) {
                let message = format!("circuit open for agent {agent_id}");
                tracing::warn!(agent_id, "call blocked by circuit breaker");
                self.log.record(
                    HealingEvent::new(FailureCategory::DependencyFailure, OUTCOME_BLOCKED)
                        .with_agent(agent_id)
                        .with_message(message.clone()),
                );
                return HealingReport {
                    retry: RetryResult {
                        success: false,
                        attempts: 0,
                        result: None,
                        errors: vec![message],
                    },
                    diagnosis: None,
                    blocked: true,
                };
            }
        }

        let retry = self.retry.execute(work).await;

        if let Some(agent_id) = agent_id {
            if retry.success {
                self.breaker.record_success(agent_id);
            } else {
                self.breaker.record_failure(agent_id);
            }
        }

        let Some(last_error) = retry.last_error() else {
            return HealingReport {
                retry,
                diagnosis: None,
                blocked: false,
            };
        };

        let context = agent_id.map(agent_context);
        let diagnosis = self.diagnoser.diagnose(last_error, context.as_ref());
        let outcome = if retry.success {
            OUTCOME_SUCCESS
        } else {
            OUTCOME_FAILURE
        };
        self.log
            .record(healing_event(&diagnosis, outcome, agent_id, last_error));

        HealingReport {
            retry,
            diagnosis: Some(diagnosis),
            blocked: false,
        }
    }
}

#[async_trait]
impl FailureHook for SelfHealer {
    async fn on_job_failed(&self, job: &Job) {
        let error = job.error.as_deref().unwrap_or("job failed");
        let mut context = job.agent_id.as_deref().map(agent_context).unwrap_or_default();
        context.insert("job_id".to_string(), job.id.clone());
        context.insert("job_name".to_string(), job.name.clone());

        let diagnosis = self.diagnoser.diagnose(error, Some(&context));
        tracing::debug!(
            job_id = %job.id,
            category = %diagnosis.error.category,
            root_cause = %diagnosis.root_cause,
            "failed job diagnosed"
        );
        self.log.record(healing_event(
            &diagnosis,
            OUTCOME_FAILURE,
            job.agent_id.as_deref(),
            error,
        ));
    }
}

fn agent_context(agent_id: &str) -> FailureContext {
    let mut context = FailureContext::new();
    context.insert("agent_id".to_string(), agent_id.to_string());
    context
}

fn healing_event(
    diagnosis: &Diagnosis,
    outcome: &str,
    agent_id: Option<&str>,
    message: &str,
) -> HealingEvent {
    let mut event = HealingEvent::new(diagnosis.error.category, outcome).with_message(message);
    if let Some(agent_id) = agent_id {
        event = event.with_agent(agent_id);
    }
    if let Some(strategy) = diagnosis.error.suggested_strategies.first() {
        event = event.with_strategy(strategy.clone());
    }
    event
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{AsyncScheduler, JobOptions};
    use crate::resilience::CircuitState;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    fn healer(threshold: u32) -> SelfHealer {
        SelfHealer::new(
            RetryEngine::new(RetryPolicy::new(2, Duration::from_millis(1))),
            Arc::new(CircuitBreaker::with_threshold(threshold, Duration::from_secs(60))),
            Arc::new(HealingLog::new()),
        )
    }

    #[tokio::test]
    async fn test_clean_success_records_nothing() {
        let healer = healer(3);
        let report = healer
            .run(Some("search"), || async { Ok::<_, String>(7) })
            .await;
        assert!(report.succeeded());
        assert_eq!(report.retry.result, Some(7));
        assert!(report.diagnosis.is_none());
        assert!(healer.log().is_empty());
        assert_eq!(healer.breaker().state("search"), Some(CircuitState::Closed));
    }

    #[tokio::test]
    async fn test_recovered_after_timeouts() {
        let healer = healer(3);
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let report = healer
            .run(Some("crawler"), move || {
                let counter = counter.clone();
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err("request timed out")
                    } else {
                        Ok("page")
                    }
                }
            })
            .await;

        assert!(report.succeeded());
        assert_eq!(report.retry.attempts, 3);
        let diagnosis = report.diagnosis.unwrap();
        assert_eq!(diagnosis.error.category, FailureCategory::Timeout);

        let events = healer.log().events();
        assert_eq!(events.len(), 1);
        assert!(events[0].is_success());
        assert_eq!(events[0].agent_id.as_deref(), Some("crawler"));
        assert_eq!(events[0].strategy.as_deref(), Some("retry with backoff"));
    }

    #[tokio::test]
    async fn test_exhausted_then_blocked() {
        let healer = healer(1);
        let calls = Arc::new(AtomicU32::new(0));

        let counter = calls.clone();
        let report = healer
            .run(Some("billing"), move || {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>("permission denied") }
            })
            .await;
        assert!(!report.succeeded());
        assert!(!report.blocked);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(
            report.diagnosis.as_ref().map(|d| d.error.category),
            Some(FailureCategory::PermissionError)
        );
        assert_eq!(healer.breaker().state("billing"), Some(CircuitState::Open));

        let counter = calls.clone();
        let report = healer
            .run(Some("billing"), move || {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Ok::<_, String>(()) }
            })
            .await;
        assert!(report.blocked);
        assert_eq!(report.retry.attempts, 0);
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        let outcomes: Vec<String> = healer.log().events().into_iter().map(|e| e.outcome).collect();
        assert_eq!(outcomes, vec![OUTCOME_FAILURE, OUTCOME_BLOCKED]);
        assert_eq!(healer.log().success_rate(), 0.0);
    }

    #[tokio::test]
    async fn test_without_agent_skips_breaker() {
        let healer = healer(1);
        let report = healer
            .run(None, || async { Err::<(), _>("disk full") })
            .await;
        assert!(!report.succeeded());
        assert!(healer.breaker().agents().is_empty());
        assert_eq!(
            healer.log().events()[0].error_category,
            FailureCategory::ResourceExhaustion
        );
    }

    #[tokio::test]
    async fn test_failure_hook_logs_failed_jobs() {
        let healer = Arc::new(healer(3));
        let scheduler = AsyncScheduler::new(2).with_failure_hook(healer.clone());
        scheduler
            .schedule_with(
                || async { Err::<(), _>("missing key: api_token in config") },
                JobOptions::new("deploy").with_agent("deployer"),
            )
            .await
            .unwrap();
        scheduler
            .schedule(|| async { Ok::<_, String>(1) }, 0, "ok")
            .await;
        scheduler.run_all().await;

        let events = healer.log().events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].error_category, FailureCategory::ConfigError);
        assert_eq!(events[0].outcome, OUTCOME_FAILURE);
        assert_eq!(events[0].agent_id.as_deref(), Some("deployer"));
    }
}
