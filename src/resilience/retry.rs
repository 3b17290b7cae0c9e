//! 重试引擎
//!
//! 最多执行 `max_retries + 1` 次，失败之间按指数退避休眠：
//! delay(k) = min(base_delay * 2^(k-1), max_delay)，k 为已失败次数（从 1 开始）。
//! 引擎本身无状态，并发调用互不共享退避进度。

use std::fmt;
use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde::Serialize;

use crate::config::RetrySection;

/// 重试策略
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// 在退避上叠加 0..=delay/2 的随机抖动
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetrySection::default())
    }
}

impl From<&RetrySection> for RetryPolicy {
    fn from(section: &RetrySection) -> Self {
        Self {
            max_retries: section.max_retries,
            base_delay: Duration::from_millis(section.base_delay_ms),
            max_delay: Duration::from_millis(section.max_delay_ms),
            jitter: section.jitter,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            max_delay: Duration::MAX,
            jitter: false,
        }
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// 第 `failures` 次失败后的退避（不含抖动）
    pub fn delay_for_attempt(&self, failures: u32) -> Duration {
        let exp = failures.saturating_sub(1).min(31);
        self.base_delay
            .checked_mul(1u32 << exp)
            .unwrap_or(Duration::MAX)
            .min(self.max_delay)
    }

    fn backoff(&self, failures: u32) -> Duration {
        let delay = self.delay_for_attempt(failures);
        if !self.jitter {
            return delay;
        }
        let half = (delay.as_millis() / 2) as u64;
        if half == 0 {
            return delay;
        }
        let noise = rand::thread_rng().gen_range(0..=half);
        delay.saturating_add(Duration::from_millis(noise))
    }
}

/// 一次重试执行的结果
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetryResult<T> {
    pub success: bool,
    pub attempts: u32,
    pub result: Option<T>,
    /// 每次失败的错误消息，按发生顺序
    pub errors: Vec<String>,
}

impl<T> RetryResult<T> {
    pub fn last_error(&self) -> Option<&str> {
        self.errors.last().map(String::as_str)
    }

    /// 成功但经历过失败
    pub fn recovered(&self) -> bool {
        self.success && !self.errors.is_empty()
    }
}

/// 重试引擎
#[derive(Debug, Clone, Copy, Default)]
pub struct RetryEngine {
    policy: RetryPolicy,
}

impl RetryEngine {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// 按给定的重试次数与基础延迟执行（其余沿用默认策略）
    pub async fn execute_with<F, Fut, T, E>(
        work: F,
        max_retries: u32,
        base_delay: Duration,
    ) -> RetryResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: fmt::Display,
    {
        RetryEngine::new(RetryPolicy::new(max_retries, base_delay))
            .execute(work)
            .await
    }

    /// 执行 work，成功立即返回；全部失败时返回结构化的失败结果而非错误
    pub async fn execute<F, Fut, T, E>(&self, mut work: F) -> RetryResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: fmt::Display,
    {
        let total = self.policy.max_retries.saturating_add(1);
        let mut errors = Vec::new();

        for attempt in 1..=total {
            match work().await {
                Ok(value) => {
                    if attempt > 1 {
                        tracing::info!(attempt, "retry succeeded");
                    }
                    return RetryResult {
                        success: true,
                        attempts: attempt,
                        result: Some(value),
                        errors,
                    };
                }
                Err(e) => {
                    let message = e.to_string();
                    if attempt < total {
                        let delay = self.policy.backoff(attempt);
                        tracing::warn!(
                            attempt,
                            max_attempts = total,
                            delay_ms = delay.as_millis() as u64,
                            error = %message,
                            "attempt failed, backing off"
                        );
                        errors.push(message);
                        tokio::time::sleep(delay).await;
                    } else {
                        tracing::warn!(attempts = total, error = %message, "retries exhausted");
                        errors.push(message);
                    }
                }
            }
        }

        RetryResult {
            success: false,
            attempts: total,
            result: None,
            errors,
        }
    }
}
