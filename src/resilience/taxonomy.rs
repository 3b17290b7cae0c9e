//! 失败分类
//!
//! 对错误消息做大小写无关的关键词匹配，归入固定的失败类别，并给出有序的修复策略。
//! 纯函数：同一消息总是得到同一结果。

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// 失败附带的上下文（如 agent_id、job_id）
pub type FailureContext = HashMap<String, String>;

/// 失败类别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureCategory {
    ConfigError,
    ResourceExhaustion,
    DependencyFailure,
    Timeout,
    PermissionError,
    LogicError,
    Unknown,
}

impl FailureCategory {
    pub const ALL: [FailureCategory; 7] = [
        FailureCategory::ConfigError,
        FailureCategory::ResourceExhaustion,
        FailureCategory::DependencyFailure,
        FailureCategory::Timeout,
        FailureCategory::PermissionError,
        FailureCategory::LogicError,
        FailureCategory::Unknown,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FailureCategory::ConfigError => "CONFIG_ERROR",
            FailureCategory::ResourceExhaustion => "RESOURCE_EXHAUSTION",
            FailureCategory::DependencyFailure => "DEPENDENCY_FAILURE",
            FailureCategory::Timeout => "TIMEOUT",
            FailureCategory::PermissionError => "PERMISSION_ERROR",
            FailureCategory::LogicError => "LOGIC_ERROR",
            FailureCategory::Unknown => "UNKNOWN",
        }
    }

    /// 该类别的修复策略，顺序即建议执行顺序
    pub fn strategies(&self) -> &'static [&'static str] {
        match self {
            FailureCategory::ConfigError => &["validate configuration", "reload from defaults"],
            FailureCategory::ResourceExhaustion => &[
                "reduce concurrency",
                "free resources",
                "retry with backoff",
            ],
            FailureCategory::DependencyFailure => &[
                "retry with backoff",
                "open circuit for dependency",
                "switch to fallback",
            ],
            FailureCategory::Timeout => &["retry with backoff", "increase timeout"],
            FailureCategory::PermissionError => &["verify credentials", "escalate to operator"],
            FailureCategory::LogicError => &["inspect input data", "escalate to operator"],
            FailureCategory::Unknown => &["retry once", "escalate to operator"],
        }
    }

    /// 匹配词表（小写）
    fn terms(&self) -> &'static [&'static str] {
        match self {
            FailureCategory::ConfigError => &[
                "config",
                "configuration",
                "missing key",
                "missing field",
                "invalid setting",
                "environment variable",
                "not configured",
            ],
            FailureCategory::ResourceExhaustion => &[
                "out of memory",
                "memory",
                "oom",
                "disk full",
                "no space left",
                "quota",
                "resource exhausted",
                "too many open files",
                "rate limit",
                "capacity",
            ],
            FailureCategory::DependencyFailure => &[
                "connection",
                "refused",
                "unreachable",
                "network",
                "dns",
                "service unavailable",
                "503",
                "502",
                "broken pipe",
                "reset by peer",
            ],
            FailureCategory::Timeout => &["timeout", "timed out", "deadline exceeded", "took too long"],
            FailureCategory::PermissionError => &[
                "permission",
                "denied",
                "unauthorized",
                "forbidden",
                "401",
                "403",
                "not allowed",
                "credentials",
            ],
            FailureCategory::LogicError => &[
                "assert",
                "assertion",
                "invariant",
                "unexpected",
                "invalid state",
                "index out of bounds",
                "null",
                "panicked",
            ],
            FailureCategory::Unknown => &[],
        }
    }
}

impl fmt::Display for FailureCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 分类结果，产出后不可变
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassifiedFailure {
    pub category: FailureCategory,
    /// 0.0 - 1.0；UNKNOWN 恒低于 1.0
    pub confidence: f64,
    pub suggested_strategies: Vec<String>,
    pub message: String,
    pub context: Option<FailureContext>,
}

/// UNKNOWN 的固定置信度
pub const UNKNOWN_CONFIDENCE: f64 = 0.3;

// 命中数相同时的优先顺序：越具体的类别越靠前
const MATCH_ORDER: [FailureCategory; 6] = [
    FailureCategory::Timeout,
    FailureCategory::PermissionError,
    FailureCategory::ConfigError,
    FailureCategory::ResourceExhaustion,
    FailureCategory::DependencyFailure,
    FailureCategory::LogicError,
];

/// 对错误消息分类
pub fn classify_error(message: &str, context: Option<&FailureContext>) -> ClassifiedFailure {
    let lower = message.to_lowercase();

    let mut best: Option<(FailureCategory, usize)> = None;
    for category in MATCH_ORDER {
        let hits = category
            .terms()
            .iter()
            .filter(|t| contains_term(&lower, t))
            .count();
        if hits > 0 && best.map_or(true, |(_, h)| hits > h) {
            best = Some((category, hits));
        }
    }

    let (category, confidence) = match best {
        Some((category, hits)) => (category, (0.5 + 0.15 * hits as f64).min(0.95)),
        None => (FailureCategory::Unknown, UNKNOWN_CONFIDENCE),
    };

    ClassifiedFailure {
        category,
        confidence,
        suggested_strategies: category.strategies().iter().map(|s| s.to_string()).collect(),
        message: message.to_string(),
        context: context.cloned(),
    }
}

/// 按整词匹配（允许复数 s 结尾），避免 "oom" 命中 "room"、"503" 命中 "15030"
fn contains_term(haystack: &str, term: &str) -> bool {
    haystack.match_indices(term).any(|(start, _)| {
        let bounded_before = haystack[..start]
            .chars()
            .next_back()
            .map_or(true, |c| !c.is_alphanumeric());
        let mut after = haystack[start + term.len()..].chars();
        let bounded_after = match after.next() {
            None => true,
            Some('s') => after.next().map_or(true, |c| !c.is_alphanumeric()),
            Some(c) => !c.is_alphanumeric(),
        };
        bounded_before && bounded_after
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_refused_is_dependency_failure() {
        let failure = classify_error("Connection refused to API", None);
        assert_eq!(failure.category, FailureCategory::DependencyFailure);
        assert!(!failure.suggested_strategies.is_empty());
        assert!(failure.confidence > UNKNOWN_CONFIDENCE);
    }

    #[test]
    fn test_nonsense_is_unknown() {
        let failure = classify_error("asdkjaslkd nonsense", None);
        assert_eq!(failure.category, FailureCategory::Unknown);
        assert!(failure.confidence < 1.0);
    }

    #[test]
    fn test_case_insensitive() {
        assert_eq!(
            classify_error("OUT OF MEMORY while allocating buffer", None).category,
            FailureCategory::ResourceExhaustion
        );
        assert_eq!(
            classify_error("Permission DENIED for /var/run", None).category,
            FailureCategory::PermissionError
        );
    }

    #[test]
    fn test_terms_match_whole_words_only() {
        assert_eq!(
            classify_error("meeting room booking rejected", None).category,
            FailureCategory::Unknown
        );
        assert_eq!(
            classify_error("user id 15030 not found", None).category,
            FailureCategory::Unknown
        );
        assert_eq!(
            classify_error("column is nullable", None).category,
            FailureCategory::Unknown
        );
        assert_eq!(
            classify_error("upstream returned 503", None).category,
            FailureCategory::DependencyFailure
        );
        assert_eq!(
            classify_error("container killed: OOM", None).category,
            FailureCategory::ResourceExhaustion
        );
        assert_eq!(
            classify_error("too many timeouts", None).category,
            FailureCategory::Timeout
        );
    }

    #[test]
    fn test_timeout_wins_tie_over_dependency() {
        // "connection" 与 "timed out" 各命中一次，TIMEOUT 更具体
        let failure = classify_error("connection timed out", None);
        assert_eq!(failure.category, FailureCategory::Timeout);
    }

    #[test]
    fn test_strategy_order_is_fixed() {
        let failure = classify_error("invalid configuration: missing key 'port'", None);
        assert_eq!(failure.category, FailureCategory::ConfigError);
        assert_eq!(
            failure.suggested_strategies,
            vec!["validate configuration".to_string(), "reload from defaults".to_string()]
        );
    }

    #[test]
    fn test_deterministic_and_keeps_context() {
        let mut ctx = FailureContext::new();
        ctx.insert("agent_id".to_string(), "mailer".to_string());
        let a = classify_error("assertion failed: x > 0", Some(&ctx));
        let b = classify_error("assertion failed: x > 0", Some(&ctx));
        assert_eq!(a, b);
        assert_eq!(a.category, FailureCategory::LogicError);
        assert_eq!(a.context.unwrap().get("agent_id").map(String::as_str), Some("mailer"));
    }

    #[test]
    fn test_category_serializes_screaming_case() {
        let json = serde_json::to_string(&FailureCategory::DependencyFailure).unwrap();
        assert_eq!(json, "\"DEPENDENCY_FAILURE\"");
        assert_eq!(FailureCategory::Timeout.to_string(), "TIMEOUT");
    }
}
