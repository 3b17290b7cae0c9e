//! 诊断器
//!
//! 在分类结果之上生成根因描述、影响等级与恢复计划。影响等级是按类别的固定查表。

use serde::{Deserialize, Serialize};

use super::taxonomy::{classify_error, ClassifiedFailure, FailureCategory, FailureContext};

/// 影响等级
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Impact {
    Low,
    Medium,
    High,
}

/// 诊断报告
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Diagnosis {
    pub error: ClassifiedFailure,
    pub root_cause: String,
    pub recovery_plan: Vec<String>,
    pub impact: Impact,
}

/// 上下文中表示「影响到具体 agent」的键
const AGENT_KEYS: [&str; 2] = ["agent_id", "agent"];

/// 无状态诊断器，可并发调用
#[derive(Debug, Default, Clone, Copy)]
pub struct Diagnoser;

impl Diagnoser {
    pub fn new() -> Self {
        Self
    }

    pub fn diagnose(&self, message: &str, context: Option<&FailureContext>) -> Diagnosis {
        let error = classify_error(message, context);
        let has_agent = context.is_some_and(|ctx| AGENT_KEYS.iter().any(|k| ctx.contains_key(*k)));
        let impact = impact_for(error.category, has_agent);
        let root_cause = root_cause(error.category, message);
        let recovery_plan = recovery_plan(&error, impact);

        Diagnosis {
            error,
            root_cause,
            recovery_plan,
            impact,
        }
    }
}

fn impact_for(category: FailureCategory, has_agent: bool) -> Impact {
    match category {
        FailureCategory::Timeout => Impact::Low,
        FailureCategory::ConfigError => Impact::Medium,
        FailureCategory::ResourceExhaustion if has_agent => Impact::High,
        FailureCategory::ResourceExhaustion => Impact::Medium,
        FailureCategory::DependencyFailure => Impact::Medium,
        FailureCategory::PermissionError => Impact::High,
        FailureCategory::LogicError => Impact::Medium,
        FailureCategory::Unknown => Impact::Medium,
    }
}

fn root_cause(category: FailureCategory, message: &str) -> String {
    let what = match category {
        FailureCategory::ConfigError => "Invalid or missing configuration",
        FailureCategory::ResourceExhaustion => "A resource limit was exhausted",
        FailureCategory::DependencyFailure => "A downstream dependency is unavailable",
        FailureCategory::Timeout => "The operation exceeded its time budget",
        FailureCategory::PermissionError => "The caller lacks the required permissions",
        FailureCategory::LogicError => "An internal invariant was violated",
        FailureCategory::Unknown => "Unrecognized failure",
    };
    format!("{what} ({category}): {message}")
}

fn recovery_plan(error: &ClassifiedFailure, impact: Impact) -> Vec<String> {
    let mut plan = Vec::with_capacity(error.suggested_strategies.len() + 2);
    if impact == Impact::High {
        plan.push("isolate affected agent".to_string());
    }
    plan.extend(error.suggested_strategies.iter().cloned());
    plan.push("verify recovery and record healing event".to_string());
    plan
}

#[cfg(test)]
mod tests {
    use super::*;

    fn agent_ctx() -> FailureContext {
        let mut ctx = FailureContext::new();
        ctx.insert("agent_id".to_string(), "indexer".to_string());
        ctx
    }

    #[test]
    fn test_timeout_is_low_impact() {
        let d = Diagnoser::new().diagnose("request timed out after 30s", None);
        assert_eq!(d.error.category, FailureCategory::Timeout);
        assert_eq!(d.impact, Impact::Low);
    }

    #[test]
    fn test_config_is_medium_impact() {
        let d = Diagnoser::new().diagnose("missing field `endpoint` in configuration", None);
        assert_eq!(d.error.category, FailureCategory::ConfigError);
        assert_eq!(d.impact, Impact::Medium);
    }

    #[test]
    fn test_resource_exhaustion_with_agent_is_high() {
        let ctx = agent_ctx();
        let d = Diagnoser::new().diagnose("worker out of memory", Some(&ctx));
        assert_eq!(d.error.category, FailureCategory::ResourceExhaustion);
        assert_eq!(d.impact, Impact::High);
        assert_eq!(d.recovery_plan.first().map(String::as_str), Some("isolate affected agent"));

        let d = Diagnoser::new().diagnose("worker out of memory", None);
        assert_eq!(d.impact, Impact::Medium);
    }

    #[test]
    fn test_root_cause_mentions_message_and_category() {
        let d = Diagnoser::new().diagnose("Connection refused to API", None);
        assert!(d.root_cause.contains("DEPENDENCY_FAILURE"));
        assert!(d.root_cause.contains("Connection refused to API"));
    }

    #[test]
    fn test_recovery_plan_keeps_strategy_order() {
        let d = Diagnoser::new().diagnose("Connection refused to API", None);
        let strategies = &d.error.suggested_strategies;
        assert_eq!(&d.recovery_plan[..strategies.len()], strategies.as_slice());
        assert_eq!(
            d.recovery_plan.last().map(String::as_str),
            Some("verify recovery and record healing event")
        );
    }
}
