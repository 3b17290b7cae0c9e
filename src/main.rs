//! Hive 演示入口
//!
//! 加载配置、初始化日志，调度一组演示作业（含一个由 SelfHealer 包裹的不稳定作业，
//! 以及一批会触发熔断的下游调用），运行后输出指标与自愈汇总。

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use hive::config::load_config;
use hive::core::{AsyncScheduler, JobOptions, SchedulerConfig, TracingEventSink};
use hive::observability;
use hive::resilience::SelfHealer;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = load_config(None).context("Failed to load config")?;
    observability::init_with_format(config.logging.format);

    let healer = Arc::new(SelfHealer::from_config(&config));
    let scheduler = AsyncScheduler::from_config(SchedulerConfig::from(&config.scheduler))
        .with_event_sink(Arc::new(TracingEventSink))
        .with_circuit_breaker(healer.breaker().clone())
        .with_failure_hook(healer.clone());

    scheduler
        .schedule(
            || async {
                tokio::time::sleep(Duration::from_millis(20)).await;
                Ok::<_, String>("cache warmed")
            },
            0,
            "warmup",
        )
        .await;

    // 前两次失败，第三次成功，由 SelfHealer 负责重试并记录
    let flaky_healer = healer.clone();
    scheduler
        .schedule(
            move || async move {
                let calls = Arc::new(AtomicU32::new(0));
                let report = flaky_healer
                    .run(Some("fetcher"), move || {
                        let calls = calls.clone();
                        async move {
                            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                                Err("connection reset by peer")
                            } else {
                                Ok(serde_json::json!({ "rows": 42 }))
                            }
                        }
                    })
                    .await;
                match report.retry.result {
                    Some(value) => Ok(value),
                    None => Err(report.retry.last_error().unwrap_or("fetch failed").to_string()),
                }
            },
            1,
            "flaky-fetch",
        )
        .await;

    // 下游持续 503：连续失败达到阈值后，剩余作业被熔断直接拒绝
    for i in 0..5 {
        scheduler
            .schedule_with(
                || async {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    Err::<(), _>("ledger service unavailable (503)")
                },
                JobOptions::new(format!("ledger-sync-{i}"))
                    .with_priority(2 + i)
                    .with_agent("ledger"),
            )
            .await?;
    }

    let results = scheduler.run_all().await;
    for job in scheduler.list_jobs(None).await {
        if !results.contains_key(&job.id) {
            continue;
        }
        match &job.error {
            Some(error) => println!("{:<14} {:<10} {}", job.name, job.status.to_string(), error),
            None => println!(
                "{:<14} {:<10} {}",
                job.name,
                job.status.to_string(),
                job.result.unwrap_or(serde_json::Value::Null)
            ),
        }
    }

    let metrics = scheduler.metrics();
    println!(
        "\nscheduled={} completed={} failed={} cancelled={} avg={:?}",
        metrics.jobs_scheduled,
        metrics.jobs_completed,
        metrics.jobs_failed,
        metrics.jobs_cancelled,
        metrics.average_execution_time()
    );

    for agent_id in healer.breaker().agents() {
        if let Some(health) = healer.breaker().get_health(&agent_id) {
            println!(
                "agent {:<8} {:<9} failures={} successes={}",
                health.agent_id,
                health.state.to_string(),
                health.total_failures, health.total_successes
            );
        }
    }

    let summary = healer.log().summary();
    println!(
        "\nhealing summary:\n{}",
        serde_json::to_string_pretty(&summary).context("Failed to render healing summary")?
    );

    if let Some(path) = &config.healing.export_path {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let count = healer
            .log()
            .export_jsonl(path)
            .with_context(|| format!("Failed to export healing log to {}", path.display()))?;
        tracing::info!(count, path = %path.display(), "healing log exported");
    }

    Ok(())
}
