//! 异步作业调度器
//!
//! schedule() 只登记作业并立即返回；run_all() 按 (priority, 插入顺序) 依次取得信号量许可后派发，
//! 同时运行的作业数不超过 max_concurrency。单个作业失败（包括 panic）只影响它自己。
//! 调度器本身不重试：重试由调用方在作业体外包一层 RetryEngine，或挂接 FailureHook。

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures_util::FutureExt;
use serde::Serialize;
use tokio::sync::{watch, OwnedSemaphorePermit, RwLock, Semaphore};

use super::error::{HiveError, Result};
use super::events::{EventSink, JobEventType, SchedulerEvent};
use super::job::{Job, JobId, JobOptions, JobOutput, JobStatus, JobWork};
use super::metrics::SchedulerMetrics;
use crate::config::SchedulerSection;
use crate::resilience::CircuitBreaker;

/// 默认并发上限
pub const DEFAULT_MAX_CONCURRENCY: usize = 4;

/// 调度器参数
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerConfig {
    pub max_concurrency: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
        }
    }
}

impl From<&SchedulerSection> for SchedulerConfig {
    fn from(section: &SchedulerSection) -> Self {
        Self {
            max_concurrency: section.max_concurrency,
        }
    }
}

/// 作业失败回调：状态已提交为 FAILED 之后调用，每个失败作业一次
#[async_trait]
pub trait FailureHook: Send + Sync {
    async fn on_job_failed(&self, job: &Job);
}

struct JobSlot {
    job: Job,
    /// 派发或取消时取走；包一层 Mutex 使作业表可跨任务共享
    work: Mutex<Option<JobWork>>,
    /// 进入终态且事件、回调都已发出后置为 true
    done: Arc<watch::Sender<bool>>,
}

impl JobSlot {
    fn new(job: Job, work: JobWork) -> Self {
        let (done, _) = watch::channel(false);
        Self {
            job,
            work: Mutex::new(Some(work)),
            done: Arc::new(done),
        }
    }

    fn take_work(&self) -> Option<JobWork> {
        self.work.lock().unwrap_or_else(|e| e.into_inner()).take()
    }
}

#[derive(Default)]
struct JobTable {
    jobs: HashMap<JobId, JobSlot>,
    next_sequence: u64,
}

enum Claim {
    Run { agent_id: Option<String>, work: JobWork },
    /// 已被另一个 run_all 派发，等它结束
    Elsewhere(watch::Receiver<bool>),
    Skip,
}

/// 派发后的作业任务共享的状态
#[derive(Clone)]
struct Shared {
    table: Arc<RwLock<JobTable>>,
    metrics: Arc<Mutex<SchedulerMetrics>>,
    sink: Option<Arc<dyn EventSink>>,
    breaker: Option<Arc<CircuitBreaker>>,
    failure_hook: Option<Arc<dyn FailureHook>>,
}

impl Shared {
    // 指标只在锁内做整数累加，锁中毒时数据仍然一致
    fn metrics(&self) -> MutexGuard<'_, SchedulerMetrics> {
        self.metrics.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn emit(&self, event_type: JobEventType, job: &Job) {
        if let Some(sink) = &self.sink {
            sink.publish(SchedulerEvent::for_job(event_type, job));
        }
    }

    /// 把 PENDING 作业置为 RUNNING 并取走作业体；已取消/已派发的跳过，熔断拒绝的直接失败
    async fn claim(&self, job_id: &str) -> Claim {
        let mut table = self.table.write().await;
        let Some(slot) = table.jobs.get_mut(job_id) else {
            return Claim::Skip;
        };
        match slot.job.status {
            JobStatus::Pending => {}
            JobStatus::Running => return Claim::Elsewhere(slot.done.subscribe()),
            _ => return Claim::Skip,
        }

        let refused_by = match (&self.breaker, slot.job.agent_id.clone()) {
            (Some(breaker), Some(agent_id)) if !breaker.allow(&agent_id) => Some(agent_id),
            _ => None,
        };
        if let Some(agent_id) = refused_by {
            slot.take_work();
            slot.job.fail(format!("circuit open for agent {agent_id}"));
            let snapshot = slot.job.clone();
            let done = slot.done.clone();
            drop(table);
            tracing::warn!(job_id, agent_id = %agent_id, "job refused by circuit breaker");
            self.metrics().jobs_failed += 1;
            self.emit(JobEventType::Failed, &snapshot);
            self.notify_failure(&snapshot).await;
            done.send_replace(true);
            return Claim::Skip;
        }

        let Some(work) = slot.take_work() else {
            return Claim::Skip;
        };
        slot.job.transition(JobStatus::Running);
        let snapshot = slot.job.clone();
        drop(table);

        tracing::debug!(job_id, name = %snapshot.name, "job started");
        self.emit(JobEventType::Started, &snapshot);
        Claim::Run {
            agent_id: snapshot.agent_id,
            work,
        }
    }

    /// 在已派发的 tokio 任务中执行作业体；许可在作业结束并落定状态后释放
    async fn execute(
        self,
        job_id: JobId,
        agent_id: Option<String>,
        work: JobWork,
        _permit: OwnedSemaphorePermit,
    ) {
        let started = Instant::now();
        let output = match AssertUnwindSafe(async move { work().await })
            .catch_unwind()
            .await
        {
            Ok(output) => output,
            Err(panic) => Err(format!("job panicked: {}", panic_message(panic.as_ref()))),
        };
        let elapsed = started.elapsed();

        if let (Some(breaker), Some(agent_id)) = (&self.breaker, &agent_id) {
            match &output {
                Ok(_) => breaker.record_success(agent_id),
                Err(_) => breaker.record_failure(agent_id),
            }
        }

        self.finish(&job_id, output, elapsed).await;
    }

    async fn finish(&self, job_id: &str, output: JobOutput, elapsed: Duration) {
        let (snapshot, done) = {
            let mut table = self.table.write().await;
            let Some(slot) = table.jobs.get_mut(job_id) else {
                return;
            };
            let committed = match output {
                Ok(value) => slot.job.complete(value),
                Err(error) => slot.job.fail(error),
            };
            if !committed {
                return;
            }
            (slot.job.clone(), slot.done.clone())
        };

        {
            let mut metrics = self.metrics();
            metrics.total_execution_time += elapsed;
            match snapshot.status {
                JobStatus::Completed => metrics.jobs_completed += 1,
                _ => metrics.jobs_failed += 1,
            }
        }

        if snapshot.status == JobStatus::Completed {
            tracing::info!(job_id, name = %snapshot.name, elapsed_ms = elapsed.as_millis() as u64, "job completed");
            self.emit(JobEventType::Completed, &snapshot);
        } else {
            tracing::warn!(
                job_id,
                name = %snapshot.name,
                error = snapshot.error.as_deref().unwrap_or_default(),
                "job failed"
            );
            self.emit(JobEventType::Failed, &snapshot);
            self.notify_failure(&snapshot).await;
        }
        done.send_replace(true);
    }

    async fn notify_failure(&self, job: &Job) {
        if let Some(hook) = &self.failure_hook {
            hook.on_job_failed(job).await;
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// 异步作业调度器
pub struct AsyncScheduler {
    shared: Shared,
    semaphore: Arc<Semaphore>,
    max_concurrency: usize,
}

impl AsyncScheduler {
    pub fn new(max_concurrency: usize) -> Self {
        let max_concurrency = max_concurrency.max(1);
        Self {
            shared: Shared {
                table: Arc::new(RwLock::new(JobTable::default())),
                metrics: Arc::new(Mutex::new(SchedulerMetrics::default())),
                sink: None,
                breaker: None,
                failure_hook: None,
            },
            semaphore: Arc::new(Semaphore::new(max_concurrency)),
            max_concurrency,
        }
    }

    pub fn from_config(config: SchedulerConfig) -> Self {
        Self::new(config.max_concurrency)
    }

    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.shared.sink = Some(sink);
        self
    }

    /// 带 agent_id 的作业派发前先询问熔断器，结束后回报结果
    pub fn with_circuit_breaker(mut self, breaker: Arc<CircuitBreaker>) -> Self {
        self.shared.breaker = Some(breaker);
        self
    }

    pub fn with_failure_hook(mut self, hook: Arc<dyn FailureHook>) -> Self {
        self.shared.failure_hook = Some(hook);
        self
    }

    pub fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }

    /// 以默认 ID 登记作业
    pub async fn schedule<F, Fut, T, E>(&self, work: F, priority: i32, name: &str) -> JobId
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = std::result::Result<T, E>> + Send + 'static,
        T: Serialize + Send + 'static,
        E: std::fmt::Display + Send + 'static,
    {
        let options = JobOptions::new(name).with_priority(priority);
        let mut table = self.shared.table.write().await;
        self.enqueue(&mut table, options, box_work(work))
    }

    /// 按完整选项登记作业；调用方指定的 ID 重复时报错
    pub async fn schedule_with<F, Fut, T, E>(&self, work: F, options: JobOptions) -> Result<JobId>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = std::result::Result<T, E>> + Send + 'static,
        T: Serialize + Send + 'static,
        E: std::fmt::Display + Send + 'static,
    {
        let mut table = self.shared.table.write().await;
        if let Some(id) = &options.id {
            if table.jobs.contains_key(id) {
                return Err(HiveError::DuplicateJob(id.clone()));
            }
        }
        Ok(self.enqueue(&mut table, options, box_work(work)))
    }

    fn enqueue(&self, table: &mut JobTable, options: JobOptions, work: JobWork) -> JobId {
        let sequence = table.next_sequence;
        table.next_sequence += 1;

        let job = Job::new(options, sequence);
        let job_id = job.id.clone();
        tracing::debug!(job_id = %job_id, name = %job.name, priority = job.priority, "job scheduled");
        self.shared.metrics().jobs_scheduled += 1;
        self.shared.emit(JobEventType::Scheduled, &job);
        table.jobs.insert(job_id.clone(), JobSlot::new(job, work));
        job_id
    }

    /// 执行调用时刻所有 PENDING 作业，等待它们全部进入终态后返回（不含已取消的）
    pub async fn run_all(&self) -> HashMap<JobId, Job> {
        let batch: Vec<JobId> = {
            let table = self.shared.table.read().await;
            let mut pending: Vec<&Job> = table
                .jobs
                .values()
                .map(|slot| &slot.job)
                .filter(|job| job.status == JobStatus::Pending)
                .collect();
            pending.sort_by_key(|job| job.order_key());
            pending.into_iter().map(|job| job.id.clone()).collect()
        };

        if batch.is_empty() {
            return HashMap::new();
        }
        tracing::info!(jobs = batch.len(), max_concurrency = self.max_concurrency, "run_all started");

        let mut handles = Vec::with_capacity(batch.len());
        let mut foreign = Vec::new();
        for job_id in &batch {
            let Ok(permit) = self.semaphore.clone().acquire_owned().await else {
                break;
            };
            match self.shared.claim(job_id).await {
                Claim::Run { agent_id, work } => {
                    let shared = self.shared.clone();
                    let handle = tokio::spawn(shared.execute(job_id.clone(), agent_id, work, permit));
                    handles.push((job_id.clone(), handle));
                }
                Claim::Elsewhere(rx) => {
                    drop(permit);
                    foreign.push(rx);
                }
                Claim::Skip => drop(permit),
            }
        }

        for (job_id, handle) in handles {
            if let Err(e) = handle.await {
                // 作业体的 panic 已在任务内捕获，这里只剩任务被外部中止的情况
                self.shared
                    .finish(&job_id, Err(format!("job task aborted: {e}")), Duration::ZERO)
                    .await;
            }
        }

        // 批次里被并发的 run_all 抢先派发的作业同样要等到终态
        for mut rx in foreign {
            let _ = rx.wait_for(|done| *done).await;
        }

        let table = self.shared.table.read().await;
        let results: HashMap<JobId, Job> = batch
            .iter()
            .filter_map(|id| table.jobs.get(id))
            .filter(|slot| slot.job.status != JobStatus::Cancelled)
            .map(|slot| (slot.job.id.clone(), slot.job.clone()))
            .collect();
        tracing::info!(jobs = results.len(), "run_all finished");
        results
    }

    /// 只在 PENDING 时可取消
    pub async fn cancel(&self, job_id: &str) -> bool {
        let snapshot = {
            let mut table = self.shared.table.write().await;
            let Some(slot) = table.jobs.get_mut(job_id) else {
                return false;
            };
            if !slot.job.transition(JobStatus::Cancelled) {
                return false;
            }
            slot.take_work();
            slot.job.clone()
        };
        tracing::debug!(job_id, "job cancelled");
        self.shared.metrics().jobs_cancelled += 1;
        self.shared.emit(JobEventType::Cancelled, &snapshot);
        true
    }

    pub async fn get_job(&self, job_id: &str) -> Option<Job> {
        self.shared
            .table
            .read()
            .await
            .jobs
            .get(job_id)
            .map(|slot| slot.job.clone())
    }

    /// 按 (priority, 插入顺序) 排序；status 为 None 时返回全部
    pub async fn list_jobs(&self, status: Option<JobStatus>) -> Vec<Job> {
        let table = self.shared.table.read().await;
        let mut jobs: Vec<Job> = table
            .jobs
            .values()
            .map(|slot| &slot.job)
            .filter(|job| status.map_or(true, |s| job.status == s))
            .cloned()
            .collect();
        jobs.sort_by_key(|job| job.order_key());
        jobs
    }

    pub async fn pending_count(&self) -> usize {
        self.shared
            .table
            .read()
            .await
            .jobs
            .values()
            .filter(|slot| slot.job.status == JobStatus::Pending)
            .count()
    }

    /// 指标快照
    pub fn metrics(&self) -> SchedulerMetrics {
        self.shared.metrics().clone()
    }
}

impl Default for AsyncScheduler {
    fn default() -> Self {
        Self::from_config(SchedulerConfig::default())
    }
}

fn box_work<F, Fut, T, E>(work: F) -> JobWork
where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = std::result::Result<T, E>> + Send + 'static,
    T: Serialize + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    Box::new(move || {
        Box::pin(async move {
            match work().await {
                Ok(value) => serde_json::to_value(value)
                    .map_err(|e| format!("failed to serialize job result: {e}")),
                Err(e) => Err(e.to_string()),
            }
        })
    })
}
