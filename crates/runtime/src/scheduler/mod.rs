//! Admission control and dispatch.
//!
//! Submissions wait in a priority queue until global capacity, the tenant's
//! quota and the current pressure score allow them to start. A sampler task
//! refreshes the pressure score and re-runs dispatch, so throttled work
//! resumes as load relaxes.

mod pressure;
mod queue;
mod quota;

pub use pressure::{StaticProbe, SysinfoProbe, SystemProbe, SystemSample};
pub use quota::TenantUsage;

use std::collections::{BTreeMap, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};
use validator::Validate;

use sluice_common::config::{RetrySettings, SchedulerSettings};
use sluice_common::models::{
    ExecutionRecord, ExecutionStatus, Priority, QueryResponse, ResourceQuota,
};
use sluice_common::retry::retry_async;
use sluice_error::{ErrorCode, ErrorContext, SluiceError};

use pressure::{LoadReading, PressureGauge};
use queue::PriorityQueue;
use quota::QuotaTracker;

pub type JobFuture = BoxFuture<'static, sluice_error::Result<QueryResponse>>;
type JobFn = Box<dyn Fn(CancellationToken) -> JobFuture + Send + Sync>;
type ConnectionGauge = Arc<dyn Fn() -> f64 + Send + Sync>;

/// One unit of work handed to the scheduler.
///
/// `exec` is called once per attempt with a token that fires when the
/// query is cancelled.
pub struct Job {
    pub query_id: String,
    /// Quota key, see `TenantContext::quota_key`.
    pub tenant: String,
    pub priority: Priority,
    pub timeout: Duration,
    /// Idempotent jobs are retried on transient failures.
    pub idempotent: bool,
    pub memory_mb: u64,
    exec: JobFn,
}

impl Job {
    pub fn new<F, Fut>(query_id: impl Into<String>, tenant: impl Into<String>, exec: F) -> Self
    where
        F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = sluice_error::Result<QueryResponse>> + Send + 'static,
    {
        Self {
            query_id: query_id.into(),
            tenant: tenant.into(),
            priority: Priority::Normal,
            timeout: Duration::from_secs(30),
            idempotent: false,
            memory_mb: 0,
            exec: Box::new(move |token| exec(token).boxed()),
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn idempotent(mut self, idempotent: bool) -> Self {
        self.idempotent = idempotent;
        self
    }

    pub fn with_memory_mb(mut self, memory_mb: u64) -> Self {
        self.memory_mb = memory_mb;
        self
    }
}

struct Queued {
    job: Job,
    token: CancellationToken,
    reply: oneshot::Sender<sluice_error::Result<QueryResponse>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStats {
    pub queued: usize,
    pub running: usize,
    pub max_concurrent: usize,
    pub queued_by_priority: BTreeMap<String, usize>,
    pub pressure_score: f64,
    pub throttled: Vec<Priority>,
    pub system: SystemSample,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub timed_out: u64,
    pub rejected: u64,
}

#[derive(Default)]
struct Counters {
    completed: AtomicU64,
    failed: AtomicU64,
    cancelled: AtomicU64,
    timed_out: AtomicU64,
    rejected: AtomicU64,
}

struct Inner {
    settings: SchedulerSettings,
    retry: RetrySettings,
    queue: Mutex<PriorityQueue<Queued>>,
    running: DashMap<String, CancellationToken>,
    running_count: AtomicUsize,
    records: DashMap<String, ExecutionRecord>,
    history: Mutex<VecDeque<ExecutionRecord>>,
    quotas: QuotaTracker,
    pressure: PressureGauge,
    probe: Arc<dyn SystemProbe>,
    connection_gauge: RwLock<Option<ConnectionGauge>>,
    counters: Counters,
    shutdown: CancellationToken,
    shutting_down: AtomicBool,
    tasks: TaskTracker,
    sampler: Mutex<Option<JoinHandle<()>>>,
}

/// Priority scheduler with per-tenant quotas and pressure throttling.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    pub fn new(
        settings: SchedulerSettings,
        retry: RetrySettings,
        probe: Arc<dyn SystemProbe>,
    ) -> Self {
        let quotas = QuotaTracker::new(settings.default_quota.clone(), settings.quotas.clone());
        let pressure = PressureGauge::new(settings.relax_step, settings.throttle.clone());
        Self {
            inner: Arc::new(Inner {
                settings,
                retry,
                queue: Mutex::new(PriorityQueue::new()),
                running: DashMap::new(),
                running_count: AtomicUsize::new(0),
                records: DashMap::new(),
                history: Mutex::new(VecDeque::new()),
                quotas,
                pressure,
                probe,
                connection_gauge: RwLock::new(None),
                counters: Counters::default(),
                shutdown: CancellationToken::new(),
                shutting_down: AtomicBool::new(false),
                tasks: TaskTracker::new(),
                sampler: Mutex::new(None),
            }),
        }
    }

    /// Connection utilization (0.0 - 1.0) fed into the pressure score.
    pub fn set_connection_gauge(&self, gauge: impl Fn() -> f64 + Send + Sync + 'static) {
        *self.inner.connection_gauge.write() = Some(Arc::new(gauge));
    }

    /// Launch the pressure sampler.
    pub fn start(&self) {
        let mut slot = self.inner.sampler.lock();
        if slot.is_some() {
            return;
        }
        let inner = self.inner.clone();
        let period = Duration::from_millis(inner.settings.sample_interval_ms);
        *slot = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = inner.shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        inner.sample();
                        inner.quotas.roll_over(Utc::now().date_naive());
                        inner.dispatch();
                    }
                }
            }
            debug!(target: "scheduler", "Pressure sampler stopped");
        }));
        info!(
            target: "scheduler",
            max_concurrent = self.inner.settings.max_concurrent,
            max_queue_depth = self.inner.settings.max_queue_depth,
            sample_interval_ms = self.inner.settings.sample_interval_ms,
            "Scheduler started"
        );
    }

    /// Queue a job and wait for its result.
    ///
    /// A spent daily cap or a full queue fails at once. Anything else waits
    /// for capacity.
    pub async fn submit(&self, job: Job) -> sluice_error::Result<QueryResponse> {
        let inner = &self.inner;
        if inner.shutting_down.load(Ordering::SeqCst) {
            return Err(shutdown_error());
        }

        let (reply, rx) = oneshot::channel();
        {
            let mut queue = inner.queue.lock();
            if queue.len() >= inner.settings.max_queue_depth {
                let err = SluiceError::new(
                    ErrorCode::QueueFull,
                    format!(
                        "Scheduler queue is full ({} waiting)",
                        inner.settings.max_queue_depth
                    ),
                )
                .with_hint("Retry later or raise scheduler.max_queue_depth");
                inner.reject(&job, &err);
                return Err(err);
            }
            if let Err(err) = inner.quotas.admit(&job.tenant) {
                inner.reject(&job, &err);
                return Err(err);
            }

            let record = ExecutionRecord::queued(&job.query_id, &job.tenant, job.priority);
            inner.records.insert(job.query_id.clone(), record);
            debug!(
                target: "scheduler",
                query_id = %job.query_id,
                tenant = %job.tenant,
                priority = %job.priority,
                queued = queue.len() + 1,
                "Query queued"
            );
            let id = job.query_id.clone();
            let priority = job.priority;
            queue.push(
                id,
                priority,
                Queued {
                    job,
                    token: inner.shutdown.child_token(),
                    reply,
                },
            );
        }

        inner.dispatch();
        rx.await
            .unwrap_or_else(|_| Err(SluiceError::internal("Scheduler dropped the query")))
    }

    /// Cancel a queued or running query.
    ///
    /// A queued query is removed at once. A running one has its token
    /// cancelled and finishes as `CANCELLED` when it next checks it.
    pub fn cancel(&self, query_id: &str) -> sluice_error::Result<()> {
        let removed = self.inner.queue.lock().remove(query_id);
        if let Some(item) = removed {
            info!(target: "scheduler", query_id, "Cancelled queued query");
            let err = SluiceError::cancelled(query_id);
            self.inner.counters.cancelled.fetch_add(1, Ordering::Relaxed);
            self.inner
                .finalize(query_id, ExecutionStatus::Cancelled, Some(&err), 0);
            let _ = item.reply.send(Err(err));
            return Ok(());
        }
        if let Some(token) = self.inner.running.get(query_id) {
            info!(target: "scheduler", query_id, "Cancelling running query");
            token.cancel();
            return Ok(());
        }
        Err(SluiceError::new(
            ErrorCode::UnknownQuery,
            format!("No queued or running query with id {}", query_id),
        ))
    }

    /// Take a pressure sample now instead of waiting for the sampler.
    pub fn sample_now(&self) -> f64 {
        let score = self.inner.sample();
        self.inner.dispatch();
        score
    }

    pub fn get_quota(&self, tenant: &str) -> ResourceQuota {
        self.inner.quotas.quota_for(tenant)
    }

    pub fn set_quota(&self, tenant: &str, quota: ResourceQuota) -> sluice_error::Result<()> {
        quota.validate().map_err(|e| {
            SluiceError::new(ErrorCode::InvalidConfig, format!("Invalid quota: {}", e))
                .with_context(ErrorContext::Config {
                    file_path: None,
                    field: Some(format!("scheduler.quotas.{}", tenant)),
                })
        })?;
        info!(target: "scheduler", tenant, ?quota, "Quota updated");
        self.inner.quotas.set_quota(tenant, quota);
        // A raised limit may let queued work start.
        self.inner.dispatch();
        Ok(())
    }

    pub fn usage(&self, tenant: &str) -> TenantUsage {
        self.inner.quotas.usage(tenant)
    }

    /// Live record first, then history.
    pub fn record(&self, query_id: &str) -> Option<ExecutionRecord> {
        if let Some(record) = self.inner.records.get(query_id) {
            return Some(record.clone());
        }
        self.inner
            .history
            .lock()
            .iter()
            .rev()
            .find(|r| r.query_id == query_id)
            .cloned()
    }

    /// Most recent finished executions, newest first.
    pub fn history(&self, limit: usize) -> Vec<ExecutionRecord> {
        self.inner
            .history
            .lock()
            .iter()
            .rev()
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn stats(&self) -> SchedulerStats {
        let inner = &self.inner;
        let (queued, by_priority) = {
            let queue = inner.queue.lock();
            (queue.len(), queue.count_by_priority())
        };
        SchedulerStats {
            queued,
            running: inner.running_count.load(Ordering::SeqCst),
            max_concurrent: inner.settings.max_concurrent,
            queued_by_priority: by_priority
                .into_iter()
                .map(|(p, n)| (p.to_string(), n))
                .collect(),
            pressure_score: inner.pressure.score(),
            throttled: inner.pressure.throttled(),
            system: inner.pressure.last_sample(),
            completed: inner.counters.completed.load(Ordering::Relaxed),
            failed: inner.counters.failed.load(Ordering::Relaxed),
            cancelled: inner.counters.cancelled.load(Ordering::Relaxed),
            timed_out: inner.counters.timed_out.load(Ordering::Relaxed),
            rejected: inner.counters.rejected.load(Ordering::Relaxed),
        }
    }

    /// Stop the sampler, fail queued work and cancel running work, then wait
    /// for every execution task to finish.
    pub async fn shutdown(&self) {
        let inner = &self.inner;
        if inner.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(target: "scheduler", "Shutting down scheduler");
        inner.shutdown.cancel();

        let sampler = inner.sampler.lock().take();
        if let Some(handle) = sampler {
            if let Err(e) = handle.await {
                warn!(target: "scheduler", error = %e, "Pressure sampler panicked");
            }
        }

        let drained = inner.queue.lock().drain();
        for (id, item) in drained {
            let err = shutdown_error();
            inner.finalize(&id, ExecutionStatus::Cancelled, Some(&err), 0);
            let _ = item.reply.send(Err(err));
        }

        inner.tasks.close();
        inner.tasks.wait().await;
        info!(target: "scheduler", "Scheduler stopped");
    }
}

impl Inner {
    fn sample(&self) -> f64 {
        let system = self.probe.sample();
        let queue_ratio =
            self.queue.lock().len() as f64 / self.settings.max_queue_depth.max(1) as f64;
        let gauge = self.connection_gauge.read().clone();
        let connection_ratio = gauge.map(|g| g()).unwrap_or(0.0);
        let score = self.pressure.update(LoadReading {
            system,
            queue_ratio,
            connection_ratio,
        });
        debug!(
            target: "scheduler",
            score,
            cpu = system.cpu_percent,
            memory = system.memory_percent,
            queue_ratio,
            connection_ratio,
            "Pressure sampled"
        );
        score
    }

    /// Start queued work while capacity allows.
    fn dispatch(self: &Arc<Self>) {
        if self.shutting_down.load(Ordering::SeqCst) {
            return;
        }
        let mut queue = self.queue.lock();
        while self.running_count.load(Ordering::SeqCst) < self.settings.max_concurrent {
            let cpu = self.pressure.last_sample().cpu_percent;
            let next = queue.pop_first_ready(|priority, item| {
                self.pressure.allows(priority)
                    && self
                        .quotas
                        .can_start(&item.job.tenant, item.job.memory_mb, cpu)
            });
            let Some((_, item)) = next else {
                break;
            };
            self.launch(item);
        }
    }

    fn launch(self: &Arc<Self>, item: Queued) {
        let job = &item.job;
        self.running_count.fetch_add(1, Ordering::SeqCst);
        self.quotas.start(&job.tenant, job.memory_mb);
        self.running
            .insert(job.query_id.clone(), item.token.clone());
        if let Some(mut record) = self.records.get_mut(&job.query_id) {
            record.transition(ExecutionStatus::Running);
            record.usage.reserved_memory_mb = job.memory_mb;
        }
        debug!(
            target: "scheduler",
            query_id = %job.query_id,
            priority = %job.priority,
            running = self.running_count.load(Ordering::SeqCst),
            "Query started"
        );
        let inner = self.clone();
        self.tasks.spawn(async move { inner.run(item).await });
    }

    async fn run(self: Arc<Self>, item: Queued) {
        let Queued { job, token, reply } = item;
        let quota = self.quotas.quota_for(&job.tenant);
        let limit = job
            .timeout
            .min(Duration::from_secs(quota.max_execution_time_secs));
        let retry = if job.idempotent {
            self.retry
        } else {
            RetrySettings {
                max_attempts: 1,
                ..self.retry
            }
        };

        let id = job.query_id.as_str();
        let result = retry_async(
            &format!("query {}", id),
            retry,
            |e: &SluiceError| e.is_retryable() && !token.is_cancelled(),
            |attempt| {
                if attempt > 1 {
                    if let Some(mut record) = self.records.get_mut(id) {
                        record.retry_count = attempt - 1;
                    }
                }
                let attempt_future = (job.exec)(token.clone());
                let token = token.clone();
                let id = id.to_string();
                async move {
                    tokio::select! {
                        biased;
                        _ = token.cancelled() => Err(SluiceError::cancelled(&id)),
                        outcome = tokio::time::timeout(limit, attempt_future) => {
                            outcome.unwrap_or_else(|_| Err(timeout_error(&id, limit)))
                        }
                    }
                }
            },
        )
        .await;

        self.complete(&job, &result);
        let _ = reply.send(result);
    }

    fn complete(self: &Arc<Self>, job: &Job, result: &sluice_error::Result<QueryResponse>) {
        let (status, error, rows) = match result {
            Ok(response) => (
                ExecutionStatus::Completed,
                None,
                response.data.row_count() as u64,
            ),
            Err(e) if e.is_cancellation() => (ExecutionStatus::Cancelled, Some(e), 0),
            Err(e) if e.code == ErrorCode::ExecutionTimeout => {
                (ExecutionStatus::Timeout, Some(e), 0)
            }
            Err(e) => (ExecutionStatus::Failed, Some(e), 0),
        };
        let counter = match status {
            ExecutionStatus::Completed => &self.counters.completed,
            ExecutionStatus::Cancelled => &self.counters.cancelled,
            ExecutionStatus::Timeout => &self.counters.timed_out,
            _ => &self.counters.failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);

        self.running.remove(&job.query_id);
        self.quotas.finish(&job.tenant, job.memory_mb);
        self.running_count.fetch_sub(1, Ordering::SeqCst);
        self.finalize(&job.query_id, status, error, rows);

        match error {
            Some(e) if status == ExecutionStatus::Failed => warn!(
                target: "scheduler",
                query_id = %job.query_id,
                error = %e,
                "Query failed"
            ),
            _ => debug!(
                target: "scheduler",
                query_id = %job.query_id,
                status = %status,
                "Query finished"
            ),
        }
        self.dispatch();
    }

    /// Move a live record to a terminal status and into the history.
    fn finalize(
        &self,
        query_id: &str,
        status: ExecutionStatus,
        error: Option<&SluiceError>,
        rows: u64,
    ) {
        let Some((_, mut record)) = self.records.remove(query_id) else {
            return;
        };
        record.transition(status);
        record.usage.rows_returned = rows;
        record.error = error.map(|e| e.to_string());
        self.push_history(record);
    }

    fn reject(&self, job: &Job, err: &SluiceError) {
        self.counters.rejected.fetch_add(1, Ordering::Relaxed);
        let mut record = ExecutionRecord::queued(&job.query_id, &job.tenant, job.priority);
        record.transition(ExecutionStatus::Failed);
        record.error = Some(err.to_string());
        warn!(
            target: "scheduler",
            query_id = %job.query_id,
            tenant = %job.tenant,
            code = %err.code,
            "Query rejected"
        );
        self.push_history(record);
    }

    fn push_history(&self, record: ExecutionRecord) {
        let mut history = self.history.lock();
        history.push_back(record);
        while history.len() > self.settings.history_size.max(1) {
            history.pop_front();
        }
    }
}

fn timeout_error(query_id: &str, limit: Duration) -> SluiceError {
    SluiceError::new(
        ErrorCode::ExecutionTimeout,
        format!(
            "Query {} exceeded its {}ms time limit",
            query_id,
            limit.as_millis()
        ),
    )
    .with_trace_id(query_id)
}

fn shutdown_error() -> SluiceError {
    SluiceError::new(ErrorCode::SchedulerShutdown, "Scheduler is shutting down")
}

#[cfg(test)]
mod tests {
    use super::*;
    use sluice_common::models::{QueryData, StoreKind};
    use std::sync::atomic::AtomicU32;
    use tokio::sync::Notify;

    fn settings(max_concurrent: usize) -> SchedulerSettings {
        SchedulerSettings {
            max_concurrent,
            sample_interval_ms: 20,
            ..SchedulerSettings::default()
        }
    }

    fn fast_retry() -> RetrySettings {
        RetrySettings {
            max_attempts: 3,
            base_delay_ms: 1,
            max_delay_ms: 5,
        }
    }

    fn scheduler(max_concurrent: usize) -> Scheduler {
        Scheduler::new(
            settings(max_concurrent),
            fast_retry(),
            Arc::new(StaticProbe::new(0.0, 0.0)),
        )
    }

    fn response(id: &str) -> QueryResponse {
        QueryResponse {
            query_id: id.to_string(),
            data: QueryData::default(),
            execution_time_ms: 0,
            store_used: StoreKind::Oltp,
            rows_affected: None,
            cache_hit: false,
            applied_optimizations: Vec::new(),
            warnings: Vec::new(),
        }
    }

    fn gated_job(id: &str, priority: Priority, gate: Arc<Notify>, order: Arc<Mutex<Vec<String>>>) -> Job {
        let name = id.to_string();
        Job::new(id, "user:test", move |_| {
            let gate = gate.clone();
            let order = order.clone();
            let name = name.clone();
            async move {
                order.lock().push(name.clone());
                gate.notified().await;
                Ok(response(&name))
            }
        })
        .with_priority(priority)
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_concurrency_is_bounded() {
        let max = 3;
        let sched = scheduler(max);
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for i in 0..max + 5 {
            let active = active.clone();
            let peak = peak.clone();
            let job = Job::new(format!("q{}", i), format!("user:{}", i), move |_| {
                let active = active.clone();
                let peak = peak.clone();
                async move {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(30)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                    Ok(response("q"))
                }
            });
            let sched = sched.clone();
            handles.push(tokio::spawn(async move { sched.submit(job).await }));
        }

        for handle in handles {
            assert!(handle.await.unwrap().is_ok());
        }
        assert!(peak.load(Ordering::SeqCst) <= max);
        assert_eq!(sched.stats().completed, (max + 5) as u64);
        assert_eq!(sched.stats().running, 0);
    }

    #[tokio::test]
    async fn test_higher_priority_dispatched_first() {
        let sched = scheduler(1);
        let gate = Arc::new(Notify::new());
        let order = Arc::new(Mutex::new(Vec::new()));

        let blocker = {
            let sched = sched.clone();
            let job = gated_job("blocker", Priority::Normal, gate.clone(), order.clone());
            tokio::spawn(async move { sched.submit(job).await })
        };
        wait_until(|| order.lock().len() == 1).await;

        let mut waiting = Vec::new();
        for (id, priority) in [
            ("low", Priority::Low),
            ("critical", Priority::Critical),
            ("normal", Priority::Normal),
        ] {
            let sched = sched.clone();
            let job = gated_job(id, priority, gate.clone(), order.clone());
            waiting.push(tokio::spawn(async move { sched.submit(job).await }));
        }
        wait_until(|| sched.stats().queued == 3).await;

        for _ in 0..4 {
            let before = order.lock().len();
            gate.notify_one();
            wait_until(|| order.lock().len() > before || sched.stats().running == 0).await;
        }
        blocker.await.unwrap().unwrap();
        for handle in waiting {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(
            *order.lock(),
            vec!["blocker", "critical", "normal", "low"]
        );
    }

    #[tokio::test]
    async fn test_cancel_queued_query() {
        let sched = scheduler(1);
        let gate = Arc::new(Notify::new());
        let order = Arc::new(Mutex::new(Vec::new()));

        let blocker = {
            let sched = sched.clone();
            let job = gated_job("blocker", Priority::Normal, gate.clone(), order.clone());
            tokio::spawn(async move { sched.submit(job).await })
        };
        wait_until(|| order.lock().len() == 1).await;

        let queued = {
            let sched = sched.clone();
            let job = gated_job("victim", Priority::Normal, gate.clone(), order.clone());
            tokio::spawn(async move { sched.submit(job).await })
        };
        wait_until(|| sched.stats().queued == 1).await;

        sched.cancel("victim").unwrap();
        let err = queued.await.unwrap().unwrap_err();
        assert_eq!(err.code, ErrorCode::QueryCancelled);
        assert_eq!(
            sched.record("victim").unwrap().status,
            ExecutionStatus::Cancelled
        );

        gate.notify_one();
        blocker.await.unwrap().unwrap();
        assert_eq!(*order.lock(), vec!["blocker"]);
        assert_eq!(sched.cancel("blocker").unwrap_err().code, ErrorCode::UnknownQuery);
    }

    #[tokio::test]
    async fn test_cancel_running_query() {
        let sched = scheduler(2);
        let started = Arc::new(AtomicBool::new(false));
        let flag = started.clone();
        let job = Job::new("long", "user:test", move |token| {
            let flag = flag.clone();
            async move {
                flag.store(true, Ordering::SeqCst);
                token.cancelled().await;
                Ok(response("long"))
            }
        });
        let handle = {
            let sched = sched.clone();
            tokio::spawn(async move { sched.submit(job).await })
        };
        wait_until(|| started.load(Ordering::SeqCst)).await;

        sched.cancel("long").unwrap();
        let err = handle.await.unwrap().unwrap_err();
        assert!(err.is_cancellation());
        let record = sched.record("long").unwrap();
        assert_eq!(record.status, ExecutionStatus::Cancelled);
        assert!(record.finished_at.is_some());
        assert_eq!(sched.stats().failed, 0);
    }

    #[tokio::test]
    async fn test_daily_cap_fails_immediately() {
        let sched = scheduler(4);
        sched
            .set_quota(
                "project:capped",
                ResourceQuota {
                    daily_query_cap: 1,
                    ..ResourceQuota::default()
                },
            )
            .unwrap();

        let ok = Job::new("first", "project:capped", |_| async { Ok(response("first")) });
        sched.submit(ok).await.unwrap();

        let over = Job::new("second", "project:capped", |_| async { Ok(response("second")) });
        let err = sched.submit(over).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::QuotaExceeded);
        assert!(matches!(err.context, Some(ErrorContext::Quota { limit: 1, .. })));
        assert_eq!(sched.record("second").unwrap().status, ExecutionStatus::Failed);
        assert_eq!(sched.stats().rejected, 1);
    }

    #[tokio::test]
    async fn test_invalid_quota_rejected() {
        let sched = scheduler(1);
        let err = sched
            .set_quota(
                "user:x",
                ResourceQuota {
                    max_concurrent_queries: 0,
                    ..ResourceQuota::default()
                },
            )
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidConfig);
        assert_eq!(sched.get_quota("user:x"), ResourceQuota::default());
    }

    #[tokio::test]
    async fn test_timeout_marks_record() {
        let sched = scheduler(1);
        let job = Job::new("slow", "user:test", |_| async {
            tokio::time::sleep(Duration::from_millis(500)).await;
            Ok(response("slow"))
        })
        .with_timeout(Duration::from_millis(20));

        let err = sched.submit(job).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::ExecutionTimeout);
        assert_eq!(sched.record("slow").unwrap().status, ExecutionStatus::Timeout);
        assert_eq!(sched.stats().timed_out, 1);
    }

    #[tokio::test]
    async fn test_idempotent_job_retried_on_transient_failure() {
        let sched = scheduler(1);
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let job = Job::new("flaky", "user:test", move |_| {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(SluiceError::execution("oltp", "database is locked", true))
                } else {
                    Ok(response("flaky"))
                }
            }
        })
        .idempotent(true);

        sched.submit(job).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(sched.record("flaky").unwrap().retry_count, 2);

        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let write = Job::new("write", "user:test", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err(SluiceError::execution("oltp", "database is locked", true)) }
        });
        assert!(sched.submit(write).await.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_pressure_throttles_low_priority_until_relaxed() {
        let probe = Arc::new(StaticProbe::new(100.0, 100.0));
        let sched = Scheduler::new(settings(4), fast_retry(), probe.clone());
        assert_eq!(sched.sample_now(), 70.0);

        let low = {
            let sched = sched.clone();
            let job = Job::new("low", "user:a", |_| async { Ok(response("low")) })
                .with_priority(Priority::Low);
            tokio::spawn(async move { sched.submit(job).await })
        };
        wait_until(|| sched.stats().queued == 1).await;

        let critical = Job::new("critical", "user:b", |_| async { Ok(response("critical")) })
            .with_priority(Priority::Critical);
        sched.submit(critical).await.unwrap();
        assert_eq!(sched.stats().queued, 1);
        assert!(sched.stats().throttled.contains(&Priority::Low));

        probe.set(0.0, 0.0);
        sched.sample_now();
        low.await.unwrap().unwrap();
        assert_eq!(sched.record("low").unwrap().status, ExecutionStatus::Completed);
    }

    #[tokio::test]
    async fn test_shutdown_fails_queued_work() {
        let sched = scheduler(1);
        sched.start();
        let gate = Arc::new(Notify::new());
        let order = Arc::new(Mutex::new(Vec::new()));

        let running = {
            let sched = sched.clone();
            let job = Job::new("running", "user:test", |token| async move {
                token.cancelled().await;
                Ok(response("running"))
            });
            tokio::spawn(async move { sched.submit(job).await })
        };
        wait_until(|| sched.stats().running == 1).await;
        let queued = {
            let sched = sched.clone();
            let job = gated_job("queued", Priority::Normal, gate, order);
            tokio::spawn(async move { sched.submit(job).await })
        };
        wait_until(|| sched.stats().queued == 1).await;

        sched.shutdown().await;
        assert!(running.await.unwrap().unwrap_err().is_cancellation());
        assert_eq!(
            queued.await.unwrap().unwrap_err().code,
            ErrorCode::SchedulerShutdown
        );

        let late = Job::new("late", "user:test", |_| async { Ok(response("late")) });
        assert_eq!(
            sched.submit(late).await.unwrap_err().code,
            ErrorCode::SchedulerShutdown
        );
    }
}
