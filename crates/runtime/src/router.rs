//! The query router.
//!
//! `submit` runs one query through classification, the result cache, the
//! optimizer and the scheduler, then executes it on the chosen store under
//! that store's circuit breaker. Everything else on [`QueryRouter`] is
//! administration: quotas, rules, cache invalidation, pool and breaker
//! status, metrics and health.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use sluice_common::circuit_breaker::{BreakerSnapshot, CircuitBreaker, CircuitBreakerConfig, CircuitState};
use sluice_common::config::{AppConfig, RewritePolicy, StoreSettings};
use sluice_common::models::{
    ExecutionRecord, OptimizedQuery, QueryCategory, QueryData, QueryMetadata, QueryRequest,
    QueryResponse, ResourceQuota, RuleOutcome, StoreKind,
};
use sluice_common::tenant::TenantContext;
use sluice_common::warnings::{add_warning, collect_warnings};
use sluice_error::{ErrorCode, SluiceError};

use crate::cache::{CacheEntryInfo, CacheManager, CacheStats, InvalidationScope, LayoutReport};
use crate::classifier::{ClassifierCacheStats, QueryClassifier};
use crate::events::{EventBus, QueryEvent};
use crate::health::{HealthReport, StoreHealth};
use crate::metrics::{MetricsSnapshot, Outcome, RouterMetrics};
use crate::optimizer::{QueryOptimizer, RuleInfo};
use crate::pool::{ConnectionPool, PoolStats};
use crate::scheduler::{Job, Scheduler, SchedulerStats, SysinfoProbe, SystemProbe};
use crate::sql_shape::hash_text;
use crate::store::{ConnectionFactory, SqliteFactory, StoreResponse};

const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(60);
const HEALTH_PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Connection factories for the two stores.
pub struct StoreFactories {
    pub oltp: Arc<dyn ConnectionFactory>,
    pub olap: Arc<dyn ConnectionFactory>,
}

impl StoreFactories {
    /// SQLite files named by each store's `url`.
    pub fn sqlite(stores: &StoreSettings) -> Self {
        Self {
            oltp: Arc::new(SqliteFactory::new(&stores.oltp.url)),
            olap: Arc::new(SqliteFactory::new(&stores.olap.url)),
        }
    }
}

/// What the result cache keeps for one query.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CachedResult {
    data: QueryData,
    rows_affected: Option<u64>,
    store_used: StoreKind,
    applied_optimizations: Vec<String>,
}

impl CachedResult {
    fn from_response(response: &QueryResponse) -> Self {
        Self {
            data: response.data.clone(),
            rows_affected: response.rows_affected,
            store_used: response.store_used,
            applied_optimizations: response.applied_optimizations.clone(),
        }
    }

    fn into_response(self, query_id: &str) -> QueryResponse {
        QueryResponse {
            query_id: query_id.to_string(),
            data: self.data,
            execution_time_ms: 0,
            store_used: self.store_used,
            rows_affected: self.rows_affected,
            cache_hit: true,
            applied_optimizations: self.applied_optimizations,
            warnings: Vec::new(),
        }
    }
}

/// Everything an execution needs, shared by all of its attempts.
struct ExecutionPlan {
    query_id: String,
    original: String,
    rewritten: String,
    strategies: Vec<String>,
    params: Vec<serde_json::Value>,
    store: StoreKind,
    is_write: bool,
    shadow: bool,
}

impl ExecutionPlan {
    fn is_rewritten(&self) -> bool {
        self.original != self.rewritten
    }
}

struct Backend {
    pool: Arc<ConnectionPool>,
    breaker: CircuitBreaker,
    acquire_timeout: Duration,
}

struct RouterCore {
    config: AppConfig,
    classifier: QueryClassifier,
    optimizer: QueryOptimizer,
    cache: CacheManager,
    oltp: Backend,
    olap: Backend,
    metrics: RouterMetrics,
    events: EventBus,
}

pub struct QueryRouter {
    core: Arc<RouterCore>,
    scheduler: Scheduler,
    shutdown: CancellationToken,
    stopped: AtomicBool,
    maintenance: Mutex<Option<JoinHandle<()>>>,
}

impl QueryRouter {
    /// Build every component and launch the background workers.
    pub async fn start(config: AppConfig, factories: StoreFactories) -> sluice_error::Result<Self> {
        Self::start_with_probe(config, factories, Arc::new(SysinfoProbe::new())).await
    }

    pub async fn start_with_probe(
        config: AppConfig,
        factories: StoreFactories,
        probe: Arc<dyn SystemProbe>,
    ) -> sluice_error::Result<Self> {
        let classifier = QueryClassifier::new(&config.classifier);
        let optimizer = QueryOptimizer::new(&config.optimizer, classifier.statistics())?;
        let cache = CacheManager::new(&config.cache).await;
        let metrics = RouterMetrics::new(config.router.latency_samples).map_err(|e| {
            SluiceError::internal(format!("Failed to register router metrics: {}", e))
        })?;

        let oltp = Backend::open(StoreKind::Oltp, &config, factories.oltp).await;
        let olap = Backend::open(StoreKind::Olap, &config, factories.olap).await;

        let scheduler = Scheduler::new(config.scheduler.clone(), config.retry, probe);
        {
            let pools = [oltp.pool.clone(), olap.pool.clone()];
            scheduler.set_connection_gauge(move || {
                let (active, max) = pools.iter().fold((0, 0), |(active, max), pool| {
                    let stats = pool.stats();
                    (active + stats.active, max + stats.max_connections)
                });
                active as f64 / max.max(1) as f64
            });
        }
        scheduler.start();

        let core = Arc::new(RouterCore {
            config,
            classifier,
            optimizer,
            cache,
            oltp,
            olap,
            metrics,
            events: EventBus::default(),
        });

        let router = Self {
            core,
            scheduler,
            shutdown: CancellationToken::new(),
            stopped: AtomicBool::new(false),
            maintenance: Mutex::new(None),
        };
        router.spawn_maintenance();
        info!(
            target: "router",
            oltp = %router.core.oltp.pool.stats().total,
            olap = %router.core.olap.pool.stats().total,
            rewrite_policy = ?router.core.config.router.rewrite_policy,
            "Query router started"
        );
        Ok(router)
    }

    fn spawn_maintenance(&self) {
        let core = self.core.clone();
        let scheduler = self.scheduler.clone();
        let cancel = self.shutdown.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(
                tokio::time::Instant::now() + MAINTENANCE_INTERVAL,
                MAINTENANCE_INTERVAL,
            );
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let report = core.cache.optimize_layout().await;
                        debug!(target: "router", ?report, "Cache maintenance pass");
                        let stats = scheduler.stats();
                        core.metrics.set_load(stats.running, stats.queued);
                    }
                }
            }
        });
        *self.maintenance.lock() = Some(handle);
    }

    /// Run one query and return its result.
    pub async fn submit(&self, request: QueryRequest) -> sluice_error::Result<QueryResponse> {
        self.submit_with_id(Uuid::new_v4().to_string(), request)
            .await
    }

    /// Like [`submit`](Self::submit) with a caller-chosen id, so the query can
    /// be cancelled while it runs.
    pub async fn submit_with_id(
        &self,
        query_id: String,
        request: QueryRequest,
    ) -> sluice_error::Result<QueryResponse> {
        let started = Instant::now();
        let span = info_span!(target: "router", "submit", query_id = %query_id);
        let (result, mut warnings) =
            collect_warnings(self.route(&query_id, request, started).instrument(span)).await;

        match result {
            Ok(mut response) => {
                warnings.append(&mut response.warnings);
                response.warnings = warnings;
                response.execution_time_ms = started.elapsed().as_millis() as u64;
                Ok(response)
            }
            Err(e) if e.trace_id.is_none() => Err(e.with_trace_id(query_id)),
            Err(e) => Err(e),
        }
    }

    async fn route(
        &self,
        query_id: &str,
        request: QueryRequest,
        started: Instant,
    ) -> sluice_error::Result<QueryResponse> {
        let core = &self.core;
        if request.sql.trim().is_empty() {
            return Err(SluiceError::new(ErrorCode::InvalidQuery, "Query text is empty"));
        }

        let metadata = core
            .classifier
            .classify(&request.sql, request.explicit_type.as_deref());
        core.events.emit(QueryEvent::Classified {
            query_id: query_id.to_string(),
            category: metadata.category,
            target: metadata.target,
            confidence: metadata.confidence,
            reason: metadata.routing_reason.clone(),
        });

        let cache_key = (request.use_cache && core.cache.is_enabled() && !metadata.is_write())
            .then(|| result_cache_key(&metadata, &request));
        // Taken before execution so a concurrent invalidation drops our write.
        let ticket = core.cache.ticket();

        if let Some(key) = &cache_key {
            if let Some(hit) = core.cache.get::<CachedResult>(key).await {
                core.metrics.record_cache(true);
                core.events.emit(QueryEvent::CacheHit {
                    query_id: query_id.to_string(),
                    key: key.clone(),
                });
                let response = hit.into_response(query_id);
                let elapsed = started.elapsed().as_millis() as u64;
                core.metrics
                    .record_query(response.store_used, Outcome::Success, elapsed);
                core.events.emit(QueryEvent::Completed {
                    query_id: query_id.to_string(),
                    store: response.store_used,
                    duration_ms: elapsed,
                    rows: response.data.row_count(),
                    cache_hit: true,
                });
                return Ok(response);
            }
            core.metrics.record_cache(false);
            core.events.emit(QueryEvent::CacheMiss {
                query_id: query_id.to_string(),
                key: key.clone(),
            });
        }

        let optimized = if request.use_optimization {
            core.optimizer.optimize(&request.sql, &metadata)
        } else {
            OptimizedQuery::unchanged(&request.sql)
        };
        for (rule, outcome) in &optimized.outcomes {
            if let RuleOutcome::Failed(reason) = outcome {
                add_warning(format!("Rewrite rule {} skipped: {}", rule, reason));
            }
        }
        if optimized.is_rewritten() {
            core.events.emit(QueryEvent::Optimized {
                query_id: query_id.to_string(),
                strategies: optimized.strategies.clone(),
                improvement_pct: optimized.estimated_improvement_pct,
            });
        }

        let store = metadata
            .target
            .resolve(metadata.estimated_rows, core.config.classifier.olap_row_threshold);
        let shadow = core.config.router.rewrite_policy == RewritePolicy::Shadow;
        let plan = Arc::new(ExecutionPlan {
            query_id: query_id.to_string(),
            original: optimized.original,
            rewritten: optimized.rewritten,
            strategies: optimized.strategies,
            params: request.params.clone(),
            store,
            is_write: metadata.is_write(),
            shadow: shadow && !metadata.is_write(),
        });

        let timeout = Duration::from_secs(
            request
                .timeout_seconds
                .unwrap_or(core.config.router.default_timeout_secs)
                .max(1),
        );
        let job = {
            let core = core.clone();
            let plan = plan.clone();
            Job::new(query_id, request.tenant.quota_key(), move |token| {
                let core = core.clone();
                let plan = plan.clone();
                async move { core.execute(&plan, token).await }
            })
        }
        .with_priority(request.priority.unwrap_or(metadata.priority))
        .with_timeout(timeout)
        .idempotent(!metadata.is_write())
        .with_memory_mb(metadata.estimated_memory_mb);

        let result = self.scheduler.submit(job).await;
        self.sync_load();
        let elapsed = started.elapsed().as_millis() as u64;

        match result {
            Ok(response) => {
                core.metrics
                    .record_query(response.store_used, Outcome::Success, elapsed);
                core.metrics
                    .record_rewrites(&response.applied_optimizations);
                if let Some(key) = &cache_key {
                    let ttl = core.ttl_for(metadata.category);
                    let tags = result_tags(&metadata, &request.tenant);
                    core.cache
                        .put(key, &CachedResult::from_response(&response), ttl, tags, ticket)
                        .await;
                }
                if metadata.is_write() {
                    core.invalidate_tables(&metadata.tables).await;
                }
                core.events.emit(QueryEvent::Completed {
                    query_id: query_id.to_string(),
                    store: response.store_used,
                    duration_ms: elapsed,
                    rows: response.data.row_count(),
                    cache_hit: false,
                });
                Ok(response)
            }
            Err(e) => {
                let (outcome, event) = if e.is_cancellation() {
                    (
                        Outcome::Cancelled,
                        QueryEvent::Cancelled {
                            query_id: query_id.to_string(),
                        },
                    )
                } else if e.code == ErrorCode::ExecutionTimeout {
                    (
                        Outcome::Timeout,
                        QueryEvent::TimedOut {
                            query_id: query_id.to_string(),
                            duration_ms: elapsed,
                        },
                    )
                } else {
                    (
                        Outcome::Failure,
                        QueryEvent::Failed {
                            query_id: query_id.to_string(),
                            code: e.code.to_string(),
                            message: e.message.clone(),
                        },
                    )
                };
                core.metrics.record_query(store, outcome, elapsed);
                core.events.emit(event);
                Err(e)
            }
        }
    }

    fn sync_load(&self) {
        let stats = self.scheduler.stats();
        self.core.metrics.set_load(stats.running, stats.queued);
    }

    /// Cancel a queued or running query.
    pub fn cancel(&self, query_id: &str) -> sluice_error::Result<()> {
        self.scheduler.cancel(query_id)
    }

    pub fn execution(&self, query_id: &str) -> Option<ExecutionRecord> {
        self.scheduler.record(query_id)
    }

    pub fn history(&self, limit: usize) -> Vec<ExecutionRecord> {
        self.scheduler.history(limit)
    }

    pub fn get_quota(&self, tenant: &TenantContext) -> ResourceQuota {
        self.scheduler.get_quota(&tenant.quota_key())
    }

    pub fn set_quota(&self, tenant: &TenantContext, quota: ResourceQuota) -> sluice_error::Result<()> {
        self.scheduler.set_quota(&tenant.quota_key(), quota)
    }

    pub fn list_rules(&self) -> Vec<RuleInfo> {
        self.core.optimizer.list_rules()
    }

    pub fn enable_rule(&self, name: &str) -> sluice_error::Result<()> {
        self.core.optimizer.enable_rule(name)
    }

    pub fn disable_rule(&self, name: &str) -> sluice_error::Result<()> {
        self.core.optimizer.disable_rule(name)
    }

    pub async fn invalidate_cache(&self, scope: InvalidationScope) -> sluice_error::Result<u64> {
        let removed = self.core.cache.invalidate(scope.clone()).await?;
        info!(target: "router", ?scope, removed, "Cache invalidated");
        Ok(removed)
    }

    pub async fn optimize_cache(&self) -> LayoutReport {
        self.core.cache.optimize_layout().await
    }

    pub async fn inspect_cache(&self, key: &str) -> Option<CacheEntryInfo> {
        self.core.cache.inspect(key).await
    }

    /// Classification and rewrite for `sql` without running it.
    pub fn explain(
        &self,
        sql: &str,
        explicit_type: Option<&str>,
    ) -> (QueryMetadata, OptimizedQuery) {
        let metadata = self.core.classifier.classify(sql, explicit_type);
        let optimized = self.core.optimizer.optimize(sql, &metadata);
        (metadata, optimized)
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.core.cache.stats()
    }

    pub fn classifier_stats(&self) -> ClassifierCacheStats {
        self.core.classifier.cache_stats()
    }

    /// Record a new row count for a table and forget plans built on the old one.
    pub fn update_table_rows(&self, table: &str, rows: u64) {
        self.core.classifier.statistics().set(table, rows);
        self.core.classifier.clear_cache();
        self.core.optimizer.clear_cache();
        info!(target: "router", table, rows, "Table statistics updated");
    }

    pub fn pool_status(&self) -> Vec<PoolStats> {
        vec![self.core.oltp.pool.stats(), self.core.olap.pool.stats()]
    }

    pub fn breaker_status(&self) -> Vec<BreakerSnapshot> {
        vec![
            self.core.oltp.breaker.snapshot(),
            self.core.olap.breaker.snapshot(),
        ]
    }

    pub fn reset_breaker(&self, store: StoreKind) {
        self.core.backend(store).breaker.reset();
    }

    pub fn scheduler_stats(&self) -> SchedulerStats {
        self.scheduler.stats()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.sync_load();
        self.core.metrics.snapshot()
    }

    /// Prometheus text exposition of the router's registry.
    pub fn render_metrics(&self) -> String {
        self.sync_load();
        self.core.metrics.render()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueryEvent> {
        self.core.events.subscribe()
    }

    /// Ping each store and roll the results up with breaker and pool state.
    pub async fn health(&self) -> HealthReport {
        let mut stores = Vec::with_capacity(StoreKind::ALL.len());
        for store in StoreKind::ALL {
            let backend = self.core.backend(store);
            let probe = backend.ping().await;
            let pool = backend.pool.stats();
            stores.push(StoreHealth {
                store,
                reachable: probe.is_ok(),
                breaker: backend.breaker.state(),
                pool_health_score: pool.health_score,
                active_connections: pool.active,
                idle_connections: pool.idle,
                error: probe.err().map(|e| e.to_string()),
            });
        }
        HealthReport::new(stores, self.scheduler.stats().pressure_score)
    }

    /// Stop background work, fail queued queries, wait for running ones and
    /// close the pools.
    pub async fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(target: "router", "Shutting down query router");
        self.shutdown.cancel();
        let maintenance = self.maintenance.lock().take();
        if let Some(handle) = maintenance {
            if let Err(e) = handle.await {
                warn!(target: "router", error = %e, "Maintenance task ended abnormally");
            }
        }
        self.scheduler.shutdown().await;
        self.core.cache.flush().await;
        self.core.oltp.pool.shutdown().await;
        self.core.olap.pool.shutdown().await;
        info!(target: "router", "Query router stopped");
    }
}

impl Backend {
    async fn open(store: StoreKind, config: &AppConfig, factory: Arc<dyn ConnectionFactory>) -> Self {
        let settings = match store {
            StoreKind::Oltp => config.stores.oltp.clone(),
            StoreKind::Olap => config.stores.olap.clone(),
        };
        let acquire_timeout = settings.acquire_timeout();
        let pool = ConnectionPool::new(store, settings, factory).await;
        pool.start();
        Self {
            pool,
            breaker: CircuitBreaker::new(CircuitBreakerConfig::from_settings(
                store.as_str(),
                &config.circuit_breaker,
            )),
            acquire_timeout,
        }
    }

    async fn ping(&self) -> sluice_error::Result<()> {
        let mut conn = self.pool.acquire(HEALTH_PROBE_TIMEOUT).await?;
        let result = conn.ping().await;
        let healthy = result.is_ok();
        self.pool.release(conn, healthy).await;
        result.map_err(|e| e.into_sluice(self.pool.store()))
    }
}

impl RouterCore {
    fn backend(&self, store: StoreKind) -> &Backend {
        match store {
            StoreKind::Oltp => &self.oltp,
            StoreKind::Olap => &self.olap,
        }
    }

    fn ttl_for(&self, category: QueryCategory) -> Duration {
        let cache = &self.config.cache;
        let secs = match category {
            QueryCategory::PointLookup | QueryCategory::SimpleSelect => cache.transactional_ttl_secs,
            c if c.is_analytical() => cache.analytical_ttl_secs,
            _ => cache.default_ttl_secs,
        };
        Duration::from_secs(secs)
    }

    async fn invalidate_tables(&self, tables: &[String]) {
        for table in tables {
            match self
                .cache
                .invalidate(InvalidationScope::Table(table.clone()))
                .await
            {
                Ok(removed) => {
                    debug!(target: "router", table = %table, removed, "Invalidated cached reads after write")
                }
                Err(e) => {
                    warn!(target: "router", table = %table, error = %e, "Failed to invalidate cached reads")
                }
            }
        }
    }

    /// One attempt at running the plan. Called by the scheduler.
    async fn execute(
        &self,
        plan: &ExecutionPlan,
        token: CancellationToken,
    ) -> sluice_error::Result<QueryResponse> {
        let (result, warnings) = collect_warnings(self.execute_on_stores(plan, &token)).await;
        result.map(|mut response| {
            response.warnings.extend(warnings);
            response
        })
    }

    async fn execute_on_stores(
        &self,
        plan: &ExecutionPlan,
        token: &CancellationToken,
    ) -> sluice_error::Result<QueryResponse> {
        let mut store = plan.store;
        if store == StoreKind::Olap
            && self.may_fall_back(plan)
            && self.olap.breaker.state() == CircuitState::Open
        {
            self.fall_back(plan, "OLAP circuit breaker is open");
            store = StoreKind::Oltp;
        }

        let outcome = match self.run_plan(store, plan, token).await {
            Err(e)
                if store == StoreKind::Olap
                    && self.may_fall_back(plan)
                    && olap_unavailable(&e) =>
            {
                self.fall_back(plan, &e.message);
                store = StoreKind::Oltp;
                self.run_plan(store, plan, token).await
            }
            other => other,
        };
        let (response, applied) = outcome?;

        Ok(QueryResponse {
            query_id: plan.query_id.clone(),
            data: response.data,
            execution_time_ms: 0,
            store_used: store,
            rows_affected: response.rows_affected,
            cache_hit: false,
            applied_optimizations: applied,
            warnings: Vec::new(),
        })
    }

    fn may_fall_back(&self, plan: &ExecutionPlan) -> bool {
        !plan.is_write && self.config.router.fallback_to_oltp
    }

    fn fall_back(&self, plan: &ExecutionPlan, reason: &str) {
        add_warning(format!("OLAP unavailable ({}); query ran on OLTP", reason));
        self.metrics.record_fallback();
        self.events.emit(QueryEvent::Fallback {
            query_id: plan.query_id.clone(),
            from: StoreKind::Olap,
            to: StoreKind::Oltp,
            reason: reason.to_string(),
        });
    }

    /// Run the plan's text on `store`, returning the response and the
    /// rewrite strategies that actually took effect.
    async fn run_plan(
        &self,
        store: StoreKind,
        plan: &ExecutionPlan,
        token: &CancellationToken,
    ) -> sluice_error::Result<(StoreResponse, Vec<String>)> {
        if !plan.is_rewritten() {
            let response = self.run_on(store, &plan.original, plan, token).await?;
            return Ok((response, Vec::new()));
        }
        if !plan.shadow {
            let response = self.run_on(store, &plan.rewritten, plan, token).await?;
            return Ok((response, plan.strategies.clone()));
        }

        let original = self.run_on(store, &plan.original, plan, token).await?;
        match self.run_on(store, &plan.rewritten, plan, token).await {
            Ok(rewritten) if same_result(&original, &rewritten) => {
                Ok((rewritten, plan.strategies.clone()))
            }
            Ok(_) => {
                warn!(
                    target: "router",
                    query_id = %plan.query_id,
                    strategies = ?plan.strategies,
                    "Rewritten query returned different rows, keeping original result"
                );
                self.metrics.record_shadow_mismatch();
                add_warning("Rewritten query returned different rows; original result used");
                Ok((original, Vec::new()))
            }
            Err(e) if e.is_cancellation() => Err(e),
            Err(e) => {
                add_warning(format!("Rewritten query failed ({}); original result used", e.message));
                Ok((original, Vec::new()))
            }
        }
    }

    async fn run_on(
        &self,
        store: StoreKind,
        sql: &str,
        plan: &ExecutionPlan,
        token: &CancellationToken,
    ) -> sluice_error::Result<StoreResponse> {
        if token.is_cancelled() {
            return Err(SluiceError::cancelled(&plan.query_id));
        }
        let backend = self.backend(store);
        backend
            .breaker
            .execute(|| async {
                let mut conn = backend.pool.acquire(backend.acquire_timeout).await?;
                if token.is_cancelled() {
                    backend.pool.release(conn, true).await;
                    return Err(SluiceError::cancelled(&plan.query_id));
                }
                let result = conn.execute(sql, &plan.params).await;
                backend.pool.release(conn, true).await;
                result.map_err(|e| e.into_sluice(store))
            })
            .await
    }
}

/// Errors meaning OLAP could not take the query at all, as opposed to the
/// query failing there.
fn olap_unavailable(e: &SluiceError) -> bool {
    matches!(
        e.code,
        ErrorCode::CircuitOpen
            | ErrorCode::PoolExhausted
            | ErrorCode::StoreUnavailable
            | ErrorCode::ConnectionTimeout
    )
}

fn same_result(a: &StoreResponse, b: &StoreResponse) -> bool {
    a.rows_affected == b.rows_affected
        && a.data.columns == b.data.columns
        && a.data.sorted_rows() == b.data.sorted_rows()
}

/// Result-cache key: the normalized text, parameters, tenant and whether
/// rewriting was allowed, since a rewrite can change the rows returned.
fn result_cache_key(metadata: &QueryMetadata, request: &QueryRequest) -> String {
    let params = serde_json::to_string(&request.params).unwrap_or_default();
    let digest = hash_text(&format!(
        "{}|{}|{}|{}",
        metadata.cache_key,
        params,
        request.tenant.quota_key(),
        request.use_optimization
    ));
    format!("result:{}", &digest[..32])
}

fn result_tags(metadata: &QueryMetadata, tenant: &TenantContext) -> Vec<String> {
    let mut tags: Vec<String> = metadata
        .tables
        .iter()
        .map(|t| format!("table:{}", t.to_ascii_lowercase()))
        .collect();
    tags.extend(tenant.cache_tags());
    tags
}
