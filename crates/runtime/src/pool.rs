//! Per-store connection pools.
//!
//! A semaphore bounds open connections at `max_connections`: every open
//! connection outside the idle list is covered by a permit, including ones
//! being opened or pinged by the background loops. Handles return
//! their connection when dropped, or through [`ConnectionPool::release`] when
//! the caller knows whether the connection is still usable. Two background
//! loops per pool ping idle connections and reap expired ones.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use sluice_common::config::{LoadBalancing, PoolSettings};
use sluice_common::models::StoreKind;
use sluice_error::{ErrorCode, ErrorContext, SluiceError};

use crate::store::{ConnectionFactory, StoreConnection, StoreError, StoreResponse};

/// Weight of the newest sample in the latency average.
const LATENCY_EWMA_ALPHA: f64 = 0.2;

/// Rolling per-connection figures.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionMetrics {
    pub id: u64,
    #[serde(skip)]
    pub created_at: Instant,
    #[serde(skip)]
    pub last_used: Instant,
    pub attempts: u64,
    pub successes: u64,
    pub avg_latency_ms: f64,
}

impl ConnectionMetrics {
    fn new(id: u64) -> Self {
        let now = Instant::now();
        Self {
            id,
            created_at: now,
            last_used: now,
            attempts: 0,
            successes: 0,
            avg_latency_ms: 0.0,
        }
    }

    fn record(&mut self, latency: Duration, ok: bool) {
        let ms = latency.as_secs_f64() * 1000.0;
        self.avg_latency_ms = if self.attempts == 0 {
            ms
        } else {
            LATENCY_EWMA_ALPHA * ms + (1.0 - LATENCY_EWMA_ALPHA) * self.avg_latency_ms
        };
        self.attempts += 1;
        if ok {
            self.successes += 1;
        }
        self.last_used = Instant::now();
    }
}

struct PoolEntry {
    conn: Box<dyn StoreConnection>,
    metrics: ConnectionMetrics,
}

#[derive(Debug, Default)]
struct AtomicPoolStats {
    created: AtomicU64,
    closed: AtomicU64,
    acquisitions: AtomicU64,
    exhausted: AtomicU64,
    total_wait_ms: AtomicU64,
    executions: AtomicU64,
    failures: AtomicU64,
    health_check_failures: AtomicU64,
    /// Health passes in a row that found a broken connection or could not connect.
    failed_checks: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub store: StoreKind,
    pub total: usize,
    pub active: usize,
    pub idle: usize,
    pub max_connections: usize,
    pub utilization_pct: f64,
    /// 0 (unusable) to 100 (healthy).
    pub health_score: f64,
    pub error_rate: f64,
    pub connections_created: u64,
    pub connections_closed: u64,
    pub acquisitions: u64,
    pub exhausted_count: u64,
    pub avg_wait_ms: f64,
    pub health_check_failures: u64,
}

/// A connection on loan from a pool.
pub struct PooledConnection {
    entry: Option<PoolEntry>,
    permit: Option<OwnedSemaphorePermit>,
    pool: Arc<ConnectionPool>,
    broken: bool,
}

impl PooledConnection {
    pub async fn execute(
        &mut self,
        sql: &str,
        params: &[serde_json::Value],
    ) -> Result<StoreResponse, StoreError> {
        let entry = self.entry.as_mut().ok_or(StoreError::Closed)?;
        let started = Instant::now();
        let result = entry.conn.execute(sql, params).await;
        entry.metrics.record(started.elapsed(), result.is_ok());

        self.pool.stats.executions.fetch_add(1, Ordering::Relaxed);
        if let Err(e) = &result {
            self.pool.stats.failures.fetch_add(1, Ordering::Relaxed);
            if matches!(e, StoreError::Connect(_) | StoreError::Closed) {
                self.broken = true;
            }
        }
        result
    }

    pub async fn ping(&mut self) -> Result<(), StoreError> {
        let entry = self.entry.as_mut().ok_or(StoreError::Closed)?;
        let result = entry.conn.ping().await;
        if result.is_err() {
            self.broken = true;
        }
        result
    }

    pub fn metrics(&self) -> Option<&ConnectionMetrics> {
        self.entry.as_ref().map(|e| &e.metrics)
    }

    pub fn store(&self) -> StoreKind {
        self.pool.store
    }

    /// Whether a failure during use means the connection must not be reused.
    pub fn is_broken(&self) -> bool {
        self.broken
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        let Some(entry) = self.entry.take() else { return };
        let permit = self.permit.take();
        let pool = self.pool.clone();
        let healthy = !self.broken;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    pool.return_entry(entry, healthy).await;
                    drop(permit);
                });
            }
            Err(_) => {
                pool.active.fetch_sub(1, Ordering::AcqRel);
                pool.discard(entry.metrics.id);
                drop(permit);
            }
        }
    }
}

pub struct ConnectionPool {
    store: StoreKind,
    settings: PoolSettings,
    factory: Arc<dyn ConnectionFactory>,
    idle: Mutex<Vec<PoolEntry>>,
    semaphore: Arc<Semaphore>,
    total: AtomicUsize,
    active: AtomicUsize,
    next_id: AtomicU64,
    round_robin: AtomicUsize,
    stats: AtomicPoolStats,
    closed: AtomicBool,
    cancel: CancellationToken,
    workers: parking_lot::Mutex<Vec<JoinHandle<()>>>,
    self_ref: Weak<ConnectionPool>,
}

impl ConnectionPool {
    /// Create the pool and open `min_connections` eagerly. Failures to open
    /// the initial connections are logged; acquisition retries later.
    pub async fn new(
        store: StoreKind,
        settings: PoolSettings,
        factory: Arc<dyn ConnectionFactory>,
    ) -> Arc<Self> {
        let pool = Arc::new_cyclic(|self_ref| Self {
            store,
            semaphore: Arc::new(Semaphore::new(settings.max_connections.max(1))),
            idle: Mutex::new(Vec::with_capacity(settings.max_connections)),
            settings,
            factory,
            total: AtomicUsize::new(0),
            active: AtomicUsize::new(0),
            next_id: AtomicU64::new(1),
            round_robin: AtomicUsize::new(0),
            stats: AtomicPoolStats::default(),
            closed: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            workers: parking_lot::Mutex::new(Vec::new()),
            self_ref: self_ref.clone(),
        });

        let opened = pool.fill_to_min().await;
        info!(
            target: "pool",
            store = %store,
            target_store = %pool.factory.describe(),
            opened,
            max = pool.settings.max_connections,
            "Connection pool ready"
        );
        pool
    }

    pub fn store(&self) -> StoreKind {
        self.store
    }

    /// Launch the health and reaper loops.
    pub fn start(&self) {
        let Some(pool) = self.self_ref.upgrade() else { return };
        let health_every = Duration::from_secs(self.settings.health_check_interval_secs.max(1));
        let reap_every = Duration::from_secs(self.settings.reaper_interval_secs.max(1));

        let health = {
            let pool = pool.clone();
            let cancel = self.cancel.clone();
            tokio::spawn(async move {
                let mut ticker =
                    tokio::time::interval_at(tokio::time::Instant::now() + health_every, health_every);
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = ticker.tick() => {
                            pool.health_check().await;
                        }
                    }
                }
                debug!(target: "pool", store = %pool.store, "Health loop stopped");
            })
        };
        let reaper = {
            let cancel = self.cancel.clone();
            tokio::spawn(async move {
                let mut ticker =
                    tokio::time::interval_at(tokio::time::Instant::now() + reap_every, reap_every);
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = ticker.tick() => {
                            pool.reap().await;
                        }
                    }
                }
                debug!(target: "pool", store = %pool.store, "Reaper stopped");
            })
        };
        self.workers.lock().extend([health, reaper]);
    }

    /// Borrow a connection, waiting at most `timeout` for capacity.
    pub async fn acquire(&self, timeout: Duration) -> sluice_error::Result<PooledConnection> {
        if self.closed.load(Ordering::Acquire) {
            return Err(SluiceError::new(
                ErrorCode::StoreUnavailable,
                format!("{} pool is shut down", self.store),
            ));
        }
        let pool = self.self_ref.upgrade().ok_or_else(|| {
            SluiceError::internal(format!("{} pool has been dropped", self.store))
        })?;

        let started = Instant::now();
        let permit = match tokio::time::timeout(timeout, self.semaphore.clone().acquire_owned()).await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => {
                return Err(SluiceError::new(
                    ErrorCode::StoreUnavailable,
                    format!("{} pool is shut down", self.store),
                ))
            }
            Err(_) => {
                self.stats.exhausted.fetch_add(1, Ordering::Relaxed);
                let waited_ms = started.elapsed().as_millis() as u64;
                warn!(target: "pool", store = %self.store, waited_ms, "Pool exhausted");
                return Err(SluiceError::new(
                    ErrorCode::PoolExhausted,
                    format!("No {} connection available within {}ms", self.store, timeout.as_millis()),
                )
                .with_context(ErrorContext::Pool {
                    store: self.store.to_string(),
                    active: self.active.load(Ordering::Acquire),
                    max_connections: self.settings.max_connections,
                    waited_ms,
                })
                .with_hint("Raise max_connections or lower concurrency for this store"));
            }
        };

        let entry = match self.take_idle().await {
            Some(entry) => entry,
            None => self.open().await.map_err(|e| {
                self.stats.failed_checks.fetch_add(1, Ordering::Relaxed);
                e
            })?,
        };

        self.active.fetch_add(1, Ordering::AcqRel);
        self.stats.acquisitions.fetch_add(1, Ordering::Relaxed);
        self.stats
            .total_wait_ms
            .fetch_add(started.elapsed().as_millis() as u64, Ordering::Relaxed);

        Ok(PooledConnection {
            entry: Some(entry),
            permit: Some(permit),
            pool,
            broken: false,
        })
    }

    /// Return a handle now. An unhealthy connection is closed instead of reused.
    pub async fn release(&self, mut handle: PooledConnection, healthy: bool) {
        let Some(entry) = handle.entry.take() else { return };
        let permit = handle.permit.take();
        self.return_entry(entry, healthy && !handle.broken).await;
        drop(permit);
    }

    fn should_recycle(&self, metrics: &ConnectionMetrics) -> bool {
        metrics.created_at.elapsed() > self.settings.max_lifetime()
            || metrics.last_used.elapsed() > self.settings.idle_timeout()
    }

    async fn take_idle(&self) -> Option<PoolEntry> {
        let mut idle = self.idle.lock().await;
        let mut expired = Vec::new();
        let mut i = 0;
        while i < idle.len() {
            if self.should_recycle(&idle[i].metrics) {
                expired.push(idle.swap_remove(i));
            } else {
                i += 1;
            }
        }
        let picked = if idle.is_empty() {
            None
        } else {
            let index = match self.settings.load_balancing {
                LoadBalancing::RoundRobin => self.round_robin.fetch_add(1, Ordering::Relaxed) % idle.len(),
                LoadBalancing::LeastUsed => idle
                    .iter()
                    .enumerate()
                    .min_by_key(|(_, e)| e.metrics.attempts)
                    .map_or(0, |(i, _)| i),
                LoadBalancing::LatencyWeighted => idle
                    .iter()
                    .enumerate()
                    .min_by(|(_, a), (_, b)| {
                        a.metrics
                            .avg_latency_ms
                            .total_cmp(&b.metrics.avg_latency_ms)
                            .then(a.metrics.attempts.cmp(&b.metrics.attempts))
                    })
                    .map_or(0, |(i, _)| i),
            };
            Some(idle.swap_remove(index))
        };
        drop(idle);

        for entry in expired {
            self.close_entry(entry).await;
        }
        picked
    }

    async fn open(&self) -> sluice_error::Result<PoolEntry> {
        let connect = tokio::time::timeout(self.settings.connect_timeout(), self.factory.connect());
        let conn = match connect.await {
            Ok(Ok(conn)) => conn,
            Ok(Err(e)) => return Err(e.into_sluice(self.store)),
            Err(_) => {
                return Err(SluiceError::new(
                    ErrorCode::ConnectionTimeout,
                    format!(
                        "Connecting to {} store timed out after {}ms",
                        self.store, self.settings.connect_timeout_ms
                    ),
                )
                .with_context(ErrorContext::Pool {
                    store: self.store.to_string(),
                    active: self.active.load(Ordering::Acquire),
                    max_connections: self.settings.max_connections,
                    waited_ms: self.settings.connect_timeout_ms,
                }))
            }
        };
        self.total.fetch_add(1, Ordering::AcqRel);
        self.stats.created.fetch_add(1, Ordering::Relaxed);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        debug!(target: "pool", store = %self.store, connection = id, "Opened connection");
        Ok(PoolEntry {
            conn,
            metrics: ConnectionMetrics::new(id),
        })
    }

    async fn return_entry(&self, mut entry: PoolEntry, healthy: bool) {
        self.active.fetch_sub(1, Ordering::AcqRel);
        let expired = entry.metrics.created_at.elapsed() > self.settings.max_lifetime();
        if !healthy || expired || self.closed.load(Ordering::Acquire) {
            self.close_entry(entry).await;
            return;
        }
        entry.metrics.last_used = Instant::now();
        self.idle.lock().await.push(entry);
    }

    async fn close_entry(&self, entry: PoolEntry) {
        if let Err(e) = entry.conn.close().await {
            debug!(target: "pool", store = %self.store, error = %e, "Error closing connection");
        }
        self.discard(entry.metrics.id);
    }

    /// Account for a connection that is gone.
    fn discard(&self, id: u64) {
        self.total.fetch_sub(1, Ordering::AcqRel);
        self.stats.closed.fetch_add(1, Ordering::Relaxed);
        debug!(target: "pool", store = %self.store, connection = id, "Closed connection");
    }

    /// Open connections until `min_connections` exist. Returns how many opened.
    /// Stops early when every permit is taken, since callers are then
    /// opening connections themselves.
    async fn fill_to_min(&self) -> usize {
        let mut opened = 0;
        while !self.closed.load(Ordering::Acquire)
            && self.total.load(Ordering::Acquire) < self.settings.min_connections
        {
            let Ok(permit) = self.semaphore.clone().try_acquire_owned() else { break };
            match self.open().await {
                Ok(entry) => {
                    self.idle.lock().await.push(entry);
                    drop(permit);
                    opened += 1;
                }
                Err(e) => {
                    warn!(target: "pool", store = %self.store, error = %e, "Cannot open minimum connections");
                    self.stats.failed_checks.fetch_add(1, Ordering::Relaxed);
                    break;
                }
            }
        }
        opened
    }

    /// Ping idle connections one at a time, drop the ones that fail, then
    /// top up to the minimum. Returns `(checked, failed)`.
    ///
    /// Each pinged connection is covered by a permit while it is out of the
    /// idle list; when no permit is free the remaining connections are left
    /// for the next round.
    pub async fn health_check(&self) -> (usize, usize) {
        let mut seen = HashSet::new();
        let mut failed = 0;
        loop {
            let Ok(permit) = self.semaphore.clone().try_acquire_owned() else { break };
            let next = {
                let mut idle = self.idle.lock().await;
                idle.iter()
                    .position(|e| !seen.contains(&e.metrics.id))
                    .map(|i| idle.swap_remove(i))
            };
            let Some(mut entry) = next else { break };
            seen.insert(entry.metrics.id);

            let started = Instant::now();
            let outcome = tokio::time::timeout(self.settings.connect_timeout(), entry.conn.ping()).await;
            match outcome {
                Ok(Ok(())) => {
                    entry.metrics.record(started.elapsed(), true);
                    self.idle.lock().await.push(entry);
                }
                _ => {
                    failed += 1;
                    self.stats.health_check_failures.fetch_add(1, Ordering::Relaxed);
                    self.close_entry(entry).await;
                }
            }
            drop(permit);
        }
        let checked = seen.len();

        let before = self.stats.failed_checks.load(Ordering::Relaxed);
        self.fill_to_min().await;
        let fill_failed = self.stats.failed_checks.load(Ordering::Relaxed) > before;
        if failed == 0 && !fill_failed {
            self.stats.failed_checks.store(0, Ordering::Relaxed);
        } else if failed > 0 {
            self.stats.failed_checks.fetch_add(1, Ordering::Relaxed);
        }

        if failed > 0 {
            warn!(target: "pool", store = %self.store, checked, failed, "Health check dropped connections");
        } else {
            debug!(target: "pool", store = %self.store, checked, "Health check passed");
        }
        (checked, failed)
    }

    /// Close idle connections past their lifetime, and idle ones beyond the
    /// minimum that have sat unused past the idle timeout.
    pub async fn reap(&self) -> usize {
        let mut idle = self.idle.lock().await;
        let mut keep = Vec::with_capacity(idle.len());
        let mut reaped = Vec::new();
        let total = self.total.load(Ordering::Acquire);
        for entry in idle.drain(..) {
            let expired = entry.metrics.created_at.elapsed() > self.settings.max_lifetime();
            let stale = entry.metrics.last_used.elapsed() > self.settings.idle_timeout()
                && total.saturating_sub(reaped.len()) > self.settings.min_connections;
            if expired || stale {
                reaped.push(entry);
            } else {
                keep.push(entry);
            }
        }
        *idle = keep;
        drop(idle);

        let count = reaped.len();
        for entry in reaped {
            self.close_entry(entry).await;
        }
        if count > 0 {
            debug!(target: "pool", store = %self.store, count, "Reaped connections");
        }
        count
    }

    pub fn stats(&self) -> PoolStats {
        let total = self.total.load(Ordering::Acquire);
        let active = self.active.load(Ordering::Acquire);
        let max = self.settings.max_connections.max(1);
        let utilization = active as f64 / max as f64;

        let executions = self.stats.executions.load(Ordering::Relaxed);
        let error_rate = if executions == 0 {
            0.0
        } else {
            self.stats.failures.load(Ordering::Relaxed) as f64 / executions as f64
        };
        let acquisitions = self.stats.acquisitions.load(Ordering::Relaxed);
        let failed_checks = self.stats.failed_checks.load(Ordering::Relaxed);

        let mut score = 100.0;
        score -= 50.0 * error_rate;
        if utilization > 0.8 {
            score -= 20.0 * ((utilization - 0.8) / 0.2).min(1.0);
        }
        score -= (10.0 * failed_checks as f64).min(30.0);
        if self.closed.load(Ordering::Acquire) {
            score = 0.0;
        }

        PoolStats {
            store: self.store,
            total,
            active,
            idle: total.saturating_sub(active),
            max_connections: self.settings.max_connections,
            utilization_pct: utilization * 100.0,
            health_score: score.clamp(0.0, 100.0),
            error_rate,
            connections_created: self.stats.created.load(Ordering::Relaxed),
            connections_closed: self.stats.closed.load(Ordering::Relaxed),
            acquisitions,
            exhausted_count: self.stats.exhausted.load(Ordering::Relaxed),
            avg_wait_ms: if acquisitions == 0 {
                0.0
            } else {
                self.stats.total_wait_ms.load(Ordering::Relaxed) as f64 / acquisitions as f64
            },
            health_check_failures: self.stats.health_check_failures.load(Ordering::Relaxed),
        }
    }

    /// Stop the background loops, refuse new acquisitions and close idle
    /// connections. Connections on loan are closed when returned.
    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.cancel.cancel();
        self.semaphore.close();
        let workers: Vec<JoinHandle<()>> = std::mem::take(&mut *self.workers.lock());
        for worker in workers {
            if let Err(e) = worker.await {
                warn!(target: "pool", store = %self.store, error = %e, "Pool worker ended abnormally");
            }
        }
        let entries: Vec<PoolEntry> = std::mem::take(&mut *self.idle.lock().await);
        for entry in entries {
            self.close_entry(entry).await;
        }
        info!(target: "pool", store = %self.store, "Connection pool shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct FakeConnection {
        healthy: Arc<AtomicBool>,
        ping_delay: Duration,
    }

    #[async_trait]
    impl StoreConnection for FakeConnection {
        async fn execute(
            &self,
            sql: &str,
            _params: &[serde_json::Value],
        ) -> Result<StoreResponse, StoreError> {
            if sql == "fail" {
                return Err(StoreError::Query("bad".into()));
            }
            Ok(StoreResponse::default())
        }

        async fn ping(&self) -> Result<(), StoreError> {
            tokio::time::sleep(self.ping_delay).await;
            if self.healthy.load(Ordering::SeqCst) {
                Ok(())
            } else {
                Err(StoreError::Transient("down".into()))
            }
        }
    }

    struct FakeFactory {
        healthy: Arc<AtomicBool>,
        opened: AtomicUsize,
        ping_delay: Duration,
    }

    #[async_trait]
    impl ConnectionFactory for FakeFactory {
        async fn connect(&self) -> Result<Box<dyn StoreConnection>, StoreError> {
            self.opened.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(FakeConnection {
                healthy: self.healthy.clone(),
                ping_delay: self.ping_delay,
            }))
        }

        fn describe(&self) -> String {
            "fake".into()
        }
    }

    fn factory() -> (Arc<FakeFactory>, Arc<AtomicBool>) {
        slow_factory(Duration::ZERO)
    }

    fn slow_factory(ping_delay: Duration) -> (Arc<FakeFactory>, Arc<AtomicBool>) {
        let healthy = Arc::new(AtomicBool::new(true));
        (
            Arc::new(FakeFactory {
                healthy: healthy.clone(),
                opened: AtomicUsize::new(0),
                ping_delay,
            }),
            healthy,
        )
    }

    fn settings(min: usize, max: usize) -> PoolSettings {
        PoolSettings {
            min_connections: min,
            max_connections: max,
            ..PoolSettings::default()
        }
    }

    #[tokio::test]
    async fn test_bounds_and_exhaustion() {
        let (factory, _) = factory();
        let pool = ConnectionPool::new(StoreKind::Oltp, settings(1, 2), factory.clone()).await;
        assert_eq!(pool.stats().total, 1);

        let a = pool.acquire(Duration::from_millis(50)).await.unwrap();
        let b = pool.acquire(Duration::from_millis(50)).await.unwrap();
        assert_eq!(pool.stats().active, 2);
        assert_eq!(factory.opened.load(Ordering::SeqCst), 2);

        let err = pool.acquire(Duration::from_millis(20)).await.err().unwrap();
        assert_eq!(err.code, ErrorCode::PoolExhausted);
        assert!(err.is_retryable());

        pool.release(a, true).await;
        drop(b);
        let c = pool.acquire(Duration::from_millis(200)).await.unwrap();
        pool.release(c, true).await;
        assert_eq!(factory.opened.load(Ordering::SeqCst), 2);
        assert!(pool.stats().total <= 2);
    }

    #[tokio::test]
    async fn test_unhealthy_release_closes_connection() {
        let (factory, _) = factory();
        let pool = ConnectionPool::new(StoreKind::Olap, settings(0, 2), factory).await;
        let mut conn = pool.acquire(Duration::from_millis(50)).await.unwrap();
        assert!(conn.execute("fail", &[]).await.is_err());
        assert_eq!(conn.metrics().unwrap().attempts, 1);
        pool.release(conn, false).await;

        let stats = pool.stats();
        assert_eq!(stats.total, 0);
        assert_eq!(stats.connections_closed, 1);
        assert!((stats.error_rate - 1.0).abs() < f64::EPSILON);
        assert!(stats.health_score <= 50.0);
    }

    #[tokio::test]
    async fn test_health_check_drops_failed_connections() {
        let (factory, healthy) = factory();
        let pool = ConnectionPool::new(StoreKind::Oltp, settings(2, 4), factory).await;
        healthy.store(false, Ordering::SeqCst);
        let (checked, failed) = pool.health_check().await;
        assert_eq!((checked, failed), (2, 2));
        // Refilled with fresh connections.
        assert_eq!(pool.stats().total, 2);
        assert!(pool.stats().health_score < 100.0);

        healthy.store(true, Ordering::SeqCst);
        assert_eq!(pool.health_check().await, (2, 0));
        assert_eq!(pool.stats().health_score, 100.0);
    }

    #[tokio::test]
    async fn test_health_check_does_not_exceed_max_connections() {
        let (factory, _) = slow_factory(Duration::from_millis(200));
        let pool = ConnectionPool::new(StoreKind::Oltp, settings(2, 2), factory.clone()).await;
        assert_eq!(factory.opened.load(Ordering::SeqCst), 2);

        let checker = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.health_check().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let (a, b) = tokio::join!(
            pool.acquire(Duration::from_secs(2)),
            pool.acquire(Duration::from_secs(2))
        );
        let (a, b) = (a.unwrap(), b.unwrap());
        assert_eq!(factory.opened.load(Ordering::SeqCst), 2);
        assert!(pool.stats().total <= 2);

        pool.release(a, true).await;
        pool.release(b, true).await;
        let (_, failed) = checker.await.unwrap();
        assert_eq!(failed, 0);
        assert_eq!(pool.stats().total, 2);
        assert_eq!(factory.opened.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_reaper_respects_minimum() {
        let (factory, _) = factory();
        let mut s = settings(1, 4);
        s.idle_timeout_secs = 1;
        let pool = ConnectionPool::new(StoreKind::Oltp, s, factory).await;
        let a = pool.acquire(Duration::from_millis(50)).await.unwrap();
        let b = pool.acquire(Duration::from_millis(50)).await.unwrap();
        pool.release(a, true).await;
        pool.release(b, true).await;
        assert_eq!(pool.stats().total, 2);

        tokio::time::sleep(Duration::from_millis(1_100)).await;
        assert_eq!(pool.reap().await, 1);
        assert_eq!(pool.stats().total, 1);

        pool.start();
        pool.shutdown().await;
        assert_eq!(pool.stats().total, 0);
        let err = pool.acquire(Duration::from_millis(10)).await.err().unwrap();
        assert_eq!(err.code, ErrorCode::StoreUnavailable);
    }

    #[tokio::test]
    async fn test_least_used_balancing() {
        let (factory, _) = factory();
        let mut s = settings(2, 2);
        s.load_balancing = LoadBalancing::LeastUsed;
        let pool = ConnectionPool::new(StoreKind::Oltp, s, factory).await;

        let mut first = pool.acquire(Duration::from_millis(50)).await.unwrap();
        first.execute("SELECT 1", &[]).await.unwrap();
        let first_id = first.metrics().unwrap().id;
        pool.release(first, true).await;

        let second = pool.acquire(Duration::from_millis(50)).await.unwrap();
        assert_ne!(second.metrics().unwrap().id, first_id);
        pool.release(second, true).await;
    }
}
