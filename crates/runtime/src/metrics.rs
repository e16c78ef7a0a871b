//! Router metrics.
//!
//! Each router owns its own `prometheus::Registry`, so several routers (or
//! tests) in one process never collide on metric names. Latency percentiles
//! are computed from a bounded window of recent samples.

use std::collections::{BTreeMap, VecDeque};

use parking_lot::Mutex;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use serde::Serialize;

use sluice_common::models::StoreKind;

/// Result of one submission as counted by the metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure,
    Timeout,
    Cancelled,
}

impl Outcome {
    const ALL: [Outcome; 4] = [
        Outcome::Success,
        Outcome::Failure,
        Outcome::Timeout,
        Outcome::Cancelled,
    ];

    fn as_str(&self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::Failure => "failure",
            Outcome::Timeout => "timeout",
            Outcome::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct LatencyPercentiles {
    pub p50_ms: u64,
    pub p95_ms: u64,
    pub p99_ms: u64,
    pub samples: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    /// Executed queries by store, all outcomes.
    pub queries_by_store: BTreeMap<String, u64>,
    pub outcomes: BTreeMap<String, u64>,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub cache_hit_rate: f64,
    pub fallbacks: u64,
    pub shadow_mismatches: u64,
    pub latency: LatencyPercentiles,
    pub active: i64,
    pub queued: i64,
}

pub struct RouterMetrics {
    registry: Registry,
    queries: IntCounterVec,
    cache_requests: IntCounterVec,
    duration: HistogramVec,
    fallbacks: IntCounter,
    shadow_mismatches: IntCounter,
    rewrites: IntCounterVec,
    active: IntGauge,
    queued: IntGauge,
    window: Mutex<VecDeque<u64>>,
    window_size: usize,
}

impl RouterMetrics {
    pub fn new(window_size: usize) -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let queries = IntCounterVec::new(
            Opts::new("sluice_queries_total", "Queries executed, by store and outcome"),
            &["store", "outcome"],
        )?;
        registry.register(Box::new(queries.clone()))?;

        let cache_requests = IntCounterVec::new(
            Opts::new("sluice_cache_requests_total", "Result cache lookups, by result"),
            &["result"],
        )?;
        registry.register(Box::new(cache_requests.clone()))?;

        let duration = HistogramVec::new(
            HistogramOpts::new(
                "sluice_query_duration_seconds",
                "End-to-end submission latency, by store",
            )
            .buckets(vec![
                0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0,
            ]),
            &["store"],
        )?;
        registry.register(Box::new(duration.clone()))?;

        let fallbacks = IntCounter::with_opts(Opts::new(
            "sluice_store_fallbacks_total",
            "Reads sent to OLTP because OLAP was unavailable",
        ))?;
        registry.register(Box::new(fallbacks.clone()))?;

        let shadow_mismatches = IntCounter::with_opts(Opts::new(
            "sluice_shadow_mismatches_total",
            "Rewritten queries whose results differed from the original",
        ))?;
        registry.register(Box::new(shadow_mismatches.clone()))?;

        let rewrites = IntCounterVec::new(
            Opts::new("sluice_rewrites_total", "Applied rewrite rules, by rule"),
            &["rule"],
        )?;
        registry.register(Box::new(rewrites.clone()))?;

        let active = IntGauge::with_opts(Opts::new(
            "sluice_active_queries",
            "Queries currently executing",
        ))?;
        registry.register(Box::new(active.clone()))?;

        let queued = IntGauge::with_opts(Opts::new(
            "sluice_queued_queries",
            "Queries waiting in the scheduler",
        ))?;
        registry.register(Box::new(queued.clone()))?;

        Ok(Self {
            registry,
            queries,
            cache_requests,
            duration,
            fallbacks,
            shadow_mismatches,
            rewrites,
            active,
            queued,
            window: Mutex::new(VecDeque::with_capacity(window_size)),
            window_size: window_size.max(1),
        })
    }

    pub fn record_query(&self, store: StoreKind, outcome: Outcome, elapsed_ms: u64) {
        self.queries
            .with_label_values(&[store.as_str(), outcome.as_str()])
            .inc();
        self.duration
            .with_label_values(&[store.as_str()])
            .observe(elapsed_ms as f64 / 1000.0);
        if outcome == Outcome::Success {
            let mut window = self.window.lock();
            if window.len() == self.window_size {
                window.pop_front();
            }
            window.push_back(elapsed_ms);
        }
    }

    pub fn record_cache(&self, hit: bool) {
        let label = if hit { "hit" } else { "miss" };
        self.cache_requests.with_label_values(&[label]).inc();
    }

    pub fn record_fallback(&self) {
        self.fallbacks.inc();
    }

    pub fn record_shadow_mismatch(&self) {
        self.shadow_mismatches.inc();
    }

    pub fn record_rewrites(&self, rules: &[String]) {
        for rule in rules {
            self.rewrites.with_label_values(&[rule.as_str()]).inc();
        }
    }

    pub fn set_load(&self, active: usize, queued: usize) {
        self.active.set(active as i64);
        self.queued.set(queued as i64);
    }

    pub fn latency(&self) -> LatencyPercentiles {
        let mut samples: Vec<u64> = self.window.lock().iter().copied().collect();
        samples.sort_unstable();
        LatencyPercentiles {
            p50_ms: percentile(&samples, 50.0),
            p95_ms: percentile(&samples, 95.0),
            p99_ms: percentile(&samples, 99.0),
            samples: samples.len(),
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let mut queries_by_store = BTreeMap::new();
        let mut outcomes = BTreeMap::new();
        for store in StoreKind::ALL {
            for outcome in Outcome::ALL {
                let count = self
                    .queries
                    .with_label_values(&[store.as_str(), outcome.as_str()])
                    .get();
                *queries_by_store.entry(store.to_string()).or_insert(0) += count;
                *outcomes.entry(outcome.as_str().to_string()).or_insert(0) += count;
            }
        }
        let cache_hits = self.cache_requests.with_label_values(&["hit"]).get();
        let cache_misses = self.cache_requests.with_label_values(&["miss"]).get();
        let lookups = cache_hits + cache_misses;

        MetricsSnapshot {
            queries_by_store,
            outcomes,
            cache_hits,
            cache_misses,
            cache_hit_rate: if lookups == 0 {
                0.0
            } else {
                cache_hits as f64 / lookups as f64
            },
            fallbacks: self.fallbacks.get(),
            shadow_mismatches: self.shadow_mismatches.get(),
            latency: self.latency(),
            active: self.active.get(),
            queued: self.queued.get(),
        }
    }

    /// Prometheus text exposition.
    pub fn render(&self) -> String {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        if let Err(e) = encoder.encode(&self.registry.gather(), &mut buffer) {
            tracing::warn!(target: "router", error = %e, "Failed to encode metrics");
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

/// Nearest-rank percentile over sorted samples.
fn percentile(sorted: &[u64], pct: f64) -> u64 {
    if sorted.is_empty() {
        return 0;
    }
    let rank = ((pct / 100.0) * sorted.len() as f64).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_percentiles_nearest_rank() {
        let samples: Vec<u64> = (1..=100).collect();
        assert_eq!(percentile(&samples, 50.0), 50);
        assert_eq!(percentile(&samples, 95.0), 95);
        assert_eq!(percentile(&samples, 99.0), 99);
        assert_eq!(percentile(&[], 50.0), 0);
        assert_eq!(percentile(&[7], 99.0), 7);
    }

    #[test]
    fn test_snapshot_and_render() {
        let metrics = RouterMetrics::new(16).unwrap();
        metrics.record_query(StoreKind::Olap, Outcome::Success, 40);
        metrics.record_query(StoreKind::Oltp, Outcome::Success, 2);
        metrics.record_query(StoreKind::Oltp, Outcome::Failure, 5);
        metrics.record_cache(true);
        metrics.record_cache(false);
        metrics.record_cache(false);
        metrics.record_fallback();
        metrics.set_load(3, 7);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.queries_by_store["olap"], 1);
        assert_eq!(snapshot.queries_by_store["oltp"], 2);
        assert_eq!(snapshot.outcomes["failure"], 1);
        assert!((snapshot.cache_hit_rate - 1.0 / 3.0).abs() < 1e-9);
        assert_eq!(snapshot.latency.samples, 2);
        assert_eq!(snapshot.queued, 7);

        let text = metrics.render();
        assert!(text.contains("sluice_queries_total"));
        assert!(text.contains("sluice_store_fallbacks_total 1"));
    }

    #[test]
    fn test_window_is_bounded() {
        let metrics = RouterMetrics::new(4).unwrap();
        for ms in 0..10 {
            metrics.record_query(StoreKind::Oltp, Outcome::Success, ms);
        }
        let latency = metrics.latency();
        assert_eq!(latency.samples, 4);
        assert_eq!(latency.p50_ms, 7);
    }
}
