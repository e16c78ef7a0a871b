//! Query classification.
//!
//! Maps a query text to a workload category and a default target store.
//! Classification never fails: text the tokenizer rejects becomes
//! `Unknown` on OLTP with low confidence.

use moka::sync::Cache;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

use sluice_common::config::ClassifierSettings;
use sluice_common::models::{Priority, QueryCategory, QueryMetadata, TargetStore};

use crate::sql_shape::{self, SqlShape, StatementKind};

const UNPARSEABLE_CONFIDENCE: f64 = 0.3;

/// Row counts per table, used for every size estimate.
#[derive(Debug)]
pub struct TableStatistics {
    rows: RwLock<HashMap<String, u64>>,
    default_rows: u64,
}

impl TableStatistics {
    pub fn new(rows: HashMap<String, u64>, default_rows: u64) -> Self {
        let rows = rows
            .into_iter()
            .map(|(k, v)| (k.to_lowercase(), v))
            .collect();
        Self {
            rows: RwLock::new(rows),
            default_rows,
        }
    }

    /// Rows in `table`. Qualified names fall back to their last segment.
    pub fn estimate(&self, table: &str) -> u64 {
        let rows = self.rows.read();
        let table = table.to_lowercase();
        rows.get(&table)
            .or_else(|| table.rsplit('.').next().and_then(|t| rows.get(t)))
            .copied()
            .unwrap_or(self.default_rows)
    }

    pub fn contains(&self, table: &str) -> bool {
        let rows = self.rows.read();
        let table = table.to_lowercase();
        rows.contains_key(&table) || table.rsplit('.').next().is_some_and(|t| rows.contains_key(t))
    }

    pub fn set(&self, table: &str, rows: u64) {
        self.rows.write().insert(table.to_lowercase(), rows);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ClassifierCacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: u64,
}

pub struct QueryClassifier {
    settings: ClassifierSettings,
    statistics: Arc<TableStatistics>,
    cache: Cache<String, QueryMetadata>,
    hits: AtomicU64,
    misses: AtomicU64,
}

/// What the explicit type hint asked for.
enum Hint {
    Target(TargetStore),
    Category(QueryCategory),
    Unrecognized(String),
}

fn parse_hint(raw: &str) -> Hint {
    match raw.to_ascii_lowercase().as_str() {
        "oltp" | "transactional" => Hint::Target(TargetStore::Oltp),
        "olap" => Hint::Target(TargetStore::Olap),
        other => match other.parse::<QueryCategory>() {
            Ok(category) => Hint::Category(category),
            Err(_) => Hint::Unrecognized(raw.to_string()),
        },
    }
}

impl QueryClassifier {
    pub fn new(settings: &ClassifierSettings) -> Self {
        Self {
            statistics: Arc::new(TableStatistics::new(
                settings.table_rows.clone(),
                settings.default_table_rows,
            )),
            cache: Cache::new(settings.cache_capacity.max(1)),
            settings: settings.clone(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Shared with the optimizer's cost model.
    pub fn statistics(&self) -> Arc<TableStatistics> {
        self.statistics.clone()
    }

    /// Cached by exact text and hint, so a repeat skips tokenization. The
    /// stored metadata already carries its normalized cache key.
    pub fn classify(&self, sql: &str, explicit_type: Option<&str>) -> QueryMetadata {
        let key = sql_shape::hash_text(&format!(
            "{}|{}",
            sql.trim(),
            explicit_type.unwrap_or_default().to_ascii_lowercase()
        ));
        if let Some(cached) = self.cache.get(&key) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return cached;
        }
        self.misses.fetch_add(1, Ordering::Relaxed);

        let shape = sql_shape::analyze(sql);
        let mut metadata = self.analyze(&shape, explicit_type);
        metadata.cache_key = sql_shape::hash_text(&shape.normalized);
        debug!(
            target: "classifier",
            category = %metadata.category,
            target_store = ?metadata.target,
            estimated_rows = metadata.estimated_rows,
            reason = %metadata.routing_reason,
            "Classified query"
        );
        self.cache.insert(key, metadata.clone());
        metadata
    }

    pub fn clear_cache(&self) {
        self.cache.invalidate_all();
    }

    pub fn cache_stats(&self) -> ClassifierCacheStats {
        ClassifierCacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: self.cache.entry_count(),
        }
    }

    /// Rows the query touches before any LIMIT.
    pub fn scanned_rows(&self, shape: &SqlShape) -> u64 {
        if shape.key_equality && !shape.has_joins {
            return 1;
        }
        let mut rows = shape
            .tables
            .iter()
            .map(|t| self.statistics.estimate(t))
            .collect::<Vec<_>>();
        rows.sort_unstable_by(|a, b| b.cmp(a));
        match rows.as_slice() {
            [] => 1,
            [largest, rest @ ..] => {
                // Joins fan out roughly with the second largest input.
                let fan_out = rest.iter().map(|r| (*r as f64).log10().max(1.0)).sum::<f64>();
                (*largest as f64 * fan_out.max(1.0)) as u64
            }
        }
    }

    fn analyze(&self, shape: &SqlShape, explicit_type: Option<&str>) -> QueryMetadata {
        let scanned = self.scanned_rows(shape);
        let (mut category, mut target, mut confidence, mut reason) = self.match_patterns(shape, scanned);

        if let Some(raw) = explicit_type {
            match parse_hint(raw) {
                Hint::Target(requested) if category.is_write() && requested != TargetStore::Oltp => {
                    reason = format!("{}; explicit '{}' ignored for a write", reason, raw);
                }
                Hint::Target(requested) => {
                    target = requested;
                    confidence = 1.0;
                    reason = format!("explicit target '{}'", raw);
                }
                Hint::Category(requested) if requested.is_write() != category.is_write() => {
                    reason = format!("{}; explicit type '{}' contradicts the statement", reason, raw);
                }
                Hint::Category(requested) => {
                    category = requested;
                    target = self.default_target(category, scanned);
                    confidence = 1.0;
                    reason = format!("explicit type '{}'", raw);
                }
                Hint::Unrecognized(raw) => {
                    reason = format!("{}; unrecognized explicit type '{}'", reason, raw);
                }
            }
        }

        let estimated_rows = match shape.limit {
            Some(limit) if category.is_analytical() || !shape.has_aggregations() => {
                scanned.min(limit)
            }
            _ if category.is_write() => 0,
            _ => scanned,
        };

        QueryMetadata {
            category,
            target,
            priority: default_priority(category),
            estimated_rows,
            estimated_duration_ms: estimate_duration_ms(shape, scanned),
            estimated_memory_mb: estimate_memory_mb(shape, scanned),
            has_joins: shape.has_joins,
            has_aggregations: shape.has_aggregations(),
            has_window_functions: shape.has_window_functions,
            has_subqueries: shape.has_subqueries,
            has_cte: shape.has_cte,
            has_limit: shape.has_limit,
            tables: shape.tables.clone(),
            routing_reason: reason,
            confidence,
            cache_key: String::new(),
        }
    }

    /// Ordered pattern table. The first matching row wins.
    fn match_patterns(
        &self,
        shape: &SqlShape,
        scanned: u64,
    ) -> (QueryCategory, TargetStore, f64, String) {
        if !shape.tokenized {
            return (
                QueryCategory::Unknown,
                TargetStore::Oltp,
                UNPARSEABLE_CONFIDENCE,
                "unparseable query, default store".to_string(),
            );
        }

        let write = |category: QueryCategory, what: &str| {
            (category, TargetStore::Oltp, 0.95, format!("{} favors OLTP", what))
        };
        match shape.statement {
            StatementKind::Insert => return write(QueryCategory::Insert, "insert"),
            StatementKind::Update => return write(QueryCategory::Update, "update"),
            StatementKind::Delete => return write(QueryCategory::Delete, "delete"),
            StatementKind::Ddl => return write(QueryCategory::Ddl, "schema change"),
            StatementKind::Transaction => {
                return write(QueryCategory::Transaction, "transaction control")
            }
            StatementKind::Other => {
                return (
                    QueryCategory::Unknown,
                    TargetStore::Oltp,
                    0.5,
                    "unrecognized statement, default store".to_string(),
                )
            }
            StatementKind::Select => {}
        }

        let (category, confidence, what) = if shape.has_cte && shape.has_aggregations() {
            (QueryCategory::Reporting, 0.85, "reporting CTE with aggregation")
        } else if shape.has_window_functions {
            (QueryCategory::WindowAnalytics, 0.9, "window functions")
        } else if shape.has_aggregations() {
            (QueryCategory::Aggregation, 0.85, "aggregation")
        } else if shape.key_equality && !shape.has_joins {
            (QueryCategory::PointLookup, 0.95, "key lookup")
        } else if shape.has_joins {
            (QueryCategory::Join, 0.75, "join")
        } else if scanned > self.settings.olap_row_threshold
            && shape.limit.map_or(true, |l| l > self.settings.olap_row_threshold)
        {
            (QueryCategory::LargeScan, 0.8, "large scan")
        } else {
            (QueryCategory::SimpleSelect, 0.7, "simple select")
        };

        let target = self.default_target(category, scanned);
        let reason = match target {
            TargetStore::Olap => format!("{} over ~{} rows favors OLAP", what, scanned),
            TargetStore::Oltp if category.is_analytical() => {
                format!("{} over small tables (~{} rows) stays on OLTP", what, scanned)
            }
            TargetStore::Oltp => format!("{} favors OLTP", what),
            TargetStore::Hybrid | TargetStore::Auto => {
                format!("{} over ~{} rows, either store", what, scanned)
            }
        };
        (category, target, confidence, reason)
    }

    fn default_target(&self, category: QueryCategory, scanned: u64) -> TargetStore {
        match category {
            c if c.is_write() => TargetStore::Oltp,
            QueryCategory::PointLookup | QueryCategory::SimpleSelect | QueryCategory::Unknown => {
                TargetStore::Oltp
            }
            QueryCategory::Join => TargetStore::Hybrid,
            _ if scanned < self.settings.small_table_rows => TargetStore::Oltp,
            _ if scanned > self.settings.olap_row_threshold => TargetStore::Olap,
            _ => TargetStore::Hybrid,
        }
    }
}

fn default_priority(category: QueryCategory) -> Priority {
    match category {
        QueryCategory::Transaction
        | QueryCategory::Insert
        | QueryCategory::Update
        | QueryCategory::Delete
        | QueryCategory::PointLookup => Priority::High,
        QueryCategory::Aggregation
        | QueryCategory::WindowAnalytics
        | QueryCategory::LargeScan
        | QueryCategory::Reporting => Priority::Low,
        _ => Priority::Normal,
    }
}

fn estimate_duration_ms(shape: &SqlShape, scanned: u64) -> u64 {
    let mut ms = 1.0 + scanned as f64 / 50_000.0;
    if shape.has_joins {
        ms *= 2.0;
    }
    if shape.has_aggregations() {
        ms *= 1.5;
    }
    if shape.has_window_functions {
        ms *= 2.0;
    }
    if shape.has_subqueries {
        ms *= 1.3;
    }
    ms.ceil() as u64
}

fn estimate_memory_mb(shape: &SqlShape, scanned: u64) -> u64 {
    // ~100 bytes per row held, only when the engine must materialize.
    let materializing = shape.has_aggregations()
        || shape.has_window_functions
        || shape.has_order_by
        || shape.has_joins;
    let rows = if materializing {
        scanned
    } else {
        scanned.min(shape.limit.unwrap_or(scanned))
    };
    (rows.saturating_mul(100) / (1024 * 1024)).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classifier() -> QueryClassifier {
        let mut settings = ClassifierSettings::default();
        settings.table_rows.insert("events".into(), 2_000_000);
        settings.table_rows.insert("users".into(), 50_000);
        settings.table_rows.insert("settings".into(), 20);
        QueryClassifier::new(&settings)
    }

    #[test]
    fn test_writes_go_to_oltp() {
        let c = classifier();
        for sql in [
            "INSERT INTO events (id) VALUES (1)",
            "UPDATE users SET name = 'x' WHERE id = 3",
            "DELETE FROM events WHERE id < 10",
            "CREATE TABLE t (a INT)",
            "BEGIN",
        ] {
            let m = c.classify(sql, None);
            assert!(m.category.is_write(), "{}", sql);
            assert_eq!(m.target, TargetStore::Oltp, "{}", sql);
        }
    }

    #[test]
    fn test_large_aggregation_goes_to_olap() {
        let c = classifier();
        let m = c.classify("SELECT region, COUNT(*) FROM events GROUP BY region", None);
        assert_eq!(m.category, QueryCategory::Aggregation);
        assert_eq!(m.target, TargetStore::Olap);
        assert!(m.estimated_rows > 100_000);
        assert!(m.has_aggregations);
    }

    #[test]
    fn test_small_aggregation_stays_on_oltp() {
        let c = classifier();
        let m = c.classify("SELECT COUNT(*) FROM settings", None);
        assert_eq!(m.category, QueryCategory::Aggregation);
        assert_eq!(m.target, TargetStore::Oltp);
    }

    #[test]
    fn test_point_lookup_and_window() {
        let c = classifier();
        let lookup = c.classify("SELECT * FROM users WHERE id = 7", None);
        assert_eq!(lookup.category, QueryCategory::PointLookup);
        assert_eq!(lookup.estimated_rows, 1);
        assert_eq!(lookup.priority, Priority::High);

        let window = c.classify(
            "SELECT id, RANK() OVER (ORDER BY score) FROM events",
            None,
        );
        assert_eq!(window.category, QueryCategory::WindowAnalytics);
        assert_eq!(window.target, TargetStore::Olap);
    }

    #[test]
    fn test_explicit_type_overrides() {
        let c = classifier();
        let m = c.classify("SELECT * FROM settings", Some("olap"));
        assert_eq!(m.target, TargetStore::Olap);
        assert_eq!(m.confidence, 1.0);
        assert!(m.routing_reason.contains("explicit"));

        let write = c.classify("DELETE FROM settings", Some("olap"));
        assert_eq!(write.target, TargetStore::Oltp);
        let write = c.classify("DELETE FROM settings", Some("aggregation"));
        assert!(write.is_write());
        assert!(write.routing_reason.contains("contradicts"));

        let bogus = c.classify("SELECT * FROM settings", Some("bogus"));
        assert_eq!(bogus.target, TargetStore::Oltp);
        assert!(bogus.routing_reason.contains("unrecognized"));
    }

    #[test]
    fn test_unparseable_degrades() {
        let c = classifier();
        let m = c.classify("SELECT 'broken", None);
        assert_eq!(m.category, QueryCategory::Unknown);
        assert_eq!(m.target, TargetStore::Oltp);
        assert!(m.confidence < 0.5);
    }

    #[test]
    fn test_cache_hit_keeps_literal_specific_key() {
        let c = classifier();
        let a = c.classify("SELECT * FROM users WHERE id = 1", None);
        let b = c.classify("SELECT * FROM users WHERE id = 2", None);
        assert_eq!(a.category, b.category);
        assert_ne!(a.cache_key, b.cache_key);
        assert_eq!(c.cache_stats().misses, 2);

        let again = c.classify("SELECT * FROM users WHERE id = 1", None);
        assert_eq!(again.cache_key, a.cache_key);
        assert_eq!(c.cache_stats().hits, 1);

        c.clear_cache();
        c.classify("SELECT * FROM users WHERE id = 1", None);
        assert_eq!(c.cache_stats().misses, 3);
    }

    #[test]
    fn test_fetch_first_count_is_not_shared() {
        let c = classifier();
        let small = c.classify("SELECT * FROM events FETCH FIRST 10 ROWS ONLY", None);
        let large = c.classify("SELECT * FROM events FETCH FIRST 5000 ROWS ONLY", None);
        assert_eq!(c.cache_stats().hits, 0);
        assert_ne!(small.cache_key, large.cache_key);
        assert_eq!(small.estimated_rows, 10);
        assert_eq!(large.estimated_rows, 5000);
    }

    #[test]
    fn test_huge_statistics_do_not_overflow() {
        let mut settings = ClassifierSettings::default();
        settings.table_rows.insert("firehose".into(), u64::MAX);
        let c = QueryClassifier::new(&settings);
        let m = c.classify("SELECT region, COUNT(*) FROM firehose GROUP BY region", None);
        assert_eq!(m.target, TargetStore::Olap);
        assert!(m.estimated_memory_mb > 1);
    }
}
