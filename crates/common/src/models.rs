//! Data model shared by the router, the scheduler and the cache.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::tenant::TenantContext;

/// A concrete backing store. Every store owns one pool and one breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    Oltp,
    Olap,
}

impl StoreKind {
    pub const ALL: [StoreKind; 2] = [StoreKind::Oltp, StoreKind::Olap];

    pub fn as_str(&self) -> &'static str {
        match self {
            StoreKind::Oltp => "oltp",
            StoreKind::Olap => "olap",
        }
    }
}

impl fmt::Display for StoreKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Routing recommendation attached to a classified query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetStore {
    Oltp,
    Olap,
    /// Either store can answer; the router decides from size estimates.
    Hybrid,
    /// No preference expressed yet.
    Auto,
}

impl TargetStore {
    /// Resolve to a concrete store. `Hybrid`/`Auto` go to OLAP only for large scans.
    pub fn resolve(&self, estimated_rows: u64, olap_row_threshold: u64) -> StoreKind {
        match self {
            TargetStore::Oltp => StoreKind::Oltp,
            TargetStore::Olap => StoreKind::Olap,
            TargetStore::Hybrid | TargetStore::Auto => {
                if estimated_rows > olap_row_threshold {
                    StoreKind::Olap
                } else {
                    StoreKind::Oltp
                }
            }
        }
    }
}

impl From<StoreKind> for TargetStore {
    fn from(kind: StoreKind) -> Self {
        match kind {
            StoreKind::Oltp => TargetStore::Oltp,
            StoreKind::Olap => TargetStore::Olap,
        }
    }
}

/// Scheduling priority. Ordering is significant: `Critical` sorts highest.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Background = 0,
    Low = 1,
    #[default]
    Normal = 2,
    High = 3,
    Critical = 4,
}

impl Priority {
    pub const ALL: [Priority; 5] = [
        Priority::Critical,
        Priority::High,
        Priority::Normal,
        Priority::Low,
        Priority::Background,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Background => "background",
            Priority::Low => "low",
            Priority::Normal => "normal",
            Priority::High => "high",
            Priority::Critical => "critical",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "background" => Ok(Priority::Background),
            "low" => Ok(Priority::Low),
            "normal" => Ok(Priority::Normal),
            "high" => Ok(Priority::High),
            "critical" => Ok(Priority::Critical),
            other => Err(format!("unknown priority '{}'", other)),
        }
    }
}

/// Workload category assigned by the classifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryCategory {
    PointLookup,
    SimpleSelect,
    Insert,
    Update,
    Delete,
    Ddl,
    Transaction,
    Join,
    Aggregation,
    WindowAnalytics,
    LargeScan,
    Reporting,
    Unknown,
}

impl QueryCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueryCategory::PointLookup => "point_lookup",
            QueryCategory::SimpleSelect => "simple_select",
            QueryCategory::Insert => "insert",
            QueryCategory::Update => "update",
            QueryCategory::Delete => "delete",
            QueryCategory::Ddl => "ddl",
            QueryCategory::Transaction => "transaction",
            QueryCategory::Join => "join",
            QueryCategory::Aggregation => "aggregation",
            QueryCategory::WindowAnalytics => "window_analytics",
            QueryCategory::LargeScan => "large_scan",
            QueryCategory::Reporting => "reporting",
            QueryCategory::Unknown => "unknown",
        }
    }

    /// Statements that modify state. These are never cached or retried.
    pub fn is_write(&self) -> bool {
        matches!(
            self,
            QueryCategory::Insert
                | QueryCategory::Update
                | QueryCategory::Delete
                | QueryCategory::Ddl
                | QueryCategory::Transaction
        )
    }

    pub fn is_analytical(&self) -> bool {
        matches!(
            self,
            QueryCategory::Aggregation
                | QueryCategory::WindowAnalytics
                | QueryCategory::LargeScan
                | QueryCategory::Reporting
        )
    }
}

impl fmt::Display for QueryCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueryCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let category = match s.to_ascii_lowercase().as_str() {
            "point_lookup" => QueryCategory::PointLookup,
            "simple_select" | "select" => QueryCategory::SimpleSelect,
            "insert" => QueryCategory::Insert,
            "update" => QueryCategory::Update,
            "delete" => QueryCategory::Delete,
            "ddl" => QueryCategory::Ddl,
            "transaction" => QueryCategory::Transaction,
            "join" => QueryCategory::Join,
            "aggregation" | "analytical" => QueryCategory::Aggregation,
            "window_analytics" => QueryCategory::WindowAnalytics,
            "large_scan" => QueryCategory::LargeScan,
            "reporting" => QueryCategory::Reporting,
            other => return Err(format!("unknown query type '{}'", other)),
        };
        Ok(category)
    }
}

/// A single submission. Built once and never mutated afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryRequest {
    pub sql: String,
    #[serde(default)]
    pub params: Vec<serde_json::Value>,
    /// `oltp`, `olap` or a category name.
    #[serde(default)]
    pub explicit_type: Option<String>,
    #[serde(default)]
    pub priority: Option<Priority>,
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
    #[serde(default = "default_true")]
    pub use_cache: bool,
    #[serde(default = "default_true")]
    pub use_optimization: bool,
    #[serde(default)]
    pub tenant: TenantContext,
}

fn default_true() -> bool {
    true
}

impl QueryRequest {
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            params: Vec::new(),
            explicit_type: None,
            priority: None,
            timeout_seconds: None,
            use_cache: true,
            use_optimization: true,
            tenant: TenantContext::default(),
        }
    }

    pub fn with_params(mut self, params: Vec<serde_json::Value>) -> Self {
        self.params = params;
        self
    }

    pub fn with_type(mut self, explicit_type: impl Into<String>) -> Self {
        self.explicit_type = Some(explicit_type.into());
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_timeout(mut self, seconds: u64) -> Self {
        self.timeout_seconds = Some(seconds);
        self
    }

    pub fn with_cache(mut self, use_cache: bool) -> Self {
        self.use_cache = use_cache;
        self
    }

    pub fn with_optimization(mut self, use_optimization: bool) -> Self {
        self.use_optimization = use_optimization;
        self
    }

    pub fn with_tenant(mut self, tenant: TenantContext) -> Self {
        self.tenant = tenant;
        self
    }
}

/// Classification result. Derived once per query shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryMetadata {
    pub category: QueryCategory,
    pub target: TargetStore,
    pub priority: Priority,
    pub estimated_rows: u64,
    pub estimated_duration_ms: u64,
    pub estimated_memory_mb: u64,
    pub has_joins: bool,
    pub has_aggregations: bool,
    pub has_window_functions: bool,
    pub has_subqueries: bool,
    pub has_cte: bool,
    pub has_limit: bool,
    pub tables: Vec<String>,
    pub routing_reason: String,
    pub confidence: f64,
    /// Hash of the normalized query shape.
    pub cache_key: String,
}

impl QueryMetadata {
    pub fn is_write(&self) -> bool {
        self.category.is_write()
    }
}

/// Heuristic cost of one query text.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QueryPlan {
    pub cpu_cost: f64,
    pub io_cost: f64,
    pub memory_cost: f64,
    pub network_cost: f64,
    pub total_cost: f64,
    pub estimated_duration_ms: u64,
    /// 0.0 - 1.0
    pub confidence: f64,
}

impl QueryPlan {
    pub fn new(cpu_cost: f64, io_cost: f64, memory_cost: f64, network_cost: f64) -> Self {
        let total_cost = cpu_cost + io_cost + memory_cost + network_cost;
        Self {
            cpu_cost,
            io_cost,
            memory_cost,
            network_cost,
            total_cost,
            estimated_duration_ms: 0,
            confidence: 0.5,
        }
    }
}

/// What happened when one rewrite rule was offered a query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "detail", rename_all = "snake_case")]
pub enum RuleOutcome {
    Applied,
    NotApplicable,
    Skipped(String),
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizedQuery {
    pub original: String,
    pub rewritten: String,
    pub strategies: Vec<String>,
    pub estimated_improvement_pct: f64,
    pub outcomes: Vec<(String, RuleOutcome)>,
    pub cost_before: Option<QueryPlan>,
    pub cost_after: Option<QueryPlan>,
}

impl OptimizedQuery {
    pub fn unchanged(sql: &str) -> Self {
        Self {
            original: sql.to_string(),
            rewritten: sql.to_string(),
            strategies: Vec::new(),
            estimated_improvement_pct: 0.0,
            outcomes: Vec::new(),
            cost_before: None,
            cost_after: None,
        }
    }

    pub fn is_rewritten(&self) -> bool {
        self.original != self.rewritten
    }
}

/// Tabular result returned by a store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryData {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<serde_json::Value>>,
}

impl QueryData {
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    /// Rows sorted into a canonical order, for result-set comparisons.
    pub fn sorted_rows(&self) -> Vec<Vec<serde_json::Value>> {
        let mut rows = self.rows.clone();
        rows.sort_by_key(|row| serde_json::to_string(row).unwrap_or_default());
        rows
    }
}

/// Output of a successful submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryResponse {
    pub query_id: String,
    pub data: QueryData,
    pub execution_time_ms: u64,
    pub store_used: StoreKind,
    pub rows_affected: Option<u64>,
    pub cache_hit: bool,
    pub applied_optimizations: Vec<String>,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ExecutionStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
    Timeout,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed
                | ExecutionStatus::Failed
                | ExecutionStatus::Cancelled
                | ExecutionStatus::Timeout
        )
    }

    /// Transitions only move forward. A retried query stays `Running`.
    pub fn can_transition_to(&self, next: ExecutionStatus) -> bool {
        match self {
            ExecutionStatus::Queued => matches!(
                next,
                ExecutionStatus::Running | ExecutionStatus::Cancelled | ExecutionStatus::Failed
            ),
            ExecutionStatus::Running => next.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ExecutionStatus::Queued => "QUEUED",
            ExecutionStatus::Running => "RUNNING",
            ExecutionStatus::Completed => "COMPLETED",
            ExecutionStatus::Failed => "FAILED",
            ExecutionStatus::Cancelled => "CANCELLED",
            ExecutionStatus::Timeout => "TIMEOUT",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub reserved_memory_mb: u64,
    pub wall_time_ms: u64,
    pub rows_returned: u64,
}

/// Lifecycle record of one scheduled execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub query_id: String,
    pub tenant: String,
    pub priority: Priority,
    pub status: ExecutionStatus,
    pub submitted_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub usage: ResourceUsage,
    pub retry_count: u32,
    pub error: Option<String>,
}

impl ExecutionRecord {
    pub fn queued(query_id: impl Into<String>, tenant: impl Into<String>, priority: Priority) -> Self {
        Self {
            query_id: query_id.into(),
            tenant: tenant.into(),
            priority,
            status: ExecutionStatus::Queued,
            submitted_at: Utc::now(),
            started_at: None,
            finished_at: None,
            usage: ResourceUsage::default(),
            retry_count: 0,
            error: None,
        }
    }

    /// Apply a status change. Returns false (and changes nothing) for a backwards move.
    pub fn transition(&mut self, next: ExecutionStatus) -> bool {
        if !self.status.can_transition_to(next) {
            return false;
        }
        let now = Utc::now();
        if next == ExecutionStatus::Running {
            self.started_at = Some(now);
        }
        if next.is_terminal() {
            self.finished_at = Some(now);
            if let Some(started) = self.started_at {
                self.usage.wall_time_ms = (now - started).num_milliseconds().max(0) as u64;
            }
        }
        self.status = next;
        true
    }
}

/// Per-tenant limits read by the scheduler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, validator::Validate)]
pub struct ResourceQuota {
    #[validate(range(min = 1))]
    #[serde(default = "default_quota_concurrency")]
    pub max_concurrent_queries: usize,
    #[serde(default = "default_quota_memory_mb")]
    pub max_memory_mb: u64,
    #[validate(range(min = 1.0, max = 100.0))]
    #[serde(default = "default_quota_cpu_percent")]
    pub max_cpu_percent: f64,
    #[validate(range(min = 1))]
    #[serde(default = "default_quota_execution_secs")]
    pub max_execution_time_secs: u64,
    #[serde(default = "default_quota_daily_cap")]
    pub daily_query_cap: u64,
}

fn default_quota_concurrency() -> usize {
    10
}

fn default_quota_memory_mb() -> u64 {
    4096
}

fn default_quota_cpu_percent() -> f64 {
    100.0
}

fn default_quota_execution_secs() -> u64 {
    300
}

fn default_quota_daily_cap() -> u64 {
    100_000
}

impl Default for ResourceQuota {
    fn default() -> Self {
        Self {
            max_concurrent_queries: default_quota_concurrency(),
            max_memory_mb: default_quota_memory_mb(),
            max_cpu_percent: default_quota_cpu_percent(),
            max_execution_time_secs: default_quota_execution_secs(),
            daily_query_cap: default_quota_daily_cap(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_ordering() {
        assert!(Priority::Critical > Priority::High);
        assert!(Priority::High > Priority::Normal);
        assert!(Priority::Normal > Priority::Low);
        assert!(Priority::Low > Priority::Background);
        assert_eq!("HIGH".parse::<Priority>().unwrap(), Priority::High);
    }

    #[test]
    fn test_target_resolution() {
        assert_eq!(TargetStore::Olap.resolve(1, 100), StoreKind::Olap);
        assert_eq!(TargetStore::Hybrid.resolve(50, 100), StoreKind::Oltp);
        assert_eq!(TargetStore::Auto.resolve(500, 100), StoreKind::Olap);
    }

    #[test]
    fn test_status_transitions_are_monotonic() {
        let mut record = ExecutionRecord::queued("q1", "tenant", Priority::Normal);
        assert!(record.transition(ExecutionStatus::Running));
        assert!(record.started_at.is_some());
        assert!(record.transition(ExecutionStatus::Completed));
        assert!(record.finished_at.is_some());

        assert!(!record.transition(ExecutionStatus::Running));
        assert!(!record.transition(ExecutionStatus::Failed));
        assert_eq!(record.status, ExecutionStatus::Completed);
    }

    #[test]
    fn test_queued_can_be_cancelled_directly() {
        let mut record = ExecutionRecord::queued("q2", "tenant", Priority::Low);
        assert!(record.transition(ExecutionStatus::Cancelled));
        assert!(record.started_at.is_none());
        assert!(!record.transition(ExecutionStatus::Queued));
    }

    #[test]
    fn test_category_from_str() {
        assert_eq!(
            "analytical".parse::<QueryCategory>().unwrap(),
            QueryCategory::Aggregation
        );
        assert!("nonsense".parse::<QueryCategory>().is_err());
        assert!(QueryCategory::Delete.is_write());
        assert!(QueryCategory::Reporting.is_analytical());
    }
}
