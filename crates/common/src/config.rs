use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use validator::{Validate, ValidationError};

use crate::models::ResourceQuota;

// Default constants
pub const DEFAULT_CONFIG_PATH: &str = "config/sluice.yaml";
pub const DEFAULT_ENV_PREFIX: &str = "SLUICE";
pub const DEFAULT_QUERY_TIMEOUT_SECS: u64 = 30;

pub const DEFAULT_OLAP_ROW_THRESHOLD: u64 = 100_000;
pub const DEFAULT_SMALL_TABLE_ROWS: u64 = 10_000;
pub const DEFAULT_TABLE_ROWS: u64 = 50_000;
pub const DEFAULT_CLASSIFIER_CACHE_CAPACITY: u64 = 10_000;

pub const DEFAULT_LIMIT: u64 = 10_000;
pub const DEFAULT_OPTIMIZER_CACHE_CAPACITY: u64 = 5_000;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_BASE_DELAY_MS: u64 = 100;
pub const DEFAULT_MAX_DELAY_MS: u64 = 5_000;

pub const DEFAULT_CACHE_TTL: u64 = 300;
pub const DEFAULT_CACHE_DIRECTORY: &str = "/tmp/sluice-cache";

pub const DEFAULT_TELEMETRY_ENABLED: bool = false;
pub const DEFAULT_OTLP_ENDPOINT: &str = "http://localhost:4317";
pub const DEFAULT_SERVICE_NAME: &str = "sluice";

#[derive(Debug, Deserialize, Default, Clone, Validate)]
pub struct AppConfig {
    #[serde(default)]
    #[validate(nested)]
    pub router: RouterSettings,
    #[serde(default)]
    #[validate(nested)]
    pub classifier: ClassifierSettings,
    #[serde(default)]
    #[validate(nested)]
    pub optimizer: OptimizerSettings,
    #[serde(default)]
    #[validate(nested)]
    pub cache: CacheSettings,
    #[serde(default)]
    #[validate(nested)]
    pub stores: StoreSettings,
    #[serde(default)]
    #[validate(nested)]
    pub circuit_breaker: CircuitBreakerSettings,
    #[serde(default)]
    #[validate(nested)]
    pub scheduler: SchedulerSettings,
    #[serde(default)]
    pub retry: RetrySettings,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

/// How rewritten queries are trusted.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum RewritePolicy {
    /// Execute the rewritten query as soon as a rule matches.
    #[default]
    Trust,
    /// Execute original and rewritten, keep the original result on mismatch.
    Shadow,
}

#[derive(Debug, Deserialize, Clone, Validate)]
pub struct RouterSettings {
    #[serde(default = "default_query_timeout_secs")]
    #[validate(range(min = 1))]
    pub default_timeout_secs: u64,
    /// Send reads to OLTP when the OLAP store is unavailable.
    #[serde(default = "default_true")]
    pub fallback_to_oltp: bool,
    #[serde(default)]
    pub rewrite_policy: RewritePolicy,
    #[serde(default = "default_latency_samples")]
    #[validate(range(min = 16))]
    pub latency_samples: usize,
}

impl Default for RouterSettings {
    fn default() -> Self {
        Self {
            default_timeout_secs: default_query_timeout_secs(),
            fallback_to_oltp: true,
            rewrite_policy: RewritePolicy::default(),
            latency_samples: default_latency_samples(),
        }
    }
}

fn default_query_timeout_secs() -> u64 {
    DEFAULT_QUERY_TIMEOUT_SECS
}

fn default_latency_samples() -> usize {
    2048
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize, Clone, Validate)]
pub struct ClassifierSettings {
    /// Aggregations over more rows than this go to OLAP.
    #[serde(default = "default_olap_row_threshold")]
    #[validate(range(min = 1))]
    pub olap_row_threshold: u64,
    /// Analytical shapes over fewer rows than this stay on OLTP.
    #[serde(default = "default_small_table_rows")]
    pub small_table_rows: u64,
    /// Row estimate for tables missing from `table_rows`.
    #[serde(default = "default_table_rows")]
    pub default_table_rows: u64,
    #[serde(default = "default_classifier_cache_capacity")]
    pub cache_capacity: u64,
    /// Row counts per table, lower-case names.
    #[serde(default)]
    pub table_rows: HashMap<String, u64>,
}

impl Default for ClassifierSettings {
    fn default() -> Self {
        Self {
            olap_row_threshold: default_olap_row_threshold(),
            small_table_rows: default_small_table_rows(),
            default_table_rows: default_table_rows(),
            cache_capacity: default_classifier_cache_capacity(),
            table_rows: HashMap::new(),
        }
    }
}

fn default_olap_row_threshold() -> u64 {
    DEFAULT_OLAP_ROW_THRESHOLD
}

fn default_small_table_rows() -> u64 {
    DEFAULT_SMALL_TABLE_ROWS
}

fn default_table_rows() -> u64 {
    DEFAULT_TABLE_ROWS
}

fn default_classifier_cache_capacity() -> u64 {
    DEFAULT_CLASSIFIER_CACHE_CAPACITY
}

#[derive(Debug, Deserialize, Clone, Validate)]
pub struct OptimizerSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// LIMIT appended to large unbounded selects.
    #[serde(default = "default_limit")]
    #[validate(range(min = 1))]
    pub default_limit: u64,
    /// Minimum estimated rows before a LIMIT is appended.
    #[serde(default = "default_olap_row_threshold")]
    pub limit_row_threshold: u64,
    #[serde(default = "default_optimizer_cache_capacity")]
    pub cache_capacity: u64,
    #[serde(default)]
    pub disabled_rules: Vec<String>,
}

impl Default for OptimizerSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            default_limit: default_limit(),
            limit_row_threshold: default_olap_row_threshold(),
            cache_capacity: default_optimizer_cache_capacity(),
            disabled_rules: Vec::new(),
        }
    }
}

fn default_limit() -> u64 {
    DEFAULT_LIMIT
}

fn default_optimizer_cache_capacity() -> u64 {
    DEFAULT_OPTIMIZER_CACHE_CAPACITY
}

#[derive(Debug, Deserialize, Clone, Validate)]
#[validate(schema(function = "validate_cache_tiers"))]
pub struct CacheSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_cache_ttl")]
    pub default_ttl_secs: u64,
    /// TTL for point lookups and simple selects.
    #[serde(default = "default_short_result_ttl")]
    pub transactional_ttl_secs: u64,
    /// TTL for aggregations, window functions and reports.
    #[serde(default = "default_analytical_ttl")]
    pub analytical_ttl_secs: u64,

    #[serde(default = "default_l1_max_bytes")]
    #[validate(range(min = 1024))]
    pub l1_max_bytes: u64,
    #[serde(default = "default_l1_max_entry_bytes")]
    pub l1_max_entry_bytes: u64,
    /// Entries living shorter than this skip L1.
    #[serde(default = "default_l1_min_ttl")]
    pub l1_min_ttl_secs: u64,

    #[serde(default = "default_l2_max_bytes")]
    pub l2_max_bytes: u64,
    #[serde(default = "default_l2_max_entry_bytes")]
    pub l2_max_entry_bytes: u64,
    /// Entries living shorter than this go straight to L3.
    #[serde(default = "default_short_ttl")]
    pub short_ttl_secs: u64,

    #[serde(default = "default_cache_directory")]
    pub l3_directory: String,
    #[serde(default = "default_l3_max_size_mb")]
    pub l3_max_size_mb: u64,

    #[serde(default = "default_compression_threshold")]
    pub compression_threshold_bytes: u64,
    /// Fraction of the size compression must save to be kept.
    #[serde(default = "default_min_compression_ratio")]
    #[validate(range(min = 0.0, max = 1.0))]
    pub min_compression_ratio: f64,
    /// Accesses on a lower tier before an entry is promoted.
    #[serde(default = "default_promotion_threshold")]
    #[validate(range(min = 1))]
    pub promotion_threshold: u64,
    #[serde(default = "default_top_keys")]
    pub top_keys: usize,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            default_ttl_secs: default_cache_ttl(),
            transactional_ttl_secs: default_short_result_ttl(),
            analytical_ttl_secs: default_analytical_ttl(),
            l1_max_bytes: default_l1_max_bytes(),
            l1_max_entry_bytes: default_l1_max_entry_bytes(),
            l1_min_ttl_secs: default_l1_min_ttl(),
            l2_max_bytes: default_l2_max_bytes(),
            l2_max_entry_bytes: default_l2_max_entry_bytes(),
            short_ttl_secs: default_short_ttl(),
            l3_directory: default_cache_directory(),
            l3_max_size_mb: default_l3_max_size_mb(),
            compression_threshold_bytes: default_compression_threshold(),
            min_compression_ratio: default_min_compression_ratio(),
            promotion_threshold: default_promotion_threshold(),
            top_keys: default_top_keys(),
        }
    }
}

fn validate_cache_tiers(settings: &CacheSettings) -> Result<(), ValidationError> {
    if settings.l1_max_entry_bytes > settings.l2_max_entry_bytes {
        return Err(ValidationError::new("l1_entry_larger_than_l2_entry"));
    }
    if settings.l1_max_entry_bytes > settings.l1_max_bytes {
        return Err(ValidationError::new("l1_entry_larger_than_l1"));
    }
    Ok(())
}

fn default_cache_ttl() -> u64 {
    DEFAULT_CACHE_TTL
}

fn default_short_result_ttl() -> u64 {
    60
}

fn default_analytical_ttl() -> u64 {
    3600
}

fn default_l1_max_bytes() -> u64 {
    64 * 1024 * 1024
}

fn default_l1_max_entry_bytes() -> u64 {
    64 * 1024
}

fn default_l1_min_ttl() -> u64 {
    60
}

fn default_l2_max_bytes() -> u64 {
    256 * 1024 * 1024
}

fn default_l2_max_entry_bytes() -> u64 {
    1024 * 1024
}

fn default_short_ttl() -> u64 {
    10
}

fn default_cache_directory() -> String {
    DEFAULT_CACHE_DIRECTORY.to_string()
}

fn default_l3_max_size_mb() -> u64 {
    1024
}

fn default_compression_threshold() -> u64 {
    4096
}

fn default_min_compression_ratio() -> f64 {
    0.2
}

fn default_promotion_threshold() -> u64 {
    3
}

fn default_top_keys() -> usize {
    10
}

/// Connection selection among idle connections.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalancing {
    #[default]
    RoundRobin,
    LeastUsed,
    LatencyWeighted,
}

#[derive(Debug, Deserialize, Clone, Validate)]
#[validate(schema(function = "validate_pool_bounds"))]
pub struct PoolSettings {
    /// Store location; for SQLite a file path.
    #[serde(default)]
    pub url: String,
    #[serde(default = "default_min_connections")]
    pub min_connections: usize,
    #[serde(default = "default_max_connections")]
    #[validate(range(min = 1))]
    pub max_connections: usize,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_acquire_timeout_ms")]
    pub acquire_timeout_ms: u64,
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    #[serde(default = "default_max_lifetime_secs")]
    pub max_lifetime_secs: u64,
    #[serde(default = "default_health_check_interval_secs")]
    #[validate(range(min = 1))]
    pub health_check_interval_secs: u64,
    #[serde(default = "default_reaper_interval_secs")]
    #[validate(range(min = 1))]
    pub reaper_interval_secs: u64,
    #[serde(default)]
    pub load_balancing: LoadBalancing,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            url: String::new(),
            min_connections: default_min_connections(),
            max_connections: default_max_connections(),
            connect_timeout_ms: default_connect_timeout_ms(),
            acquire_timeout_ms: default_acquire_timeout_ms(),
            idle_timeout_secs: default_idle_timeout_secs(),
            max_lifetime_secs: default_max_lifetime_secs(),
            health_check_interval_secs: default_health_check_interval_secs(),
            reaper_interval_secs: default_reaper_interval_secs(),
            load_balancing: LoadBalancing::default(),
        }
    }
}

impl PoolSettings {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn max_lifetime(&self) -> Duration {
        Duration::from_secs(self.max_lifetime_secs)
    }
}

fn validate_pool_bounds(pool: &PoolSettings) -> Result<(), ValidationError> {
    if pool.min_connections > pool.max_connections {
        return Err(ValidationError::new("min_connections_exceeds_max"));
    }
    Ok(())
}

fn default_min_connections() -> usize {
    1
}

fn default_max_connections() -> usize {
    10
}

fn default_connect_timeout_ms() -> u64 {
    5_000
}

fn default_acquire_timeout_ms() -> u64 {
    10_000
}

fn default_idle_timeout_secs() -> u64 {
    600
}

fn default_max_lifetime_secs() -> u64 {
    1800
}

fn default_health_check_interval_secs() -> u64 {
    30
}

fn default_reaper_interval_secs() -> u64 {
    60
}

#[derive(Debug, Deserialize, Clone, Default, Validate)]
pub struct StoreSettings {
    #[serde(default)]
    #[validate(nested)]
    pub oltp: PoolSettings,
    #[serde(default)]
    #[validate(nested)]
    pub olap: PoolSettings,
}

#[derive(Debug, Deserialize, Clone, Validate)]
pub struct CircuitBreakerSettings {
    #[serde(default = "default_failure_threshold")]
    #[validate(range(min = 1))]
    pub failure_threshold: usize,
    #[serde(default = "default_success_threshold")]
    #[validate(range(min = 1))]
    pub success_threshold: usize,
    #[serde(default = "default_window_secs")]
    #[validate(range(min = 1))]
    pub window_secs: u64,
    #[serde(default = "default_base_cooldown_ms")]
    pub base_cooldown_ms: u64,
    #[serde(default = "default_max_cooldown_ms")]
    pub max_cooldown_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    #[validate(range(min = 1.0))]
    pub backoff_multiplier: f64,
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            success_threshold: default_success_threshold(),
            window_secs: default_window_secs(),
            base_cooldown_ms: default_base_cooldown_ms(),
            max_cooldown_ms: default_max_cooldown_ms(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

fn default_failure_threshold() -> usize {
    5
}

fn default_success_threshold() -> usize {
    2
}

fn default_window_secs() -> u64 {
    60
}

fn default_base_cooldown_ms() -> u64 {
    5_000
}

fn default_max_cooldown_ms() -> u64 {
    120_000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

/// Pressure-score thresholds at which a priority stops being dispatched.
#[derive(Debug, Deserialize, Clone, Validate)]
pub struct ThrottleThresholds {
    #[serde(default = "default_throttle_high")]
    #[validate(range(min = 0.0, max = 100.0))]
    pub high: f64,
    #[serde(default = "default_throttle_normal")]
    #[validate(range(min = 0.0, max = 100.0))]
    pub normal: f64,
    #[serde(default = "default_throttle_low")]
    #[validate(range(min = 0.0, max = 100.0))]
    pub low: f64,
    #[serde(default = "default_throttle_background")]
    #[validate(range(min = 0.0, max = 100.0))]
    pub background: f64,
}

impl Default for ThrottleThresholds {
    fn default() -> Self {
        Self {
            high: default_throttle_high(),
            normal: default_throttle_normal(),
            low: default_throttle_low(),
            background: default_throttle_background(),
        }
    }
}

fn default_throttle_high() -> f64 {
    95.0
}

fn default_throttle_normal() -> f64 {
    85.0
}

fn default_throttle_low() -> f64 {
    70.0
}

fn default_throttle_background() -> f64 {
    50.0
}

#[derive(Debug, Deserialize, Clone, Validate)]
pub struct SchedulerSettings {
    /// Executions running at once across all tenants.
    #[serde(default = "default_max_concurrent")]
    #[validate(range(min = 1))]
    pub max_concurrent: usize,
    #[serde(default = "default_max_queue_depth")]
    #[validate(range(min = 1))]
    pub max_queue_depth: usize,
    #[serde(default = "default_sample_interval_ms")]
    #[validate(range(min = 10))]
    pub sample_interval_ms: u64,
    /// Maximum drop of the pressure score per sample.
    #[serde(default = "default_relax_step")]
    pub relax_step: f64,
    #[serde(default = "default_history_size")]
    pub history_size: usize,
    #[serde(default)]
    #[validate(nested)]
    pub throttle: ThrottleThresholds,
    #[serde(default)]
    #[validate(nested)]
    pub default_quota: ResourceQuota,
    /// Quotas by tenant key (`user:<id>` or `project:<id>`).
    #[serde(default)]
    pub quotas: HashMap<String, ResourceQuota>,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            max_queue_depth: default_max_queue_depth(),
            sample_interval_ms: default_sample_interval_ms(),
            relax_step: default_relax_step(),
            history_size: default_history_size(),
            throttle: ThrottleThresholds::default(),
            default_quota: ResourceQuota::default(),
            quotas: HashMap::new(),
        }
    }
}

fn default_max_concurrent() -> usize {
    32
}

fn default_max_queue_depth() -> usize {
    10_000
}

fn default_sample_interval_ms() -> u64 {
    1_000
}

fn default_relax_step() -> f64 {
    5.0
}

fn default_history_size() -> usize {
    1_000
}

#[derive(Debug, Deserialize, Clone, Copy)]
pub struct RetrySettings {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

fn default_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}

fn default_base_delay_ms() -> u64 {
    DEFAULT_BASE_DELAY_MS
}

fn default_max_delay_ms() -> u64 {
    DEFAULT_MAX_DELAY_MS
}

#[derive(Debug, Deserialize, Clone, Validate)]
pub struct TelemetryConfig {
    #[serde(default = "default_telemetry_enabled")]
    pub enabled: bool,

    #[serde(default = "default_otlp_endpoint")]
    #[validate(url)]
    pub endpoint: String,

    #[serde(default = "default_service_name")]
    pub service_name: String,

    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    #[serde(default = "default_log_filter")]
    pub log_filter: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            enabled: default_telemetry_enabled(),
            endpoint: default_otlp_endpoint(),
            service_name: default_service_name(),
            log_filter: default_log_filter(),
        }
    }
}

fn default_telemetry_enabled() -> bool {
    DEFAULT_TELEMETRY_ENABLED
}

fn default_otlp_endpoint() -> String {
    DEFAULT_OTLP_ENDPOINT.to_string()
}

fn default_service_name() -> String {
    DEFAULT_SERVICE_NAME.to_string()
}

fn default_log_filter() -> String {
    "info".to_string()
}

impl AppConfig {
    pub fn from_file(path: &str) -> Result<Self> {
        let builder = config::Config::builder();

        let builder = if std::path::Path::new(path).exists() {
            builder.add_source(config::File::with_name(path))
        } else {
            builder
        };

        // Map SLUICE__ROUTER__DEFAULT_TIMEOUT_SECS to router.default_timeout_secs, etc.
        let builder = builder.add_source(
            config::Environment::with_prefix(DEFAULT_ENV_PREFIX)
                .separator("__")
                .try_parsing(true),
        );

        let cfg = builder.build().context("Failed to build configuration")?;
        Self::finish(cfg)
    }

    /// Parse a YAML document without environment overrides.
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let cfg = config::Config::builder()
            .add_source(config::File::from_str(yaml, config::FileFormat::Yaml))
            .build()
            .context("Failed to build configuration")?;
        Self::finish(cfg)
    }

    fn finish(cfg: config::Config) -> Result<Self> {
        let app_config: AppConfig = cfg
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        app_config
            .validate()
            .map_err(|e| anyhow::anyhow!("Configuration validation failed: {:?}", e))?;

        Ok(app_config)
    }

    /// Quota for a tenant key, falling back to the default quota.
    pub fn quota_for(&self, tenant_key: &str) -> ResourceQuota {
        self.scheduler
            .quotas
            .get(tenant_key)
            .cloned()
            .unwrap_or_else(|| self.scheduler.default_quota.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_app_config_validation() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_telemetry_config_validation() {
        let config = TelemetryConfig {
            endpoint: "not_a_url".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_pool_bounds_validation() {
        let pool = PoolSettings {
            min_connections: 8,
            max_connections: 2,
            ..Default::default()
        };
        assert!(pool.validate().is_err());
    }

    #[test]
    fn test_yaml_overrides_defaults() {
        let yaml = r#"
router:
  rewrite_policy: shadow
stores:
  olap:
    url: /tmp/olap.db
    max_connections: 4
    load_balancing: latency_weighted
scheduler:
  max_concurrent: 8
  quotas:
    "project:alpha":
      max_concurrent_queries: 2
      daily_query_cap: 10
classifier:
  table_rows:
    events: 5000000
"#;
        let config = AppConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(config.router.rewrite_policy, RewritePolicy::Shadow);
        assert_eq!(config.stores.olap.max_connections, 4);
        assert_eq!(
            config.stores.olap.load_balancing,
            LoadBalancing::LatencyWeighted
        );
        assert_eq!(config.scheduler.max_concurrent, 8);
        assert_eq!(config.classifier.table_rows["events"], 5_000_000);

        let quota = config.quota_for("project:alpha");
        assert_eq!(quota.max_concurrent_queries, 2);
        assert_eq!(quota.daily_query_cap, 10);
        assert_eq!(quota.max_execution_time_secs, 300);
        assert_eq!(
            config.quota_for("user:nobody"),
            config.scheduler.default_quota
        );
    }

    #[test]
    fn test_invalid_yaml_values_rejected() {
        let yaml = r#"
scheduler:
  max_concurrent: 0
"#;
        assert!(AppConfig::from_yaml_str(yaml).is_err());
    }
}
