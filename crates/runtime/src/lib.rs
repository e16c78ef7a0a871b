//! Sluice Runtime: a query router in front of one OLTP and one OLAP store.
//!
//! Each submission is classified, looked up in the tiered result cache,
//! optionally rewritten, admitted by the priority scheduler and finally run
//! on a pooled connection behind a per-store circuit breaker.
//!
//! # Architecture
//!
//! ```text
//!               ┌──────────────┐
//!  submit ────▶ │ QueryRouter  │──▶ classifier ──▶ cache ──▶ optimizer
//!               └──────┬───────┘
//!                      │ Job
//!               ┌──────┴───────┐
//!               │  Scheduler   │ (priorities, quotas, pressure)
//!               └──────┬───────┘
//!            ┌─────────┴─────────┐
//!      breaker + pool      breaker + pool
//!         (OLTP)               (OLAP)
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use sluice_common::config::AppConfig;
//! use sluice_common::models::QueryRequest;
//! use sluice_runtime::{QueryRouter, StoreFactories};
//!
//! # async fn run() -> sluice_error::Result<()> {
//! let config = AppConfig::default();
//! let factories = StoreFactories::sqlite(&config.stores);
//! let router = QueryRouter::start(config, factories).await?;
//! let response = router.submit(QueryRequest::new("SELECT 1")).await?;
//! println!("{} rows from {}", response.data.row_count(), response.store_used);
//! router.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod classifier;
pub mod events;
pub mod health;
pub mod metrics;
pub mod optimizer;
pub mod pool;
pub mod router;
pub mod scheduler;
pub mod sql_shape;
pub mod store;

pub use cache::{CacheManager, InvalidationScope};
pub use classifier::{QueryClassifier, TableStatistics};
pub use events::QueryEvent;
pub use health::{HealthReport, HealthStatus};
pub use optimizer::QueryOptimizer;
pub use router::{QueryRouter, StoreFactories};
pub use scheduler::{Job, Scheduler};
