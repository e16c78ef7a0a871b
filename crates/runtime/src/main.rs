//! Sluice Runtime Entry Point.
//!
//! Binary that configures and launches the query router.
//! It handles:
//! - Configuration loading
//! - Logging initialization
//! - Seeding local SQLite stores when none are configured
//! - Running a short demonstration workload and reporting metrics
use std::path::{Path, PathBuf};

use anyhow::Context;
use rusqlite::Connection;
use sluice_common::config::{AppConfig, DEFAULT_CONFIG_PATH};
use sluice_common::models::{Priority, QueryRequest};
use sluice_common::telemetry::{init_tracing, shutdown_telemetry};
use sluice_common::tenant::TenantContext;
use sluice_runtime::{QueryRouter, StoreFactories};

const DEMO_DATA_DIR: &str = "data";
const DEMO_ORDERS: usize = 500;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path =
        std::env::var("SLUICE_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
    let mut config = AppConfig::from_file(&config_path)
        .with_context(|| format!("Failed to load configuration from {}", config_path))?;

    init_tracing(&config.telemetry)?;
    tracing::info!(config = %config_path, "Tracing initialized");

    let data_dir = PathBuf::from(DEMO_DATA_DIR);
    if config.stores.oltp.url.is_empty() {
        config.stores.oltp.url = data_dir.join("oltp.db").display().to_string();
    }
    if config.stores.olap.url.is_empty() {
        config.stores.olap.url = data_dir.join("olap.db").display().to_string();
    }
    for url in [&config.stores.oltp.url, &config.stores.olap.url] {
        seed_demo_store(Path::new(url))
            .with_context(|| format!("Failed to seed demo store {}", url))?;
    }

    let factories = StoreFactories::sqlite(&config.stores);
    let router = QueryRouter::start(config, factories).await?;
    // Pretend the replica holds a full year of orders so reports go to OLAP.
    router.update_table_rows("orders", 5_000_000);
    router.update_table_rows("customers", 2_000);

    let tenant = TenantContext::user("demo");
    let workload = [
        QueryRequest::new("SELECT * FROM customers WHERE id = ?")
            .with_params(vec![serde_json::json!(7)])
            .with_priority(Priority::High),
        QueryRequest::new(
            "SELECT region, COUNT(*) AS orders, SUM(amount) AS revenue FROM orders GROUP BY region",
        ),
        QueryRequest::new(
            "SELECT region, COUNT(*) AS orders, SUM(amount) AS revenue FROM orders GROUP BY region",
        ),
        QueryRequest::new("UPDATE customers SET name = 'Renamed' WHERE id = ?")
            .with_params(vec![serde_json::json!(7)]),
    ];

    for request in workload {
        let sql = request.sql.clone();
        match router.submit(request.with_tenant(tenant.clone())).await {
            Ok(response) => tracing::info!(
                sql = %sql,
                store = %response.store_used,
                rows = response.data.row_count(),
                cache_hit = response.cache_hit,
                rewrites = ?response.applied_optimizations,
                duration_ms = response.execution_time_ms,
                "Demo query finished"
            ),
            Err(e) => tracing::error!(sql = %sql, error = %e, "Demo query failed"),
        }
    }

    let health = router.health().await;
    tracing::info!(status = ?health.status, "Health check");
    let metrics = serde_json::to_string(&router.metrics())?;
    tracing::info!(metrics = %metrics, "Router metrics");

    router.shutdown().await;
    shutdown_telemetry();

    Ok(())
}

/// Create the demo schema and rows unless the file already has them.
fn seed_demo_store(path: &Path) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let mut conn = Connection::open(path)?;
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS customers (id INTEGER PRIMARY KEY, name TEXT NOT NULL, region TEXT NOT NULL);
         CREATE TABLE IF NOT EXISTS orders (id INTEGER PRIMARY KEY, customer_id INTEGER NOT NULL, region TEXT NOT NULL, amount REAL NOT NULL);",
    )?;
    let existing: i64 = conn.query_row("SELECT COUNT(*) FROM orders", [], |row| row.get(0))?;
    if existing > 0 {
        return Ok(());
    }

    let regions = ["north", "south", "east", "west"];
    let tx = conn.transaction()?;
    for id in 1..=50usize {
        tx.execute(
            "INSERT INTO customers (id, name, region) VALUES (?1, ?2, ?3)",
            rusqlite::params![id as i64, format!("Customer {}", id), regions[id % regions.len()]],
        )?;
    }
    for id in 1..=DEMO_ORDERS {
        tx.execute(
            "INSERT INTO orders (id, customer_id, region, amount) VALUES (?1, ?2, ?3, ?4)",
            rusqlite::params![
                id as i64,
                (id % 50 + 1) as i64,
                regions[id % regions.len()],
                (id % 97) as f64 * 1.5
            ],
        )?;
    }
    tx.commit()?;
    Ok(())
}
