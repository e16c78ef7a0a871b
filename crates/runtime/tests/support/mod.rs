#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use sluice_common::config::AppConfig;
use sluice_runtime::router::{QueryRouter, StoreFactories};
use sluice_runtime::scheduler::StaticProbe;
use sluice_runtime::store::{ConnectionFactory, SqliteFactory, StoreConnection, StoreError};
use tempfile::TempDir;

pub const REGIONS: [&str; 4] = ["north", "south", "east", "west"];
pub const ORDER_ROWS: usize = 200;

/// Two seeded SQLite stores and a cache directory under one temp dir.
pub struct Fixture {
    pub dir: TempDir,
    pub config: AppConfig,
}

impl Fixture {
    pub fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let oltp = dir.path().join("oltp.db");
        let olap = dir.path().join("olap.db");
        seed(&oltp);
        seed(&olap);

        let mut config = AppConfig::default();
        config.stores.oltp.url = oltp.display().to_string();
        config.stores.olap.url = olap.display().to_string();
        config.stores.oltp.acquire_timeout_ms = 1_000;
        config.stores.olap.acquire_timeout_ms = 1_000;
        config.cache.l3_directory = dir.path().join("cache").display().to_string();
        // orders looks large enough for OLAP, customers stays transactional.
        config.classifier.table_rows.insert("orders".into(), 5_000_000);
        config.classifier.table_rows.insert("customers".into(), 500);
        config.scheduler.sample_interval_ms = 50;
        config.retry.base_delay_ms = 5;
        config.retry.max_delay_ms = 20;
        Self { dir, config }
    }

    pub async fn start(&self) -> QueryRouter {
        let factories = StoreFactories::sqlite(&self.config.stores);
        self.start_with(factories).await
    }

    pub async fn start_with(&self, factories: StoreFactories) -> QueryRouter {
        QueryRouter::start_with_probe(
            self.config.clone(),
            factories,
            Arc::new(StaticProbe::new(5.0, 20.0)),
        )
        .await
        .unwrap()
    }

    /// OLTP is real, OLAP refuses every connection.
    pub fn olap_down(&self) -> StoreFactories {
        StoreFactories {
            oltp: Arc::new(SqliteFactory::new(&self.config.stores.oltp.url)),
            olap: Arc::new(RefusingFactory),
        }
    }
}

pub fn seed(path: &Path) {
    let conn = rusqlite::Connection::open(path).unwrap();
    conn.execute_batch(
        "CREATE TABLE customers (id INTEGER PRIMARY KEY, name TEXT NOT NULL, region TEXT NOT NULL);
         CREATE TABLE orders (id INTEGER PRIMARY KEY, customer_id INTEGER NOT NULL, region TEXT NOT NULL, amount REAL NOT NULL, status TEXT NOT NULL);",
    )
    .unwrap();
    for id in 1..=20usize {
        conn.execute(
            "INSERT INTO customers (id, name, region) VALUES (?1, ?2, ?3)",
            rusqlite::params![id as i64, format!("customer-{}", id), REGIONS[id % 4]],
        )
        .unwrap();
    }
    for id in 1..=ORDER_ROWS {
        let status = if id % 3 == 0 { "shipped" } else { "open" };
        conn.execute(
            "INSERT INTO orders (id, customer_id, region, amount, status) VALUES (?1, ?2, ?3, ?4, ?5)",
            rusqlite::params![
                id as i64,
                (id % 20 + 1) as i64,
                REGIONS[id % 4],
                (id % 13) as f64 * 2.5,
                status
            ],
        )
        .unwrap();
    }
}

pub struct RefusingFactory;

#[async_trait]
impl ConnectionFactory for RefusingFactory {
    async fn connect(&self) -> Result<Box<dyn StoreConnection>, StoreError> {
        Err(StoreError::Connect("connection refused".into()))
    }

    fn describe(&self) -> String {
        "refusing://olap".into()
    }
}
