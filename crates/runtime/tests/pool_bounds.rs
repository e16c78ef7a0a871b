mod support;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use sluice_common::config::PoolSettings;
use sluice_common::models::StoreKind;
use sluice_error::ErrorCode;
use sluice_runtime::pool::ConnectionPool;
use sluice_runtime::store::SqliteFactory;
use tempfile::TempDir;

fn settings(url: String, min: usize, max: usize) -> PoolSettings {
    PoolSettings {
        url,
        min_connections: min,
        max_connections: max,
        ..PoolSettings::default()
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_load_never_exceeds_max_connections() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("store.db");
    support::seed(&path);
    let url = path.display().to_string();
    let pool = ConnectionPool::new(
        StoreKind::Oltp,
        settings(url.clone(), 2, 3),
        Arc::new(SqliteFactory::new(&url)),
    )
    .await;
    assert_eq!(pool.stats().total, 2);

    let in_use = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let mut handles = Vec::new();
    for i in 0..12 {
        let pool = pool.clone();
        let in_use = in_use.clone();
        let peak = peak.clone();
        handles.push(tokio::spawn(async move {
            let mut conn = pool.acquire(Duration::from_secs(5)).await.unwrap();
            let now = in_use.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            let response = conn
                .execute(
                    "SELECT name FROM customers WHERE id = ?",
                    &[serde_json::json!(i % 20 + 1)],
                )
                .await
                .unwrap();
            assert_eq!(response.data.row_count(), 1);
            tokio::time::sleep(Duration::from_millis(20)).await;
            in_use.fetch_sub(1, Ordering::SeqCst);
            pool.release(conn, true).await;
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    assert!(peak.load(Ordering::SeqCst) <= 3);
    let stats = pool.stats();
    assert_eq!(stats.active, 0);
    assert!(stats.total <= 3);
    assert!(stats.idle >= 2);
    assert_eq!(stats.acquisitions, 12);
    pool.shutdown().await;
}

#[tokio::test]
async fn test_exhausted_pool_reports_pool_context() {
    let dir = TempDir::new().unwrap();
    let url = dir.path().join("store.db").display().to_string();
    let pool = ConnectionPool::new(
        StoreKind::Olap,
        settings(url.clone(), 0, 1),
        Arc::new(SqliteFactory::new(&url)),
    )
    .await;

    let held = pool.acquire(Duration::from_millis(100)).await.unwrap();
    let err = pool.acquire(Duration::from_millis(30)).await.err().unwrap();
    assert_eq!(err.code, ErrorCode::PoolExhausted);
    assert!(err.hint.is_some());
    assert_eq!(pool.stats().exhausted_count, 1);

    pool.release(held, true).await;
    pool.shutdown().await;
    let err = pool.acquire(Duration::from_millis(30)).await.err().unwrap();
    assert_eq!(err.code, ErrorCode::StoreUnavailable);
}
