use async_trait::async_trait;
use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{Connection, ErrorCode as SqliteCode};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use sluice_common::models::QueryData;

use super::{ConnectionFactory, StoreConnection, StoreError, StoreResponse};

const BUSY_TIMEOUT: Duration = Duration::from_millis(2_000);

/// Opens SQLite connections against one database file.
#[derive(Debug, Clone)]
pub struct SqliteFactory {
    path: PathBuf,
}

impl SqliteFactory {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl ConnectionFactory for SqliteFactory {
    async fn connect(&self) -> Result<Box<dyn StoreConnection>, StoreError> {
        let path = self.path.clone();
        let conn = tokio::task::spawn_blocking(move || {
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent).map_err(|e| StoreError::Connect(e.to_string()))?;
                }
            }
            let conn = Connection::open(&path).map_err(|e| StoreError::Connect(e.to_string()))?;
            conn.busy_timeout(BUSY_TIMEOUT)
                .map_err(|e| StoreError::Connect(e.to_string()))?;
            Ok::<_, StoreError>(conn)
        })
        .await
        .map_err(|e| StoreError::Connect(format!("open task failed: {}", e)))??;

        Ok(Box::new(SqliteConnection {
            conn: Arc::new(Mutex::new(conn)),
        }))
    }

    fn describe(&self) -> String {
        format!("sqlite://{}", self.path.display())
    }
}

pub struct SqliteConnection {
    conn: Arc<Mutex<Connection>>,
}

#[async_trait]
impl StoreConnection for SqliteConnection {
    async fn execute(
        &self,
        sql: &str,
        params: &[serde_json::Value],
    ) -> Result<StoreResponse, StoreError> {
        let conn = self.conn.clone();
        let sql = sql.to_string();
        let params: Vec<SqlValue> = params.iter().map(json_to_sql).collect();

        tokio::task::spawn_blocking(move || {
            let conn = conn
                .lock()
                .map_err(|_| StoreError::Transient("SQLite connection lock poisoned".into()))?;
            run_statement(&conn, &sql, &params).map_err(classify)
        })
        .await
        .map_err(|e| StoreError::Transient(format!("execution task failed: {}", e)))?
    }

    async fn ping(&self) -> Result<(), StoreError> {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn
                .lock()
                .map_err(|_| StoreError::Transient("SQLite connection lock poisoned".into()))?;
            conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
                .map(|_| ())
                .map_err(classify)
        })
        .await
        .map_err(|e| StoreError::Transient(format!("ping task failed: {}", e)))?
    }
}

fn run_statement(
    conn: &Connection,
    sql: &str,
    params: &[SqlValue],
) -> rusqlite::Result<StoreResponse> {
    let mut stmt = conn.prepare(sql)?;
    let column_count = stmt.column_count();

    if column_count == 0 {
        let changed = stmt.execute(rusqlite::params_from_iter(params.iter()))?;
        return Ok(StoreResponse {
            data: QueryData::default(),
            rows_affected: Some(changed as u64),
        });
    }

    let columns: Vec<String> = stmt.column_names().iter().map(|c| c.to_string()).collect();
    let mut rows = stmt.query(rusqlite::params_from_iter(params.iter()))?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        let mut values = Vec::with_capacity(column_count);
        for idx in 0..column_count {
            values.push(sql_to_json(row.get_ref(idx)?));
        }
        out.push(values);
    }

    Ok(StoreResponse {
        data: QueryData { columns, rows: out },
        rows_affected: None,
    })
}

fn classify(err: rusqlite::Error) -> StoreError {
    match &err {
        rusqlite::Error::SqliteFailure(e, _)
            if matches!(
                e.code,
                SqliteCode::DatabaseBusy | SqliteCode::DatabaseLocked | SqliteCode::SystemIoFailure
            ) =>
        {
            StoreError::Transient(err.to_string())
        }
        _ => StoreError::Query(err.to_string()),
    }
}

fn json_to_sql(value: &serde_json::Value) -> SqlValue {
    match value {
        serde_json::Value::Null => SqlValue::Null,
        serde_json::Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        serde_json::Value::Number(n) => match n.as_i64() {
            Some(i) => SqlValue::Integer(i),
            None => SqlValue::Real(n.as_f64().unwrap_or_default()),
        },
        serde_json::Value::String(s) => SqlValue::Text(s.clone()),
        other => SqlValue::Text(other.to_string()),
    }
}

fn sql_to_json(value: ValueRef<'_>) -> serde_json::Value {
    match value {
        ValueRef::Null => serde_json::Value::Null,
        ValueRef::Integer(i) => serde_json::Value::from(i),
        ValueRef::Real(f) => serde_json::Value::from(f),
        ValueRef::Text(t) => serde_json::Value::String(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => serde_json::Value::String(format!("<{} bytes>", b.len())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_execute_rows_and_changes() {
        let dir = tempfile::tempdir().unwrap();
        let factory = SqliteFactory::new(dir.path().join("store.db"));
        let conn = factory.connect().await.unwrap();

        conn.execute("CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT)", &[])
            .await
            .unwrap();
        let inserted = conn
            .execute(
                "INSERT INTO users (name) VALUES (?1), (?2)",
                &[json!("Alice"), json!("Bob")],
            )
            .await
            .unwrap();
        assert_eq!(inserted.rows_affected, Some(2));

        let rows = conn
            .execute("SELECT id, name FROM users WHERE id = ?1", &[json!(2)])
            .await
            .unwrap();
        assert_eq!(rows.data.columns, vec!["id", "name"]);
        assert_eq!(rows.data.rows, vec![vec![json!(2), json!("Bob")]]);
        conn.ping().await.unwrap();
    }

    #[tokio::test]
    async fn test_bad_sql_is_permanent() {
        let dir = tempfile::tempdir().unwrap();
        let factory = SqliteFactory::new(dir.path().join("store.db"));
        let conn = factory.connect().await.unwrap();
        let err = conn.execute("SELEC nonsense", &[]).await.unwrap_err();
        assert!(!err.is_transient());
    }
}
