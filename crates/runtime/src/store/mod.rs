//! Backing-store contract.
//!
//! A store is reached through a [`ConnectionFactory`] that opens
//! [`StoreConnection`]s; the pool owns the connections.

pub mod sqlite;

use async_trait::async_trait;
use sluice_common::models::{QueryData, StoreKind};
use sluice_error::{ErrorCode, SluiceError};

pub use sqlite::SqliteFactory;

/// What a store returns for one statement.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StoreResponse {
    pub data: QueryData,
    /// Set for statements that return no rows.
    pub rows_affected: Option<u64>,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("connection failed: {0}")]
    Connect(String),
    /// The statement itself is wrong. Retrying will not help.
    #[error("query failed: {0}")]
    Query(String),
    /// Lock contention or a dropped link. Worth retrying.
    #[error("store temporarily unavailable: {0}")]
    Transient(String),
    #[error("connection closed")]
    Closed,
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        !matches!(self, StoreError::Query(_))
    }

    pub fn into_sluice(self, store: StoreKind) -> SluiceError {
        match self {
            StoreError::Connect(msg) => SluiceError::new(
                ErrorCode::StoreUnavailable,
                format!("Cannot connect to {} store: {}", store, msg),
            ),
            other => {
                let transient = other.is_transient();
                SluiceError::execution(store.as_str(), other.to_string(), transient)
            }
        }
    }
}

#[async_trait]
pub trait StoreConnection: Send + Sync {
    async fn execute(
        &self,
        sql: &str,
        params: &[serde_json::Value],
    ) -> Result<StoreResponse, StoreError>;

    /// Cheap liveness probe.
    async fn ping(&self) -> Result<(), StoreError>;

    async fn close(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn StoreConnection>, StoreError>;

    /// Human readable target, for logs.
    fn describe(&self) -> String;
}
