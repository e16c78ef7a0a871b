//! Health roll-up across the backing stores.

use chrono::{DateTime, Utc};
use serde::Serialize;

use sluice_common::circuit_breaker::CircuitState;
use sluice_common::models::StoreKind;

/// Pool health scores under this mark a store as degraded.
const DEGRADED_SCORE: f64 = 50.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, Serialize)]
pub struct StoreHealth {
    pub store: StoreKind,
    pub reachable: bool,
    pub breaker: CircuitState,
    pub pool_health_score: f64,
    pub active_connections: usize,
    pub idle_connections: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StoreHealth {
    pub fn status(&self) -> HealthStatus {
        if !self.reachable || self.breaker == CircuitState::Open {
            HealthStatus::Unhealthy
        } else if self.breaker == CircuitState::HalfOpen || self.pool_health_score < DEGRADED_SCORE
        {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub stores: Vec<StoreHealth>,
    pub pressure_score: f64,
    pub checked_at: DateTime<Utc>,
}

impl HealthReport {
    pub fn new(stores: Vec<StoreHealth>, pressure_score: f64) -> Self {
        Self {
            status: roll_up(&stores),
            stores,
            pressure_score,
            checked_at: Utc::now(),
        }
    }
}

/// OLTP serves every write and is the read fallback, so losing it is fatal.
/// Losing OLAP alone only degrades service.
pub fn roll_up(stores: &[StoreHealth]) -> HealthStatus {
    let mut status = HealthStatus::Healthy;
    for store in stores {
        match (store.store, store.status()) {
            (StoreKind::Oltp, HealthStatus::Unhealthy) => return HealthStatus::Unhealthy,
            (_, HealthStatus::Healthy) => {}
            _ => status = HealthStatus::Degraded,
        }
    }
    status
}
