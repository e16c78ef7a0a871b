use std::collections::HashMap;

use chrono::{NaiveDate, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;

use sluice_common::models::ResourceQuota;
use sluice_error::{ErrorCode, ErrorContext, SluiceError};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TenantUsage {
    pub running: usize,
    pub reserved_memory_mb: u64,
    pub queries_today: u64,
}

/// Per-tenant quotas and the usage counted against them.
pub(crate) struct QuotaTracker {
    default_quota: RwLock<ResourceQuota>,
    quotas: DashMap<String, ResourceQuota>,
    usage: DashMap<String, TenantUsage>,
    day: Mutex<NaiveDate>,
}

impl QuotaTracker {
    pub(crate) fn new(default_quota: ResourceQuota, quotas: HashMap<String, ResourceQuota>) -> Self {
        Self {
            default_quota: RwLock::new(default_quota),
            quotas: quotas.into_iter().collect(),
            usage: DashMap::new(),
            day: Mutex::new(Utc::now().date_naive()),
        }
    }

    pub(crate) fn quota_for(&self, tenant: &str) -> ResourceQuota {
        self.quotas
            .get(tenant)
            .map(|q| q.clone())
            .unwrap_or_else(|| self.default_quota.read().clone())
    }

    pub(crate) fn set_quota(&self, tenant: &str, quota: ResourceQuota) {
        self.quotas.insert(tenant.to_string(), quota);
    }

    pub(crate) fn usage(&self, tenant: &str) -> TenantUsage {
        self.usage.get(tenant).map(|u| *u).unwrap_or_default()
    }

    /// Reset daily counters when the UTC date changes.
    pub(crate) fn roll_over(&self, today: NaiveDate) -> bool {
        let mut day = self.day.lock();
        if *day == today {
            return false;
        }
        *day = today;
        for mut usage in self.usage.iter_mut() {
            usage.queries_today = 0;
        }
        true
    }

    /// Count one submission against the daily cap, failing once it is spent.
    pub(crate) fn admit(&self, tenant: &str) -> sluice_error::Result<()> {
        self.roll_over(Utc::now().date_naive());
        let quota = self.quota_for(tenant);
        let mut usage = self.usage.entry(tenant.to_string()).or_default();
        if usage.queries_today >= quota.daily_query_cap {
            return Err(SluiceError::new(
                ErrorCode::QuotaExceeded,
                format!(
                    "Tenant {} reached its daily cap of {} queries",
                    tenant, quota.daily_query_cap
                ),
            )
            .with_context(ErrorContext::Quota {
                tenant: tenant.to_string(),
                limit: quota.daily_query_cap,
                used: usage.queries_today,
            })
            .with_hint("The daily counter resets at 00:00 UTC"));
        }
        usage.queries_today += 1;
        Ok(())
    }

    /// Whether another execution fits the tenant's concurrency, memory and
    /// CPU limits. A tenant with nothing running may always start one.
    pub(crate) fn can_start(&self, tenant: &str, memory_mb: u64, cpu_percent: f64) -> bool {
        let usage = self.usage(tenant);
        if usage.running == 0 {
            return true;
        }
        let quota = self.quota_for(tenant);
        usage.running < quota.max_concurrent_queries
            && usage.reserved_memory_mb + memory_mb <= quota.max_memory_mb
            && cpu_percent <= quota.max_cpu_percent
    }

    pub(crate) fn start(&self, tenant: &str, memory_mb: u64) {
        let mut usage = self.usage.entry(tenant.to_string()).or_default();
        usage.running += 1;
        usage.reserved_memory_mb += memory_mb;
    }

    pub(crate) fn finish(&self, tenant: &str, memory_mb: u64) {
        if let Some(mut usage) = self.usage.get_mut(tenant) {
            usage.running = usage.running.saturating_sub(1);
            usage.reserved_memory_mb = usage.reserved_memory_mb.saturating_sub(memory_mb);
        }
    }
}
