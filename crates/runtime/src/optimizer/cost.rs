use std::sync::Arc;

use sluice_common::models::QueryPlan;

use crate::classifier::TableStatistics;
use crate::sql_shape::{self, StatementKind};

// Unit costs per row.
const IO_PER_ROW: f64 = 0.01;
const CPU_PER_ROW: f64 = 0.001;
const MEMORY_PER_ROW: f64 = 0.0005;
const NETWORK_PER_ROW: f64 = 0.002;

#[derive(Debug, thiserror::Error)]
pub enum CostError {
    #[error("query could not be tokenized")]
    Unparseable,
}

/// Heuristic cost estimates from table sizes and structural penalties.
#[derive(Debug, Clone)]
pub struct CostModel {
    statistics: Arc<TableStatistics>,
}

impl CostModel {
    pub fn new(statistics: Arc<TableStatistics>) -> Self {
        Self { statistics }
    }

    pub fn estimate(&self, sql: &str) -> Result<QueryPlan, CostError> {
        let shape = sql_shape::analyze(sql);
        if !shape.tokenized {
            return Err(CostError::Unparseable);
        }

        let mut table_rows: Vec<u64> = shape
            .tables
            .iter()
            .map(|t| self.statistics.estimate(t))
            .collect();
        table_rows.sort_unstable_by(|a, b| b.cmp(a));

        let scanned: u64 = if shape.key_equality && !shape.has_joins {
            1
        } else {
            table_rows.iter().sum::<u64>().max(1)
        };

        let materializing = shape.has_aggregations()
            || shape.has_window_functions
            || shape.has_order_by
            || shape.has_distinct;

        // A LIMIT stops a streaming scan early; a materializing plan reads everything.
        let read_rows = match shape.limit {
            Some(limit) if !materializing && !shape.has_joins => scanned.min(limit),
            _ => scanned,
        } as f64;

        let output_rows = {
            let base = if shape.has_group_by {
                (scanned as f64 / 10.0).max(1.0)
            } else if shape.has_aggregate_functions {
                1.0
            } else {
                scanned as f64
            };
            match shape.limit {
                Some(limit) => base.min(limit as f64),
                None => base,
            }
        };

        let mut cpu_multiplier = 1.0;
        if shape.has_aggregations() {
            cpu_multiplier += 0.5;
        }
        if shape.has_window_functions {
            cpu_multiplier += 1.0;
        }
        if shape.has_subqueries {
            cpu_multiplier += 0.5;
        }
        let joins = table_rows.len().saturating_sub(1) as f64;
        cpu_multiplier += 0.5 * joins;

        let io_cost = read_rows * IO_PER_ROW;
        let cpu_cost = read_rows * CPU_PER_ROW * cpu_multiplier;

        let mut memory_rows = if materializing { read_rows } else { 0.0 };
        if shape.has_joins {
            // Hash join builds on the smaller inputs.
            memory_rows += table_rows.iter().skip(1).sum::<u64>() as f64;
        }
        let memory_cost = memory_rows * MEMORY_PER_ROW;
        let network_cost = output_rows * NETWORK_PER_ROW;

        let mut plan = QueryPlan::new(cpu_cost, io_cost, memory_cost, network_cost);
        plan.estimated_duration_ms = plan.total_cost.ceil() as u64;

        let known = shape
            .tables
            .iter()
            .filter(|t| self.statistics.contains(t))
            .count();
        let mut confidence = if shape.tables.is_empty() {
            0.6
        } else {
            0.4 + 0.5 * known as f64 / shape.tables.len() as f64
        };
        if shape.has_subqueries || shape.statement != StatementKind::Select {
            confidence -= 0.1;
        }
        plan.confidence = confidence.clamp(0.1, 0.95);
        Ok(plan)
    }

    /// Pessimistic plan used when estimation fails.
    pub fn conservative() -> QueryPlan {
        let mut plan = QueryPlan::new(1_000.0, 10_000.0, 500.0, 2_000.0);
        plan.estimated_duration_ms = plan.total_cost.ceil() as u64;
        plan.confidence = 0.1;
        plan
    }
}

/// Percent saved going from `before` to `after`, never negative.
pub fn improvement_pct(before: &QueryPlan, after: &QueryPlan) -> f64 {
    if before.total_cost <= f64::EPSILON {
        return 0.0;
    }
    ((before.total_cost - after.total_cost) / before.total_cost * 100.0).clamp(0.0, 100.0)
}
