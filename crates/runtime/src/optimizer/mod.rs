//! Rule-based rewriting plus heuristic cost estimation.
//!
//! Rules run in descending priority over the output of the previous rule. A
//! rule that errors, or whose output no longer parses, is skipped and the
//! query keeps its previous text.

pub mod cost;
pub mod rules;

use std::sync::Arc;

use moka::sync::Cache;
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, warn};

use sluice_common::config::OptimizerSettings;
use sluice_common::models::{OptimizedQuery, QueryMetadata, QueryPlan, RuleOutcome};
use sluice_error::{find_closest_match, ErrorCode, ErrorContext, SluiceError};

use crate::classifier::TableStatistics;
use crate::sql_shape::{self, SqlText};

pub use cost::{improvement_pct, CostError, CostModel};
pub use rules::{builtin_rules, RewriteRule, RuleContext, RuleError};

/// Public view of one registered rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RuleInfo {
    pub name: String,
    pub description: String,
    pub priority: u32,
    pub enabled: bool,
}

struct RuleEntry {
    rule: Box<dyn RewriteRule>,
    enabled: bool,
}

pub struct QueryOptimizer {
    rules: RwLock<Vec<RuleEntry>>,
    cost_model: CostModel,
    cache: Cache<String, OptimizedQuery>,
    enabled: bool,
    default_limit: u64,
    limit_row_threshold: u64,
}

impl QueryOptimizer {
    pub fn new(
        settings: &OptimizerSettings,
        statistics: Arc<TableStatistics>,
    ) -> sluice_error::Result<Self> {
        let rules = builtin_rules().map_err(|e| {
            SluiceError::new(ErrorCode::OptimizationFailed, "Failed to build rewrite rules")
                .with_hint(e.to_string())
        })?;
        let optimizer = Self {
            rules: RwLock::new(
                rules
                    .into_iter()
                    .map(|rule| RuleEntry { rule, enabled: true })
                    .collect(),
            ),
            cost_model: CostModel::new(statistics),
            cache: Cache::new(settings.cache_capacity.max(1)),
            enabled: settings.enabled,
            default_limit: settings.default_limit,
            limit_row_threshold: settings.limit_row_threshold,
        };
        for name in &settings.disabled_rules {
            optimizer.disable_rule(name)?;
        }
        Ok(optimizer)
    }

    /// Register an extra rule. The list stays sorted by priority.
    pub fn register(&self, rule: Box<dyn RewriteRule>) {
        let mut rules = self.rules.write();
        rules.push(RuleEntry { rule, enabled: true });
        rules.sort_by(|a, b| b.rule.priority().cmp(&a.rule.priority()));
        drop(rules);
        self.cache.invalidate_all();
    }

    pub fn optimize(&self, sql: &str, metadata: &QueryMetadata) -> OptimizedQuery {
        if !self.enabled {
            return OptimizedQuery::unchanged(sql);
        }

        let key = sql_shape::hash_text(&format!(
            "{}|{}|{}",
            sql, metadata.category, metadata.estimated_rows
        ));
        if let Some(cached) = self.cache.get(&key) {
            return cached;
        }

        let result = self.run_rules(sql, metadata);
        self.cache.insert(key, result.clone());
        result
    }

    fn run_rules(&self, sql: &str, metadata: &QueryMetadata) -> OptimizedQuery {
        let ctx = RuleContext {
            metadata,
            default_limit: self.default_limit,
            limit_row_threshold: self.limit_row_threshold,
        };
        let original_parses = sql_shape::parses(sql);

        let mut current = sql.to_string();
        let mut strategies = Vec::new();
        let mut outcomes = Vec::new();

        let rules = self.rules.read();
        for entry in rules.iter() {
            let name = entry.rule.name().to_string();
            if !entry.enabled {
                outcomes.push((name, RuleOutcome::Skipped("disabled".to_string())));
                continue;
            }
            if !entry.rule.applies_to(&ctx) {
                outcomes.push((name, RuleOutcome::NotApplicable));
                continue;
            }
            let text = match SqlText::parse(&current) {
                Ok(text) => text,
                Err(e) => {
                    outcomes.push((name, RuleOutcome::Skipped(format!("untokenizable: {}", e))));
                    continue;
                }
            };
            match entry.rule.rewrite(&text, &ctx) {
                Ok(None) => outcomes.push((name, RuleOutcome::NotApplicable)),
                Ok(Some(rewritten)) if rewritten == current => {
                    outcomes.push((name, RuleOutcome::NotApplicable))
                }
                Ok(Some(rewritten)) => {
                    if original_parses && !sql_shape::parses(&rewritten) {
                        warn!(
                            target: "optimizer",
                            rule = %name,
                            "Rewrite produced unparseable SQL, keeping previous text"
                        );
                        outcomes.push((
                            name,
                            RuleOutcome::Failed("rewrite does not parse".to_string()),
                        ));
                        continue;
                    }
                    debug!(target: "optimizer", rule = %name, "Rule applied");
                    current = rewritten;
                    strategies.push(name.clone());
                    outcomes.push((name, RuleOutcome::Applied));
                }
                Err(e) => {
                    warn!(target: "optimizer", rule = %name, error = %e, "Rule failed, skipping");
                    outcomes.push((name, RuleOutcome::Failed(e.to_string())));
                }
            }
        }
        drop(rules);

        let cost_before = self.estimate_cost(sql);
        let cost_after = if strategies.is_empty() {
            cost_before.clone()
        } else {
            self.estimate_cost(&current)
        };
        let estimated_improvement_pct = improvement_pct(&cost_before, &cost_after);

        OptimizedQuery {
            original: sql.to_string(),
            rewritten: current,
            strategies,
            estimated_improvement_pct,
            outcomes,
            cost_before: Some(cost_before),
            cost_after: Some(cost_after),
        }
    }

    /// Heuristic plan for `sql`; falls back to a conservative plan.
    pub fn estimate_cost(&self, sql: &str) -> QueryPlan {
        match self.cost_model.estimate(sql) {
            Ok(plan) => plan,
            Err(e) => {
                debug!(target: "optimizer", error = %e, "Cost estimation failed, using conservative plan");
                CostModel::conservative()
            }
        }
    }

    pub fn list_rules(&self) -> Vec<RuleInfo> {
        self.rules
            .read()
            .iter()
            .map(|entry| RuleInfo {
                name: entry.rule.name().to_string(),
                description: entry.rule.description().to_string(),
                priority: entry.rule.priority(),
                enabled: entry.enabled,
            })
            .collect()
    }

    pub fn enable_rule(&self, name: &str) -> sluice_error::Result<()> {
        self.set_rule_enabled(name, true)
    }

    pub fn disable_rule(&self, name: &str) -> sluice_error::Result<()> {
        self.set_rule_enabled(name, false)
    }

    pub fn set_rule_enabled(&self, name: &str, enabled: bool) -> sluice_error::Result<()> {
        let mut rules = self.rules.write();
        let Some(entry) = rules.iter_mut().find(|e| e.rule.name() == name) else {
            let available: Vec<String> = rules.iter().map(|e| e.rule.name().to_string()).collect();
            let mut err = SluiceError::new(
                ErrorCode::UnknownRule,
                format!("Unknown optimizer rule '{}'", name),
            );
            if let Some(closest) = find_closest_match(name, &available) {
                err = err.with_hint(format!("Did you mean '{}'?", closest));
            }
            return Err(err.with_context(ErrorContext::Rule {
                rule: name.to_string(),
                available_rules: available,
            }));
        };
        entry.enabled = enabled;
        drop(rules);
        self.cache.invalidate_all();
        debug!(target: "optimizer", rule = name, enabled, "Rule toggled");
        Ok(())
    }

    pub fn clear_cache(&self) {
        self.cache.invalidate_all();
    }
}
