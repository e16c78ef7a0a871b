//! Every rewrite must return the same rows as the query it replaced.

mod support;

use std::collections::BTreeSet;

use sluice_common::config::{ClassifierSettings, OptimizerSettings};
use sluice_runtime::classifier::QueryClassifier;
use sluice_runtime::optimizer::QueryOptimizer;
use sluice_runtime::sql_shape;
use sluice_runtime::store::{ConnectionFactory, SqliteFactory, StoreResponse};
use tempfile::TempDir;

const CORPUS: &[&str] = &[
    "SELECT id, amount FROM orders WHERE status = 'open' AND 1=1;",
    "SELECT id FROM orders WHERE 1 = 1 ORDER BY id",
    "SELECT COUNT(1) AS n FROM orders WHERE region = 'north'",
    "SELECT region, count( 1 ) AS n FROM orders GROUP BY region",
    "SELECT id FROM orders WHERE region = 'north' OR region = 'south'",
    "SELECT id FROM orders WHERE amount > 5 AND (status = 'open' OR status = 'shipped')",
    "SELECT id, amount FROM orders WHERE customer_id IN (SELECT id FROM customers WHERE customers.region = 'north')",
    "SELECT o.id FROM orders o WHERE o.customer_id IN (SELECT id FROM customers WHERE customers.region = 'east')",
    "SELECT id FROM orders WHERE customer_id IN (SELECT id FROM customers WHERE id < amount)",
    "SELECT o.id FROM orders o WHERE o.customer_id IN (SELECT id FROM customers WHERE customers.region = o.region)",
    "SELECT region, COUNT(*) AS order_count, SUM(amount) AS revenue FROM orders GROUP BY region",
    "SELECT id, SUM(amount) OVER (PARTITION BY region) AS regional FROM orders",
    "SELECT id FROM orders WHERE status = 'a AND 1=1' OR status = 'open'",
    "SELECT name FROM customers WHERE id = 4",
    "SELECT id FROM orders WHERE region = 'west' OR region = 'east' AND amount > 10",
];

fn components() -> (QueryClassifier, QueryOptimizer) {
    let mut settings = ClassifierSettings::default();
    settings.table_rows.insert("orders".into(), 5_000_000);
    settings.table_rows.insert("customers".into(), 20);
    let classifier = QueryClassifier::new(&settings);
    let optimizer =
        QueryOptimizer::new(&OptimizerSettings::default(), classifier.statistics()).unwrap();
    (classifier, optimizer)
}

fn canonical(response: &StoreResponse) -> (Vec<String>, Vec<Vec<serde_json::Value>>) {
    (response.data.columns.clone(), response.data.sorted_rows())
}

#[tokio::test]
async fn test_rewrites_preserve_results_on_sqlite() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let path = dir.path().join("store.db");
    support::seed(&path);
    let conn = SqliteFactory::new(&path).connect().await?;
    let (classifier, optimizer) = components();

    let mut applied = BTreeSet::new();
    for sql in CORPUS {
        let metadata = classifier.classify(sql, None);
        let optimized = optimizer.optimize(sql, &metadata);
        if !optimized.is_rewritten() {
            continue;
        }
        assert!(
            sql_shape::parses(&optimized.rewritten),
            "rewrite of {} does not parse: {}",
            sql,
            optimized.rewritten
        );

        let original = conn.execute(sql, &[]).await?;
        let rewritten = conn
            .execute(&optimized.rewritten, &[])
            .await
            .unwrap_or_else(|e| panic!("{} failed: {}", optimized.rewritten, e));
        assert_eq!(
            canonical(&original),
            canonical(&rewritten),
            "{} -> {}",
            sql,
            optimized.rewritten
        );
        applied.extend(optimized.strategies.iter().cloned());
    }

    for rule in [
        "strip_trailing_semicolon",
        "remove_tautology",
        "count_one_to_count_star",
        "or_chain_to_in",
        "in_subquery_to_join",
        "append_limit",
    ] {
        assert!(applied.contains(rule), "{} never fired over the corpus", rule);
    }
    Ok(())
}

#[tokio::test]
async fn test_unsafe_shapes_are_left_alone() {
    let (classifier, optimizer) = components();
    for sql in [
        // Correlated subquery.
        "SELECT o.id FROM orders o WHERE o.customer_id IN (SELECT id FROM customers WHERE customers.region = o.region)",
        // `amount` only exists on the outer table.
        "SELECT id FROM orders WHERE customer_id IN (SELECT id FROM customers WHERE id < amount)",
        // AND binds tighter than OR.
        "SELECT id FROM customers WHERE region = 'west' OR region = 'east' AND id > 10",
        // The tautology is inside a literal.
        "SELECT id FROM customers WHERE name = 'x WHERE 1=1'",
    ] {
        let metadata = classifier.classify(sql, None);
        let optimized = optimizer.optimize(sql, &metadata);
        assert!(
            !optimized
                .strategies
                .iter()
                .any(|s| s == "in_subquery_to_join" || s == "or_chain_to_in" || s == "remove_tautology"),
            "{} was rewritten to {}",
            sql,
            optimized.rewritten
        );
    }
}
