use mpp_core::query_optimizer::{ScanHint, ScanHintType, DISCARDED_PLAN_COST};
use mpp_core::{Error, OptimizedPlan, Optimizer, OptimizerConfig, PlanHint, QueryInput};
use serde_json::{json, Value};
use std::fs;
use tempfile::tempdir;

fn tables() -> Value {
    json!([
        {
            "name": "orders",
            "storage": "append_only_column",
            "distribution": {"hashed": [1]},
            "columns": [1, 2, 3],
            "stats": {"rows": 1000000, "width": 48, "column_ndvs": {"2": 50000}},
            "indexes": [{"name": "orders_cust", "index_type": "btree", "key_columns": [2]}]
        },
        {
            "name": "customers",
            "storage": "heap",
            "distribution": {"hashed": [10]},
            "columns": [10, 11],
            "stats": {"rows": 50000, "width": 64}
        }
    ])
}

fn orders_join_customers() -> Value {
    json!({
        "op": "inner_join",
        "keys": [{"left": 2, "right": 10}],
        "left": {"op": "get", "table": "orders", "stats": {"rows": 1000000, "width": 48, "column_ndvs": {"2": 50000}}},
        "right": {"op": "get", "table": "customers", "stats": {"rows": 50000, "width": 64}},
        "stats": {"rows": 1000000, "width": 112, "column_ndvs": {"2": 50000, "10": 50000}}
    })
}

fn optimize_files(query: Value, config: Option<Value>) -> mpp_core::Result<OptimizedPlan> {
    let dir = tempdir().unwrap();
    let query_path = dir.path().join("query.json");
    fs::write(&query_path, serde_json::to_string_pretty(&query).unwrap()).unwrap();
    let config = match config {
        Some(config) => {
            let config_path = dir.path().join("optimizer.json");
            fs::write(&config_path, config.to_string()).unwrap();
            OptimizerConfig::load(&config_path)?
        }
        None => OptimizerConfig::default(),
    };
    let query = QueryInput::load(&query_path)?;
    Optimizer::from_config(&config)?.optimize(&query)
}

#[test]
fn test_join_without_hints_uses_hash_join() {
    let query = json!({"tables": tables(), "plan": orders_join_customers()});
    let plan = optimize_files(query, Some(json!({"segments": 8}))).unwrap();
    let text = plan.explain().unwrap();

    assert!(text.starts_with("-> GatherMotion"), "{text}");
    assert!(text.contains("HashJoin"), "{text}");
    assert!(!text.contains("NLJoin"), "{text}");
    assert_eq!(plan.hint_violations, 0);
    assert_eq!(plan.stats.groups, 3);
    // both join orders were explored
    assert_eq!(plan.stats.group_exprs, 4);
}

#[test]
fn test_join_type_hint_forces_nested_loop() {
    let query = json!({"tables": tables(), "plan": orders_join_customers()});
    let config = json!({
        "segments": 8,
        "plan_hints": {"join_type_hints": [{"aliases": ["customers", "orders"], "join_type": "NestLoop"}]}
    });
    let plan = optimize_files(query, Some(config)).unwrap();
    let text = plan.explain().unwrap();

    assert!(text.contains("NLJoin"), "{text}");
    assert!(!text.contains("HashJoin"), "{text}");
    assert_eq!(plan.hint_violations, 0);
    assert!(plan.stats.alternatives_rejected > 0);
}

#[test]
fn test_discarded_redistribution_avoids_redistributed_hash_join() {
    let query = json!({"tables": tables(), "plan": orders_join_customers()});
    let config = json!({
        "segments": 8,
        "traces": {"discard_redistribute_hash_join": true}
    });
    let plan = optimize_files(query, Some(config)).unwrap();
    let text = plan.explain().unwrap();

    assert!(plan.cost.value() < DISCARDED_PLAN_COST);
    assert!(!text.contains("RedistributeMotion"), "{text}");
}

fn indexed_lookup() -> Value {
    json!({
        "tables": tables(),
        "plan": {
            "op": "select",
            "predicates": [{"column": 2, "op": "eq"}],
            "input": {"op": "get", "table": "orders", "stats": {"rows": 1000000, "width": 48}},
            "stats": {"rows": 20, "width": 48}
        }
    })
}

#[test]
fn test_scan_hint_with_index_name() {
    let hints = PlanHint::new().with_scan_hint(ScanHint::new("orders", vec![ScanHintType::IndexScan]).with_index("orders_cust"));
    let config = json!({"segments": 8, "plan_hints": hints});
    let plan = optimize_files(indexed_lookup(), Some(config)).unwrap();
    let text = plan.explain().unwrap();

    assert!(text.contains("IndexScan orders using orders_cust"), "{text}");
    assert_eq!(plan.hint_violations, 0);
}

#[test]
fn test_scan_hint_on_missing_index_falls_back() {
    let hints = PlanHint::new().with_scan_hint(ScanHint::new("orders", vec![ScanHintType::IndexScan]).with_index("orders_missing"));
    let config = json!({"segments": 8, "plan_hints": hints});
    let plan = optimize_files(indexed_lookup(), Some(config)).unwrap();

    assert!(plan.hint_violations >= 1);
    assert!(plan.stats.hint_fallbacks >= 1);
}

#[test]
fn test_no_seq_scan_hint_picks_an_index_path() {
    let hints = PlanHint::new().with_scan_hint(ScanHint::new("orders", vec![ScanHintType::NoSeqScan]));
    let config = json!({"segments": 8, "plan_hints": hints});
    let plan = optimize_files(indexed_lookup(), Some(config)).unwrap();
    let text = plan.explain().unwrap();

    assert!(!text.contains("-> TableScan"), "{text}");
    assert!(text.contains("IndexScan") || text.contains("BitmapTableScan"), "{text}");
    assert_eq!(plan.hint_violations, 0);
}

#[test]
fn test_partitioned_and_foreign_relations() {
    let query = json!({
        "tables": [
            {"name": "events", "storage": "heap", "distribution": {"hashed": [1]}, "partitioned": true,
             "columns": [1, 2], "stats": {"rows": 200000, "width": 32}},
            {"name": "lookup", "storage": "foreign", "distribution": "random",
             "columns": [5, 6], "stats": {"rows": 1000, "width": 16}}
        ],
        "plan": {
            "op": "gb_agg",
            "grouping": [6],
            "aggregates": [{"function": "count"}],
            "input": {
                "op": "inner_join",
                "keys": [{"left": 2, "right": 5}],
                "left": {"op": "get", "table": "events", "stats": {"rows": 200000, "width": 32}},
                "right": {"op": "get", "table": "lookup", "stats": {"rows": 1000, "width": 16}},
                "stats": {"rows": 200000, "width": 48, "column_ndvs": {"6": 500}}
            },
            "stats": {"rows": 500, "width": 16}
        }
    });
    let plan = optimize_files(query, None).unwrap();
    let text = plan.explain().unwrap();

    assert!(text.contains("DynamicTableScan events"), "{text}");
    assert!(text.contains("ForeignScan lookup"), "{text}");
    assert!(text.contains("Agg"), "{text}");
}

#[test]
fn test_invalid_config_is_rejected() {
    let query = json!({"tables": tables(), "plan": orders_join_customers()});
    let err = optimize_files(query, Some(json!({"hints": {"skew_factor": 500}}))).unwrap_err();
    assert!(matches!(err, Error::Config(_)));

    let query = json!({"tables": tables(), "plan": orders_join_customers()});
    let err = optimize_files(query, Some(json!({"cost_params": {"NljFactor": 0.5}}))).unwrap_err();
    assert!(matches!(err, Error::ConfigurationInvariantViolation { .. }));
}

#[test]
fn test_unknown_relation_is_invalid_plan() {
    let query = json!({
        "tables": tables(),
        "plan": {"op": "get", "table": "missing", "stats": {"rows": 1, "width": 1}}
    });
    assert!(matches!(optimize_files(query, None), Err(Error::InvalidPlan(_))));
}
