//! PostgreSQL `EXPLAIN (FORMAT JSON)` output → [`ExecutionPlan`].

use nlq_types::{ExecutionPlan, PlanSource};
use serde_json::Value;

const SCAN_NODES: [&str; 2] = ["Seq Scan", "Parallel Seq Scan"];

/// Keys whose presence on a nested-loop input means rows are correlated.
const CORRELATION_KEYS: [&str; 4] = ["Index Cond", "Filter", "Recheck Cond", "Join Filter"];

pub fn parse_explain(raw: &Value, source: PlanSource) -> Result<ExecutionPlan, String> {
    let root = match raw {
        Value::Array(items) => items.first(),
        Value::Object(_) => Some(raw),
        _ => None,
    }
    .and_then(|v| v.get("Plan"))
    .ok_or_else(|| "EXPLAIN output has no Plan node".to_string())?;

    let declared_cost = root.get("Total Cost").and_then(Value::as_f64);
    let mut plan = ExecutionPlan {
        declared_cost,
        warnings: Vec::new(),
        affected_tables: Vec::new(),
        full_scans: 0,
        cartesian: false,
        source,
    };
    walk(root, &mut plan);

    if source == PlanSource::RuntimeStatistics {
        if let Some(ms) = root.get("Actual Total Time").and_then(Value::as_f64) {
            plan.warnings.push(format!("measured run time {ms:.1} ms"));
        }
        if let Some(rows) = root.get("Actual Rows").and_then(Value::as_f64) {
            plan.warnings.push(format!("measured {rows:.0} result row(s)"));
        }
    }
    Ok(plan)
}

fn walk(node: &Value, plan: &mut ExecutionPlan) {
    let node_type = node.get("Node Type").and_then(Value::as_str).unwrap_or("");
    if SCAN_NODES.contains(&node_type) {
        plan.full_scans += 1;
    }
    if let Some(rel) = node.get("Relation Name").and_then(Value::as_str) {
        let rel = rel.to_ascii_uppercase();
        if !plan.affected_tables.contains(&rel) {
            plan.affected_tables.push(rel);
        }
    }
    let children: &[Value] = node
        .get("Plans")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or(&[]);
    if node_type == "Nested Loop" && node.get("Join Filter").is_none() && !children.iter().any(correlated) {
        plan.cartesian = true;
    }
    for child in children {
        walk(child, plan);
    }
}

/// A nested-loop input is correlated if it, or a Materialize directly under
/// it, carries a condition.
fn correlated(node: &Value) -> bool {
    if CORRELATION_KEYS.iter().any(|k| node.get(*k).is_some()) {
        return true;
    }
    if node.get("Node Type").and_then(Value::as_str) == Some("Materialize") {
        return node
            .get("Plans")
            .and_then(Value::as_array)
            .map(|ps| ps.iter().any(correlated))
            .unwrap_or(false);
    }
    false
}
