//! Rollback planning: derive the inverse plan from a partial apply result.
//!
//! Only operations whose apply outcome was COMPLETED are rollback-eligible;
//! each contributes its inverse kind with targets preserved. Dependency
//! edges are reversed (if A depended on B in the apply, the inverse of B
//! depends on the inverse of A) and edges touching ineligible operations
//! are dropped. The planner never re-reads hardware state.

use std::collections::{HashMap, HashSet};

use crate::plan::result::{OpResult, OpStatus};
use crate::plan::{Operation, Plan};

/// Build the inverse plan for a failed or canceled apply.
pub fn plan_rollback(plan: &Plan, results: &[OpResult]) -> Plan {
    let eligible: HashSet<u64> = results
        .iter()
        .filter(|r| r.status == OpStatus::Completed)
        .map(|r| r.operation_id)
        .collect();

    // Reversed edges restricted to eligible operations: apply edge
    // dep -> op becomes rollback edge op -> dep.
    let mut reversed: HashMap<u64, Vec<u64>> = HashMap::new();
    for op in &plan.procedures {
        if !eligible.contains(&op.id) {
            continue;
        }
        for dep in &op.dependencies {
            if eligible.contains(dep) {
                reversed.entry(*dep).or_default().push(op.id);
            }
        }
    }

    let procedures = plan
        .procedures
        .iter()
        .filter(|op| eligible.contains(&op.id))
        .map(|op| Operation {
            id: op.id,
            kind: op.kind.inverse(),
            dependencies: reversed.remove(&op.id).unwrap_or_default(),
            device_id: op.device_id.clone(),
            cpu_id: op.cpu_id.clone(),
            request_instance_id: op.request_instance_id.clone(),
        })
        .collect();

    Plan::new(procedures)
}
