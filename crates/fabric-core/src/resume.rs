//! Resume planning: the residual sub-plan left by a suspension.
//!
//! The resume plan is the subgraph of operations whose recorded outcome is
//! absent or not in {COMPLETED, SKIPPED}: pending operations plus any that
//! were canceled only because the scheduler entered suspension. Dependencies
//! and targets are preserved verbatim; the scheduler treats edges into the
//! already-completed remainder as satisfied.

use std::collections::HashSet;

use crate::plan::result::{OpResult, OpStatus};
use crate::plan::Plan;

/// Build the residual plan to run after a resume request.
pub fn plan_resume(plan: &Plan, results: &[OpResult]) -> Plan {
    let done: HashSet<u64> = results
        .iter()
        .filter(|r| matches!(r.status, OpStatus::Completed | OpStatus::Skipped))
        .map(|r| r.operation_id)
        .collect();

    Plan::new(
        plan.procedures
            .iter()
            .filter(|op| !done.contains(&op.id))
            .cloned()
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::{OpKind, Operation};

    fn op(id: u64, deps: &[u64]) -> Operation {
        Operation {
            id,
            kind: OpKind::Boot,
            dependencies: deps.to_vec(),
            device_id: Some(format!("dev{id}")),
            cpu_id: None,
            request_instance_id: None,
        }
    }

    #[test]
    fn residual_excludes_completed_and_skipped() {
        let plan = Plan::new(vec![op(1, &[]), op(2, &[1]), op(3, &[2]), op(4, &[3])]);
        let results = vec![
            OpResult::bare(1, OpStatus::Completed),
            OpResult::bare(2, OpStatus::Skipped),
            OpResult::bare(3, OpStatus::Failed),
        ];

        let resume = plan_resume(&plan, &results);

        let ids: Vec<u64> = resume.procedures.iter().map(|op| op.id).collect();
        assert_eq!(ids, vec![3, 4]);
    }

    #[test]
    fn dependencies_are_preserved_verbatim() {
        let plan = Plan::new(vec![op(1, &[]), op(2, &[1])]);
        let results = vec![OpResult::bare(1, OpStatus::Completed)];

        let resume = plan_resume(&plan, &results);

        assert_eq!(resume.len(), 1);
        // The edge to completed op 1 stays; the scheduler treats it as met.
        assert_eq!(resume.procedures[0].dependencies, vec![1]);
    }

    #[test]
    fn canceled_by_suspension_is_resumed() {
        let plan = Plan::new(vec![op(1, &[]), op(2, &[])]);
        let results = vec![
            OpResult::bare(1, OpStatus::Failed),
            OpResult::bare(2, OpStatus::Canceled),
        ];

        let resume = plan_resume(&plan, &results);

        let ids: Vec<u64> = resume.procedures.iter().map(|op| op.id).collect();
        assert_eq!(ids, vec![1, 2]);
    }

    #[test]
    fn no_results_resumes_everything() {
        let plan = Plan::new(vec![op(1, &[]), op(2, &[1])]);
        let resume = plan_resume(&plan, &[]);
        assert_eq!(resume, plan);
    }
}
