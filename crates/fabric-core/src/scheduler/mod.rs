//! DAG scheduler: runs a plan's operations with bounded parallelism,
//! honouring dependency edges, cancellation, and suspension.
//!
//! An operation is dispatched only once all of its dependencies are in a
//! terminal state. Up to `max_workers` operations run concurrently. A
//! stop-dispatch flag is consulted before every dispatch: once a failure,
//! cancellation, or suspension is observed, no further operations start;
//! in-flight operations are always allowed to complete naturally.
//!
//! Dependencies referencing operations outside the plan (as in a resume
//! sub-plan, where completed predecessors were removed) are considered
//! satisfied.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::{Semaphore, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::driver::{DriverOutcome, OperationDriver};
use crate::plan::Plan;
use crate::plan::result::{OpResult, OpStatus};

/// How a scheduler run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleOutcome {
    /// Every operation completed (or was skipped).
    Completed,
    /// At least one operation failed; not-yet-started operations were
    /// canceled.
    Failed,
    /// Cancellation was requested; not-yet-started operations were canceled.
    Canceled,
    /// A driver exhausted a retry ladder; not-yet-started operations are
    /// pending and the apply should suspend.
    Suspended,
}

/// Result of one scheduler run.
#[derive(Debug)]
pub struct ScheduleReport {
    pub outcome: ScheduleOutcome,
    /// One result per dispatched or canceled operation, sorted by id.
    pub results: Vec<OpResult>,
    /// Operations never dispatched because the run suspended.
    pub pending: Vec<crate::plan::Operation>,
}

impl ScheduleReport {
    /// The results as a JSON array for persistence.
    pub fn results_json(&self) -> serde_json::Value {
        serde_json::to_value(&self.results).unwrap_or_default()
    }
}

struct Done {
    id: u64,
    outcome: DriverOutcome,
}

/// Run a plan to completion, cancellation, or suspension.
pub async fn run_plan(
    plan: &Plan,
    driver: Arc<dyn OperationDriver>,
    max_workers: usize,
    cancel: CancellationToken,
) -> Result<ScheduleReport> {
    if plan.is_empty() {
        return Ok(ScheduleReport {
            outcome: ScheduleOutcome::Completed,
            results: Vec::new(),
            pending: Vec::new(),
        });
    }

    let ops: HashMap<u64, &crate::plan::Operation> =
        plan.procedures.iter().map(|op| (op.id, op)).collect();

    // Unmet-predecessor counts; dependencies outside the plan are satisfied.
    let mut indegree: HashMap<u64, usize> = HashMap::new();
    let mut successors: HashMap<u64, Vec<u64>> = HashMap::new();
    for op in &plan.procedures {
        let in_plan_deps = op
            .dependencies
            .iter()
            .filter(|dep| ops.contains_key(dep))
            .count();
        indegree.insert(op.id, in_plan_deps);
        for dep in &op.dependencies {
            if ops.contains_key(dep) {
                successors.entry(*dep).or_default().push(op.id);
            }
        }
    }

    let mut ready: VecDeque<u64> = plan
        .procedures
        .iter()
        .filter(|op| indegree[&op.id] == 0)
        .map(|op| op.id)
        .collect();

    let semaphore = Arc::new(Semaphore::new(max_workers));
    let (tx, mut rx) = mpsc::channel::<Done>(plan.len());
    let mut results: BTreeMap<u64, OpResult> = BTreeMap::new();
    let mut in_flight: usize = 0;
    let mut failure_seen = false;
    let mut suspend_seen = false;

    loop {
        let stop = failure_seen || suspend_seen || cancel.is_cancelled();

        if !stop {
            while let Some(id) = ready.pop_front() {
                // The stop flag is sampled before every dispatch; a cancel
                // arriving mid-drain leaves the rest of the ready set unrun.
                if cancel.is_cancelled() {
                    ready.push_front(id);
                    break;
                }

                let permit = semaphore
                    .clone()
                    .acquire_owned()
                    .await
                    .context("scheduler semaphore closed")?;

                let op = (*ops[&id]).clone();
                let driver = Arc::clone(&driver);
                let tx = tx.clone();
                in_flight += 1;

                tokio::spawn(async move {
                    let outcome = driver.execute(&op).await;
                    drop(permit);
                    let _ = tx.send(Done { id: op.id, outcome }).await;
                });
            }
        }

        if in_flight == 0 {
            if stop || ready.is_empty() {
                break;
            }
            // Nothing in flight but operations became ready; loop to
            // dispatch them.
            continue;
        }

        tokio::select! {
            done = rx.recv() => {
                let Some(Done { id, outcome }) = done else { break };
                in_flight -= 1;

                if outcome.suspended {
                    warn!(operation_id = id, "operation suspended the apply");
                    suspend_seen = true;
                }
                if outcome.result.status == OpStatus::Failed {
                    failure_seen = true;
                }
                results.insert(id, outcome.result);

                if let Some(next) = successors.get(&id) {
                    for succ in next {
                        let count = indegree.get_mut(succ).expect("successor tracked");
                        *count -= 1;
                        if *count == 0 {
                            ready.push_back(*succ);
                        }
                    }
                }
            }
            // Once stop-dispatch is set only completions matter; the guard
            // keeps an already-cancelled token from spinning this loop.
            _ = cancel.cancelled(), if !stop => {
                info!("cancellation observed, draining in-flight operations");
                continue;
            }
        }
    }

    let canceled = cancel.is_cancelled();

    // Account for operations that never started.
    let mut pending = Vec::new();
    for op in &plan.procedures {
        if !results.contains_key(&op.id) {
            if suspend_seen && !canceled {
                pending.push(op.clone());
            } else {
                results.insert(op.id, OpResult::bare(op.id, OpStatus::Canceled));
            }
        }
    }

    let outcome = if canceled {
        ScheduleOutcome::Canceled
    } else if suspend_seen {
        ScheduleOutcome::Suspended
    } else if failure_seen {
        ScheduleOutcome::Failed
    } else {
        ScheduleOutcome::Completed
    };

    Ok(ScheduleReport {
        outcome,
        results: results.into_values().collect(),
        pending,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;
    use chrono::Utc;

    use crate::driver::DriverOutcome;
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

    /// Per-operation scripted behaviour for the mock driver.
    #[derive(Clone, Copy)]
    enum Script {
        Complete,
        CompleteAfter(Duration),
        Fail,
        Suspend,
    }

    struct MockDriver {
        scripts: HashMap<u64, Script>,
        executed: Mutex<Vec<u64>>,
    }

    impl MockDriver {
        fn new(scripts: &[(u64, Script)]) -> Arc<Self> {
            Arc::new(Self {
                scripts: scripts.iter().copied().collect(),
                executed: Mutex::new(Vec::new()),
            })
        }

        fn executed(&self) -> Vec<u64> {
            self.executed.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl OperationDriver for MockDriver {
        async fn execute(&self, op: &Operation) -> DriverOutcome {
            self.executed.lock().unwrap().push(op.id);
            let script = self.scripts.get(&op.id).copied().unwrap_or(Script::Complete);

            let mut result = OpResult::bare(op.id, OpStatus::Completed);
            result.started_at = Some(Utc::now());
            let suspended = match script {
                Script::Complete => false,
                Script::CompleteAfter(delay) => {
                    tokio::time::sleep(delay).await;
                    false
                }
                Script::Fail => {
                    result.status = OpStatus::Failed;
                    false
                }
                Script::Suspend => {
                    result.status = OpStatus::Failed;
                    true
                }
            };
            result.ended_at = Some(Utc::now());
            DriverOutcome { result, suspended }
        }
    }

    #[tokio::test]
    async fn empty_plan_completes() {
        let driver = MockDriver::new(&[]);
        let report = run_plan(&Plan::default(), driver, 4, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.outcome, ScheduleOutcome::Completed);
        assert!(report.results.is_empty());
    }

    #[tokio::test]
    async fn all_operations_complete_in_dependency_order() {
        let plan = Plan::new(vec![op(1, &[]), op(2, &[1]), op(3, &[2])]);
        let driver = MockDriver::new(&[]);
        let report = run_plan(&plan, Arc::clone(&driver) as _, 4, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.outcome, ScheduleOutcome::Completed);
        assert_eq!(report.results.len(), 3);
        assert!(report.results.iter().all(|r| r.status == OpStatus::Completed));
        assert_eq!(driver.executed(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn results_are_sorted_by_operation_id() {
        let plan = Plan::new(vec![op(5, &[]), op(2, &[]), op(9, &[2])]);
        let driver = MockDriver::new(&[]);
        let report = run_plan(&plan, driver, 4, CancellationToken::new())
            .await
            .unwrap();

        let ids: Vec<u64> = report.results.iter().map(|r| r.operation_id).collect();
        assert_eq!(ids, vec![2, 5, 9]);
    }

    #[tokio::test]
    async fn independent_operations_run_in_parallel() {
        // Ops 1 and 2 each sleep 100 ms; op 3 depends on both. With real
        // parallelism the whole run finishes well under the serial 200 ms.
        let plan = Plan::new(vec![op(1, &[]), op(2, &[]), op(3, &[1, 2])]);
        let driver = MockDriver::new(&[
            (1, Script::CompleteAfter(Duration::from_millis(100))),
            (2, Script::CompleteAfter(Duration::from_millis(100))),
        ]);

        let started = std::time::Instant::now();
        let report = run_plan(&plan, driver, 4, CancellationToken::new())
            .await
            .unwrap();
        let elapsed = started.elapsed();

        assert_eq!(report.outcome, ScheduleOutcome::Completed);
        assert!(
            elapsed < Duration::from_millis(250),
            "expected parallel execution, took {elapsed:?}"
        );

        let by_id: HashMap<u64, &OpResult> =
            report.results.iter().map(|r| (r.operation_id, r)).collect();
        let dep_end = by_id[&1].ended_at.max(by_id[&2].ended_at);
        assert!(by_id[&3].ended_at > dep_end);
        assert!(by_id[&3].started_at >= dep_end);
    }

    #[tokio::test]
    async fn failure_cancels_not_yet_started_operations() {
        let plan = Plan::new(vec![op(1, &[]), op(2, &[1]), op(3, &[2]), op(4, &[3])]);
        let driver = MockDriver::new(&[(2, Script::Fail)]);
        let report = run_plan(&plan, Arc::clone(&driver) as _, 4, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.outcome, ScheduleOutcome::Failed);
        let by_id: HashMap<u64, OpStatus> = report
            .results
            .iter()
            .map(|r| (r.operation_id, r.status))
            .collect();
        assert_eq!(by_id[&1], OpStatus::Completed);
        assert_eq!(by_id[&2], OpStatus::Failed);
        assert_eq!(by_id[&3], OpStatus::Canceled);
        assert_eq!(by_id[&4], OpStatus::Canceled);
        assert_eq!(driver.executed(), vec![1, 2]);
    }

    #[tokio::test]
    async fn every_operation_appears_exactly_once() {
        let plan = Plan::new(vec![
            op(1, &[]),
            op(2, &[]),
            op(3, &[1]),
            op(4, &[1, 2]),
            op(5, &[3, 4]),
        ]);
        let driver = MockDriver::new(&[(3, Script::Fail)]);
        let report = run_plan(&plan, driver, 2, CancellationToken::new())
            .await
            .unwrap();

        let mut ids: Vec<u64> = report.results.iter().map(|r| r.operation_id).collect();
        ids.dedup();
        assert_eq!(ids.len(), 5, "each operation exactly once: {ids:?}");
    }

    #[tokio::test]
    async fn suspension_leaves_remaining_operations_pending() {
        let plan = Plan::new(vec![op(1, &[]), op(2, &[1]), op(3, &[2])]);
        let driver = MockDriver::new(&[(1, Script::Suspend)]);
        let report = run_plan(&plan, driver, 4, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.outcome, ScheduleOutcome::Suspended);
        assert_eq!(report.results.len(), 1);
        assert_eq!(report.results[0].status, OpStatus::Failed);
        let pending: Vec<u64> = report.pending.iter().map(|op| op.id).collect();
        assert_eq!(pending, vec![2, 3]);
    }

    #[tokio::test]
    async fn cancellation_stops_dispatch_between_operations() {
        let plan = Plan::new(vec![op(1, &[]), op(2, &[1]), op(3, &[2]), op(4, &[3])]);
        let driver = MockDriver::new(&[(1, Script::CompleteAfter(Duration::from_millis(50)))]);
        let cancel = CancellationToken::new();

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });

        let report = run_plan(&plan, Arc::clone(&driver) as _, 4, cancel)
            .await
            .unwrap();

        assert_eq!(report.outcome, ScheduleOutcome::Canceled);
        let by_id: HashMap<u64, OpStatus> = report
            .results
            .iter()
            .map(|r| (r.operation_id, r.status))
            .collect();
        // Op 1 was in flight when the cancel arrived: it completes naturally.
        assert_eq!(by_id[&1], OpStatus::Completed);
        assert_eq!(by_id[&2], OpStatus::Canceled);
        assert_eq!(by_id[&3], OpStatus::Canceled);
        assert_eq!(by_id[&4], OpStatus::Canceled);
        assert_eq!(driver.executed(), vec![1]);
    }

    #[tokio::test]
    async fn dependencies_outside_the_plan_are_satisfied() {
        // A resume sub-plan keeps verbatim dependencies on operations that
        // already completed and are no longer part of the plan.
        let plan = Plan::new(vec![op(7, &[1, 2]), op(8, &[7])]);
        let driver = MockDriver::new(&[]);
        let report = run_plan(&plan, driver, 4, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.outcome, ScheduleOutcome::Completed);
        assert_eq!(report.results.len(), 2);
    }

    #[tokio::test]
    async fn max_workers_bounds_concurrency() {
        // Four independent 50 ms ops with one worker run serially.
        let plan = Plan::new(vec![op(1, &[]), op(2, &[]), op(3, &[]), op(4, &[])]);
        let driver = MockDriver::new(&[
            (1, Script::CompleteAfter(Duration::from_millis(50))),
            (2, Script::CompleteAfter(Duration::from_millis(50))),
            (3, Script::CompleteAfter(Duration::from_millis(50))),
            (4, Script::CompleteAfter(Duration::from_millis(50))),
        ]);

        let started = std::time::Instant::now();
        let report = run_plan(&plan, driver, 1, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.outcome, ScheduleOutcome::Completed);
        assert!(
            started.elapsed() >= Duration::from_millis(200),
            "one worker must serialize execution"
        );
    }
}
