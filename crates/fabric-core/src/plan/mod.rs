//! Plan model with admission validation.
//!
//! Parses a plan JSON document into a [`Plan`] and validates:
//! - Operation ids are unique.
//! - `dependencies` references point to existing operation ids.
//! - The dependency graph is acyclic (topological sort).
//! - Each operation carries exactly the targets its kind requires.

pub mod result;

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Kind of a plan operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpKind {
    Boot,
    Shutdown,
    Connect,
    Disconnect,
    Start,
    Stop,
}

impl OpKind {
    /// The operation kind that undoes this one.
    pub fn inverse(self) -> Self {
        match self {
            Self::Boot => Self::Shutdown,
            Self::Shutdown => Self::Boot,
            Self::Connect => Self::Disconnect,
            Self::Disconnect => Self::Connect,
            Self::Start => Self::Stop,
            Self::Stop => Self::Start,
        }
    }
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Boot => "boot",
            Self::Shutdown => "shutdown",
            Self::Connect => "connect",
            Self::Disconnect => "disconnect",
            Self::Start => "start",
            Self::Stop => "stop",
        };
        f.write_str(s)
    }
}

/// One node of the plan DAG.
///
/// Wire field names follow the external migration-procedure format. Targets
/// not applicable to the kind are absent from JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operation {
    #[serde(rename = "operationID")]
    pub id: u64,
    #[serde(rename = "operation")]
    pub kind: OpKind,
    #[serde(default)]
    pub dependencies: Vec<u64>,
    #[serde(
        rename = "targetDeviceID",
        skip_serializing_if = "Option::is_none",
        default
    )]
    pub device_id: Option<String>,
    #[serde(
        rename = "targetCPUID",
        skip_serializing_if = "Option::is_none",
        default
    )]
    pub cpu_id: Option<String>,
    #[serde(
        rename = "targetRequestInstanceID",
        skip_serializing_if = "Option::is_none",
        default
    )]
    pub request_instance_id: Option<String>,
}

/// An ordered set of operations whose dependency edges form a DAG.
///
/// Empty plans are valid and trivially complete.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    pub procedures: Vec<Operation>,
}

impl Plan {
    pub fn new(procedures: Vec<Operation>) -> Self {
        Self { procedures }
    }

    pub fn is_empty(&self) -> bool {
        self.procedures.is_empty()
    }

    pub fn len(&self) -> usize {
        self.procedures.len()
    }

    /// Parse and validate a plan JSON document.
    pub fn from_json(content: &str) -> Result<Self, PlanError> {
        let plan: Self = serde_json::from_str(content)?;
        plan.validate()?;
        Ok(plan)
    }

    /// Validate the plan structure. See the module docs for the rules.
    pub fn validate(&self) -> Result<(), PlanError> {
        let mut seen = HashSet::new();
        for op in &self.procedures {
            if !seen.insert(op.id) {
                return Err(PlanError::DuplicateOperationId(op.id));
            }
        }

        for op in &self.procedures {
            for dep in &op.dependencies {
                if !seen.contains(dep) {
                    return Err(PlanError::UnknownDependency {
                        op: op.id,
                        dependency: *dep,
                    });
                }
            }
            validate_targets(op)?;
        }

        check_for_cycles(self)?;

        Ok(())
    }
}

/// Errors that can occur during plan parsing and validation.
///
/// All variants surface as validation errors (code `E40001`).
#[derive(Debug, Error)]
pub enum PlanError {
    #[error("JSON parse error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("duplicate operation id: {0}")]
    DuplicateOperationId(u64),

    #[error("operation {op} depends on unknown operation {dependency}")]
    UnknownDependency { op: u64, dependency: u64 },

    #[error("dependency cycle detected involving operations: {0}")]
    CycleDetected(String),

    #[error("operation {op} ({kind}) requires {field}")]
    MissingTarget {
        op: u64,
        kind: OpKind,
        field: &'static str,
    },

    #[error("operation {op} ({kind}) does not accept {field}")]
    UnexpectedTarget {
        op: u64,
        kind: OpKind,
        field: &'static str,
    },
}

impl PlanError {
    /// Stable validation error code.
    pub fn code(&self) -> &'static str {
        "E40001"
    }
}

/// Check that an operation carries exactly the targets its kind requires.
///
/// | kind                | required targets                |
/// |---------------------|---------------------------------|
/// | boot, shutdown      | deviceID                        |
/// | connect, disconnect | cpuID, deviceID                 |
/// | start, stop         | cpuID, requestInstanceID        |
fn validate_targets(op: &Operation) -> Result<(), PlanError> {
    let missing = |field| PlanError::MissingTarget {
        op: op.id,
        kind: op.kind,
        field,
    };
    let unexpected = |field| PlanError::UnexpectedTarget {
        op: op.id,
        kind: op.kind,
        field,
    };

    match op.kind {
        OpKind::Boot | OpKind::Shutdown => {
            if op.device_id.is_none() {
                return Err(missing("targetDeviceID"));
            }
            if op.cpu_id.is_some() {
                return Err(unexpected("targetCPUID"));
            }
            if op.request_instance_id.is_some() {
                return Err(unexpected("targetRequestInstanceID"));
            }
        }
        OpKind::Connect | OpKind::Disconnect => {
            if op.cpu_id.is_none() {
                return Err(missing("targetCPUID"));
            }
            if op.device_id.is_none() {
                return Err(missing("targetDeviceID"));
            }
            if op.request_instance_id.is_some() {
                return Err(unexpected("targetRequestInstanceID"));
            }
        }
        OpKind::Start | OpKind::Stop => {
            if op.cpu_id.is_none() {
                return Err(missing("targetCPUID"));
            }
            if op.request_instance_id.is_none() {
                return Err(missing("targetRequestInstanceID"));
            }
            if op.device_id.is_some() {
                return Err(unexpected("targetDeviceID"));
            }
        }
    }

    Ok(())
}

/// Detect dependency cycles using Kahn's algorithm for topological sort.
///
/// Returns `Ok(())` if the graph is a DAG, or `Err` naming the operations
/// left inside the cycle.
fn check_for_cycles(plan: &Plan) -> Result<(), PlanError> {
    let ids: Vec<u64> = plan.procedures.iter().map(|op| op.id).collect();
    let id_to_idx: HashMap<u64, usize> = ids
        .iter()
        .enumerate()
        .map(|(i, id)| (*id, i))
        .collect();

    let n = ids.len();
    let mut in_degree = vec![0usize; n];
    let mut adj: Vec<Vec<usize>> = vec![vec![]; n];

    for op in &plan.procedures {
        let op_idx = id_to_idx[&op.id];
        for dep in &op.dependencies {
            let dep_idx = id_to_idx[dep];
            // Edge: dep -> op (dep must complete before op).
            adj[dep_idx].push(op_idx);
            in_degree[op_idx] += 1;
        }
    }

    let mut queue: VecDeque<usize> = VecDeque::new();
    for (i, deg) in in_degree.iter().enumerate() {
        if *deg == 0 {
            queue.push_back(i);
        }
    }

    let mut sorted_count = 0usize;
    while let Some(node) = queue.pop_front() {
        sorted_count += 1;
        for &neighbor in &adj[node] {
            in_degree[neighbor] -= 1;
            if in_degree[neighbor] == 0 {
                queue.push_back(neighbor);
            }
        }
    }

    if sorted_count != n {
        let cycle_ops: Vec<String> = in_degree
            .iter()
            .enumerate()
            .filter(|(_, deg)| **deg > 0)
            .map(|(i, _)| ids[i].to_string())
            .collect();
        return Err(PlanError::CycleDetected(cycle_ops.join(", ")));
    }

    Ok(())
}
