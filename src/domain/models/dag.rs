//! Decomposition DAG validation.
//!
//! The LLM decomposer returns a list of planned tasks whose `depends_on`
//! fields are indices into that same list. Before submission the plan is
//! validated (range, self-reference, cycles via Kahn's algorithm) and
//! topologically ordered so tasks are submitted parents-first.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// One task as returned by the decomposer, before ids are assigned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlannedTask {
    pub description: String,
    /// Indices into the plan this task depends on.
    #[serde(default)]
    pub depends_on: Vec<usize>,
    /// File paths the decomposer referenced for this task.
    #[serde(default)]
    pub file_paths: Vec<String>,
    #[serde(default)]
    pub success_criteria: Vec<String>,
}

/// Validation failures for a decomposition plan.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DagError {
    #[error("Task {task} depends on index {index}, but the plan has {len} tasks")]
    IndexOutOfRange { task: usize, index: usize, len: usize },
    #[error("Task {0} depends on itself")]
    SelfDependency(usize),
    #[error("Cycle detected in task dependencies")]
    CycleDetected,
    #[error("Decomposition plan is empty")]
    Empty,
}

/// Normalize 1-based dependency indices to 0-based in place.
///
/// Decomposers are inconsistent about numbering. When every referenced
/// index is >= 1 and at least one equals the plan length (impossible for a
/// 0-based plan), the whole plan is treated as 1-based and shifted down.
pub fn normalize_indices(plan: &mut [PlannedTask]) {
    let len = plan.len();
    let all_deps: Vec<usize> = plan.iter().flat_map(|t| t.depends_on.iter().copied()).collect();
    if all_deps.is_empty() {
        return;
    }
    let one_based = all_deps.iter().all(|&d| d >= 1) && all_deps.iter().any(|&d| d == len);
    if one_based {
        for task in plan.iter_mut() {
            for dep in &mut task.depends_on {
                *dep -= 1;
            }
        }
    }
}

/// Validate a plan: every index in range, no self-dependency, no cycle.
///
/// Holds the property that `validate` succeeds exactly when
/// [`topological_order`] does.
pub fn validate(plan: &[PlannedTask]) -> Result<(), DagError> {
    topological_order(plan).map(|_| ())
}

/// Kahn's algorithm over plan indices.
///
/// Returns the plan indices in an order where every task appears after all
/// of its dependencies. Ties are broken by original index so the order is
/// deterministic.
pub fn topological_order(plan: &[PlannedTask]) -> Result<Vec<usize>, DagError> {
    if plan.is_empty() {
        return Err(DagError::Empty);
    }
    let len = plan.len();

    for (i, task) in plan.iter().enumerate() {
        for &dep in &task.depends_on {
            if dep >= len {
                return Err(DagError::IndexOutOfRange { task: i, index: dep, len });
            }
            if dep == i {
                return Err(DagError::SelfDependency(i));
            }
        }
    }

    let mut in_degree = vec![0usize; len];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); len];
    for (i, task) in plan.iter().enumerate() {
        for &dep in &task.depends_on {
            in_degree[i] += 1;
            dependents[dep].push(i);
        }
    }

    let mut queue: VecDeque<usize> =
        (0..len).filter(|&i| in_degree[i] == 0).collect();
    let mut order = Vec::with_capacity(len);

    while let Some(i) = queue.pop_front() {
        order.push(i);
        for &dependent in &dependents[i] {
            in_degree[dependent] -= 1;
            if in_degree[dependent] == 0 {
                queue.push_back(dependent);
            }
        }
    }

    if order.len() != len {
        return Err(DagError::CycleDetected);
    }

    Ok(order)
}
