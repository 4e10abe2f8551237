use std::collections::HashSet;

use mc_core::types::Task;
use tracing::warn;

use crate::graph::DependencyGraph;
use crate::GraphError;

/// Repair iterations allowed while breaking cycles before the graph is
/// declared unfixable.
const MAX_CYCLE_REPAIRS: usize = 10;

// ---------------------------------------------------------------------------
// ValidationOutcome
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ValidationOutcome {
    pub tasks: Vec<Task>,
    /// Human-readable description of each repair, in application order.
    pub warnings: Vec<String>,
}

impl ValidationOutcome {
    pub fn was_repaired(&self) -> bool {
        !self.warnings.is_empty()
    }
}

// ---------------------------------------------------------------------------
// validate — auto-fix pipeline
// ---------------------------------------------------------------------------

/// Repair a task graph: drop orphan dependency references, break cycles,
/// and backfill final-task dependencies. Runs before any task creation hits
/// the board and before scheduling decisions.
///
/// Applying the validator to an already-valid graph is a no-op (no warnings,
/// tasks unchanged).
pub fn validate(mut tasks: Vec<Task>) -> Result<ValidationOutcome, GraphError> {
    let mut warnings = Vec::new();

    remove_orphans(&mut tasks, &mut warnings);
    break_cycles(&mut tasks, &mut warnings)?;
    backfill_final_tasks(&mut tasks, &mut warnings);

    Ok(ValidationOutcome { tasks, warnings })
}

/// Strict variant: any condition the normal pipeline would repair is an
/// error instead. Exposed for tests that assert graph hygiene.
pub fn validate_strict(tasks: &[Task]) -> Result<(), GraphError> {
    let graph = DependencyGraph::from_tasks(tasks);
    if let Some((task_id, dep)) = graph.orphan_references().into_iter().next() {
        return Err(GraphError::Strict(format!(
            "task {} references missing dependency {}",
            task_id, dep
        )));
    }
    if let Some(cycle) = graph.find_cycle() {
        return Err(GraphError::Strict(format!(
            "dependency cycle: {}",
            cycle.join(" -> ")
        )));
    }
    let non_final_exists = tasks.iter().any(|t| !t.is_final());
    for task in tasks {
        if task.is_final() && task.dependencies.is_empty() && non_final_exists {
            return Err(GraphError::Strict(format!(
                "final task '{}' has no dependencies",
                task.name
            )));
        }
    }
    Ok(())
}

// -- Repair 1: orphan removal ------------------------------------------------

fn remove_orphans(tasks: &mut [Task], warnings: &mut Vec<String>) {
    let known: HashSet<String> = tasks.iter().map(|t| t.id.clone()).collect();
    for task in tasks.iter_mut() {
        let before = task.dependencies.len();
        task.dependencies.retain(|d| known.contains(d));
        let dropped = before - task.dependencies.len();
        if dropped > 0 {
            warnings.push(format!(
                "Removed {} orphaned dependency reference(s) from '{}'",
                dropped, task.name
            ));
        }
    }
}

// -- Repair 2: cycle breaking ------------------------------------------------

fn break_cycles(tasks: &mut [Task], warnings: &mut Vec<String>) -> Result<(), GraphError> {
    for _ in 0..MAX_CYCLE_REPAIRS {
        let graph = DependencyGraph::from_tasks(tasks);
        let Some(cycle) = graph.find_cycle() else {
            return Ok(());
        };

        // The closing edge is second-to-last -> last in the path.
        let from_id = cycle[cycle.len() - 2].clone();
        let to_id = cycle[cycle.len() - 1].clone();
        let from_name = name_of(tasks, &from_id);
        let to_name = name_of(tasks, &to_id);

        if let Some(task) = tasks.iter_mut().find(|t| t.id == from_id) {
            task.dependencies.retain(|d| *d != to_id);
        }
        warn!(from = %from_name, to = %to_name, "breaking dependency cycle");
        warnings.push(format!(
            "Broke circular dependency: removed link from {} to {}",
            from_name, to_name
        ));
    }

    let graph = DependencyGraph::from_tasks(tasks);
    if graph.find_cycle().is_some() {
        return Err(GraphError::UnfixableGraph {
            repairs: MAX_CYCLE_REPAIRS,
        });
    }
    Ok(())
}

fn name_of(tasks: &[Task], id: &str) -> String {
    tasks
        .iter()
        .find(|t| t.id == id)
        .map(|t| t.name.clone())
        .unwrap_or_else(|| id.to_string())
}

// -- Repair 3: final-task backfill -------------------------------------------

fn backfill_final_tasks(tasks: &mut Vec<Task>, warnings: &mut Vec<String>) {
    let non_final: Vec<String> = tasks
        .iter()
        .filter(|t| !t.is_final())
        .map(|t| t.id.clone())
        .collect();
    if non_final.is_empty() {
        return;
    }

    for task in tasks.iter_mut() {
        if task.is_final() && task.dependencies.is_empty() {
            for dep in &non_final {
                task.add_dependency(dep.clone());
            }
            warnings.push(format!(
                "Added {} implementation task dependencies to '{}'",
                non_final.len(),
                task.name
            ));
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use mc_core::types::FINAL_TASK_NAME;

    fn task(id: &str, name: &str, deps: &[&str]) -> Task {
        let mut t = Task::new(name, "p1");
        t.id = id.to_string();
        for d in deps {
            t.add_dependency(*d);
        }
        t
    }

    #[test]
    fn empty_input_is_empty_output_without_warnings() {
        let out = validate(Vec::new()).unwrap();
        assert!(out.tasks.is_empty());
        assert!(out.warnings.is_empty());
    }

    #[test]
    fn valid_graph_is_a_no_op() {
        let tasks = vec![
            task("a", "design", &[]),
            task("b", "implement", &["a"]),
            task("c", "test", &["b"]),
        ];
        let out = validate(tasks.clone()).unwrap();
        assert!(out.warnings.is_empty());
        for (orig, fixed) in tasks.iter().zip(out.tasks.iter()) {
            assert_eq!(orig.dependencies, fixed.dependencies);
        }
    }

    #[test]
    fn orphan_dependency_is_dropped() {
        let tasks = vec![task("a", "alpha", &["ghost", "b"]), task("b", "beta", &[])];
        let out = validate(tasks).unwrap();
        assert_eq!(out.tasks[0].dependencies, vec!["b"]);
        assert_eq!(out.warnings.len(), 1);
        assert!(out.warnings[0].contains("orphaned"));
    }

    #[test]
    fn self_referencing_task_loses_its_self_edge() {
        let tasks = vec![task("a", "loop", &["a"])];
        let out = validate(tasks).unwrap();
        assert!(out.tasks[0].dependencies.is_empty());
        assert_eq!(
            out.warnings,
            vec!["Broke circular dependency: removed link from loop to loop"]
        );
    }

    #[test]
    fn three_node_cycle_broken_with_named_warning() {
        // A -> B -> C -> A (each task depends on the next).
        let tasks = vec![
            task("a", "A", &["b"]),
            task("b", "B", &["c"]),
            task("c", "C", &["a"]),
        ];
        let out = validate(tasks).unwrap();
        assert_eq!(
            out.warnings,
            vec!["Broke circular dependency: removed link from C to A"]
        );
        let graph = DependencyGraph::from_tasks(&out.tasks);
        assert!(graph.is_acyclic());
    }

    #[test]
    fn five_task_cycle_becomes_chain_with_one_warning() {
        let tasks = vec![
            task("t1", "T1", &["t2"]),
            task("t2", "T2", &["t3"]),
            task("t3", "T3", &["t4"]),
            task("t4", "T4", &["t5"]),
            task("t5", "T5", &["t1"]),
        ];
        let out = validate(tasks).unwrap();
        assert_eq!(out.warnings.len(), 1);
        let edges: usize = out.tasks.iter().map(|t| t.dependencies.len()).sum();
        assert_eq!(edges, 4);
        assert!(DependencyGraph::from_tasks(&out.tasks).is_acyclic());
    }

    #[test]
    fn final_task_backfill_adds_all_non_final_ids() {
        let mut tasks: Vec<Task> = (0..8)
            .map(|i| task(&format!("t{}", i), &format!("impl {}", i), &[]))
            .collect();
        tasks.push(task("fin", FINAL_TASK_NAME, &[]));

        let out = validate(tasks).unwrap();
        let fin = out.tasks.iter().find(|t| t.name == FINAL_TASK_NAME).unwrap();
        assert_eq!(fin.dependencies.len(), 8);
        assert_eq!(
            out.warnings,
            vec![format!(
                "Added 8 implementation task dependencies to '{}'",
                FINAL_TASK_NAME
            )]
        );
    }

    #[test]
    fn lone_final_task_is_left_alone() {
        let tasks = vec![task("fin", FINAL_TASK_NAME, &[])];
        let out = validate(tasks).unwrap();
        assert!(out.tasks[0].dependencies.is_empty());
        assert!(out.warnings.is_empty());
    }

    #[test]
    fn final_task_with_existing_deps_not_backfilled() {
        let tasks = vec![
            task("a", "impl a", &[]),
            task("b", "impl b", &[]),
            task("fin", FINAL_TASK_NAME, &["a"]),
        ];
        let out = validate(tasks).unwrap();
        let fin = out.tasks.iter().find(|t| t.id == "fin").unwrap();
        assert_eq!(fin.dependencies, vec!["a"]);
        assert!(out.warnings.is_empty());
    }

    #[test]
    fn revalidating_repaired_graph_is_a_no_op() {
        let tasks = vec![
            task("a", "A", &["b"]),
            task("b", "B", &["c"]),
            task("c", "C", &["a"]),
        ];
        let first = validate(tasks).unwrap();
        let second = validate(first.tasks.clone()).unwrap();
        assert!(second.warnings.is_empty());
    }

    #[test]
    fn pathological_graph_exhausts_repair_budget() {
        // A dense web of mutual dependencies: more than 10 distinct cycles.
        let ids: Vec<String> = (0..6).map(|i| format!("n{}", i)).collect();
        let tasks: Vec<Task> = ids
            .iter()
            .map(|id| {
                let deps: Vec<&str> = ids.iter().filter(|d| *d != id).map(|s| s.as_str()).collect();
                task(id, id, &deps)
            })
            .collect();
        let err = validate(tasks).unwrap_err();
        assert!(matches!(err, GraphError::UnfixableGraph { .. }));
    }

    #[test]
    fn strict_mode_rejects_instead_of_repairing() {
        let cyclic = vec![task("a", "A", &["b"]), task("b", "B", &["a"])];
        assert!(validate_strict(&cyclic).is_err());

        let orphaned = vec![task("a", "A", &["ghost"])];
        assert!(validate_strict(&orphaned).is_err());

        let clean = vec![task("a", "A", &[]), task("b", "B", &["a"])];
        assert!(validate_strict(&clean).is_ok());
    }
}
