//! # Dependency Resolver
//!
//! Given the root of a static task graph, computes the transitive closure of
//! the tasks it requires and a topological execution order over them.
//!
//! Ties among tasks that are simultaneously orderable are broken the same
//! way the scheduler breaks ties among ready tasks: higher priority first,
//! then creation order. Cycles are detected here, before anything is
//! persisted, and fail run creation with a structural error. Fan-out
//! children are never resolved here; they always depend on their generator,
//! so they cannot close a cycle.

use crate::models::{Task, TaskId};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolutionError {
    #[error("root task {0} is not part of the graph")]
    UnknownRoot(TaskId),
    #[error("task {task} depends on unknown task {dependency}")]
    UnknownDependency { task: TaskId, dependency: TaskId },
    #[error("dependency cycle among tasks: {}", format_ids(.tasks))]
    Cycle { tasks: Vec<TaskId> },
    #[error("task id {0} is declared more than once")]
    DuplicateTask(TaskId),
}

fn format_ids(ids: &[TaskId]) -> String {
    ids.iter()
        .map(TaskId::as_str)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Closure of the root in dependency order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionPlan {
    pub root: TaskId,
    /// Every task appears after all of its dependencies
    pub order: Vec<TaskId>,
}

impl ExecutionPlan {
    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn contains(&self, id: &TaskId) -> bool {
        self.order.contains(id)
    }

    pub fn position(&self, id: &TaskId) -> Option<usize> {
        self.order.iter().position(|candidate| candidate == id)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DependencyResolver;

impl DependencyResolver {
    /// Resolve `root` against `tasks`, given in creation order
    pub fn resolve(root: &TaskId, tasks: &[Task]) -> Result<ExecutionPlan, ResolutionError> {
        let mut index: HashMap<&TaskId, usize> = HashMap::with_capacity(tasks.len());
        for (position, task) in tasks.iter().enumerate() {
            if index.insert(&task.id, position).is_some() {
                return Err(ResolutionError::DuplicateTask(task.id.clone()));
            }
        }
        if !index.contains_key(root) {
            return Err(ResolutionError::UnknownRoot(root.clone()));
        }

        let closure = Self::closure(root, tasks, &index)?;

        // Kahn's algorithm restricted to the closure
        let mut remaining: HashMap<usize, usize> = HashMap::with_capacity(closure.len());
        let mut dependents: HashMap<usize, Vec<usize>> = HashMap::new();
        for &position in &closure {
            let task = &tasks[position];
            remaining.insert(position, task.dependencies.len());
            for dependency in &task.dependencies {
                if let Some(&dep_position) = index.get(dependency) {
                    dependents.entry(dep_position).or_default().push(position);
                }
            }
        }

        let mut heap: BinaryHeap<(i32, Reverse<usize>)> = remaining
            .iter()
            .filter(|(_, count)| **count == 0)
            .map(|(&position, _)| (tasks[position].priority, Reverse(position)))
            .collect();

        let mut order = Vec::with_capacity(closure.len());
        while let Some((_, Reverse(position))) = heap.pop() {
            order.push(tasks[position].id.clone());
            for &dependent in dependents.get(&position).map(Vec::as_slice).unwrap_or_default() {
                if let Some(count) = remaining.get_mut(&dependent) {
                    *count -= 1;
                    if *count == 0 {
                        heap.push((tasks[dependent].priority, Reverse(dependent)));
                    }
                }
            }
        }

        if order.len() < closure.len() {
            let mut cyclic: Vec<usize> = remaining
                .into_iter()
                .filter(|(_, count)| *count > 0)
                .map(|(position, _)| position)
                .collect();
            cyclic.sort_unstable();
            return Err(ResolutionError::Cycle {
                tasks: cyclic.into_iter().map(|p| tasks[p].id.clone()).collect(),
            });
        }

        debug!(
            root = %root,
            resolved = order.len(),
            declared = tasks.len(),
            "Resolved execution plan"
        );

        Ok(ExecutionPlan {
            root: root.clone(),
            order,
        })
    }

    fn closure(
        root: &TaskId,
        tasks: &[Task],
        index: &HashMap<&TaskId, usize>,
    ) -> Result<HashSet<usize>, ResolutionError> {
        let mut seen = HashSet::new();
        let mut stack = vec![index[root]];
        while let Some(position) = stack.pop() {
            if !seen.insert(position) {
                continue;
            }
            let task = &tasks[position];
            for dependency in &task.dependencies {
                let dep_position =
                    *index
                        .get(dependency)
                        .ok_or_else(|| ResolutionError::UnknownDependency {
                            task: task.id.clone(),
                            dependency: dependency.clone(),
                        })?;
                stack.push(dep_position);
            }
        }
        Ok(seen)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TaskParameters;

    fn task(name: &str, deps: &[&str]) -> Task {
        Task::new(
            "job",
            TaskParameters::CombineClips {
                destination_key: name.to_string(),
            },
            Some(name),
            deps.iter().map(|d| TaskId::from(format!("job:combine-clips:{d}"))),
        )
    }

    fn id(name: &str) -> TaskId {
        TaskId::from(format!("job:combine-clips:{name}"))
    }

    #[test]
    fn test_linear_chain() {
        let tasks = vec![task("c", &["b"]), task("b", &["a"]), task("a", &[])];
        let plan = DependencyResolver::resolve(&id("c"), &tasks).unwrap();
        assert_eq!(plan.order, vec![id("a"), id("b"), id("c")]);
    }

    #[test]
    fn test_priority_then_creation_order() {
        let tasks = vec![
            task("root", &["low", "high", "low2"]),
            task("low", &[]),
            task("high", &[]).with_priority(10),
            task("low2", &[]),
        ];
        let plan = DependencyResolver::resolve(&id("root"), &tasks).unwrap();
        assert_eq!(plan.order, vec![id("high"), id("low"), id("low2"), id("root")]);
    }

    #[test]
    fn test_closure_excludes_unreachable_tasks() {
        let tasks = vec![task("root", &["a"]), task("a", &[]), task("orphan", &[])];
        let plan = DependencyResolver::resolve(&id("root"), &tasks).unwrap();
        assert_eq!(plan.len(), 2);
        assert!(!plan.contains(&id("orphan")));
    }

    #[test]
    fn test_cycle_is_reported() {
        let tasks = vec![task("root", &["a"]), task("a", &["b"]), task("b", &["a"])];
        let err = DependencyResolver::resolve(&id("root"), &tasks).unwrap_err();
        match err {
            ResolutionError::Cycle { tasks } => {
                assert!(tasks.contains(&id("a")));
                assert!(tasks.contains(&id("b")));
            }
            other => panic!("expected cycle, got {other:?}"),
        }
    }

    #[test]
    fn test_unknown_dependency_and_root() {
        let tasks = vec![task("root", &["ghost"])];
        assert!(matches!(
            DependencyResolver::resolve(&id("root"), &tasks),
            Err(ResolutionError::UnknownDependency { .. })
        ));
        assert!(matches!(
            DependencyResolver::resolve(&id("missing"), &tasks),
            Err(ResolutionError::UnknownRoot(_))
        ));
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let tasks = vec![task("a", &[]), task("a", &[])];
        assert!(matches!(
            DependencyResolver::resolve(&id("a"), &tasks),
            Err(ResolutionError::DuplicateTask(_))
        ));
    }
}
