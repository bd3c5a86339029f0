//! Property tests for the dependency resolver over random DAGs.

mod common;

use common::parameters_for;
use proptest::prelude::*;
use reelforge_core::models::{Task, TaskId, TaskKind};
use reelforge_core::orchestration::{DependencyResolver, ResolutionError};
use std::collections::{HashMap, HashSet};

const JOB: &str = "job-1";

fn task(index: usize, dependencies: impl IntoIterator<Item = usize>) -> Task {
    Task::new(
        JOB,
        parameters_for(TaskKind::CollectAssets, 0),
        Some(&format!("t{index}")),
        dependencies.into_iter().map(id),
    )
}

fn id(index: usize) -> TaskId {
    TaskId::new(JOB, TaskKind::CollectAssets, Some(&format!("t{index}")))
}

/// Adjacency lists where task `i` only depends on tasks `< i`
fn dag_strategy() -> impl Strategy<Value = Vec<Vec<usize>>> {
    (2usize..14).prop_flat_map(|size| {
        (0..size)
            .map(|i| {
                if i == 0 {
                    Just(Vec::new()).boxed()
                } else {
                    prop::collection::btree_set(0..i, 0..=i.min(4))
                        .prop_map(|deps| deps.into_iter().collect::<Vec<_>>())
                        .boxed()
                }
            })
            .collect::<Vec<_>>()
    })
}

fn build(adjacency: &[Vec<usize>]) -> Vec<Task> {
    adjacency
        .iter()
        .enumerate()
        .map(|(i, deps)| task(i, deps.iter().copied()))
        .collect()
}

fn reachable(adjacency: &[Vec<usize>], root: usize) -> HashSet<usize> {
    let mut seen = HashSet::new();
    let mut stack = vec![root];
    while let Some(node) = stack.pop() {
        if seen.insert(node) {
            stack.extend(adjacency[node].iter().copied());
        }
    }
    seen
}

proptest! {
    #[test]
    fn order_respects_every_dependency(adjacency in dag_strategy()) {
        let tasks = build(&adjacency);
        let root = adjacency.len() - 1;
        let plan = DependencyResolver::resolve(&id(root), &tasks).unwrap();

        let position: HashMap<&TaskId, usize> =
            plan.order.iter().enumerate().map(|(i, id)| (id, i)).collect();
        prop_assert_eq!(position.len(), plan.order.len(), "no task appears twice");
        for task in tasks.iter().filter(|t| position.contains_key(&t.id)) {
            for dependency in &task.dependencies {
                let dep_position = position.get(dependency);
                prop_assert!(dep_position.is_some(), "{} missing from plan", dependency);
                prop_assert!(dep_position < position.get(&task.id));
            }
        }
        prop_assert_eq!(plan.order.last(), Some(&id(root)));
    }

    #[test]
    fn plan_is_exactly_the_root_closure(adjacency in dag_strategy()) {
        let tasks = build(&adjacency);
        let root = adjacency.len() - 1;
        let plan = DependencyResolver::resolve(&id(root), &tasks).unwrap();

        let expected: HashSet<TaskId> = reachable(&adjacency, root).into_iter().map(id).collect();
        let actual: HashSet<TaskId> = plan.order.iter().cloned().collect();
        prop_assert_eq!(actual, expected);
    }

    #[test]
    fn back_edge_is_reported_as_a_cycle(adjacency in dag_strategy()) {
        let root = adjacency.len() - 1;
        let mut adjacency = adjacency;
        // Make the root reachable from task 0 and task 0 reachable from the root
        adjacency[root].push(0);
        adjacency[0].push(root);
        let tasks = build(&adjacency);

        let result = DependencyResolver::resolve(&id(root), &tasks);
        let is_cycle = matches!(result, Err(ResolutionError::Cycle { .. }));
        prop_assert!(is_cycle, "expected a cycle, got {:?}", result);
    }
}

#[test]
fn test_ties_break_by_priority_then_creation_order() {
    let tasks = vec![
        task(0, []),
        task(1, []).with_priority(1),
        task(2, []).with_priority(7),
        task(3, []),
        task(4, [0, 1, 2, 3]),
    ];
    let plan = DependencyResolver::resolve(&id(4), &tasks).unwrap();
    assert_eq!(plan.order, vec![id(2), id(1), id(0), id(3), id(4)]);
}

#[test]
fn test_unreachable_tasks_are_left_out() {
    let tasks = vec![task(0, []), task(1, [0]), task(2, [])];
    let plan = DependencyResolver::resolve(&id(1), &tasks).unwrap();
    assert_eq!(plan.len(), 2);
    assert!(!plan.contains(&id(2)));
}

#[test]
fn test_unknown_dependency_and_root() {
    let tasks = vec![task(0, [7])];
    assert_eq!(
        DependencyResolver::resolve(&id(0), &tasks),
        Err(ResolutionError::UnknownDependency {
            task: id(0),
            dependency: id(7),
        })
    );
    assert_eq!(
        DependencyResolver::resolve(&id(3), &tasks),
        Err(ResolutionError::UnknownRoot(id(3)))
    );
}

#[test]
fn test_duplicate_ids_are_rejected() {
    let tasks = vec![task(0, []), task(0, [])];
    assert_eq!(
        DependencyResolver::resolve(&id(0), &tasks),
        Err(ResolutionError::DuplicateTask(id(0)))
    );
}

#[test]
fn test_self_dependency_is_a_cycle() {
    let tasks = vec![task(0, [0])];
    let err = DependencyResolver::resolve(&id(0), &tasks).unwrap_err();
    assert!(err.to_string().contains("job-1:collect-assets:t0"), "{err}");
}
