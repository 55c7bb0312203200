//! Property tests for the schedule enumerator.
//!
//! The generated DAGs only allow edges from lower to higher node indices,
//! so they are acyclic by construction. For small graphs the `All`
//! strategy is compared against a brute-force permutation oracle.

use std::collections::{HashMap, HashSet};

use converge_schedule::{
    AllTopoSorts, ArbitraryTopoSort, EnumerationStrategy, SampledTopoSorts, Schedule, Task,
    TaskGraph, TaskId, TaskRef,
};
use itertools::Itertools;
use proptest::prelude::*;

fn nop(label: String) -> TaskRef {
    Task::new(label, |_ctx| async { Ok(()) })
}

/// Edges as index pairs `(i, j)` with `i < j`.
fn dag_strategy(max_nodes: usize) -> impl Strategy<Value = (usize, Vec<(usize, usize)>)> {
    (1..=max_nodes).prop_flat_map(|n| {
        let pairs: Vec<(usize, usize)> = (0..n)
            .flat_map(|i| ((i + 1)..n).map(move |j| (i, j)))
            .collect();
        let count = pairs.len();
        proptest::collection::vec(any::<bool>(), count).prop_map(move |mask| {
            let edges = pairs
                .iter()
                .zip(&mask)
                .filter(|(_, &keep)| keep)
                .map(|(&e, _)| e)
                .collect();
            (n, edges)
        })
    })
}

fn build(n: usize, edges: &[(usize, usize)]) -> (TaskGraph, Vec<TaskId>) {
    let tasks: Vec<TaskRef> = (0..n).map(|i| nop(format!("t{i}"))).collect();
    let ids: Vec<TaskId> = tasks.iter().map(|t| t.id()).collect();
    let mut graph = TaskGraph::new();
    for task in &tasks {
        graph.add_task(task.clone());
    }
    for &(i, j) in edges {
        graph.happens_before(Some(ids[i]), ids[j]);
    }
    (graph, ids)
}

fn collect(strategy: &dyn EnumerationStrategy, graph: &TaskGraph) -> Vec<Schedule> {
    strategy
        .schedules(graph)
        .collect::<anyhow::Result<Vec<_>>>()
        .expect("generated DAGs are acyclic")
}

/// The schedule as node indices of the generated DAG.
fn as_indices(schedule: &Schedule, ids: &[TaskId]) -> Vec<usize> {
    let index: HashMap<TaskId, usize> = ids.iter().enumerate().map(|(i, &id)| (id, i)).collect();
    schedule.tasks().iter().map(|t| index[&t.id()]).collect()
}

fn is_topological(order: &[usize], edges: &[(usize, usize)]) -> bool {
    let pos: HashMap<usize, usize> = order.iter().enumerate().map(|(p, &n)| (n, p)).collect();
    edges.iter().all(|(a, b)| pos[a] < pos[b])
}

proptest! {
    /// Every schedule the `All` strategy yields is a valid topological
    /// sort containing every task exactly once.
    #[test]
    fn all_schedules_are_valid_sorts((n, edges) in dag_strategy(7)) {
        let (graph, ids) = build(n, &edges);
        for schedule in collect(&AllTopoSorts::new().run_all(true), &graph) {
            let order = as_indices(&schedule, &ids);
            prop_assert_eq!(order.len(), n);
            prop_assert_eq!(order.iter().copied().collect::<HashSet<_>>().len(), n);
            prop_assert!(is_topological(&order, &edges));
        }
    }

    /// The output set of the `All` strategy equals the mathematical set of
    /// topological sorts: no duplicates, no omissions.
    #[test]
    fn all_matches_the_permutation_oracle((n, edges) in dag_strategy(6)) {
        let (graph, ids) = build(n, &edges);
        let got: HashSet<Vec<usize>> = collect(&AllTopoSorts::new().run_all(true), &graph)
            .iter()
            .map(|s| as_indices(s, &ids))
            .collect();

        let expected: HashSet<Vec<usize>> = (0..n)
            .permutations(n)
            .filter(|p| is_topological(p, &edges))
            .collect();

        prop_assert_eq!(
            collect(&AllTopoSorts::new().run_all(true), &graph).len(),
            got.len(),
            "enumeration yielded duplicates"
        );
        prop_assert_eq!(got, expected);
    }

    /// The arbitrary strategy yields exactly one schedule, and it is a
    /// valid topological sort.
    #[test]
    fn arbitrary_yields_one_valid_sort((n, edges) in dag_strategy(10)) {
        let (graph, ids) = build(n, &edges);
        let schedules = collect(&ArbitraryTopoSort, &graph);
        prop_assert_eq!(schedules.len(), 1);
        let order = as_indices(&schedules[0], &ids);
        prop_assert_eq!(order.len(), n);
        prop_assert!(is_topological(&order, &edges));
    }

    /// Reservoir sampling yields min(N, K) schedules, each a member of the
    /// full enumeration.
    #[test]
    fn sampled_size_is_min_of_n_and_k(
        (n, edges) in dag_strategy(5),
        sample_size in 1usize..8,
        seed in any::<u64>(),
    ) {
        let (graph, ids) = build(n, &edges);
        let all: HashSet<Vec<usize>> = collect(&AllTopoSorts::new().run_all(true), &graph)
            .iter()
            .map(|s| as_indices(s, &ids))
            .collect();

        let strategy =
            SampledTopoSorts::new(AllTopoSorts::new().run_all(true), sample_size).seed(seed);
        let sample = collect(&strategy, &graph);
        prop_assert_eq!(sample.len(), sample_size.min(all.len()));
        for schedule in &sample {
            prop_assert!(all.contains(&as_indices(schedule, &ids)));
        }
    }
}

/// Each of K schedules should be selected with probability N/K. With
/// K = 6, N = 2 and 600 independently seeded draws, every schedule's
/// inclusion count is binomial with mean 200 and sigma ~11.5; the window
/// below is over five sigma wide on each side.
#[test]
fn reservoir_selection_is_roughly_uniform() {
    let tasks: Vec<TaskRef> = (0..3).map(|i| nop(format!("t{i}"))).collect();
    let ids: Vec<TaskId> = tasks.iter().map(|t| t.id()).collect();
    let mut graph = TaskGraph::new();
    for task in &tasks {
        graph.add_task(task.clone());
    }

    let mut counts: HashMap<Vec<usize>, usize> = HashMap::new();
    for seed in 0..600u64 {
        let strategy = SampledTopoSorts::new(AllTopoSorts::new().run_all(true), 2).seed(seed);
        for schedule in collect(&strategy, &graph) {
            *counts.entry(as_indices(&schedule, &ids)).or_default() += 1;
        }
    }

    assert_eq!(counts.len(), 6, "every schedule gets selected eventually");
    for (order, count) in counts {
        assert!(
            (140..=260).contains(&count),
            "schedule {order:?} selected {count} times out of 600"
        );
    }
}

/// Enumeration is deterministic for a fixed graph: same schedules in the
/// same order on every pass.
#[test]
fn enumeration_order_is_stable() {
    let (graph, ids) = build(4, &[(0, 2), (1, 3)]);
    let strategy = AllTopoSorts::new().run_all(true);
    let first: Vec<Vec<usize>> = collect(&strategy, &graph)
        .iter()
        .map(|s| as_indices(s, &ids))
        .collect();
    let second: Vec<Vec<usize>> = collect(&strategy, &graph)
        .iter()
        .map(|s| as_indices(s, &ids))
        .collect();
    assert_eq!(first, second);
}
