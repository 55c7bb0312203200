use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::fmt;
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::error::{CycleError, LimitExceeded};
use crate::graph::TaskGraph;
use crate::task::{TaskId, TaskRef};

/// One concrete total order over the registered tasks, consistent with
/// the happens-before graph.
#[derive(Clone)]
pub struct Schedule {
    tasks: Arc<[TaskRef]>,
}

impl Schedule {
    pub(crate) fn from_tasks(tasks: Vec<TaskRef>) -> Self {
        Self {
            tasks: tasks.into(),
        }
    }

    pub fn tasks(&self) -> &[TaskRef] {
        &self.tasks
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Position of a task within this schedule, for schedule-dependent
    /// expectation predicates.
    pub fn position(&self, id: TaskId) -> Option<usize> {
        self.tasks.iter().position(|t| t.id() == id)
    }
}

impl fmt::Display for Schedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "schedule:")?;
        for (i, task) in self.tasks.iter().enumerate() {
            writeln!(f, "{}: {}", i, task.describe())?;
        }
        Ok(())
    }
}

impl fmt::Debug for Schedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

pub type ScheduleIter = Box<dyn Iterator<Item = anyhow::Result<Schedule>> + Send>;

/// Produces schedules from a happens-before graph.
///
/// `preflight` runs before any schedule executes and is where strategies
/// reject misconfigured workloads (e.g. enumerations larger than their
/// bound). `schedules` is consumed lazily by the executor.
pub trait EnumerationStrategy: Send + Sync {
    fn preflight(&self, _graph: &TaskGraph) -> anyhow::Result<()> {
        Ok(())
    }

    fn schedules(&self, graph: &TaskGraph) -> ScheduleIter;
}

/// Yields a single valid topological sort.
///
/// Tie-breaking among ready tasks is deterministic (smallest task id
/// first), so the same graph always produces the same schedule.
pub struct ArbitraryTopoSort;

impl EnumerationStrategy for ArbitraryTopoSort {
    fn schedules(&self, graph: &TaskGraph) -> ScheduleIter {
        Box::new(std::iter::once(arbitrary_order(graph)))
    }
}

fn arbitrary_order(graph: &TaskGraph) -> anyhow::Result<Schedule> {
    let mut in_degree = graph.in_degrees();
    let mut frontier: BinaryHeap<Reverse<TaskId>> = in_degree
        .iter()
        .filter(|(_, &d)| d == 0)
        .map(|(&id, _)| Reverse(id))
        .collect();

    let mut order = Vec::with_capacity(graph.len());
    while let Some(Reverse(id)) = frontier.pop() {
        let task = graph.get(id).expect("frontier ids are registered").clone();
        order.push(task);
        for succ in graph.successors(id) {
            if let Some(d) = in_degree.get_mut(&succ) {
                *d -= 1;
                if *d == 0 {
                    frontier.push(Reverse(succ));
                }
            }
        }
    }

    if order.len() != graph.len() {
        return Err(CycleError.into());
    }
    Ok(Schedule::from_tasks(order))
}

/// Enumerates every topological sort of the graph.
///
/// Unless `run_all` is set, `preflight` counts the enumeration first and
/// fails with [`LimitExceeded`] when it is larger than `limit`, so a
/// combinatorial blow-up is reported before any schedule runs.
pub struct AllTopoSorts {
    limit: usize,
    run_all: bool,
}

impl AllTopoSorts {
    pub fn new() -> Self {
        Self {
            limit: 100,
            run_all: false,
        }
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    /// Skip the schedule-count guard. Useful together with sampling, where
    /// the full enumeration is intentionally large.
    pub fn run_all(mut self, run_all: bool) -> Self {
        self.run_all = run_all;
        self
    }
}

impl Default for AllTopoSorts {
    fn default() -> Self {
        Self::new()
    }
}

impl EnumerationStrategy for AllTopoSorts {
    fn preflight(&self, graph: &TaskGraph) -> anyhow::Result<()> {
        if self.run_all {
            return Ok(());
        }
        let mut count = 0usize;
        for schedule in AllOrders::new(graph) {
            schedule?;
            count += 1;
            if count > self.limit {
                return Err(LimitExceeded { limit: self.limit }.into());
            }
        }
        Ok(())
    }

    fn schedules(&self, graph: &TaskGraph) -> ScheduleIter {
        Box::new(AllOrders::new(graph))
    }
}

/// Depth-first enumeration of all topological sorts.
///
/// Each stack frame owns its in-degree map, frontier, and partial order;
/// the adjacency itself is shared by all branches and never mutated, so
/// branching costs O(V) per step rather than a full graph copy.
struct AllOrders {
    graph: TaskGraph,
    total: usize,
    stack: Vec<Frame>,
    failed: bool,
}

struct Frame {
    in_degree: HashMap<TaskId, usize>,
    frontier: Vec<TaskId>,
    choice: usize,
    prefix: Vec<TaskRef>,
}

impl AllOrders {
    fn new(graph: &TaskGraph) -> Self {
        let graph = graph.clone();
        let in_degree = graph.in_degrees();
        let mut frontier: Vec<TaskId> = in_degree
            .iter()
            .filter(|(_, &d)| d == 0)
            .map(|(&id, _)| id)
            .collect();
        frontier.sort_unstable();

        let total = graph.len();
        Self {
            graph,
            total,
            stack: vec![Frame {
                in_degree,
                frontier,
                choice: 0,
                prefix: Vec::new(),
            }],
            failed: false,
        }
    }
}

impl Iterator for AllOrders {
    type Item = anyhow::Result<Schedule>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }

        loop {
            let frame = self.stack.last_mut()?;

            if frame.frontier.is_empty() {
                let complete = frame.prefix.len() == self.total;
                let prefix = std::mem::take(&mut frame.prefix);
                self.stack.pop();
                if complete {
                    return Some(Ok(Schedule::from_tasks(prefix)));
                }
                // Candidates ran out while edges remain.
                self.failed = true;
                return Some(Err(CycleError.into()));
            }

            if frame.choice >= frame.frontier.len() {
                self.stack.pop();
                continue;
            }

            let chosen = frame.frontier[frame.choice];
            frame.choice += 1;

            let mut in_degree = frame.in_degree.clone();
            let mut frontier: Vec<TaskId> = frame
                .frontier
                .iter()
                .copied()
                .filter(|&id| id != chosen)
                .collect();
            let mut prefix = frame.prefix.clone();

            prefix.push(
                self.graph
                    .get(chosen)
                    .expect("frontier ids are registered")
                    .clone(),
            );
            for succ in self.graph.successors(chosen) {
                if let Some(d) = in_degree.get_mut(&succ) {
                    *d -= 1;
                    if *d == 0 {
                        frontier.push(succ);
                    }
                }
            }
            frontier.sort_unstable();

            self.stack.push(Frame {
                in_degree,
                frontier,
                choice: 0,
                prefix,
            });
        }
    }
}

/// Reservoir-samples `n` schedules uniformly from an inner strategy.
///
/// The randomness only decides *which* schedules run, never the order of
/// tasks within a chosen schedule. Pass a seed for reproducible runs.
pub struct SampledTopoSorts {
    inner: Box<dyn EnumerationStrategy>,
    n: usize,
    seed: Option<u64>,
}

impl SampledTopoSorts {
    pub fn new(inner: impl EnumerationStrategy + 'static, n: usize) -> Self {
        Self {
            inner: Box::new(inner),
            n,
            seed: None,
        }
    }

    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }
}

impl EnumerationStrategy for SampledTopoSorts {
    fn schedules(&self, graph: &TaskGraph) -> ScheduleIter {
        let mut rng = match self.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        let mut reservoir: Vec<Schedule> = Vec::with_capacity(self.n);
        let mut seen = 0usize;
        for item in self.inner.schedules(graph) {
            let schedule = match item {
                Ok(schedule) => schedule,
                Err(err) => return Box::new(std::iter::once(Err(err))),
            };
            if reservoir.len() < self.n {
                reservoir.push(schedule);
            } else {
                let idx = rng.gen_range(0..=seen);
                if idx < self.n {
                    reservoir[idx] = schedule;
                }
            }
            seen += 1;
        }

        if seen > 0 {
            let pct = (self.n.min(seen) as f64 / seen as f64) * 100.0;
            tracing::info!(
                "running {} of the {} possible schedules (~{:.0}%)",
                reservoir.len(),
                seen,
                pct
            );
        }
        Box::new(reservoir.into_iter().map(Ok))
    }
}
