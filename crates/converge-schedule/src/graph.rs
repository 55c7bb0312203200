use std::collections::HashMap;

use crate::task::{TaskId, TaskRef};

/// The happens-before relation over registered tasks.
///
/// Nodes are tasks (composites count as one node); an edge `a -> b` means
/// `a` must complete before `b` starts in every schedule. Edges only
/// accumulate — acyclicity is checked when schedules are enumerated, not
/// on insertion.
#[derive(Clone, Default)]
pub struct TaskGraph {
    tasks: Vec<TaskRef>,
    index: HashMap<TaskId, usize>,
    edges: HashMap<TaskId, Vec<TaskId>>,
}

impl TaskGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a node. Re-registering an id is ignored.
    pub fn add_task(&mut self, task: TaskRef) {
        let id = task.id();
        if self.index.contains_key(&id) {
            return;
        }
        self.index.insert(id, self.tasks.len());
        self.tasks.push(task);
    }

    /// Record that `a` must complete before `b`.
    ///
    /// A `None` predecessor is accepted and ignored, which keeps seeding
    /// per-peer "last task" pointers simple.
    pub fn happens_before(&mut self, a: Option<TaskId>, b: TaskId) {
        let Some(a) = a else { return };
        self.edges.entry(a).or_default().push(b);
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Registered tasks in insertion order.
    pub fn tasks(&self) -> &[TaskRef] {
        &self.tasks
    }

    pub(crate) fn get(&self, id: TaskId) -> Option<&TaskRef> {
        self.index.get(&id).map(|&i| &self.tasks[i])
    }

    /// Successors of `id`, restricted to registered tasks.
    pub(crate) fn successors(&self, id: TaskId) -> impl Iterator<Item = TaskId> + '_ {
        self.edges
            .get(&id)
            .into_iter()
            .flatten()
            .copied()
            .filter(|succ| self.index.contains_key(succ))
    }

    /// In-degree of every registered task, counting only edges whose both
    /// endpoints are registered. Parallel edges count multiply, matching
    /// the decrements done during enumeration.
    pub(crate) fn in_degrees(&self) -> HashMap<TaskId, usize> {
        let mut degrees: HashMap<TaskId, usize> =
            self.tasks.iter().map(|t| (t.id(), 0)).collect();
        for (a, succs) in &self.edges {
            if !self.index.contains_key(a) {
                continue;
            }
            for b in succs {
                if let Some(d) = degrees.get_mut(b) {
                    *d += 1;
                }
            }
        }
        degrees
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::Task;

    fn nop(label: &str) -> TaskRef {
        Task::new(label.to_string(), |_ctx| async { Ok(()) })
    }

    #[test]
    fn null_predecessor_is_a_no_op() {
        let mut graph = TaskGraph::new();
        let a = nop("a");
        graph.add_task(a.clone());
        graph.happens_before(None, a.id());
        assert_eq!(graph.in_degrees()[&a.id()], 0);
    }

    #[test]
    fn edges_to_unregistered_tasks_are_ignored() {
        let mut graph = TaskGraph::new();
        let a = nop("a");
        let ghost = nop("ghost");
        graph.add_task(a.clone());
        // Edge recorded before (or without) the endpoint being registered.
        graph.happens_before(Some(a.id()), ghost.id());
        assert_eq!(graph.successors(a.id()).count(), 0);

        graph.add_task(ghost.clone());
        assert_eq!(graph.successors(a.id()).collect::<Vec<_>>(), [ghost.id()]);
        assert_eq!(graph.in_degrees()[&ghost.id()], 1);
    }

    #[test]
    fn duplicate_registration_is_ignored() {
        let mut graph = TaskGraph::new();
        let a = nop("a");
        graph.add_task(a.clone());
        graph.add_task(a);
        assert_eq!(graph.len(), 1);
    }
}
