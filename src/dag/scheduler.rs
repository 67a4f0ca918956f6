//! Ready-set tracking for one batch.
//!
//! The scheduler only knows about statuses and edges; it never runs anything.
//! Failure of a unit skips everything downstream of it, transitively.

use std::collections::HashSet;

use super::builder::{TaskGraph, TaskIndex};

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum NodeStatus {
    #[default]
    Pending,
    Running,
    Succeeded,
    Failed,
    /// Not run because `cause` did not succeed.
    Skipped {
        cause: String,
    },
}

impl NodeStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Skipped { .. })
    }
}

#[derive(Debug)]
pub struct BatchScheduler {
    graph: TaskGraph,
    statuses: Vec<NodeStatus>,
    succeeded: HashSet<TaskIndex>,
}

impl BatchScheduler {
    pub fn new(graph: TaskGraph) -> Self {
        let statuses = vec![NodeStatus::Pending; graph.len()];
        Self {
            graph,
            statuses,
            succeeded: HashSet::new(),
        }
    }

    pub fn graph(&self) -> &TaskGraph {
        &self.graph
    }

    pub fn status(&self, index: TaskIndex) -> Option<&NodeStatus> {
        self.statuses.get(index)
    }

    /// Pending units whose dependencies all succeeded, in declaration order.
    pub fn get_ready(&self) -> Vec<TaskIndex> {
        (0..self.graph.len())
            .filter(|&i| self.statuses[i] == NodeStatus::Pending)
            .filter(|&i| self.graph.dependencies_satisfied(i, &self.succeeded))
            .collect()
    }

    pub fn mark_running(&mut self, index: TaskIndex) {
        if let Some(status) = self.statuses.get_mut(index) {
            *status = NodeStatus::Running;
        }
    }

    pub fn mark_succeeded(&mut self, index: TaskIndex) {
        if let Some(status) = self.statuses.get_mut(index) {
            *status = NodeStatus::Succeeded;
            self.succeeded.insert(index);
        }
    }

    /// Mark `index` failed and return the units skipped as a consequence.
    pub fn mark_failed(&mut self, index: TaskIndex) -> Vec<TaskIndex> {
        if let Some(status) = self.statuses.get_mut(index) {
            *status = NodeStatus::Failed;
        }
        let mut skipped = Vec::new();
        self.skip_dependents(index, &mut skipped);
        skipped
    }

    fn skip_dependents(&mut self, index: TaskIndex, skipped: &mut Vec<TaskIndex>) {
        let cause = match self.graph.get_task(index) {
            Some(task) => task.task_id.clone(),
            None => return,
        };
        let dependents: Vec<TaskIndex> = self.graph.dependents(index).to_vec();
        for dep_idx in dependents {
            if let Some(status) = self.statuses.get_mut(dep_idx)
                && !status.is_terminal()
                && *status != NodeStatus::Running
            {
                *status = NodeStatus::Skipped {
                    cause: cause.clone(),
                };
                skipped.push(dep_idx);
                self.skip_dependents(dep_idx, skipped);
            }
        }
    }

    pub fn all_terminal(&self) -> bool {
        self.statuses.iter().all(NodeStatus::is_terminal)
    }

    pub fn running_count(&self) -> usize {
        self.statuses
            .iter()
            .filter(|s| **s == NodeStatus::Running)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dag::builder::GraphBuilder;
    use crate::state::TaskOrigin;
    use crate::worker::TaskDescriptor;

    fn task(id: &str, deps: &[&str]) -> TaskDescriptor {
        TaskDescriptor {
            task_id: id.to_string(),
            story_id: "S1".to_string(),
            entity_path: format!("story:S1/task:{}", id),
            description: String::new(),
            depends_on: deps.iter().map(|d| d.to_string()).collect(),
            attempt: 1,
            scope: vec![],
            origin: TaskOrigin::Planned,
        }
    }

    fn scheduler(tasks: Vec<TaskDescriptor>) -> BatchScheduler {
        let none = HashSet::new();
        BatchScheduler::new(GraphBuilder::new(tasks, &none).build().unwrap())
    }

    #[test]
    fn test_ready_respects_dependencies_and_order() {
        let mut s = scheduler(vec![task("A", &[]), task("B", &["A"]), task("C", &[])]);
        assert_eq!(s.get_ready(), vec![0, 2]);
        s.mark_running(0);
        s.mark_running(2);
        assert!(s.get_ready().is_empty());
        s.mark_succeeded(0);
        assert_eq!(s.get_ready(), vec![1]);
    }

    #[test]
    fn test_failure_skips_transitively() {
        let mut s = scheduler(vec![
            task("A", &[]),
            task("B", &["A"]),
            task("C", &["B"]),
            task("D", &[]),
        ]);
        s.mark_running(0);
        let skipped = s.mark_failed(0);
        assert_eq!(skipped, vec![1, 2]);
        assert_eq!(
            s.status(2),
            Some(&NodeStatus::Skipped { cause: "B".into() })
        );
        assert_eq!(s.get_ready(), vec![3]);
        s.mark_running(3);
        s.mark_succeeded(3);
        assert!(s.all_terminal());
    }

    #[test]
    fn test_join_waits_for_every_dependency() {
        let mut s = scheduler(vec![task("A", &[]), task("B", &[]), task("C", &["A", "B"])]);
        s.mark_running(0);
        s.mark_running(1);
        s.mark_succeeded(0);
        assert!(s.get_ready().is_empty());
        assert_eq!(s.running_count(), 1);
        s.mark_succeeded(1);
        assert_eq!(s.get_ready(), vec![2]);
    }
}
