//! Dependency graph for one dispatch batch.
//!
//! Edges only connect tasks inside the batch. A dependency on a task outside
//! the batch is accepted when that task is already done and rejected
//! otherwise.

use std::collections::{HashMap, HashSet};

use crate::errors::DispatchError;
use crate::worker::TaskDescriptor;

/// Index into the batch, in declaration order.
pub type TaskIndex = usize;

#[derive(Debug)]
pub struct TaskGraph {
    tasks: Vec<TaskDescriptor>,
    index_map: HashMap<String, TaskIndex>,
    /// index -> tasks that depend on it
    forward_edges: Vec<Vec<TaskIndex>>,
    /// index -> tasks it depends on
    reverse_edges: Vec<Vec<TaskIndex>>,
}

impl TaskGraph {
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn get_task(&self, index: TaskIndex) -> Option<&TaskDescriptor> {
        self.tasks.get(index)
    }

    pub fn get_index(&self, task_id: &str) -> Option<TaskIndex> {
        self.index_map.get(task_id).copied()
    }

    pub fn tasks(&self) -> &[TaskDescriptor] {
        &self.tasks
    }

    pub fn dependents(&self, index: TaskIndex) -> &[TaskIndex] {
        self.forward_edges.get(index).map_or(&[], |v| v.as_slice())
    }

    pub fn dependencies(&self, index: TaskIndex) -> &[TaskIndex] {
        self.reverse_edges.get(index).map_or(&[], |v| v.as_slice())
    }

    pub fn dependencies_satisfied(&self, index: TaskIndex, succeeded: &HashSet<TaskIndex>) -> bool {
        self.dependencies(index)
            .iter()
            .all(|dep| succeeded.contains(dep))
    }
}

pub struct GraphBuilder<'a> {
    tasks: Vec<TaskDescriptor>,
    done_outside: &'a HashSet<String>,
}

impl<'a> GraphBuilder<'a> {
    /// `done_outside` holds ids of already-completed tasks that batch members
    /// may depend on.
    pub fn new(tasks: Vec<TaskDescriptor>, done_outside: &'a HashSet<String>) -> Self {
        Self {
            tasks,
            done_outside,
        }
    }

    pub fn build(self) -> Result<TaskGraph, DispatchError> {
        let mut index_map = HashMap::new();
        for (i, task) in self.tasks.iter().enumerate() {
            if index_map.insert(task.task_id.clone(), i).is_some() {
                return Err(DispatchError::DuplicateTask {
                    task: task.task_id.clone(),
                });
            }
        }

        let mut forward_edges: Vec<Vec<TaskIndex>> = vec![Vec::new(); self.tasks.len()];
        let mut reverse_edges: Vec<Vec<TaskIndex>> = vec![Vec::new(); self.tasks.len()];
        for (to_idx, task) in self.tasks.iter().enumerate() {
            for dep in &task.depends_on {
                match index_map.get(dep) {
                    Some(&from_idx) => {
                        forward_edges[from_idx].push(to_idx);
                        reverse_edges[to_idx].push(from_idx);
                    }
                    None if self.done_outside.contains(dep) => {}
                    None => {
                        return Err(DispatchError::UnsatisfiedDependency {
                            task: task.task_id.clone(),
                            dependency: dep.clone(),
                        });
                    }
                }
            }
        }

        let graph = TaskGraph {
            tasks: self.tasks,
            index_map,
            forward_edges,
            reverse_edges,
        };
        Self::validate_no_cycles(&graph)?;
        Ok(graph)
    }

    /// Kahn's algorithm; on failure the error names one concrete cycle.
    fn validate_no_cycles(graph: &TaskGraph) -> Result<(), DispatchError> {
        let mut in_degree: Vec<usize> = graph.reverse_edges.iter().map(Vec::len).collect();
        let mut queue: Vec<TaskIndex> = in_degree
            .iter()
            .enumerate()
            .filter(|&(_, deg)| *deg == 0)
            .map(|(i, _)| i)
            .collect();
        let mut processed = 0;
        while let Some(node) = queue.pop() {
            processed += 1;
            for &dependent in graph.dependents(node) {
                in_degree[dependent] -= 1;
                if in_degree[dependent] == 0 {
                    queue.push(dependent);
                }
            }
        }
        if processed == graph.len() {
            return Ok(());
        }

        // Walk dependency edges among the remaining nodes until one repeats.
        let remaining: HashSet<TaskIndex> = (0..graph.len()).filter(|&i| in_degree[i] > 0).collect();
        let mut path: Vec<TaskIndex> = Vec::new();
        let mut current = remaining.iter().copied().min().unwrap_or(0);
        loop {
            if let Some(pos) = path.iter().position(|&i| i == current) {
                let mut tasks: Vec<String> = path[pos..]
                    .iter()
                    .map(|&i| graph.tasks[i].task_id.clone())
                    .collect();
                tasks.push(graph.tasks[current].task_id.clone());
                return Err(DispatchError::Cycle { tasks });
            }
            path.push(current);
            match graph
                .dependencies(current)
                .iter()
                .copied()
                .find(|d| remaining.contains(d))
            {
                Some(next) => current = next,
                None => {
                    return Err(DispatchError::Cycle {
                        tasks: path.iter().map(|&i| graph.tasks[i].task_id.clone()).collect(),
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::TaskOrigin;

    fn task(id: &str, deps: &[&str]) -> TaskDescriptor {
        TaskDescriptor {
            task_id: id.to_string(),
            story_id: "S1".to_string(),
            entity_path: format!("feature:F1/epic:E1/story:S1/task:{}", id),
            description: format!("do {}", id),
            depends_on: deps.iter().map(|d| d.to_string()).collect(),
            attempt: 1,
            scope: vec![],
            origin: TaskOrigin::Planned,
        }
    }

    #[test]
    fn test_build_diamond() {
        let none = HashSet::new();
        let graph = GraphBuilder::new(
            vec![
                task("T1", &[]),
                task("T2", &["T1"]),
                task("T3", &["T1"]),
                task("T4", &["T2", "T3"]),
            ],
            &none,
        )
        .build()
        .unwrap();
        assert_eq!(graph.len(), 4);
        assert_eq!(graph.dependencies(3), &[1, 2]);
        assert_eq!(graph.dependents(0), &[1, 2]);
    }

    #[test]
    fn test_dependency_outside_batch() {
        let mut done = HashSet::new();
        let batch = vec![task("T2", &["T1"])];
        let err = GraphBuilder::new(batch.clone(), &done).build().unwrap_err();
        assert!(matches!(err, DispatchError::UnsatisfiedDependency { .. }));

        done.insert("T1".to_string());
        let graph = GraphBuilder::new(batch, &done).build().unwrap();
        assert!(graph.dependencies(0).is_empty());
    }

    #[test]
    fn test_cycle_names_members() {
        let none = HashSet::new();
        let err = GraphBuilder::new(
            vec![
                task("T0", &[]),
                task("T1", &["T3"]),
                task("T2", &["T1"]),
                task("T3", &["T2"]),
            ],
            &none,
        )
        .build()
        .unwrap_err();
        let DispatchError::Cycle { tasks } = err else {
            panic!("expected a cycle error");
        };
        assert_eq!(tasks.first(), tasks.last());
        assert!(!tasks.contains(&"T0".to_string()));
        assert_eq!(tasks.len(), 4);
    }

    #[test]
    fn test_duplicate_task_rejected() {
        let none = HashSet::new();
        let err = GraphBuilder::new(vec![task("T1", &[]), task("T1", &[])], &none)
            .build()
            .unwrap_err();
        assert_eq!(err, DispatchError::DuplicateTask { task: "T1".into() });
    }

    #[test]
    fn test_dependencies_satisfied() {
        let none = HashSet::new();
        let graph = GraphBuilder::new(vec![task("T1", &[]), task("T2", &["T1"])], &none)
            .build()
            .unwrap();
        let mut ok = HashSet::new();
        assert!(graph.dependencies_satisfied(0, &ok));
        assert!(!graph.dependencies_satisfied(1, &ok));
        ok.insert(0);
        assert!(graph.dependencies_satisfied(1, &ok));
    }
}
