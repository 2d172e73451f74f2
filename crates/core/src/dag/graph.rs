use crate::error::DagError;
use crate::types::{TaskId, TaskState};
use petgraph::algo::{has_path_connecting, toposort};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use std::collections::{BTreeMap, HashMap};

/// Directed acyclic graph of tasks; an edge means "must complete before"
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    graph: DiGraph<TaskId, ()>,
    indices: HashMap<TaskId, NodeIndex>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_task(&mut self, task_id: TaskId) -> Result<(), DagError> {
        if self.indices.contains_key(&task_id) {
            return Err(DagError::DuplicateTask(task_id));
        }
        let node = self.graph.add_node(task_id.clone());
        self.indices.insert(task_id, node);
        Ok(())
    }

    /// Add `upstream -> downstream`, rejecting edges that would close a cycle
    pub fn add_edge(&mut self, upstream: &TaskId, downstream: &TaskId) -> Result<(), DagError> {
        let up = self.index(upstream)?;
        let down = self.index(downstream)?;

        if up == down || has_path_connecting(&self.graph, down, up, None) {
            return Err(DagError::Cycle {
                upstream: upstream.clone(),
                downstream: downstream.clone(),
            });
        }

        self.graph.update_edge(up, down, ());
        Ok(())
    }

    fn index(&self, task_id: &TaskId) -> Result<NodeIndex, DagError> {
        self.indices
            .get(task_id)
            .copied()
            .ok_or_else(|| DagError::UnknownTask(task_id.clone()))
    }

    /// Direct upstream tasks of `task_id`
    pub fn upstream<'a>(&'a self, task_id: &TaskId) -> impl Iterator<Item = &'a TaskId> + 'a {
        self.indices
            .get(task_id)
            .into_iter()
            .flat_map(move |&node| self.graph.neighbors_directed(node, Direction::Incoming))
            .map(move |n| &self.graph[n])
    }

    /// Tasks in dependency order (upstreams first)
    pub fn topological_order(&self) -> Result<Vec<TaskId>, DagError> {
        toposort(&self.graph, None)
            .map(|nodes| nodes.into_iter().map(|n| self.graph[n].clone()).collect())
            .map_err(|cycle| {
                let task = self.graph[cycle.node_id()].clone();
                DagError::Cycle {
                    upstream: task.clone(),
                    downstream: task,
                }
            })
    }

    /// Lazily yield tasks whose upstreams all succeeded or were skipped and
    /// which have not been picked up yet. Missing states count as `none`.
    pub fn ready_tasks<'a>(
        &'a self,
        states: &'a BTreeMap<TaskId, TaskState>,
    ) -> impl Iterator<Item = &'a TaskId> + 'a {
        let state_of = move |id: &TaskId| states.get(id).copied().unwrap_or(TaskState::None);

        self.graph.node_indices().filter_map(move |node| {
            let task_id = &self.graph[node];
            if !matches!(state_of(task_id), TaskState::None | TaskState::Scheduled) {
                return None;
            }
            let satisfied = self
                .graph
                .neighbors_directed(node, Direction::Incoming)
                .all(|up| state_of(&self.graph[up]).satisfies_downstream());
            satisfied.then_some(task_id)
        })
    }
}
