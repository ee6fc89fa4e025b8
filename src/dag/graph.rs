use std::collections::{BTreeMap, BTreeSet, HashMap};

use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use petgraph::Direction;
use serde::{Deserialize, Serialize};

use super::extract::DependencySet;
use crate::error::{FlowError, Result};

/// Task-level dependency graph
///
/// Edges point from producer to consumer. Node weights are task ids.
pub struct DependencyGraph {
    graph: DiGraph<String, ()>,
    indices: HashMap<String, NodeIndex>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self {
            graph: DiGraph::new(),
            indices: HashMap::new(),
        }
    }

    /// Resolve every produced-output edge of an extraction into task → task edges
    pub fn from_dependencies(set: &DependencySet) -> Result<Self> {
        let mut dag = Self::new();

        for task in set.tasks() {
            dag.add_task(&task.id)?;
        }

        for task in set.tasks() {
            for producer in set.predecessors(&task.id) {
                dag.add_dependency(&task.id, &producer)?;
            }
        }

        Ok(dag)
    }

    pub fn add_task(&mut self, task_id: &str) -> Result<()> {
        if self.indices.contains_key(task_id) {
            return Err(FlowError::DuplicateTask(task_id.to_string()));
        }

        let idx = self.graph.add_node(task_id.to_string());
        self.indices.insert(task_id.to_string(), idx);
        Ok(())
    }

    /// Add dependency: `task_id` depends on `depends_on_id`
    pub fn add_dependency(&mut self, task_id: &str, depends_on_id: &str) -> Result<()> {
        let from_idx = *self
            .indices
            .get(depends_on_id)
            .ok_or_else(|| FlowError::UnknownTask(depends_on_id.to_string()))?;
        let to_idx = *self
            .indices
            .get(task_id)
            .ok_or_else(|| FlowError::UnknownTask(task_id.to_string()))?;

        if self.graph.find_edge(from_idx, to_idx).is_none() {
            self.graph.add_edge(from_idx, to_idx, ());
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    /// Tasks `task_id` depends on
    pub fn predecessors(&self, task_id: &str) -> BTreeSet<String> {
        let Some(&idx) = self.indices.get(task_id) else {
            return BTreeSet::new();
        };

        self.graph
            .neighbors_directed(idx, Direction::Incoming)
            .filter_map(|n| self.graph.node_weight(n).cloned())
            .collect()
    }

    /// `task id → predecessor ids` for every task
    pub fn dependency_map(&self) -> BTreeMap<String, BTreeSet<String>> {
        self.indices
            .keys()
            .map(|id| (id.clone(), self.predecessors(id)))
            .collect()
    }

    /// Kahn-style topological sort into waves of mutually independent tasks
    ///
    /// Each wave holds the tasks whose predecessors all sit in earlier waves,
    /// sorted by id. Fails with `CyclicDependency` listing the tasks that
    /// could not be placed.
    pub fn waves(&self) -> Result<Vec<Vec<String>>> {
        let mut remaining: BTreeMap<String, BTreeSet<String>> = self.dependency_map();
        let mut waves = vec![];

        while !remaining.is_empty() {
            let ready: Vec<String> = remaining
                .iter()
                .filter(|(_, preds)| preds.is_empty())
                .map(|(id, _)| id.clone())
                .collect();

            if ready.is_empty() {
                return Err(FlowError::CyclicDependency {
                    tasks: remaining.into_keys().collect(),
                });
            }

            for id in &ready {
                remaining.remove(id);
            }
            for preds in remaining.values_mut() {
                for id in &ready {
                    preds.remove(id);
                }
            }

            waves.push(ready);
        }

        Ok(waves)
    }

    pub fn to_state(&self) -> GraphState {
        let mut tasks: Vec<String> = self.indices.keys().cloned().collect();
        tasks.sort();

        let mut edges: Vec<Edge> = self
            .graph
            .edge_references()
            .filter_map(|edge_ref| {
                let from = self.graph.node_weight(edge_ref.source())?;
                let to = self.graph.node_weight(edge_ref.target())?;
                Some(Edge {
                    from: from.clone(),
                    to: to.clone(),
                })
            })
            .collect();
        edges.sort_by(|a, b| (&a.from, &a.to).cmp(&(&b.from, &b.to)));

        GraphState { tasks, edges }
    }
}

impl Default for DependencyGraph {
    fn default() -> Self {
        Self::new()
    }
}

/// Producer → consumer relationship for serialization
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Edge {
    pub from: String,
    pub to: String,
}

/// Serializable graph state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphState {
    pub tasks: Vec<String>,
    pub edges: Vec<Edge>,
}
