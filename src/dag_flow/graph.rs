//! Dependency graph over the steps of one run and the ready-set iterator
//! that walks it.
//!
//! Edges point from a dependency to its dependent. Readiness is tracked as a
//! per-node count of unmet prerequisites: an incoming edge counts until its
//! source completes, and a dependency naming a step absent from the run counts
//! forever. Self-loops are kept as ordinary edges, so a step that depends on
//! itself never becomes ready either.

use petgraph::algo::{is_cyclic_directed, toposort};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::debug;

use crate::core::errors::{CoordError, FieldError, Result};
use crate::dag_flow::step::StepDefinition;

pub struct StepGraph {
    graph: DiGraph<String, ()>,
    indices: HashMap<String, NodeIndex>,
    /// Definition order, used to order every ready set
    order: Vec<NodeIndex>,
    /// step id -> dependencies that name no step in this run
    missing: BTreeMap<String, Vec<String>>,
}

impl StepGraph {
    pub fn build(steps: &[StepDefinition]) -> Result<Self> {
        let mut graph = DiGraph::new();
        let mut indices = HashMap::with_capacity(steps.len());
        let mut order = Vec::with_capacity(steps.len());
        let mut duplicates = Vec::new();

        for step in steps {
            if indices.contains_key(&step.step_id) {
                duplicates.push(FieldError::new(
                    format!("/steps/{}", step.step_id),
                    "duplicate step id",
                ));
                continue;
            }
            let idx = graph.add_node(step.step_id.clone());
            indices.insert(step.step_id.clone(), idx);
            order.push(idx);
        }

        if !duplicates.is_empty() {
            return Err(CoordError::validation_stage(
                "Step ids must be unique within a run",
                "graph",
                duplicates,
            ));
        }

        let mut missing: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for step in steps {
            let to = indices[&step.step_id];
            for dep in &step.dependencies {
                match indices.get(dep) {
                    Some(&from) => {
                        graph.add_edge(from, to, ());
                    }
                    None => missing
                        .entry(step.step_id.clone())
                        .or_default()
                        .push(dep.clone()),
                }
            }
        }

        Ok(Self {
            graph,
            indices,
            order,
            missing,
        })
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn contains(&self, step_id: &str) -> bool {
        self.indices.contains_key(step_id)
    }

    pub fn is_cyclic(&self) -> bool {
        is_cyclic_directed(&self.graph)
    }

    pub fn missing_dependencies(&self) -> &BTreeMap<String, Vec<String>> {
        &self.missing
    }

    /// One valid execution order, or `None` when the graph has a cycle
    pub fn topological_order(&self) -> Option<Vec<String>> {
        toposort(&self.graph, None)
            .ok()
            .map(|nodes| nodes.into_iter().map(|n| self.graph[n].clone()).collect())
    }

    /// Direct dependents of `step_id`
    pub fn dependents(&self, step_id: &str) -> Vec<String> {
        let Some(&idx) = self.indices.get(step_id) else {
            return Vec::new();
        };
        let mut out: Vec<String> = self
            .graph
            .neighbors_directed(idx, Direction::Outgoing)
            .map(|n| self.graph[n].clone())
            .collect();
        out.sort();
        out.dedup();
        out
    }

    pub fn scheduler(&self) -> ReadySet<'_> {
        let mut unmet = HashMap::with_capacity(self.order.len());
        for &idx in &self.order {
            let incoming = self
                .graph
                .neighbors_directed(idx, Direction::Incoming)
                .count();
            let absent = self.missing.get(&self.graph[idx]).map_or(0, Vec::len);
            unmet.insert(idx, incoming + absent);
        }
        ReadySet {
            graph: self,
            unmet,
            dispatched: HashSet::new(),
            completed: Vec::new(),
        }
    }
}

/// What the scheduler offers next
#[derive(Debug, Clone, PartialEq)]
pub enum Wave {
    /// Steps whose dependencies have all completed, in definition order
    Ready(Vec<String>),
    /// Dispatched steps have not reported back yet
    Waiting,
    Finished,
    /// Steps remain but none can ever start
    Deadlock {
        pending: Vec<String>,
        completed: Vec<String>,
        missing_dependencies: Value,
    },
}

/// Kahn-style iterator over a [`StepGraph`]
pub struct ReadySet<'g> {
    graph: &'g StepGraph,
    unmet: HashMap<NodeIndex, usize>,
    dispatched: HashSet<NodeIndex>,
    completed: Vec<String>,
}

impl<'g> ReadySet<'g> {
    /// Hand out every step that is ready and not yet dispatched.
    pub fn next_wave(&mut self) -> Wave {
        let ready: Vec<NodeIndex> = self
            .graph
            .order
            .iter()
            .copied()
            .filter(|idx| !self.dispatched.contains(idx) && self.unmet[idx] == 0)
            .collect();

        if !ready.is_empty() {
            let ids: Vec<String> = ready
                .iter()
                .map(|&idx| self.graph.graph[idx].clone())
                .collect();
            self.dispatched.extend(ready);
            debug!(ready = ?ids, "Computed ready set");
            return Wave::Ready(ids);
        }

        if self.completed.len() == self.graph.len() {
            return Wave::Finished;
        }
        if self.dispatched.len() > self.completed.len() {
            return Wave::Waiting;
        }

        let pending = self.pending();
        let missing: BTreeMap<&String, &Vec<String>> = self
            .graph
            .missing
            .iter()
            .filter(|(step, _)| pending.contains(*step))
            .collect();
        Wave::Deadlock {
            missing_dependencies: json!(missing),
            completed: self.completed.clone(),
            pending,
        }
    }

    /// Record `step_id` as completed and release its dependents.
    pub fn complete(&mut self, step_id: &str) {
        let Some(&idx) = self.graph.indices.get(step_id) else {
            return;
        };
        if !self.dispatched.contains(&idx) || self.completed.iter().any(|c| c == step_id) {
            return;
        }
        self.completed.push(step_id.to_string());
        for edge_target in self
            .graph
            .graph
            .neighbors_directed(idx, Direction::Outgoing)
        {
            if let Some(count) = self.unmet.get_mut(&edge_target) {
                *count = count.saturating_sub(1);
            }
        }
    }

    pub fn completed(&self) -> &[String] {
        &self.completed
    }

    /// Steps not completed, in definition order
    pub fn pending(&self) -> Vec<String> {
        self.graph
            .order
            .iter()
            .map(|&idx| &self.graph.graph[idx])
            .filter(|id| !self.completed.contains(*id))
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::taskagent::executor::{task_fn, TaskConfig};
    use pretty_assertions::assert_eq;

    fn def(id: &str, deps: &[&str]) -> StepDefinition {
        StepDefinition::new(
            id,
            TaskConfig::new(
                id,
                "test",
                0,
                task_fn(|v: Value| async move { Ok::<_, anyhow::Error>(v) }),
            ),
        )
        .depends_on(deps.iter().copied())
    }

    fn drain(graph: &StepGraph) -> (Vec<Vec<String>>, Wave) {
        let mut sched = graph.scheduler();
        let mut waves = Vec::new();
        loop {
            match sched.next_wave() {
                Wave::Ready(ids) => {
                    for id in &ids {
                        sched.complete(id);
                    }
                    waves.push(ids);
                }
                other => return (waves, other),
            }
        }
    }

    #[test]
    fn test_diamond_waves() {
        let graph = StepGraph::build(&[
            def("a", &[]),
            def("c", &["a"]),
            def("b", &["a"]),
            def("d", &["b", "c"]),
        ])
        .unwrap();

        let (waves, end) = drain(&graph);
        assert_eq!(
            waves,
            vec![
                vec!["a".to_string()],
                vec!["c".to_string(), "b".to_string()],
                vec!["d".to_string()],
            ]
        );
        assert_eq!(end, Wave::Finished);
        assert!(!graph.is_cyclic());
        assert_eq!(graph.dependents("a"), vec!["b", "c"]);
    }

    #[test]
    fn test_cycle_deadlocks() {
        let graph = StepGraph::build(&[def("a", &["b"]), def("b", &["a"])]).unwrap();
        assert!(graph.is_cyclic());
        assert!(graph.topological_order().is_none());

        let (waves, end) = drain(&graph);
        assert!(waves.is_empty());
        match end {
            Wave::Deadlock {
                pending, completed, ..
            } => {
                assert_eq!(pending, vec!["a", "b"]);
                assert!(completed.is_empty());
            }
            other => panic!("expected deadlock, got {:?}", other),
        }
    }

    #[test]
    fn test_self_dependency_deadlocks_after_others_finish() {
        let graph = StepGraph::build(&[def("ok", &[]), def("selfish", &["selfish"])]).unwrap();
        let (waves, end) = drain(&graph);
        assert_eq!(waves, vec![vec!["ok".to_string()]]);
        match end {
            Wave::Deadlock {
                pending, completed, ..
            } => {
                assert_eq!(pending, vec!["selfish"]);
                assert_eq!(completed, vec!["ok"]);
            }
            other => panic!("expected deadlock, got {:?}", other),
        }
    }

    #[test]
    fn test_missing_dependency_is_reported() {
        let graph = StepGraph::build(&[def("a", &["ghost"])]).unwrap();
        assert_eq!(graph.missing_dependencies()["a"], vec!["ghost"]);

        let (_, end) = drain(&graph);
        match end {
            Wave::Deadlock {
                missing_dependencies,
                ..
            } => assert_eq!(missing_dependencies, json!({"a": ["ghost"]})),
            other => panic!("expected deadlock, got {:?}", other),
        }
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let err = StepGraph::build(&[def("a", &[]), def("a", &[])]).err().unwrap();
        let info = err.to_info();
        assert_eq!(info.details.unwrap()["stage"], "graph");
    }

    #[test]
    fn test_waiting_while_in_flight() {
        let graph = StepGraph::build(&[def("a", &[]), def("b", &["a"])]).unwrap();
        let mut sched = graph.scheduler();
        assert_eq!(sched.next_wave(), Wave::Ready(vec!["a".to_string()]));
        assert_eq!(sched.next_wave(), Wave::Waiting);
        sched.complete("a");
        assert_eq!(sched.next_wave(), Wave::Ready(vec!["b".to_string()]));
    }

    #[test]
    fn test_empty_graph_finishes() {
        let graph = StepGraph::build(&[]).unwrap();
        assert!(graph.is_empty());
        assert_eq!(graph.scheduler().next_wave(), Wave::Finished);
    }
}
