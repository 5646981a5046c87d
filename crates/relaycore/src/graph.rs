//! Dependency graph of a workflow and its validation.
//!
//! Steps live in an arena (`petgraph::DiGraph`) addressed by `NodeIndex`,
//! in definition order. Edges point from a dependency to its dependent.

use crate::{StepId, ValidationError, WorkflowDefinition};
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, Neighbors, NodeIndex};
use petgraph::visit::Dfs;
use petgraph::Direction;
use std::collections::HashMap;

pub type StepIndex = NodeIndex;

#[derive(Debug, Clone)]
pub struct StepGraph {
    graph: DiGraph<StepId, ()>,
    index_of: HashMap<StepId, StepIndex>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unvisited,
    OnStack,
    Done,
}

impl StepGraph {
    /// Validate a definition and build its graph.
    ///
    /// Checks run in order: unique ids, referential integrity, acyclicity.
    /// The first failing check is reported.
    pub fn build(definition: &WorkflowDefinition) -> Result<Self, ValidationError> {
        if definition.steps.is_empty() {
            return Err(ValidationError::EmptyWorkflow);
        }

        let mut graph = DiGraph::with_capacity(definition.steps.len(), 0);
        let mut index_of = HashMap::new();

        for step in &definition.steps {
            if index_of.contains_key(&step.id) {
                return Err(ValidationError::DuplicateStepId {
                    step_id: step.id.clone(),
                });
            }
            let idx = graph.add_node(step.id.clone());
            index_of.insert(step.id.clone(), idx);
        }

        for step in &definition.steps {
            let to = index_of[&step.id];
            for dep in &step.depends_on {
                let from = index_of.get(dep).ok_or_else(|| ValidationError::UnknownDependency {
                    step_id: step.id.clone(),
                    missing: dep.clone(),
                })?;
                graph.update_edge(*from, to, ());
            }
        }

        let step_graph = Self { graph, index_of };
        if let Some(idx) = step_graph.find_cycle() {
            return Err(ValidationError::CyclicDependency {
                step_id: step_graph.step_id(idx).to_string(),
            });
        }

        Ok(step_graph)
    }

    /// Depth-first search keeping an on-stack mark per node. Reaching a node
    /// that is still on the stack closes a cycle; that node is returned.
    /// The stack is explicit so chain length is not bounded by the call stack.
    fn find_cycle(&self) -> Option<StepIndex> {
        let mut marks = vec![Mark::Unvisited; self.graph.node_count()];
        let mut stack: Vec<(StepIndex, Neighbors<'_, ()>)> = Vec::new();

        for start in self.graph.node_indices() {
            if marks[start.index()] != Mark::Unvisited {
                continue;
            }
            marks[start.index()] = Mark::OnStack;
            stack.push((start, self.graph.neighbors_directed(start, Direction::Outgoing)));

            while let Some((node, neighbors)) = stack.last_mut() {
                let node = *node;
                match neighbors.next() {
                    Some(next) => match marks[next.index()] {
                        Mark::OnStack => return Some(next),
                        Mark::Unvisited => {
                            marks[next.index()] = Mark::OnStack;
                            stack.push((
                                next,
                                self.graph.neighbors_directed(next, Direction::Outgoing),
                            ));
                        }
                        Mark::Done => {}
                    },
                    None => {
                        marks[node.index()] = Mark::Done;
                        stack.pop();
                    }
                }
            }
        }
        None
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    pub fn indices(&self) -> impl Iterator<Item = StepIndex> + '_ {
        self.graph.node_indices()
    }

    pub fn step_id(&self, idx: StepIndex) -> &str {
        &self.graph[idx]
    }

    pub fn index_of(&self, step_id: &str) -> Option<StepIndex> {
        self.index_of.get(step_id).copied()
    }

    /// Direct dependencies of a step.
    pub fn dependencies(&self, idx: StepIndex) -> Vec<StepIndex> {
        self.graph
            .neighbors_directed(idx, Direction::Incoming)
            .collect()
    }

    /// Steps that directly depend on this one.
    pub fn dependents(&self, idx: StepIndex) -> Vec<StepIndex> {
        self.graph
            .neighbors_directed(idx, Direction::Outgoing)
            .collect()
    }

    /// Every step reachable from `idx`, excluding `idx` itself.
    pub fn transitive_dependents(&self, idx: StepIndex) -> Vec<StepIndex> {
        let mut dfs = Dfs::new(&self.graph, idx);
        let mut reached = Vec::new();
        while let Some(next) = dfs.next(&self.graph) {
            if next != idx {
                reached.push(next);
            }
        }
        reached.sort();
        reached
    }

    /// Steps without dependencies.
    pub fn roots(&self) -> Vec<StepIndex> {
        self.graph
            .node_indices()
            .filter(|idx| {
                self.graph
                    .neighbors_directed(*idx, Direction::Incoming)
                    .next()
                    .is_none()
            })
            .collect()
    }

    pub fn topological_order(&self) -> Vec<StepIndex> {
        toposort(&self.graph, None).unwrap_or_default()
    }
}
