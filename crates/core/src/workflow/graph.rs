use super::executor::Executor;
use crate::error::RoutingError;
use crate::types::{Message, NodeId, Outcome, Verdict};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::Topo;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// Kind of work a node performs, derived from its executor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Task,
    FanoutDispatcher,
    Aggregator,
    ApprovalGate,
    Subworkflow,
}

/// Progress descriptor shown in status events when the node runs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepInfo {
    pub label: String,
    pub percent: u8,
}

#[derive(Debug, Clone)]
pub struct Node {
    pub id: NodeId,
    pub executor: Executor,
    pub step: Option<StepInfo>,
}

impl Node {
    pub fn kind(&self) -> NodeKind {
        self.executor.kind()
    }

    /// Display label, falling back to the node id
    pub fn label(&self) -> &str {
        self.step
            .as_ref()
            .map(|s| s.label.as_str())
            .unwrap_or_else(|| self.id.as_str())
    }
}

/// Routing condition on an edge
#[derive(Clone)]
pub enum Condition {
    /// Fires when the source output is a decision with this verdict
    Verdict(Verdict),
    /// Opaque predicate; exclusivity can only be checked at run time
    Predicate {
        name: String,
        check: Arc<dyn Fn(&Message) -> bool + Send + Sync>,
    },
}

impl Condition {
    pub fn approved() -> Self {
        Condition::Verdict(Verdict::Approved)
    }

    pub fn rejected() -> Self {
        Condition::Verdict(Verdict::Rejected)
    }

    pub fn predicate(
        name: impl Into<String>,
        check: impl Fn(&Message) -> bool + Send + Sync + 'static,
    ) -> Self {
        Condition::Predicate {
            name: name.into(),
            check: Arc::new(check),
        }
    }

    pub fn evaluate(&self, output: &Message) -> bool {
        match self {
            Condition::Verdict(verdict) => output
                .as_decision()
                .map(|d| d.verdict == *verdict)
                .unwrap_or(false),
            Condition::Predicate { check, .. } => check(output),
        }
    }

    pub fn verdict(&self) -> Option<Verdict> {
        match self {
            Condition::Verdict(v) => Some(*v),
            Condition::Predicate { .. } => None,
        }
    }
}

impl std::fmt::Debug for Condition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Condition::Verdict(v) => f.debug_tuple("Verdict").field(v).finish(),
            Condition::Predicate { name, .. } => {
                f.debug_struct("Predicate").field("name", name).finish()
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct Edge {
    pub source: NodeId,
    pub target: NodeId,
    pub condition: Option<Condition>,
}

/// Immutable, validated workflow graph shared by every run created from it.
///
/// Only `WorkflowBuilder::build` constructs one.
#[derive(Debug)]
pub struct WorkflowDefinition {
    pub(crate) name: String,
    pub(crate) nodes: HashMap<NodeId, Node>,
    pub(crate) node_order: Vec<NodeId>,
    pub(crate) edges: Vec<Edge>,
    pub(crate) outgoing: HashMap<NodeId, Vec<usize>>,
    pub(crate) arity: HashMap<NodeId, usize>,
    pub(crate) start: NodeId,
    pub(crate) terminals: HashMap<NodeId, Outcome>,
    pub(crate) graph: DiGraph<NodeId, ()>,
    pub(crate) indices: HashMap<NodeId, NodeIndex>,
}

impl WorkflowDefinition {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn start(&self) -> &NodeId {
        &self.start
    }

    pub fn node(&self, id: &NodeId) -> Option<&Node> {
        self.nodes.get(id)
    }

    /// Nodes in the order they were added
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.node_order.iter().filter_map(|id| self.nodes.get(id))
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    /// Outgoing edges of a node, in the order they were added
    pub fn outgoing(&self, id: &NodeId) -> impl Iterator<Item = &Edge> {
        self.outgoing
            .get(id)
            .into_iter()
            .flatten()
            .map(|&i| &self.edges[i])
    }

    /// Number of branches an aggregator waits for (zero for other nodes)
    pub fn arity(&self, id: &NodeId) -> usize {
        self.arity.get(id).copied().unwrap_or(0)
    }

    pub fn terminal_outcome(&self, id: &NodeId) -> Option<Outcome> {
        self.terminals.get(id).copied()
    }

    pub fn terminals(&self) -> impl Iterator<Item = (&NodeId, &Outcome)> {
        self.terminals.iter()
    }

    pub fn contains_approval_gate(&self) -> bool {
        self.nodes
            .values()
            .any(|n| n.kind() == NodeKind::ApprovalGate)
    }

    /// Nodes in topological order (predecessors first)
    pub fn topological_order(&self) -> Vec<NodeId> {
        let mut topo = Topo::new(&self.graph);
        let mut order = Vec::new();

        while let Some(node) = topo.next(&self.graph) {
            order.push(self.graph[node].clone());
        }

        order
    }

    /// Distinct upstream nodes of a node
    pub fn dependencies(&self, id: &NodeId) -> Vec<NodeId> {
        let Some(&index) = self.indices.get(id) else {
            return Vec::new();
        };

        let mut deps: Vec<NodeId> = self
            .graph
            .neighbors_directed(index, petgraph::Direction::Incoming)
            .map(|n| self.graph[n].clone())
            .collect();
        deps.sort();
        deps.dedup();
        deps
    }

    /// Targets that fire for `output` leaving `source`, in edge order.
    ///
    /// Unconditional edges always fire. When the source has conditional
    /// edges, exactly one of them must match.
    pub fn route(&self, source: &NodeId, output: &Message) -> Result<Vec<NodeId>, RoutingError> {
        let mut fired = Vec::new();
        let mut conditional = 0usize;
        let mut matched = Vec::new();

        for edge in self.outgoing(source) {
            match &edge.condition {
                None => fired.push(edge.target.clone()),
                Some(condition) => {
                    conditional += 1;
                    if condition.evaluate(output) {
                        matched.push(edge.target.clone());
                        fired.push(edge.target.clone());
                    }
                }
            }
        }

        if conditional > 0 {
            match matched.len() {
                0 => {
                    return Err(RoutingError::NoMatch {
                        node: source.clone(),
                        message_kind: output.kind(),
                    })
                }
                1 => {}
                _ => {
                    return Err(RoutingError::Ambiguous {
                        node: source.clone(),
                        matched,
                    })
                }
            }
        }

        Ok(fired)
    }
}
