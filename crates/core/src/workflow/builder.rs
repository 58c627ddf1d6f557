use super::executor::Executor;
use super::graph::{Condition, Edge, Node, StepInfo, WorkflowDefinition};
use crate::error::ValidationError;
use crate::types::{NodeId, Outcome, Verdict};
use petgraph::graph::DiGraph;
use petgraph::visit::Bfs;
use std::collections::{HashMap, HashSet};

/// Assembles a workflow graph and validates it into a `WorkflowDefinition`.
///
/// Nodes and edges may be added in any order; nothing is checked until
/// `build`. The builder can be built more than once.
#[derive(Debug, Clone)]
pub struct WorkflowBuilder {
    name: String,
    nodes: Vec<Node>,
    edges: Vec<Edge>,
    start: Option<NodeId>,
    steps: Vec<(NodeId, StepInfo)>,
    terminals: Vec<(NodeId, Outcome)>,
}

impl WorkflowBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            nodes: Vec::new(),
            edges: Vec::new(),
            start: None,
            steps: Vec::new(),
            terminals: Vec::new(),
        }
    }

    pub fn add_node(&mut self, id: impl Into<NodeId>, executor: Executor) -> &mut Self {
        self.nodes.push(Node {
            id: id.into(),
            executor,
            step: None,
        });
        self
    }

    /// Attach a progress label and percentage to a node
    pub fn describe(
        &mut self,
        id: impl Into<NodeId>,
        label: impl Into<String>,
        percent: u8,
    ) -> &mut Self {
        self.steps.push((
            id.into(),
            StepInfo {
                label: label.into(),
                percent: percent.min(100),
            },
        ));
        self
    }

    pub fn add_edge(&mut self, source: impl Into<NodeId>, target: impl Into<NodeId>) -> &mut Self {
        self.edges.push(Edge {
            source: source.into(),
            target: target.into(),
            condition: None,
        });
        self
    }

    pub fn add_conditional_edge(
        &mut self,
        source: impl Into<NodeId>,
        target: impl Into<NodeId>,
        condition: Condition,
    ) -> &mut Self {
        self.edges.push(Edge {
            source: source.into(),
            target: target.into(),
            condition: Some(condition),
        });
        self
    }

    pub fn set_start(&mut self, id: impl Into<NodeId>) -> &mut Self {
        self.start = Some(id.into());
        self
    }

    /// Designate a node whose completion ends the run with `outcome`.
    ///
    /// Without any designation, every node with no outgoing edges is a
    /// terminal with outcome `COMPLETED`.
    pub fn set_terminal(&mut self, id: impl Into<NodeId>, outcome: Outcome) -> &mut Self {
        self.terminals.push((id.into(), outcome));
        self
    }

    pub fn build(&self) -> Result<WorkflowDefinition, ValidationError> {
        let mut nodes: HashMap<NodeId, Node> = HashMap::new();
        let mut node_order = Vec::with_capacity(self.nodes.len());
        for node in &self.nodes {
            if nodes.insert(node.id.clone(), node.clone()).is_some() {
                return Err(ValidationError::DuplicateNode(node.id.clone()));
            }
            node_order.push(node.id.clone());
        }

        let start = self
            .start
            .clone()
            .ok_or_else(|| ValidationError::MissingStart(self.name.clone()))?;
        if !nodes.contains_key(&start) {
            return Err(ValidationError::UnknownStart(start));
        }

        let mut seen_edges = HashSet::new();
        for edge in &self.edges {
            for endpoint in [&edge.source, &edge.target] {
                if !nodes.contains_key(endpoint) {
                    return Err(ValidationError::DanglingEdge {
                        from: edge.source.clone(),
                        to: edge.target.clone(),
                        missing: endpoint.clone(),
                    });
                }
            }
            if !seen_edges.insert((edge.source.clone(), edge.target.clone())) {
                return Err(ValidationError::DuplicateEdge {
                    from: edge.source.clone(),
                    to: edge.target.clone(),
                });
            }
        }

        for (id, step) in &self.steps {
            let node = nodes.get_mut(id).ok_or_else(|| ValidationError::UnknownNode {
                context: "step description",
                node: id.clone(),
            })?;
            node.step = Some(step.clone());
        }

        // Build the petgraph view for cycle and reachability checks
        let mut graph = DiGraph::new();
        let mut indices = HashMap::new();
        for id in &node_order {
            indices.insert(id.clone(), graph.add_node(id.clone()));
        }
        for edge in &self.edges {
            graph.add_edge(indices[&edge.source], indices[&edge.target], ());
        }

        if let Err(cycle) = petgraph::algo::toposort(&graph, None) {
            return Err(ValidationError::Cycle(graph[cycle.node_id()].clone()));
        }

        let mut reachable = HashSet::new();
        let mut bfs = Bfs::new(&graph, indices[&start]);
        while let Some(index) = bfs.next(&graph) {
            reachable.insert(graph[index].clone());
        }
        if let Some(unreachable) = node_order.iter().find(|id| !reachable.contains(*id)) {
            return Err(ValidationError::Unreachable(unreachable.clone()));
        }

        let mut outgoing: HashMap<NodeId, Vec<usize>> = HashMap::new();
        let mut incoming: HashMap<NodeId, HashSet<NodeId>> = HashMap::new();
        for (i, edge) in self.edges.iter().enumerate() {
            outgoing.entry(edge.source.clone()).or_default().push(i);
            incoming
                .entry(edge.target.clone())
                .or_default()
                .insert(edge.source.clone());
        }

        let mut arity = HashMap::new();
        for id in &node_order {
            let node = &nodes[id];
            let out: Vec<&Edge> = outgoing
                .get(id)
                .into_iter()
                .flatten()
                .map(|&i| &self.edges[i])
                .collect();

            let is_gate = matches!(node.executor, Executor::ApprovalGate(_));
            let verdict_edge = |e: &&Edge| e.condition.as_ref().and_then(Condition::verdict).is_some();
            if !is_gate && out.iter().any(verdict_edge) {
                return Err(ValidationError::VerdictConditionOnNonGate(id.clone()));
            }

            match &node.executor {
                Executor::Aggregator { arity: declared, .. } => {
                    let computed = incoming.get(id).map(HashSet::len).unwrap_or(0);
                    if computed == 0 {
                        return Err(ValidationError::AggregatorWithoutBranches(id.clone()));
                    }
                    if let Some(declared) = declared {
                        if *declared != computed {
                            return Err(ValidationError::ArityMismatch {
                                node: id.clone(),
                                declared: *declared,
                                computed,
                            });
                        }
                    }
                    arity.insert(id.clone(), computed);
                }
                Executor::Fanout => {
                    if out.is_empty() {
                        return Err(ValidationError::FanoutWithoutBranches(id.clone()));
                    }
                    if out.iter().any(|e| e.condition.is_some()) {
                        return Err(ValidationError::ConditionalFanout(id.clone()));
                    }
                }
                Executor::Subworkflow(inner) => {
                    if inner.contains_approval_gate() {
                        return Err(ValidationError::NestedApprovalGate {
                            node: id.clone(),
                            workflow: inner.name().to_string(),
                        });
                    }
                }
                Executor::Task(_) | Executor::ApprovalGate(_) => {}
            }

            check_conditions(id, &out)?;

            // A decision must take exactly one of the two verdict paths
            if is_gate && (out.is_empty() || !out.iter().all(verdict_edge)) {
                return Err(ValidationError::GateWithoutVerdictRouting(id.clone()));
            }
        }

        let mut terminals = HashMap::new();
        for (id, outcome) in &self.terminals {
            if !nodes.contains_key(id) {
                return Err(ValidationError::UnknownNode {
                    context: "terminal designation",
                    node: id.clone(),
                });
            }
            if outgoing.contains_key(id) {
                return Err(ValidationError::TerminalWithSuccessors(id.clone()));
            }
            terminals.insert(id.clone(), *outcome);
        }
        if terminals.is_empty() {
            for id in node_order.iter().filter(|id| !outgoing.contains_key(*id)) {
                terminals.insert(id.clone(), Outcome::Completed);
            }
        }

        tracing::debug!(
            "Built workflow '{}' with {} nodes and {} edges",
            self.name,
            node_order.len(),
            self.edges.len()
        );

        Ok(WorkflowDefinition {
            name: self.name.clone(),
            nodes,
            node_order,
            edges: self.edges.clone(),
            outgoing,
            arity,
            start,
            terminals,
            graph,
            indices,
        })
    }
}

/// Conditions leaving one node must be all-verdict or all-predicate.
/// Verdict conditions must cover each verdict exactly once.
fn check_conditions(node: &NodeId, out: &[&Edge]) -> Result<(), ValidationError> {
    let conditions: Vec<&Condition> = out.iter().filter_map(|e| e.condition.as_ref()).collect();
    if conditions.is_empty() {
        return Ok(());
    }

    let verdicts: Vec<Verdict> = conditions.iter().filter_map(|c| c.verdict()).collect();
    if verdicts.is_empty() {
        return Ok(());
    }
    if verdicts.len() != conditions.len() {
        return Err(ValidationError::MixedConditions(node.clone()));
    }

    for verdict in Verdict::ALL {
        match verdicts.iter().filter(|v| **v == verdict).count() {
            0 => {
                return Err(ValidationError::NonExhaustiveConditions {
                    node: node.clone(),
                    verdict,
                })
            }
            1 => {}
            _ => {
                return Err(ValidationError::OverlappingConditions {
                    node: node.clone(),
                    verdict,
                })
            }
        }
    }

    Ok(())
}
