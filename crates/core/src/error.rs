use crate::types::{BranchId, NodeId, RunId, RunStatus, Verdict};
use thiserror::Error;

/// Malformed workflow definition, reported by `WorkflowBuilder::build`
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("workflow '{0}' has no start node")]
    MissingStart(String),

    #[error("start node '{0}' is not defined")]
    UnknownStart(NodeId),

    #[error("node '{0}' is defined more than once")]
    DuplicateNode(NodeId),

    #[error("edge {from} -> {to} references unknown node '{missing}'")]
    DanglingEdge {
        from: NodeId,
        to: NodeId,
        missing: NodeId,
    },

    #[error("edge {from} -> {to} is defined more than once")]
    DuplicateEdge { from: NodeId, to: NodeId },

    #[error("{context} references unknown node '{node}'")]
    UnknownNode { context: &'static str, node: NodeId },

    #[error("workflow contains a cycle through node '{0}'")]
    Cycle(NodeId),

    #[error("node '{0}' is unreachable from the start node")]
    Unreachable(NodeId),

    #[error("aggregator '{0}' has no incoming branches")]
    AggregatorWithoutBranches(NodeId),

    #[error("aggregator '{node}' declares arity {declared} but has {computed} incoming branches")]
    ArityMismatch {
        node: NodeId,
        declared: usize,
        computed: usize,
    },

    #[error("conditions leaving '{node}' are not mutually exclusive: {verdict:?} appears more than once")]
    OverlappingConditions { node: NodeId, verdict: Verdict },

    #[error("conditions leaving '{node}' are not exhaustive: no edge for {verdict:?}")]
    NonExhaustiveConditions { node: NodeId, verdict: Verdict },

    #[error("conditions leaving '{0}' mix verdict and predicate conditions")]
    MixedConditions(NodeId),

    #[error("approval gate '{0}' must route only through one approved and one rejected edge")]
    GateWithoutVerdictRouting(NodeId),

    #[error("node '{0}' has verdict conditions but is not an approval gate")]
    VerdictConditionOnNonGate(NodeId),

    #[error("fan-out dispatcher '{0}' has no branch targets")]
    FanoutWithoutBranches(NodeId),

    #[error("fan-out dispatcher '{0}' cannot have conditional edges")]
    ConditionalFanout(NodeId),

    #[error("terminal node '{0}' has outgoing edges")]
    TerminalWithSuccessors(NodeId),

    #[error("subworkflow node '{node}' wraps '{workflow}', which contains an approval gate")]
    NestedApprovalGate { node: NodeId, workflow: String },
}

/// A completed node's output could not be routed to exactly one conditional edge
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RoutingError {
    #[error("no outgoing condition of '{node}' matched its {message_kind} output")]
    NoMatch { node: NodeId, message_kind: &'static str },

    #[error("output of '{node}' matched more than one condition: {matched:?}")]
    Ambiguous { node: NodeId, matched: Vec<NodeId> },
}

/// An approval response or gate invocation that does not fit the run's state
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SuspendedStateError {
    #[error("run {run_id} is not awaiting approval (status: {status})")]
    NotWaiting { run_id: RunId, status: RunStatus },

    #[error("approval gate '{node}' reached while run {run_id} is already awaiting approval")]
    AlreadyWaiting { run_id: RunId, node: NodeId },

    #[error("approval gate '{node}' reached after run {run_id} finished its approval round-trip")]
    AlreadyResolved { run_id: RunId, node: NodeId },
}

/// Failure of a single node invocation
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExecutorError {
    #[error("node '{node}' failed: {message}")]
    Failed { node: NodeId, message: String },

    #[error("agent '{agent}' failed: {message}")]
    Agent { agent: String, message: String },

    /// Nested failures are reported without exposing the nested node
    #[error("subworkflow '{workflow}' at node '{node}' failed")]
    Subworkflow { node: NodeId, workflow: String },

    #[error("aggregator '{node}' received branch '{branch}' more than once")]
    FanIn { node: NodeId, branch: BranchId },

    #[error("node '{node}' panicked: {message}")]
    Panicked { node: NodeId, message: String },

    #[error(transparent)]
    Suspended(#[from] SuspendedStateError),
}

impl ExecutorError {
    pub fn failed(node: impl Into<NodeId>, message: impl Into<String>) -> Self {
        ExecutorError::Failed {
            node: node.into(),
            message: message.into(),
        }
    }
}

/// A run waited for approval longer than the configured deadline
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("run {run_id} timed out after {after_secs}s awaiting approval")]
pub struct TimeoutError {
    pub run_id: RunId,
    pub after_secs: u64,
}

/// Error returned by the runner's public operations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Routing(#[from] RoutingError),

    #[error(transparent)]
    Executor(#[from] ExecutorError),

    #[error(transparent)]
    Suspended(#[from] SuspendedStateError),

    #[error(transparent)]
    Timeout(#[from] TimeoutError),

    #[error("run {0} not found")]
    RunNotFound(RunId),

    #[error("run {0} already exists")]
    DuplicateRun(RunId),

    #[error("run stalled with no runnable work; aggregators still waiting: {waiting:?}")]
    Stalled { waiting: Vec<NodeId> },

    #[error("run ended without reaching a terminal node")]
    NoTerminal,
}

pub type EngineResult<T> = Result<T, EngineError>;
