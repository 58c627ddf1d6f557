use super::graph::WorkflowDefinition;
use crate::approval::ApprovalRequest;
use crate::error::{EngineError, EngineResult, ExecutorError};
use crate::events::EventStream;
use crate::types::{BranchId, Message, NodeId, RunId, RunStatus, TerminalResult};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;

/// A node invocation waiting to be dispatched
#[derive(Debug, Clone)]
pub(crate) struct WorkItem {
    pub node: NodeId,
    pub input: Message,
    /// Spawned alongside other in-flight work instead of waiting for it
    pub concurrent: bool,
}

/// Approval request a suspended run is waiting on
#[derive(Debug, Clone, Serialize)]
pub struct PendingApproval {
    pub node: NodeId,
    pub request: ApprovalRequest,
    pub requested_at: DateTime<Utc>,
    #[serde(skip)]
    pub(crate) subject: Message,
    #[serde(skip)]
    pub(crate) concurrent: bool,
}

/// Mutable state of one run. Guarded by the run handle's mutex.
#[derive(Debug)]
pub struct RunState {
    pub id: RunId,
    pub status: RunStatus,
    /// Nodes dispatched and not yet finished
    pub frontier: Vec<NodeId>,
    /// Aggregator buffers keyed by aggregator, then by delivering branch
    pub fan_in: HashMap<NodeId, BTreeMap<BranchId, Message>>,
    pub pending_approval: Option<PendingApproval>,
    pub result: Option<TerminalResult>,
    pub failure: Option<EngineError>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub(crate) parked: VecDeque<WorkItem>,
    pub(crate) resume: Option<(WorkItem, Message)>,
    pub(crate) driver_active: bool,
    pub(crate) approval_resolved: bool,
    pub(crate) approval_timer: Option<CancellationToken>,
    pub(crate) output: Option<Message>,
}

impl RunState {
    pub(crate) fn new(id: RunId, start: NodeId, input: Message) -> Self {
        let now = Utc::now();
        let mut parked = VecDeque::new();
        parked.push_back(WorkItem {
            node: start,
            input,
            concurrent: false,
        });

        Self {
            id,
            status: RunStatus::Running,
            frontier: Vec::new(),
            fan_in: HashMap::new(),
            pending_approval: None,
            result: None,
            failure: None,
            started_at: now,
            updated_at: now,
            completed_at: None,
            parked,
            resume: None,
            driver_active: false,
            approval_resolved: false,
            approval_timer: None,
            output: None,
        }
    }

    pub(crate) fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    pub(crate) fn dispatched(&mut self, node: &NodeId) {
        self.frontier.push(node.clone());
        self.touch();
    }

    pub(crate) fn resolved(&mut self, node: &NodeId) {
        if let Some(pos) = self.frontier.iter().position(|n| n == node) {
            self.frontier.remove(pos);
        }
        self.touch();
    }

    /// Buffer one branch output for an aggregator.
    ///
    /// Returns the full branch map once `arity` distinct branches have
    /// arrived, clearing the buffer.
    pub(crate) fn record_branch(
        &mut self,
        aggregator: &NodeId,
        branch: BranchId,
        message: Message,
        arity: usize,
    ) -> Result<Option<BTreeMap<BranchId, Message>>, ExecutorError> {
        let buffer = self.fan_in.entry(aggregator.clone()).or_default();
        if buffer.contains_key(&branch) {
            return Err(ExecutorError::FanIn {
                node: aggregator.clone(),
                branch,
            });
        }
        buffer.insert(branch, message);

        if buffer.len() < arity {
            return Ok(None);
        }
        Ok(self.fan_in.remove(aggregator))
    }

    pub(crate) fn cancel_approval_timer(&mut self) {
        if let Some(timer) = self.approval_timer.take() {
            timer.cancel();
        }
    }

    pub fn snapshot(&self, workflow: &str) -> RunSnapshot {
        RunSnapshot {
            id: self.id,
            workflow: workflow.to_string(),
            status: self.status,
            frontier: self.frontier.clone(),
            ready: self.parked.iter().map(|item| item.node.clone()).collect(),
            fan_in: self
                .fan_in
                .iter()
                .map(|(node, branches)| (node.clone(), branches.keys().cloned().collect()))
                .collect(),
            pending_approval: self.pending_approval.clone(),
            result: self.result.clone(),
            error: self.failure.as_ref().map(|e| e.to_string()),
            started_at: self.started_at,
            updated_at: self.updated_at,
            completed_at: self.completed_at,
        }
    }
}

/// Serializable view of a run
#[derive(Debug, Clone, Serialize)]
pub struct RunSnapshot {
    pub id: RunId,
    pub workflow: String,
    pub status: RunStatus,
    pub frontier: Vec<NodeId>,
    /// Work parked while the run waits for approval
    pub ready: Vec<NodeId>,
    /// Branches received so far by each waiting aggregator
    pub fan_in: HashMap<NodeId, Vec<BranchId>>,
    pub pending_approval: Option<PendingApproval>,
    pub result: Option<TerminalResult>,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Everything the runner keeps for one run
pub struct RunHandle {
    pub run_id: RunId,
    pub definition: Arc<WorkflowDefinition>,
    pub state: Mutex<RunState>,
    pub events: Arc<EventStream>,
}

impl RunHandle {
    pub(crate) fn new(
        definition: Arc<WorkflowDefinition>,
        state: RunState,
        events: Arc<EventStream>,
    ) -> Self {
        Self {
            run_id: state.id,
            definition,
            state: Mutex::new(state),
            events,
        }
    }

    pub async fn snapshot(&self) -> RunSnapshot {
        self.state.lock().await.snapshot(self.definition.name())
    }
}

/// In-memory registry of runs, keyed by run id.
///
/// Finished runs stay here for inspection until they are removed or
/// evicted by age.
#[derive(Default)]
pub struct RunStore {
    runs: RwLock<HashMap<RunId, Arc<RunHandle>>>,
}

impl RunStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a run. An id already in the store is refused.
    pub async fn insert(&self, handle: RunHandle) -> EngineResult<Arc<RunHandle>> {
        let run_id = handle.run_id;
        let mut runs = self.runs.write().await;
        if runs.contains_key(&run_id) {
            return Err(EngineError::DuplicateRun(run_id));
        }
        let handle = Arc::new(handle);
        runs.insert(run_id, handle.clone());
        Ok(handle)
    }

    pub async fn get(&self, run_id: RunId) -> EngineResult<Arc<RunHandle>> {
        self.runs
            .read()
            .await
            .get(&run_id)
            .cloned()
            .ok_or(EngineError::RunNotFound(run_id))
    }

    pub async fn remove(&self, run_id: RunId) -> Option<Arc<RunHandle>> {
        self.runs.write().await.remove(&run_id)
    }

    /// Drop every COMPLETED or FAILED run that finished at or before
    /// `cutoff`. Returns the number of runs dropped.
    pub async fn evict_finished(&self, cutoff: DateTime<Utc>) -> usize {
        let handles: Vec<Arc<RunHandle>> = self.runs.read().await.values().cloned().collect();

        let mut expired = Vec::new();
        for handle in handles {
            let state = handle.state.lock().await;
            let finished_before = state.completed_at.is_some_and(|at| at <= cutoff);
            if state.status.is_terminal() && finished_before {
                expired.push(handle.run_id);
            }
        }
        if expired.is_empty() {
            return 0;
        }

        let mut runs = self.runs.write().await;
        expired.iter().filter(|id| runs.remove(id).is_some()).count()
    }

    /// Snapshots of every run, oldest first
    pub async fn list(&self) -> Vec<RunSnapshot> {
        let handles: Vec<Arc<RunHandle>> = self.runs.read().await.values().cloned().collect();

        let mut snapshots = Vec::with_capacity(handles.len());
        for handle in handles {
            snapshots.push(handle.snapshot().await);
        }
        snapshots.sort_by_key(|s| s.started_at);
        snapshots
    }

    pub async fn len(&self) -> usize {
        self.runs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.runs.read().await.is_empty()
    }
}
