use super::executor::{self, Executor, NodeContext};
use super::graph::{Node, NodeKind, WorkflowDefinition};
use super::state::{PendingApproval, RunHandle, RunSnapshot, RunState, RunStore, WorkItem};
use crate::approval::ApprovalResponse;
use crate::config::{EngineConfig, TimeoutPolicy};
use crate::error::{EngineError, EngineResult, ExecutorError, SuspendedStateError, TimeoutError};
use crate::events::{
    ApprovalRequestEvent, CompletionEvent, ErrorEvent, EventStream, EventType, OutputKind,
    Subscription,
};
use crate::types::{Decision, Message, NodeId, RunId, RunStatus, TerminalResult};
use chrono::Utc;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::collections::{HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::{self, JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

const HUMAN_SOURCE: &str = "Human";
const TIMEOUT_SOURCE: &str = "Approval Timeout";

/// Result of one spawned node invocation
struct Completion {
    node: NodeId,
    concurrent: bool,
    result: Result<Message, ExecutorError>,
}

/// Drives workflow runs: dispatches ready nodes, buffers fan-in, routes
/// outputs, and parks runs that wait for a human decision.
///
/// Each run is driven by at most one background task at a time. A run
/// suspended at an approval gate has no driver until a response arrives.
#[derive(Clone)]
pub struct WorkflowRunner {
    store: Arc<RunStore>,
    config: Arc<EngineConfig>,
    /// Nested runs publish node output to the parent run's stream
    output_sink: Option<Arc<EventStream>>,
}

impl WorkflowRunner {
    pub fn new(config: EngineConfig) -> Self {
        Self::with_store(Arc::new(RunStore::new()), config)
    }

    pub fn with_store(store: Arc<RunStore>, config: EngineConfig) -> Self {
        Self {
            store,
            config: Arc::new(config),
            output_sink: None,
        }
    }

    pub fn store(&self) -> &Arc<RunStore> {
        &self.store
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Create a run and start driving it in the background
    pub async fn start_run(
        &self,
        definition: Arc<WorkflowDefinition>,
        input: Message,
    ) -> EngineResult<RunId> {
        let handle = self.create_run(definition, input).await?;
        let run_id = handle.run_id;
        self.spawn_driver(handle);
        Ok(run_id)
    }

    async fn create_run(
        &self,
        definition: Arc<WorkflowDefinition>,
        input: Message,
    ) -> EngineResult<Arc<RunHandle>> {
        let run_id = RunId::new();
        let events = Arc::new(EventStream::new(run_id, self.config.event_capacity));
        let mut state = RunState::new(run_id, definition.start().clone(), input);
        state.driver_active = true;

        let first_step = definition
            .node(definition.start())
            .map(|n| n.label().to_string())
            .unwrap_or_default();
        let handle = self
            .store
            .insert(RunHandle::new(definition.clone(), state, events))
            .await?;

        handle.events.update_status(|status| {
            status.progress = 0;
            status.current_step = first_step;
        });

        tracing::info!(
            "Starting workflow execution: run_id={}, workflow={}",
            run_id,
            definition.name()
        );
        Ok(handle)
    }

    fn spawn_driver(&self, handle: Arc<RunHandle>) {
        let runner = self.clone();
        tokio::spawn(async move {
            runner.drive(handle).await;
        });
    }

    pub async fn subscribe(&self, run_id: RunId) -> EngineResult<Subscription> {
        Ok(self.store.get(run_id).await?.events.subscribe())
    }

    pub async fn snapshot(&self, run_id: RunId) -> EngineResult<RunSnapshot> {
        Ok(self.store.get(run_id).await?.snapshot().await)
    }

    pub async fn list_runs(&self) -> Vec<RunSnapshot> {
        self.store.list().await
    }

    /// Periodically evict finished runs older than `retain_finished_secs`.
    ///
    /// Returns `None` when no retention is configured. The sweep runs every
    /// retention period, at most once a minute and at least once a second.
    pub fn spawn_retention_sweep(&self) -> Option<JoinHandle<()>> {
        let retain = self.config.retain_finished()?;
        let max_age = match chrono::Duration::from_std(retain) {
            Ok(age) => age,
            Err(e) => {
                tracing::warn!(
                    "Run retention of {:?} is out of range, keeping all runs: {}",
                    retain,
                    e
                );
                return None;
            }
        };
        let period = retain.clamp(Duration::from_secs(1), Duration::from_secs(60));
        let store = self.store.clone();

        tracing::info!("Evicting finished runs after {}s", retain.as_secs());
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(cutoff) = Utc::now().checked_sub_signed(max_age) else {
                    continue;
                };
                let evicted = store.evict_finished(cutoff).await;
                if evicted > 0 {
                    tracing::info!("Evicted {} finished runs, {} remaining", evicted, store.len().await);
                }
            }
        }))
    }

    /// Resume a run suspended at an approval gate.
    ///
    /// The gate's output becomes a `Message::Decision` carrying the verdict,
    /// the feedback, and the message that was under review.
    pub async fn submit_approval_response(
        &self,
        run_id: RunId,
        response: ApprovalResponse,
    ) -> EngineResult<()> {
        self.resolve_approval(run_id, response, HUMAN_SOURCE).await
    }

    /// Apply a decision to a waiting run. `source` names who decided in the
    /// decision output event.
    async fn resolve_approval(
        &self,
        run_id: RunId,
        response: ApprovalResponse,
        source: &str,
    ) -> EngineResult<()> {
        let handle = self.store.get(run_id).await?;

        let needs_driver = {
            let mut state = handle.state.lock().await;
            if state.status != RunStatus::WaitingApproval {
                return Err(SuspendedStateError::NotWaiting {
                    run_id,
                    status: state.status,
                }
                .into());
            }
            let pending = state.pending_approval.take().ok_or(
                SuspendedStateError::NotWaiting {
                    run_id,
                    status: state.status,
                },
            )?;
            state.cancel_approval_timer();

            let decision = Decision {
                verdict: response.decision,
                feedback: response.feedback,
                subject: Box::new(pending.subject.clone()),
                decided_at: Utc::now(),
            };

            handle.events.clear_pending_approval();
            handle
                .events
                .output(source, decision.to_string(), OutputKind::Decision);
            tracing::info!(
                "Approval received: run_id={}, node={}, decision={}, source={}",
                run_id,
                pending.node,
                decision.verdict,
                source
            );

            state.status = RunStatus::Running;
            state.approval_resolved = true;
            state.resume = Some((
                WorkItem {
                    node: pending.node,
                    input: pending.subject,
                    concurrent: pending.concurrent,
                },
                Message::Decision(decision),
            ));
            state.touch();

            let needs_driver = !state.driver_active;
            state.driver_active = true;
            needs_driver
        };

        if needs_driver {
            self.spawn_driver(handle);
        }
        Ok(())
    }

    async fn drive(&self, handle: Arc<RunHandle>) {
        if let Err(error) = self.drive_inner(&handle).await {
            self.fail_run(&handle, error).await;
        }
    }

    async fn drive_inner(&self, handle: &Arc<RunHandle>) -> EngineResult<()> {
        let mut ready: VecDeque<WorkItem> = VecDeque::new();
        let mut in_flight: JoinSet<Completion> = JoinSet::new();
        let mut tasks: HashMap<task::Id, NodeId> = HashMap::new();
        let mut suspended = false;

        let resumed = {
            let mut state = handle.state.lock().await;
            if state.status.is_terminal() {
                return Ok(());
            }
            ready.extend(state.parked.drain(..));
            state.resume.take()
        };
        if let Some((gate, decision)) = resumed {
            self.complete(handle, &gate.node, gate.concurrent, decision, &mut ready)
                .await?;
        }

        loop {
            if suspended {
                // A second gate can never open while the first is unanswered
                if let Some(pos) = ready.iter().position(|item| is_gate(handle, &item.node)) {
                    if let Some(item) = ready.remove(pos) {
                        self.open_gate(handle, item).await?;
                    }
                }
            } else {
                // Launch concurrent siblings before any of them can suspend the run
                let mut held = VecDeque::new();
                while let Some(item) = ready.pop_front() {
                    if item.concurrent && !is_gate(handle, &item.node) {
                        self.dispatch(handle, item, &mut in_flight, &mut tasks).await?;
                    } else {
                        held.push_back(item);
                    }
                }
                ready = held;

                let next = match ready.iter().position(|item| item.concurrent) {
                    Some(pos) => ready.remove(pos),
                    None if in_flight.is_empty() => ready.pop_front(),
                    None => None,
                };
                if let Some(item) = next {
                    suspended = self.dispatch(handle, item, &mut in_flight, &mut tasks).await?;
                }
            }

            if in_flight.is_empty() {
                if suspended {
                    let mut state = handle.state.lock().await;
                    if state.status.is_terminal() {
                        return Ok(());
                    }
                    if let Some((gate, decision)) = state.resume.take() {
                        drop(state);
                        suspended = false;
                        self.complete(handle, &gate.node, gate.concurrent, decision, &mut ready)
                            .await?;
                        continue;
                    }

                    state.parked.extend(ready.drain(..));
                    state.driver_active = false;
                    state.touch();
                    tracing::info!(
                        "Run suspended awaiting approval: run_id={}, parked={}",
                        handle.run_id,
                        state.parked.len()
                    );
                    return Ok(());
                }

                if ready.is_empty() {
                    return self.finish(handle).await;
                }
                continue;
            }

            match in_flight.join_next_with_id().await {
                Some(Ok((task_id, done))) => {
                    tasks.remove(&task_id);
                    let output = done.result?;
                    self.complete(handle, &done.node, done.concurrent, output, &mut ready)
                        .await?;
                }
                Some(Err(join_error)) => {
                    return Err(lost_task(&mut tasks, join_error).into());
                }
                None => {}
            }
        }
    }

    /// Start one work item. Returns true if the item suspended the run.
    async fn dispatch(
        &self,
        handle: &Arc<RunHandle>,
        item: WorkItem,
        in_flight: &mut JoinSet<Completion>,
        tasks: &mut HashMap<task::Id, NodeId>,
    ) -> EngineResult<bool> {
        let node = lookup(&handle.definition, &item.node)?;
        if node.kind() == NodeKind::ApprovalGate {
            self.open_gate(handle, item).await?;
            return Ok(true);
        }

        if let Some(step) = &node.step {
            let label = step.label.clone();
            handle.events.update_status(|status| status.current_step = label);
        }
        handle.state.lock().await.dispatched(&item.node);

        tracing::debug!(
            "Dispatching node: run_id={}, node={}, kind={:?}",
            handle.run_id,
            node.id,
            node.kind()
        );

        let ctx = NodeContext::new(
            handle.run_id,
            node.id.clone(),
            node.label(),
            self.output_sink.clone().unwrap_or_else(|| handle.events.clone()),
            self.config.clone(),
        );
        let executor = node.executor.clone();
        let WorkItem {
            node,
            input,
            concurrent,
        } = item;

        let task_node = node.clone();
        let abort = in_flight.spawn(async move {
            let result = AssertUnwindSafe(executor::invoke(&executor, input, &ctx))
                .catch_unwind()
                .await
                .unwrap_or_else(|panic| {
                    Err(ExecutorError::Panicked {
                        node: node.clone(),
                        message: panic_message(panic.as_ref()),
                    })
                });
            Completion {
                node,
                concurrent,
                result,
            }
        });
        tasks.insert(abort.id(), task_node);

        Ok(false)
    }

    /// Suspend the run at an approval gate
    async fn open_gate(&self, handle: &Arc<RunHandle>, item: WorkItem) -> EngineResult<()> {
        let run_id = handle.run_id;
        let node = lookup(&handle.definition, &item.node)?;
        let Executor::ApprovalGate(prompt) = &node.executor else {
            return Err(ExecutorError::failed(item.node, "not an approval gate").into());
        };

        let request = {
            let mut state = handle.state.lock().await;
            if state.status == RunStatus::WaitingApproval {
                return Err(SuspendedStateError::AlreadyWaiting {
                    run_id,
                    node: item.node,
                }
                .into());
            }
            if state.approval_resolved {
                return Err(SuspendedStateError::AlreadyResolved {
                    run_id,
                    node: item.node,
                }
                .into());
            }

            let request = prompt.request(&item.input);
            state.status = RunStatus::WaitingApproval;
            state.pending_approval = Some(PendingApproval {
                node: item.node.clone(),
                request: request.clone(),
                requested_at: Utc::now(),
                subject: item.input,
                concurrent: item.concurrent,
            });

            if let Some(timeout) = self.config.approval_timeout() {
                let token = CancellationToken::new();
                state.approval_timer = Some(token.clone());
                self.spawn_approval_timer(run_id, timeout, token);
            }
            state.touch();
            request
        };

        let label = node.label().to_string();
        handle.events.update_status(|status| status.current_step = label);
        handle
            .events
            .publish(EventType::ApprovalRequested(ApprovalRequestEvent {
                node_id: node.id.clone(),
                question: request.question,
                context: request.context,
            }));

        tracing::info!(
            "Run awaiting approval: run_id={}, node={}",
            run_id,
            node.id
        );
        Ok(())
    }

    fn spawn_approval_timer(&self, run_id: RunId, timeout: Duration, token: CancellationToken) {
        let runner = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(timeout) => runner.expire_approval(run_id, timeout).await,
            }
        });
    }

    async fn expire_approval(&self, run_id: RunId, timeout: Duration) {
        let after_secs = timeout.as_secs();
        tracing::warn!(
            "Approval timed out: run_id={}, after={}s, policy={:?}",
            run_id,
            after_secs,
            self.config.timeout_policy
        );

        match self.config.timeout_policy {
            TimeoutPolicy::Reject => {
                let response =
                    ApprovalResponse::reject(format!("approval timed out after {}s", after_secs));
                if let Err(e) = self.resolve_approval(run_id, response, TIMEOUT_SOURCE).await {
                    tracing::debug!("Ignoring expired approval timer: run_id={}, {}", run_id, e);
                }
            }
            TimeoutPolicy::Fail => {
                let Ok(handle) = self.store.get(run_id).await else {
                    return;
                };
                {
                    let mut state = handle.state.lock().await;
                    if state.status != RunStatus::WaitingApproval {
                        return;
                    }
                    state.pending_approval = None;
                    state.approval_timer = None;
                }
                handle.events.clear_pending_approval();
                self.fail_run(&handle, TimeoutError { run_id, after_secs }.into())
                    .await;
            }
        }
    }

    /// Record a finished node and route its output
    async fn complete(
        &self,
        handle: &Arc<RunHandle>,
        node_id: &NodeId,
        concurrent: bool,
        output: Message,
        ready: &mut VecDeque<WorkItem>,
    ) -> EngineResult<()> {
        let definition = &handle.definition;
        let node = lookup(definition, node_id)?;

        tracing::debug!(
            "Node completed: run_id={}, node={}, output={}",
            handle.run_id,
            node_id,
            output.kind()
        );

        if let Some(step) = &node.step {
            let label = step.label.clone();
            let percent = step.percent;
            handle.events.update_status(|status| {
                if !status.completed_steps.contains(&label) {
                    status.completed_steps.push(label);
                }
                status.progress = status.progress.max(percent);
            });
        }

        let targets = definition.route(node_id, &output)?;
        let fans_out = node.kind() == NodeKind::FanoutDispatcher;

        let mut state = handle.state.lock().await;
        state.resolved(node_id);

        if let Some(outcome) = definition.terminal_outcome(node_id) {
            if state.result.is_none() {
                state.result = Some(TerminalResult::from_output(node_id.clone(), outcome, &output));
                state.output = Some(output.clone());
            } else {
                tracing::warn!(
                    "Ignoring second terminal: run_id={}, node={}",
                    handle.run_id,
                    node_id
                );
            }
        }

        for target in targets {
            let target_node = lookup(definition, &target)?;
            if target_node.kind() == NodeKind::Aggregator {
                let arity = definition.arity(&target);
                if let Some(branches) =
                    state.record_branch(&target, node_id.clone(), output.clone(), arity)?
                {
                    ready.push_back(WorkItem {
                        node: target,
                        input: Message::Merged(branches),
                        concurrent: false,
                    });
                }
            } else {
                ready.push_back(WorkItem {
                    node: target,
                    input: output.clone(),
                    concurrent: concurrent || fans_out,
                });
            }
        }

        Ok(())
    }

    /// No work left: complete at the terminal, or report why not
    async fn finish(&self, handle: &Arc<RunHandle>) -> EngineResult<()> {
        let result = {
            let mut state = handle.state.lock().await;
            let Some(result) = state.result.clone() else {
                let mut waiting: Vec<NodeId> = state.fan_in.keys().cloned().collect();
                waiting.sort();
                return Err(if waiting.is_empty() {
                    EngineError::NoTerminal
                } else {
                    EngineError::Stalled { waiting }
                });
            };

            state.status = RunStatus::Completed;
            state.driver_active = false;
            state.completed_at = Some(Utc::now());
            state.touch();
            result
        };

        handle.events.update_status(|status| {
            status.progress = 100;
            status.current_step = "Completed".to_string();
        });
        handle.events.publish(EventType::Completed(CompletionEvent {
            outcome: result.outcome,
            artifact: result.artifact,
            filename: result.filename,
        }));

        tracing::info!(
            "Workflow execution completed: run_id={}, outcome={}",
            handle.run_id,
            result.outcome
        );
        Ok(())
    }

    async fn fail_run(&self, handle: &Arc<RunHandle>, error: EngineError) {
        let message = error.to_string();
        {
            let mut state = handle.state.lock().await;
            if state.status.is_terminal() {
                return;
            }
            state.status = RunStatus::Failed;
            state.failure = Some(error);
            state.pending_approval = None;
            state.cancel_approval_timer();
            state.driver_active = false;
            state.completed_at = Some(Utc::now());
            state.touch();
        }

        tracing::error!(
            "Workflow execution failed: run_id={}, error={}",
            handle.run_id,
            message
        );
        handle.events.publish(EventType::Error(ErrorEvent { message }));
    }
}

/// Run a nested workflow to completion and return its terminal output.
///
/// Node output events go to `outputs`; status and lifecycle events stay in
/// the nested run. Boxed because a subworkflow may contain subworkflows.
pub(crate) fn run_nested(
    definition: Arc<WorkflowDefinition>,
    input: Message,
    config: Arc<EngineConfig>,
    outputs: Arc<EventStream>,
) -> BoxFuture<'static, EngineResult<Message>> {
    async move {
        let runner = WorkflowRunner {
            store: Arc::new(RunStore::new()),
            config,
            output_sink: Some(outputs),
        };
        let handle = runner.create_run(definition, input).await?;
        runner.drive(handle.clone()).await;

        let state = handle.state.lock().await;
        match (state.status, &state.output) {
            (RunStatus::Completed, Some(output)) => Ok(output.clone()),
            _ => Err(state.failure.clone().unwrap_or(EngineError::NoTerminal)),
        }
    }
    .boxed()
}

fn lookup<'a>(definition: &'a WorkflowDefinition, id: &NodeId) -> Result<&'a Node, ExecutorError> {
    definition
        .node(id)
        .ok_or_else(|| ExecutorError::failed(id.clone(), "node is not part of the workflow"))
}

fn is_gate(handle: &RunHandle, id: &NodeId) -> bool {
    handle
        .definition
        .node(id)
        .map(|n| n.kind() == NodeKind::ApprovalGate)
        .unwrap_or(false)
}

/// A spawned node task that died outside its own panic guard
fn lost_task(tasks: &mut HashMap<task::Id, NodeId>, join_error: task::JoinError) -> ExecutorError {
    let node = tasks
        .remove(&join_error.id())
        .unwrap_or_else(|| NodeId::new("unknown"));
    ExecutorError::Panicked {
        node,
        message: join_error.to_string(),
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::approval::FixedQuestion;
    use crate::config::TimeoutPolicy;
    use crate::events::Event;
    use crate::types::{Artifact, Outcome};
    use crate::workflow::builder::WorkflowBuilder;
    use crate::workflow::graph::Condition;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn echo() -> Executor {
        Executor::task_fn(|input, _ctx| async move { Ok(input) })
    }

    fn reply(text: &'static str, delay_ms: u64) -> Executor {
        Executor::task_fn(move |_input, _ctx| async move {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            Ok(Message::text(text))
        })
    }

    fn save_as(prefix: &'static str) -> Executor {
        Executor::task_fn(move |input, _ctx| async move {
            let decision = input
                .as_decision()
                .cloned()
                .ok_or_else(|| ExecutorError::failed(prefix, "expected a decision"))?;
            Ok(Message::Artifact(Artifact {
                content: format!(
                    "{}: {} ({})",
                    prefix,
                    decision.subject.render(),
                    decision.feedback.unwrap_or_default()
                ),
                filename: Some(format!("{}.md", prefix)),
            }))
        })
    }

    fn gated() -> Arc<WorkflowDefinition> {
        let mut builder = WorkflowBuilder::new("gated");
        builder
            .add_node("draft", Executor::task_fn(|_input, _ctx| async move { Ok(Message::text("report")) }))
            .add_node("review", Executor::approval_gate(FixedQuestion::new("Ship it?")))
            .add_node("approved", save_as("approved"))
            .add_node("rejected", save_as("rejected"))
            .add_edge("draft", "review")
            .add_conditional_edge("review", "approved", Condition::approved())
            .add_conditional_edge("review", "rejected", Condition::rejected())
            .describe("review", "Human Review", 90)
            .set_start("draft")
            .set_terminal("approved", Outcome::Approved)
            .set_terminal("rejected", Outcome::Rejected);
        Arc::new(builder.build().unwrap())
    }

    async fn wait_for(runner: &WorkflowRunner, run_id: RunId, status: RunStatus) -> RunSnapshot {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let snapshot = runner.snapshot(run_id).await.unwrap();
                if snapshot.status == status {
                    return snapshot;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("run did not reach expected status")
    }

    async fn events(runner: &WorkflowRunner, run_id: RunId) -> Vec<Event> {
        let sub = runner.subscribe(run_id).await.unwrap();
        tokio::time::timeout(Duration::from_secs(3600), sub.collect())
            .await
            .expect("event stream did not close")
    }

    fn completion(events: &[Event]) -> CompletionEvent {
        match &events.last().unwrap().event_type {
            EventType::Completed(done) => done.clone(),
            other => panic!("expected completion, got {:?}", other),
        }
    }

    fn error_message(events: &[Event]) -> String {
        match &events.last().unwrap().event_type {
            EventType::Error(err) => err.message.clone(),
            other => panic!("expected error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_linear_run_completes() {
        let mut builder = WorkflowBuilder::new("linear");
        builder
            .add_node("upper", Executor::task_fn(|input, _ctx| async move {
                Ok(Message::text(input.render().to_uppercase()))
            }))
            .add_node("done", echo())
            .add_edge("upper", "done")
            .describe("upper", "Shout", 50)
            .set_start("upper");
        let runner = WorkflowRunner::new(EngineConfig::default());

        let run_id = runner
            .start_run(Arc::new(builder.build().unwrap()), Message::text("hi"))
            .await
            .unwrap();
        let events = events(&runner, run_id).await;

        let done = completion(&events);
        assert_eq!(done.outcome, Outcome::Completed);
        assert_eq!(done.artifact, "HI");

        let snapshot = runner.snapshot(run_id).await.unwrap();
        assert_eq!(snapshot.status, RunStatus::Completed);
        assert!(snapshot.frontier.is_empty());
        assert!(snapshot.completed_at.is_some());

        let status = runner.store.get(run_id).await.unwrap().events.status();
        assert_eq!(status.progress, 100);
        assert_eq!(status.completed_steps, vec!["Shout".to_string()]);
    }

    #[tokio::test]
    async fn test_fan_in_waits_for_every_branch() {
        let merges = Arc::new(AtomicUsize::new(0));
        let counter = merges.clone();

        let mut builder = WorkflowBuilder::new("fan");
        builder
            .add_node("dispatch", Executor::fanout())
            .add_node("market", reply("positive", 30))
            .add_node("design", reply("negative", 5))
            .add_node("production", reply("feasible", 15))
            .add_node(
                "merge",
                Executor::merge_fn(move |branches| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(Message::Merged(branches))
                })
                .with_arity(3),
            )
            .add_edge("dispatch", "market")
            .add_edge("dispatch", "design")
            .add_edge("dispatch", "production")
            .add_edge("market", "merge")
            .add_edge("design", "merge")
            .add_edge("production", "merge")
            .set_start("dispatch");
        let runner = WorkflowRunner::new(EngineConfig::default());

        let run_id = runner
            .start_run(Arc::new(builder.build().unwrap()), Message::text("concept"))
            .await
            .unwrap();
        let events = events(&runner, run_id).await;

        assert_eq!(merges.load(Ordering::SeqCst), 1);
        let artifact = completion(&events).artifact;
        assert_eq!(
            artifact,
            "## design\n\nnegative\n\n## market\n\npositive\n\n## production\n\nfeasible"
        );
    }

    fn fan_in_with_delays(market_ms: u64, design_ms: u64, production_ms: u64) -> Arc<WorkflowDefinition> {
        let mut builder = WorkflowBuilder::new("fan");
        builder
            .add_node("dispatch", Executor::fanout())
            .add_node("market", reply("positive", market_ms))
            .add_node("design", reply("negative", design_ms))
            .add_node("production", reply("feasible", production_ms))
            .add_node("merge", Executor::aggregator().with_arity(3))
            .add_edge("dispatch", "market")
            .add_edge("dispatch", "design")
            .add_edge("dispatch", "production")
            .add_edge("market", "merge")
            .add_edge("design", "merge")
            .add_edge("production", "merge")
            .set_start("dispatch");
        Arc::new(builder.build().unwrap())
    }

    #[tokio::test]
    async fn test_fan_in_result_ignores_completion_order() {
        let runner = WorkflowRunner::new(EngineConfig::default());

        let mut artifacts = Vec::new();
        for (market, design, production) in [(30, 5, 15), (5, 15, 30), (15, 30, 5)] {
            let run_id = runner
                .start_run(fan_in_with_delays(market, design, production), Message::text("concept"))
                .await
                .unwrap();
            artifacts.push(completion(&events(&runner, run_id).await).artifact);
        }

        assert_eq!(
            artifacts[0],
            "## design\n\nnegative\n\n## market\n\npositive\n\n## production\n\nfeasible"
        );
        assert!(artifacts.iter().all(|artifact| artifact == &artifacts[0]));
    }

    #[tokio::test]
    async fn test_approval_round_trip_approve() {
        let runner = WorkflowRunner::new(EngineConfig::default());
        let run_id = runner.start_run(gated(), Message::text("in")).await.unwrap();

        let snapshot = wait_for(&runner, run_id, RunStatus::WaitingApproval).await;
        let pending = snapshot.pending_approval.unwrap();
        assert_eq!(pending.node, NodeId::new("review"));
        assert_eq!(pending.request.question, "Ship it?");
        assert_eq!(pending.request.context, "report");

        runner
            .submit_approval_response(run_id, ApprovalResponse::approve())
            .await
            .unwrap();
        let events = events(&runner, run_id).await;

        let done = completion(&events);
        assert_eq!(done.outcome, Outcome::Approved);
        assert_eq!(done.filename.as_deref(), Some("approved.md"));
        assert!(done.artifact.starts_with("approved: report"));

        assert!(events.iter().any(|e| matches!(
            &e.event_type,
            EventType::Output(out) if out.kind == OutputKind::Decision && out.content == "Decision: APPROVED"
        )));

        let err = runner
            .submit_approval_response(run_id, ApprovalResponse::approve())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::Suspended(SuspendedStateError::NotWaiting { status: RunStatus::Completed, .. })
        ));
    }

    #[tokio::test]
    async fn test_approval_round_trip_reject_keeps_feedback() {
        let runner = WorkflowRunner::new(EngineConfig::default());
        let run_id = runner.start_run(gated(), Message::text("in")).await.unwrap();
        wait_for(&runner, run_id, RunStatus::WaitingApproval).await;

        runner
            .submit_approval_response(run_id, ApprovalResponse::reject("too expensive"))
            .await
            .unwrap();
        let done = completion(&events(&runner, run_id).await);

        assert_eq!(done.outcome, Outcome::Rejected);
        assert_eq!(done.artifact, "rejected: report (too expensive)");
    }

    #[tokio::test]
    async fn test_response_to_unknown_run() {
        let runner = WorkflowRunner::new(EngineConfig::default());
        let run_id = RunId::new();
        assert_eq!(
            runner
                .submit_approval_response(run_id, ApprovalResponse::approve())
                .await
                .unwrap_err(),
            EngineError::RunNotFound(run_id)
        );
    }

    #[tokio::test]
    async fn test_late_subscriber_sees_pending_approval() {
        let runner = WorkflowRunner::new(EngineConfig::default());
        let run_id = runner.start_run(gated(), Message::text("in")).await.unwrap();
        wait_for(&runner, run_id, RunStatus::WaitingApproval).await;

        let mut sub = runner.subscribe(run_id).await.unwrap();
        match sub.next().await.unwrap().event_type {
            EventType::Status(status) => assert_eq!(status.current_step, "Human Review"),
            other => panic!("expected status, got {:?}", other),
        }
        match sub.next().await.unwrap().event_type {
            EventType::ApprovalRequested(request) => assert_eq!(request.node_id, NodeId::new("review")),
            other => panic!("expected approval request, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_node_failure_fails_run() {
        let mut builder = WorkflowBuilder::new("failing");
        builder
            .add_node("dispatch", Executor::fanout())
            .add_node("ok", reply("fine", 200))
            .add_node("bad", Executor::task_fn(|_input, ctx| async move {
                Err(ctx.fail("agent unavailable"))
            }))
            .add_node("merge", Executor::aggregator())
            .add_edge("dispatch", "ok")
            .add_edge("dispatch", "bad")
            .add_edge("ok", "merge")
            .add_edge("bad", "merge")
            .set_start("dispatch");
        let runner = WorkflowRunner::new(EngineConfig::default());

        let run_id = runner
            .start_run(Arc::new(builder.build().unwrap()), Message::text("x"))
            .await
            .unwrap();
        let events = events(&runner, run_id).await;

        assert_eq!(error_message(&events), "node 'bad' failed: agent unavailable");
        let snapshot = runner.snapshot(run_id).await.unwrap();
        assert_eq!(snapshot.status, RunStatus::Failed);
        assert!(snapshot.result.is_none());
    }

    #[tokio::test]
    async fn test_panicking_task_fails_run() {
        let mut builder = WorkflowBuilder::new("panics");
        builder
            .add_node("boom", Executor::task_fn(|_input, _ctx| async move {
                if true {
                    panic!("kaboom");
                }
                Ok(Message::text("unreachable"))
            }))
            .set_start("boom");
        let runner = WorkflowRunner::new(EngineConfig::default());

        let run_id = runner
            .start_run(Arc::new(builder.build().unwrap()), Message::text("x"))
            .await
            .unwrap();
        let message = error_message(&events(&runner, run_id).await);
        assert_eq!(message, "node 'boom' panicked: kaboom");
    }

    #[tokio::test]
    async fn test_unmatched_predicate_fails_run() {
        let mut builder = WorkflowBuilder::new("routing");
        builder
            .add_node("start", echo())
            .add_node("long", echo())
            .add_conditional_edge("start", "long", Condition::predicate("long", |m| m.render().len() > 10))
            .set_start("start");
        let runner = WorkflowRunner::new(EngineConfig::default());

        let run_id = runner
            .start_run(Arc::new(builder.build().unwrap()), Message::text("short"))
            .await
            .unwrap();
        let message = error_message(&events(&runner, run_id).await);
        assert!(message.contains("no outgoing condition of 'start'"));
    }

    #[tokio::test]
    async fn test_concurrent_branches_drain_while_suspended() {
        let after_slow = Arc::new(AtomicUsize::new(0));
        let counter = after_slow.clone();

        let mut builder = WorkflowBuilder::new("drain");
        builder
            .add_node("dispatch", Executor::fanout())
            .add_node("review", Executor::approval_gate(FixedQuestion::default()))
            .add_node("slow", reply("slow done", 40))
            .add_node("after_slow", Executor::task_fn(move |input, _ctx| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(input)
                }
            }))
            .add_node("accepted", echo())
            .add_node("declined", echo())
            .add_edge("dispatch", "review")
            .add_edge("dispatch", "slow")
            .add_edge("slow", "after_slow")
            .add_conditional_edge("review", "accepted", Condition::approved())
            .add_conditional_edge("review", "declined", Condition::rejected())
            .set_start("dispatch")
            .set_terminal("accepted", Outcome::Approved)
            .set_terminal("declined", Outcome::Rejected);
        let runner = WorkflowRunner::new(EngineConfig::default());

        let run_id = runner
            .start_run(Arc::new(builder.build().unwrap()), Message::text("x"))
            .await
            .unwrap();

        // The slow branch finishes but its successor stays parked
        let snapshot = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let snapshot = runner.snapshot(run_id).await.unwrap();
                if snapshot.ready == vec![NodeId::new("after_slow")] {
                    return snapshot;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(snapshot.status, RunStatus::WaitingApproval);
        assert!(snapshot.frontier.is_empty());
        assert_eq!(after_slow.load(Ordering::SeqCst), 0);

        runner
            .submit_approval_response(run_id, ApprovalResponse::approve())
            .await
            .unwrap();
        let done = completion(&events(&runner, run_id).await);

        assert_eq!(done.outcome, Outcome::Approved);
        assert_eq!(after_slow.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_second_gate_after_resolution_fails() {
        let mut builder = WorkflowBuilder::new("two-gates");
        builder
            .add_node("first", Executor::approval_gate(FixedQuestion::default()))
            .add_node("second", Executor::approval_gate(FixedQuestion::default()))
            .add_node("stop", echo())
            .add_node("yes", echo())
            .add_node("no", echo())
            .add_conditional_edge("first", "second", Condition::approved())
            .add_conditional_edge("first", "stop", Condition::rejected())
            .add_conditional_edge("second", "yes", Condition::approved())
            .add_conditional_edge("second", "no", Condition::rejected())
            .set_start("first");
        let runner = WorkflowRunner::new(EngineConfig::default());

        let run_id = runner
            .start_run(Arc::new(builder.build().unwrap()), Message::text("x"))
            .await
            .unwrap();
        wait_for(&runner, run_id, RunStatus::WaitingApproval).await;
        runner
            .submit_approval_response(run_id, ApprovalResponse::approve())
            .await
            .unwrap();

        let message = error_message(&events(&runner, run_id).await);
        assert!(message.contains("finished its approval round-trip"));
    }

    #[tokio::test]
    async fn test_gate_reached_while_waiting_fails() {
        let mut builder = WorkflowBuilder::new("double-entry");
        builder
            .add_node("dispatch", Executor::fanout())
            .add_node("polish", reply("polished", 5))
            .add_node("review", Executor::approval_gate(FixedQuestion::default()))
            .add_node("yes", echo())
            .add_node("no", echo())
            .add_edge("dispatch", "review")
            .add_edge("dispatch", "polish")
            .add_edge("polish", "review")
            .add_conditional_edge("review", "yes", Condition::approved())
            .add_conditional_edge("review", "no", Condition::rejected())
            .set_start("dispatch");
        let runner = WorkflowRunner::new(EngineConfig::default());

        let run_id = runner
            .start_run(Arc::new(builder.build().unwrap()), Message::text("x"))
            .await
            .unwrap();
        let message = error_message(&events(&runner, run_id).await);

        assert!(message.contains("approval gate 'review' reached while run"));
        assert!(message.contains("already awaiting approval"));
        let snapshot = runner.snapshot(run_id).await.unwrap();
        assert_eq!(snapshot.status, RunStatus::Failed);
        assert!(snapshot.pending_approval.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_approval_timeout_rejects() {
        let config = EngineConfig::default().with_approval_timeout(300, TimeoutPolicy::Reject);
        let runner = WorkflowRunner::new(config);
        let run_id = runner.start_run(gated(), Message::text("in")).await.unwrap();

        let events = events(&runner, run_id).await;
        let done = completion(&events);
        assert_eq!(done.outcome, Outcome::Rejected);
        assert!(done.artifact.contains("approval timed out after 300s"));

        let deciders: Vec<&str> = events
            .iter()
            .filter_map(|e| match &e.event_type {
                EventType::Output(out) if out.kind == OutputKind::Decision => Some(out.source.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(deciders, vec!["Approval Timeout"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_approval_timeout_fails_run() {
        let config = EngineConfig::default().with_approval_timeout(60, TimeoutPolicy::Fail);
        let runner = WorkflowRunner::new(config);
        let run_id = runner.start_run(gated(), Message::text("in")).await.unwrap();

        let message = error_message(&events(&runner, run_id).await);
        assert_eq!(
            message,
            TimeoutError {
                run_id,
                after_secs: 60
            }
            .to_string()
        );
        assert!(matches!(
            runner.snapshot(run_id).await.unwrap().status,
            RunStatus::Failed
        ));
    }

    #[tokio::test]
    async fn test_answer_before_timeout_cancels_timer() {
        let config = EngineConfig::default().with_approval_timeout(3600, TimeoutPolicy::Fail);
        let runner = WorkflowRunner::new(config);
        let run_id = runner.start_run(gated(), Message::text("in")).await.unwrap();
        wait_for(&runner, run_id, RunStatus::WaitingApproval).await;

        runner
            .submit_approval_response(run_id, ApprovalResponse::approve())
            .await
            .unwrap();
        assert_eq!(
            completion(&events(&runner, run_id).await).outcome,
            Outcome::Approved
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_retention_sweep_evicts_finished_runs_only() {
        let runner = WorkflowRunner::new(EngineConfig::default().with_retention(0));
        let sweep = runner.spawn_retention_sweep().unwrap();

        let mut builder = WorkflowBuilder::new("linear");
        builder.add_node("only", echo()).set_start("only");
        let finished = runner
            .start_run(Arc::new(builder.build().unwrap()), Message::text("x"))
            .await
            .unwrap();
        completion(&events(&runner, finished).await);
        let waiting = runner.start_run(gated(), Message::text("in")).await.unwrap();
        wait_for(&runner, waiting, RunStatus::WaitingApproval).await;

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(
            runner.snapshot(finished).await.unwrap_err(),
            EngineError::RunNotFound(finished)
        );
        assert_eq!(
            runner.snapshot(waiting).await.unwrap().status,
            RunStatus::WaitingApproval
        );
        sweep.abort();
    }

    #[test]
    fn test_no_sweep_without_retention() {
        let runner = WorkflowRunner::new(EngineConfig::default());
        assert!(runner.spawn_retention_sweep().is_none());
    }

    #[tokio::test]
    async fn test_lost_task_names_its_node() {
        let mut set: JoinSet<()> = JoinSet::new();
        let mut tasks = HashMap::new();
        let abort = set.spawn(async { panic!("escaped the guard") });
        tasks.insert(abort.id(), NodeId::new("market"));

        let join_error = set.join_next().await.unwrap().unwrap_err();
        match lost_task(&mut tasks, join_error) {
            ExecutorError::Panicked { node, .. } => assert_eq!(node, NodeId::new("market")),
            other => panic!("expected panic error, got {:?}", other),
        }
        assert!(tasks.is_empty());
    }

    fn analysis_subworkflow() -> Arc<WorkflowDefinition> {
        let mut builder = WorkflowBuilder::new("analysis");
        builder
            .add_node("dispatch", Executor::fanout())
            .add_node("a", reply("alpha", 5))
            .add_node("b", reply("beta", 1))
            .add_node("merge", Executor::aggregator())
            .add_edge("dispatch", "a")
            .add_edge("dispatch", "b")
            .add_edge("a", "merge")
            .add_edge("b", "merge")
            .set_start("dispatch");
        Arc::new(builder.build().unwrap())
    }

    #[tokio::test]
    async fn test_subworkflow_runs_as_single_step() {
        let mut builder = WorkflowBuilder::new("outer");
        builder
            .add_node("nested", Executor::subworkflow(analysis_subworkflow()))
            .add_node("count", Executor::task_fn(|input, _ctx| async move {
                match input {
                    Message::Merged(branches) => Ok(Message::text(branches.len().to_string())),
                    other => Err(ExecutorError::failed("count", other.kind())),
                }
            }))
            .add_edge("nested", "count")
            .set_start("nested");
        let runner = WorkflowRunner::new(EngineConfig::default());

        let run_id = runner
            .start_run(Arc::new(builder.build().unwrap()), Message::text("x"))
            .await
            .unwrap();
        assert_eq!(completion(&events(&runner, run_id).await).artifact, "2");

        // Nested runs live in their own store
        assert_eq!(runner.list_runs().await.len(), 1);
    }

    #[tokio::test]
    async fn test_subworkflow_failure_is_opaque() {
        let mut inner = WorkflowBuilder::new("inner");
        inner
            .add_node("secret_step", Executor::task_fn(|_input, ctx| async move {
                Err(ctx.fail("hidden detail"))
            }))
            .set_start("secret_step");
        let mut outer = WorkflowBuilder::new("outer");
        outer
            .add_node("nested", Executor::subworkflow(Arc::new(inner.build().unwrap())))
            .set_start("nested");
        let runner = WorkflowRunner::new(EngineConfig::default());

        let run_id = runner
            .start_run(Arc::new(outer.build().unwrap()), Message::text("x"))
            .await
            .unwrap();
        let message = error_message(&events(&runner, run_id).await);

        assert_eq!(message, "subworkflow 'inner' at node 'nested' failed");
        assert!(!message.contains("secret_step"));
    }
}
