use super::graph::{NodeKind, WorkflowDefinition};
use super::runner;
use crate::approval::ApprovalPrompt;
use crate::config::EngineConfig;
use crate::error::ExecutorError;
use crate::events::{EventStream, OutputKind};
use crate::types::{BranchId, Message, NodeId, RunId};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

/// Handle given to a node while it runs
#[derive(Clone)]
pub struct NodeContext {
    run_id: RunId,
    node_id: NodeId,
    label: String,
    events: Arc<EventStream>,
    config: Arc<EngineConfig>,
}

impl NodeContext {
    pub(crate) fn new(
        run_id: RunId,
        node_id: NodeId,
        label: impl Into<String>,
        events: Arc<EventStream>,
        config: Arc<EngineConfig>,
    ) -> Self {
        Self {
            run_id,
            node_id,
            label: label.into(),
            events,
            config,
        }
    }

    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Publish an output event attributed to this node
    pub fn emit(&self, kind: OutputKind, content: impl Into<String>) {
        self.events.output(self.label.clone(), content, kind);
    }

    /// Same as `emit`, under a different source name
    pub fn emit_as(&self, source: impl Into<String>, kind: OutputKind, content: impl Into<String>) {
        self.events.output(source, content, kind);
    }

    pub fn fail(&self, message: impl Into<String>) -> ExecutorError {
        ExecutorError::failed(self.node_id.clone(), message)
    }
}

/// User-supplied unit of work
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn run(&self, input: Message, ctx: &NodeContext) -> Result<Message, ExecutorError>;
}

struct FnTask<F>(F);

#[async_trait]
impl<F, Fut> TaskHandler for FnTask<F>
where
    F: Fn(Message, NodeContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Message, ExecutorError>> + Send + 'static,
{
    async fn run(&self, input: Message, ctx: &NodeContext) -> Result<Message, ExecutorError> {
        (self.0)(input, ctx.clone()).await
    }
}

/// Combines the buffered branch outputs of an aggregator
pub trait MergeHandler: Send + Sync {
    fn merge(&self, branches: BTreeMap<BranchId, Message>) -> Result<Message, ExecutorError>;
}

/// Default merge: the branch map as a single `Message::Merged`
#[derive(Debug, Clone, Copy, Default)]
pub struct MergeAll;

impl MergeHandler for MergeAll {
    fn merge(&self, branches: BTreeMap<BranchId, Message>) -> Result<Message, ExecutorError> {
        Ok(Message::Merged(branches))
    }
}

struct FnMerge<F>(F);

impl<F> MergeHandler for FnMerge<F>
where
    F: Fn(BTreeMap<BranchId, Message>) -> Result<Message, ExecutorError> + Send + Sync,
{
    fn merge(&self, branches: BTreeMap<BranchId, Message>) -> Result<Message, ExecutorError> {
        (self.0)(branches)
    }
}

/// What a node does when it runs
#[derive(Clone)]
pub enum Executor {
    Task(Arc<dyn TaskHandler>),
    /// Forwards its input unchanged to every outgoing edge
    Fanout,
    Aggregator {
        merge: Arc<dyn MergeHandler>,
        /// Checked against the number of incoming branches at build time
        arity: Option<usize>,
    },
    ApprovalGate(Arc<dyn ApprovalPrompt>),
    /// Runs a nested workflow to completion as a single step
    Subworkflow(Arc<WorkflowDefinition>),
}

impl Executor {
    pub fn task(handler: impl TaskHandler + 'static) -> Self {
        Executor::Task(Arc::new(handler))
    }

    /// Task from an async closure
    pub fn task_fn<F, Fut>(f: F) -> Self
    where
        F: Fn(Message, NodeContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Message, ExecutorError>> + Send + 'static,
    {
        Executor::Task(Arc::new(FnTask(f)))
    }

    pub fn fanout() -> Self {
        Executor::Fanout
    }

    pub fn aggregator() -> Self {
        Self::aggregator_with(MergeAll)
    }

    pub fn aggregator_with(merge: impl MergeHandler + 'static) -> Self {
        Executor::Aggregator {
            merge: Arc::new(merge),
            arity: None,
        }
    }

    pub fn merge_fn<F>(f: F) -> Self
    where
        F: Fn(BTreeMap<BranchId, Message>) -> Result<Message, ExecutorError> + Send + Sync + 'static,
    {
        Self::aggregator_with(FnMerge(f))
    }

    /// Declare how many branches an aggregator expects. No effect on other executors.
    pub fn with_arity(self, expected: usize) -> Self {
        match self {
            Executor::Aggregator { merge, .. } => Executor::Aggregator {
                merge,
                arity: Some(expected),
            },
            other => other,
        }
    }

    pub fn approval_gate(prompt: impl ApprovalPrompt + 'static) -> Self {
        Executor::ApprovalGate(Arc::new(prompt))
    }

    pub fn subworkflow(definition: Arc<WorkflowDefinition>) -> Self {
        Executor::Subworkflow(definition)
    }

    pub fn kind(&self) -> NodeKind {
        match self {
            Executor::Task(_) => NodeKind::Task,
            Executor::Fanout => NodeKind::FanoutDispatcher,
            Executor::Aggregator { .. } => NodeKind::Aggregator,
            Executor::ApprovalGate(_) => NodeKind::ApprovalGate,
            Executor::Subworkflow(_) => NodeKind::Subworkflow,
        }
    }
}

impl std::fmt::Debug for Executor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Executor::Subworkflow(def) => f.debug_tuple("Subworkflow").field(&def.name()).finish(),
            Executor::Aggregator { arity, .. } => {
                f.debug_struct("Aggregator").field("arity", arity).finish()
            }
            other => write!(f, "{:?}", other.kind()),
        }
    }
}

/// Run one node. Approval gates never get here; the runner resolves them.
pub(crate) async fn invoke(
    executor: &Executor,
    input: Message,
    ctx: &NodeContext,
) -> Result<Message, ExecutorError> {
    match executor {
        Executor::Task(handler) => handler.run(input, ctx).await,
        Executor::Fanout => Ok(input),
        Executor::Aggregator { merge, .. } => match input {
            Message::Merged(branches) => merge.merge(branches),
            other => Err(ctx.fail(format!(
                "aggregator expects buffered branches, got {}",
                other.kind()
            ))),
        },
        Executor::Subworkflow(definition) => {
            let workflow = definition.name().to_string();
            runner::run_nested(
                definition.clone(),
                input,
                ctx.config.clone(),
                ctx.events.clone(),
            )
            .await
            .map_err(|e| {
                tracing::warn!(
                    run_id = %ctx.run_id,
                    node = %ctx.node_id,
                    "Subworkflow {} failed: {}",
                    workflow,
                    e
                );
                ExecutorError::Subworkflow {
                    node: ctx.node_id.clone(),
                    workflow,
                }
            })
        }
        Executor::ApprovalGate(_) => Err(ctx.fail("approval gates are resolved by the runner")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context() -> NodeContext {
        let run_id = RunId::new();
        NodeContext::new(
            run_id,
            NodeId::new("node"),
            "Node",
            Arc::new(EventStream::new(run_id, 8)),
            Arc::new(EngineConfig::default()),
        )
    }

    struct Upper;

    #[async_trait]
    impl TaskHandler for Upper {
        async fn run(&self, input: Message, ctx: &NodeContext) -> Result<Message, ExecutorError> {
            let text = input.as_text().ok_or_else(|| ctx.fail("expected text"))?;
            Ok(Message::text(text.to_uppercase()))
        }
    }

    #[tokio::test]
    async fn test_task_handler() {
        let ctx = context();
        let output = invoke(&Executor::task(Upper), Message::text("hi"), &ctx)
            .await
            .unwrap();
        assert_eq!(output, Message::text("HI"));

        let err = invoke(&Executor::task(Upper), Message::Json(serde_json::json!(1)), &ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutorError::Failed { .. }));
    }

    #[tokio::test]
    async fn test_task_fn_emits_output() {
        let ctx = context();
        let mut sub = ctx.events.subscribe();
        let executor = Executor::task_fn(|input, ctx| async move {
            ctx.emit(OutputKind::Info, "working");
            Ok(input)
        });

        invoke(&executor, Message::text("x"), &ctx).await.unwrap();

        sub.next().await.unwrap();
        let event = sub.next().await.unwrap();
        match event.event_type {
            crate::events::EventType::Output(out) => {
                assert_eq!(out.source, "Node");
                assert_eq!(out.content, "working");
            }
            other => panic!("expected output, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_aggregator_merges_branches() {
        let ctx = context();
        let mut branches = BTreeMap::new();
        branches.insert(NodeId::new("a"), Message::text("1"));
        branches.insert(NodeId::new("b"), Message::text("2"));

        let joined = Executor::merge_fn(|branches| {
            Ok(Message::text(
                branches
                    .values()
                    .map(|m| m.render())
                    .collect::<Vec<_>>()
                    .join("+"),
            ))
        });
        let output = invoke(&joined, Message::Merged(branches.clone()), &ctx)
            .await
            .unwrap();
        assert_eq!(output, Message::text("1+2"));

        let output = invoke(&Executor::aggregator(), Message::Merged(branches.clone()), &ctx)
            .await
            .unwrap();
        assert_eq!(output, Message::Merged(branches));
    }

    #[test]
    fn test_with_arity_only_applies_to_aggregators() {
        match Executor::aggregator().with_arity(3) {
            Executor::Aggregator { arity, .. } => assert_eq!(arity, Some(3)),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(Executor::fanout().with_arity(3).kind(), NodeKind::FanoutDispatcher);
    }
}
