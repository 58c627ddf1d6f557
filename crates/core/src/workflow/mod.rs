pub mod builder;
pub mod executor;
pub mod graph;
pub mod runner;
pub mod state;

pub use builder::WorkflowBuilder;
pub use executor::{Executor, MergeAll, MergeHandler, NodeContext, TaskHandler};
pub use graph::{Condition, Edge, Node, NodeKind, StepInfo, WorkflowDefinition};
pub use runner::WorkflowRunner;
pub use state::{PendingApproval, RunHandle, RunSnapshot, RunState, RunStore};
