// Core engine for Conclave: graph workflows with fan-out, fan-in and human approval gates

pub mod approval;
pub mod concept;
pub mod config;
pub mod error;
pub mod events;
pub mod ingest;
pub mod storage;
pub mod types;
pub mod workflow;

pub use approval::{ApprovalPrompt, ApprovalRequest, ApprovalResponse, FixedQuestion};
pub use config::{EngineConfig, TimeoutPolicy};
pub use error::{
    EngineError, EngineResult, ExecutorError, RoutingError, SuspendedStateError, TimeoutError,
    ValidationError,
};
pub use events::{Event, EventStream, EventType, OutputKind, Subscription};
pub use types::*;
pub use workflow::{WorkflowBuilder, WorkflowDefinition, WorkflowRunner};
