//! Workflow runs: YAML/graph definitions, the graph engine, and the run
//! service that owns the persisted status machine.

pub mod engine;
pub mod runs;
pub mod schema;

pub use engine::{
    AgentNodeExecutor, EngineError, NodeError, NodeExecutor, NodeRequest, ResumeState, RunProgress,
    WorkflowEngine,
};
pub use runs::{RunError, WorkflowRunService};
pub use schema::WorkflowDefinition;
