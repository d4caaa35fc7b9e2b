pub mod agent_store;
pub mod reminder_store;
pub mod specialist_store;
pub mod workflow_run_store;
pub mod workflow_store;

pub use agent_store::AgentStore;
pub use reminder_store::ReminderStore;
pub use specialist_store::{SpecialistOverride, SpecialistOverrideStore};
pub use workflow_run_store::WorkflowRunStore;
pub use workflow_store::WorkflowStore;
