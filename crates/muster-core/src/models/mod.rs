pub mod agent;
pub mod reminder;
pub mod workflow;
pub mod workflow_run;

pub use agent::*;
pub use reminder::*;
pub use workflow::*;
pub use workflow_run::*;
