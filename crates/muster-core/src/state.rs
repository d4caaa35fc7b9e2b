//! Shared application state.

use std::sync::Arc;

use crate::config::MusterConfig;
use crate::db::Database;
use crate::error::ServerError;
use crate::llm::LlmClient;
use crate::orchestration::{Heap, LlmChooser, PendingPlanStore, Planner, SpecialistRegistry, SpecialistRunner};
use crate::scheduler::{ConversationSink, ReminderScheduler};
use crate::store::{AgentStore, ReminderStore, SpecialistOverrideStore, WorkflowRunStore, WorkflowStore};
use crate::tools::{BuiltinTools, ToolDispatcher};
use crate::trace::{JsonlTraceSink, PlannerTraceSink, TracingTraceSink};
use crate::workflow::{AgentNodeExecutor, WorkflowRunService};

pub struct AppStateInner {
    pub db: Database,
    pub config: MusterConfig,
    pub llm: Arc<dyn LlmClient>,
    pub agent_store: AgentStore,
    pub workflow_store: WorkflowStore,
    pub run_store: WorkflowRunStore,
    pub specialist_store: SpecialistOverrideStore,
    pub runs: WorkflowRunService,
    pub reminders: ReminderScheduler,
    pub tools: Arc<dyn ToolDispatcher>,
    pub registry: Arc<SpecialistRegistry>,
    pub pending_plans: Arc<PendingPlanStore>,
}

pub type AppState = Arc<AppStateInner>;

impl AppStateInner {
    /// Wire stores and services. Reminder timers are not restored here; call
    /// `reminders.restore()` from processes that stay up long enough to fire them.
    pub async fn new(
        db: Database,
        config: MusterConfig,
        llm: Arc<dyn LlmClient>,
        sink: Arc<dyn ConversationSink>,
    ) -> Result<Self, ServerError> {
        let agent_store = AgentStore::new(db.clone());
        let workflow_store = WorkflowStore::new(db.clone());
        let run_store = WorkflowRunStore::new(db.clone());
        let specialist_store = SpecialistOverrideStore::new(db.clone());

        let executor = Arc::new(AgentNodeExecutor::new(llm.clone(), config.llm.max_tokens));
        let runs = WorkflowRunService::new(
            run_store.clone(),
            workflow_store.clone(),
            agent_store.clone(),
            executor,
        );
        let reminders = ReminderScheduler::new(ReminderStore::new(db.clone()), sink);
        let tools = BuiltinTools::new(
            agent_store.clone(),
            workflow_store.clone(),
            runs.clone(),
            reminders.clone(),
        )
        .into_dispatcher();
        let registry = Arc::new(SpecialistRegistry::load(&specialist_store, &config.default_specialist).await?);

        Ok(Self {
            db,
            config,
            llm,
            agent_store,
            workflow_store,
            run_store,
            specialist_store,
            runs,
            reminders,
            tools,
            registry,
            pending_plans: Arc::new(PendingPlanStore::new()),
        })
    }

    /// A heap wired to this state's planner, runner and pending-plan store.
    pub fn heap(&self) -> Heap {
        let trace: Arc<dyn PlannerTraceSink> = match &self.config.planner.trace_dir {
            Some(dir) => Arc::new(JsonlTraceSink::new(dir)),
            None => Arc::new(TracingTraceSink),
        };
        let runner = SpecialistRunner::new(
            self.llm.clone(),
            self.tools.clone(),
            self.config.runner,
            self.config.llm.max_tokens,
        );
        Heap::new(
            self.registry.clone(),
            Planner::new(self.llm.clone(), trace),
            Arc::new(runner),
            Arc::new(LlmChooser::new(self.llm.clone())),
            self.pending_plans.clone(),
        )
    }
}
