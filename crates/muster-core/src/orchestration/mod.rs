//! Orchestration: planner, specialist registry, heap executor and the
//! per-specialist tool loop.
//!
//! One conversation turn through [`Heap::handle_turn`]:
//!   1. Take any pending plan stashed by the previous turn's interrupt
//!   2. Plan (continuation or fresh), falling back to a keyword heuristic
//!   3. Expand composites and apply the create-both reordering
//!   4. Walk the order, running each specialist's tool loop
//!   5. Stash a new pending plan if the walk stopped on an ask-user question

pub mod heap;
pub mod pending;
pub mod planner;
pub mod registry;
pub mod runner;

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::tools::ToolContext;

pub use heap::{HeapExecutor, HeapInput, HeapInterrupt, HeapResult, RunSpecialist, TrailEntry};
pub use pending::PendingPlanStore;
pub use planner::{PendingPlan, Plan, PlanStep, Planner, PlannerInput};
pub use registry::{
    FirstChildChooser, LlmChooser, Specialist, SpecialistKind, SpecialistRegistry, SubspecialistChooser,
};
pub use runner::{SpecialistOutcome, SpecialistRunner, UserQuestion};

const EMPTY_TURN_SUMMARY: &str = "No specialist produced a response.";

#[derive(Debug, Clone, Default)]
pub struct TurnRequest {
    pub conversation_id: String,
    pub message: String,
    pub recent_summary: Option<String>,
    pub waiting_run: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnResult {
    pub summary: String,
    /// Whether the order came from the planner (false: keyword fallback).
    pub planned: bool,
    pub order: Vec<PlanStep>,
    pub trail: Vec<TrailEntry>,
    pub outcomes: Vec<SpecialistOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interrupt: Option<HeapInterrupt>,
}

pub struct Heap {
    registry: Arc<SpecialistRegistry>,
    planner: Planner,
    runner: Arc<dyn RunSpecialist>,
    chooser: Arc<dyn SubspecialistChooser>,
    pending: Arc<PendingPlanStore>,
}

impl Heap {
    pub fn new(
        registry: Arc<SpecialistRegistry>,
        planner: Planner,
        runner: Arc<dyn RunSpecialist>,
        chooser: Arc<dyn SubspecialistChooser>,
        pending: Arc<PendingPlanStore>,
    ) -> Self {
        Self {
            registry,
            planner,
            runner,
            chooser,
            pending,
        }
    }

    pub fn registry(&self) -> &Arc<SpecialistRegistry> {
        &self.registry
    }

    pub fn pending(&self) -> &Arc<PendingPlanStore> {
        &self.pending
    }

    pub async fn handle_turn(&self, request: &TurnRequest) -> TurnResult {
        let conversation_id = request.conversation_id.as_str();
        let pending = self.pending.take(conversation_id);
        let input = PlannerInput {
            message: &request.message,
            conversation_id: Some(conversation_id),
            recent_summary: request.recent_summary.as_deref(),
            waiting_run: request.waiting_run.as_deref(),
            pending: pending.as_ref(),
        };

        let plan = self.planner.plan(&input, &self.registry).await;
        let planned = plan.is_some();
        let plan = plan.unwrap_or_else(|| {
            tracing::info!("[Heap] No plan for {}; using keyword fallback", conversation_id);
            Plan {
                refined_task: request.message.clone(),
                priority_order: planner::heuristic_order(
                    &request.message,
                    request.recent_summary.as_deref(),
                    &self.registry,
                ),
                extracted_context: json!({}),
                instructions: HashMap::new(),
            }
        });
        let refined_task = if plan.refined_task.trim().is_empty() {
            request.message.clone()
        } else {
            plan.refined_task.clone()
        };

        let mut order = self
            .registry
            .expand_order(&plan.priority_order, &refined_task, self.chooser.as_ref())
            .await;
        if order.is_empty() {
            tracing::warn!("[Heap] Plan for {} has no runnable specialists; using fallback", conversation_id);
            let fallback = planner::heuristic_order(&request.message, request.recent_summary.as_deref(), &self.registry);
            order = self
                .registry
                .expand_order(&fallback, &refined_task, self.chooser.as_ref())
                .await;
        }
        let order = registry::reorder_for_create_both(order, &plan.extracted_context);
        tracing::info!("[Heap] Turn {} order: {}", conversation_id, serde_json::to_string(&order).unwrap_or_default());

        let ctx = ToolContext {
            conversation_id: Some(conversation_id.to_string()),
            vault_key: None,
            registry: Some(self.registry.clone()),
        };
        let prior_trail = pending.map(|p| p.trail).unwrap_or_default();
        let heap_input = HeapInput {
            order: &order,
            refined_task: &refined_task,
            instructions: Some(&plan.instructions),
            extracted_context: Some(&plan.extracted_context),
            grounding: if planned { None } else { request.recent_summary.as_deref() },
            prior_trail: &prior_trail,
        };
        let result = HeapExecutor::new(&self.registry, self.runner.as_ref())
            .execute(&heap_input, &ctx)
            .await;

        if let Some(interrupt) = &result.interrupt {
            // The interrupted specialist runs again, so only finished steps carry over.
            let mut trail = prior_trail.clone();
            trail.extend(
                result
                    .trail
                    .iter()
                    .filter(|t| t.specialist_id != interrupt.specialist_id)
                    .cloned(),
            );
            let stashed = PendingPlan {
                plan: Plan {
                    refined_task: refined_task.clone(),
                    priority_order: order.clone(),
                    extracted_context: plan.extracted_context.clone(),
                    instructions: plan.instructions.clone(),
                },
                remainder: result.remainder.clone(),
                question: interrupt.question.question.clone(),
                options: interrupt.question.options.clone(),
                trail,
            };
            self.pending.stash(conversation_id, stashed);
        }

        let summary = if result.summary.trim().is_empty() {
            EMPTY_TURN_SUMMARY.to_string()
        } else {
            result.summary
        };
        TurnResult {
            summary,
            planned,
            order,
            trail: result.trail,
            outcomes: result.outcomes,
            interrupt: result.interrupt,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ServerError;
    use crate::llm::{LlmResponse, ScriptedLlmClient};
    use crate::trace::MemoryTraceSink;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// `asker` interrupts until its task carries the user's confirmation.
    struct ScriptedRunner {
        asker: &'static str,
        seen: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl RunSpecialist for ScriptedRunner {
        async fn run(&self, specialist: &Specialist, task: &str, _ctx: &ToolContext) -> Result<SpecialistOutcome, ServerError> {
            self.seen.lock().unwrap().push((specialist.id.clone(), task.to_string()));
            let already_answered = task.contains("userConfirmation");
            let waiting = (specialist.id == self.asker && !already_answered).then(|| UserQuestion {
                question: format!("{} needs an answer", specialist.id),
                options: vec!["Yes".to_string(), "No".to_string()],
            });
            let summary = match (specialist.id.as_str(), &waiting) {
                (_, Some(question)) => question.question.clone(),
                ("agent", None) => "Created agent [Created agent id: a-1]".to_string(),
                (other, None) => format!("{} done", other),
            };
            Ok(SpecialistOutcome {
                specialist_id: specialist.id.clone(),
                summary,
                tool_results: vec![],
                waiting_for_user: waiting,
            })
        }
    }

    fn heap(llm: ScriptedLlmClient, asker: &'static str) -> (Heap, Arc<ScriptedRunner>) {
        let registry = Arc::new(SpecialistRegistry::builtin());
        let runner = Arc::new(ScriptedRunner {
            asker,
            seen: Mutex::new(Vec::new()),
        });
        let heap = Heap::new(
            registry,
            Planner::new(Arc::new(llm), Arc::new(MemoryTraceSink::default())),
            runner.clone(),
            Arc::new(FirstChildChooser),
            Arc::new(PendingPlanStore::new()),
        );
        (heap, runner)
    }

    fn turn(message: &str) -> TurnRequest {
        TurnRequest {
            conversation_id: "conv-1".to_string(),
            message: message.to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_interrupt_then_confirmation_resumes_pending_plan() {
        let plan = r#"{"refinedTask": "Create a triage agent and workflow",
                       "priorityOrder": ["workflow", "agent"],
                       "extractedContext": {"createBoth": true}}"#;
        let (heap, runner) = heap(ScriptedLlmClient::new(vec![LlmResponse::text(plan)]), "agent");

        let first = heap.handle_turn(&turn("make a triage agent and workflow")).await;
        assert!(first.planned);
        assert_eq!(first.order[0], PlanStep::Single("agent".to_string()));
        assert_eq!(first.interrupt.as_ref().unwrap().specialist_id, "agent");
        assert_eq!(heap.pending().len(), 1);

        // "yes" matches an option, so no second LLM call is needed.
        let second = heap.handle_turn(&turn("yes")).await;
        assert!(second.interrupt.is_none());
        assert!(heap.pending().is_empty());
        assert_eq!(second.summary, "workflow done");
        assert!(second.trail[0].outcome_summary.contains("[Created agent id: a-1]"));

        let seen = runner.seen.lock().unwrap();
        let ids: Vec<&str> = seen.iter().map(|(id, _)| id.as_str()).collect();
        assert_eq!(ids, vec!["agent", "agent", "workflow"]);
        assert!(seen[2].1.contains("[Created agent id: a-1]"));
    }

    #[tokio::test]
    async fn test_specialist_after_interrupt_sees_ids_created_before_it() {
        let plan = r#"{"refinedTask": "Create a triage agent and a daily workflow",
                       "priorityOrder": ["agent", "workflow"]}"#;
        let (heap, runner) = heap(ScriptedLlmClient::new(vec![LlmResponse::text(plan)]), "workflow");

        let first = heap.handle_turn(&turn("make a triage agent and a daily workflow")).await;
        assert_eq!(first.interrupt.as_ref().unwrap().specialist_id, "workflow");
        assert_eq!(first.trail.len(), 2);

        let second = heap.handle_turn(&turn("yes")).await;
        assert!(second.interrupt.is_none());
        assert_eq!(second.order, vec![PlanStep::Single("workflow".to_string())]);
        assert_eq!(second.trail.len(), 1);
        assert_eq!(second.summary, "workflow done");

        let seen = runner.seen.lock().unwrap();
        let ids: Vec<&str> = seen.iter().map(|(id, _)| id.as_str()).collect();
        assert_eq!(ids, vec!["agent", "workflow", "workflow"]);
        let continued = &seen[2].1;
        assert!(continued.contains("Prior steps:\n- agent: Created agent [Created agent id: a-1]"));
        assert!(!continued.contains("workflow needs an answer"));
    }

    #[tokio::test]
    async fn test_planner_failure_falls_back_to_keywords() {
        let (heap, runner) = heap(
            ScriptedLlmClient::new(vec![LlmResponse::text("no json"), LlmResponse::text("still no json")]),
            "agent",
        );
        let result = heap.handle_turn(&turn("remind me to stretch in 30 minutes")).await;
        assert!(!result.planned);
        assert_eq!(result.order, vec![PlanStep::Single("reminders".to_string())]);
        assert_eq!(result.summary, "reminders done");
        assert_eq!(runner.seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_plan_with_only_unknown_ids_uses_fallback() {
        let plan = r#"{"refinedTask": "hello", "priorityOrder": ["ghost"]}"#;
        let (heap, _) = heap(ScriptedLlmClient::new(vec![LlmResponse::text(plan)]), "agent");
        let result = heap.handle_turn(&turn("xyzzy")).await;
        assert_eq!(result.order, vec![PlanStep::Single("general".to_string())]);
        assert_eq!(result.summary, "general done");
    }
}
