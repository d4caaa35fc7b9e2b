//! Heap executor: walks an expanded plan order, one specialist (or one
//! parallel group) at a time, and folds the outcomes into a trail.

use std::collections::HashMap;

use async_trait::async_trait;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::planner::PlanStep;
use super::registry::{Specialist, SpecialistRegistry};
use super::runner::{SpecialistOutcome, UserQuestion};
use crate::error::ServerError;
use crate::tools::ToolContext;

/// Runs one leaf specialist on a task.
#[async_trait]
pub trait RunSpecialist: Send + Sync {
    async fn run(&self, specialist: &Specialist, task: &str, ctx: &ToolContext) -> Result<SpecialistOutcome, ServerError>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrailEntry {
    pub specialist_id: String,
    pub outcome_summary: String,
    #[serde(default)]
    pub failed: bool,
}

/// The interrupt that stopped a heap walk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeapInterrupt {
    pub specialist_id: String,
    #[serde(flatten)]
    pub question: UserQuestion,
}

#[derive(Debug, Clone, Default)]
pub struct HeapInput<'a> {
    pub order: &'a [PlanStep],
    pub refined_task: &'a str,
    pub instructions: Option<&'a HashMap<String, String>>,
    pub extracted_context: Option<&'a Value>,
    /// Trail carried over from the turn an interrupt stopped. Shown as prior
    /// steps but not repeated in the result.
    pub prior_trail: &'a [TrailEntry],
    /// Raw recent conversation, passed along only when there is no plan.
    pub grounding: Option<&'a str>,
}

#[derive(Debug, Clone, Default)]
pub struct HeapResult {
    pub trail: Vec<TrailEntry>,
    pub outcomes: Vec<SpecialistOutcome>,
    pub summary: String,
    pub interrupt: Option<HeapInterrupt>,
    /// Steps not executed because of the interrupt. The interrupted
    /// specialist comes first so it can finish with the user's answer.
    pub remainder: Vec<PlanStep>,
}

pub struct HeapExecutor<'a> {
    registry: &'a SpecialistRegistry,
    runner: &'a dyn RunSpecialist,
}

impl<'a> HeapExecutor<'a> {
    pub fn new(registry: &'a SpecialistRegistry, runner: &'a dyn RunSpecialist) -> Self {
        Self { registry, runner }
    }

    pub async fn execute(&self, input: &HeapInput<'_>, ctx: &ToolContext) -> HeapResult {
        let mut result = HeapResult::default();

        for (index, step) in input.order.iter().enumerate() {
            let members: Vec<&Specialist> = step
                .ids()
                .into_iter()
                .filter_map(|id| match self.registry.lookup(id) {
                    Some(s) if !s.is_composite() => Some(s),
                    Some(_) => {
                        tracing::warn!("[Heap] Skipping unexpanded composite '{}'", id);
                        None
                    }
                    None => {
                        tracing::warn!("[Heap] Dropping unknown specialist '{}'", id);
                        None
                    }
                })
                .collect();
            if members.is_empty() {
                continue;
            }

            let tasks: Vec<String> = members
                .iter()
                .map(|s| effective_task(input, &s.id, &result.trail))
                .collect();
            let runs = members
                .iter()
                .zip(tasks.iter())
                .map(|(specialist, task)| self.runner.run(specialist, task, ctx));
            let outcomes = join_all(runs).await;

            // Merge in declared order regardless of completion order.
            for (specialist, outcome) in members.iter().zip(outcomes) {
                match outcome {
                    Ok(outcome) => {
                        result.trail.push(TrailEntry {
                            specialist_id: specialist.id.clone(),
                            outcome_summary: outcome.summary.clone(),
                            failed: false,
                        });
                        if result.interrupt.is_none() {
                            if let Some(question) = &outcome.waiting_for_user {
                                result.interrupt = Some(HeapInterrupt {
                                    specialist_id: specialist.id.clone(),
                                    question: question.clone(),
                                });
                            }
                        }
                        result.outcomes.push(outcome);
                    }
                    Err(e) => {
                        tracing::warn!("[Heap] Specialist {} failed: {}", specialist.id, e);
                        result.trail.push(TrailEntry {
                            specialist_id: specialist.id.clone(),
                            outcome_summary: format!("{}: error — {}", specialist.id, e),
                            failed: true,
                        });
                    }
                }
            }

            if let Some(interrupt) = &result.interrupt {
                tracing::info!("[Heap] {} is waiting for the user; stopping", interrupt.specialist_id);
                result.remainder.push(PlanStep::Single(interrupt.specialist_id.clone()));
                result.remainder.extend(input.order[index + 1..].iter().cloned());
                break;
            }
        }

        result.summary = result
            .outcomes
            .iter()
            .rev()
            .map(|o| o.summary.trim())
            .find(|s| !s.is_empty())
            .map(|s| s.to_string())
            .or_else(|| result.trail.last().map(|t| t.outcome_summary.clone()))
            .unwrap_or_default();
        result
    }
}

/// refinedTask + this specialist's instruction + extracted context + prior
/// steps + (without a plan) the raw recent conversation.
fn effective_task(input: &HeapInput<'_>, specialist_id: &str, trail: &[TrailEntry]) -> String {
    let mut task = input.refined_task.to_string();
    if let Some(instruction) = input.instructions.and_then(|i| i.get(specialist_id)) {
        task.push_str(&format!("\n\nInstructions for you:\n{}", instruction));
    }
    if let Some(ctx) = input.extracted_context {
        if ctx.as_object().map(|o| !o.is_empty()).unwrap_or(false) {
            task.push_str(&format!("\n\nContext:\n{}", ctx));
        }
    }
    if !input.prior_trail.is_empty() || !trail.is_empty() {
        task.push_str("\n\nPrior steps:");
        for entry in input.prior_trail.iter().chain(trail) {
            task.push_str(&format!("\n- {}: {}", entry.specialist_id, entry.outcome_summary));
        }
    }
    if let Some(grounding) = input.grounding.filter(|g| !g.trim().is_empty()) {
        task.push_str(&format!("\n\nRecent conversation:\n{}", grounding));
    }
    task
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Behaviour keyed by specialist id: "slow" sleeps, "broken" errors,
    /// "asker" interrupts, "quiet" returns an empty summary.
    #[derive(Default)]
    struct FakeRunner {
        tasks: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl RunSpecialist for FakeRunner {
        async fn run(&self, specialist: &Specialist, task: &str, _ctx: &ToolContext) -> Result<SpecialistOutcome, ServerError> {
            self.tasks.lock().unwrap().push((specialist.id.clone(), task.to_string()));
            let mut outcome = SpecialistOutcome {
                specialist_id: specialist.id.clone(),
                summary: format!("{} done", specialist.id),
                tool_results: vec![],
                waiting_for_user: None,
            };
            match specialist.id.as_str() {
                "slow" => tokio::time::sleep(Duration::from_millis(50)).await,
                "broken" => return Err(ServerError::Llm("boom".to_string())),
                "asker" => {
                    outcome.waiting_for_user = Some(UserQuestion {
                        question: "Which one?".to_string(),
                        options: vec![],
                    })
                }
                "quiet" => outcome.summary.clear(),
                _ => {}
            }
            Ok(outcome)
        }
    }

    fn registry() -> SpecialistRegistry {
        let ids = ["a", "b", "c", "slow", "broken", "asker", "quiet"];
        SpecialistRegistry::new(
            ids.iter().map(|id| Specialist::leaf(id, id, &["list_agents"], &[], "")).collect(),
            "a",
        )
    }

    fn single(id: &str) -> PlanStep {
        PlanStep::Single(id.to_string())
    }

    fn parallel(ids: &[&str]) -> PlanStep {
        PlanStep::Parallel {
            parallel: ids.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[tokio::test]
    async fn test_unknown_ids_dropped() {
        let registry = registry();
        let runner = FakeRunner::default();
        let order = vec![single("ghost"), single("a")];
        let input = HeapInput {
            order: &order,
            refined_task: "task",
            ..Default::default()
        };
        let result = HeapExecutor::new(&registry, &runner).execute(&input, &ToolContext::default()).await;
        assert_eq!(result.trail.len(), 1);
        assert_eq!(result.summary, "a done");
    }

    #[tokio::test]
    async fn test_parallel_group_merges_in_declared_order() {
        let registry = registry();
        let runner = FakeRunner::default();
        let order = vec![parallel(&["slow", "b"])];
        let input = HeapInput {
            order: &order,
            refined_task: "task",
            ..Default::default()
        };
        let result = HeapExecutor::new(&registry, &runner).execute(&input, &ToolContext::default()).await;
        let ids: Vec<&str> = result.trail.iter().map(|t| t.specialist_id.as_str()).collect();
        assert_eq!(ids, vec!["slow", "b"]);
        assert_eq!(result.summary, "b done");
    }

    #[tokio::test]
    async fn test_error_step_does_not_stop_the_heap() {
        let registry = registry();
        let runner = FakeRunner::default();
        let order = vec![single("a"), single("broken"), single("c")];
        let input = HeapInput {
            order: &order,
            refined_task: "task",
            ..Default::default()
        };
        let result = HeapExecutor::new(&registry, &runner).execute(&input, &ToolContext::default()).await;
        assert_eq!(result.trail.len(), 3);
        assert!(result.trail[1].failed);
        assert!(result.trail[1].outcome_summary.starts_with("broken: error"));
        assert_eq!(result.summary, "c done");

        let tasks = runner.tasks.lock().unwrap();
        assert!(tasks[2].1.contains("Prior steps:"));
        assert!(tasks[2].1.contains("- broken: broken: error"));
    }

    #[tokio::test]
    async fn test_interrupt_stops_and_returns_remainder() {
        let registry = registry();
        let runner = FakeRunner::default();
        let order = vec![single("a"), parallel(&["b", "asker"]), single("c")];
        let input = HeapInput {
            order: &order,
            refined_task: "task",
            ..Default::default()
        };
        let result = HeapExecutor::new(&registry, &runner).execute(&input, &ToolContext::default()).await;
        let interrupt = result.interrupt.unwrap();
        assert_eq!(interrupt.specialist_id, "asker");
        assert_eq!(interrupt.question.question, "Which one?");
        assert_eq!(result.remainder, vec![single("asker"), single("c")]);
        assert_eq!(runner.tasks.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_prior_trail_is_shown_but_not_repeated() {
        let registry = registry();
        let runner = FakeRunner::default();
        let order = vec![single("b"), single("c")];
        let prior = vec![TrailEntry {
            specialist_id: "a".to_string(),
            outcome_summary: "[Created agent id: a-1]".to_string(),
            failed: false,
        }];
        let input = HeapInput {
            order: &order,
            refined_task: "task",
            prior_trail: &prior,
            ..Default::default()
        };
        let result = HeapExecutor::new(&registry, &runner).execute(&input, &ToolContext::default()).await;
        assert_eq!(result.trail.len(), 2);
        assert_eq!(result.trail[0].specialist_id, "b");

        let tasks = runner.tasks.lock().unwrap();
        assert!(tasks[0].1.contains("Prior steps:\n- a: [Created agent id: a-1]"));
        assert!(tasks[1].1.contains("- a: [Created agent id: a-1]\n- b: b done"));
    }

    #[tokio::test]
    async fn test_last_non_empty_summary_wins() {
        let registry = registry();
        let runner = FakeRunner::default();
        let order = vec![single("a"), single("quiet")];
        let instructions = HashMap::from([("quiet".to_string(), "Say nothing".to_string())]);
        let input = HeapInput {
            order: &order,
            refined_task: "task",
            instructions: Some(&instructions),
            grounding: Some("user: hi"),
            ..Default::default()
        };
        let result = HeapExecutor::new(&registry, &runner).execute(&input, &ToolContext::default()).await;
        assert_eq!(result.summary, "a done");

        let tasks = runner.tasks.lock().unwrap();
        assert!(tasks[1].1.contains("Instructions for you:\nSay nothing"));
        assert!(tasks[1].1.contains("Recent conversation:\nuser: hi"));
    }
}
