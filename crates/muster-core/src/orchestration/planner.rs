//! Planner/router: turns a user message into a [`Plan`].
//!
//! Fresh turns get one LLM call plus at most one stricter retry. A turn that
//! answers a pending ask-user interrupt is merged into the stashed plan,
//! without an LLM call when the reply matches one of the offered options.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::heap::TrailEntry;
use super::registry::SpecialistRegistry;
use crate::llm::{ChatRequest, LlmClient};
use crate::trace::{PlannerMode, PlannerTraceEvent, PlannerTraceSink, TraceKind};

/// One entry of a plan's priority order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PlanStep {
    Single(String),
    Parallel { parallel: Vec<String> },
}

impl PlanStep {
    pub fn ids(&self) -> Vec<&str> {
        match self {
            Self::Single(id) => vec![id.as_str()],
            Self::Parallel { parallel } => parallel.iter().map(|s| s.as_str()).collect(),
        }
    }
}

fn empty_object() -> Value {
    json!({})
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Plan {
    #[serde(default)]
    pub refined_task: String,
    #[serde(default)]
    pub priority_order: Vec<PlanStep>,
    #[serde(default = "empty_object")]
    pub extracted_context: Value,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub instructions: HashMap<String, String>,
}

impl Plan {
    /// Set a field on `extracted_context`, turning it into an object if needed.
    pub fn set_context(&mut self, key: &str, value: Value) {
        if !self.extracted_context.is_object() {
            self.extracted_context = empty_object();
        }
        self.extracted_context[key] = value;
    }
}

/// A plan interrupted by an ask-user question, waiting for the next turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingPlan {
    pub plan: Plan,
    pub remainder: Vec<PlanStep>,
    pub question: String,
    #[serde(default)]
    pub options: Vec<String>,
    /// Steps that finished before the interrupt. The next turn sees them
    /// under "Prior steps:".
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub trail: Vec<TrailEntry>,
}

/// What the planner sees for one turn.
#[derive(Debug, Clone, Default)]
pub struct PlannerInput<'a> {
    pub message: &'a str,
    pub conversation_id: Option<&'a str>,
    pub recent_summary: Option<&'a str>,
    /// Description of a workflow run currently waiting for the user.
    pub waiting_run: Option<&'a str>,
    pub pending: Option<&'a PendingPlan>,
}

const PLAN_SCHEMA: &str = r#"{"refinedTask": string, "priorityOrder": [specialistId | {"parallel": [specialistId, ...]}], "extractedContext": object, "instructions": {specialistId: string}}"#;

pub struct Planner {
    llm: Arc<dyn LlmClient>,
    trace: Arc<dyn PlannerTraceSink>,
}

impl Planner {
    pub fn new(llm: Arc<dyn LlmClient>, trace: Arc<dyn PlannerTraceSink>) -> Self {
        Self { llm, trace }
    }

    /// Produce a plan, or `None` if the model never returned a usable one.
    pub async fn plan(&self, input: &PlannerInput<'_>, registry: &SpecialistRegistry) -> Option<Plan> {
        match input.pending {
            Some(pending) => Some(self.continue_plan(input, pending, registry).await),
            None => self.fresh_plan(input, registry).await,
        }
    }

    async fn fresh_plan(&self, input: &PlannerInput<'_>, registry: &SpecialistRegistry) -> Option<Plan> {
        let system = planner_system(registry);
        let user = fresh_prompt(input);

        for attempt in 1..=2u32 {
            let system = if attempt == 1 {
                system.clone()
            } else {
                format!(
                    "{}\n\nYour previous answer was not valid JSON. Emit valid JSON only: one object, no prose, no code fences.",
                    system
                )
            };
            match self.attempt(input, PlannerMode::Fresh, attempt, system, user.clone()).await {
                Ok(plan) => return Some(plan),
                Err(reason) => tracing::warn!("[Planner] Attempt {} failed: {}", attempt, reason),
            }
        }
        None
    }

    async fn continue_plan(
        &self,
        input: &PlannerInput<'_>,
        pending: &PendingPlan,
        registry: &SpecialistRegistry,
    ) -> Plan {
        if let Some(option) = match_confirmation(input.message, &pending.options) {
            tracing::info!("[Planner] Reply matches option '{}'; resuming pending plan", option);
            let mut plan = pending.plan.clone();
            plan.priority_order = pending.remainder.clone();
            plan.set_context("userConfirmation", json!(option));
            self.trace
                .record(PlannerTraceEvent::new(
                    input.conversation_id,
                    PlannerMode::Continuation,
                    0,
                    TraceKind::Parsed {
                        plan: serde_json::to_value(&plan).unwrap_or(Value::Null),
                    },
                ))
                .await;
            return plan;
        }

        let system = planner_system(registry);
        let user = continuation_prompt(input.message, pending);
        match self.attempt(input, PlannerMode::Continuation, 1, system, user).await {
            Ok(plan) => plan,
            Err(reason) => {
                tracing::info!("[Planner] Continuation unparsed ({}); merging reply into pending plan", reason);
                let mut plan = pending.plan.clone();
                plan.priority_order = pending.remainder.clone();
                plan.set_context("userReply", json!(input.message));
                plan
            }
        }
    }

    async fn attempt(
        &self,
        input: &PlannerInput<'_>,
        mode: PlannerMode,
        attempt: u32,
        system: String,
        user: String,
    ) -> Result<Plan, String> {
        let conversation_id = input.conversation_id;
        self.trace
            .record(PlannerTraceEvent::new(
                conversation_id,
                mode,
                attempt,
                TraceKind::Request { prompt: user.clone() },
            ))
            .await;

        let result = match self.llm.complete(ChatRequest::prompt(system, user)).await {
            Ok(response) => {
                let text = response.text.unwrap_or_default();
                self.trace
                    .record(PlannerTraceEvent::new(
                        conversation_id,
                        mode,
                        attempt,
                        TraceKind::RawResponse { text: text.clone() },
                    ))
                    .await;
                parse_plan(&text)
            }
            Err(e) => Err(e.to_string()),
        };

        let kind = match &result {
            Ok(plan) => TraceKind::Parsed {
                plan: serde_json::to_value(plan).unwrap_or(Value::Null),
            },
            Err(reason) => TraceKind::Failed { reason: reason.clone() },
        };
        self.trace
            .record(PlannerTraceEvent::new(conversation_id, mode, attempt, kind))
            .await;
        result
    }
}

fn planner_system(registry: &SpecialistRegistry) -> String {
    let specialists = registry
        .all()
        .iter()
        .map(|s| format!("- {}: {}", s.id, s.description))
        .collect::<Vec<_>>()
        .join("\n");
    format!(
        "You are the router of a multi-specialist assistant. Decide which specialists handle the user's \
         task and in what order. Independent specialists may run in a parallel group.\n\n\
         Specialists:\n{}\n\nAnswer with one JSON object of the form:\n{}",
        specialists, PLAN_SCHEMA
    )
}

fn fresh_prompt(input: &PlannerInput<'_>) -> String {
    let mut prompt = String::new();
    if let Some(summary) = input.recent_summary.filter(|s| !s.trim().is_empty()) {
        prompt.push_str(&format!("Recent conversation:\n{}\n\n", summary));
    }
    if let Some(run) = input.waiting_run {
        prompt.push_str(&format!("A workflow run is waiting for the user:\n{}\n\n", run));
    }
    prompt.push_str(&format!("User message:\n{}", input.message));
    prompt
}

fn continuation_prompt(reply: &str, pending: &PendingPlan) -> String {
    format!(
        "The previous turn stopped to ask the user a question.\n\nPending plan:\n{}\n\n\
         Remaining steps:\n{}\n\nQuestion: {}\nOptions: {}\n\nUser reply:\n{}\n\n\
         Produce the updated plan for the remaining work.",
        serde_json::to_string_pretty(&pending.plan).unwrap_or_default(),
        serde_json::to_string(&pending.remainder).unwrap_or_default(),
        pending.question,
        if pending.options.is_empty() {
            "(free text)".to_string()
        } else {
            pending.options.join(" | ")
        },
        reply
    )
}

/// Match a reply against offered options: case-insensitive trimmed equality,
/// or a 1-based option number.
pub fn match_confirmation(reply: &str, options: &[String]) -> Option<String> {
    let reply = reply.trim();
    if reply.is_empty() {
        return None;
    }
    if let Some(option) = options.iter().find(|o| o.trim().eq_ignore_ascii_case(reply)) {
        return Some(option.clone());
    }
    match reply.parse::<usize>() {
        Ok(n) if n >= 1 && n <= options.len() => Some(options[n - 1].clone()),
        _ => None,
    }
}

pub fn parse_plan(text: &str) -> Result<Plan, String> {
    let value = extract_json_object(text).ok_or_else(|| "no JSON object in response".to_string())?;
    serde_json::from_value(value).map_err(|e| format!("plan does not match schema: {}", e))
}

/// Find the first balanced `{...}` in `text` that parses as a JSON object.
/// Tolerates surrounding prose and code fences.
pub fn extract_json_object(text: &str) -> Option<Value> {
    let bytes = text.as_bytes();
    for (start, _) in text.match_indices('{') {
        let mut depth = 0usize;
        let mut in_string = false;
        let mut escaped = false;
        for (offset, &b) in bytes[start..].iter().enumerate() {
            if in_string {
                match b {
                    _ if escaped => escaped = false,
                    b'\\' => escaped = true,
                    b'"' => in_string = false,
                    _ => {}
                }
                continue;
            }
            match b {
                b'"' => in_string = true,
                b'{' => depth += 1,
                b'}' => {
                    depth -= 1;
                    if depth == 0 {
                        let candidate = &text[start..=start + offset];
                        if let Ok(value @ Value::Object(_)) = serde_json::from_str::<Value>(candidate) {
                            return Some(value);
                        }
                        break;
                    }
                }
                _ => {}
            }
        }
    }
    None
}

/// Single-specialist fallback: the specialist whose keywords best match the
/// message and context, else the registry default.
pub fn heuristic_order(message: &str, context: Option<&str>, registry: &SpecialistRegistry) -> Vec<PlanStep> {
    let haystack = format!("{} {}", message, context.unwrap_or_default()).to_lowercase();
    let mut best: Option<(&str, usize)> = None;
    for specialist in registry.all() {
        let score = specialist
            .keywords
            .iter()
            .filter(|k| !k.is_empty() && haystack.contains(&k.to_lowercase()))
            .count();
        if score > 0 && best.map(|(_, s)| score > s).unwrap_or(true) {
            best = Some((specialist.id.as_str(), score));
        }
    }
    let id = best.map(|(id, _)| id).unwrap_or_else(|| registry.default_id());
    vec![PlanStep::Single(id.to_string())]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{LlmResponse, ScriptedLlmClient};
    use crate::trace::MemoryTraceSink;

    fn planner(responses: Vec<LlmResponse>) -> (Planner, Arc<ScriptedLlmClient>, Arc<MemoryTraceSink>) {
        let llm = Arc::new(ScriptedLlmClient::new(responses));
        let trace = Arc::new(MemoryTraceSink::default());
        (Planner::new(llm.clone(), trace.clone()), llm, trace)
    }

    fn pending() -> PendingPlan {
        PendingPlan {
            plan: Plan {
                refined_task: "Create a triage agent and workflow".to_string(),
                priority_order: vec![PlanStep::Single("agent".to_string()), PlanStep::Single("workflow".to_string())],
                extracted_context: json!({ "createBoth": true }),
                instructions: HashMap::new(),
            },
            remainder: vec![PlanStep::Single("agent".to_string()), PlanStep::Single("workflow".to_string())],
            question: "Use the default model?".to_string(),
            options: vec!["Yes".to_string(), "No".to_string()],
            trail: vec![],
        }
    }

    #[test]
    fn test_extract_json_tolerates_prose_and_fences() {
        let text = "Sure! Here is the plan:\n```json\n{\"refinedTask\": \"x {y}\", \"priorityOrder\": [\"agent\"]}\n```\nDone.";
        let value = extract_json_object(text).unwrap();
        assert_eq!(value["refinedTask"], "x {y}");

        assert!(extract_json_object("no braces here").is_none());
        assert!(extract_json_object("{broken").is_none());
        assert_eq!(extract_json_object("{bad} then {\"a\": 1}").unwrap()["a"], 1);
    }

    #[test]
    fn test_plan_step_parses_single_and_parallel() {
        let plan = parse_plan(r#"{"refinedTask": "t", "priorityOrder": ["agent", {"parallel": ["a", "b"]}]}"#).unwrap();
        assert_eq!(plan.priority_order[0], PlanStep::Single("agent".to_string()));
        assert_eq!(plan.priority_order[1].ids(), vec!["a", "b"]);
        assert_eq!(plan.extracted_context, json!({}));
    }

    #[test]
    fn test_match_confirmation() {
        let options = vec!["Yes".to_string(), "No, cancel".to_string()];
        assert_eq!(match_confirmation("  yes ", &options), Some("Yes".to_string()));
        assert_eq!(match_confirmation("2", &options), Some("No, cancel".to_string()));
        assert_eq!(match_confirmation("3", &options), None);
        assert_eq!(match_confirmation("maybe", &options), None);
    }

    #[tokio::test]
    async fn test_fresh_plan_retries_once() {
        let registry = SpecialistRegistry::builtin();
        let (planner, llm, trace) = planner(vec![
            LlmResponse::text("I think the agent specialist should go first."),
            LlmResponse::text(r#"{"refinedTask": "make an agent", "priorityOrder": ["agent"]}"#),
        ]);
        let input = PlannerInput {
            message: "make an agent",
            ..Default::default()
        };
        let plan = planner.plan(&input, &registry).await.unwrap();
        assert_eq!(plan.refined_task, "make an agent");
        assert_eq!(llm.call_count(), 2);
        assert!(llm.requests()[1].system.contains("valid JSON only"));

        let failures = trace
            .events()
            .into_iter()
            .filter(|e| matches!(e.kind, TraceKind::Failed { .. }))
            .count();
        assert_eq!(failures, 1);
    }

    #[tokio::test]
    async fn test_fresh_plan_gives_up_after_two_failures() {
        let registry = SpecialistRegistry::builtin();
        let (planner, llm, _) = planner(vec![LlmResponse::text("nope"), LlmResponse::text("still nope")]);
        let input = PlannerInput {
            message: "hello",
            ..Default::default()
        };
        assert!(planner.plan(&input, &registry).await.is_none());
        assert_eq!(llm.call_count(), 2);
    }

    #[tokio::test]
    async fn test_continuation_option_match_skips_llm() {
        let registry = SpecialistRegistry::builtin();
        let (planner, llm, _) = planner(vec![]);
        let pending = pending();
        let input = PlannerInput {
            message: "1",
            pending: Some(&pending),
            ..Default::default()
        };
        let plan = planner.plan(&input, &registry).await.unwrap();
        assert_eq!(llm.call_count(), 0);
        assert_eq!(plan.extracted_context["userConfirmation"], "Yes");
        assert_eq!(plan.extracted_context["createBoth"], true);
        assert_eq!(plan.priority_order, pending.remainder);
    }

    #[tokio::test]
    async fn test_continuation_falls_back_to_user_reply() {
        let registry = SpecialistRegistry::builtin();
        let (planner, llm, _) = planner(vec![LlmResponse::text("I'm not sure what to do")]);
        let pending = pending();
        let input = PlannerInput {
            message: "use the small model please",
            pending: Some(&pending),
            ..Default::default()
        };
        let plan = planner.plan(&input, &registry).await.unwrap();
        assert_eq!(llm.call_count(), 1);
        assert_eq!(plan.extracted_context["userReply"], "use the small model please");
        assert_eq!(plan.priority_order, pending.remainder);
    }

    #[test]
    fn test_heuristic_order() {
        let registry = SpecialistRegistry::builtin();
        assert_eq!(
            heuristic_order("remind me in 10 minutes", None, &registry),
            vec![PlanStep::Single("reminders".to_string())]
        );
        assert_eq!(
            heuristic_order("xyzzy", None, &registry),
            vec![PlanStep::Single("general".to_string())]
        );
    }
}
