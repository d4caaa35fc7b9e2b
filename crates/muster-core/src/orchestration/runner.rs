//! Bounded tool-calling loop for one specialist.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::heap::RunSpecialist;
use super::registry::Specialist;
use crate::config::RunnerConfig;
use crate::error::ServerError;
use crate::llm::{ChatMessage, ChatRequest, LlmClient, ToolSpec};
use crate::tools::{
    created_kind, is_waiting_for_user, resolve_args, string_list_arg, tool_error, ToolContext, ToolDispatcher,
    ToolRecord, ASK_USER_TOOL,
};

const SUMMARY_LIMIT: usize = 600;

/// An ask-user interrupt raised by a specialist.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserQuestion {
    pub question: String,
    #[serde(default)]
    pub options: Vec<String>,
}

impl UserQuestion {
    fn from_result(result: &Value) -> Self {
        Self {
            question: result
                .get("question")
                .and_then(|q| q.as_str())
                .unwrap_or_default()
                .to_string(),
            options: string_list_arg(result, "options"),
        }
    }
}

/// One dispatched (or refused) tool call.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallRecord {
    pub tool: String,
    pub arguments: Value,
    pub result: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpecialistOutcome {
    pub specialist_id: String,
    pub summary: String,
    pub tool_results: Vec<ToolCallRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub waiting_for_user: Option<UserQuestion>,
}

pub struct SpecialistRunner {
    llm: Arc<dyn LlmClient>,
    tools: Arc<dyn ToolDispatcher>,
    config: RunnerConfig,
    max_tokens: u32,
}

enum Dispatch {
    Call { name: String, args: Value },
    Refused(Value),
}

impl SpecialistRunner {
    pub fn new(llm: Arc<dyn LlmClient>, tools: Arc<dyn ToolDispatcher>, config: RunnerConfig, max_tokens: u32) -> Self {
        Self {
            llm,
            tools,
            config,
            max_tokens,
        }
    }

    /// Specs for the specialist's tools, in the specialist's order.
    fn allowed_specs(&self, specialist: &Specialist) -> Vec<ToolSpec> {
        let all = self.tools.specs();
        specialist
            .tool_names()
            .iter()
            .filter_map(|name| all.iter().find(|s| &s.name == name).cloned())
            .collect()
    }

    pub async fn run_specialist(
        &self,
        specialist: &Specialist,
        task: &str,
        ctx: &ToolContext,
    ) -> Result<SpecialistOutcome, ServerError> {
        let specs = self.allowed_specs(specialist);
        let system = system_instruction(specialist, &specs);
        let allowed = specialist.tool_names();

        let mut messages = vec![ChatMessage::user(task)];
        let mut history: Vec<ToolRecord> = Vec::new();
        let mut records: Vec<ToolCallRecord> = Vec::new();
        let mut last_text: Option<String> = None;
        let mut waiting: Option<UserQuestion> = None;
        let mut tokens_used = 0u64;
        let mut finished = false;

        for turn in 0..self.config.max_turns {
            let request = ChatRequest {
                system: system.clone(),
                messages: messages.clone(),
                tools: specs.clone(),
                max_tokens: Some(self.max_tokens),
            };
            let response = self.llm.complete(request).await?;
            tokens_used += response.usage.total();

            let text = response.text.clone().unwrap_or_default();
            if !text.trim().is_empty() {
                last_text = Some(text.clone());
            }
            if response.tool_calls.is_empty() {
                finished = true;
                break;
            }
            messages.push(ChatMessage::assistant(text, response.tool_calls.clone()));

            // Calls in this turn only see results recorded before it.
            let snapshot = history.clone();
            let mut asked = false;
            let plans: Vec<Dispatch> = response
                .tool_calls
                .iter()
                .map(|call| {
                    if !allowed.iter().any(|t| t == &call.name) {
                        return Dispatch::Refused(tool_error(format!(
                            "tool '{}' is not available to specialist '{}'",
                            call.name, specialist.id
                        )));
                    }
                    if call.name == ASK_USER_TOOL {
                        if asked {
                            return Dispatch::Refused(tool_error("only one ask_user call per response is allowed"));
                        }
                        asked = true;
                    }
                    Dispatch::Call {
                        name: call.name.clone(),
                        args: resolve_args(&call.arguments, &snapshot),
                    }
                })
                .collect();

            let tools = &self.tools;
            let results = join_all(plans.into_iter().map(|plan| async move {
                let out: Result<(bool, Value, Value), ServerError> = match plan {
                    Dispatch::Refused(v) => Ok((false, Value::Null, v)),
                    Dispatch::Call { name, args } => tools
                        .execute(&name, args.clone(), ctx)
                        .await
                        .map(|result| (true, args, result)),
                };
                out
            }))
            .await;

            for (call, outcome) in response.tool_calls.iter().zip(results) {
                let (dispatched, args, result) = outcome?;
                if dispatched {
                    history.push(ToolRecord {
                        name: call.name.clone(),
                        result: result.clone(),
                    });
                    if waiting.is_none() && call.name == ASK_USER_TOOL && is_waiting_for_user(&result) {
                        waiting = Some(UserQuestion::from_result(&result));
                    }
                }
                messages.push(ChatMessage::tool_result(&call.id, result.to_string()));
                records.push(ToolCallRecord {
                    tool: call.name.clone(),
                    arguments: if dispatched { args } else { call.arguments.clone() },
                    result,
                });
            }

            if waiting.is_some() {
                break;
            }
            if tokens_used >= self.config.token_budget {
                tracing::warn!(
                    "[Runner] {} hit the token budget ({} >= {}) after {} turn(s)",
                    specialist.id,
                    tokens_used,
                    self.config.token_budget,
                    turn + 1
                );
                break;
            }
        }
        if !finished && waiting.is_none() {
            tracing::debug!("[Runner] {} stopped before a final answer", specialist.id);
        }

        let summary = summarize(last_text.as_deref(), &records, waiting.as_ref());
        tracing::info!("[Runner] {} finished with {} tool call(s)", specialist.id, records.len());
        Ok(SpecialistOutcome {
            specialist_id: specialist.id.clone(),
            summary,
            tool_results: records,
            waiting_for_user: waiting,
        })
    }
}

#[async_trait]
impl RunSpecialist for SpecialistRunner {
    async fn run(&self, specialist: &Specialist, task: &str, ctx: &ToolContext) -> Result<SpecialistOutcome, ServerError> {
        self.run_specialist(specialist, task, ctx).await
    }
}

fn system_instruction(specialist: &Specialist, specs: &[ToolSpec]) -> String {
    let names = specs.iter().map(|s| s.name.as_str()).collect::<Vec<_>>().join(", ");
    let mut system = format!(
        "You are the '{}' specialist: {}.\nYou may only use these tools: {}.\n\
         Tool arguments may reference earlier results of this run as {{{{toolName.field}}}}.\n\
         Call ask_user at most once, and only when you cannot proceed without an answer.\n\
         Finish with a short plain-text summary of what you did.",
        specialist.id,
        specialist.description,
        if names.is_empty() { "(none)".to_string() } else { names }
    );
    if !specialist.instructions.is_empty() {
        system.push_str("\n\n");
        system.push_str(&specialist.instructions);
    }
    system
}

/// Last text (truncated), or the question when interrupted, plus a
/// `[Created <kind> id: <id>]` marker for every creation result.
fn summarize(last_text: Option<&str>, records: &[ToolCallRecord], waiting: Option<&UserQuestion>) -> String {
    let mut summary = match (waiting, last_text) {
        (Some(q), _) => q.question.clone(),
        (None, Some(text)) => truncate(text.trim(), SUMMARY_LIMIT),
        (None, None) => String::new(),
    };
    for record in records {
        let Some(kind) = created_kind(&record.tool) else {
            continue;
        };
        if let Some(id) = record.result.get("id").and_then(|v| v.as_str()) {
            if !summary.is_empty() {
                summary.push(' ');
            }
            summary.push_str(&format!("[Created {} id: {}]", kind, id));
        }
    }
    summary
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let truncated: String = s.chars().take(max.saturating_sub(3)).collect();
        format!("{}...", truncated)
    }
}
