//! CLI command implementations.
//!
//! Each submodule corresponds to a top-level CLI command. Commands that touch
//! agents, workflows, runs or reminders go through the same tool dispatcher
//! the specialists use, so the CLI and the orchestrator share one code path.

pub mod agent;
pub mod ask;
pub mod reminder;
pub mod specialists;
pub mod workflow;

use std::sync::Arc;

use muster_core::llm::{AnthropicClient, LlmClient, LlmResponse, ScriptedLlmClient};
use muster_core::scheduler::ConversationSink;
use muster_core::state::{AppState, AppStateInner};
use muster_core::tools::{is_tool_error, ToolContext};
use muster_core::{Database, MusterConfig};
use serde_json::Value;

/// Open the database and wire the shared `AppState`.
pub async fn init_state(
    config: MusterConfig,
    offline: bool,
    sink: Arc<dyn ConversationSink>,
) -> Result<AppState, String> {
    let db = Database::open(&config.db_path)
        .map_err(|e| format!("Failed to open database '{}': {}", config.db_path, e))?;

    let llm: Arc<dyn LlmClient> = if offline {
        Arc::new(offline_llm())
    } else {
        if config.llm.api_key.is_empty() {
            tracing::warn!("[CLI] No API key configured; LLM calls will fail (set ANTHROPIC_API_KEY or use --offline)");
        }
        Arc::new(AnthropicClient::new(config.llm.clone()))
    };

    let state = AppStateInner::new(db, config, llm, sink)
        .await
        .map_err(|e| format!("Failed to initialize state: {}", e))?;
    Ok(Arc::new(state))
}

/// LLM stand-in for `--offline`: never plans (so routing falls back to
/// keywords) and answers every specialist with a fixed note.
pub fn offline_llm() -> ScriptedLlmClient {
    ScriptedLlmClient::from_fn(|request| {
        let task: String = request.last_user_text().chars().take(120).collect();
        Ok(LlmResponse::text(format!("(offline) received: {}", task)))
    })
}

/// Execute one built-in tool and turn an inline `{"error": ...}` into `Err`.
pub async fn call_tool(
    state: &AppState,
    name: &str,
    args: Value,
    conversation_id: Option<&str>,
) -> Result<Value, String> {
    let ctx = ToolContext {
        registry: Some(state.registry.clone()),
        ..ToolContext::for_conversation(conversation_id)
    };
    let result = state
        .tools
        .execute(name, args, &ctx)
        .await
        .map_err(|e| e.to_string())?;
    if is_tool_error(&result) {
        let message = result["error"].as_str().unwrap_or("tool failed").to_string();
        return Err(message);
    }
    Ok(result)
}

/// Pretty-print a JSON value to stdout.
pub fn print_json(value: &Value) {
    println!(
        "{}",
        serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
    );
}
