//! Tool dispatch contract.
//!
//! `execute(name, args, context)` returns either a result value or an inline
//! `{"error": ...}` object the model can read and adapt to. Only truly
//! exceptional conditions (storage failure, broken invariants) are returned as
//! `Err` and abort the current specialist turn.

pub mod builtin;
pub mod template;

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::error::ServerError;
use crate::llm::ToolSpec;
use crate::orchestration::registry::SpecialistRegistry;

pub use builtin::BuiltinTools;
pub use template::{resolve_args, ToolRecord};

/// Name of the tool that pauses a turn for a human answer.
pub const ASK_USER_TOOL: &str = "ask_user";

/// Per-call context handed to the dispatcher.
#[derive(Clone, Default)]
pub struct ToolContext {
    pub conversation_id: Option<String>,
    pub vault_key: Option<String>,
    pub registry: Option<Arc<SpecialistRegistry>>,
}

impl ToolContext {
    pub fn for_conversation(conversation_id: Option<&str>) -> Self {
        Self {
            conversation_id: conversation_id.map(|c| c.to_string()),
            ..Default::default()
        }
    }
}

#[async_trait]
pub trait ToolDispatcher: Send + Sync {
    /// Every tool this dispatcher can execute.
    fn specs(&self) -> Vec<ToolSpec>;

    async fn execute(&self, name: &str, args: Value, ctx: &ToolContext) -> Result<Value, ServerError>;
}

/// Inline error result.
pub fn tool_error(message: impl Into<String>) -> Value {
    json!({ "error": message.into() })
}

pub fn is_tool_error(result: &Value) -> bool {
    result.get("error").map(|e| !e.is_null()).unwrap_or(false)
}

/// The interrupt shape returned by `ask_user`.
pub fn waiting_for_user(question: &str, options: &[String]) -> Value {
    let mut v = json!({ "waitingForUser": true, "question": question });
    if !options.is_empty() {
        v["options"] = json!(options);
    }
    v
}

pub fn is_waiting_for_user(result: &Value) -> bool {
    result.get("waitingForUser").and_then(|v| v.as_bool()).unwrap_or(false)
}

/// Creation tools whose result ids are surfaced as `[Created <kind> id: ...]`.
pub fn created_kind(tool_name: &str) -> Option<&'static str> {
    match tool_name {
        "create_agent" => Some("agent"),
        "create_workflow" => Some("workflow"),
        "create_reminder" => Some("reminder"),
        _ => None,
    }
}

/// Pull a string argument, treating blank strings as absent.
pub(crate) fn str_arg<'a>(args: &'a Value, key: &str) -> Option<&'a str> {
    args.get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
}

pub(crate) fn string_list_arg(args: &Value, key: &str) -> Vec<String> {
    args.get(key)
        .and_then(|v| v.as_array())
        .map(|items| {
            items
                .iter()
                .filter_map(|i| i.as_str().map(|s| s.to_string()))
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interrupt_and_error_shapes() {
        let waiting = waiting_for_user("Proceed?", &["Yes".to_string(), "No".to_string()]);
        assert!(is_waiting_for_user(&waiting));
        assert_eq!(waiting["options"][1], "No");
        assert!(!is_tool_error(&waiting));

        let err = tool_error("name is required");
        assert!(is_tool_error(&err));
        assert!(!is_waiting_for_user(&err));
        assert!(!is_tool_error(&json!({"error": null, "id": "1"})));
    }
}
