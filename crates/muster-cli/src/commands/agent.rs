//! `muster agent`: Agent management commands.

use muster_core::state::AppState;
use serde_json::json;

use super::{call_tool, print_json};

pub async fn list(state: &AppState) -> Result<(), String> {
    let result = call_tool(state, "list_agents", json!({}), None).await?;
    print_json(&result);
    Ok(())
}

pub async fn create(
    state: &AppState,
    name: &str,
    system_prompt: &str,
    description: Option<&str>,
    tool_names: &[String],
) -> Result<(), String> {
    let mut args = json!({
        "name": name,
        "systemPrompt": system_prompt,
        "toolNames": tool_names,
    });
    if let Some(d) = description {
        args["description"] = json!(d);
    }
    let result = call_tool(state, "create_agent", args, None).await?;
    print_json(&result);
    Ok(())
}
