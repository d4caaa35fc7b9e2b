//! `muster workflow`: Create, run and steer workflow runs.

use std::time::Duration;

use muster_core::models::{RunStatus, WorkflowRun};
use muster_core::state::AppState;
use muster_core::workflow::WorkflowDefinition;
use serde_json::{json, Value};

use super::{call_tool, print_json};

/// Store a workflow from a YAML file. Node `agent` fields may name an agent
/// by id or by name.
pub async fn create(state: &AppState, workflow_file: &str) -> Result<(), String> {
    let definition = WorkflowDefinition::from_file(workflow_file)?;
    definition.validate()?;
    println!(
        "📄 Loaded workflow: {} ({} node(s), {} edge(s))",
        definition.name,
        definition.nodes.len(),
        definition.edges.len()
    );

    let args = serde_json::to_value(&definition).map_err(|e| e.to_string())?;
    let result = call_tool(state, "create_workflow", args, None).await?;
    print_json(&result);
    Ok(())
}

pub async fn list(state: &AppState) -> Result<(), String> {
    let result = call_tool(state, "list_workflows", json!({}), None).await?;
    print_json(&result);
    Ok(())
}

/// Start a run of a workflow (or, with `agent`, of a single agent) and wait
/// for it to settle.
pub async fn run(
    state: &AppState,
    target: &str,
    input: Option<&str>,
    agent: bool,
    wait: Duration,
) -> Result<(), String> {
    let input = parse_input(input)?;
    let result = if agent {
        call_tool(state, "run_agent", json!({ "agentId": target, "input": input }), None).await?
    } else {
        call_tool(state, "run_workflow", json!({ "workflowId": target, "input": input }), None).await?
    };
    let run_id = run_id_of(&result)?;
    println!("▶ Started run {}", run_id);

    let run = settle(state, &run_id, wait).await?;
    report(&run)
}

/// Show one run, or the most recent runs when no id is given.
pub async fn status(state: &AppState, run_id: Option<&str>) -> Result<(), String> {
    match run_id {
        Some(id) => {
            let result = call_tool(state, "get_run", json!({ "runId": id }), None).await?;
            print_json(&result);
        }
        None => {
            let runs = state.runs.list_recent(20).await.map_err(|e| e.to_string())?;
            if runs.is_empty() {
                println!("No runs yet.");
            }
            for run in runs {
                println!(
                    "{}  {:<16} {:<8} {}  {}",
                    run.id,
                    run.status.as_str(),
                    run.target_type.as_str(),
                    run.target_id,
                    run.started_at.format("%Y-%m-%d %H:%M:%S")
                );
            }
        }
    }
    Ok(())
}

/// Answer a waiting run and wait for it to settle again.
pub async fn respond(state: &AppState, run_id: &str, response: &str, wait: Duration) -> Result<(), String> {
    call_tool(
        state,
        "respond_to_run",
        json!({ "runId": run_id, "response": response }),
        None,
    )
    .await?;
    println!("↩ Resumed run {}", run_id);

    let run = settle(state, run_id, wait).await?;
    report(&run)
}

pub async fn cancel(state: &AppState, run_id: &str) -> Result<(), String> {
    let result = call_tool(state, "cancel_run", json!({ "runId": run_id }), None).await?;
    print_json(&result);
    Ok(())
}

/// Wait until `run_id` leaves `running`. A run still running at the
/// deadline is cancelled, since nothing drives it once this process exits.
pub async fn settle(state: &AppState, run_id: &str, wait: Duration) -> Result<WorkflowRun, String> {
    let run = state
        .runs
        .wait_for_settle(run_id, wait)
        .await
        .map_err(|e| e.to_string())?;
    if run.status != RunStatus::Running {
        return Ok(run);
    }

    tracing::warn!("[CLI] Run {} did not settle within {:?}; cancelling", run_id, wait);
    match state.runs.cancel_run(run_id).await {
        Ok(cancelled) => Ok(cancelled),
        // It settled between the deadline and the cancel.
        Err(_) => state.runs.get_run(run_id).await.map_err(|e| e.to_string()),
    }
}

/// Print a settled run. Failed and cancelled runs are reported as errors.
pub fn report(run: &WorkflowRun) -> Result<(), String> {
    match run.status {
        RunStatus::Completed => {
            print_json(run.output.get("output").unwrap_or(&Value::Null));
            println!("\n🎉 Run {} completed ({} step(s))", run.id, run.steps().len());
            Ok(())
        }
        RunStatus::WaitingForUser => {
            let (question, options) = run.pending_question().unwrap_or_default();
            println!("❓ Run {} is waiting for input: {}", run.id, question);
            if !options.is_empty() {
                println!("   Options: {}", options.join(" / "));
            }
            println!("   Answer with: muster workflow respond {} \"<answer>\"", run.id);
            Ok(())
        }
        RunStatus::Running => {
            println!("⏳ Run {} is still running", run.id);
            Ok(())
        }
        RunStatus::Failed => {
            let message = run
                .output
                .get("output")
                .and_then(|o| o.get("error"))
                .and_then(|e| e.as_str())
                .unwrap_or("unknown error");
            Err(format!("Run {} failed: {}", run.id, message))
        }
        RunStatus::Cancelled => Err(format!("Run {} was cancelled", run.id)),
    }
}

/// `--input` is JSON when it parses as JSON, otherwise a plain string.
pub fn parse_input(input: Option<&str>) -> Result<Value, String> {
    Ok(match input {
        None => Value::Null,
        Some(raw) => serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string())),
    })
}

fn run_id_of(result: &Value) -> Result<String, String> {
    result
        .get("runId")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| format!("unexpected tool result: {}", result))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_input_accepts_json_or_text() {
        assert_eq!(parse_input(None).unwrap(), Value::Null);
        assert_eq!(parse_input(Some(r#"{"topic":"rust"}"#)).unwrap(), json!({"topic": "rust"}));
        assert_eq!(parse_input(Some("plain words")).unwrap(), json!("plain words"));
    }
}
