//! `muster ask`: Route a message through the planner and the specialists.
//!
//! With a message argument, one turn runs and the process exits. Without
//! one, lines are read from stdin as successive turns of the same
//! conversation, so a question a specialist asks can be answered on the next
//! line.

use std::collections::HashSet;
use std::io::{BufRead, Write};
use std::time::Duration;

use muster_core::orchestration::{Heap, TurnRequest, TurnResult};
use muster_core::state::AppState;

use super::workflow;

const RUN_TOOLS: [&str; 3] = ["run_workflow", "run_agent", "respond_to_run"];

pub struct AskOptions<'a> {
    pub conversation_id: &'a str,
    pub context: Option<&'a str>,
    pub waiting_run: Option<&'a str>,
    /// How long to wait for runs a turn started.
    pub wait: Duration,
}

pub async fn run(state: &AppState, message: Option<&str>, opts: &AskOptions<'_>) -> Result<(), String> {
    let heap = state.heap();
    match message {
        Some(message) => {
            one_turn(state, &heap, message, opts).await?;
        }
        None => chat_loop(state, &heap, opts).await?,
    }
    Ok(())
}

async fn chat_loop(state: &AppState, heap: &Heap, opts: &AskOptions<'_>) -> Result<(), String> {
    println!("💬 Conversation {} (empty line or Ctrl-D to quit)", opts.conversation_id);
    let stdin = std::io::stdin();
    let mut recent: Option<String> = opts.context.map(|c| c.to_string());
    loop {
        print!("> ");
        std::io::stdout().flush().ok();

        let mut line = String::new();
        let read = stdin.lock().read_line(&mut line).map_err(|e| e.to_string())?;
        let line = line.trim();
        if read == 0 || line.is_empty() {
            break;
        }

        let turn_opts = AskOptions {
            context: recent.as_deref(),
            ..*opts
        };
        let result = one_turn(state, heap, line, &turn_opts).await?;
        recent = Some(result.summary);
    }
    Ok(())
}

/// Run one turn, print it, and wait for any runs it started.
pub async fn one_turn(
    state: &AppState,
    heap: &Heap,
    message: &str,
    opts: &AskOptions<'_>,
) -> Result<TurnResult, String> {
    let result = heap
        .handle_turn(&TurnRequest {
            conversation_id: opts.conversation_id.to_string(),
            message: message.to_string(),
            recent_summary: opts.context.map(|c| c.to_string()),
            waiting_run: opts.waiting_run.map(|r| r.to_string()),
        })
        .await;
    print_turn(&result);

    for run_id in started_runs(&result) {
        let run = workflow::settle(state, &run_id, opts.wait).await?;
        if let Err(e) = workflow::report(&run) {
            println!("⚠ {}", e);
        }
    }
    Ok(result)
}

pub fn print_turn(result: &TurnResult) {
    let route: Vec<String> = result.order.iter().map(|step| step.ids().join(" + ")).collect();
    println!(
        "🧭 Route: {} ({})",
        route.join(" → "),
        if result.planned { "planned" } else { "keyword fallback" }
    );
    for entry in &result.trail {
        let mark = if entry.failed { "✗" } else { "•" };
        println!("  {} {}", mark, entry.specialist_id);
    }
    println!();
    println!("{}", result.summary);
    if let Some(interrupt) = &result.interrupt {
        println!();
        println!("❓ {} asks: {}", interrupt.specialist_id, interrupt.question.question);
        if !interrupt.question.options.is_empty() {
            println!("   Options: {}", interrupt.question.options.join(" / "));
        }
    }
}

/// Ids of runs that tools started or resumed during the turn, in call order.
pub fn started_runs(result: &TurnResult) -> Vec<String> {
    let mut seen = HashSet::new();
    result
        .outcomes
        .iter()
        .flat_map(|o| o.tool_results.iter())
        .filter(|call| RUN_TOOLS.contains(&call.tool.as_str()))
        .filter_map(|call| call.result.get("runId").and_then(|v| v.as_str()))
        .filter(|id| seen.insert(id.to_string()))
        .map(|id| id.to_string())
        .collect()
}
