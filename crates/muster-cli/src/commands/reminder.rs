//! `muster reminder`: Schedule, inspect and deliver reminders.

use std::time::Duration;

use chrono::{DateTime, Local, NaiveDateTime, TimeZone};
use muster_core::orchestration::{Heap, TurnRequest};
use muster_core::scheduler::SyntheticTurn;
use muster_core::state::AppState;
use serde_json::json;
use tokio::sync::mpsc::UnboundedReceiver;

use super::{ask, call_tool, print_json};

/// How long `watch --until-idle` keeps listening after the last timer fired.
const IDLE_GRACE: Duration = Duration::from_millis(500);

pub struct NewReminder<'a> {
    pub message: &'a str,
    pub in_minutes: Option<f64>,
    /// RFC 3339, or local "YYYY-MM-DD HH:MM"
    pub at: Option<&'a str>,
    pub conversation_id: Option<&'a str>,
    pub task_type: Option<&'a str>,
}

pub async fn add(state: &AppState, reminder: &NewReminder<'_>) -> Result<(), String> {
    let mut args = json!({ "message": reminder.message });
    if let Some(minutes) = reminder.in_minutes {
        args["inMinutes"] = json!(minutes);
    }
    if let Some(at) = reminder.at {
        args["runAt"] = json!(normalize_at(at)?);
    }
    if let Some(task_type) = reminder.task_type {
        args["taskType"] = json!(task_type);
    }
    let result = call_tool(state, "create_reminder", args, reminder.conversation_id).await?;
    print_json(&result);
    println!("Reminders fire while `muster reminder watch` is running.");
    Ok(())
}

/// Accept RFC 3339 as-is; read a bare "YYYY-MM-DD HH:MM" as local time.
fn normalize_at(at: &str) -> Result<String, String> {
    let at = at.trim();
    if DateTime::parse_from_rfc3339(at).is_ok() {
        return Ok(at.to_string());
    }
    let naive = NaiveDateTime::parse_from_str(at, "%Y-%m-%d %H:%M")
        .map_err(|_| format!("cannot read time '{}': use RFC 3339 or YYYY-MM-DD HH:MM", at))?;
    Local
        .from_local_datetime(&naive)
        .single()
        .map(|t| t.to_rfc3339())
        .ok_or_else(|| format!("'{}' is ambiguous or skipped in the local timezone", at))
}

pub async fn list(state: &AppState, conversation_id: Option<&str>) -> Result<(), String> {
    let result = call_tool(state, "list_reminders", json!({}), conversation_id).await?;
    print_json(&result);
    Ok(())
}

pub async fn cancel(state: &AppState, reminder_id: &str) -> Result<(), String> {
    let result = call_tool(state, "cancel_reminder", json!({ "reminderId": reminder_id }), None).await?;
    print_json(&result);
    Ok(())
}

/// Re-arm every pending reminder and deliver `assistant_task` reminders as
/// synthetic turns of their conversation. Runs until Ctrl-C, or with
/// `until_idle` until no timers remain. Returns the number of turns handled.
pub async fn watch(
    state: &AppState,
    mut turns: UnboundedReceiver<SyntheticTurn>,
    until_idle: bool,
) -> Result<usize, String> {
    let restored = state.reminders.restore().await.map_err(|e| e.to_string())?;
    println!("⏰ Watching {} pending reminder(s). Press Ctrl-C to stop.", restored);

    let heap = state.heap();
    let mut handled = 0;
    let mut idle_check = tokio::time::interval(Duration::from_millis(100));
    loop {
        tokio::select! {
            turn = turns.recv() => {
                let Some(turn) = turn else { break };
                deliver(&heap, &turn).await;
                handled += 1;
            }
            _ = idle_check.tick(), if until_idle => {
                if state.reminders.active_timers() == 0 {
                    // A fired timer hands its turn off to a detached task.
                    while let Ok(Some(turn)) = tokio::time::timeout(IDLE_GRACE, turns.recv()).await {
                        deliver(&heap, &turn).await;
                        handled += 1;
                    }
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                println!("Stopping reminder watch.");
                break;
            }
        }
    }
    Ok(handled)
}

async fn deliver(heap: &Heap, turn: &SyntheticTurn) {
    tracing::info!("[CLI] Delivering reminder turn to {}", turn.conversation_id);
    println!("🔔 {} ({})", turn.text, turn.conversation_id);
    let result = heap
        .handle_turn(&TurnRequest {
            conversation_id: turn.conversation_id.clone(),
            message: turn.text.clone(),
            ..Default::default()
        })
        .await;
    ask::print_turn(&result);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_at() {
        assert_eq!(normalize_at("2099-01-01T09:30:00Z").unwrap(), "2099-01-01T09:30:00Z");

        let local = normalize_at("2099-01-01 09:30").unwrap();
        let parsed = DateTime::parse_from_rfc3339(&local).unwrap();
        assert_eq!(parsed.with_timezone(&Local).format("%H:%M").to_string(), "09:30");

        assert!(normalize_at("tomorrow").is_err());
    }
}
