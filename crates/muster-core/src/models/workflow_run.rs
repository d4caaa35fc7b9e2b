use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Literal persisted when a run is resumed with an empty response.
pub const EMPTY_RESPONSE_PLACEHOLDER: &str = "(no response)";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    WaitingForUser,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::WaitingForUser => "waiting_for_user",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "running" => Some(Self::Running),
            "waiting_for_user" => Some(Self::WaitingForUser),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    pub const ALL: [RunStatus; 5] = [
        Self::Running,
        Self::WaitingForUser,
        Self::Completed,
        Self::Failed,
        Self::Cancelled,
    ];

    /// Whether the state machine allows moving from `self` to `next`.
    ///
    /// Only `waiting_for_user -> running` goes backwards; terminal states
    /// never change.
    pub fn can_transition_to(&self, next: RunStatus) -> bool {
        match (self, next) {
            (Self::Running, Self::WaitingForUser)
            | (Self::Running, Self::Completed)
            | (Self::Running, Self::Failed)
            | (Self::Running, Self::Cancelled) => true,
            (Self::WaitingForUser, Self::Running) | (Self::WaitingForUser, Self::Cancelled) => true,
            _ => false,
        }
    }

    /// Every status that may move to `next`. Used as the precondition of
    /// conditional run updates.
    pub fn sources_of(next: RunStatus) -> Vec<RunStatus> {
        Self::ALL.into_iter().filter(|s| s.can_transition_to(next)).collect()
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunTargetType {
    Workflow,
    Agent,
}

impl RunTargetType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Workflow => "workflow",
            Self::Agent => "agent",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "workflow" => Some(Self::Workflow),
            "agent" => Some(Self::Agent),
            _ => None,
        }
    }
}

/// One executed node in a run's trail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepRecord {
    pub order: usize,
    pub node_id: String,
    pub agent_name: String,
    pub input: serde_json::Value,
    pub output: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// One execution of a workflow (or a single agent).
///
/// `output` has the shape `{"output": <free-form>, "steps": [StepRecord]}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowRun {
    pub id: String,
    pub target_type: RunTargetType,
    pub target_id: String,
    pub status: RunStatus,
    pub input: serde_json::Value,
    pub output: serde_json::Value,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl WorkflowRun {
    pub fn new(target_type: RunTargetType, target_id: &str, input: serde_json::Value) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            target_type,
            target_id: target_id.to_string(),
            status: RunStatus::Running,
            input,
            output: serde_json::json!({ "output": {}, "steps": [] }),
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    /// The step trail persisted so far.
    pub fn steps(&self) -> Vec<StepRecord> {
        self.output
            .get("steps")
            .cloned()
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default()
    }

    /// The question a waiting run asked, if any.
    pub fn pending_question(&self) -> Option<(String, Vec<String>)> {
        if self.status != RunStatus::WaitingForUser {
            return None;
        }
        let inner = self.output.get("output")?;
        let question = inner.get("question")?.as_str()?.to_string();
        let options = inner
            .get("options")
            .and_then(|o| serde_json::from_value(o.clone()).ok())
            .unwrap_or_default();
        Some((question, options))
    }
}

/// Partial update applied by `WorkflowRunStore::update_partial`.
#[derive(Debug, Clone, Default)]
pub struct RunPatch {
    pub status: Option<RunStatus>,
    pub output: Option<serde_json::Value>,
    /// `Some(None)` clears `finished_at`.
    pub finished_at: Option<Option<DateTime<Utc>>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states_do_not_transition() {
        for terminal in [RunStatus::Completed, RunStatus::Failed, RunStatus::Cancelled] {
            assert!(!terminal.can_transition_to(RunStatus::Running));
            assert!(!terminal.can_transition_to(RunStatus::WaitingForUser));
        }
    }

    #[test]
    fn test_resume_is_the_only_back_edge() {
        assert!(RunStatus::WaitingForUser.can_transition_to(RunStatus::Running));
        assert!(!RunStatus::WaitingForUser.can_transition_to(RunStatus::Completed));
        assert!(RunStatus::Running.can_transition_to(RunStatus::Cancelled));
        assert!(!RunStatus::Running.can_transition_to(RunStatus::Running));
    }

    #[test]
    fn test_sources_of_follow_transition_table() {
        assert_eq!(
            RunStatus::sources_of(RunStatus::Cancelled),
            vec![RunStatus::Running, RunStatus::WaitingForUser]
        );
        assert_eq!(RunStatus::sources_of(RunStatus::Running), vec![RunStatus::WaitingForUser]);
        assert_eq!(RunStatus::sources_of(RunStatus::Completed), vec![RunStatus::Running]);
        assert_eq!(RunStatus::sources_of(RunStatus::WaitingForUser), vec![RunStatus::Running]);
    }

    #[test]
    fn test_status_round_trips_through_str() {
        assert_eq!(RunStatus::from_str("waiting_for_user"), Some(RunStatus::WaitingForUser));
        assert_eq!(RunStatus::WaitingForUser.as_str(), "waiting_for_user");
        assert_eq!(RunStatus::from_str("paused"), None);
    }
}
