//! Run lifecycle: start, pause, resume, cancel, fail.
//!
//! Every status-dependent write goes through
//! [`WorkflowRunStore::update_if_status`], so a cancel that lands while a node
//! is executing wins over the completion that follows it.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};

use super::engine::{EngineError, NodeExecutor, ResumeState, RunProgress, WorkflowEngine};
use crate::error::ServerError;
use crate::models::workflow_run::{
    RunPatch, RunStatus, RunTargetType, StepRecord, WorkflowRun, EMPTY_RESPONSE_PLACEHOLDER,
};
use crate::store::{AgentStore, WorkflowRunStore, WorkflowStore};

#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("run '{0}' not found")]
    NotFound(String),

    #[error("{0}")]
    InvalidTarget(String),

    #[error("run '{run_id}' is not waiting for user input (status: {status})")]
    NotWaiting { run_id: String, status: RunStatus },

    #[error("run '{run_id}' cannot be {action} while {status}")]
    WrongStatus {
        run_id: String,
        action: &'static str,
        status: RunStatus,
    },

    #[error(transparent)]
    Store(#[from] ServerError),
}

#[derive(Clone)]
pub struct WorkflowRunService {
    runs: WorkflowRunStore,
    workflows: WorkflowStore,
    agents: AgentStore,
    engine: Arc<WorkflowEngine>,
}

impl WorkflowRunService {
    pub fn new(
        runs: WorkflowRunStore,
        workflows: WorkflowStore,
        agents: AgentStore,
        executor: Arc<dyn NodeExecutor>,
    ) -> Self {
        let engine = Arc::new(WorkflowEngine::new(agents.clone(), executor));
        Self {
            runs,
            workflows,
            agents,
            engine,
        }
    }

    /// Start a workflow run in the background. `workflow` is an id or a name.
    pub async fn start_workflow(&self, workflow: &str, input: Value) -> Result<WorkflowRun, RunError> {
        let wf = match self.workflows.get(workflow).await? {
            Some(wf) => wf,
            None => self
                .workflows
                .list()
                .await?
                .into_iter()
                .find(|w| w.name == workflow)
                .ok_or_else(|| RunError::InvalidTarget(format!("workflow '{}' not found", workflow)))?,
        };
        self.start(RunTargetType::Workflow, &wf.id, input).await
    }

    /// Start a single-agent run in the background. `agent` is an id or a name.
    pub async fn start_agent(&self, agent: &str, input: Value) -> Result<WorkflowRun, RunError> {
        let agent = self
            .agents
            .find(agent)
            .await?
            .ok_or_else(|| RunError::InvalidTarget(format!("agent '{}' not found", agent)))?;
        self.start(RunTargetType::Agent, &agent.id, input).await
    }

    async fn start(&self, target_type: RunTargetType, target_id: &str, input: Value) -> Result<WorkflowRun, RunError> {
        let run = WorkflowRun::new(target_type, target_id, input);
        self.runs.insert(&run).await?;
        tracing::info!(
            "[RunService] Started {} run {} (target {})",
            target_type.as_str(),
            run.id,
            target_id
        );
        self.spawn_drive(run.id.clone(), None);
        Ok(run)
    }

    pub async fn get_run(&self, run_id: &str) -> Result<WorkflowRun, RunError> {
        self.runs
            .get(run_id)
            .await?
            .ok_or_else(|| RunError::NotFound(run_id.to_string()))
    }

    pub async fn list_recent(&self, limit: usize) -> Result<Vec<WorkflowRun>, RunError> {
        Ok(self.runs.list_recent(limit).await?)
    }

    /// Answer a paused run and continue it in the background.
    pub async fn respond_to_run(&self, run_id: &str, response: &str) -> Result<WorkflowRun, RunError> {
        let run = self.get_run(run_id).await?;
        if !run.status.can_transition_to(RunStatus::Running) {
            return Err(RunError::NotWaiting {
                run_id: run_id.to_string(),
                status: run.status,
            });
        }

        let response = if response.is_empty() {
            EMPTY_RESPONSE_PLACEHOLDER.to_string()
        } else {
            response.to_string()
        };
        let output = merge_inner(&run.output, [("response", json!(response))]);
        let patch = RunPatch {
            status: Some(RunStatus::Running),
            output: Some(output),
            finished_at: Some(None),
        };
        if !self
            .runs
            .update_if_status(run_id, &RunStatus::sources_of(RunStatus::Running), patch)
            .await?
        {
            let current = self.get_run(run_id).await?;
            return Err(RunError::NotWaiting {
                run_id: run_id.to_string(),
                status: current.status,
            });
        }

        tracing::info!("[RunService] Resuming run {} with response: {}", run_id, truncate(&response, 80));
        self.spawn_drive(
            run_id.to_string(),
            Some(ResumeState {
                steps: run.steps(),
                response,
            }),
        );
        self.get_run(run_id).await
    }

    /// Cancel a running or waiting run. Terminal runs are left untouched.
    pub async fn cancel_run(&self, run_id: &str) -> Result<WorkflowRun, RunError> {
        let run = self.get_run(run_id).await?;
        let wrong_status = |status| RunError::WrongStatus {
            run_id: run_id.to_string(),
            action: "cancelled",
            status,
        };
        if !run.status.can_transition_to(RunStatus::Cancelled) {
            return Err(wrong_status(run.status));
        }

        let patch = RunPatch {
            status: Some(RunStatus::Cancelled),
            finished_at: Some(Some(Utc::now())),
            ..Default::default()
        };
        if !self
            .runs
            .update_if_status(run_id, &RunStatus::sources_of(RunStatus::Cancelled), patch)
            .await?
        {
            let current = self.get_run(run_id).await?;
            return Err(wrong_status(current.status));
        }
        tracing::info!("[RunService] Cancelled run {}", run_id);
        self.get_run(run_id).await
    }

    /// Poll until the run leaves `running` or `timeout` elapses, then return
    /// its latest state.
    pub async fn wait_for_settle(&self, run_id: &str, timeout: Duration) -> Result<WorkflowRun, RunError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let run = self.get_run(run_id).await?;
            if run.status != RunStatus::Running || tokio::time::Instant::now() >= deadline {
                return Ok(run);
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    /// Drive the run on its own task. A store error or a panic while driving
    /// still leaves the row failed rather than stuck in `running`.
    fn spawn_drive(&self, run_id: String, resume: Option<ResumeState>) {
        let service = self.clone();
        tokio::spawn(async move {
            let driver = service.clone();
            let id = run_id.clone();
            let message = match tokio::spawn(async move { driver.drive(&id, resume).await }).await {
                Ok(Ok(())) => return,
                Ok(Err(e)) => format!("run could not be driven: {}", e),
                Err(join) if join.is_panic() => format!("run executor panicked: {}", panic_message(join.into_panic())),
                Err(join) => format!("run task was aborted: {}", join),
            };
            tracing::error!("[RunService] Run {}: {}", run_id, message);

            let steps = match service.runs.get(&run_id).await {
                Ok(Some(run)) => run.steps(),
                _ => Vec::new(),
            };
            if let Err(e) = service.fail(&run_id, &message, None, steps).await {
                tracing::error!("[RunService] Could not mark run {} failed: {}", run_id, e);
            }
        });
    }

    async fn drive(&self, run_id: &str, resume: Option<ResumeState>) -> Result<(), ServerError> {
        let Some(run) = self.runs.get(run_id).await? else {
            return Err(ServerError::NotFound(format!("run {}", run_id)));
        };
        let progress = StoreProgress {
            runs: self.runs.clone(),
            run_id: run_id.to_string(),
            base_output: run.output.clone(),
            steps: Mutex::new(resume.as_ref().map(|r| r.steps.clone()).unwrap_or_default()),
        };

        let result = match run.target_type {
            RunTargetType::Workflow => match self.workflows.get(&run.target_id).await? {
                Some(wf) => self.engine.run(run_id, &wf, run.input.clone(), resume, &progress).await,
                None => Err(EngineError::InvalidGraph(format!("workflow '{}' no longer exists", run.target_id))),
            },
            RunTargetType::Agent => match self.agents.get(&run.target_id).await? {
                Some(agent) => {
                    self.engine
                        .run_agent(run_id, &agent, run.input.clone(), resume, &progress)
                        .await
                }
                None => Err(EngineError::InvalidGraph(format!("agent '{}' no longer exists", run.target_id))),
            },
        };

        self.settle(run_id, &run.output, &progress, result).await
    }

    async fn settle(
        &self,
        run_id: &str,
        base_output: &Value,
        progress: &StoreProgress,
        result: Result<Value, EngineError>,
    ) -> Result<(), ServerError> {
        match result {
            Ok(output) => {
                let patch = RunPatch {
                    status: Some(RunStatus::Completed),
                    output: Some(json!({ "output": output, "steps": progress.steps() })),
                    finished_at: Some(Some(Utc::now())),
                };
                if self
                    .runs
                    .update_if_status(run_id, &RunStatus::sources_of(RunStatus::Completed), patch)
                    .await?
                {
                    tracing::info!("[RunService] Run {} completed", run_id);
                } else {
                    tracing::info!("[RunService] Run {} finished but is no longer running; completion dropped", run_id);
                }
            }
            Err(EngineError::Paused {
                node_id,
                question,
                options,
                steps,
            }) => {
                let mut output = merge_inner(
                    base_output,
                    [
                        ("question", json!(question)),
                        ("options", json!(options)),
                        ("pausedAt", json!(node_id)),
                    ],
                );
                // The answer to an earlier question does not belong to this one.
                if let Some(inner) = output.get_mut("output").and_then(|o| o.as_object_mut()) {
                    inner.remove("response");
                }
                output["steps"] = serde_json::to_value(&steps)?;
                let patch = RunPatch {
                    status: Some(RunStatus::WaitingForUser),
                    output: Some(output),
                    ..Default::default()
                };
                if self
                    .runs
                    .update_if_status(run_id, &RunStatus::sources_of(RunStatus::WaitingForUser), patch)
                    .await?
                {
                    tracing::info!("[RunService] Run {} waiting for user at {}", run_id, node_id);
                }
            }
            Err(EngineError::Cancelled { .. }) => {
                let patch = RunPatch {
                    status: Some(RunStatus::Cancelled),
                    finished_at: Some(Some(Utc::now())),
                    ..Default::default()
                };
                self.runs
                    .update_if_status(run_id, &RunStatus::sources_of(RunStatus::Cancelled), patch)
                    .await?;
                tracing::info!("[RunService] Run {} stopped after cancellation", run_id);
            }
            Err(EngineError::Failed { message, trace, steps }) => {
                self.fail(run_id, &message, trace, steps).await?;
            }
            Err(EngineError::InvalidGraph(message)) => {
                self.fail(run_id, &message, None, progress.steps()).await?;
            }
        }
        Ok(())
    }

    async fn fail(
        &self,
        run_id: &str,
        message: &str,
        trace: Option<String>,
        steps: Vec<StepRecord>,
    ) -> Result<(), ServerError> {
        let mut payload = json!({ "error": message });
        if let Some(trace) = trace {
            payload["trace"] = json!(trace);
        }
        let patch = RunPatch {
            status: Some(RunStatus::Failed),
            output: Some(json!({ "output": payload, "steps": steps })),
            finished_at: Some(Some(Utc::now())),
        };
        if self
            .runs
            .update_if_status(run_id, &RunStatus::sources_of(RunStatus::Failed), patch)
            .await?
        {
            tracing::warn!("[RunService] Run {} failed: {}", run_id, message);
        }
        Ok(())
    }
}

/// Persists the trail after every node while the run is still running.
struct StoreProgress {
    runs: WorkflowRunStore,
    run_id: String,
    base_output: Value,
    steps: Mutex<Vec<StepRecord>>,
}

impl StoreProgress {
    fn steps(&self) -> Vec<StepRecord> {
        self.steps.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl RunProgress for StoreProgress {
    async fn on_step(&self, steps: &[StepRecord], latest: &Value) {
        if let Ok(mut guard) = self.steps.lock() {
            *guard = steps.to_vec();
        }
        let mut output = merge_inner(&self.base_output, [("latest", latest.clone())]);
        output["steps"] = serde_json::to_value(steps).unwrap_or_else(|_| json!([]));
        let patch = RunPatch {
            output: Some(output),
            ..Default::default()
        };
        if let Err(e) = self
            .runs
            .update_if_status(&self.run_id, &[RunStatus::Running], patch)
            .await
        {
            tracing::warn!("[RunService] Failed to persist progress for {}: {}", self.run_id, e);
        }
    }

    async fn is_cancelled(&self) -> bool {
        match self.runs.get(&self.run_id).await {
            Ok(Some(run)) => run.status == RunStatus::Cancelled,
            Ok(None) => true,
            Err(_) => false,
        }
    }
}

/// Set fields on `output.output` without discarding the ones already there.
fn merge_inner<const N: usize>(output: &Value, fields: [(&str, Value); N]) -> Value {
    let mut merged = if output.is_object() { output.clone() } else { json!({}) };
    let mut inner = match merged.get("output") {
        Some(Value::Object(map)) => map.clone(),
        Some(Value::Null) | None => serde_json::Map::new(),
        Some(other) => {
            let mut map = serde_json::Map::new();
            map.insert("value".to_string(), other.clone());
            map
        }
    };
    for (key, value) in fields {
        inner.insert(key.to_string(), value);
    }
    merged["output"] = Value::Object(inner);
    if merged.get("steps").is_none() {
        merged["steps"] = json!([]);
    }
    merged
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let truncated: String = s.chars().take(max.saturating_sub(3)).collect();
        format!("{}...", truncated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::models::agent::{Agent, CreateAgentInput};
    use crate::models::workflow::{Workflow, WorkflowEdge, WorkflowNode};
    use crate::workflow::engine::{NodeError, NodeRequest};

    /// Pauses once, then echoes the user's answer.
    struct AskOnce;

    #[async_trait]
    impl NodeExecutor for AskOnce {
        async fn execute(&self, request: NodeRequest) -> Result<Value, NodeError> {
            match request.user_response {
                None => Err(NodeError::NeedsUserInput {
                    question: "Ship it?".to_string(),
                    options: vec!["Yes".to_string(), "No".to_string()],
                }),
                Some(answer) => Ok(json!({ "answer": answer })),
            }
        }
    }

    /// Blocks until released so tests can act on a running run.
    struct Gate(tokio::sync::Notify);

    #[async_trait]
    impl NodeExecutor for Gate {
        async fn execute(&self, _request: NodeRequest) -> Result<Value, NodeError> {
            self.0.notified().await;
            Ok(json!({ "done": true }))
        }
    }

    /// Finishes "draft" straight away; every other node asks once first.
    struct ReviewFlow;

    #[async_trait]
    impl NodeExecutor for ReviewFlow {
        async fn execute(&self, request: NodeRequest) -> Result<Value, NodeError> {
            match (request.node.id.as_str(), request.user_response) {
                ("draft", _) => Ok(json!({ "draft": "v1" })),
                (id, None) => Err(NodeError::NeedsUserInput {
                    question: format!("Approve {}?", id),
                    options: vec![],
                }),
                (id, Some(answer)) => Ok(json!({ "node": id, "answer": answer })),
            }
        }
    }

    struct Explodes;

    #[async_trait]
    impl NodeExecutor for Explodes {
        async fn execute(&self, _request: NodeRequest) -> Result<Value, NodeError> {
            panic!("node blew up")
        }
    }

    async fn service(executor: Arc<dyn NodeExecutor>) -> (WorkflowRunService, Agent) {
        service_on(Database::open_in_memory().unwrap(), executor).await
    }

    async fn service_on(db: Database, executor: Arc<dyn NodeExecutor>) -> (WorkflowRunService, Agent) {
        let agents = AgentStore::new(db.clone());
        let agent = Agent::new(CreateAgentInput {
            name: "approver".to_string(),
            description: None,
            system_prompt: "Approve things".to_string(),
            tool_names: vec![],
        });
        agents.save(&agent).await.unwrap();
        let svc = WorkflowRunService::new(
            WorkflowRunStore::new(db.clone()),
            WorkflowStore::new(db),
            agents,
            executor,
        );
        (svc, agent)
    }

    /// A linear workflow over `node_ids`, every node run by `agent`.
    async fn save_chain(svc: &WorkflowRunService, agent: &Agent, node_ids: &[&str]) -> String {
        let now = Utc::now();
        let workflow = Workflow {
            id: "wf-review".to_string(),
            name: "review".to_string(),
            description: None,
            nodes: node_ids
                .iter()
                .map(|id| WorkflowNode {
                    id: id.to_string(),
                    agent_id: agent.id.clone(),
                    label: None,
                })
                .collect(),
            edges: node_ids
                .windows(2)
                .map(|pair| WorkflowEdge {
                    from: pair[0].to_string(),
                    to: pair[1].to_string(),
                })
                .collect(),
            created_at: now,
            updated_at: now,
        };
        svc.workflows.save(&workflow).await.unwrap();
        workflow.id
    }

    #[tokio::test]
    async fn test_pause_resume_complete() {
        let (svc, agent) = service(Arc::new(AskOnce)).await;
        let run = svc.start_agent(&agent.name, json!("deploy")).await.unwrap();
        let paused = svc.wait_for_settle(&run.id, Duration::from_secs(5)).await.unwrap();
        assert_eq!(paused.status, RunStatus::WaitingForUser);
        assert_eq!(
            paused.pending_question(),
            Some(("Ship it?".to_string(), vec!["Yes".to_string(), "No".to_string()]))
        );

        let resumed = svc.respond_to_run(&run.id, "Yes").await.unwrap();
        assert_eq!(resumed.output["output"]["response"], "Yes");
        assert_eq!(resumed.output["output"]["question"], "Ship it?");

        let done = svc.wait_for_settle(&run.id, Duration::from_secs(5)).await.unwrap();
        assert_eq!(done.status, RunStatus::Completed);
        assert_eq!(done.output["output"]["answer"], "Yes");
        assert_eq!(done.steps().len(), 1);
        assert!(done.finished_at.is_some());
    }

    #[tokio::test]
    async fn test_respond_requires_waiting_status() {
        let gate = Arc::new(Gate(tokio::sync::Notify::new()));
        let (svc, agent) = service(gate.clone()).await;
        let run = svc.start_agent(&agent.id, Value::Null).await.unwrap();

        let err = svc.respond_to_run(&run.id, "Yes").await.unwrap_err();
        match err {
            RunError::NotWaiting { status, .. } => assert_eq!(status, RunStatus::Running),
            other => panic!("expected NotWaiting, got {:?}", other),
        }
        let unchanged = svc.get_run(&run.id).await.unwrap();
        assert_eq!(unchanged.status, RunStatus::Running);
        assert!(unchanged.output["output"].get("response").is_none());

        gate.0.notify_one();
    }

    #[tokio::test]
    async fn test_empty_response_uses_placeholder() {
        let (svc, agent) = service(Arc::new(AskOnce)).await;
        let run = svc.start_agent(&agent.id, Value::Null).await.unwrap();
        svc.wait_for_settle(&run.id, Duration::from_secs(5)).await.unwrap();

        let resumed = svc.respond_to_run(&run.id, "").await.unwrap();
        assert_eq!(resumed.output["output"]["response"], EMPTY_RESPONSE_PLACEHOLDER);
    }

    #[tokio::test]
    async fn test_cancel_wins_over_completion() {
        let gate = Arc::new(Gate(tokio::sync::Notify::new()));
        let (svc, agent) = service(gate.clone()).await;
        let run = svc.start_agent(&agent.id, Value::Null).await.unwrap();

        let cancelled = svc.cancel_run(&run.id).await.unwrap();
        assert_eq!(cancelled.status, RunStatus::Cancelled);
        gate.0.notify_one();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let after = svc.get_run(&run.id).await.unwrap();
        assert_eq!(after.status, RunStatus::Cancelled);

        let err = svc.cancel_run(&run.id).await.unwrap_err();
        assert!(matches!(err, RunError::WrongStatus { status: RunStatus::Cancelled, .. }));
    }

    #[tokio::test]
    async fn test_unknown_targets() {
        let (svc, _) = service(Arc::new(AskOnce)).await;
        assert!(matches!(
            svc.start_workflow("missing", Value::Null).await,
            Err(RunError::InvalidTarget(_))
        ));
        assert!(matches!(svc.get_run("nope").await, Err(RunError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_pause_after_first_node_keeps_its_step() {
        let (svc, agent) = service(Arc::new(ReviewFlow)).await;
        let workflow_id = save_chain(&svc, &agent, &["draft", "review"]).await;
        let run = svc.start_workflow(&workflow_id, json!("notes")).await.unwrap();

        let waiting = svc.wait_for_settle(&run.id, Duration::from_secs(5)).await.unwrap();
        assert_eq!(waiting.status, RunStatus::WaitingForUser);
        assert_eq!(waiting.output["output"]["pausedAt"], "review");
        let steps = waiting.steps();
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].node_id, "draft");
        assert_eq!(steps[0].output["draft"], "v1");

        svc.respond_to_run(&run.id, "Yes").await.unwrap();
        let done = svc.wait_for_settle(&run.id, Duration::from_secs(5)).await.unwrap();
        assert_eq!(done.status, RunStatus::Completed);
        let steps = done.steps();
        assert_eq!(steps.len(), 2);
        assert_eq!(steps[1].node_id, "review");
        assert_eq!(steps[1].input["draft"]["draft"], "v1");
        assert_eq!(done.output["output"]["answer"], "Yes");
    }

    #[tokio::test]
    async fn test_second_pause_drops_previous_answer() {
        let (svc, agent) = service(Arc::new(ReviewFlow)).await;
        let workflow_id = save_chain(&svc, &agent, &["draft", "review", "publish"]).await;
        let run = svc.start_workflow(&workflow_id, Value::Null).await.unwrap();
        svc.wait_for_settle(&run.id, Duration::from_secs(5)).await.unwrap();

        svc.respond_to_run(&run.id, "Yes").await.unwrap();
        let again = svc.wait_for_settle(&run.id, Duration::from_secs(5)).await.unwrap();
        assert_eq!(again.status, RunStatus::WaitingForUser);
        assert_eq!(again.output["output"]["question"], "Approve publish?");
        assert_eq!(again.output["output"]["pausedAt"], "publish");
        assert!(again.output["output"].get("response").is_none());
        assert_eq!(again.steps().len(), 2);

        svc.respond_to_run(&run.id, "Ship").await.unwrap();
        let done = svc.wait_for_settle(&run.id, Duration::from_secs(5)).await.unwrap();
        assert_eq!(done.status, RunStatus::Completed);
        assert_eq!(done.output["output"]["answer"], "Ship");
        assert_eq!(done.steps().len(), 3);
    }

    #[tokio::test]
    async fn test_panicking_node_fails_the_run() {
        let (svc, agent) = service(Arc::new(Explodes)).await;
        let run = svc.start_agent(&agent.id, Value::Null).await.unwrap();

        let failed = svc.wait_for_settle(&run.id, Duration::from_secs(5)).await.unwrap();
        assert_eq!(failed.status, RunStatus::Failed);
        let error = failed.output["output"]["error"].as_str().unwrap();
        assert!(error.contains("node blew up"), "unexpected error: {}", error);
        assert!(failed.finished_at.is_some());
    }

    #[tokio::test]
    async fn test_store_error_while_driving_fails_the_run() {
        let db = Database::open_in_memory().unwrap();
        let (svc, agent) = service_on(db.clone(), Arc::new(AskOnce)).await;
        let run = svc.start_agent(&agent.id, Value::Null).await.unwrap();
        // The driver task has not been polled yet on the current-thread runtime.
        db.with_conn(|conn| conn.execute_batch("DROP TABLE agents")).unwrap();

        let failed = svc.wait_for_settle(&run.id, Duration::from_secs(5)).await.unwrap();
        assert_eq!(failed.status, RunStatus::Failed);
        let error = failed.output["output"]["error"].as_str().unwrap();
        assert!(error.contains("could not be driven"), "unexpected error: {}", error);
    }

    #[test]
    fn test_merge_inner_keeps_existing_fields() {
        let base = json!({ "output": { "question": "Q" }, "steps": [1] });
        let merged = merge_inner(&base, [("response", json!("A"))]);
        assert_eq!(merged["output"]["question"], "Q");
        assert_eq!(merged["output"]["response"], "A");
        assert_eq!(merged["steps"], json!([1]));
    }
}
