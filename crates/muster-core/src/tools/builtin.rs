//! Built-in tools.
//!
//! Most are simple reads and writes against the stores; `run_workflow`,
//! `run_agent` and `create_reminder` launch long-running operations.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};

use super::{
    str_arg, string_list_arg, tool_error, waiting_for_user, ToolContext, ToolDispatcher,
    ASK_USER_TOOL,
};
use crate::error::ServerError;
use crate::llm::ToolSpec;
use crate::models::agent::{Agent, CreateAgentInput};
use crate::models::reminder::{CreateReminderInput, ReminderTaskType};
use crate::models::workflow::{WorkflowEdge, WorkflowNode};
use crate::scheduler::{ReminderError, ReminderScheduler};
use crate::store::{AgentStore, WorkflowStore};
use crate::workflow::runs::{RunError, WorkflowRunService};
use crate::workflow::schema::WorkflowDefinition;

pub struct BuiltinTools {
    agents: AgentStore,
    workflows: WorkflowStore,
    runs: WorkflowRunService,
    reminders: ReminderScheduler,
}

impl BuiltinTools {
    pub fn new(
        agents: AgentStore,
        workflows: WorkflowStore,
        runs: WorkflowRunService,
        reminders: ReminderScheduler,
    ) -> Self {
        Self {
            agents,
            workflows,
            runs,
            reminders,
        }
    }

    pub fn into_dispatcher(self) -> Arc<dyn ToolDispatcher> {
        Arc::new(self)
    }

    // ─── Interrupts ──────────────────────────────────────────────────────

    fn ask_user(&self, args: &Value) -> Value {
        let Some(question) = str_arg(args, "question") else {
            return tool_error("question is required");
        };
        waiting_for_user(question, &string_list_arg(args, "options"))
    }

    // ─── Agents ──────────────────────────────────────────────────────────

    async fn create_agent(&self, args: Value) -> Result<Value, ServerError> {
        let Some(name) = str_arg(&args, "name") else {
            return Ok(tool_error("name is required"));
        };
        let agent = Agent::new(CreateAgentInput {
            name: name.to_string(),
            description: str_arg(&args, "description").map(|s| s.to_string()),
            system_prompt: str_arg(&args, "systemPrompt").unwrap_or_default().to_string(),
            tool_names: string_list_arg(&args, "toolNames"),
        });
        self.agents.save(&agent).await?;
        tracing::info!("[Tools] Created agent {} ({})", agent.name, agent.id);
        Ok(json!({ "id": agent.id, "name": agent.name }))
    }

    async fn list_agents(&self) -> Result<Value, ServerError> {
        let agents = self.agents.list().await?;
        let summary: Vec<Value> = agents
            .iter()
            .map(|a| json!({ "id": a.id, "name": a.name, "description": a.description }))
            .collect();
        Ok(json!({ "agents": summary, "count": summary.len() }))
    }

    // ─── Workflows ───────────────────────────────────────────────────────

    async fn create_workflow(&self, args: Value) -> Result<Value, ServerError> {
        let Some(name) = str_arg(&args, "name") else {
            return Ok(tool_error("name is required"));
        };
        let nodes: Vec<WorkflowNode> =
            match serde_json::from_value(args.get("nodes").cloned().unwrap_or(json!([]))) {
                Ok(n) => n,
                Err(e) => return Ok(tool_error(format!("invalid nodes: {}", e))),
            };
        let edges: Vec<WorkflowEdge> =
            match serde_json::from_value(args.get("edges").cloned().unwrap_or(json!([]))) {
                Ok(e) => e,
                Err(e) => return Ok(tool_error(format!("invalid edges: {}", e))),
            };

        let definition = WorkflowDefinition {
            name: name.to_string(),
            description: str_arg(&args, "description").map(|s| s.to_string()),
            nodes,
            edges,
        };
        if let Err(e) = definition.validate() {
            return Ok(tool_error(e));
        }
        for node in &definition.nodes {
            if self.agents.find(&node.agent_id).await?.is_none() {
                return Ok(tool_error(format!(
                    "node '{}' references unknown agent '{}'",
                    node.id, node.agent_id
                )));
            }
        }

        let workflow = definition.into_workflow();
        self.workflows.save(&workflow).await?;
        tracing::info!("[Tools] Created workflow {} ({})", workflow.name, workflow.id);
        Ok(json!({ "id": workflow.id, "name": workflow.name, "nodeCount": workflow.nodes.len() }))
    }

    async fn list_workflows(&self) -> Result<Value, ServerError> {
        let workflows = self.workflows.list().await?;
        let summary: Vec<Value> = workflows
            .iter()
            .map(|w| json!({ "id": w.id, "name": w.name, "nodeCount": w.nodes.len() }))
            .collect();
        Ok(json!({ "workflows": summary, "count": summary.len() }))
    }

    // ─── Runs ────────────────────────────────────────────────────────────

    async fn run_workflow(&self, args: Value) -> Result<Value, ServerError> {
        let Some(workflow_id) = str_arg(&args, "workflowId") else {
            return Ok(tool_error("workflowId is required"));
        };
        let input = args.get("input").cloned().unwrap_or(Value::Null);
        run_result(self.runs.start_workflow(workflow_id, input).await)
    }

    async fn run_agent(&self, args: Value) -> Result<Value, ServerError> {
        let Some(agent_id) = str_arg(&args, "agentId") else {
            return Ok(tool_error("agentId is required"));
        };
        let input = args.get("input").cloned().unwrap_or(Value::Null);
        run_result(self.runs.start_agent(agent_id, input).await)
    }

    async fn get_run(&self, args: Value) -> Result<Value, ServerError> {
        let Some(run_id) = str_arg(&args, "runId") else {
            return Ok(tool_error("runId is required"));
        };
        match self.runs.get_run(run_id).await {
            Ok(run) => {
                let mut v = serde_json::to_value(&run)?;
                if let Some((question, options)) = run.pending_question() {
                    v["question"] = json!(question);
                    v["options"] = json!(options);
                }
                Ok(v)
            }
            Err(e) => run_error(e),
        }
    }

    async fn respond_to_run(&self, args: Value) -> Result<Value, ServerError> {
        let Some(run_id) = str_arg(&args, "runId") else {
            return Ok(tool_error("runId is required"));
        };
        // Whitespace is preserved; only an absent/empty response gets the placeholder.
        let response = args.get("response").and_then(|v| v.as_str()).unwrap_or("");
        run_result(self.runs.respond_to_run(run_id, response).await)
    }

    async fn cancel_run(&self, args: Value) -> Result<Value, ServerError> {
        let Some(run_id) = str_arg(&args, "runId") else {
            return Ok(tool_error("runId is required"));
        };
        run_result(self.runs.cancel_run(run_id).await)
    }

    // ─── Reminders ───────────────────────────────────────────────────────

    async fn create_reminder(&self, args: Value, ctx: &ToolContext) -> Result<Value, ServerError> {
        let task_type = match str_arg(&args, "taskType") {
            None => None,
            Some(t) => match ReminderTaskType::from_str(t) {
                Some(t) => Some(t),
                None => return Ok(tool_error(format!("unknown taskType '{}'", t))),
            },
        };
        let run_at = match str_arg(&args, "runAt") {
            None => None,
            Some(s) => match chrono::DateTime::parse_from_rfc3339(s) {
                Ok(t) => Some(t.with_timezone(&Utc)),
                Err(e) => return Ok(tool_error(format!("invalid runAt '{}': {}", s, e))),
            },
        };
        let input = CreateReminderInput {
            message: str_arg(&args, "message").unwrap_or_default().to_string(),
            in_minutes: args.get("inMinutes").and_then(|v| v.as_f64()),
            run_at,
            conversation_id: str_arg(&args, "conversationId")
                .map(|s| s.to_string())
                .or_else(|| ctx.conversation_id.clone()),
            task_type,
        };
        match self.reminders.create(input).await {
            Ok(r) => Ok(json!({
                "id": r.id,
                "runAt": r.run_at,
                "status": r.status,
                "taskType": r.task_type,
            })),
            Err(e) => reminder_error(e),
        }
    }

    async fn list_reminders(&self, ctx: &ToolContext) -> Result<Value, ServerError> {
        let reminders = self.reminders.list(ctx.conversation_id.as_deref()).await?;
        Ok(json!({ "reminders": reminders, "count": reminders.len() }))
    }

    async fn cancel_reminder(&self, args: Value) -> Result<Value, ServerError> {
        let Some(id) = str_arg(&args, "reminderId") else {
            return Ok(tool_error("reminderId is required"));
        };
        match self.reminders.cancel(id).await {
            Ok(r) => Ok(json!({ "id": r.id, "status": r.status })),
            Err(e) => reminder_error(e),
        }
    }

    // ─── Registry ────────────────────────────────────────────────────────

    fn list_specialists(&self, ctx: &ToolContext) -> Value {
        let Some(registry) = &ctx.registry else {
            return tool_error("no specialist registry in this context");
        };
        let summary: Vec<Value> = registry
            .all()
            .iter()
            .map(|s| json!({ "id": s.id, "description": s.description, "composite": s.is_composite() }))
            .collect();
        json!({ "specialists": summary })
    }
}

fn run_result(
    result: Result<crate::models::workflow_run::WorkflowRun, RunError>,
) -> Result<Value, ServerError> {
    match result {
        Ok(run) => Ok(json!({ "runId": run.id, "status": run.status })),
        Err(e) => run_error(e),
    }
}

fn run_error(e: RunError) -> Result<Value, ServerError> {
    match e {
        RunError::Store(inner) => Err(inner),
        RunError::NotWaiting { status, .. } | RunError::WrongStatus { status, .. } => {
            Ok(json!({ "error": e.to_string(), "status": status }))
        }
        other => Ok(tool_error(other.to_string())),
    }
}

fn reminder_error(e: ReminderError) -> Result<Value, ServerError> {
    match e {
        ReminderError::Store(inner) => Err(inner),
        ReminderError::NotPending { status, .. } => {
            Ok(json!({ "error": e.to_string(), "status": status }))
        }
        other => Ok(tool_error(other.to_string())),
    }
}

fn spec(name: &str, description: &str, parameters: Value) -> ToolSpec {
    ToolSpec {
        name: name.to_string(),
        description: description.to_string(),
        parameters,
    }
}

fn builtin_specs() -> Vec<ToolSpec> {
    vec![
        spec(
            ASK_USER_TOOL,
            "Ask the user one question and stop until they answer. At most one per response.",
            json!({"type": "object", "properties": {
                "question": {"type": "string"},
                "options": {"type": "array", "items": {"type": "string"}}
            }, "required": ["question"]}),
        ),
        spec(
            "create_agent",
            "Create an agent with a system prompt.",
            json!({"type": "object", "properties": {
                "name": {"type": "string"},
                "description": {"type": "string"},
                "systemPrompt": {"type": "string"},
                "toolNames": {"type": "array", "items": {"type": "string"}}
            }, "required": ["name", "systemPrompt"]}),
        ),
        spec("list_agents", "List existing agents.", json!({"type": "object", "properties": {}})),
        spec(
            "create_workflow",
            "Create a workflow graph whose nodes each run an agent.",
            json!({"type": "object", "properties": {
                "name": {"type": "string"},
                "description": {"type": "string"},
                "nodes": {"type": "array", "items": {"type": "object", "properties": {
                    "id": {"type": "string"}, "agentId": {"type": "string"}, "label": {"type": "string"}
                }, "required": ["id", "agentId"]}},
                "edges": {"type": "array", "items": {"type": "object", "properties": {
                    "from": {"type": "string"}, "to": {"type": "string"}
                }, "required": ["from", "to"]}}
            }, "required": ["name", "nodes"]}),
        ),
        spec("list_workflows", "List existing workflows.", json!({"type": "object", "properties": {}})),
        spec(
            "run_workflow",
            "Start a workflow run in the background. Returns the run id.",
            json!({"type": "object", "properties": {
                "workflowId": {"type": "string"}, "input": {}
            }, "required": ["workflowId"]}),
        ),
        spec(
            "run_agent",
            "Start a single-agent run in the background. Returns the run id.",
            json!({"type": "object", "properties": {
                "agentId": {"type": "string"}, "input": {}
            }, "required": ["agentId"]}),
        ),
        spec(
            "get_run",
            "Get a run's status, output and step trail.",
            json!({"type": "object", "properties": {"runId": {"type": "string"}}, "required": ["runId"]}),
        ),
        spec(
            "respond_to_run",
            "Answer a run that is waiting for user input and resume it.",
            json!({"type": "object", "properties": {
                "runId": {"type": "string"}, "response": {"type": "string"}
            }, "required": ["runId", "response"]}),
        ),
        spec(
            "cancel_run",
            "Cancel a running or waiting run.",
            json!({"type": "object", "properties": {"runId": {"type": "string"}}, "required": ["runId"]}),
        ),
        spec(
            "create_reminder",
            "Schedule a reminder. Give inMinutes or an RFC 3339 runAt. taskType assistant_task re-enters the conversation.",
            json!({"type": "object", "properties": {
                "message": {"type": "string"},
                "inMinutes": {"type": "number"},
                "runAt": {"type": "string"},
                "conversationId": {"type": "string"},
                "taskType": {"type": "string", "enum": ["message", "assistant_task"]}
            }, "required": ["message"]}),
        ),
        spec("list_reminders", "List reminders for this conversation.", json!({"type": "object", "properties": {}})),
        spec(
            "cancel_reminder",
            "Cancel a pending reminder.",
            json!({"type": "object", "properties": {"reminderId": {"type": "string"}}, "required": ["reminderId"]}),
        ),
        spec("list_specialists", "List available specialists.", json!({"type": "object", "properties": {}})),
    ]
}

#[async_trait]
impl ToolDispatcher for BuiltinTools {
    fn specs(&self) -> Vec<ToolSpec> {
        builtin_specs()
    }

    async fn execute(&self, name: &str, args: Value, ctx: &ToolContext) -> Result<Value, ServerError> {
        tracing::debug!("[Tools] execute {} {}", name, args);
        match name {
            ASK_USER_TOOL => Ok(self.ask_user(&args)),
            "create_agent" => self.create_agent(args).await,
            "list_agents" => self.list_agents().await,
            "create_workflow" => self.create_workflow(args).await,
            "list_workflows" => self.list_workflows().await,
            "run_workflow" => self.run_workflow(args).await,
            "run_agent" => self.run_agent(args).await,
            "get_run" => self.get_run(args).await,
            "respond_to_run" => self.respond_to_run(args).await,
            "cancel_run" => self.cancel_run(args).await,
            "create_reminder" => self.create_reminder(args, ctx).await,
            "list_reminders" => self.list_reminders(ctx).await,
            "cancel_reminder" => self.cancel_reminder(args).await,
            "list_specialists" => Ok(self.list_specialists(ctx)),
            other => Ok(tool_error(format!("Unknown tool: {}", other))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::llm::ScriptedLlmClient;
    use crate::scheduler::LoggingConversationSink;
    use crate::store::{ReminderStore, WorkflowRunStore};
    use crate::tools::is_tool_error;
    use crate::workflow::AgentNodeExecutor;

    fn tools() -> BuiltinTools {
        let db = Database::open_in_memory().unwrap();
        let agents = AgentStore::new(db.clone());
        let workflows = WorkflowStore::new(db.clone());
        let executor = Arc::new(AgentNodeExecutor::new(Arc::new(ScriptedLlmClient::new(vec![])), 256));
        let runs = WorkflowRunService::new(WorkflowRunStore::new(db.clone()), workflows.clone(), agents.clone(), executor);
        let reminders = ReminderScheduler::new(ReminderStore::new(db), Arc::new(LoggingConversationSink));
        BuiltinTools::new(agents, workflows, runs, reminders)
    }

    #[tokio::test]
    async fn test_create_agent_then_workflow() {
        let tools = tools();
        let ctx = ToolContext::default();
        let agent = tools
            .execute("create_agent", json!({ "name": "triage", "systemPrompt": "Sort issues" }), &ctx)
            .await
            .unwrap();
        let agent_id = agent["id"].as_str().unwrap().to_string();

        let wf = tools
            .execute(
                "create_workflow",
                json!({ "name": "flow", "nodes": [{ "id": "n1", "agentId": agent_id }] }),
                &ctx,
            )
            .await
            .unwrap();
        assert!(!is_tool_error(&wf));
        assert_eq!(wf["nodeCount"], 1);

        let listed = tools.execute("list_workflows", json!({}), &ctx).await.unwrap();
        assert_eq!(listed["count"], 1);
    }

    #[tokio::test]
    async fn test_validation_errors_are_inline() {
        let tools = tools();
        let ctx = ToolContext::default();

        let missing = tools.execute("create_agent", json!({}), &ctx).await.unwrap();
        assert_eq!(missing["error"], "name is required");

        let dangling = tools
            .execute("create_workflow", json!({ "name": "f", "nodes": [{ "id": "n1", "agentId": "ghost" }] }), &ctx)
            .await
            .unwrap();
        assert!(dangling["error"].as_str().unwrap().contains("unknown agent 'ghost'"));

        let unknown = tools.execute("teleport", json!({}), &ctx).await.unwrap();
        assert!(is_tool_error(&unknown));

        let run = tools.execute("get_run", json!({ "runId": "nope" }), &ctx).await.unwrap();
        assert!(run["error"].as_str().unwrap().contains("not found"));
    }

    #[tokio::test]
    async fn test_reminder_cancel_twice_reports_status() {
        let tools = tools();
        let ctx = ToolContext::for_conversation(Some("conv-1"));
        let created = tools
            .execute("create_reminder", json!({ "message": "stretch", "inMinutes": 60 }), &ctx)
            .await
            .unwrap();
        assert_eq!(created["status"], "pending");
        let id = created["id"].as_str().unwrap().to_string();

        let listed = tools.execute("list_reminders", json!({}), &ctx).await.unwrap();
        assert_eq!(listed["count"], 1);

        let first = tools.execute("cancel_reminder", json!({ "reminderId": id }), &ctx).await.unwrap();
        assert_eq!(first["status"], "cancelled");
        let second = tools.execute("cancel_reminder", json!({ "reminderId": id }), &ctx).await.unwrap();
        assert!(second["error"].as_str().unwrap().contains("not pending"));
        assert_eq!(second["status"], "cancelled");

        let bad = tools
            .execute("create_reminder", json!({ "message": "x", "inMinutes": -5 }), &ctx)
            .await
            .unwrap();
        assert!(is_tool_error(&bad));
    }

    #[tokio::test]
    async fn test_ask_user_shape() {
        let tools = tools();
        let out = tools
            .execute("ask_user", json!({ "question": "Which model?", "options": ["small", "large"] }), &ToolContext::default())
            .await
            .unwrap();
        assert!(crate::tools::is_waiting_for_user(&out));
        assert_eq!(out["options"][0], "small");
    }
}
