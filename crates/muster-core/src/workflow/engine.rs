//! Graph walker for workflow runs.
//!
//! The engine is storage-agnostic: it reports progress through [`RunProgress`]
//! and leaves status transitions to the run service. A node can pause the walk
//! by returning [`NodeError::NeedsUserInput`]; the engine hands back the trail
//! so far inside [`EngineError::Paused`] and picks up from the same node on
//! resume.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use super::schema::{predecessors, topological_order};
use crate::llm::{ChatMessage, ChatRequest, LlmClient, ToolSpec};
use crate::models::agent::Agent;
use crate::models::workflow::{Workflow, WorkflowNode};
use crate::models::workflow_run::StepRecord;
use crate::store::AgentStore;
use crate::tools::ASK_USER_TOOL;

/// Everything a node needs to execute.
#[derive(Debug, Clone)]
pub struct NodeRequest {
    pub run_id: String,
    pub node: WorkflowNode,
    pub agent: Agent,
    pub input: Value,
    /// Set only for the node that paused, when the run is resumed.
    pub user_response: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum NodeError {
    NeedsUserInput { question: String, options: Vec<String> },
    Failed { message: String, trace: Option<String> },
}

impl NodeError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed {
            message: message.into(),
            trace: None,
        }
    }
}

#[async_trait]
pub trait NodeExecutor: Send + Sync {
    async fn execute(&self, request: NodeRequest) -> Result<Value, NodeError>;
}

/// Callbacks from the engine to whoever owns the run row.
#[async_trait]
pub trait RunProgress: Send + Sync {
    /// Called after every completed node with the full trail and the latest output.
    async fn on_step(&self, steps: &[StepRecord], latest: &Value);

    /// Polled between nodes.
    async fn is_cancelled(&self) -> bool;
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("waiting for user input at node '{node_id}': {question}")]
    Paused {
        node_id: String,
        question: String,
        options: Vec<String>,
        steps: Vec<StepRecord>,
    },

    #[error("run cancelled")]
    Cancelled { steps: Vec<StepRecord> },

    #[error("{message}")]
    Failed {
        message: String,
        trace: Option<String>,
        steps: Vec<StepRecord>,
    },

    #[error("invalid workflow graph: {0}")]
    InvalidGraph(String),
}

/// Where a resumed run picks up.
#[derive(Debug, Clone)]
pub struct ResumeState {
    pub steps: Vec<StepRecord>,
    pub response: String,
}

pub struct WorkflowEngine {
    agents: AgentStore,
    executor: Arc<dyn NodeExecutor>,
}

impl WorkflowEngine {
    pub fn new(agents: AgentStore, executor: Arc<dyn NodeExecutor>) -> Self {
        Self { agents, executor }
    }

    /// Run a single agent as a one-node graph.
    pub async fn run_agent(
        &self,
        run_id: &str,
        agent: &Agent,
        input: Value,
        resume: Option<ResumeState>,
        progress: &dyn RunProgress,
    ) -> Result<Value, EngineError> {
        let workflow = Workflow {
            id: agent.id.clone(),
            name: agent.name.clone(),
            description: None,
            nodes: vec![WorkflowNode {
                id: "agent".to_string(),
                agent_id: agent.id.clone(),
                label: None,
            }],
            edges: Vec::new(),
            created_at: agent.created_at,
            updated_at: agent.updated_at,
        };
        self.run(run_id, &workflow, input, resume, progress).await
    }

    pub async fn run(
        &self,
        run_id: &str,
        workflow: &Workflow,
        input: Value,
        resume: Option<ResumeState>,
        progress: &dyn RunProgress,
    ) -> Result<Value, EngineError> {
        let order = topological_order(&workflow.nodes, &workflow.edges).map_err(EngineError::InvalidGraph)?;

        let (mut steps, mut response) = match resume {
            Some(state) => (state.steps, Some(state.response)),
            None => (Vec::new(), None),
        };
        let mut outputs: HashMap<String, Value> = steps
            .iter()
            .filter(|s| s.error.is_none())
            .map(|s| (s.node_id.clone(), s.output.clone()))
            .collect();

        for idx in order {
            let node = &workflow.nodes[idx];
            if outputs.contains_key(&node.id) {
                continue;
            }
            if progress.is_cancelled().await {
                tracing::info!("[Engine] Run {} cancelled before node {}", run_id, node.id);
                return Err(EngineError::Cancelled { steps });
            }

            let preds = predecessors(&node.id, &workflow.nodes, &workflow.edges);
            let node_input = if preds.is_empty() {
                input.clone()
            } else {
                let mut map = serde_json::Map::new();
                for p in preds {
                    map.insert(p.to_string(), outputs.get(p).cloned().unwrap_or(Value::Null));
                }
                Value::Object(map)
            };

            let agent = match self.agents.find(&node.agent_id).await {
                Ok(Some(agent)) => agent,
                Ok(None) => {
                    let message = format!("node '{}' references unknown agent '{}'", node.id, node.agent_id);
                    return Err(failed_at(steps, node, &node.agent_id, node_input, &message, None));
                }
                Err(e) => {
                    return Err(failed_at(steps, node, &node.agent_id, node_input, &e.to_string(), None));
                }
            };

            tracing::debug!("[Engine] Run {} executing node {} ({})", run_id, node.id, agent.name);
            let request = NodeRequest {
                run_id: run_id.to_string(),
                node: node.clone(),
                agent: agent.clone(),
                input: node_input.clone(),
                user_response: response.take(),
            };

            match self.executor.execute(request).await {
                Ok(output) => {
                    steps.push(StepRecord {
                        order: steps.len() + 1,
                        node_id: node.id.clone(),
                        agent_name: agent.name.clone(),
                        input: node_input,
                        output: output.clone(),
                        error: None,
                    });
                    outputs.insert(node.id.clone(), output.clone());
                    progress.on_step(&steps, &output).await;
                }
                Err(NodeError::NeedsUserInput { question, options }) => {
                    tracing::info!("[Engine] Run {} paused at node {}", run_id, node.id);
                    return Err(EngineError::Paused {
                        node_id: node.id.clone(),
                        question,
                        options,
                        steps,
                    });
                }
                Err(NodeError::Failed { message, trace }) => {
                    return Err(failed_at(steps, node, &agent.name, node_input, &message, trace));
                }
            }
        }

        Ok(final_output(workflow, &outputs))
    }
}

/// Record a failed step at `node` and wrap the trail into [`EngineError::Failed`].
fn failed_at(
    mut steps: Vec<StepRecord>,
    node: &WorkflowNode,
    agent_name: &str,
    input: Value,
    message: &str,
    trace: Option<String>,
) -> EngineError {
    let message = with_capability_hint(message);
    steps.push(StepRecord {
        order: steps.len() + 1,
        node_id: node.id.clone(),
        agent_name: agent_name.to_string(),
        input,
        output: Value::Null,
        error: Some(message.clone()),
    });
    EngineError::Failed { message, trace, steps }
}

/// Output of the sink nodes: the value itself for a single sink, otherwise an
/// object keyed by node id.
fn final_output(workflow: &Workflow, outputs: &HashMap<String, Value>) -> Value {
    let sinks: Vec<&WorkflowNode> = workflow
        .nodes
        .iter()
        .filter(|n| !workflow.edges.iter().any(|e| e.from == n.id))
        .collect();
    if let [only] = sinks.as_slice() {
        return outputs.get(&only.id).cloned().unwrap_or(Value::Null);
    }
    let mut map = serde_json::Map::new();
    for sink in sinks {
        map.insert(sink.id.clone(), outputs.get(&sink.id).cloned().unwrap_or(Value::Null));
    }
    Value::Object(map)
}

/// Append a remediation hint to errors that come from the environment rather
/// than the workflow itself.
pub fn with_capability_hint(message: &str) -> String {
    let lower = message.to_lowercase();
    let hint = if lower.contains("api key") || lower.contains("401") || lower.contains("unauthorized") {
        Some("Set ANTHROPIC_AUTH_TOKEN or ANTHROPIC_API_KEY (or llm.api_key in the config file).")
    } else if lower.contains("http request failed")
        || lower.contains("connection refused")
        || lower.contains("timed out")
        || lower.contains("dns")
    {
        Some("The LLM provider is unreachable. Check ANTHROPIC_BASE_URL and network access.")
    } else if lower.contains("command not found") || lower.contains("not installed") || lower.contains("no such file") {
        Some("A required runtime is missing on this host. Install it or remove the node that needs it.")
    } else {
        None
    };
    match hint {
        Some(h) if !message.contains(h) => format!("{} (hint: {})", message, h),
        _ => message.to_string(),
    }
}

/// Runs a node by prompting its agent through the LLM. The agent may call
/// `ask_user` to pause the run.
pub struct AgentNodeExecutor {
    llm: Arc<dyn LlmClient>,
    max_tokens: u32,
}

impl AgentNodeExecutor {
    pub fn new(llm: Arc<dyn LlmClient>, max_tokens: u32) -> Self {
        Self { llm, max_tokens }
    }

    fn ask_user_spec() -> ToolSpec {
        ToolSpec {
            name: ASK_USER_TOOL.to_string(),
            description: "Ask the user a question and pause until they answer.".to_string(),
            parameters: json!({"type": "object", "properties": {
                "question": {"type": "string"},
                "options": {"type": "array", "items": {"type": "string"}}
            }, "required": ["question"]}),
        }
    }
}

#[async_trait]
impl NodeExecutor for AgentNodeExecutor {
    async fn execute(&self, request: NodeRequest) -> Result<Value, NodeError> {
        let mut prompt = match &request.input {
            Value::String(s) => s.clone(),
            Value::Null => String::new(),
            other => format!("Input:\n{}", serde_json::to_string_pretty(other).unwrap_or_default()),
        };
        if let Some(label) = &request.node.label {
            prompt = format!("Step: {}\n\n{}", label, prompt);
        }
        if let Some(answer) = &request.user_response {
            prompt.push_str(&format!("\n\nThe user answered your question: {}", answer));
        }
        if prompt.trim().is_empty() {
            prompt = format!("Carry out your role as {}.", request.agent.name);
        }

        let chat = ChatRequest {
            system: request.agent.system_prompt.clone(),
            messages: vec![ChatMessage::user(prompt)],
            tools: vec![Self::ask_user_spec()],
            max_tokens: Some(self.max_tokens),
        };
        let response = self
            .llm
            .complete(chat)
            .await
            .map_err(|e| NodeError::failed(e.to_string()))?;

        if let Some(call) = response.tool_calls.iter().find(|c| c.name == ASK_USER_TOOL) {
            // A resumed node already has its answer; asking again is allowed.
            let question = call
                .arguments
                .get("question")
                .and_then(|q| q.as_str())
                .unwrap_or("The agent needs more information.")
                .to_string();
            let options = crate::tools::string_list_arg(&call.arguments, "options");
            return Err(NodeError::NeedsUserInput { question, options });
        }

        Ok(json!({ "text": response.text.unwrap_or_default() }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::models::agent::CreateAgentInput;
    use crate::models::workflow::WorkflowEdge;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    /// Echoes its input, or pauses on nodes whose label is "ask".
    struct EchoExecutor;

    #[async_trait]
    impl NodeExecutor for EchoExecutor {
        async fn execute(&self, request: NodeRequest) -> Result<Value, NodeError> {
            match request.node.label.as_deref() {
                Some("ask") if request.user_response.is_none() => Err(NodeError::NeedsUserInput {
                    question: "Proceed?".to_string(),
                    options: vec!["Yes".to_string(), "No".to_string()],
                }),
                Some("boom") => Err(NodeError::failed("HTTP request failed: connection refused")),
                _ => Ok(json!({ "node": request.node.id, "input": request.input, "reply": request.user_response })),
            }
        }
    }

    #[derive(Default)]
    struct Recorder {
        steps_seen: Mutex<Vec<usize>>,
        cancel: AtomicBool,
    }

    #[async_trait]
    impl RunProgress for Recorder {
        async fn on_step(&self, steps: &[StepRecord], _latest: &Value) {
            self.steps_seen.lock().unwrap().push(steps.len());
        }
        async fn is_cancelled(&self) -> bool {
            self.cancel.load(Ordering::SeqCst)
        }
    }

    async fn setup() -> (WorkflowEngine, Agent) {
        let agents = AgentStore::new(Database::open_in_memory().unwrap());
        let agent = Agent::new(CreateAgentInput {
            name: "echo".to_string(),
            description: None,
            system_prompt: "Echo".to_string(),
            tool_names: vec![],
        });
        agents.save(&agent).await.unwrap();
        (WorkflowEngine::new(agents, Arc::new(EchoExecutor)), agent)
    }

    fn workflow(labels: &[(&str, Option<&str>)], edges: &[(&str, &str)]) -> Workflow {
        let now = chrono::Utc::now();
        Workflow {
            id: "wf".to_string(),
            name: "wf".to_string(),
            description: None,
            nodes: labels
                .iter()
                .map(|(id, label)| WorkflowNode {
                    id: id.to_string(),
                    agent_id: "echo".to_string(),
                    label: label.map(|l| l.to_string()),
                })
                .collect(),
            edges: edges
                .iter()
                .map(|(f, t)| WorkflowEdge {
                    from: f.to_string(),
                    to: t.to_string(),
                })
                .collect(),
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn test_linear_run_passes_outputs_downstream() {
        let (engine, _) = setup().await;
        let wf = workflow(&[("a", None), ("b", None)], &[("a", "b")]);
        let progress = Recorder::default();

        let out = engine.run("r1", &wf, json!("hello"), None, &progress).await.unwrap();
        assert_eq!(out["node"], "b");
        assert_eq!(out["input"]["a"]["input"], "hello");
        assert_eq!(*progress.steps_seen.lock().unwrap(), vec![1, 2]);
    }

    #[tokio::test]
    async fn test_pause_then_resume_from_same_node() {
        let (engine, _) = setup().await;
        let wf = workflow(&[("a", None), ("b", Some("ask")), ("c", None)], &[("a", "b"), ("b", "c")]);
        let progress = Recorder::default();

        let err = engine.run("r1", &wf, json!("go"), None, &progress).await.unwrap_err();
        let steps = match err {
            EngineError::Paused { node_id, question, options, steps } => {
                assert_eq!(node_id, "b");
                assert_eq!(question, "Proceed?");
                assert_eq!(options.len(), 2);
                assert_eq!(steps.len(), 1);
                steps
            }
            other => panic!("expected pause, got {:?}", other),
        };

        let resume = ResumeState {
            steps,
            response: "Yes".to_string(),
        };
        let out = engine.run("r1", &wf, json!("go"), Some(resume), &progress).await.unwrap();
        assert_eq!(out["node"], "c");
        assert_eq!(out["input"]["b"]["reply"], "Yes");
    }

    #[tokio::test]
    async fn test_cancel_between_nodes() {
        let (engine, _) = setup().await;
        let wf = workflow(&[("a", None)], &[]);
        let progress = Recorder::default();
        progress.cancel.store(true, Ordering::SeqCst);

        let err = engine.run("r1", &wf, Value::Null, None, &progress).await.unwrap_err();
        assert!(matches!(err, EngineError::Cancelled { .. }));
    }

    #[tokio::test]
    async fn test_failure_carries_hint_and_trail() {
        let (engine, _) = setup().await;
        let wf = workflow(&[("a", None), ("b", Some("boom"))], &[("a", "b")]);
        let progress = Recorder::default();

        match engine.run("r1", &wf, Value::Null, None, &progress).await.unwrap_err() {
            EngineError::Failed { message, steps, .. } => {
                assert!(message.contains("hint:"));
                assert_eq!(steps.len(), 2);
                assert!(steps[1].error.is_some());
            }
            other => panic!("expected failure, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_agent_lookup_failures_record_a_failed_step() {
        let (engine, _) = setup().await;
        let mut wf = workflow(&[("a", None), ("b", None)], &[("a", "b")]);
        wf.nodes[1].agent_id = "ghost".to_string();
        match engine.run("r1", &wf, json!("go"), None, &Recorder::default()).await.unwrap_err() {
            EngineError::Failed { message, steps, .. } => {
                assert!(message.contains("unknown agent 'ghost'"));
                assert_eq!(steps.len(), 2);
                assert_eq!(steps[1].node_id, "b");
                assert_eq!(steps[1].input["a"]["input"], "go");
                assert_eq!(steps[1].error.as_deref(), Some(message.as_str()));
            }
            other => panic!("expected failure, got {:?}", other),
        }

        let db = Database::open_in_memory().unwrap();
        let engine = WorkflowEngine::new(AgentStore::new(db.clone()), Arc::new(EchoExecutor));
        db.with_conn(|conn| conn.execute_batch("DROP TABLE agents")).unwrap();
        let wf = workflow(&[("a", None)], &[]);
        match engine.run("r2", &wf, Value::Null, None, &Recorder::default()).await.unwrap_err() {
            EngineError::Failed { steps, .. } => {
                assert_eq!(steps.len(), 1);
                assert!(steps[0].error.as_deref().unwrap().contains("agents"));
            }
            other => panic!("expected failure, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_invalid_graph() {
        let (engine, _) = setup().await;
        let wf = workflow(&[("a", None), ("b", None)], &[("a", "b"), ("b", "a")]);
        let err = engine.run("r1", &wf, Value::Null, None, &Recorder::default()).await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidGraph(_)));
    }

    #[test]
    fn test_capability_hint_only_for_environment_errors() {
        assert!(with_capability_hint("No API key found").contains("ANTHROPIC_API_KEY"));
        assert_eq!(with_capability_hint("bad input"), "bad input");
    }
}
