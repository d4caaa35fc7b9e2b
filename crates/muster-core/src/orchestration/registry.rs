//! Specialist registry and composite expansion.
//!
//! Built-in specialists are defined in code; persisted overrides merge over
//! them when the registry is built. The registry is immutable afterwards and
//! shared by `Arc` for the duration of a turn.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::planner::PlanStep;
use crate::error::ServerError;
use crate::llm::{ChatRequest, LlmClient};
use crate::store::{SpecialistOverride, SpecialistOverrideStore};

pub const MAX_SPECIALIST_TOOLS: usize = 16;
pub const MAX_EXPANSION_DEPTH: usize = 5;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "ids", rename_all = "snake_case")]
pub enum SpecialistKind {
    /// Runs the tool loop with exactly these tools.
    Leaf(Vec<String>),
    /// Expands to one or more child specialists.
    Composite(Vec<String>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Specialist {
    pub id: String,
    pub description: String,
    pub kind: SpecialistKind,
    #[serde(default)]
    pub keywords: Vec<String>,
    /// Role guidance placed in the specialist's system instruction.
    #[serde(default)]
    pub instructions: String,
}

impl Specialist {
    pub fn leaf(id: &str, description: &str, tools: &[&str], keywords: &[&str], instructions: &str) -> Self {
        Self {
            id: id.to_string(),
            description: description.to_string(),
            kind: SpecialistKind::Leaf(tools.iter().map(|t| t.to_string()).collect()),
            keywords: keywords.iter().map(|k| k.to_string()).collect(),
            instructions: instructions.to_string(),
        }
    }

    pub fn composite(id: &str, description: &str, children: &[&str], keywords: &[&str]) -> Self {
        Self {
            id: id.to_string(),
            description: description.to_string(),
            kind: SpecialistKind::Composite(children.iter().map(|c| c.to_string()).collect()),
            keywords: keywords.iter().map(|k| k.to_string()).collect(),
            instructions: String::new(),
        }
    }

    pub fn is_composite(&self) -> bool {
        matches!(self.kind, SpecialistKind::Composite(_))
    }

    /// Tool names for a leaf; empty for composites.
    pub fn tool_names(&self) -> &[String] {
        match &self.kind {
            SpecialistKind::Leaf(tools) => tools,
            SpecialistKind::Composite(_) => &[],
        }
    }

    fn apply(&mut self, overlay: &SpecialistOverride) {
        if let Some(description) = &overlay.description {
            self.description = description.clone();
        }
        if let Some(children) = &overlay.children {
            self.kind = SpecialistKind::Composite(children.clone());
        } else if let Some(tools) = &overlay.tool_names {
            self.kind = SpecialistKind::Leaf(tools.clone());
        }
        if let Some(keywords) = &overlay.keywords {
            self.keywords = keywords.clone();
        }
    }
}

// ─── Built-in Specialists ─────────────────────────────────────────────────

pub const DEFAULT_SPECIALIST: &str = "general";

pub fn builtin_specialists() -> Vec<Specialist> {
    vec![
        Specialist::leaf(
            "general",
            "Answers questions and inspects existing agents, workflows, runs and reminders",
            &["list_agents", "list_workflows", "get_run", "list_reminders", "list_specialists", "ask_user"],
            &["help", "what", "show", "status"],
            "Answer directly when no change is needed. Use the list tools to ground your answer.",
        ),
        Specialist::leaf(
            "agent",
            "Creates and lists agents",
            &["create_agent", "list_agents", "ask_user"],
            &["agent", "assistant", "bot", "persona"],
            "Create exactly the agents the task asks for. Give each one a focused system prompt.",
        ),
        Specialist::leaf(
            "workflow",
            "Creates, runs and manages workflows of agents",
            &[
                "create_workflow",
                "list_workflows",
                "list_agents",
                "run_workflow",
                "run_agent",
                "get_run",
                "respond_to_run",
                "cancel_run",
                "ask_user",
            ],
            &["workflow", "pipeline", "run", "graph", "steps"],
            "Workflow nodes reference agents by id. Check prior steps for [Created agent id: ...] markers before creating nodes.",
        ),
        Specialist::leaf(
            "reminders",
            "Schedules, lists and cancels reminders",
            &["create_reminder", "list_reminders", "cancel_reminder", "ask_user"],
            &["remind", "reminder", "later", "tomorrow", "minutes", "schedule"],
            "Use inMinutes for relative times. Use taskType assistant_task only when the reminder should re-enter the conversation.",
        ),
        Specialist::leaf(
            "improve_agents_workflows",
            "Reviews existing agents and workflows and suggests improvements",
            &["list_agents", "list_workflows", "get_run", "create_agent", "ask_user"],
            &["improve", "review", "better", "optimize"],
            "Inspect what exists before proposing changes. Recreate an agent only when the user confirms.",
        ),
        Specialist::composite(
            "builder",
            "Builds agents and workflows together",
            &["agent", "workflow"],
            &["build", "set up", "automate"],
        ),
    ]
}

// ─── Subspecialist Choice ─────────────────────────────────────────────────

/// Picks one child of a composite when the task text does not say which.
#[async_trait]
pub trait SubspecialistChooser: Send + Sync {
    async fn choose(&self, parent: &Specialist, candidates: &[Specialist], task: &str) -> Option<String>;
}

/// Always the first child. Used when no LLM is available.
pub struct FirstChildChooser;

#[async_trait]
impl SubspecialistChooser for FirstChildChooser {
    async fn choose(&self, _parent: &Specialist, candidates: &[Specialist], _task: &str) -> Option<String> {
        candidates.first().map(|c| c.id.clone())
    }
}

pub struct LlmChooser {
    llm: Arc<dyn LlmClient>,
}

impl LlmChooser {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm }
    }
}

#[async_trait]
impl SubspecialistChooser for LlmChooser {
    async fn choose(&self, parent: &Specialist, candidates: &[Specialist], task: &str) -> Option<String> {
        let options = candidates
            .iter()
            .map(|c| format!("- {}: {}", c.id, c.description))
            .collect::<Vec<_>>()
            .join("\n");
        let request = ChatRequest::prompt(
            "You route a task to exactly one subspecialist. Reply with the subspecialist id only.",
            format!(
                "Specialist '{}' has these subspecialists:\n{}\n\nTask:\n{}\n\nWhich one should handle it?",
                parent.id, options, task
            ),
        );
        match self.llm.complete(request).await {
            Ok(response) => {
                let answer = response.text.unwrap_or_default();
                let answer = answer.trim().trim_matches(|c: char| c == '`' || c == '"' || c == '\'');
                candidates.iter().find(|c| c.id == answer).map(|c| c.id.clone())
            }
            Err(e) => {
                tracing::warn!("[Registry] Subspecialist choice for {} failed: {}", parent.id, e);
                None
            }
        }
    }
}

// ─── Registry ─────────────────────────────────────────────────────────────

pub struct SpecialistRegistry {
    specialists: Vec<Specialist>,
    index: HashMap<String, usize>,
    default_id: String,
}

impl SpecialistRegistry {
    pub fn new(specialists: Vec<Specialist>, default_id: &str) -> Self {
        let mut registry = Self {
            specialists: Vec::new(),
            index: HashMap::new(),
            default_id: default_id.to_string(),
        };
        for specialist in specialists {
            registry.upsert(specialist);
        }
        if !registry.index.contains_key(default_id) {
            if let Some(first) = registry.specialists.first() {
                tracing::warn!(
                    "[Registry] Default specialist '{}' is not registered; using '{}'",
                    default_id,
                    first.id
                );
                registry.default_id = first.id.clone();
            }
        }
        registry
    }

    pub fn builtin() -> Self {
        Self::new(builtin_specialists(), DEFAULT_SPECIALIST)
    }

    /// Built-ins with `overrides` merged over them. Present fields replace,
    /// absent fields keep the default, unknown ids are added.
    pub fn with_overrides(defaults: Vec<Specialist>, overrides: &[SpecialistOverride], default_id: &str) -> Self {
        let mut merged = defaults;
        for overlay in overrides {
            match merged.iter_mut().find(|s| s.id == overlay.id) {
                Some(existing) => existing.apply(overlay),
                None => {
                    let mut added = Specialist {
                        id: overlay.id.clone(),
                        description: overlay.id.clone(),
                        kind: SpecialistKind::Leaf(Vec::new()),
                        keywords: Vec::new(),
                        instructions: String::new(),
                    };
                    added.apply(overlay);
                    merged.push(added);
                }
            }
        }
        Self::new(merged, default_id)
    }

    pub async fn load(store: &SpecialistOverrideStore, default_id: &str) -> Result<Self, ServerError> {
        let overrides = store.list().await?;
        if !overrides.is_empty() {
            tracing::info!("[Registry] Applying {} specialist override(s)", overrides.len());
        }
        Ok(Self::with_overrides(builtin_specialists(), &overrides, default_id))
    }

    fn upsert(&mut self, mut specialist: Specialist) {
        if let SpecialistKind::Leaf(tools) = &mut specialist.kind {
            if tools.len() > MAX_SPECIALIST_TOOLS {
                tracing::warn!(
                    "[Registry] Specialist '{}' lists {} tools; keeping the first {}",
                    specialist.id,
                    tools.len(),
                    MAX_SPECIALIST_TOOLS
                );
                tools.truncate(MAX_SPECIALIST_TOOLS);
            }
        }
        match self.index.get(&specialist.id) {
            Some(&i) => self.specialists[i] = specialist,
            None => {
                self.index.insert(specialist.id.clone(), self.specialists.len());
                self.specialists.push(specialist);
            }
        }
    }

    pub fn lookup(&self, id: &str) -> Option<&Specialist> {
        self.index.get(id).map(|&i| &self.specialists[i])
    }

    pub fn all(&self) -> &[Specialist] {
        &self.specialists
    }

    pub fn default_id(&self) -> &str {
        &self.default_id
    }

    /// Expand `id` to leaf specialist ids, breadth-first.
    ///
    /// Unknown ids and composites past [`MAX_EXPANSION_DEPTH`] or already seen
    /// in this walk are dropped with a warning.
    pub async fn expand(&self, id: &str, task: &str, chooser: &dyn SubspecialistChooser) -> Vec<String> {
        let mut leaves = Vec::new();
        let mut seen_composites: HashSet<String> = HashSet::new();
        let mut queue: VecDeque<(String, usize)> = VecDeque::from([(id.to_string(), 0)]);

        while let Some((current, depth)) = queue.pop_front() {
            let Some(specialist) = self.lookup(&current) else {
                tracing::warn!("[Registry] Dropping unknown specialist '{}'", current);
                continue;
            };
            let children = match &specialist.kind {
                SpecialistKind::Leaf(_) => {
                    if !leaves.contains(&current) {
                        leaves.push(current);
                    }
                    continue;
                }
                SpecialistKind::Composite(children) => children,
            };
            if depth >= MAX_EXPANSION_DEPTH {
                tracing::warn!("[Registry] Expansion of '{}' exceeded depth {}", current, MAX_EXPANSION_DEPTH);
                continue;
            }
            if !seen_composites.insert(current.clone()) {
                tracing::warn!("[Registry] Cycle through composite '{}' ignored", current);
                continue;
            }

            for child in self.select_children(specialist, children, task, chooser).await {
                queue.push_back((child, depth + 1));
            }
        }
        leaves
    }

    async fn select_children(
        &self,
        parent: &Specialist,
        children: &[String],
        task: &str,
        chooser: &dyn SubspecialistChooser,
    ) -> Vec<String> {
        let known: Vec<Specialist> = children.iter().filter_map(|c| self.lookup(c).cloned()).collect();
        if known.len() <= 1 {
            return known.into_iter().map(|s| s.id).collect();
        }

        let mentioned: Vec<String> = known
            .iter()
            .filter(|c| mentions(task, &c.id))
            .map(|c| c.id.clone())
            .collect();
        if !mentioned.is_empty() {
            return mentioned;
        }

        let chosen = chooser
            .choose(parent, &known, task)
            .await
            .filter(|id| known.iter().any(|c| &c.id == id))
            .unwrap_or_else(|| known[0].id.clone());
        tracing::debug!("[Registry] '{}' expanded to '{}'", parent.id, chosen);
        vec![chosen]
    }

    /// Expand every entry of a plan order. Unknown ids disappear; a composite
    /// in a parallel group contributes all of its leaves to that group.
    pub async fn expand_order(
        &self,
        order: &[PlanStep],
        task: &str,
        chooser: &dyn SubspecialistChooser,
    ) -> Vec<PlanStep> {
        let mut expanded = Vec::new();
        for step in order {
            match step {
                PlanStep::Single(id) => {
                    for leaf in self.expand(id, task, chooser).await {
                        expanded.push(PlanStep::Single(leaf));
                    }
                }
                PlanStep::Parallel { parallel } => {
                    let mut members = Vec::new();
                    for id in parallel {
                        for leaf in self.expand(id, task, chooser).await {
                            if !members.contains(&leaf) {
                                members.push(leaf);
                            }
                        }
                    }
                    match members.len() {
                        0 => {}
                        1 => expanded.push(PlanStep::Single(members.remove(0))),
                        _ => expanded.push(PlanStep::Parallel { parallel: members }),
                    }
                }
            }
        }
        expanded
    }
}

fn mentions(task: &str, id: &str) -> bool {
    let pattern = format!(r"(?i)\b{}\b", regex::escape(id));
    regex::Regex::new(&pattern)
        .map(|re| re.is_match(task))
        .unwrap_or(false)
}

// ─── Reordering ───────────────────────────────────────────────────────────

/// Whether the extracted context asks for both an agent and a workflow.
pub fn wants_agent_and_workflow(extracted_context: &Value) -> bool {
    if extracted_context.get("createBoth").and_then(|v| v.as_bool()) == Some(true) {
        return true;
    }
    truthy(extracted_context.get("createAgent")) && truthy(extracted_context.get("createWorkflow"))
}

fn truthy(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => false,
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Some(Value::String(s)) => !s.is_empty() && s != "false",
        Some(Value::Array(a)) => !a.is_empty(),
        Some(Value::Object(o)) => !o.is_empty(),
    }
}

fn create_rank(step: &PlanStep) -> Option<u8> {
    match step {
        PlanStep::Single(id) if id == "agent" => Some(0),
        PlanStep::Single(id) if id == "workflow" => Some(1),
        PlanStep::Single(id) if id.starts_with("improve_") => Some(2),
        _ => None,
    }
}

/// When the plan creates both an agent and a workflow, put the agent step
/// first, then the workflow, then any `improve_*` step. Other entries keep
/// their slots. Applying it twice gives the same order.
pub fn reorder_for_create_both(order: Vec<PlanStep>, extracted_context: &Value) -> Vec<PlanStep> {
    if !wants_agent_and_workflow(extracted_context) {
        return order;
    }
    let slots: Vec<usize> = order
        .iter()
        .enumerate()
        .filter(|(_, s)| create_rank(s).is_some())
        .map(|(i, _)| i)
        .collect();
    let mut ranked: Vec<PlanStep> = slots.iter().map(|&i| order[i].clone()).collect();
    ranked.sort_by_key(|s| create_rank(s).unwrap_or(u8::MAX));

    let mut reordered = order;
    for (slot, step) in slots.into_iter().zip(ranked) {
        reordered[slot] = step;
    }
    reordered
}
