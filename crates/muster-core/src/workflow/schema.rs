//! YAML schema for workflow definitions.
//!
//! A workflow is a directed acyclic graph of agent nodes:
//!
//! ```yaml
//! name: "Release Notes"
//! description: "Draft and review release notes"
//! nodes:
//!   - id: draft
//!     agent: writer          # agent id or name
//!   - id: review
//!     agent: reviewer
//!     label: "Editorial pass"
//! edges:
//!   - from: draft
//!     to: review
//! ```

use std::collections::{HashMap, HashSet};

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::models::workflow::{Workflow, WorkflowEdge, WorkflowNode};

/// Workflow definition as authored (YAML file or `create_workflow` arguments).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub name: String,

    #[serde(default)]
    pub description: Option<String>,

    pub nodes: Vec<WorkflowNode>,

    #[serde(default)]
    pub edges: Vec<WorkflowEdge>,
}

impl WorkflowDefinition {
    /// Parse a workflow definition from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self, String> {
        serde_yaml::from_str(yaml).map_err(|e| format!("Failed to parse workflow YAML: {}", e))
    }

    /// Load a workflow definition from a file path.
    pub fn from_file(path: &str) -> Result<Self, String> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| format!("Failed to read workflow file '{}': {}", path, e))?;
        Self::from_yaml(&content)
    }

    /// Structural checks: at least one node, unique node ids, no dangling
    /// edges, no cycles.
    pub fn validate(&self) -> Result<(), String> {
        if self.nodes.is_empty() {
            return Err("workflow must have at least one node".to_string());
        }
        topological_order(&self.nodes, &self.edges).map(|_| ())
    }

    pub fn into_workflow(self) -> Workflow {
        let now = Utc::now();
        Workflow {
            id: uuid::Uuid::new_v4().to_string(),
            name: self.name,
            description: self.description,
            nodes: self.nodes,
            edges: self.edges,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Kahn's algorithm over node indices. Among nodes that are ready at the same
/// time, declaration order wins, so the order is stable for a given graph.
pub fn topological_order(nodes: &[WorkflowNode], edges: &[WorkflowEdge]) -> Result<Vec<usize>, String> {
    let mut index: HashMap<&str, usize> = HashMap::new();
    for (i, node) in nodes.iter().enumerate() {
        if node.id.trim().is_empty() {
            return Err(format!("node #{} has an empty id", i + 1));
        }
        if index.insert(node.id.as_str(), i).is_some() {
            return Err(format!("duplicate node id '{}'", node.id));
        }
    }

    let mut in_degree = vec![0usize; nodes.len()];
    let mut successors: Vec<Vec<usize>> = vec![Vec::new(); nodes.len()];
    let mut seen: HashSet<(usize, usize)> = HashSet::new();
    for edge in edges {
        let from = *index
            .get(edge.from.as_str())
            .ok_or_else(|| format!("edge references unknown node '{}'", edge.from))?;
        let to = *index
            .get(edge.to.as_str())
            .ok_or_else(|| format!("edge references unknown node '{}'", edge.to))?;
        if !seen.insert((from, to)) {
            continue;
        }
        successors[from].push(to);
        in_degree[to] += 1;
    }

    let mut order = Vec::with_capacity(nodes.len());
    let mut done = vec![false; nodes.len()];
    while order.len() < nodes.len() {
        let next = (0..nodes.len()).find(|&i| !done[i] && in_degree[i] == 0);
        let Some(i) = next else {
            let stuck: Vec<&str> = (0..nodes.len())
                .filter(|&i| !done[i])
                .map(|i| nodes[i].id.as_str())
                .collect();
            return Err(format!("workflow graph has a cycle through: {}", stuck.join(", ")));
        };
        done[i] = true;
        order.push(i);
        for &s in &successors[i] {
            in_degree[s] -= 1;
        }
    }
    Ok(order)
}

/// Ids of the nodes with an edge into `node_id`, in declaration order.
pub fn predecessors<'a>(node_id: &str, nodes: &'a [WorkflowNode], edges: &[WorkflowEdge]) -> Vec<&'a str> {
    nodes
        .iter()
        .filter(|n| edges.iter().any(|e| e.to == node_id && e.from == n.id))
        .map(|n| n.id.as_str())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: &str) -> WorkflowNode {
        WorkflowNode {
            id: id.to_string(),
            agent_id: "a".to_string(),
            label: None,
        }
    }

    fn edge(from: &str, to: &str) -> WorkflowEdge {
        WorkflowEdge {
            from: from.to_string(),
            to: to.to_string(),
        }
    }

    #[test]
    fn test_parse_yaml_with_agent_alias() {
        let yaml = r#"
name: "Release Notes"
nodes:
  - id: draft
    agent: writer
  - id: review
    agentId: reviewer
    label: "Editorial pass"
edges:
  - from: draft
    to: review
"#;
        let def = WorkflowDefinition::from_yaml(yaml).unwrap();
        assert_eq!(def.nodes[0].agent_id, "writer");
        assert_eq!(def.nodes[1].agent_id, "reviewer");
        assert_eq!(def.nodes[1].label.as_deref(), Some("Editorial pass"));
        assert!(def.validate().is_ok());
    }

    #[test]
    fn test_topological_order_uses_declaration_tie_break() {
        let nodes = vec![node("c"), node("a"), node("b")];
        // a -> b; c is independent and declared first.
        let order = topological_order(&nodes, &[edge("a", "b")]).unwrap();
        assert_eq!(order, vec![0, 1, 2]);

        // b must wait for c even though b is declared before c.
        let nodes = vec![node("b"), node("c")];
        let order = topological_order(&nodes, &[edge("c", "b")]).unwrap();
        assert_eq!(order, vec![1, 0]);
    }

    #[test]
    fn test_cycles_and_dangling_edges_rejected() {
        let nodes = vec![node("a"), node("b")];
        let err = topological_order(&nodes, &[edge("a", "b"), edge("b", "a")]).unwrap_err();
        assert!(err.contains("cycle"));

        let err = topological_order(&nodes, &[edge("a", "zzz")]).unwrap_err();
        assert!(err.contains("unknown node 'zzz'"));

        let err = topological_order(&[node("a"), node("a")], &[]).unwrap_err();
        assert!(err.contains("duplicate"));
    }

    #[test]
    fn test_predecessors_in_declaration_order() {
        let nodes = vec![node("x"), node("y"), node("z")];
        let edges = vec![edge("y", "z"), edge("x", "z")];
        assert_eq!(predecessors("z", &nodes, &edges), vec!["x", "y"]);
        assert!(predecessors("x", &nodes, &edges).is_empty());
    }
}
