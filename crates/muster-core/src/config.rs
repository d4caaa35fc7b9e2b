//! Runtime configuration.
//!
//! Values come from an optional YAML file, then environment overrides.
//! String values in the file may reference environment variables with
//! `${VAR}` or `${VAR:-default}`.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::ServerError;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MusterConfig {
    /// Path to the SQLite database file
    pub db_path: String,
    pub llm: LlmConfig,
    pub runner: RunnerConfig,
    pub planner: PlannerConfig,
    /// Specialist used when planning fails and no keyword matches
    pub default_specialist: String,
}

impl Default for MusterConfig {
    fn default() -> Self {
        Self {
            db_path: "muster.db".to_string(),
            llm: LlmConfig::default(),
            runner: RunnerConfig::default(),
            planner: PlannerConfig::default(),
            default_specialist: "general".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    pub max_tokens: u32,
    pub timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.anthropic.com".to_string(),
            api_key: String::new(),
            model: "claude-sonnet-4-20250514".to_string(),
            max_tokens: 4096,
            timeout_secs: 300,
        }
    }
}

/// Bounds for one specialist's tool-calling loop.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    pub max_turns: u32,
    /// Total tokens (input + output) a single specialist run may consume
    pub token_budget: u64,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            max_turns: 8,
            token_budget: 32_000,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PlannerConfig {
    /// When set, planner trace events are appended as JSONL under this directory
    pub trace_dir: Option<String>,
}

impl MusterConfig {
    pub fn from_yaml(yaml: &str) -> Result<Self, ServerError> {
        let resolved = resolve_env_vars(yaml);
        serde_yaml::from_str(&resolved)
            .map_err(|e| ServerError::BadRequest(format!("Failed to parse config YAML: {}", e)))
    }

    pub fn from_file(path: &str) -> Result<Self, ServerError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            ServerError::BadRequest(format!("Failed to read config file '{}': {}", path, e))
        })?;
        Self::from_yaml(&content)
    }

    /// Load from `path` when it exists (defaults otherwise), then apply
    /// environment overrides.
    pub fn load(path: Option<&str>) -> Result<Self, ServerError> {
        let mut config = match path {
            Some(p) if Path::new(p).is_file() => Self::from_file(p)?,
            Some(p) => {
                tracing::warn!("[Config] Config file '{}' not found, using defaults", p);
                Self::default()
            }
            None => Self::default(),
        };
        config.apply_env();
        Ok(config)
    }

    pub fn apply_env(&mut self) {
        if let Ok(v) = std::env::var("MUSTER_DB_PATH") {
            self.db_path = v;
        }
        if let Ok(v) = std::env::var("ANTHROPIC_BASE_URL") {
            self.llm.base_url = v;
        }
        if let Ok(v) =
            std::env::var("ANTHROPIC_AUTH_TOKEN").or_else(|_| std::env::var("ANTHROPIC_API_KEY"))
        {
            self.llm.api_key = v;
        }
        if let Ok(v) = std::env::var("ANTHROPIC_MODEL") {
            self.llm.model = v;
        }
    }
}

/// Resolve environment variable references in a string.
/// Supports `${ENV_VAR}` and `${ENV_VAR:-default}` syntax.
pub fn resolve_env_vars(input: &str) -> String {
    let re = match regex::Regex::new(r"\$\{([^}]+)\}") {
        Ok(re) => re,
        Err(_) => return input.to_string(),
    };
    re.replace_all(input, |caps: &regex::Captures| {
        let var_expr = &caps[1];
        if let Some(idx) = var_expr.find(":-") {
            let var_name = &var_expr[..idx];
            let default_val = &var_expr[idx + 2..];
            std::env::var(var_name).unwrap_or_else(|_| default_val.to_string())
        } else {
            std::env::var(var_expr).unwrap_or_else(|_| format!("${{{}}}", var_expr))
        }
    })
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_env_vars() {
        std::env::set_var("MUSTER_TEST_CONFIG_VAR", "hello");
        assert_eq!(resolve_env_vars("${MUSTER_TEST_CONFIG_VAR}"), "hello");
        assert_eq!(
            resolve_env_vars("prefix-${MUSTER_TEST_CONFIG_VAR}-suffix"),
            "prefix-hello-suffix"
        );
        assert_eq!(resolve_env_vars("${MUSTER_NONEXISTENT_VAR:-fallback}"), "fallback");
        std::env::remove_var("MUSTER_TEST_CONFIG_VAR");
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let config = MusterConfig::from_yaml(
            r#"
db_path: "/tmp/m.db"
runner:
  max_turns: 3
llm:
  model: "${MUSTER_UNSET_MODEL:-glm-4.7}"
"#,
        )
        .unwrap();
        assert_eq!(config.db_path, "/tmp/m.db");
        assert_eq!(config.runner.max_turns, 3);
        assert_eq!(config.runner.token_budget, 32_000);
        assert_eq!(config.llm.model, "glm-4.7");
        assert_eq!(config.default_specialist, "general");
    }
}
