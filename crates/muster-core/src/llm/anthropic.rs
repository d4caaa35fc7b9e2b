//! Anthropic-compatible Messages API client (also served by GLM/BigModel).
//!
//! POST {base_url}/v1/messages
//! Headers:
//!   x-api-key: {api_key}
//!   anthropic-version: 2023-06-01
//!   content-type: application/json

use async_trait::async_trait;
use serde_json::{json, Value};

use super::{ChatMessage, ChatRequest, LlmClient, LlmResponse, Role, ToolCall, Usage};
use crate::config::LlmConfig;
use crate::error::ServerError;

pub struct AnthropicClient {
    client: reqwest::Client,
    config: LlmConfig,
}

impl AnthropicClient {
    pub fn new(config: LlmConfig) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(config.timeout_secs))
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
            config,
        }
    }

    fn build_body(&self, request: &ChatRequest) -> Value {
        let mut body = json!({
            "model": self.config.model,
            "max_tokens": request.max_tokens.unwrap_or(self.config.max_tokens),
            "messages": encode_messages(&request.messages),
        });

        if !request.system.is_empty() {
            body["system"] = Value::String(request.system.clone());
        }

        if !request.tools.is_empty() {
            body["tools"] = Value::Array(
                request
                    .tools
                    .iter()
                    .map(|t| {
                        json!({
                            "name": t.name,
                            "description": t.description,
                            "input_schema": t.parameters,
                        })
                    })
                    .collect(),
            );
        }

        body
    }
}

#[async_trait]
impl LlmClient for AnthropicClient {
    async fn complete(&self, request: ChatRequest) -> Result<LlmResponse, ServerError> {
        if self.config.api_key.is_empty() {
            return Err(ServerError::Llm(
                "No API key found. Set ANTHROPIC_AUTH_TOKEN or ANTHROPIC_API_KEY env var, \
                 or specify llm.api_key in the config file."
                    .to_string(),
            ));
        }

        let url = format!("{}/v1/messages", self.config.base_url.trim_end_matches('/'));
        let body = self.build_body(&request);

        tracing::debug!(
            "[AnthropicClient] POST {} (model: {}, {} message(s), {} tool(s))",
            url,
            self.config.model,
            request.messages.len(),
            request.tools.len()
        );

        let response = self
            .client
            .post(&url)
            .header("x-api-key", &self.config.api_key)
            .header("anthropic-version", "2023-06-01")
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| ServerError::Llm(format!("HTTP request failed: {}", e)))?;

        let status = response.status();
        let response_text = response
            .text()
            .await
            .map_err(|e| ServerError::Llm(format!("Failed to read response body: {}", e)))?;

        if !status.is_success() {
            return Err(ServerError::Llm(format!(
                "API returned {}: {}",
                status, response_text
            )));
        }

        let json: Value = serde_json::from_str(&response_text)
            .map_err(|e| ServerError::Llm(format!("Failed to parse response JSON: {}", e)))?;

        Ok(decode_response(&json))
    }
}

/// Convert chat history to Anthropic content blocks. Consecutive tool results
/// are folded into one user turn so roles keep alternating.
fn encode_messages(messages: &[ChatMessage]) -> Vec<Value> {
    let mut out: Vec<Value> = Vec::new();
    let mut pending_results: Vec<Value> = Vec::new();

    let flush = |out: &mut Vec<Value>, pending: &mut Vec<Value>| {
        if !pending.is_empty() {
            out.push(json!({ "role": "user", "content": std::mem::take(pending) }));
        }
    };

    for msg in messages {
        match msg.role {
            Role::Tool => pending_results.push(json!({
                "type": "tool_result",
                "tool_use_id": msg.tool_call_id.clone().unwrap_or_default(),
                "content": msg.content,
            })),
            Role::User => {
                flush(&mut out, &mut pending_results);
                out.push(json!({ "role": "user", "content": msg.content }));
            }
            Role::Assistant => {
                flush(&mut out, &mut pending_results);
                let mut blocks = Vec::new();
                if !msg.content.is_empty() {
                    blocks.push(json!({ "type": "text", "text": msg.content }));
                }
                for call in &msg.tool_calls {
                    blocks.push(json!({
                        "type": "tool_use",
                        "id": call.id,
                        "name": call.name,
                        "input": call.arguments,
                    }));
                }
                out.push(json!({ "role": "assistant", "content": blocks }));
            }
        }
    }
    flush(&mut out, &mut pending_results);
    out
}

fn decode_response(json: &Value) -> LlmResponse {
    let blocks = json
        .get("content")
        .and_then(|c| c.as_array())
        .cloned()
        .unwrap_or_default();

    let text = blocks
        .iter()
        .filter(|b| b.get("type").and_then(|t| t.as_str()) == Some("text"))
        .filter_map(|b| b.get("text").and_then(|t| t.as_str()).map(|s| s.to_string()))
        .reduce(|a, b| format!("{}\n{}", a, b));

    let tool_calls = blocks
        .iter()
        .filter(|b| b.get("type").and_then(|t| t.as_str()) == Some("tool_use"))
        .map(|b| ToolCall {
            id: b.get("id").and_then(|v| v.as_str()).unwrap_or_default().to_string(),
            name: b.get("name").and_then(|v| v.as_str()).unwrap_or_default().to_string(),
            arguments: b.get("input").cloned().unwrap_or_else(|| json!({})),
        })
        .collect();

    let usage = json
        .get("usage")
        .map(|u| Usage {
            input_tokens: u.get("input_tokens").and_then(|v| v.as_u64()).unwrap_or(0),
            output_tokens: u.get("output_tokens").and_then(|v| v.as_u64()).unwrap_or(0),
        })
        .unwrap_or_default();

    LlmResponse {
        text,
        tool_calls,
        usage,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tool_results_fold_into_single_user_turn() {
        let messages = vec![
            ChatMessage::user("do it"),
            ChatMessage::assistant(
                "",
                vec![
                    ToolCall { id: "c1".into(), name: "a".into(), arguments: json!({}) },
                    ToolCall { id: "c2".into(), name: "b".into(), arguments: json!({}) },
                ],
            ),
            ChatMessage::tool_result("c1", "{}"),
            ChatMessage::tool_result("c2", "{}"),
        ];
        let encoded = encode_messages(&messages);
        assert_eq!(encoded.len(), 3);
        assert_eq!(encoded[2]["role"], "user");
        assert_eq!(encoded[2]["content"].as_array().unwrap().len(), 2);
        assert_eq!(encoded[1]["content"][0]["type"], "tool_use");
    }

    #[test]
    fn test_decode_text_and_tool_use() {
        let raw = json!({
            "content": [
                {"type": "text", "text": "Creating it."},
                {"type": "tool_use", "id": "tu_1", "name": "create_agent", "input": {"name": "x"}}
            ],
            "usage": {"input_tokens": 12, "output_tokens": 5}
        });
        let decoded = decode_response(&raw);
        assert_eq!(decoded.text.as_deref(), Some("Creating it."));
        assert_eq!(decoded.tool_calls[0].name, "create_agent");
        assert_eq!(decoded.usage.total(), 17);
    }
}
