//! Deterministic `LlmClient` that replays scripted responses.
//!
//! Used by tests and by the CLI's `--offline` mode.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;

use super::{ChatRequest, LlmClient, LlmResponse};
use crate::error::ServerError;

type Handler = Box<dyn Fn(&ChatRequest) -> Result<LlmResponse, ServerError> + Send + Sync>;

pub struct ScriptedLlmClient {
    script: Mutex<VecDeque<Result<LlmResponse, String>>>,
    handler: Option<Handler>,
    requests: Mutex<Vec<ChatRequest>>,
}

impl ScriptedLlmClient {
    /// Replay `responses` in order; once exhausted every call errors.
    pub fn new(responses: Vec<LlmResponse>) -> Self {
        Self {
            script: Mutex::new(responses.into_iter().map(Ok).collect()),
            handler: None,
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Replay a script that may contain provider failures.
    pub fn with_results(results: Vec<Result<LlmResponse, String>>) -> Self {
        Self {
            script: Mutex::new(results.into_iter().collect()),
            handler: None,
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Answer every request by calling `handler`.
    pub fn from_fn<F>(handler: F) -> Self
    where
        F: Fn(&ChatRequest) -> Result<LlmResponse, ServerError> + Send + Sync + 'static,
    {
        Self {
            script: Mutex::new(VecDeque::new()),
            handler: Some(Box::new(handler)),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Requests received so far.
    pub fn requests(&self) -> Vec<ChatRequest> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }

    pub fn call_count(&self) -> usize {
        self.requests.lock().map(|r| r.len()).unwrap_or(0)
    }
}

#[async_trait]
impl LlmClient for ScriptedLlmClient {
    async fn complete(&self, request: ChatRequest) -> Result<LlmResponse, ServerError> {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request.clone());
        }

        if let Some(handler) = &self.handler {
            return handler(&request);
        }

        let next = self
            .script
            .lock()
            .map_err(|_| ServerError::Internal("scripted llm lock poisoned".to_string()))?
            .pop_front();
        match next {
            Some(Ok(response)) => Ok(response),
            Some(Err(message)) => Err(ServerError::Llm(message)),
            None => Err(ServerError::Llm("scripted llm exhausted".to_string())),
        }
    }
}
