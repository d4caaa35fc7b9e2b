//! Planner trace events and the sinks that record them.

pub mod writer;

use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use writer::{TraceWriteError, TraceWriter};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlannerMode {
    Fresh,
    Continuation,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TraceKind {
    Request { prompt: String },
    RawResponse { text: String },
    Parsed { plan: Value },
    Failed { reason: String },
}

/// One planner trace record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlannerTraceEvent {
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    pub mode: PlannerMode,
    pub attempt: u32,
    #[serde(flatten)]
    pub kind: TraceKind,
}

impl PlannerTraceEvent {
    pub fn new(conversation_id: Option<&str>, mode: PlannerMode, attempt: u32, kind: TraceKind) -> Self {
        Self {
            timestamp: Utc::now(),
            conversation_id: conversation_id.map(|c| c.to_string()),
            mode,
            attempt,
            kind,
        }
    }
}

#[async_trait]
pub trait PlannerTraceSink: Send + Sync {
    async fn record(&self, event: PlannerTraceEvent);
}

/// Emits each event as a structured `tracing` event.
pub struct TracingTraceSink;

#[async_trait]
impl PlannerTraceSink for TracingTraceSink {
    async fn record(&self, event: PlannerTraceEvent) {
        let mode = match event.mode {
            PlannerMode::Fresh => "fresh",
            PlannerMode::Continuation => "continuation",
        };
        match &event.kind {
            TraceKind::Request { prompt } => {
                tracing::debug!(mode, attempt = event.attempt, prompt_len = prompt.len(), "[Planner] request")
            }
            TraceKind::RawResponse { text } => {
                tracing::debug!(mode, attempt = event.attempt, response = %text, "[Planner] raw response")
            }
            TraceKind::Parsed { plan } => {
                tracing::info!(mode, attempt = event.attempt, plan = %plan, "[Planner] plan")
            }
            TraceKind::Failed { reason } => {
                tracing::warn!(mode, attempt = event.attempt, reason = %reason, "[Planner] no plan")
            }
        }
    }
}

/// Appends events to daily JSONL files.
pub struct JsonlTraceSink {
    writer: TraceWriter,
}

impl JsonlTraceSink {
    pub fn new(trace_dir: &str) -> Self {
        Self {
            writer: TraceWriter::with_base_dir(trace_dir),
        }
    }
}

#[async_trait]
impl PlannerTraceSink for JsonlTraceSink {
    async fn record(&self, event: PlannerTraceEvent) {
        self.writer.append_safe(&event).await;
    }
}

/// Keeps events in memory.
#[derive(Default)]
pub struct MemoryTraceSink {
    events: Mutex<Vec<PlannerTraceEvent>>,
}

impl MemoryTraceSink {
    pub fn events(&self) -> Vec<PlannerTraceEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl PlannerTraceSink for MemoryTraceSink {
    async fn record(&self, event: PlannerTraceEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}
