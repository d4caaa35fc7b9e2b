//! Reminder scheduler.
//!
//! Keeps one tokio timer per pending reminder, keyed by reminder id. The
//! persisted row is the source of truth: a timer that fires re-checks the
//! row and only acts if it is still pending.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use tokio::sync::mpsc;
use tokio::task::AbortHandle;

use crate::error::ServerError;
use crate::models::reminder::{CreateReminderInput, Reminder, ReminderStatus, ReminderTaskType};
use crate::store::ReminderStore;

/// Receives the synthetic turn an `assistant_task` reminder injects.
#[async_trait]
pub trait ConversationSink: Send + Sync {
    async fn inject_synthetic_turn(&self, conversation_id: &str, text: &str) -> Result<(), ServerError>;
}

/// Only logs the turn. Used when no conversation transport is attached.
pub struct LoggingConversationSink;

#[async_trait]
impl ConversationSink for LoggingConversationSink {
    async fn inject_synthetic_turn(&self, conversation_id: &str, text: &str) -> Result<(), ServerError> {
        tracing::info!("[Reminders] Synthetic turn for {}: {}", conversation_id, text);
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SyntheticTurn {
    pub conversation_id: String,
    pub text: String,
}

/// Forwards synthetic turns to a channel (the CLI's `reminder watch` loop
/// drains it).
pub struct ChannelConversationSink {
    tx: mpsc::UnboundedSender<SyntheticTurn>,
}

impl ChannelConversationSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<SyntheticTurn>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl ConversationSink for ChannelConversationSink {
    async fn inject_synthetic_turn(&self, conversation_id: &str, text: &str) -> Result<(), ServerError> {
        self.tx
            .send(SyntheticTurn {
                conversation_id: conversation_id.to_string(),
                text: text.to_string(),
            })
            .map_err(|_| ServerError::Internal("conversation channel closed".to_string()))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ReminderError {
    #[error("{0}")]
    Invalid(String),

    #[error("reminder '{0}' not found")]
    NotFound(String),

    #[error("reminder '{id}' is not pending (status: {})", .status.as_str())]
    NotPending { id: String, status: ReminderStatus },

    #[error(transparent)]
    Store(#[from] ServerError),
}

#[derive(Clone)]
pub struct ReminderScheduler {
    store: ReminderStore,
    sink: Arc<dyn ConversationSink>,
    timers: Arc<Mutex<HashMap<String, AbortHandle>>>,
}

impl ReminderScheduler {
    pub fn new(store: ReminderStore, sink: Arc<dyn ConversationSink>) -> Self {
        Self {
            store,
            sink,
            timers: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub async fn create(&self, input: CreateReminderInput) -> Result<Reminder, ReminderError> {
        let message = input.message.trim();
        if message.is_empty() {
            return Err(ReminderError::Invalid("message is required".to_string()));
        }

        let now = Utc::now();
        let run_at = match (input.in_minutes, input.run_at) {
            (Some(_), Some(_)) => {
                return Err(ReminderError::Invalid("give either inMinutes or runAt, not both".to_string()))
            }
            (Some(minutes), None) => {
                if !minutes.is_finite() || minutes <= 0.0 {
                    return Err(ReminderError::Invalid("inMinutes must be greater than 0".to_string()));
                }
                let millis = (minutes * 60_000.0).round();
                ChronoDuration::try_milliseconds(millis as i64)
                    .filter(|_| millis < i64::MAX as f64)
                    .and_then(|delta| now.checked_add_signed(delta))
                    .ok_or_else(|| ReminderError::Invalid("inMinutes is too large".to_string()))?
            }
            (None, Some(at)) => {
                if at <= now {
                    return Err(ReminderError::Invalid("runAt must be in the future".to_string()));
                }
                at
            }
            (None, None) => return Err(ReminderError::Invalid("inMinutes or runAt is required".to_string())),
        };

        let task_type = input.task_type.unwrap_or(ReminderTaskType::Message);
        let conversation_id = input.conversation_id.filter(|c| !c.trim().is_empty());
        if task_type == ReminderTaskType::AssistantTask && conversation_id.is_none() {
            return Err(ReminderError::Invalid(
                "assistant_task reminders need a conversationId".to_string(),
            ));
        }

        let reminder = Reminder {
            id: uuid::Uuid::new_v4().to_string(),
            run_at,
            message: message.to_string(),
            conversation_id,
            task_type,
            status: ReminderStatus::Pending,
            created_at: now,
        };
        self.store.insert(&reminder).await?;
        self.arm(&reminder);
        tracing::info!("[Reminders] Scheduled {} for {}", reminder.id, reminder.run_at);
        Ok(reminder)
    }

    /// Cancel a pending reminder. Clearing the timer is idempotent; the
    /// status change only happens from `pending`.
    pub async fn cancel(&self, id: &str) -> Result<Reminder, ReminderError> {
        self.disarm(id);
        let reminder = self
            .store
            .get(id)
            .await?
            .ok_or_else(|| ReminderError::NotFound(id.to_string()))?;
        if !self.store.transition_from_pending(id, ReminderStatus::Cancelled).await? {
            let current = self.store.get(id).await?.map(|r| r.status).unwrap_or(reminder.status);
            return Err(ReminderError::NotPending {
                id: id.to_string(),
                status: current,
            });
        }
        tracing::info!("[Reminders] Cancelled {}", id);
        Ok(Reminder {
            status: ReminderStatus::Cancelled,
            ..reminder
        })
    }

    pub async fn list(&self, conversation_id: Option<&str>) -> Result<Vec<Reminder>, ServerError> {
        self.store.list(conversation_id).await
    }

    /// Re-arm timers for every pending reminder. Overdue ones fire right away.
    pub async fn restore(&self) -> Result<usize, ServerError> {
        let pending = self.store.list_pending().await?;
        let now = Utc::now();
        for reminder in &pending {
            if reminder.run_at <= now {
                tracing::info!(
                    "[Reminders] {} is overdue (was due {}), firing now",
                    reminder.id,
                    reminder.run_at
                );
            }
            self.arm(reminder);
        }
        if !pending.is_empty() {
            tracing::info!("[Reminders] Restored {} pending reminder(s)", pending.len());
        }
        Ok(pending.len())
    }

    pub fn active_timers(&self) -> usize {
        self.timers.lock().map(|t| t.len()).unwrap_or(0)
    }

    fn arm(&self, reminder: &Reminder) {
        let delay = (reminder.run_at - Utc::now()).to_std().unwrap_or_default();
        let scheduler = self.clone();
        let id = reminder.id.clone();

        let Ok(mut timers) = self.timers.lock() else {
            tracing::error!("[Reminders] Timer map poisoned; {} not armed", id);
            return;
        };
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(e) = scheduler.fire(&id).await {
                tracing::warn!("[Reminders] Failed to fire {}: {}", id, e);
            }
        });
        if let Some(previous) = timers.insert(reminder.id.clone(), handle.abort_handle()) {
            previous.abort();
        }
    }

    fn disarm(&self, id: &str) {
        if let Ok(mut timers) = self.timers.lock() {
            if let Some(handle) = timers.remove(id) {
                handle.abort();
            }
        }
    }

    async fn fire(&self, id: &str) -> Result<(), ServerError> {
        if let Ok(mut timers) = self.timers.lock() {
            timers.remove(id);
        }

        let Some(reminder) = self.store.get(id).await? else {
            return Ok(());
        };
        if reminder.status != ReminderStatus::Pending {
            tracing::debug!("[Reminders] {} is {}, skipping", id, reminder.status.as_str());
            return Ok(());
        }
        if !self.store.transition_from_pending(id, ReminderStatus::Fired).await? {
            return Ok(());
        }
        tracing::info!("[Reminders] Fired {}: {}", id, reminder.message);

        if let (ReminderTaskType::AssistantTask, Some(conversation_id)) =
            (reminder.task_type, reminder.conversation_id.clone())
        {
            let sink = self.sink.clone();
            let text = format!("[Reminder] {}", reminder.message);
            tokio::spawn(async move {
                if let Err(e) = sink.inject_synthetic_turn(&conversation_id, &text).await {
                    tracing::warn!("[Reminders] Synthetic turn for {} failed: {}", conversation_id, e);
                }
            });
        }
        Ok(())
    }
}
