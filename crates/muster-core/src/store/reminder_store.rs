use chrono::{DateTime, TimeZone, Utc};
use rusqlite::OptionalExtension;

use crate::db::Database;
use crate::error::ServerError;
use crate::models::reminder::{Reminder, ReminderStatus, ReminderTaskType};

#[derive(Clone)]
pub struct ReminderStore {
    db: Database,
}

impl ReminderStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub async fn insert(&self, reminder: &Reminder) -> Result<(), ServerError> {
        let r = reminder.clone();
        self.db
            .with_conn_async(move |conn| {
                conn.execute(
                    "INSERT INTO reminders (id, run_at, message, conversation_id, task_type, status, created_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    rusqlite::params![
                        r.id,
                        r.run_at.timestamp_millis(),
                        r.message,
                        r.conversation_id,
                        r.task_type.as_str(),
                        r.status.as_str(),
                        r.created_at.timestamp_millis(),
                    ],
                )?;
                Ok(())
            })
            .await
    }

    pub async fn get(&self, id: &str) -> Result<Option<Reminder>, ServerError> {
        let id = id.to_string();
        self.db
            .with_conn_async(move |conn| {
                conn.query_row(
                    "SELECT id, run_at, message, conversation_id, task_type, status, created_at \
                     FROM reminders WHERE id = ?1",
                    rusqlite::params![id],
                    |row| Ok(row_to_reminder(row)),
                )
                .optional()
            })
            .await
    }

    pub async fn list(&self, conversation_id: Option<&str>) -> Result<Vec<Reminder>, ServerError> {
        let conversation_id = conversation_id.map(|c| c.to_string());
        self.db
            .with_conn_async(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, run_at, message, conversation_id, task_type, status, created_at \
                     FROM reminders WHERE (?1 IS NULL OR conversation_id = ?1) ORDER BY run_at ASC",
                )?;
                let rows = stmt
                    .query_map(rusqlite::params![conversation_id], |row| Ok(row_to_reminder(row)))?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
    }

    pub async fn list_pending(&self) -> Result<Vec<Reminder>, ServerError> {
        self.db
            .with_conn_async(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, run_at, message, conversation_id, task_type, status, created_at \
                     FROM reminders WHERE status = 'pending' ORDER BY run_at ASC",
                )?;
                let rows = stmt
                    .query_map([], |row| Ok(row_to_reminder(row)))?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
    }

    /// Move a reminder out of `pending`. Returns false if it was no longer pending.
    pub async fn transition_from_pending(
        &self,
        id: &str,
        next: ReminderStatus,
    ) -> Result<bool, ServerError> {
        let id = id.to_string();
        self.db
            .with_conn_async(move |conn| {
                let n = conn.execute(
                    "UPDATE reminders SET status = ?2 WHERE id = ?1 AND status = 'pending'",
                    rusqlite::params![id, next.as_str()],
                )?;
                Ok(n > 0)
            })
            .await
    }
}

fn row_to_reminder(row: &rusqlite::Row<'_>) -> Reminder {
    let to_dt = |ms: i64| -> DateTime<Utc> {
        Utc.timestamp_millis_opt(ms).single().unwrap_or_else(Utc::now)
    };

    Reminder {
        id: row.get(0).unwrap_or_default(),
        run_at: to_dt(row.get(1).unwrap_or(0)),
        message: row.get(2).unwrap_or_default(),
        conversation_id: row.get(3).unwrap_or(None),
        task_type: ReminderTaskType::from_str(&row.get::<_, String>(4).unwrap_or_default())
            .unwrap_or(ReminderTaskType::Message),
        status: ReminderStatus::from_str(&row.get::<_, String>(5).unwrap_or_default())
            .unwrap_or(ReminderStatus::Cancelled),
        created_at: to_dt(row.get(6).unwrap_or(0)),
    }
}
