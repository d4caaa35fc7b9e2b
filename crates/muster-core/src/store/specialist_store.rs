//! Persisted specialist overrides, merged over the built-in defaults when the
//! registry is built.

use chrono::Utc;
use rusqlite::OptionalExtension;
use serde::{Deserialize, Serialize};

use crate::db::Database;
use crate::error::ServerError;

/// A partial specialist definition. `None` fields keep the built-in value.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpecialistOverride {
    pub id: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub tool_names: Option<Vec<String>>,
    #[serde(default)]
    pub children: Option<Vec<String>>,
    #[serde(default)]
    pub keywords: Option<Vec<String>>,
}

#[derive(Clone)]
pub struct SpecialistOverrideStore {
    db: Database,
}

impl SpecialistOverrideStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub async fn upsert(&self, entry: &SpecialistOverride) -> Result<(), ServerError> {
        let e = entry.clone();
        let encode = |v: &Option<Vec<String>>| v.as_ref().and_then(|v| serde_json::to_string(v).ok());
        let tool_names = encode(&e.tool_names);
        let children = encode(&e.children);
        let keywords = encode(&e.keywords);
        let now = Utc::now().timestamp_millis();
        self.db
            .with_conn_async(move |conn| {
                conn.execute(
                    "INSERT INTO specialist_overrides (id, description, tool_names, children, keywords, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                     ON CONFLICT(id) DO UPDATE SET
                       description = excluded.description,
                       tool_names = excluded.tool_names,
                       children = excluded.children,
                       keywords = excluded.keywords,
                       updated_at = excluded.updated_at",
                    rusqlite::params![e.id, e.description, tool_names, children, keywords, now],
                )?;
                Ok(())
            })
            .await
    }

    pub async fn get(&self, id: &str) -> Result<Option<SpecialistOverride>, ServerError> {
        let id = id.to_string();
        self.db
            .with_conn_async(move |conn| {
                conn.query_row(
                    "SELECT id, description, tool_names, children, keywords FROM specialist_overrides WHERE id = ?1",
                    rusqlite::params![id],
                    |row| Ok(row_to_override(row)),
                )
                .optional()
            })
            .await
    }

    pub async fn list(&self) -> Result<Vec<SpecialistOverride>, ServerError> {
        self.db
            .with_conn_async(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, description, tool_names, children, keywords FROM specialist_overrides ORDER BY id",
                )?;
                let rows = stmt
                    .query_map([], |row| Ok(row_to_override(row)))?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
    }

    pub async fn delete(&self, id: &str) -> Result<bool, ServerError> {
        let id = id.to_string();
        self.db
            .with_conn_async(move |conn| {
                let n = conn.execute(
                    "DELETE FROM specialist_overrides WHERE id = ?1",
                    rusqlite::params![id],
                )?;
                Ok(n > 0)
            })
            .await
    }
}

fn row_to_override(row: &rusqlite::Row<'_>) -> SpecialistOverride {
    let decode = |idx: usize| -> Option<Vec<String>> {
        row.get::<_, Option<String>>(idx)
            .unwrap_or(None)
            .and_then(|s| serde_json::from_str(&s).ok())
    };
    SpecialistOverride {
        id: row.get(0).unwrap_or_default(),
        description: row.get(1).unwrap_or(None),
        tool_names: decode(2),
        children: decode(3),
        keywords: decode(4),
    }
}
