use chrono::Utc;
use rusqlite::{OptionalExtension, Row};

use crate::db::Database;
use crate::error::ServerError;
use crate::models::agent::Agent;

#[derive(Clone)]
pub struct AgentStore {
    db: Database,
}

impl AgentStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub async fn save(&self, agent: &Agent) -> Result<(), ServerError> {
        let a = agent.clone();
        self.db
            .with_conn_async(move |conn| {
                conn.execute(
                    "INSERT INTO agents (id, name, description, system_prompt, tool_names, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                     ON CONFLICT(id) DO UPDATE SET
                       name = excluded.name,
                       description = excluded.description,
                       system_prompt = excluded.system_prompt,
                       tool_names = excluded.tool_names,
                       updated_at = excluded.updated_at",
                    rusqlite::params![
                        a.id,
                        a.name,
                        a.description,
                        a.system_prompt,
                        serde_json::to_string(&a.tool_names).unwrap_or_else(|_| "[]".to_string()),
                        a.created_at.timestamp_millis(),
                        a.updated_at.timestamp_millis(),
                    ],
                )?;
                Ok(())
            })
            .await
    }

    pub async fn get(&self, agent_id: &str) -> Result<Option<Agent>, ServerError> {
        let id = agent_id.to_string();
        self.db
            .with_conn_async(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, name, description, system_prompt, tool_names, created_at, updated_at
                     FROM agents WHERE id = ?1",
                )?;
                stmt.query_row(rusqlite::params![id], |row| Ok(row_to_agent(row)))
                    .optional()
            })
            .await
    }

    /// Look an agent up by id first, then by exact name.
    pub async fn find(&self, id_or_name: &str) -> Result<Option<Agent>, ServerError> {
        if let Some(agent) = self.get(id_or_name).await? {
            return Ok(Some(agent));
        }
        let name = id_or_name.to_string();
        self.db
            .with_conn_async(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, name, description, system_prompt, tool_names, created_at, updated_at
                     FROM agents WHERE name = ?1 ORDER BY created_at DESC LIMIT 1",
                )?;
                stmt.query_row(rusqlite::params![name], |row| Ok(row_to_agent(row)))
                    .optional()
            })
            .await
    }

    pub async fn list(&self) -> Result<Vec<Agent>, ServerError> {
        self.db
            .with_conn_async(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, name, description, system_prompt, tool_names, created_at, updated_at
                     FROM agents ORDER BY created_at DESC",
                )?;
                let rows = stmt
                    .query_map([], |row| Ok(row_to_agent(row)))?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
    }

    pub async fn delete(&self, agent_id: &str) -> Result<bool, ServerError> {
        let id = agent_id.to_string();
        self.db
            .with_conn_async(move |conn| {
                let n = conn.execute("DELETE FROM agents WHERE id = ?1", rusqlite::params![id])?;
                Ok(n > 0)
            })
            .await
    }
}

fn row_to_agent(row: &Row<'_>) -> Agent {
    let tool_names_str: String = row.get(4).unwrap_or_default();
    let created_ms: i64 = row.get(5).unwrap_or(0);
    let updated_ms: i64 = row.get(6).unwrap_or(0);

    Agent {
        id: row.get(0).unwrap_or_default(),
        name: row.get(1).unwrap_or_default(),
        description: row.get(2).unwrap_or(None),
        system_prompt: row.get(3).unwrap_or_default(),
        tool_names: serde_json::from_str(&tool_names_str).unwrap_or_default(),
        created_at: chrono::DateTime::from_timestamp_millis(created_ms).unwrap_or_else(Utc::now),
        updated_at: chrono::DateTime::from_timestamp_millis(updated_ms).unwrap_or_else(Utc::now),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::agent::CreateAgentInput;

    #[tokio::test]
    async fn test_save_and_find_by_name() {
        let store = AgentStore::new(Database::open_in_memory().unwrap());
        let agent = Agent::new(CreateAgentInput {
            name: "researcher".to_string(),
            description: None,
            system_prompt: "You research.".to_string(),
            tool_names: vec!["ask_user".to_string()],
        });
        store.save(&agent).await.unwrap();

        let by_id = store.get(&agent.id).await.unwrap().unwrap();
        assert_eq!(by_id.tool_names, vec!["ask_user".to_string()]);

        let by_name = store.find("researcher").await.unwrap().unwrap();
        assert_eq!(by_name.id, agent.id);
        assert!(store.find("nobody").await.unwrap().is_none());
    }
}
