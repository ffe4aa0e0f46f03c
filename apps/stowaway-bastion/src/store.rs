//! Persistent records behind a trait so tests run against an in-memory
//! implementation while production uses Postgres.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use uuid::Uuid;

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct User {
    pub id: Uuid,
    pub username: String,
    pub password_hash: String,
}

/// An agent record. The token is the agent's sole credential; it is
/// returned in clear text exactly once, at creation.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct AgentRecord {
    pub id: Uuid,
    pub label: String,
    pub hosted_path: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("duplicate record")]
    Duplicate,
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

#[async_trait]
pub trait Store: Send + Sync {
    async fn has_any_user(&self) -> Result<bool, StoreError>;
    async fn create_user(&self, username: &str, password_hash: &str) -> Result<User, StoreError>;
    async fn user_by_username(&self, username: &str) -> Result<Option<User>, StoreError>;

    async fn create_agent(
        &self,
        label: &str,
        token: &str,
        hosted_path: &str,
    ) -> Result<AgentRecord, StoreError>;
    async fn list_agents(&self) -> Result<Vec<AgentRecord>, StoreError>;
    async fn agent_by_token(&self, token: &str) -> Result<Option<AgentRecord>, StoreError>;
    async fn rename_agent(&self, id: Uuid, label: &str) -> Result<bool, StoreError>;
    async fn delete_agent(&self, id: Uuid) -> Result<bool, StoreError>;
}

/// Postgres-backed store.
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(8)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|err| StoreError::Database(sqlx::Error::Migrate(Box::new(err))))
    }
}

/// Maps a Postgres unique violation (SQLSTATE 23505) to the conflict kind.
fn map_duplicate(err: sqlx::Error) -> StoreError {
    if let sqlx::Error::Database(db) = &err {
        if db.code().as_deref() == Some("23505") {
            return StoreError::Duplicate;
        }
    }
    StoreError::Database(err)
}

#[async_trait]
impl Store for PgStore {
    async fn has_any_user(&self) -> Result<bool, StoreError> {
        let count: i64 = sqlx::query_scalar("SELECT count(*) FROM users")
            .fetch_one(&self.pool)
            .await?;
        Ok(count > 0)
    }

    async fn create_user(&self, username: &str, password_hash: &str) -> Result<User, StoreError> {
        sqlx::query_as(
            "INSERT INTO users (username, password_hash) VALUES ($1, $2)
             RETURNING id, username, password_hash",
        )
        .bind(username)
        .bind(password_hash)
        .fetch_one(&self.pool)
        .await
        .map_err(map_duplicate)
    }

    async fn user_by_username(&self, username: &str) -> Result<Option<User>, StoreError> {
        let user = sqlx::query_as(
            "SELECT id, username, password_hash FROM users WHERE username = $1",
        )
        .bind(username)
        .fetch_optional(&self.pool)
        .await?;
        Ok(user)
    }

    async fn create_agent(
        &self,
        label: &str,
        token: &str,
        hosted_path: &str,
    ) -> Result<AgentRecord, StoreError> {
        sqlx::query_as(
            "INSERT INTO agents (label, token, hosted_path) VALUES ($1, $2, $3)
             RETURNING id, label, hosted_path, created_at",
        )
        .bind(label)
        .bind(token)
        .bind(hosted_path)
        .fetch_one(&self.pool)
        .await
        .map_err(map_duplicate)
    }

    async fn list_agents(&self) -> Result<Vec<AgentRecord>, StoreError> {
        let agents = sqlx::query_as(
            "SELECT id, label, hosted_path, created_at FROM agents ORDER BY label",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(agents)
    }

    async fn agent_by_token(&self, token: &str) -> Result<Option<AgentRecord>, StoreError> {
        let agent = sqlx::query_as(
            "SELECT id, label, hosted_path, created_at FROM agents WHERE token = $1",
        )
        .bind(token)
        .fetch_optional(&self.pool)
        .await?;
        Ok(agent)
    }

    async fn rename_agent(&self, id: Uuid, label: &str) -> Result<bool, StoreError> {
        let result = sqlx::query("UPDATE agents SET label = $1 WHERE id = $2")
            .bind(label)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_agent(&self, id: Uuid) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM agents WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

/// In-memory store for tests.
#[derive(Default)]
pub struct MemoryStore {
    inner: tokio::sync::Mutex<MemoryInner>,
}

#[derive(Default)]
struct MemoryInner {
    users: Vec<User>,
    agents: Vec<(AgentRecord, String)>,
}

#[async_trait]
impl Store for MemoryStore {
    async fn has_any_user(&self) -> Result<bool, StoreError> {
        Ok(!self.inner.lock().await.users.is_empty())
    }

    async fn create_user(&self, username: &str, password_hash: &str) -> Result<User, StoreError> {
        let mut inner = self.inner.lock().await;
        if inner.users.iter().any(|u| u.username == username) {
            return Err(StoreError::Duplicate);
        }
        let user = User {
            id: Uuid::new_v4(),
            username: username.to_string(),
            password_hash: password_hash.to_string(),
        };
        inner.users.push(user.clone());
        Ok(user)
    }

    async fn user_by_username(&self, username: &str) -> Result<Option<User>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.users.iter().find(|u| u.username == username).cloned())
    }

    async fn create_agent(
        &self,
        label: &str,
        token: &str,
        hosted_path: &str,
    ) -> Result<AgentRecord, StoreError> {
        let mut inner = self.inner.lock().await;
        if inner.agents.iter().any(|(_, t)| t == token) {
            return Err(StoreError::Duplicate);
        }
        let record = AgentRecord {
            id: Uuid::new_v4(),
            label: label.to_string(),
            hosted_path: hosted_path.to_string(),
            created_at: Utc::now(),
        };
        inner.agents.push((record.clone(), token.to_string()));
        Ok(record)
    }

    async fn list_agents(&self) -> Result<Vec<AgentRecord>, StoreError> {
        let inner = self.inner.lock().await;
        let mut agents: Vec<AgentRecord> =
            inner.agents.iter().map(|(record, _)| record.clone()).collect();
        agents.sort_by(|a, b| a.label.cmp(&b.label));
        Ok(agents)
    }

    async fn agent_by_token(&self, token: &str) -> Result<Option<AgentRecord>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .agents
            .iter()
            .find(|(_, t)| t == token)
            .map(|(record, _)| record.clone()))
    }

    async fn rename_agent(&self, id: Uuid, label: &str) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().await;
        match inner.agents.iter_mut().find(|(record, _)| record.id == id) {
            Some((record, _)) => {
                record.label = label.to_string();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn delete_agent(&self, id: Uuid) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().await;
        let before = inner.agents.len();
        inner.agents.retain(|(record, _)| record.id != id);
        Ok(inner.agents.len() != before)
    }
}
