//! SQLite store.
//!
//! Tables: `providers`, `models`, `agents`, `tasks`, `messages`. Messages
//! carry an autoincrement `seq` so rows with the same `created_at` keep
//! insertion order. Content blocks are stored as JSON in the tagged
//! `{"kind", "payload"}` format.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow, SqliteSynchronous,
};
use sqlx::{Row, SqlitePool};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::str::FromStr;
use tracing::{debug, info};

use taskforge_core::agent::{Agent, Model, ModelPricing, ProviderKind, ProviderRecord};
use taskforge_core::error::StoreError;
use taskforge_core::message::{ContentBlock, Message, MessageSource};
use taskforge_core::provider::Usage;
use taskforge_core::store::{RoundCommit, Store, StoreResult};
use taskforge_core::task::{DesiredPhase, Phase, Task, TaskId, TaskUsage};

/// A production SQLite store.
pub struct SqliteStore {
    pool: SqlitePool,
}

/// Fixed-width RFC 3339 so text ordering matches time ordering.
fn ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(raw: &str, id: &str) -> StoreResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Malformed {
            id: id.to_string(),
            reason: format!("timestamp {raw:?}: {e}"),
        })
}

fn col<'r, T>(row: &'r SqliteRow, name: &str) -> StoreResult<T>
where
    T: sqlx::Decode<'r, sqlx::Sqlite> + sqlx::Type<sqlx::Sqlite>,
{
    row.try_get(name)
        .map_err(|e| StoreError::QueryFailed(format!("{name} column: {e}")))
}

fn query_err(context: &str) -> impl Fn(sqlx::Error) -> StoreError + '_ {
    move |e| StoreError::QueryFailed(format!("{context}: {e}"))
}

impl SqliteStore {
    /// Create a new SQLite store from a URL or file path.
    ///
    /// The database and all tables/indexes are created automatically.
    /// Pass `"sqlite::memory:"` for an ephemeral database (useful for tests).
    pub async fn new(url: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(url)
            .map_err(|e| StoreError::Storage(format!("Invalid SQLite path: {e}")))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .pragma("foreign_keys", "ON");

        // Every connection to `:memory:` is a separate database.
        let max_connections = if url.contains(":memory:") { 1 } else { 4 };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await
            .map_err(|e| StoreError::Storage(format!("Failed to open SQLite: {e}")))?;

        let store = Self { pool };
        store.run_migrations().await?;
        info!("SQLite store initialized at {url}");
        Ok(store)
    }

    /// Create from an existing pool (useful for testing).
    pub async fn from_pool(pool: SqlitePool) -> Result<Self, StoreError> {
        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    /// Cheap connectivity check.
    pub async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(query_err("ping"))?;
        Ok(())
    }

    /// Run schema migrations.
    async fn run_migrations(&self) -> Result<(), StoreError> {
        let statements = [
            (
                "providers table",
                r#"
                CREATE TABLE IF NOT EXISTS providers (
                    id                    TEXT PRIMARY KEY,
                    kind                  TEXT NOT NULL,
                    base_url              TEXT,
                    encrypted_credentials TEXT NOT NULL
                )
                "#,
            ),
            (
                "models table",
                r#"
                CREATE TABLE IF NOT EXISTS models (
                    id                TEXT PRIMARY KEY,
                    name              TEXT NOT NULL,
                    context_window    INTEGER NOT NULL,
                    max_output_tokens INTEGER NOT NULL,
                    pricing           TEXT NOT NULL DEFAULT '{}',
                    provider_id       TEXT NOT NULL
                )
                "#,
            ),
            (
                "agents table",
                r#"
                CREATE TABLE IF NOT EXISTS agents (
                    id           TEXT PRIMARY KEY,
                    name         TEXT NOT NULL,
                    instructions TEXT NOT NULL,
                    model_id     TEXT NOT NULL,
                    created_at   TEXT NOT NULL
                )
                "#,
            ),
            (
                "tasks table",
                r#"
                CREATE TABLE IF NOT EXISTS tasks (
                    id                 TEXT PRIMARY KEY,
                    agent_id           TEXT NOT NULL,
                    title              TEXT,
                    desired_phase      TEXT NOT NULL DEFAULT 'normal',
                    phase              TEXT NOT NULL DEFAULT 'await_input',
                    input_tokens       INTEGER NOT NULL DEFAULT 0,
                    output_tokens      INTEGER NOT NULL DEFAULT 0,
                    cache_write_tokens INTEGER NOT NULL DEFAULT 0,
                    cache_read_tokens  INTEGER NOT NULL DEFAULT 0,
                    cost               REAL NOT NULL DEFAULT 0.0,
                    tool_uses          TEXT NOT NULL DEFAULT '{}',
                    project_dir        TEXT NOT NULL,
                    created_at         TEXT NOT NULL,
                    updated_at         TEXT NOT NULL
                )
                "#,
            ),
            (
                "messages table",
                r#"
                CREATE TABLE IF NOT EXISTS messages (
                    seq               INTEGER PRIMARY KEY AUTOINCREMENT,
                    id                TEXT UNIQUE NOT NULL,
                    task_id           TEXT NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
                    source            TEXT NOT NULL,
                    content           TEXT NOT NULL,
                    usage             TEXT,
                    cost              REAL,
                    model             TEXT,
                    is_final_response INTEGER NOT NULL DEFAULT 0,
                    processed_at      TEXT,
                    created_at        TEXT NOT NULL
                )
                "#,
            ),
            (
                "messages order index",
                "CREATE INDEX IF NOT EXISTS idx_messages_task_order ON messages(task_id, created_at, seq)",
            ),
            (
                "messages pending index",
                "CREATE INDEX IF NOT EXISTS idx_messages_pending ON messages(task_id) WHERE processed_at IS NULL",
            ),
        ];

        for (what, sql) in statements {
            sqlx::query(sql)
                .execute(&self.pool)
                .await
                .map_err(|e| StoreError::MigrationFailed(format!("{what}: {e}")))?;
        }

        debug!("SQLite migrations complete");
        Ok(())
    }

    fn row_to_provider(row: &SqliteRow) -> StoreResult<ProviderRecord> {
        let id: String = col(row, "id")?;
        let kind_raw: String = col(row, "kind")?;
        let kind = ProviderKind::parse(&kind_raw).ok_or_else(|| StoreError::Malformed {
            id: id.clone(),
            reason: format!("unknown provider kind {kind_raw:?}"),
        })?;
        Ok(ProviderRecord {
            id,
            kind,
            base_url: col(row, "base_url")?,
            encrypted_credentials: col(row, "encrypted_credentials")?,
        })
    }

    fn row_to_model(row: &SqliteRow) -> StoreResult<Model> {
        let id: String = col(row, "id")?;
        let pricing_json: String = col(row, "pricing")?;
        let pricing: ModelPricing =
            serde_json::from_str(&pricing_json).map_err(|e| StoreError::Malformed {
                id: id.clone(),
                reason: format!("pricing: {e}"),
            })?;
        let context_window: i64 = col(row, "context_window")?;
        let max_output_tokens: i64 = col(row, "max_output_tokens")?;
        Ok(Model {
            id,
            name: col(row, "name")?,
            context_window: context_window as u32,
            max_output_tokens: max_output_tokens as u32,
            pricing,
            provider_id: col(row, "provider_id")?,
        })
    }

    fn row_to_agent(row: &SqliteRow) -> StoreResult<Agent> {
        let id: String = col(row, "id")?;
        let created_at: String = col(row, "created_at")?;
        Ok(Agent {
            created_at: parse_ts(&created_at, &id)?,
            name: col(row, "name")?,
            instructions: col(row, "instructions")?,
            model_id: col(row, "model_id")?,
            id,
        })
    }

    fn row_to_task(row: &SqliteRow) -> StoreResult<Task> {
        let id: String = col(row, "id")?;
        let malformed = |reason: String| StoreError::Malformed {
            id: id.clone(),
            reason,
        };

        let desired_raw: String = col(row, "desired_phase")?;
        let phase_raw: String = col(row, "phase")?;
        let tool_uses_json: String = col(row, "tool_uses")?;
        let project_dir: String = col(row, "project_dir")?;
        let created_at: String = col(row, "created_at")?;
        let updated_at: String = col(row, "updated_at")?;

        let desired_phase = DesiredPhase::parse(&desired_raw)
            .ok_or_else(|| malformed(format!("desired phase {desired_raw:?}")))?;
        let phase =
            Phase::parse(&phase_raw).ok_or_else(|| malformed(format!("phase {phase_raw:?}")))?;
        let tool_uses: BTreeMap<String, u64> = serde_json::from_str(&tool_uses_json)
            .map_err(|e| malformed(format!("tool_uses: {e}")))?;

        let input_tokens: i64 = col(row, "input_tokens")?;
        let output_tokens: i64 = col(row, "output_tokens")?;
        let cache_write_tokens: i64 = col(row, "cache_write_tokens")?;
        let cache_read_tokens: i64 = col(row, "cache_read_tokens")?;

        Ok(Task {
            agent_id: col(row, "agent_id")?,
            title: col(row, "title")?,
            desired_phase,
            phase,
            usage: TaskUsage {
                input_tokens: input_tokens as u64,
                output_tokens: output_tokens as u64,
                cache_write_tokens: cache_write_tokens as u64,
                cache_read_tokens: cache_read_tokens as u64,
                cost: col(row, "cost")?,
            },
            tool_uses,
            project_dir: PathBuf::from(project_dir),
            created_at: parse_ts(&created_at, &id)?,
            updated_at: parse_ts(&updated_at, &id)?,
            id: TaskId(id),
        })
    }

    fn row_to_message(row: &SqliteRow) -> StoreResult<Message> {
        let id: String = col(row, "id")?;
        let malformed = |reason: String| StoreError::Malformed {
            id: id.clone(),
            reason,
        };

        let source_raw: String = col(row, "source")?;
        let source = MessageSource::parse(&source_raw)
            .ok_or_else(|| malformed(format!("source {source_raw:?}")))?;
        let content_json: String = col(row, "content")?;
        let content: Vec<ContentBlock> = serde_json::from_str(&content_json)
            .map_err(|e| malformed(format!("content: {e}")))?;
        let usage_json: Option<String> = col(row, "usage")?;
        let usage: Option<Usage> = usage_json
            .map(|raw| serde_json::from_str(&raw))
            .transpose()
            .map_err(|e| malformed(format!("usage: {e}")))?;
        let processed_at: Option<String> = col(row, "processed_at")?;
        let created_at: String = col(row, "created_at")?;
        let is_final: i64 = col(row, "is_final_response")?;

        Ok(Message {
            task_id: TaskId(col(row, "task_id")?),
            source,
            content,
            usage,
            cost: col(row, "cost")?,
            model: col(row, "model")?,
            is_final_response: is_final != 0,
            processed_at: processed_at.map(|raw| parse_ts(&raw, &id)).transpose()?,
            created_at: parse_ts(&created_at, &id)?,
            id,
        })
    }

    async fn insert_message<'e, E>(executor: E, message: &Message) -> StoreResult<()>
    where
        E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
    {
        let content = serde_json::to_string(&message.content)
            .map_err(|e| StoreError::Storage(format!("Content serialization: {e}")))?;
        let usage = message
            .usage
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| StoreError::Storage(format!("Usage serialization: {e}")))?;

        sqlx::query(
            r#"
            INSERT INTO messages (id, task_id, source, content, usage, cost, model,
                                  is_final_response, processed_at, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            "#,
        )
        .bind(&message.id)
        .bind(message.task_id.as_str())
        .bind(message.source.as_str())
        .bind(&content)
        .bind(usage.as_deref())
        .bind(message.cost)
        .bind(message.model.as_deref())
        .bind(message.is_final_response as i64)
        .bind(message.processed_at.as_ref().map(ts))
        .bind(ts(&message.created_at))
        .execute(executor)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(db) if db.is_foreign_key_violation() => StoreError::NotFound {
                kind: "task",
                id: message.task_id.to_string(),
            },
            other => StoreError::Storage(format!("INSERT message failed: {other}")),
        })?;
        Ok(())
    }

    async fn update_task_field(
        &self,
        id: &TaskId,
        sql: &str,
        value: &str,
    ) -> StoreResult<()> {
        let result = sqlx::query(sql)
            .bind(value)
            .bind(ts(&Utc::now()))
            .bind(id.as_str())
            .execute(&self.pool)
            .await
            .map_err(query_err("UPDATE task"))?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound {
                kind: "task",
                id: id.to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl Store for SqliteStore {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn create_provider(&self, record: ProviderRecord) -> StoreResult<ProviderRecord> {
        sqlx::query(
            "INSERT INTO providers (id, kind, base_url, encrypted_credentials) VALUES (?1, ?2, ?3, ?4)",
        )
        .bind(&record.id)
        .bind(record.kind.as_str())
        .bind(record.base_url.as_deref())
        .bind(&record.encrypted_credentials)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Storage(format!("INSERT provider failed: {e}")))?;
        Ok(record)
    }

    async fn get_provider(&self, id: &str) -> StoreResult<Option<ProviderRecord>> {
        let row = sqlx::query("SELECT * FROM providers WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(query_err("SELECT provider"))?;
        row.as_ref().map(Self::row_to_provider).transpose()
    }

    async fn create_model(&self, model: Model) -> StoreResult<Model> {
        let pricing = serde_json::to_string(&model.pricing)
            .map_err(|e| StoreError::Storage(format!("Pricing serialization: {e}")))?;
        sqlx::query(
            r#"
            INSERT INTO models (id, name, context_window, max_output_tokens, pricing, provider_id)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
        )
        .bind(&model.id)
        .bind(&model.name)
        .bind(model.context_window as i64)
        .bind(model.max_output_tokens as i64)
        .bind(&pricing)
        .bind(&model.provider_id)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Storage(format!("INSERT model failed: {e}")))?;
        Ok(model)
    }

    async fn get_model(&self, id: &str) -> StoreResult<Option<Model>> {
        let row = sqlx::query("SELECT * FROM models WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(query_err("SELECT model"))?;
        row.as_ref().map(Self::row_to_model).transpose()
    }

    async fn create_agent(&self, agent: Agent) -> StoreResult<Agent> {
        sqlx::query(
            "INSERT INTO agents (id, name, instructions, model_id, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .bind(&agent.id)
        .bind(&agent.name)
        .bind(&agent.instructions)
        .bind(&agent.model_id)
        .bind(ts(&agent.created_at))
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Storage(format!("INSERT agent failed: {e}")))?;
        Ok(agent)
    }

    async fn get_agent(&self, id: &str) -> StoreResult<Option<Agent>> {
        let row = sqlx::query("SELECT * FROM agents WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(query_err("SELECT agent"))?;
        row.as_ref().map(Self::row_to_agent).transpose()
    }

    async fn create_task(&self, task: Task) -> StoreResult<Task> {
        let tool_uses = serde_json::to_string(&task.tool_uses)
            .map_err(|e| StoreError::Storage(format!("Tool uses serialization: {e}")))?;
        sqlx::query(
            r#"
            INSERT INTO tasks (id, agent_id, title, desired_phase, phase,
                               input_tokens, output_tokens, cache_write_tokens, cache_read_tokens,
                               cost, tool_uses, project_dir, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
            "#,
        )
        .bind(task.id.as_str())
        .bind(&task.agent_id)
        .bind(task.title.as_deref())
        .bind(task.desired_phase.as_str())
        .bind(task.phase.as_str())
        .bind(task.usage.input_tokens as i64)
        .bind(task.usage.output_tokens as i64)
        .bind(task.usage.cache_write_tokens as i64)
        .bind(task.usage.cache_read_tokens as i64)
        .bind(task.usage.cost)
        .bind(&tool_uses)
        .bind(task.project_dir.to_string_lossy().as_ref())
        .bind(ts(&task.created_at))
        .bind(ts(&task.updated_at))
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Storage(format!("INSERT task failed: {e}")))?;
        Ok(task)
    }

    async fn get_task(&self, id: &TaskId) -> StoreResult<Option<Task>> {
        let row = sqlx::query("SELECT * FROM tasks WHERE id = ?1")
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(query_err("SELECT task"))?;
        row.as_ref().map(Self::row_to_task).transpose()
    }

    async fn set_task_title(&self, id: &TaskId, title: &str) -> StoreResult<()> {
        self.update_task_field(
            id,
            "UPDATE tasks SET title = ?1, updated_at = ?2 WHERE id = ?3",
            title,
        )
        .await
    }

    async fn set_desired_phase(&self, id: &TaskId, phase: DesiredPhase) -> StoreResult<()> {
        self.update_task_field(
            id,
            "UPDATE tasks SET desired_phase = ?1, updated_at = ?2 WHERE id = ?3",
            phase.as_str(),
        )
        .await
    }

    async fn set_observed_phase(&self, id: &TaskId, phase: Phase) -> StoreResult<()> {
        // Observed phase churns every cycle; it does not bump updated_at.
        let result = sqlx::query("UPDATE tasks SET phase = ?1 WHERE id = ?2")
            .bind(phase.as_str())
            .bind(id.as_str())
            .execute(&self.pool)
            .await
            .map_err(query_err("UPDATE task phase"))?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound {
                kind: "task",
                id: id.to_string(),
            });
        }
        Ok(())
    }

    async fn list_pending_tasks(&self) -> StoreResult<Vec<TaskId>> {
        let rows = sqlx::query(
            "SELECT DISTINCT task_id FROM messages WHERE processed_at IS NULL ORDER BY task_id",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(query_err("SELECT pending tasks"))?;
        rows.iter()
            .map(|row| col::<String>(row, "task_id").map(TaskId))
            .collect()
    }

    async fn create_message(&self, message: Message) -> StoreResult<Message> {
        Self::insert_message(&self.pool, &message).await?;
        debug!(message_id = %message.id, task_id = %message.task_id, "Stored message");
        Ok(message)
    }

    async fn list_messages(&self, task_id: &TaskId) -> StoreResult<Vec<Message>> {
        let rows = sqlx::query("SELECT * FROM messages WHERE task_id = ?1 ORDER BY created_at, seq")
            .bind(task_id.as_str())
            .fetch_all(&self.pool)
            .await
            .map_err(query_err("SELECT messages"))?;
        rows.iter().map(Self::row_to_message).collect()
    }

    async fn mark_processed(&self, message_id: &str) -> StoreResult<()> {
        let result = sqlx::query("UPDATE messages SET processed_at = ?1 WHERE id = ?2")
            .bind(ts(&Utc::now()))
            .bind(message_id)
            .execute(&self.pool)
            .await
            .map_err(query_err("UPDATE message"))?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound {
                kind: "message",
                id: message_id.to_string(),
            });
        }
        Ok(())
    }

    async fn commit_round(&self, commit: RoundCommit) -> StoreResult<()> {
        // Dropping `tx` without commit rolls everything back.
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StoreError::Storage(format!("BEGIN failed: {e}")))?;
        let now = ts(&Utc::now());

        let marked = sqlx::query(
            "UPDATE messages SET processed_at = ?1 WHERE id = ?2 AND task_id = ?3",
        )
        .bind(&now)
        .bind(&commit.processed_message_id)
        .bind(commit.task_id.as_str())
        .execute(&mut *tx)
        .await
        .map_err(query_err("UPDATE pivot"))?;
        if marked.rows_affected() == 0 {
            return Err(StoreError::NotFound {
                kind: "message",
                id: commit.processed_message_id,
            });
        }

        if let Some(message) = &commit.message {
            Self::insert_message(&mut *tx, message).await?;
        }

        let row = sqlx::query("SELECT tool_uses FROM tasks WHERE id = ?1")
            .bind(commit.task_id.as_str())
            .fetch_optional(&mut *tx)
            .await
            .map_err(query_err("SELECT task tool_uses"))?
            .ok_or_else(|| StoreError::NotFound {
                kind: "task",
                id: commit.task_id.to_string(),
            })?;
        let tool_uses_json: String = col(&row, "tool_uses")?;
        let mut tool_uses: BTreeMap<String, u64> = serde_json::from_str(&tool_uses_json)
            .map_err(|e| StoreError::Malformed {
                id: commit.task_id.to_string(),
                reason: format!("tool_uses: {e}"),
            })?;
        for (name, count) in &commit.tool_uses {
            *tool_uses.entry(name.clone()).or_insert(0) += count;
        }
        let tool_uses_json = serde_json::to_string(&tool_uses)
            .map_err(|e| StoreError::Storage(format!("Tool uses serialization: {e}")))?;

        let (usage, cost) = commit.usage.unwrap_or_default();
        sqlx::query(
            r#"
            UPDATE tasks SET
                input_tokens       = input_tokens + ?1,
                output_tokens      = output_tokens + ?2,
                cache_write_tokens = cache_write_tokens + ?3,
                cache_read_tokens  = cache_read_tokens + ?4,
                cost               = cost + ?5,
                tool_uses          = ?6,
                updated_at         = ?7
            WHERE id = ?8
            "#,
        )
        .bind(usage.input_tokens as i64)
        .bind(usage.output_tokens as i64)
        .bind(usage.cache_write_tokens as i64)
        .bind(usage.cache_read_tokens as i64)
        .bind(cost)
        .bind(&tool_uses_json)
        .bind(&now)
        .bind(commit.task_id.as_str())
        .execute(&mut *tx)
        .await
        .map_err(query_err("UPDATE task counters"))?;

        tx.commit()
            .await
            .map_err(|e| StoreError::Storage(format!("COMMIT failed: {e}")))?;
        debug!(task_id = %commit.task_id, pivot = %commit.processed_message_id, "Round committed");
        Ok(())
    }
}
