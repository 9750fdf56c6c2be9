use crate::error::ChatError;
use crate::models::{derive_title, now_millis, ChatHistory, Message, Role};
use async_trait::async_trait;
use dashmap::DashMap;
use sqlx::{migrate::MigrateDatabase, sqlite::SqlitePoolOptions, Sqlite, SqlitePool};
use uuid::Uuid;

/// Persistence adapter for conversations. Called once per completed turn,
/// never per delta.
#[async_trait]
pub trait ChatStore: Send + Sync {
    /// Stores a new conversation and returns its id. The title is derived
    /// from the first message.
    async fn create(&self, user_id: &str, messages: &[Message]) -> Result<String, ChatError>;

    /// Replaces the messages of an existing conversation and refreshes
    /// `updated_at`. The title changes only when one is given.
    async fn update(
        &self,
        id: &str,
        messages: &[Message],
        title: Option<&str>,
    ) -> Result<(), ChatError>;

    /// All conversations of a user, most recently updated first.
    async fn list(&self, user_id: &str) -> Result<Vec<ChatHistory>, ChatError>;

    async fn get(&self, id: &str) -> Result<Option<ChatHistory>, ChatError>;

    async fn delete(&self, id: &str) -> Result<(), ChatError>;
}

// Define the database schema using CREATE TABLE IF NOT EXISTS statements
const MIGRATIONS_SQL: &str = "
-- Conversations Table
CREATE TABLE IF NOT EXISTS conversations (
    id TEXT PRIMARY KEY NOT NULL, -- UUID
    user_id TEXT NOT NULL,
    title TEXT NOT NULL,
    created_at INTEGER NOT NULL, -- Unix Timestamp (milliseconds)
    updated_at INTEGER NOT NULL -- Unix Timestamp (milliseconds)
);
CREATE INDEX IF NOT EXISTS idx_conversations_user_id ON conversations(user_id);

-- Messages Table
CREATE TABLE IF NOT EXISTS messages (
    conversation_id TEXT NOT NULL,
    position INTEGER NOT NULL, -- order within the conversation
    id TEXT NOT NULL, -- UUID
    role TEXT NOT NULL, -- 'user' or 'assistant'
    content TEXT NOT NULL,
    timestamp INTEGER NOT NULL, -- Unix Timestamp (milliseconds)
    PRIMARY KEY (conversation_id, position),
    FOREIGN KEY (conversation_id) REFERENCES conversations(id) ON DELETE CASCADE
);
";

type ConversationRow = (String, String, String, i64, i64);
type MessageRow = (String, String, String, i64);

#[derive(Debug, Clone)]
pub struct SqliteChatStore {
    pool: SqlitePool,
}

impl SqliteChatStore {
    /// Connects to (creating if needed) the database at `db_url` and runs migrations.
    pub async fn connect(db_url: &str) -> Result<Self, anyhow::Error> {
        use anyhow::Context;

        log::info!("Connecting to database: {}", db_url);
        let in_memory = db_url.contains(":memory:");

        // Create the database file if it doesn't exist
        if !in_memory && !Sqlite::database_exists(db_url).await.unwrap_or(false) {
            log::info!("Database file not found, creating...");
            Sqlite::create_database(db_url)
                .await
                .context("Failed to create database")?;
        }

        // Every connection to `:memory:` is its own database, so pin to one.
        let pool = SqlitePoolOptions::new()
            .max_connections(if in_memory { 1 } else { 5 })
            .connect(db_url)
            .await
            .context("Failed to connect to SQLite database")?;

        Self::run_migrations(&pool).await?;
        Ok(Self { pool })
    }

    /// Applies the database schema migrations.
    async fn run_migrations(pool: &SqlitePool) -> Result<(), anyhow::Error> {
        use anyhow::Context;

        log::info!("Running database migrations...");
        sqlx::query(MIGRATIONS_SQL)
            .execute(pool)
            .await
            .context("Failed to run database migrations")?;
        log::info!("Database migrations completed.");
        Ok(())
    }

    async fn load_messages(&self, conversation_id: &str) -> Result<Vec<Message>, ChatError> {
        let rows: Vec<MessageRow> = sqlx::query_as(
            "SELECT id, role, content, timestamp FROM messages \
             WHERE conversation_id = ? ORDER BY position ASC",
        )
        .bind(conversation_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|(id, role, content, timestamp)| {
                Ok(Message {
                    id,
                    role: parse_role(&role)?,
                    content,
                    timestamp,
                })
            })
            .collect()
    }

    async fn hydrate(&self, row: ConversationRow) -> Result<ChatHistory, ChatError> {
        let (id, user_id, title, created_at, updated_at) = row;
        let messages = self.load_messages(&id).await?;
        Ok(ChatHistory {
            id,
            user_id,
            title,
            messages,
            created_at,
            updated_at,
        })
    }
}

async fn insert_messages(
    tx: &mut sqlx::Transaction<'_, Sqlite>,
    conversation_id: &str,
    messages: &[Message],
) -> Result<(), ChatError> {
    for (position, message) in messages.iter().enumerate() {
        sqlx::query(
            "INSERT INTO messages (conversation_id, position, id, role, content, timestamp) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(conversation_id)
        .bind(position as i64)
        .bind(&message.id)
        .bind(message.role.as_str())
        .bind(&message.content)
        .bind(message.timestamp)
        .execute(&mut **tx)
        .await?;
    }
    Ok(())
}

fn parse_role(raw: &str) -> Result<Role, ChatError> {
    match raw {
        "user" => Ok(Role::User),
        "assistant" => Ok(Role::Assistant),
        "system" => Ok(Role::System),
        other => Err(ChatError::Persistence(format!("unknown stored role '{}'", other))),
    }
}

#[async_trait]
impl ChatStore for SqliteChatStore {
    async fn create(&self, user_id: &str, messages: &[Message]) -> Result<String, ChatError> {
        let id = Uuid::new_v4().to_string();
        let title = derive_title(messages);
        let now = now_millis();
        log::info!("Creating conversation {} for user {}", id, user_id);

        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "INSERT INTO conversations (id, user_id, title, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(user_id)
        .bind(&title)
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await?;
        insert_messages(&mut tx, &id, messages).await?;
        tx.commit().await?;

        log::info!("Successfully created conversation {} ({} messages)", id, messages.len());
        Ok(id)
    }

    async fn update(
        &self,
        id: &str,
        messages: &[Message],
        title: Option<&str>,
    ) -> Result<(), ChatError> {
        log::debug!("Updating conversation {} with {} messages", id, messages.len());

        let mut tx = self.pool.begin().await?;
        let result = sqlx::query(
            "UPDATE conversations SET updated_at = ?, title = COALESCE(?, title) WHERE id = ?",
        )
        .bind(now_millis())
        .bind(title)
        .bind(id)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            log::warn!("Attempted to update non-existent conversation: {}", id);
            return Err(ChatError::NotFound(format!("conversation {}", id)));
        }

        sqlx::query("DELETE FROM messages WHERE conversation_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        insert_messages(&mut tx, id, messages).await?;
        tx.commit().await?;

        log::info!("Successfully updated conversation {}", id);
        Ok(())
    }

    async fn list(&self, user_id: &str) -> Result<Vec<ChatHistory>, ChatError> {
        let rows: Vec<ConversationRow> = sqlx::query_as(
            "SELECT id, user_id, title, created_at, updated_at FROM conversations \
             WHERE user_id = ? ORDER BY updated_at DESC",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        let mut histories = Vec::with_capacity(rows.len());
        for row in rows {
            histories.push(self.hydrate(row).await?);
        }
        log::info!("Fetched {} conversations for user {}", histories.len(), user_id);
        Ok(histories)
    }

    async fn get(&self, id: &str) -> Result<Option<ChatHistory>, ChatError> {
        let row: Option<ConversationRow> = sqlx::query_as(
            "SELECT id, user_id, title, created_at, updated_at FROM conversations WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(Some(self.hydrate(row).await?)),
            None => Ok(None),
        }
    }

    async fn delete(&self, id: &str) -> Result<(), ChatError> {
        log::warn!("Deleting conversation with ID: {}", id);

        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM messages WHERE conversation_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        let result = sqlx::query("DELETE FROM conversations WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        if result.rows_affected() == 0 {
            log::warn!("Attempted to delete non-existent conversation: {}", id);
            return Err(ChatError::NotFound(format!("conversation {}", id)));
        }
        Ok(())
    }
}

/// Process-local store, used for tests and `STREAMCHAT_DATABASE_URL=memory`.
#[derive(Debug, Default)]
pub struct MemoryChatStore {
    histories: DashMap<String, ChatHistory>,
}

impl MemoryChatStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ChatStore for MemoryChatStore {
    async fn create(&self, user_id: &str, messages: &[Message]) -> Result<String, ChatError> {
        let id = Uuid::new_v4().to_string();
        let now = now_millis();
        self.histories.insert(
            id.clone(),
            ChatHistory {
                id: id.clone(),
                user_id: user_id.to_string(),
                title: derive_title(messages),
                messages: messages.to_vec(),
                created_at: now,
                updated_at: now,
            },
        );
        Ok(id)
    }

    async fn update(
        &self,
        id: &str,
        messages: &[Message],
        title: Option<&str>,
    ) -> Result<(), ChatError> {
        let mut entry = self
            .histories
            .get_mut(id)
            .ok_or_else(|| ChatError::NotFound(format!("conversation {}", id)))?;
        entry.messages = messages.to_vec();
        entry.updated_at = now_millis();
        if let Some(title) = title {
            entry.title = title.to_string();
        }
        Ok(())
    }

    async fn list(&self, user_id: &str) -> Result<Vec<ChatHistory>, ChatError> {
        let mut histories: Vec<ChatHistory> = self
            .histories
            .iter()
            .filter(|h| h.user_id == user_id)
            .map(|h| h.value().clone())
            .collect();
        histories.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(histories)
    }

    async fn get(&self, id: &str) -> Result<Option<ChatHistory>, ChatError> {
        Ok(self.histories.get(id).map(|h| h.value().clone()))
    }

    async fn delete(&self, id: &str) -> Result<(), ChatError> {
        self.histories
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| ChatError::NotFound(format!("conversation {}", id)))
    }
}
