use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow},
    Pool, Row, Sqlite,
};

use shared::{
    domain::{
        ConversationId, LocalId, MessageId, MessageKind, MessageStatus, Participant, UserId,
    },
    protocol::{ConversationRecord, MessageRecord},
};

mod memory;

pub use memory::MemoryCache;

/// Primary key of a cached message. Server-confirmed records are keyed by
/// their authoritative id, optimistic records by the client-side local id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MessageKey {
    Server(MessageId),
    Local(LocalId),
}

impl MessageKey {
    fn cache_key(self) -> String {
        match self {
            Self::Server(id) => format!("s:{}", id.0),
            Self::Local(id) => format!("l:{}", id.0),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedMessage {
    pub key: MessageKey,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub receiver_id: Option<UserId>,
    pub kind: MessageKind,
    pub content: String,
    pub status: MessageStatus,
    pub created_at: i64,
}

impl CachedMessage {
    pub fn server_id(&self) -> Option<MessageId> {
        match self.key {
            MessageKey::Server(id) => Some(id),
            MessageKey::Local(_) => None,
        }
    }

    pub fn local_id(&self) -> Option<LocalId> {
        match self.key {
            MessageKey::Local(id) => Some(id),
            MessageKey::Server(_) => None,
        }
    }
}

impl From<MessageRecord> for CachedMessage {
    fn from(value: MessageRecord) -> Self {
        Self {
            key: MessageKey::Server(value.id),
            conversation_id: value.conversation_id,
            sender_id: value.sender_id,
            receiver_id: Some(value.receiver_id),
            kind: value.kind,
            content: value.content,
            status: value.status,
            created_at: value.created_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedConversation {
    pub id: ConversationId,
    pub participant: Participant,
    pub unread_count: u32,
    pub updated_at: i64,
}

impl From<ConversationRecord> for CachedConversation {
    fn from(value: ConversationRecord) -> Self {
        Self {
            id: value.id,
            participant: value.participant,
            unread_count: value.unread_count,
            updated_at: value.updated_at,
        }
    }
}

/// Read/write contract of the durable local cache.
///
/// Every single-key write is atomic. `replace_message` is the only
/// multi-key operation and must commit both halves together.
#[async_trait]
pub trait LocalCache: Send + Sync {
    async fn put_message(&self, message: &CachedMessage) -> Result<()>;
    async fn delete_message(&self, key: MessageKey) -> Result<()>;
    /// Removes `old` and writes `new` in one transaction.
    async fn replace_message(&self, old: MessageKey, new: &CachedMessage) -> Result<()>;
    async fn get_message(&self, key: MessageKey) -> Result<Option<CachedMessage>>;
    /// Server records ordered by id, followed by local records ordered by local id.
    async fn messages_by_conversation(
        &self,
        conversation_id: ConversationId,
    ) -> Result<Vec<CachedMessage>>;
    /// The server record with the highest id across all conversations.
    async fn last_message(&self) -> Result<Option<CachedMessage>>;
    async fn put_conversation(&self, conversation: &CachedConversation) -> Result<()>;
    async fn conversation(&self, id: ConversationId) -> Result<Option<CachedConversation>>;
    async fn conversations(&self) -> Result<Vec<CachedConversation>>;
    async fn sync_cursor(&self, conversation_id: ConversationId) -> Result<Option<MessageId>>;
    /// Moves the cursor forward to `candidate` if it is higher and returns
    /// the resulting cursor. Never moves it backwards.
    async fn advance_sync_cursor(
        &self,
        conversation_id: ConversationId,
        candidate: MessageId,
    ) -> Result<MessageId>;
    async fn clear(&self) -> Result<()>;
}

#[derive(Clone)]
pub struct SqliteCache {
    pool: Pool<Sqlite>,
}

impl SqliteCache {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)
            .with_context(|| format!("invalid cache url '{database_url}'"))?
            .create_if_missing(true);
        // Every connection to `sqlite::memory:` opens its own database.
        let max_connections = if database_url.starts_with("sqlite::memory:") {
            1
        } else {
            5
        };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(connect_options)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }
}

const UPSERT_MESSAGE: &str = "INSERT OR REPLACE INTO messages
     (cache_key, server_id, local_id, conversation_id, sender_id, receiver_id, kind, content, status, created_at)
     VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)";

const SELECT_MESSAGE_COLUMNS: &str = "SELECT server_id, local_id, conversation_id, sender_id, receiver_id, kind, content, status, created_at FROM messages";

fn bind_message<'q>(
    query: sqlx::query::Query<'q, Sqlite, sqlx::sqlite::SqliteArguments<'q>>,
    message: &CachedMessage,
) -> sqlx::query::Query<'q, Sqlite, sqlx::sqlite::SqliteArguments<'q>> {
    query
        .bind(message.key.cache_key())
        .bind(message.server_id().map(|id| id.0))
        .bind(message.local_id().map(|id| id.0))
        .bind(message.conversation_id.0)
        .bind(message.sender_id.0)
        .bind(message.receiver_id.map(|id| id.0))
        .bind(message.kind.as_str())
        .bind(message.content.clone())
        .bind(message.status.as_str())
        .bind(message.created_at)
}

fn message_from_row(row: &SqliteRow) -> Result<CachedMessage> {
    let server_id: Option<i64> = row.try_get("server_id")?;
    let local_id: Option<i64> = row.try_get("local_id")?;
    let key = match (server_id, local_id) {
        (Some(id), _) => MessageKey::Server(MessageId(id)),
        (None, Some(id)) => MessageKey::Local(LocalId(id)),
        (None, None) => anyhow::bail!("cached message row has neither server nor local id"),
    };
    let kind: String = row.try_get("kind")?;
    let status: String = row.try_get("status")?;
    Ok(CachedMessage {
        key,
        conversation_id: ConversationId(row.try_get("conversation_id")?),
        sender_id: UserId(row.try_get("sender_id")?),
        receiver_id: row.try_get::<Option<i64>, _>("receiver_id")?.map(UserId),
        kind: MessageKind::parse(&kind).unwrap_or_default(),
        content: row.try_get("content")?,
        status: MessageStatus::parse(&status).unwrap_or_default(),
        created_at: row.try_get("created_at")?,
    })
}

fn conversation_from_row(row: &SqliteRow) -> Result<CachedConversation> {
    Ok(CachedConversation {
        id: ConversationId(row.try_get("id")?),
        participant: Participant {
            id: UserId(row.try_get("participant_id")?),
            username: row.try_get("participant_username")?,
            nickname: row.try_get("participant_nickname")?,
        },
        unread_count: row.try_get::<i64, _>("unread_count")?.max(0) as u32,
        updated_at: row.try_get("updated_at")?,
    })
}

#[async_trait]
impl LocalCache for SqliteCache {
    async fn put_message(&self, message: &CachedMessage) -> Result<()> {
        bind_message(sqlx::query(UPSERT_MESSAGE), message)
            .execute(&self.pool)
            .await
            .context("failed to write cached message")?;
        Ok(())
    }

    async fn delete_message(&self, key: MessageKey) -> Result<()> {
        sqlx::query("DELETE FROM messages WHERE cache_key = ?")
            .bind(key.cache_key())
            .execute(&self.pool)
            .await
            .context("failed to delete cached message")?;
        Ok(())
    }

    async fn replace_message(&self, old: MessageKey, new: &CachedMessage) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM messages WHERE cache_key = ?")
            .bind(old.cache_key())
            .execute(&mut *tx)
            .await
            .context("failed to remove replaced message")?;

        bind_message(sqlx::query(UPSERT_MESSAGE), new)
            .execute(&mut *tx)
            .await
            .context("failed to write replacement message")?;

        tx.commit().await?;
        Ok(())
    }

    async fn get_message(&self, key: MessageKey) -> Result<Option<CachedMessage>> {
        let row = sqlx::query(&format!("{SELECT_MESSAGE_COLUMNS} WHERE cache_key = ?"))
            .bind(key.cache_key())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(message_from_row).transpose()
    }

    async fn messages_by_conversation(
        &self,
        conversation_id: ConversationId,
    ) -> Result<Vec<CachedMessage>> {
        let rows = sqlx::query(&format!(
            "{SELECT_MESSAGE_COLUMNS} WHERE conversation_id = ?
             ORDER BY server_id IS NULL, server_id ASC, local_id ASC"
        ))
        .bind(conversation_id.0)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(message_from_row).collect()
    }

    async fn last_message(&self) -> Result<Option<CachedMessage>> {
        let row = sqlx::query(&format!(
            "{SELECT_MESSAGE_COLUMNS} WHERE server_id IS NOT NULL ORDER BY server_id DESC LIMIT 1"
        ))
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(message_from_row).transpose()
    }

    async fn put_conversation(&self, conversation: &CachedConversation) -> Result<()> {
        sqlx::query(
            "INSERT OR REPLACE INTO conversations
             (id, participant_id, participant_username, participant_nickname, unread_count, updated_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(conversation.id.0)
        .bind(conversation.participant.id.0)
        .bind(conversation.participant.username.clone())
        .bind(conversation.participant.nickname.clone())
        .bind(i64::from(conversation.unread_count))
        .bind(conversation.updated_at)
        .execute(&self.pool)
        .await
        .context("failed to write cached conversation")?;
        Ok(())
    }

    async fn conversation(&self, id: ConversationId) -> Result<Option<CachedConversation>> {
        let row = sqlx::query("SELECT * FROM conversations WHERE id = ?")
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(conversation_from_row).transpose()
    }

    async fn conversations(&self) -> Result<Vec<CachedConversation>> {
        let rows = sqlx::query("SELECT * FROM conversations ORDER BY updated_at DESC, id ASC")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(conversation_from_row).collect()
    }

    async fn sync_cursor(&self, conversation_id: ConversationId) -> Result<Option<MessageId>> {
        let cursor: Option<i64> =
            sqlx::query_scalar("SELECT last_message_id FROM sync_cursors WHERE conversation_id = ?")
                .bind(conversation_id.0)
                .fetch_optional(&self.pool)
                .await?;
        Ok(cursor.map(MessageId))
    }

    async fn advance_sync_cursor(
        &self,
        conversation_id: ConversationId,
        candidate: MessageId,
    ) -> Result<MessageId> {
        let cursor: i64 = sqlx::query_scalar(
            "INSERT INTO sync_cursors (conversation_id, last_message_id) VALUES (?, ?)
             ON CONFLICT(conversation_id)
             DO UPDATE SET last_message_id = MAX(last_message_id, excluded.last_message_id)
             RETURNING last_message_id",
        )
        .bind(conversation_id.0)
        .bind(candidate.0)
        .fetch_one(&self.pool)
        .await
        .context("failed to advance sync cursor")?;
        Ok(MessageId(cursor))
    }

    async fn clear(&self) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for table in ["messages", "conversations", "sync_cursors"] {
            sqlx::query(&format!("DELETE FROM {table}"))
                .execute(&mut *tx)
                .await
                .with_context(|| format!("failed to clear {table}"))?;
        }
        tx.commit().await?;
        Ok(())
    }
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for cache url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if database_url.starts_with("sqlite::memory:") || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
