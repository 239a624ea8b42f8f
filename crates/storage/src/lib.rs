use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow},
    Pool, Row, Sqlite,
};
use std::{
    collections::BTreeSet,
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};
use uuid::Uuid;

use shared::domain::{
    ConversationId, ConversationKind, FileId, MessageId, MessageKind, ParticipantRole, UserId,
};

#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

#[derive(Debug, Clone)]
pub struct StoredAttachment {
    pub file_name: String,
    pub url: String,
    pub size_bytes: u64,
    pub mime_type: String,
    pub duration_ms: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct StoredMessage {
    pub message_id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub sender_name: Option<String>,
    pub kind: MessageKind,
    pub content: String,
    pub attachments: Vec<StoredAttachment>,
    pub created_at: DateTime<Utc>,
    pub deleted_by: Option<UserId>,
    pub read_by: BTreeSet<UserId>,
}

#[derive(Debug, Clone)]
pub struct StoredParticipant {
    pub user_id: UserId,
    pub display_name: String,
    pub role: ParticipantRole,
}

#[derive(Debug, Clone)]
pub struct StoredConversation {
    pub conversation_id: ConversationId,
    pub kind: ConversationKind,
    pub name: Option<String>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct StoredFile {
    pub file_id: FileId,
    pub storage_key: String,
    pub uploader_id: UserId,
    pub file_name: String,
    pub mime_type: String,
    pub size_bytes: u64,
    pub bytes: Vec<u8>,
}

const MESSAGE_COLUMNS: &str = "m.id, m.conversation_id, m.sender_user_id, u.display_name, m.kind, m.content, m.created_at, m.deleted_by";

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
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

    pub async fn create_user(&self, display_name: &str, role: &str) -> Result<UserId> {
        let rec = sqlx::query(
            "INSERT INTO users (display_name, role) VALUES (?, ?)
             ON CONFLICT(display_name) DO UPDATE SET role=excluded.role
             RETURNING id",
        )
        .bind(display_name)
        .bind(role)
        .fetch_one(&self.pool)
        .await?;
        Ok(UserId(rec.get::<i64, _>(0)))
    }

    pub async fn display_name_for_user(&self, user_id: UserId) -> Result<Option<String>> {
        let row = sqlx::query("SELECT display_name FROM users WHERE id = ?")
            .bind(user_id.0)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get::<String, _>(0)))
    }

    pub async fn create_conversation(
        &self,
        kind: ConversationKind,
        name: Option<&str>,
        participants: &[(UserId, ParticipantRole)],
    ) -> Result<ConversationId> {
        let distinct: BTreeSet<UserId> = participants.iter().map(|(id, _)| *id).collect();
        if distinct.len() != participants.len() {
            bail!("participant list contains duplicates");
        }
        match kind {
            ConversationKind::Direct if participants.len() != 2 => {
                bail!("direct conversations have exactly two participants")
            }
            ConversationKind::Group if participants.is_empty() => {
                bail!("group conversations need at least one participant")
            }
            _ => {}
        }

        let mut tx = self.pool.begin().await?;
        let rec = sqlx::query(
            "INSERT INTO conversations (kind, name, updated_at) VALUES (?, ?, ?) RETURNING id",
        )
        .bind(kind.as_str())
        .bind(name)
        .bind(Utc::now())
        .fetch_one(&mut *tx)
        .await?;
        let conversation_id = ConversationId(rec.get::<i64, _>(0));

        for (user_id, role) in participants {
            sqlx::query(
                "INSERT INTO participants (conversation_id, user_id, role) VALUES (?, ?, ?)",
            )
            .bind(conversation_id.0)
            .bind(user_id.0)
            .bind(role.as_str())
            .execute(&mut *tx)
            .await
            .with_context(|| format!("failed to add participant {user_id}"))?;
        }
        tx.commit().await?;
        Ok(conversation_id)
    }

    pub async fn load_conversation(
        &self,
        conversation_id: ConversationId,
    ) -> Result<Option<StoredConversation>> {
        let row = sqlx::query("SELECT id, kind, name, updated_at FROM conversations WHERE id = ?")
            .bind(conversation_id.0)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| conversation_from_row(&r)).transpose()
    }

    pub async fn list_conversations_for_user(
        &self,
        user_id: UserId,
    ) -> Result<Vec<StoredConversation>> {
        let rows = sqlx::query(
            "SELECT c.id, c.kind, c.name, c.updated_at
             FROM conversations c
             INNER JOIN participants p ON p.conversation_id = c.id
             WHERE p.user_id = ?
             ORDER BY c.updated_at DESC, c.id DESC",
        )
        .bind(user_id.0)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(conversation_from_row).collect()
    }

    pub async fn list_participants(
        &self,
        conversation_id: ConversationId,
    ) -> Result<Vec<StoredParticipant>> {
        let rows = sqlx::query(
            "SELECT u.id, u.display_name, p.role
             FROM participants p
             INNER JOIN users u ON u.id = p.user_id
             WHERE p.conversation_id = ?
             ORDER BY lower(u.display_name) ASC",
        )
        .bind(conversation_id.0)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|r| StoredParticipant {
                user_id: UserId(r.get::<i64, _>(0)),
                display_name: r.get::<String, _>(1),
                role: ParticipantRole::parse(&r.get::<String, _>(2)),
            })
            .collect())
    }

    pub async fn participant_role(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
    ) -> Result<Option<ParticipantRole>> {
        let row =
            sqlx::query("SELECT role FROM participants WHERE conversation_id = ? AND user_id = ?")
                .bind(conversation_id.0)
                .bind(user_id.0)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|r| ParticipantRole::parse(&r.get::<String, _>(0))))
    }

    /// Persists a message and bumps the conversation's `updated_at` in one
    /// transaction.
    pub async fn insert_message(
        &self,
        conversation_id: ConversationId,
        sender_id: UserId,
        kind: MessageKind,
        content: &str,
        attachments: &[StoredAttachment],
    ) -> Result<StoredMessage> {
        if kind == MessageKind::Deleted {
            bail!("refusing to insert a deleted message");
        }
        let created_at = Utc::now();
        let mut tx = self.pool.begin().await?;
        let rec = sqlx::query(
            "INSERT INTO messages (conversation_id, sender_user_id, kind, content, created_at)
             VALUES (?, ?, ?, ?, ?) RETURNING id",
        )
        .bind(conversation_id.0)
        .bind(sender_id.0)
        .bind(kind.as_str())
        .bind(content)
        .bind(created_at)
        .fetch_one(&mut *tx)
        .await?;
        let message_id = MessageId(rec.get::<i64, _>(0));

        for (position, attachment) in attachments.iter().enumerate() {
            sqlx::query(
                "INSERT INTO attachments (message_id, position, file_name, url, size_bytes, mime_type, duration_ms)
                 VALUES (?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(message_id.0)
            .bind(position as i64)
            .bind(&attachment.file_name)
            .bind(&attachment.url)
            .bind(i64::try_from(attachment.size_bytes).unwrap_or(i64::MAX))
            .bind(&attachment.mime_type)
            .bind(attachment.duration_ms.map(|ms| i64::try_from(ms).unwrap_or(i64::MAX)))
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query("UPDATE conversations SET updated_at = ? WHERE id = ?")
            .bind(created_at)
            .bind(conversation_id.0)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        self.load_message(message_id)
            .await?
            .with_context(|| format!("message {message_id} vanished after insert"))
    }

    pub async fn load_message(&self, message_id: MessageId) -> Result<Option<StoredMessage>> {
        let row = sqlx::query(&format!(
            "SELECT {MESSAGE_COLUMNS}
             FROM messages m
             LEFT JOIN users u ON u.id = m.sender_user_id
             WHERE m.id = ?"
        ))
        .bind(message_id.0)
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some(row) => Ok(Some(self.hydrate_message(&row).await?)),
            None => Ok(None),
        }
    }

    /// Oldest-first page of messages visible to `viewer_id`.
    pub async fn list_conversation_messages(
        &self,
        conversation_id: ConversationId,
        viewer_id: UserId,
        limit: u32,
        before: Option<MessageId>,
    ) -> Result<Vec<StoredMessage>> {
        let rows = sqlx::query(&format!(
            "SELECT {MESSAGE_COLUMNS}
             FROM messages m
             LEFT JOIN users u ON u.id = m.sender_user_id
             WHERE m.conversation_id = ?
               AND (? IS NULL OR m.id < ?)
               AND NOT EXISTS (
                   SELECT 1 FROM message_hidden h WHERE h.message_id = m.id AND h.user_id = ?
               )
             ORDER BY m.id DESC
             LIMIT ?"
        ))
        .bind(conversation_id.0)
        .bind(before.map(|id| id.0))
        .bind(before.map(|id| id.0))
        .bind(viewer_id.0)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        let mut messages = Vec::with_capacity(rows.len());
        for row in rows.iter().rev() {
            messages.push(self.hydrate_message(row).await?);
        }
        Ok(messages)
    }

    pub async fn last_visible_message(
        &self,
        conversation_id: ConversationId,
        viewer_id: UserId,
    ) -> Result<Option<StoredMessage>> {
        let mut page = self
            .list_conversation_messages(conversation_id, viewer_id, 1, None)
            .await?;
        Ok(page.pop())
    }

    pub async fn unread_count(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
    ) -> Result<u32> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*)
             FROM messages m
             WHERE m.conversation_id = ?1
               AND m.sender_user_id != ?2
               AND m.kind != 'DELETED'
               AND NOT EXISTS (SELECT 1 FROM message_reads r WHERE r.message_id = m.id AND r.user_id = ?2)
               AND NOT EXISTS (SELECT 1 FROM message_hidden h WHERE h.message_id = m.id AND h.user_id = ?2)",
        )
        .bind(conversation_id.0)
        .bind(user_id.0)
        .fetch_one(&self.pool)
        .await?;
        Ok(u32::try_from(count).unwrap_or(u32::MAX))
    }

    /// Records reads for every message in the conversation the reader has not
    /// seen yet and returns the ids that changed.
    pub async fn mark_conversation_read(
        &self,
        conversation_id: ConversationId,
        reader_id: UserId,
    ) -> Result<Vec<MessageId>> {
        let mut tx = self.pool.begin().await?;
        let rows = sqlx::query(
            "SELECT m.id
             FROM messages m
             WHERE m.conversation_id = ?1
               AND m.sender_user_id != ?2
               AND m.kind != 'DELETED'
               AND NOT EXISTS (SELECT 1 FROM message_reads r WHERE r.message_id = m.id AND r.user_id = ?2)
             ORDER BY m.id ASC",
        )
        .bind(conversation_id.0)
        .bind(reader_id.0)
        .fetch_all(&mut *tx)
        .await?;
        let message_ids: Vec<MessageId> = rows
            .into_iter()
            .map(|r| MessageId(r.get::<i64, _>(0)))
            .collect();

        for message_id in &message_ids {
            sqlx::query("INSERT OR IGNORE INTO message_reads (message_id, user_id) VALUES (?, ?)")
                .bind(message_id.0)
                .bind(reader_id.0)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(message_ids)
    }

    /// Turns a message into a tombstone. Returns `false` when it already was one.
    pub async fn tombstone_message(&self, message_id: MessageId, deleted_by: UserId) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        let result = sqlx::query(
            "UPDATE messages SET kind = 'DELETED', content = '', deleted_by = ?
             WHERE id = ? AND kind != 'DELETED'",
        )
        .bind(deleted_by.0)
        .bind(message_id.0)
        .execute(&mut *tx)
        .await?;
        if result.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(false);
        }
        sqlx::query("DELETE FROM attachments WHERE message_id = ?")
            .bind(message_id.0)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(true)
    }

    pub async fn hide_message_for_user(&self, message_id: MessageId, user_id: UserId) -> Result<()> {
        sqlx::query("INSERT OR IGNORE INTO message_hidden (message_id, user_id) VALUES (?, ?)")
            .bind(message_id.0)
            .bind(user_id.0)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn store_file(
        &self,
        uploader_id: UserId,
        file_name: &str,
        mime_type: &str,
        bytes: &[u8],
    ) -> Result<StoredFile> {
        let storage_key = Uuid::new_v4().simple().to_string();
        let size_bytes = i64::try_from(bytes.len()).unwrap_or(i64::MAX);
        let rec = sqlx::query(
            "INSERT INTO files (storage_key, uploader_user_id, file_name, mime_type, size_bytes, bytes)
             VALUES (?, ?, ?, ?, ?, ?) RETURNING id",
        )
        .bind(&storage_key)
        .bind(uploader_id.0)
        .bind(file_name)
        .bind(mime_type)
        .bind(size_bytes)
        .bind(bytes)
        .fetch_one(&self.pool)
        .await?;
        Ok(StoredFile {
            file_id: FileId(rec.get::<i64, _>(0)),
            storage_key,
            uploader_id,
            file_name: file_name.to_string(),
            mime_type: mime_type.to_string(),
            size_bytes: bytes.len() as u64,
            bytes: bytes.to_vec(),
        })
    }

    pub async fn load_file(&self, file_id: FileId) -> Result<Option<StoredFile>> {
        let row = sqlx::query(
            "SELECT id, storage_key, uploader_user_id, file_name, mime_type, size_bytes, bytes
             FROM files WHERE id = ?",
        )
        .bind(file_id.0)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| StoredFile {
            file_id: FileId(r.get::<i64, _>(0)),
            storage_key: r.get::<String, _>(1),
            uploader_id: UserId(r.get::<i64, _>(2)),
            file_name: r.get::<String, _>(3),
            mime_type: r.get::<String, _>(4),
            size_bytes: r.get::<i64, _>(5).max(0) as u64,
            bytes: r.get::<Vec<u8>, _>(6),
        }))
    }

    async fn hydrate_message(&self, row: &SqliteRow) -> Result<StoredMessage> {
        let message_id = MessageId(row.get::<i64, _>(0));
        let raw_kind = row.get::<String, _>(4);
        let kind = MessageKind::parse(&raw_kind)
            .with_context(|| format!("message {message_id} has unknown kind '{raw_kind}'"))?;

        let attachments = sqlx::query(
            "SELECT file_name, url, size_bytes, mime_type, duration_ms
             FROM attachments WHERE message_id = ? ORDER BY position ASC",
        )
        .bind(message_id.0)
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(|r| StoredAttachment {
            file_name: r.get::<String, _>(0),
            url: r.get::<String, _>(1),
            size_bytes: r.get::<i64, _>(2).max(0) as u64,
            mime_type: r.get::<String, _>(3),
            duration_ms: r.get::<Option<i64>, _>(4).map(|ms| ms.max(0) as u64),
        })
        .collect();

        let read_by = sqlx::query("SELECT user_id FROM message_reads WHERE message_id = ?")
            .bind(message_id.0)
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(|r| UserId(r.get::<i64, _>(0)))
            .collect();

        Ok(StoredMessage {
            message_id,
            conversation_id: ConversationId(row.get::<i64, _>(1)),
            sender_id: UserId(row.get::<i64, _>(2)),
            sender_name: row.get::<Option<String>, _>(3),
            kind,
            content: row.get::<String, _>(5),
            attachments,
            created_at: row.get::<DateTime<Utc>, _>(6),
            deleted_by: row.get::<Option<i64>, _>(7).map(UserId),
            read_by,
        })
    }
}

fn conversation_from_row(row: &SqliteRow) -> Result<StoredConversation> {
    let raw_kind = row.get::<String, _>(1);
    let kind = ConversationKind::parse(&raw_kind)
        .with_context(|| format!("unknown conversation kind '{raw_kind}'"))?;
    Ok(StoredConversation {
        conversation_id: ConversationId(row.get::<i64, _>(0)),
        kind,
        name: row.get::<Option<String>, _>(2),
        updated_at: row.get::<DateTime<Utc>, _>(3),
    })
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
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if database_url == "sqlite::memory:" || !database_url.starts_with("sqlite:") {
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
