use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    Pool, Row, Sqlite,
};
use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use shared::domain::{AccountId, ChatId, MessageId};

#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

#[derive(Debug, Clone)]
pub struct StoredMessage {
    pub message_id: MessageId,
    pub chat_id: ChatId,
    pub sender_id: AccountId,
    pub body: String,
    pub seq: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoredLastMessage {
    pub body: String,
    pub sender_id: AccountId,
    pub seq: i64,
    pub sent_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct StoredChat {
    pub chat_id: ChatId,
    pub participant_lo: AccountId,
    pub participant_hi: AccountId,
    pub last_message: Option<StoredLastMessage>,
    pub unread: i64,
}

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5));
        // An in-memory database is private to its connection, so the pool
        // must not open a second one.
        let max_connections = if database_url.contains(":memory:") { 1 } else { 5 };
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

    pub async fn create_account(&self, username: &str) -> Result<AccountId> {
        let rec = sqlx::query(
            "INSERT INTO accounts (username) VALUES (?)
             ON CONFLICT(username) DO UPDATE SET username=excluded.username
             RETURNING id",
        )
        .bind(username)
        .fetch_one(&self.pool)
        .await?;
        Ok(AccountId(rec.get::<i64, _>(0)))
    }

    pub async fn account_exists(&self, account_id: AccountId) -> Result<bool> {
        let row = sqlx::query("SELECT 1 FROM accounts WHERE id = ?")
            .bind(account_id.0)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    /// Insert-or-fetch on the canonical (min, max) participant pair. The
    /// UNIQUE index on (participant_lo, participant_hi) makes concurrent
    /// creation collapse to a single row; the loser of the race gets the
    /// winner's id back.
    pub async fn resolve_or_create_chat(&self, a: AccountId, b: AccountId) -> Result<ChatId> {
        let (lo, hi) = canonical_pair(a, b);
        let rec = sqlx::query(
            "INSERT INTO chats (participant_lo, participant_hi) VALUES (?, ?)
             ON CONFLICT(participant_lo, participant_hi) DO UPDATE SET participant_lo=excluded.participant_lo
             RETURNING id",
        )
        .bind(lo.0)
        .bind(hi.0)
        .fetch_one(&self.pool)
        .await?;
        Ok(ChatId(rec.get::<i64, _>(0)))
    }

    pub async fn chat_participants(
        &self,
        chat_id: ChatId,
    ) -> Result<Option<(AccountId, AccountId)>> {
        let row = sqlx::query("SELECT participant_lo, participant_hi FROM chats WHERE id = ?")
            .bind(chat_id.0)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| (AccountId(r.get::<i64, _>(0)), AccountId(r.get::<i64, _>(1)))))
    }

    pub async fn load_chat(&self, chat_id: ChatId, viewer: AccountId) -> Result<Option<StoredChat>> {
        let row = sqlx::query(&chat_select_sql("c.id = ?3"))
            .bind(viewer.0)
            .bind(viewer.0)
            .bind(chat_id.0)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(stored_chat_from_row))
    }

    pub async fn list_chats_for_account(&self, account_id: AccountId) -> Result<Vec<StoredChat>> {
        let rows = sqlx::query(&format!(
            "{} ORDER BY c.last_message_id IS NULL, c.last_message_id DESC, c.id ASC",
            chat_select_sql("c.participant_lo = ?3 OR c.participant_hi = ?3"),
        ))
        .bind(account_id.0)
        .bind(account_id.0)
        .bind(account_id.0)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(stored_chat_from_row).collect())
    }

    /// Appends a message and refreshes the chat's last-message projection in
    /// one transaction. Seq is assigned here, from the chat's current
    /// maximum, never from anything the client supplied.
    pub async fn append_message(
        &self,
        chat_id: ChatId,
        sender_id: AccountId,
        body: &str,
    ) -> Result<StoredMessage> {
        let mut tx = self.pool.begin().await?;

        let rec = sqlx::query(
            "INSERT INTO messages (chat_id, sender_id, body, seq)
             SELECT ?1, ?2, ?3, COALESCE(MAX(seq), 0) + 1 FROM messages WHERE chat_id = ?1
             RETURNING id, seq, created_at",
        )
        .bind(chat_id.0)
        .bind(sender_id.0)
        .bind(body)
        .fetch_one(&mut *tx)
        .await?;

        let message = StoredMessage {
            message_id: MessageId(rec.get::<i64, _>(0)),
            chat_id,
            sender_id,
            body: body.to_string(),
            seq: rec.get::<i64, _>(1),
            created_at: rec.get::<DateTime<Utc>, _>(2),
        };

        sqlx::query(
            "UPDATE chats
             SET last_message_id = ?2, last_message_text = ?3, last_message_sender = ?4, last_message_seq = ?5, last_message_at = ?6
             WHERE id = ?1",
        )
        .bind(chat_id.0)
        .bind(message.message_id.0)
        .bind(&message.body)
        .bind(sender_id.0)
        .bind(message.seq)
        .bind(message.created_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(message)
    }

    pub async fn message_sender(
        &self,
        chat_id: ChatId,
        message_id: MessageId,
    ) -> Result<Option<AccountId>> {
        let row = sqlx::query("SELECT sender_id FROM messages WHERE id = ? AND chat_id = ?")
            .bind(message_id.0)
            .bind(chat_id.0)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| AccountId(r.get::<i64, _>(0))))
    }

    /// Soft-deletes a message and, if it was the projection head, recomputes
    /// the projection to the newest surviving message before committing.
    /// Returns the chat's projection after the deletion, or None when the
    /// message does not exist.
    pub async fn mark_message_deleted(
        &self,
        chat_id: ChatId,
        message_id: MessageId,
    ) -> Result<Option<Option<StoredLastMessage>>> {
        let mut tx = self.pool.begin().await?;

        let deleted = sqlx::query(
            "UPDATE messages SET deleted = 1 WHERE id = ? AND chat_id = ? RETURNING seq",
        )
        .bind(message_id.0)
        .bind(chat_id.0)
        .fetch_optional(&mut *tx)
        .await?;
        let Some(deleted) = deleted else {
            return Ok(None);
        };
        let deleted_seq = deleted.get::<i64, _>(0);

        let head_seq = sqlx::query_scalar::<_, Option<i64>>(
            "SELECT last_message_seq FROM chats WHERE id = ?",
        )
        .bind(chat_id.0)
        .fetch_one(&mut *tx)
        .await?;

        if head_seq == Some(deleted_seq) {
            let survivor = sqlx::query(
                "SELECT id, body, sender_id, seq, created_at FROM messages
                 WHERE chat_id = ? AND deleted = 0
                 ORDER BY seq DESC
                 LIMIT 1",
            )
            .bind(chat_id.0)
            .fetch_optional(&mut *tx)
            .await?;

            match survivor {
                Some(r) => {
                    sqlx::query(
                        "UPDATE chats
                         SET last_message_id = ?2, last_message_text = ?3, last_message_sender = ?4, last_message_seq = ?5, last_message_at = ?6
                         WHERE id = ?1",
                    )
                    .bind(chat_id.0)
                    .bind(r.get::<i64, _>(0))
                    .bind(r.get::<String, _>(1))
                    .bind(r.get::<i64, _>(2))
                    .bind(r.get::<i64, _>(3))
                    .bind(r.get::<DateTime<Utc>, _>(4))
                    .execute(&mut *tx)
                    .await?;
                }
                None => {
                    sqlx::query(
                        "UPDATE chats
                         SET last_message_id = NULL, last_message_text = NULL, last_message_sender = NULL, last_message_seq = NULL, last_message_at = NULL
                         WHERE id = ?1",
                    )
                    .bind(chat_id.0)
                    .execute(&mut *tx)
                    .await?;
                }
            }
        }

        let head = sqlx::query(
            "SELECT last_message_text, last_message_sender, last_message_seq, last_message_at
             FROM chats WHERE id = ?",
        )
        .bind(chat_id.0)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(Some(last_message_from_row(&head, 0)))
    }

    pub async fn list_messages(
        &self,
        chat_id: ChatId,
        after_seq: i64,
        limit: u32,
    ) -> Result<Vec<StoredMessage>> {
        let rows = sqlx::query(
            "SELECT id, chat_id, sender_id, body, seq, created_at
             FROM messages
             WHERE chat_id = ? AND seq > ? AND deleted = 0
             ORDER BY seq ASC
             LIMIT ?",
        )
        .bind(chat_id.0)
        .bind(after_seq)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|r| StoredMessage {
                message_id: MessageId(r.get::<i64, _>(0)),
                chat_id: ChatId(r.get::<i64, _>(1)),
                sender_id: AccountId(r.get::<i64, _>(2)),
                body: r.get::<String, _>(3),
                seq: r.get::<i64, _>(4),
                created_at: r.get::<DateTime<Utc>, _>(5),
            })
            .collect())
    }

    /// Forward-only read cursor: a markRead with a smaller seq is a no-op.
    pub async fn mark_read(
        &self,
        chat_id: ChatId,
        account_id: AccountId,
        through_seq: i64,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO read_markers (chat_id, account_id, through_seq) VALUES (?, ?, ?)
             ON CONFLICT(chat_id, account_id) DO UPDATE SET through_seq = MAX(through_seq, excluded.through_seq)",
        )
        .bind(chat_id.0)
        .bind(account_id.0)
        .bind(through_seq)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn unread_count(&self, chat_id: ChatId, account_id: AccountId) -> Result<i64> {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM messages m
             WHERE m.chat_id = ?1 AND m.deleted = 0 AND m.sender_id != ?2
               AND m.seq > COALESCE(
                   (SELECT through_seq FROM read_markers WHERE chat_id = ?1 AND account_id = ?2), 0)",
        )
        .bind(chat_id.0)
        .bind(account_id.0)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    pub async fn delete_chat(&self, chat_id: ChatId) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM messages WHERE chat_id = ?")
            .bind(chat_id.0)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM read_markers WHERE chat_id = ?")
            .bind(chat_id.0)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM chats WHERE id = ?")
            .bind(chat_id.0)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }
}

pub fn canonical_pair(a: AccountId, b: AccountId) -> (AccountId, AccountId) {
    if a.0 <= b.0 {
        (a, b)
    } else {
        (b, a)
    }
}

fn chat_select_sql(filter: &str) -> String {
    format!(
        "SELECT c.id, c.participant_lo, c.participant_hi,
                c.last_message_text, c.last_message_sender, c.last_message_seq, c.last_message_at,
                (SELECT COUNT(*) FROM messages m
                 WHERE m.chat_id = c.id AND m.deleted = 0 AND m.sender_id != ?1
                   AND m.seq > COALESCE(
                       (SELECT through_seq FROM read_markers r
                        WHERE r.chat_id = c.id AND r.account_id = ?2), 0)) AS unread
         FROM chats c
         WHERE {filter}"
    )
}

fn stored_chat_from_row(r: sqlx::sqlite::SqliteRow) -> StoredChat {
    StoredChat {
        chat_id: ChatId(r.get::<i64, _>(0)),
        participant_lo: AccountId(r.get::<i64, _>(1)),
        participant_hi: AccountId(r.get::<i64, _>(2)),
        last_message: last_message_from_row(&r, 3),
        unread: r.get::<i64, _>(7),
    }
}

fn last_message_from_row(r: &sqlx::sqlite::SqliteRow, offset: usize) -> Option<StoredLastMessage> {
    let seq = r.get::<Option<i64>, _>(offset + 2)?;
    Some(StoredLastMessage {
        body: r.get::<Option<String>, _>(offset).unwrap_or_default(),
        sender_id: AccountId(r.get::<Option<i64>, _>(offset + 1).unwrap_or_default()),
        seq,
        sent_at: r.get::<DateTime<Utc>, _>(offset + 3),
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
