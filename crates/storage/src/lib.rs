use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow},
    Pool, QueryBuilder, Row, Sqlite,
};
use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};

use shared::domain::{
    ChannelId, ChannelSummary, MessageId, OrderKey, PubKey, RowId, REACTION_TAG,
};

const MESSAGE_COLUMNS: &str = "id, message_id, channel_id, parent_message_id, nickname, text, \
     type, status, timestamp_ms, round, pubkey, codeset_version, pinned, hidden";

#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

/// A message row as the network layer wrote it: ciphertext plus flags.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageRow {
    pub row_id: RowId,
    pub message_id: MessageId,
    pub channel_id: ChannelId,
    pub parent_message_id: Option<MessageId>,
    pub nickname: Option<String>,
    pub text: String,
    pub type_tag: i64,
    pub status_tag: i64,
    pub timestamp: DateTime<Utc>,
    pub round: u64,
    pub pubkey: PubKey,
    pub codeset: u8,
    pub pinned: bool,
    pub hidden: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMessageRow {
    pub message_id: MessageId,
    pub channel_id: ChannelId,
    pub parent_message_id: Option<MessageId>,
    pub nickname: Option<String>,
    pub text: String,
    pub type_tag: i64,
    pub status_tag: i64,
    pub timestamp: DateTime<Utc>,
    pub round: u64,
    pub pubkey: PubKey,
    pub codeset: u8,
    pub pinned: bool,
    pub hidden: bool,
}

/// Read side of the local row store consumed by the reconciliation engine.
#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn list_channels(&self) -> Result<Vec<ChannelSummary>>;
    async fn get_channel(&self, channel_id: &ChannelId) -> Result<Option<ChannelSummary>>;
    async fn get_message_row(&self, row_id: RowId) -> Result<Option<MessageRow>>;
    /// Visible non-reaction rows, newest first.
    async fn list_channel_page(
        &self,
        channel_id: &ChannelId,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<MessageRow>>;
    /// Visible non-reaction rows strictly after `after`, oldest first.
    async fn list_channel_since(
        &self,
        channel_id: &ChannelId,
        after: &OrderKey,
        limit: usize,
    ) -> Result<Vec<MessageRow>>;
    async fn list_reaction_rows(&self, channel_id: &ChannelId) -> Result<Vec<MessageRow>>;
    async fn list_pinned_rows(&self, channel_id: &ChannelId) -> Result<Vec<MessageRow>>;
    async fn list_rows_by_message_ids(
        &self,
        channel_id: &ChannelId,
        message_ids: &[MessageId],
    ) -> Result<Vec<MessageRow>>;
    async fn list_pubkey_codesets(
        &self,
        channel_id: &ChannelId,
        pubkeys: &[PubKey],
    ) -> Result<Vec<(PubKey, u8)>>;
}

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
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

    pub async fn upsert_channel(&self, channel: &ChannelSummary) -> Result<()> {
        sqlx::query(
            "INSERT INTO channels (id, name, description) VALUES (?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET name=excluded.name, description=excluded.description",
        )
        .bind(channel.channel_id.as_str())
        .bind(&channel.name)
        .bind(&channel.description)
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to upsert channel {}", channel.channel_id))?;
        Ok(())
    }

    pub async fn delete_channel(&self, channel_id: &ChannelId) -> Result<bool> {
        let result = sqlx::query("DELETE FROM channels WHERE id = ?")
            .bind(channel_id.as_str())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Inserts a row, or rewrites the existing row with the same
    /// `(channel_id, message_id)` in place. Returns the stable row id.
    pub async fn upsert_message_row(&self, row: &NewMessageRow) -> Result<RowId> {
        let round = i64::try_from(row.round).context("round does not fit in sqlite integer")?;
        let rec = sqlx::query(
            "INSERT INTO messages (message_id, channel_id, parent_message_id, nickname, text, type,
                                   status, timestamp_ms, round, pubkey, codeset_version, pinned, hidden)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(channel_id, message_id) DO UPDATE SET
                parent_message_id=excluded.parent_message_id,
                nickname=excluded.nickname,
                text=excluded.text,
                type=excluded.type,
                status=excluded.status,
                timestamp_ms=excluded.timestamp_ms,
                round=excluded.round,
                pubkey=excluded.pubkey,
                codeset_version=excluded.codeset_version,
                pinned=excluded.pinned,
                hidden=excluded.hidden
             RETURNING id",
        )
        .bind(row.message_id.as_str())
        .bind(row.channel_id.as_str())
        .bind(row.parent_message_id.as_ref().map(|id| id.as_str()))
        .bind(row.nickname.as_deref())
        .bind(&row.text)
        .bind(row.type_tag)
        .bind(row.status_tag)
        .bind(row.timestamp.timestamp_millis())
        .bind(round)
        .bind(row.pubkey.as_str())
        .bind(i64::from(row.codeset))
        .bind(row.pinned)
        .bind(row.hidden)
        .fetch_one(&self.pool)
        .await
        .with_context(|| format!("failed to upsert message {}", row.message_id))?;
        Ok(RowId(rec.get::<i64, _>(0)))
    }

    /// Flips the hidden flag for every row carrying `message_id`.
    pub async fn set_hidden(&self, message_id: &MessageId, hidden: bool) -> Result<Vec<RowId>> {
        let rows = sqlx::query("UPDATE messages SET hidden = ? WHERE message_id = ? RETURNING id")
            .bind(hidden)
            .bind(message_id.as_str())
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(|r| RowId(r.get::<i64, _>(0))).collect())
    }

    pub async fn set_pinned(
        &self,
        channel_id: &ChannelId,
        message_id: &MessageId,
        pinned: bool,
    ) -> Result<Option<RowId>> {
        let row = sqlx::query(
            "UPDATE messages SET pinned = ? WHERE channel_id = ? AND message_id = ? RETURNING id",
        )
        .bind(pinned)
        .bind(channel_id.as_str())
        .bind(message_id.as_str())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| RowId(r.get::<i64, _>(0))))
    }

    async fn fetch_rows(
        &self,
        sql: &str,
        channel_id: &ChannelId,
        context: &'static str,
    ) -> Result<Vec<MessageRow>> {
        let rows = sqlx::query(sql)
            .bind(channel_id.as_str())
            .fetch_all(&self.pool)
            .await
            .with_context(|| format!("{context} for channel {channel_id}"))?;
        rows.iter().map(message_row_from_sqlite).collect()
    }
}

#[async_trait]
impl MessageStore for Storage {
    async fn list_channels(&self) -> Result<Vec<ChannelSummary>> {
        let rows = sqlx::query("SELECT id, name, description FROM channels ORDER BY name ASC")
            .fetch_all(&self.pool)
            .await
            .context("failed to list channels")?;
        Ok(rows.iter().map(channel_from_sqlite).collect())
    }

    async fn get_channel(&self, channel_id: &ChannelId) -> Result<Option<ChannelSummary>> {
        let row = sqlx::query("SELECT id, name, description FROM channels WHERE id = ?")
            .bind(channel_id.as_str())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(channel_from_sqlite))
    }

    async fn get_message_row(&self, row_id: RowId) -> Result<Option<MessageRow>> {
        let row = sqlx::query(&format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?"))
            .bind(row_id.0)
            .fetch_optional(&self.pool)
            .await
            .with_context(|| format!("failed to load message row {}", row_id.0))?;
        row.as_ref().map(message_row_from_sqlite).transpose()
    }

    async fn list_channel_page(
        &self,
        channel_id: &ChannelId,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<MessageRow>> {
        let rows = sqlx::query(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages
             WHERE channel_id = ? AND hidden = 0 AND type != ?
             ORDER BY timestamp_ms DESC, round DESC, message_id DESC
             LIMIT ? OFFSET ?"
        ))
        .bind(channel_id.as_str())
        .bind(REACTION_TAG)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .bind(i64::try_from(offset).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await
        .with_context(|| format!("failed to page messages for channel {channel_id}"))?;
        rows.iter().map(message_row_from_sqlite).collect()
    }

    async fn list_channel_since(
        &self,
        channel_id: &ChannelId,
        after: &OrderKey,
        limit: usize,
    ) -> Result<Vec<MessageRow>> {
        let round = i64::try_from(after.round).unwrap_or(i64::MAX);
        let rows = sqlx::query(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages
             WHERE channel_id = ?1 AND hidden = 0 AND type != ?2
               AND (timestamp_ms > ?3
                    OR (timestamp_ms = ?3 AND round > ?4)
                    OR (timestamp_ms = ?3 AND round = ?4 AND message_id > ?5))
             ORDER BY timestamp_ms ASC, round ASC, message_id ASC
             LIMIT ?6"
        ))
        .bind(channel_id.as_str())
        .bind(REACTION_TAG)
        .bind(after.timestamp_ms)
        .bind(round)
        .bind(after.id.as_str())
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await
        .with_context(|| format!("failed to list newer messages for channel {channel_id}"))?;
        rows.iter().map(message_row_from_sqlite).collect()
    }

    async fn list_reaction_rows(&self, channel_id: &ChannelId) -> Result<Vec<MessageRow>> {
        self.fetch_rows(
            &format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages
                 WHERE channel_id = ? AND hidden = 0 AND type = {REACTION_TAG}
                   AND parent_message_id IS NOT NULL
                 ORDER BY timestamp_ms ASC, round ASC"
            ),
            channel_id,
            "failed to list reactions",
        )
        .await
    }

    async fn list_pinned_rows(&self, channel_id: &ChannelId) -> Result<Vec<MessageRow>> {
        self.fetch_rows(
            &format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages
                 WHERE channel_id = ? AND hidden = 0 AND pinned = 1
                 ORDER BY timestamp_ms ASC, round ASC"
            ),
            channel_id,
            "failed to list pinned messages",
        )
        .await
    }

    async fn list_rows_by_message_ids(
        &self,
        channel_id: &ChannelId,
        message_ids: &[MessageId],
    ) -> Result<Vec<MessageRow>> {
        if message_ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut builder = QueryBuilder::<Sqlite>::new(format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE hidden = 0 AND channel_id = "
        ));
        builder.push_bind(channel_id.0.clone());
        builder.push(" AND message_id IN (");
        let mut ids = builder.separated(", ");
        for message_id in message_ids {
            ids.push_bind(message_id.0.clone());
        }
        ids.push_unseparated(") ORDER BY timestamp_ms ASC, round ASC");

        let rows = builder
            .build()
            .fetch_all(&self.pool)
            .await
            .with_context(|| format!("failed to load messages by id for channel {channel_id}"))?;
        rows.iter().map(message_row_from_sqlite).collect()
    }

    async fn list_pubkey_codesets(
        &self,
        channel_id: &ChannelId,
        pubkeys: &[PubKey],
    ) -> Result<Vec<(PubKey, u8)>> {
        if pubkeys.is_empty() {
            return Ok(Vec::new());
        }
        let mut builder = QueryBuilder::<Sqlite>::new(
            "SELECT pubkey, MAX(codeset_version) FROM messages WHERE channel_id = ",
        );
        builder.push_bind(channel_id.0.clone());
        builder.push(" AND pubkey IN (");
        let mut keys = builder.separated(", ");
        for pubkey in pubkeys {
            keys.push_bind(pubkey.0.clone());
        }
        keys.push_unseparated(") GROUP BY pubkey ORDER BY pubkey ASC");

        let rows = builder.build().fetch_all(&self.pool).await?;
        Ok(rows
            .into_iter()
            .map(|r| {
                (
                    PubKey(r.get::<String, _>(0)),
                    u8::try_from(r.get::<i64, _>(1)).unwrap_or_default(),
                )
            })
            .collect())
    }
}

fn channel_from_sqlite(row: &SqliteRow) -> ChannelSummary {
    ChannelSummary {
        channel_id: ChannelId(row.get::<String, _>(0)),
        name: row.get::<String, _>(1),
        description: row.get::<String, _>(2),
    }
}

fn message_row_from_sqlite(row: &SqliteRow) -> Result<MessageRow> {
    let timestamp_ms = row.get::<i64, _>(8);
    let timestamp = Utc
        .timestamp_millis_opt(timestamp_ms)
        .single()
        .with_context(|| format!("invalid stored timestamp {timestamp_ms}"))?;
    Ok(MessageRow {
        row_id: RowId(row.get::<i64, _>(0)),
        message_id: MessageId(row.get::<String, _>(1)),
        channel_id: ChannelId(row.get::<String, _>(2)),
        parent_message_id: row.get::<Option<String>, _>(3).map(MessageId),
        nickname: row.get::<Option<String>, _>(4),
        text: row.get::<String, _>(5),
        type_tag: row.get::<i64, _>(6),
        status_tag: row.get::<i64, _>(7),
        timestamp,
        round: u64::try_from(row.get::<i64, _>(9)).unwrap_or_default(),
        pubkey: PubKey(row.get::<String, _>(10)),
        codeset: u8::try_from(row.get::<i64, _>(11)).unwrap_or_default(),
        pinned: row.get::<bool, _>(12),
        hidden: row.get::<bool, _>(13),
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
