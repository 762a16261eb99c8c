use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row, postgres::PgPoolOptions};

use super::{
    ChatRecord, DeliveryStatus, InstanceRecord, InstanceStatus, MessageKind, MessageRecord, Store,
    StoreError,
};

/// PostgreSQL-backed store. Each method is a single independently atomic
/// statement; upserts go through `ON CONFLICT` on the natural key.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(uri: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new().max_connections(10).connect(uri).await?;
        Ok(Self { pool })
    }

    /// Creates the schema if it does not exist yet.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        for statement in [
            "CREATE TABLE IF NOT EXISTS instances (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                phone_number TEXT,
                status TEXT NOT NULL,
                qr_code TEXT,
                pairing_code TEXT,
                webhook_url TEXT,
                is_active BOOLEAN NOT NULL DEFAULT TRUE,
                created_at TIMESTAMPTZ NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL
            )",
            "CREATE TABLE IF NOT EXISTS chats (
                instance_id TEXT NOT NULL,
                chat_id TEXT NOT NULL,
                name TEXT NOT NULL,
                is_group BOOLEAN NOT NULL,
                archived BOOLEAN NOT NULL,
                unread_count BIGINT NOT NULL,
                last_message TEXT,
                last_message_at TIMESTAMPTZ,
                PRIMARY KEY (instance_id, chat_id)
            )",
            "CREATE TABLE IF NOT EXISTS messages (
                message_id TEXT PRIMARY KEY,
                instance_id TEXT NOT NULL,
                chat_id TEXT NOT NULL,
                from_me BOOLEAN NOT NULL,
                sender TEXT NOT NULL,
                body TEXT NOT NULL,
                kind TEXT NOT NULL,
                status TEXT NOT NULL,
                timestamp TIMESTAMPTZ NOT NULL
            )",
            "CREATE TABLE IF NOT EXISTS sessions (
                instance_id TEXT PRIMARY KEY,
                blob BYTEA NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL
            )",
        ] {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }
}

fn instance_from_row(row: &sqlx::postgres::PgRow) -> Result<InstanceRecord, sqlx::Error> {
    Ok(InstanceRecord {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        phone_number: row.try_get("phone_number")?,
        status: InstanceStatus::parse(row.try_get::<String, _>("status")?.as_str()),
        qr_code: row.try_get("qr_code")?,
        pairing_code: row.try_get("pairing_code")?,
        webhook_url: row.try_get("webhook_url")?,
        is_active: row.try_get("is_active")?,
        created_at: row.try_get::<DateTime<Utc>, _>("created_at")?,
        updated_at: row.try_get::<DateTime<Utc>, _>("updated_at")?,
    })
}

fn chat_from_row(row: &sqlx::postgres::PgRow) -> Result<ChatRecord, sqlx::Error> {
    Ok(ChatRecord {
        instance_id: row.try_get("instance_id")?,
        chat_id: row.try_get("chat_id")?,
        name: row.try_get("name")?,
        is_group: row.try_get("is_group")?,
        archived: row.try_get("archived")?,
        unread_count: row.try_get::<i64, _>("unread_count")?.max(0) as u32,
        last_message: row.try_get("last_message")?,
        last_message_at: row.try_get::<Option<DateTime<Utc>>, _>("last_message_at")?,
    })
}

fn message_from_row(row: &sqlx::postgres::PgRow) -> Result<MessageRecord, sqlx::Error> {
    Ok(MessageRecord {
        message_id: row.try_get("message_id")?,
        instance_id: row.try_get("instance_id")?,
        chat_id: row.try_get("chat_id")?,
        from_me: row.try_get("from_me")?,
        sender: row.try_get("sender")?,
        body: row.try_get("body")?,
        kind: MessageKind::parse(row.try_get::<String, _>("kind")?.as_str()),
        status: DeliveryStatus::parse(row.try_get::<String, _>("status")?.as_str()),
        timestamp: row.try_get::<DateTime<Utc>, _>("timestamp")?,
    })
}

#[async_trait]
impl Store for PgStore {
    async fn upsert_instance(&self, record: &InstanceRecord) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO instances
                 (id, name, phone_number, status, qr_code, pairing_code, webhook_url, is_active, created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, NOW())
             ON CONFLICT (id) DO UPDATE SET
                 name = EXCLUDED.name,
                 phone_number = EXCLUDED.phone_number,
                 status = EXCLUDED.status,
                 qr_code = EXCLUDED.qr_code,
                 pairing_code = EXCLUDED.pairing_code,
                 webhook_url = EXCLUDED.webhook_url,
                 is_active = EXCLUDED.is_active,
                 updated_at = NOW()",
        )
        .bind(&record.id)
        .bind(&record.name)
        .bind(&record.phone_number)
        .bind(record.status.as_str())
        .bind(&record.qr_code)
        .bind(&record.pairing_code)
        .bind(&record.webhook_url)
        .bind(record.is_active)
        .bind(record.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn fetch_instance(&self, id: &str) -> Result<Option<InstanceRecord>, StoreError> {
        let row = sqlx::query("SELECT * FROM instances WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(instance_from_row).transpose().map_err(Into::into)
    }

    async fn list_instances(&self) -> Result<Vec<InstanceRecord>, StoreError> {
        let rows = sqlx::query("SELECT * FROM instances WHERE is_active ORDER BY created_at")
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(instance_from_row)
            .collect::<Result<Vec<_>, _>>()
            .map_err(Into::into)
    }

    async fn delete_instance(&self, id: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM messages WHERE instance_id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        sqlx::query("DELETE FROM chats WHERE instance_id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        sqlx::query("DELETE FROM sessions WHERE instance_id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        sqlx::query("DELETE FROM instances WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn upsert_chat(&self, chat: &ChatRecord) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO chats
                 (instance_id, chat_id, name, is_group, archived, unread_count, last_message, last_message_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
             ON CONFLICT (instance_id, chat_id) DO UPDATE SET
                 name = EXCLUDED.name,
                 archived = EXCLUDED.archived,
                 unread_count = EXCLUDED.unread_count,
                 last_message = EXCLUDED.last_message,
                 last_message_at = EXCLUDED.last_message_at",
        )
        .bind(&chat.instance_id)
        .bind(&chat.chat_id)
        .bind(&chat.name)
        .bind(chat.is_group)
        .bind(chat.archived)
        .bind(chat.unread_count as i64)
        .bind(&chat.last_message)
        .bind(chat.last_message_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn fetch_chat(&self, instance_id: &str, chat_id: &str) -> Result<Option<ChatRecord>, StoreError> {
        let row = sqlx::query("SELECT * FROM chats WHERE instance_id = $1 AND chat_id = $2")
            .bind(instance_id)
            .bind(chat_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(chat_from_row).transpose().map_err(Into::into)
    }

    async fn list_chats(&self, instance_id: &str) -> Result<Vec<ChatRecord>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM chats WHERE instance_id = $1 ORDER BY last_message_at DESC NULLS LAST",
        )
        .bind(instance_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(chat_from_row)
            .collect::<Result<Vec<_>, _>>()
            .map_err(Into::into)
    }

    async fn upsert_message(&self, message: &MessageRecord) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO messages
                 (message_id, instance_id, chat_id, from_me, sender, body, kind, status, timestamp)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
             ON CONFLICT (message_id) DO UPDATE SET
                 from_me = EXCLUDED.from_me,
                 sender = EXCLUDED.sender,
                 body = EXCLUDED.body,
                 kind = EXCLUDED.kind,
                 status = EXCLUDED.status,
                 timestamp = EXCLUDED.timestamp",
        )
        .bind(&message.message_id)
        .bind(&message.instance_id)
        .bind(&message.chat_id)
        .bind(message.from_me)
        .bind(&message.sender)
        .bind(&message.body)
        .bind(message.kind.as_str())
        .bind(message.status.as_str())
        .bind(message.timestamp)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn fetch_message(&self, message_id: &str) -> Result<Option<MessageRecord>, StoreError> {
        let row = sqlx::query("SELECT * FROM messages WHERE message_id = $1")
            .bind(message_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(message_from_row).transpose().map_err(Into::into)
    }

    async fn delete_message(&self, message_id: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM messages WHERE message_id = $1")
            .bind(message_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn upsert_session_blob(&self, instance_id: &str, blob: &[u8]) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO sessions (instance_id, blob, updated_at)
             VALUES ($1, $2, NOW())
             ON CONFLICT (instance_id) DO UPDATE SET
                 blob = EXCLUDED.blob,
                 updated_at = NOW()",
        )
        .bind(instance_id)
        .bind(blob)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn fetch_session_blob(&self, instance_id: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let row = sqlx::query("SELECT blob FROM sessions WHERE instance_id = $1")
            .bind(instance_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|row| row.try_get::<Vec<u8>, _>("blob"))
            .transpose()
            .map_err(Into::into)
    }

    async fn delete_session_blob(&self, instance_id: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM sessions WHERE instance_id = $1")
            .bind(instance_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
