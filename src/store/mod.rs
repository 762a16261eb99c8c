//! Durable store boundary.
//!
//! The gateway treats persistence as an external transactional resource:
//! every upsert is independently atomic and keyed by a natural key. The
//! in-memory implementation backs tests; `postgres` mirrors it with sqlx.

pub mod postgres;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;

pub use postgres::PgStore;

/// Persisted lifecycle status of an instance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    #[default]
    Uninitialized,
    Connecting,
    AwaitingQr,
    AwaitingPairing,
    Connected,
    Disconnected,
}

impl InstanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Uninitialized => "uninitialized",
            Self::Connecting => "connecting",
            Self::AwaitingQr => "awaiting_qr",
            Self::AwaitingPairing => "awaiting_pairing",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
        }
    }

    pub fn parse(raw: &str) -> Self {
        match raw {
            "connecting" => Self::Connecting,
            "awaiting_qr" => Self::AwaitingQr,
            "awaiting_pairing" => Self::AwaitingPairing,
            "connected" => Self::Connected,
            "disconnected" => Self::Disconnected,
            _ => Self::Uninitialized,
        }
    }
}

/// Message payload category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Text,
    Image,
    Video,
    Document,
    Audio,
    Sticker,
    Unknown,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Image => "image",
            Self::Video => "video",
            Self::Document => "document",
            Self::Audio => "audio",
            Self::Sticker => "sticker",
            Self::Unknown => "unknown",
        }
    }

    pub fn parse(raw: &str) -> Self {
        match raw {
            "text" => Self::Text,
            "image" => Self::Image,
            "video" => Self::Video,
            "document" => Self::Document,
            "audio" => Self::Audio,
            "sticker" => Self::Sticker,
            _ => Self::Unknown,
        }
    }
}

/// Delivery progression of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Pending,
    Sent,
    Delivered,
    Read,
    Played,
}

impl DeliveryStatus {
    /// Maps a transport ack code to a delivery status. Unknown codes keep
    /// the `sent` baseline, matching transport redelivery behavior.
    pub fn from_ack(ack: u8) -> Self {
        match ack {
            0 => Self::Pending,
            1 => Self::Sent,
            2 => Self::Delivered,
            3 => Self::Read,
            4 => Self::Played,
            _ => Self::Sent,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Sent => "sent",
            Self::Delivered => "delivered",
            Self::Read => "read",
            Self::Played => "played",
        }
    }

    pub fn parse(raw: &str) -> Self {
        match raw {
            "pending" => Self::Pending,
            "delivered" => Self::Delivered,
            "read" => Self::Read,
            "played" => Self::Played,
            _ => Self::Sent,
        }
    }
}

/// Durable instance row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceRecord {
    pub id: String,
    pub name: String,
    pub phone_number: Option<String>,
    pub status: InstanceStatus,
    pub qr_code: Option<String>,
    pub pairing_code: Option<String>,
    pub webhook_url: Option<String>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl InstanceRecord {
    pub fn new(id: String, name: String, phone_number: Option<String>, webhook_url: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            id,
            name,
            phone_number,
            status: InstanceStatus::Uninitialized,
            qr_code: None,
            pairing_code: None,
            webhook_url,
            is_active: true,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Durable chat row, keyed by (instance_id, chat_id).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRecord {
    pub instance_id: String,
    pub chat_id: String,
    pub name: String,
    pub is_group: bool,
    pub archived: bool,
    pub unread_count: u32,
    pub last_message: Option<String>,
    pub last_message_at: Option<DateTime<Utc>>,
}

/// Durable message row, keyed by the transport-assigned message id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageRecord {
    pub message_id: String,
    pub instance_id: String,
    pub chat_id: String,
    pub from_me: bool,
    pub sender: String,
    pub body: String,
    pub kind: MessageKind,
    pub status: DeliveryStatus,
    pub timestamp: DateTime<Utc>,
}

/// Errors surfaced by the durable store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store backend error: {0}")]
    Backend(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(error: sqlx::Error) -> Self {
        Self::Backend(error.to_string())
    }
}

/// Persistence contract used by the session runner and the pipeline.
#[async_trait]
pub trait Store: Send + Sync {
    async fn upsert_instance(&self, record: &InstanceRecord) -> Result<(), StoreError>;
    async fn fetch_instance(&self, id: &str) -> Result<Option<InstanceRecord>, StoreError>;
    /// Lists active instances only.
    async fn list_instances(&self) -> Result<Vec<InstanceRecord>, StoreError>;
    async fn delete_instance(&self, id: &str) -> Result<(), StoreError>;

    async fn upsert_chat(&self, chat: &ChatRecord) -> Result<(), StoreError>;
    async fn fetch_chat(&self, instance_id: &str, chat_id: &str) -> Result<Option<ChatRecord>, StoreError>;
    /// Chats for one instance, most recent message first.
    async fn list_chats(&self, instance_id: &str) -> Result<Vec<ChatRecord>, StoreError>;

    async fn upsert_message(&self, message: &MessageRecord) -> Result<(), StoreError>;
    async fn fetch_message(&self, message_id: &str) -> Result<Option<MessageRecord>, StoreError>;
    async fn delete_message(&self, message_id: &str) -> Result<(), StoreError>;

    async fn upsert_session_blob(&self, instance_id: &str, blob: &[u8]) -> Result<(), StoreError>;
    async fn fetch_session_blob(&self, instance_id: &str) -> Result<Option<Vec<u8>>, StoreError>;
    async fn delete_session_blob(&self, instance_id: &str) -> Result<(), StoreError>;
}

/// In-memory store used by tests and lightweight local runs.
#[derive(Clone, Default)]
pub struct InMemoryStore {
    instances: Arc<RwLock<HashMap<String, InstanceRecord>>>,
    chats: Arc<RwLock<HashMap<(String, String), ChatRecord>>>,
    messages: Arc<RwLock<HashMap<String, MessageRecord>>>,
    blobs: Arc<RwLock<HashMap<String, Vec<u8>>>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn upsert_instance(&self, record: &InstanceRecord) -> Result<(), StoreError> {
        let mut record = record.clone();
        record.updated_at = Utc::now();
        self.instances.write().await.insert(record.id.clone(), record);
        Ok(())
    }

    async fn fetch_instance(&self, id: &str) -> Result<Option<InstanceRecord>, StoreError> {
        Ok(self.instances.read().await.get(id).cloned())
    }

    async fn list_instances(&self) -> Result<Vec<InstanceRecord>, StoreError> {
        let mut records: Vec<_> = self
            .instances
            .read()
            .await
            .values()
            .filter(|record| record.is_active)
            .cloned()
            .collect();
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(records)
    }

    async fn delete_instance(&self, id: &str) -> Result<(), StoreError> {
        self.instances.write().await.remove(id);
        self.chats.write().await.retain(|(instance, _), _| instance != id);
        self.messages.write().await.retain(|_, message| message.instance_id != id);
        self.blobs.write().await.remove(id);
        Ok(())
    }

    async fn upsert_chat(&self, chat: &ChatRecord) -> Result<(), StoreError> {
        self.chats
            .write()
            .await
            .insert((chat.instance_id.clone(), chat.chat_id.clone()), chat.clone());
        Ok(())
    }

    async fn fetch_chat(&self, instance_id: &str, chat_id: &str) -> Result<Option<ChatRecord>, StoreError> {
        Ok(self
            .chats
            .read()
            .await
            .get(&(instance_id.to_owned(), chat_id.to_owned()))
            .cloned())
    }

    async fn list_chats(&self, instance_id: &str) -> Result<Vec<ChatRecord>, StoreError> {
        let mut chats: Vec<_> = self
            .chats
            .read()
            .await
            .values()
            .filter(|chat| chat.instance_id == instance_id)
            .cloned()
            .collect();
        chats.sort_by(|a, b| b.last_message_at.cmp(&a.last_message_at));
        Ok(chats)
    }

    async fn upsert_message(&self, message: &MessageRecord) -> Result<(), StoreError> {
        self.messages
            .write()
            .await
            .insert(message.message_id.clone(), message.clone());
        Ok(())
    }

    async fn fetch_message(&self, message_id: &str) -> Result<Option<MessageRecord>, StoreError> {
        Ok(self.messages.read().await.get(message_id).cloned())
    }

    async fn delete_message(&self, message_id: &str) -> Result<(), StoreError> {
        self.messages.write().await.remove(message_id);
        Ok(())
    }

    async fn upsert_session_blob(&self, instance_id: &str, blob: &[u8]) -> Result<(), StoreError> {
        self.blobs
            .write()
            .await
            .insert(instance_id.to_owned(), blob.to_vec());
        Ok(())
    }

    async fn fetch_session_blob(&self, instance_id: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.blobs.read().await.get(instance_id).cloned())
    }

    async fn delete_session_blob(&self, instance_id: &str) -> Result<(), StoreError> {
        self.blobs.write().await.remove(instance_id);
        Ok(())
    }
}
