//! Boundary to the external messaging-transport library.
//!
//! The gateway never speaks the wire protocol itself. It hands stored
//! credentials to a [`TransportConnector`], receives a live
//! [`TransportSession`] plus a typed event stream, and reconciles those
//! events into the durable store.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::store::MessageKind;

/// Machine-readable reason attached to a `Closed` connection event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisconnectReason {
    /// Explicit logout by the account owner. Terminal.
    LoggedOut,
    /// Transient network loss.
    ConnectionLost,
    /// Server closed the stream without a specific cause.
    ConnectionClosed,
    /// Another client took over the session.
    ConnectionReplaced,
    /// Keepalive expired.
    TimedOut,
    /// Server asked for a reconnect.
    RestartRequired,
}

impl DisconnectReason {
    /// Terminal reasons halt reconnection and purge credentials.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::LoggedOut)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LoggedOut => "logged_out",
            Self::ConnectionLost => "connection_lost",
            Self::ConnectionClosed => "connection_closed",
            Self::ConnectionReplaced => "connection_replaced",
            Self::TimedOut => "timed_out",
            Self::RestartRequired => "restart_required",
        }
    }
}

/// A message observed on the wire, live or via history sync.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundMessage {
    pub message_id: String,
    pub chat_id: String,
    pub from_me: bool,
    pub sender: Option<String>,
    pub push_name: Option<String>,
    pub kind: MessageKind,
    pub body: String,
    pub timestamp: DateTime<Utc>,
}

/// Chat attributes carried by chat-set and history-sync events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatSnapshot {
    pub chat_id: String,
    pub name: Option<String>,
    pub archived: bool,
    pub unread_count: u32,
}

/// Call signaling payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallSignal {
    pub call_id: String,
    pub from: String,
    pub push_name: Option<String>,
    pub is_video: bool,
    pub is_group: bool,
    /// One of `offer`, `accept`, `reject`, `timeout`.
    pub status: String,
}

/// Label create/update/delete payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelEdit {
    pub label_id: String,
    pub name: String,
    pub color: Option<String>,
    pub deleted: bool,
}

/// Group metadata fetched out of band by group id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupMetadata {
    pub group_id: String,
    pub subject: String,
    pub participants: Vec<String>,
}

/// Events emitted by a live transport session, in emission order.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// Transport started a handshake.
    Connecting,
    /// A scannable login code was issued.
    QrCode { code: String },
    /// Session authenticated; `jid` identifies the account.
    Open { jid: String },
    /// Connection closed with a classified reason.
    Closed { reason: DisconnectReason },
    /// Credential snapshot changed; must overwrite the stored blob.
    CredsUpdate { blob: Vec<u8> },
    /// One or more messages arrived or were echoed back.
    MessagesUpsert { messages: Vec<InboundMessage> },
    /// Delivery ack for a known message. Codes 0..=4.
    MessageAck {
        message_id: String,
        chat_id: String,
        from_me: bool,
        participant: Option<String>,
        ack: u8,
    },
    /// Message body was edited in place.
    MessageEdit {
        message_id: String,
        chat_id: String,
        new_body: String,
    },
    /// Message was revoked/deleted for everyone.
    MessageRevoke {
        message_id: String,
        chat_id: String,
        from_me: bool,
    },
    /// Bulk chat snapshot.
    ChatsSet { chats: Vec<ChatSnapshot> },
    /// History sync chunk; `is_latest` marks the final chunk.
    HistorySync {
        chats: Vec<ChatSnapshot>,
        is_latest: bool,
    },
    /// Presence change for a chat participant.
    Presence { chat_id: String, presence: String },
    /// Call signaling.
    Call { call: CallSignal },
    /// Label created, renamed or deleted.
    LabelEdit { label: LabelEdit },
    /// Label attached to or detached from a chat.
    LabelAssociation {
        chat_id: String,
        label_id: String,
        added: bool,
    },
    /// Group settings changed.
    GroupUpdate {
        group_id: String,
        changes: serde_json::Value,
        author: Option<String>,
    },
    /// Group membership changed. Action is `add`, `remove`, `promote` or `demote`.
    GroupParticipants {
        group_id: String,
        action: String,
        participants: Vec<String>,
        author: Option<String>,
    },
}

/// Chat mutations accepted by a live session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatModify {
    MarkRead,
    Archive(bool),
    Clear,
    Delete,
}

/// Failures surfaced by the transport library.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportFault {
    #[error("transport session is not ready yet")]
    NotReady,
    #[error("transport session is closed")]
    Closed,
    #[error("no transport backend is available: {0}")]
    Unavailable(String),
    #[error("transport protocol error: {0}")]
    Protocol(String),
}

/// Command surface of one live connection.
#[async_trait]
pub trait TransportSession: Send + Sync {
    /// Returns the authenticated account jid, or `None` before login.
    fn authenticated_jid(&self) -> Option<String>;

    /// Sends a plain text message and returns the transport-assigned id.
    async fn send_text(&self, jid: &str, body: &str) -> Result<String, TransportFault>;

    /// Applies a chat mutation.
    async fn chat_modify(&self, jid: &str, op: ChatModify) -> Result<(), TransportFault>;

    /// Fetches group metadata by group id.
    async fn group_metadata(&self, group_id: &str) -> Result<GroupMetadata, TransportFault>;

    /// Requests a numeric pairing code bound to the given phone number.
    async fn request_pairing_code(&self, phone_number: &str) -> Result<String, TransportFault>;

    /// Logs the session out, revoking its credentials remotely.
    async fn logout(&self) -> Result<(), TransportFault>;
}

/// A freshly established connection: command handle plus event stream.
pub struct TransportLink {
    pub session: Arc<dyn TransportSession>,
    pub events: mpsc::Receiver<TransportEvent>,
}

/// Factory that turns stored credentials into a live connection.
#[async_trait]
pub trait TransportConnector: Send + Sync {
    /// Establishes a connection for `instance_id`. `credentials` is the
    /// persisted blob from a previous session, or `None` for a fresh
    /// handshake that will emit a QR code.
    async fn connect(
        &self,
        instance_id: &str,
        credentials: Option<Vec<u8>>,
    ) -> Result<TransportLink, TransportFault>;
}

/// Placeholder connector used when no wire backend is linked in.
#[derive(Default)]
pub struct NoopConnector;

#[async_trait]
impl TransportConnector for NoopConnector {
    async fn connect(
        &self,
        _instance_id: &str,
        _credentials: Option<Vec<u8>>,
    ) -> Result<TransportLink, TransportFault> {
        Err(TransportFault::Unavailable(
            "no transport backend configured".to_owned(),
        ))
    }
}
