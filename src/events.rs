use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Stable identifiers for domain events fanned out to webhooks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    SessionStatus,
    MessageReceived,
    MessageAck,
    MessageAny,
    MessageEdited,
    MessageRevoked,
    CallReceived,
    CallAccepted,
    CallRejected,
    LabelUpsert,
    LabelDeleted,
    LabelChatAdded,
    LabelChatRemoved,
    GroupUpdate,
    GroupJoin,
    GroupLeave,
    GroupParticipants,
    PresenceUpdate,
}

impl EventKind {
    /// Wire label used in the webhook envelope.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SessionStatus => "session.status",
            Self::MessageReceived => "message.received",
            Self::MessageAck => "message.ack",
            Self::MessageAny => "message.any",
            Self::MessageEdited => "message.edited",
            Self::MessageRevoked => "message.revoked",
            Self::CallReceived => "call.received",
            Self::CallAccepted => "call.accepted",
            Self::CallRejected => "call.rejected",
            Self::LabelUpsert => "label.upsert",
            Self::LabelDeleted => "label.deleted",
            Self::LabelChatAdded => "label.chat.added",
            Self::LabelChatRemoved => "label.chat.removed",
            Self::GroupUpdate => "group.v2.update",
            Self::GroupJoin => "group.v2.join",
            Self::GroupLeave => "group.v2.leave",
            Self::GroupParticipants => "group.v2.participants",
            Self::PresenceUpdate => "presence.update",
        }
    }
}

/// A domain event derived by the reconciliation pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayEvent {
    pub kind: EventKind,
    pub data: Value,
}

impl GatewayEvent {
    pub fn new(kind: EventKind, data: Value) -> Self {
        Self { kind, data }
    }
}
