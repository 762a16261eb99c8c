//! Event reconciliation pipeline.
//!
//! Translates transport events into durable upserts and webhook events.
//! Every write is an idempotent upsert keyed by a natural key, so transport
//! redelivery converges instead of duplicating. Persistence failures are
//! logged and skipped; the pipeline never stalls the connection.

use std::{sync::Arc, time::Duration};

use chrono::Utc;
use serde_json::json;

use crate::{
    events::{EventKind, GatewayEvent},
    store::{ChatRecord, DeliveryStatus, MessageRecord, Store, StoreError},
    transport::{
        ChatSnapshot, GroupMetadata, InboundMessage, TransportEvent, TransportSession,
    },
    webhook::WebhookDispatcher,
};

const GROUP_CACHE_CAPACITY: u64 = 1024;
const GROUP_CACHE_TTL: Duration = Duration::from_secs(300);

/// Reconciles transport events into the store and fans out webhooks.
#[derive(Clone)]
pub struct Reconciler {
    store: Arc<dyn Store>,
    webhooks: WebhookDispatcher,
    groups: moka::future::Cache<String, GroupMetadata>,
}

impl Reconciler {
    pub fn new(store: Arc<dyn Store>, webhooks: WebhookDispatcher) -> Self {
        let groups = moka::future::Cache::builder()
            .max_capacity(GROUP_CACHE_CAPACITY)
            .time_to_live(GROUP_CACHE_TTL)
            .build();
        Self {
            store,
            webhooks,
            groups,
        }
    }

    /// Applies one transport event. Connection lifecycle events are handled
    /// by the session runner; everything else lands here.
    pub async fn apply(
        &self,
        instance_id: &str,
        session: Option<&Arc<dyn TransportSession>>,
        event: TransportEvent,
    ) {
        match event {
            TransportEvent::MessagesUpsert { messages } => {
                for message in messages {
                    self.ingest_message(instance_id, &message).await;
                }
            }
            TransportEvent::MessageAck {
                message_id,
                chat_id,
                from_me,
                participant,
                ack,
            } => {
                self.apply_ack(instance_id, &message_id, &chat_id, from_me, participant, ack)
                    .await;
            }
            TransportEvent::MessageEdit {
                message_id,
                chat_id,
                new_body,
            } => {
                self.apply_edit(instance_id, &message_id, &chat_id, &new_body)
                    .await;
            }
            TransportEvent::MessageRevoke {
                message_id,
                chat_id,
                from_me,
            } => {
                self.apply_revoke(instance_id, &message_id, &chat_id, from_me)
                    .await;
            }
            TransportEvent::ChatsSet { chats } => {
                self.sync_chats(instance_id, &chats).await;
            }
            TransportEvent::Presence { chat_id, presence } => {
                self.emit(
                    instance_id,
                    EventKind::PresenceUpdate,
                    json!({ "chatId": chat_id, "presence": presence }),
                )
                .await;
            }
            TransportEvent::Call { call } => {
                let kind = match call.status.as_str() {
                    "accept" => EventKind::CallAccepted,
                    "reject" | "timeout" => EventKind::CallRejected,
                    _ => EventKind::CallReceived,
                };
                self.emit(
                    instance_id,
                    kind,
                    json!({
                        "callId": call.call_id,
                        "from": call.from,
                        "pushName": call.push_name,
                        "isVideo": call.is_video,
                        "isGroup": call.is_group,
                        "status": call.status,
                    }),
                )
                .await;
            }
            TransportEvent::LabelEdit { label } => {
                let kind = if label.deleted {
                    EventKind::LabelDeleted
                } else {
                    EventKind::LabelUpsert
                };
                self.emit(
                    instance_id,
                    kind,
                    json!({
                        "labelId": label.label_id,
                        "name": label.name,
                        "color": label.color,
                    }),
                )
                .await;
            }
            TransportEvent::LabelAssociation {
                chat_id,
                label_id,
                added,
            } => {
                let kind = if added {
                    EventKind::LabelChatAdded
                } else {
                    EventKind::LabelChatRemoved
                };
                self.emit(
                    instance_id,
                    kind,
                    json!({ "chatId": chat_id, "labelId": label_id }),
                )
                .await;
            }
            TransportEvent::GroupUpdate {
                group_id,
                changes,
                author,
            } => {
                let metadata = self.group_metadata(instance_id, session, &group_id).await;
                self.emit(
                    instance_id,
                    EventKind::GroupUpdate,
                    json!({
                        "groupId": group_id,
                        "changes": changes,
                        "author": author,
                        "subject": metadata.as_ref().map(|meta| meta.subject.clone()),
                    }),
                )
                .await;
            }
            TransportEvent::GroupParticipants {
                group_id,
                action,
                participants,
                author,
            } => {
                self.apply_group_participants(
                    instance_id,
                    session,
                    &group_id,
                    &action,
                    participants,
                    author,
                )
                .await;
            }
            // Lifecycle events are the runner's concern.
            TransportEvent::Connecting
            | TransportEvent::QrCode { .. }
            | TransportEvent::Open { .. }
            | TransportEvent::Closed { .. }
            | TransportEvent::CredsUpdate { .. }
            | TransportEvent::HistorySync { .. } => {}
        }
    }

    /// Ingests one wire message. Redelivery overwrites the stored row with
    /// the latest content, but unread counters and webhooks fire exactly
    /// once per message id.
    async fn ingest_message(&self, instance_id: &str, message: &InboundMessage) {
        if message.chat_id == "status@broadcast" {
            return;
        }
        let first_seen = match self.store.fetch_message(&message.message_id).await {
            Ok(existing) => existing.is_none(),
            Err(error) => {
                tracing::warn!(instance = %instance_id, error = %error, "message lookup failed, skipping");
                return;
            }
        };

        let status = if message.from_me {
            DeliveryStatus::Sent
        } else {
            DeliveryStatus::Delivered
        };
        let record = MessageRecord {
            message_id: message.message_id.clone(),
            instance_id: instance_id.to_owned(),
            chat_id: message.chat_id.clone(),
            from_me: message.from_me,
            sender: message
                .sender
                .clone()
                .unwrap_or_else(|| message.chat_id.clone()),
            body: message.body.clone(),
            kind: message.kind,
            status,
            timestamp: message.timestamp,
        };
        if let Err(error) = self.store.upsert_message(&record).await {
            tracing::warn!(instance = %instance_id, error = %error, "message persist failed");
            return;
        }
        if !first_seen {
            return;
        }

        self.touch_chat(instance_id, message).await;

        let data = json!({
            "messageId": record.message_id,
            "chatId": record.chat_id,
            "fromMe": record.from_me,
            "sender": record.sender,
            "pushName": message.push_name,
            "kind": record.kind.as_str(),
            "body": record.body,
            "timestamp": record.timestamp.to_rfc3339(),
        });
        if !record.from_me {
            self.emit(instance_id, EventKind::MessageReceived, data.clone())
                .await;
        }
        self.emit(instance_id, EventKind::MessageAny, data).await;
    }

    /// Creates or refreshes the chat row behind an ingested message.
    async fn touch_chat(&self, instance_id: &str, message: &InboundMessage) {
        let existing = match self.store.fetch_chat(instance_id, &message.chat_id).await {
            Ok(existing) => existing,
            Err(error) => {
                tracing::warn!(instance = %instance_id, error = %error, "chat lookup failed");
                return;
            }
        };

        let mut chat = existing.unwrap_or_else(|| ChatRecord {
            instance_id: instance_id.to_owned(),
            chat_id: message.chat_id.clone(),
            name: chat_display_name(&message.chat_id, message.push_name.as_deref()),
            is_group: is_group_chat(&message.chat_id),
            archived: false,
            unread_count: 0,
            last_message: None,
            last_message_at: None,
        });
        chat.last_message = Some(message.body.clone());
        chat.last_message_at = Some(message.timestamp);
        if !message.from_me {
            chat.unread_count += 1;
        }

        if let Err(error) = self.store.upsert_chat(&chat).await {
            tracing::warn!(instance = %instance_id, error = %error, "chat persist failed");
        }
    }

    /// Last-writer-wins ack application. Unknown message ids still produce
    /// the webhook event; acks can outrun the upsert that carries the body.
    async fn apply_ack(
        &self,
        instance_id: &str,
        message_id: &str,
        chat_id: &str,
        from_me: bool,
        participant: Option<String>,
        ack: u8,
    ) {
        let status = DeliveryStatus::from_ack(ack);
        match self.store.fetch_message(message_id).await {
            Ok(Some(mut record)) => {
                record.status = status;
                if let Err(error) = self.store.upsert_message(&record).await {
                    tracing::warn!(instance = %instance_id, error = %error, "ack persist failed");
                }
            }
            Ok(None) => {}
            Err(error) => {
                tracing::warn!(instance = %instance_id, error = %error, "ack lookup failed");
            }
        }

        self.emit(
            instance_id,
            EventKind::MessageAck,
            json!({
                "messageId": message_id,
                "chatId": chat_id,
                "fromMe": from_me,
                "participant": participant,
                "ack": ack,
                "status": status.as_str(),
            }),
        )
        .await;
    }

    /// Edits that do not change the body are transport echoes and are
    /// suppressed entirely.
    async fn apply_edit(&self, instance_id: &str, message_id: &str, chat_id: &str, new_body: &str) {
        let mut record = match self.store.fetch_message(message_id).await {
            Ok(Some(record)) => record,
            Ok(None) => return,
            Err(error) => {
                tracing::warn!(instance = %instance_id, error = %error, "edit lookup failed");
                return;
            }
        };
        if record.body == new_body {
            return;
        }

        let previous = std::mem::replace(&mut record.body, new_body.to_owned());
        if let Err(error) = self.store.upsert_message(&record).await {
            tracing::warn!(instance = %instance_id, error = %error, "edit persist failed");
            return;
        }

        self.emit(
            instance_id,
            EventKind::MessageEdited,
            json!({
                "messageId": message_id,
                "chatId": chat_id,
                "body": new_body,
                "previousBody": previous,
            }),
        )
        .await;
    }

    /// Fetches the original body before deleting so the event can carry it.
    async fn apply_revoke(&self, instance_id: &str, message_id: &str, chat_id: &str, from_me: bool) {
        let original = match self.store.fetch_message(message_id).await {
            Ok(original) => original,
            Err(error) => {
                tracing::warn!(instance = %instance_id, error = %error, "revoke lookup failed");
                None
            }
        };
        if let Err(error) = self.store.delete_message(message_id).await {
            tracing::warn!(instance = %instance_id, error = %error, "revoke delete failed");
        }

        self.emit(
            instance_id,
            EventKind::MessageRevoked,
            json!({
                "messageId": message_id,
                "chatId": chat_id,
                "fromMe": from_me,
                "originalBody": original.map(|record| record.body),
            }),
        )
        .await;
    }

    /// Merges a bulk chat snapshot. Unread counters only ever move up here;
    /// only an explicit mark-read resets them.
    pub async fn sync_chats(&self, instance_id: &str, chats: &[ChatSnapshot]) {
        for snapshot in chats {
            if snapshot.chat_id == "status@broadcast" {
                continue;
            }
            let existing = match self.store.fetch_chat(instance_id, &snapshot.chat_id).await {
                Ok(existing) => existing,
                Err(error) => {
                    tracing::warn!(instance = %instance_id, error = %error, "chat lookup failed");
                    continue;
                }
            };

            let merged = match existing {
                Some(mut chat) => {
                    if let Some(name) = &snapshot.name {
                        chat.name = name.clone();
                    }
                    chat.archived = snapshot.archived;
                    chat.unread_count = chat.unread_count.max(snapshot.unread_count);
                    chat
                }
                None => ChatRecord {
                    instance_id: instance_id.to_owned(),
                    chat_id: snapshot.chat_id.clone(),
                    name: chat_display_name(&snapshot.chat_id, snapshot.name.as_deref()),
                    is_group: is_group_chat(&snapshot.chat_id),
                    archived: snapshot.archived,
                    unread_count: snapshot.unread_count,
                    last_message: None,
                    last_message_at: None,
                },
            };
            if let Err(error) = self.store.upsert_chat(&merged).await {
                tracing::warn!(instance = %instance_id, error = %error, "chat persist failed");
            }
        }
    }

    /// Records a message the gateway itself sent.
    pub async fn record_outbound(&self, instance_id: &str, jid: &str, message_id: &str, body: &str) {
        let now = Utc::now();
        let record = MessageRecord {
            message_id: message_id.to_owned(),
            instance_id: instance_id.to_owned(),
            chat_id: jid.to_owned(),
            from_me: true,
            sender: "me".to_owned(),
            body: body.to_owned(),
            kind: crate::store::MessageKind::Text,
            status: DeliveryStatus::Sent,
            timestamp: now,
        };
        if let Err(error) = self.store.upsert_message(&record).await {
            tracing::warn!(instance = %instance_id, error = %error, "outbound persist failed");
        }

        let existing = match self.store.fetch_chat(instance_id, jid).await {
            Ok(existing) => existing,
            Err(error) => {
                tracing::warn!(instance = %instance_id, error = %error, "chat lookup failed");
                return;
            }
        };
        let mut chat = existing.unwrap_or_else(|| ChatRecord {
            instance_id: instance_id.to_owned(),
            chat_id: jid.to_owned(),
            name: chat_display_name(jid, None),
            is_group: is_group_chat(jid),
            archived: false,
            unread_count: 0,
            last_message: None,
            last_message_at: None,
        });
        chat.last_message = Some(body.to_owned());
        chat.last_message_at = Some(now);
        if let Err(error) = self.store.upsert_chat(&chat).await {
            tracing::warn!(instance = %instance_id, error = %error, "chat persist failed");
        }
    }

    /// Zeroes the unread counter after an explicit mark-read.
    pub async fn reset_unread(&self, instance_id: &str, chat_id: &str) -> Result<(), StoreError> {
        let Some(mut chat) = self.store.fetch_chat(instance_id, chat_id).await? else {
            return Ok(());
        };
        chat.unread_count = 0;
        self.store.upsert_chat(&chat).await
    }

    async fn apply_group_participants(
        &self,
        instance_id: &str,
        session: Option<&Arc<dyn TransportSession>>,
        group_id: &str,
        action: &str,
        participants: Vec<String>,
        author: Option<String>,
    ) {
        // Membership changes invalidate cached metadata.
        self.groups.invalidate(&group_cache_key(instance_id, group_id)).await;

        let own_jid = session.and_then(|session| session.authenticated_jid());
        let own_involved = own_jid
            .as_deref()
            .map(|jid| {
                let own = bare_jid(jid);
                participants.iter().any(|p| bare_jid(p) == own)
            })
            .unwrap_or(false);

        let kind = match (action, own_involved) {
            ("add", true) => EventKind::GroupJoin,
            ("remove", true) => EventKind::GroupLeave,
            _ => EventKind::GroupParticipants,
        };
        let metadata = self.group_metadata(instance_id, session, group_id).await;
        self.emit(
            instance_id,
            kind,
            json!({
                "groupId": group_id,
                "action": action,
                "participants": participants,
                "author": author,
                "subject": metadata.as_ref().map(|meta| meta.subject.clone()),
            }),
        )
        .await;
    }

    /// Group metadata, cached per (instance, group) with a short TTL so
    /// bursts of group events cost one transport round trip.
    async fn group_metadata(
        &self,
        instance_id: &str,
        session: Option<&Arc<dyn TransportSession>>,
        group_id: &str,
    ) -> Option<GroupMetadata> {
        let key = group_cache_key(instance_id, group_id);
        if let Some(cached) = self.groups.get(&key).await {
            return Some(cached);
        }
        let session = session?;
        match session.group_metadata(group_id).await {
            Ok(metadata) => {
                self.groups.insert(key, metadata.clone()).await;
                Some(metadata)
            }
            Err(error) => {
                tracing::warn!(instance = %instance_id, group = %group_id, error = %error, "group metadata fetch failed");
                None
            }
        }
    }

    async fn emit(&self, instance_id: &str, kind: EventKind, data: serde_json::Value) {
        self.webhooks
            .emit(instance_id, GatewayEvent::new(kind, data))
            .await;
    }
}

fn group_cache_key(instance_id: &str, group_id: &str) -> String {
    format!("{instance_id}/{group_id}")
}

fn is_group_chat(chat_id: &str) -> bool {
    chat_id.ends_with("@g.us")
}

/// Jid without the device suffix, for participant comparisons.
fn bare_jid(jid: &str) -> String {
    let local = jid.split('@').next().unwrap_or(jid);
    local.split(':').next().unwrap_or(local).to_owned()
}

fn chat_display_name(chat_id: &str, preferred: Option<&str>) -> String {
    match preferred {
        Some(name) if !name.is_empty() => name.to_owned(),
        _ => chat_id.split('@').next().unwrap_or(chat_id).to_owned(),
    }
}
