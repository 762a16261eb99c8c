//! Gateway command surface.
//!
//! Everything the HTTP layer can do goes through [`Gateway`]: it owns the
//! registry, lazily spawns session tasks, and translates command replies
//! into API errors. Reads combine the durable row with live registry state
//! so callers always see the current lifecycle status.

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, oneshot};
use uuid::Uuid;

use crate::{
    error::GatewayError,
    pipeline::Reconciler,
    registry::{InstanceRegistry, SessionHandle},
    session::{self, SessionCommand, SessionTunables},
    store::{ChatRecord, InstanceRecord, InstanceStatus, Store},
    transport::TransportConnector,
    webhook::WebhookDispatcher,
};

/// Instance view returned by the API: durable row overlaid with live state.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceSnapshot {
    pub id: String,
    pub name: String,
    pub phone_number: Option<String>,
    pub status: &'static str,
    pub qr_code: Option<String>,
    pub pairing_code: Option<String>,
    pub webhook_url: Option<String>,
    pub is_active: bool,
    pub app_state_ready: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Mutable instance fields accepted by the update operation.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceUpdate {
    pub name: Option<String>,
    pub webhook_url: Option<Option<String>>,
    pub is_active: Option<bool>,
}

/// Multi-tenant gateway over one transport connector.
#[derive(Clone)]
pub struct Gateway {
    store: Arc<dyn Store>,
    connector: Arc<dyn TransportConnector>,
    registry: InstanceRegistry,
    webhooks: WebhookDispatcher,
    reconciler: Reconciler,
    tunables: SessionTunables,
    qr_wait: Duration,
    spawn_lock: Arc<Mutex<()>>,
}

impl Gateway {
    pub fn new(
        store: Arc<dyn Store>,
        connector: Arc<dyn TransportConnector>,
        webhooks: WebhookDispatcher,
        reconciler: Reconciler,
        tunables: SessionTunables,
        qr_wait: Duration,
    ) -> Self {
        Self {
            store,
            connector,
            registry: InstanceRegistry::new(),
            webhooks,
            reconciler,
            tunables,
            qr_wait,
            spawn_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Creates a new instance row and starts its session task. The first
    /// connection attempt begins immediately in the background.
    pub async fn provision(
        &self,
        name: String,
        phone_number: Option<String>,
        webhook_url: Option<String>,
    ) -> Result<InstanceSnapshot, GatewayError> {
        let id = Uuid::new_v4().to_string();
        let record = InstanceRecord::new(id.clone(), name, phone_number, webhook_url);
        self.store.upsert_instance(&record).await?;
        tracing::info!(instance = %id, name = %record.name, "instance provisioned");

        let handle = self.ensure_session(&id).await?;
        handle.send(SessionCommand::Connect { fresh: false }).await?;
        self.snapshot(&id).await
    }

    /// Active instances, each overlaid with live registry state.
    pub async fn list_instances(&self) -> Result<Vec<InstanceSnapshot>, GatewayError> {
        let records = self.store.list_instances().await?;
        let mut snapshots = Vec::with_capacity(records.len());
        for record in records {
            snapshots.push(self.overlay(record).await);
        }
        Ok(snapshots)
    }

    pub async fn get_status(&self, id: &str) -> Result<InstanceSnapshot, GatewayError> {
        self.snapshot(id).await
    }

    pub async fn update_instance(
        &self,
        id: &str,
        update: InstanceUpdate,
    ) -> Result<InstanceSnapshot, GatewayError> {
        let mut record = self.fetch_record(id).await?;
        if let Some(name) = update.name {
            record.name = name;
        }
        if let Some(webhook_url) = update.webhook_url {
            record.webhook_url = webhook_url;
        }
        if let Some(is_active) = update.is_active {
            record.is_active = is_active;
        }
        self.store.upsert_instance(&record).await?;
        self.snapshot(id).await
    }

    /// Stops the session task and removes the instance. A soft remove keeps
    /// the row but deactivates it; a hard remove deletes all instance data.
    pub async fn remove(&self, id: &str, hard: bool) -> Result<(), GatewayError> {
        let mut record = self.fetch_record(id).await?;
        if let Some(handle) = self.registry.remove(id).await {
            let (reply, done) = oneshot::channel();
            // Wait for the runner to finish its last durable mirror before
            // touching the row, or a hard delete could be resurrected.
            if handle.send(SessionCommand::Shutdown { reply }).await.is_ok() {
                let _ = done.await;
            }
        }

        if hard {
            self.store.delete_instance(id).await?;
            tracing::info!(instance = %id, "instance deleted");
        } else {
            record.is_active = false;
            record.status = InstanceStatus::Disconnected;
            self.store.upsert_instance(&record).await?;
            tracing::info!(instance = %id, "instance deactivated");
        }
        Ok(())
    }

    /// Returns a scannable QR code. An idle or already-authenticated
    /// instance is torn down first, forcing a fresh handshake; a handshake
    /// already in flight is simply polled. Bounded by the configured wait
    /// window.
    pub async fn get_qr(&self, id: &str) -> Result<String, GatewayError> {
        let handle = self.ensure_session(id).await?;

        if let Some(code) = handle.shared.qr_code().await {
            return Ok(code);
        }

        let status = handle.shared.status().await;
        if matches!(
            status,
            InstanceStatus::Uninitialized
                | InstanceStatus::Disconnected
                | InstanceStatus::Connected
        ) {
            handle.send(SessionCommand::Connect { fresh: true }).await?;
        }

        // After forcing a fresh handshake the status can still read
        // `connected` until the runner processes the teardown; `connected`
        // only means "authenticated while waiting" once a non-connected
        // status has been observed.
        let mut saw_reset = status != InstanceStatus::Connected;
        let deadline = tokio::time::Instant::now() + self.qr_wait;
        while tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_secs(1)).await;
            if let Some(code) = handle.shared.qr_code().await {
                return Ok(code);
            }
            match handle.shared.status().await {
                InstanceStatus::Connected if saw_reset => {
                    return Err(GatewayError::AlreadyConnected(id.to_owned()));
                }
                InstanceStatus::Connected => {}
                _ => saw_reset = true,
            }
        }
        Err(GatewayError::Timeout(format!("qr code for {id}")))
    }

    /// Requests a numeric pairing code for phone-number login.
    pub async fn request_pairing_code(
        &self,
        id: &str,
        phone_number: &str,
    ) -> Result<String, GatewayError> {
        let handle = self.ensure_session(id).await?;
        let (reply, rx) = oneshot::channel();
        handle
            .send(SessionCommand::RequestPairingCode {
                phone_number: phone_number.to_owned(),
                reply,
            })
            .await?;
        rx.await.map_err(|_| GatewayError::ChannelClosed)?
    }

    /// Tears down any live link and reconnects with stored credentials.
    pub async fn restart(&self, id: &str) -> Result<(), GatewayError> {
        let handle = self.ensure_session(id).await?;
        handle.send(SessionCommand::Connect { fresh: false }).await
    }

    /// Logs the instance out and purges its credentials.
    pub async fn logout(&self, id: &str) -> Result<(), GatewayError> {
        let handle = self.ensure_session(id).await?;
        let (reply, rx) = oneshot::channel();
        handle.send(SessionCommand::Logout { reply }).await?;
        rx.await.map_err(|_| GatewayError::ChannelClosed)?
    }

    /// Sends a text message and returns the transport-assigned id.
    pub async fn send_text(
        &self,
        id: &str,
        to: &str,
        body: &str,
    ) -> Result<String, GatewayError> {
        let handle = self.ensure_session(id).await?;
        let (reply, rx) = oneshot::channel();
        handle
            .send(SessionCommand::SendText {
                to: to.to_owned(),
                body: body.to_owned(),
                reply,
            })
            .await?;
        rx.await.map_err(|_| GatewayError::ChannelClosed)?
    }

    pub async fn list_chats(&self, id: &str) -> Result<Vec<ChatRecord>, GatewayError> {
        self.fetch_record(id).await?;
        Ok(self.store.list_chats(id).await?)
    }

    /// Marks a chat read on the transport and resets its unread counter.
    pub async fn mark_chat_read(&self, id: &str, chat_id: &str) -> Result<(), GatewayError> {
        let handle = self.ensure_session(id).await?;
        let (reply, rx) = oneshot::channel();
        handle
            .send(SessionCommand::MarkChatRead {
                chat_id: chat_id.to_owned(),
                reply,
            })
            .await?;
        rx.await.map_err(|_| GatewayError::ChannelClosed)?
    }

    /// Reconnects every active instance that has stored credentials. Run
    /// once at boot; instances without credentials wait for a QR request.
    pub async fn restore_all_sessions(&self) -> Result<usize, GatewayError> {
        let records = self.store.list_instances().await?;
        let mut restored = 0;
        for record in records {
            let has_credentials = match self.store.fetch_session_blob(&record.id).await {
                Ok(blob) => blob.is_some(),
                Err(error) => {
                    tracing::warn!(instance = %record.id, error = %error, "credential probe failed, skipping restore");
                    continue;
                }
            };
            if !has_credentials {
                continue;
            }
            let handle = self.ensure_session(&record.id).await?;
            handle.send(SessionCommand::Connect { fresh: false }).await?;
            restored += 1;
        }
        tracing::info!(count = restored, "restored sessions from stored credentials");
        Ok(restored)
    }

    /// Returns the live handle for `id`, spawning the session task if this
    /// is the first command since boot.
    async fn ensure_session(&self, id: &str) -> Result<SessionHandle, GatewayError> {
        if let Some(handle) = self.registry.get(id).await {
            return Ok(handle);
        }

        let _guard = self.spawn_lock.lock().await;
        if let Some(handle) = self.registry.get(id).await {
            return Ok(handle);
        }
        self.fetch_record(id).await?;

        let handle = session::spawn(
            id.to_owned(),
            self.store.clone(),
            self.connector.clone(),
            self.webhooks.clone(),
            self.reconciler.clone(),
            self.tunables.clone(),
        );
        self.registry.register(id, handle.clone()).await;
        Ok(handle)
    }

    async fn fetch_record(&self, id: &str) -> Result<InstanceRecord, GatewayError> {
        self.store
            .fetch_instance(id)
            .await?
            .ok_or_else(|| GatewayError::NotFound(id.to_owned()))
    }

    async fn snapshot(&self, id: &str) -> Result<InstanceSnapshot, GatewayError> {
        let record = self.fetch_record(id).await?;
        Ok(self.overlay(record).await)
    }

    /// Live registry state wins over the durable row when a handle exists.
    async fn overlay(&self, record: InstanceRecord) -> InstanceSnapshot {
        let live = self.registry.get(&record.id).await;
        match live {
            Some(handle) => {
                let status = handle.shared.status().await;
                InstanceSnapshot {
                    id: record.id,
                    name: record.name,
                    phone_number: handle
                        .shared
                        .phone_number()
                        .await
                        .or(record.phone_number),
                    status: status.as_str(),
                    qr_code: handle.shared.qr_code().await,
                    pairing_code: handle.shared.pairing_code().await,
                    webhook_url: record.webhook_url,
                    is_active: record.is_active,
                    app_state_ready: handle.shared.is_ready(),
                    created_at: record.created_at,
                    updated_at: record.updated_at,
                }
            }
            None => InstanceSnapshot {
                id: record.id,
                name: record.name,
                phone_number: record.phone_number,
                status: record.status.as_str(),
                qr_code: record.qr_code,
                pairing_code: record.pairing_code,
                webhook_url: record.webhook_url,
                is_active: record.is_active,
                app_state_ready: false,
                created_at: record.created_at,
                updated_at: record.updated_at,
            },
        }
    }
}
