//! In-memory registry of live session handles.
//!
//! Sole authority on "is this instance live right now". Handles are never
//! persisted; the durable store is only a historical mirror.

use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use tokio::sync::{Notify, RwLock, mpsc};

use crate::{
    error::GatewayError,
    session::SessionCommand,
    store::InstanceStatus,
    transport::DisconnectReason,
};

/// Live per-instance state shared between the runner task and callers.
#[derive(Default)]
pub struct SessionShared {
    status: RwLock<InstanceStatus>,
    qr_code: RwLock<Option<String>>,
    pairing_code: RwLock<Option<String>>,
    phone_number: RwLock<Option<String>>,
    last_disconnect: RwLock<Option<DisconnectReason>>,
    app_state_ready: AtomicBool,
    ready_notify: Notify,
}

impl SessionShared {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn status(&self) -> InstanceStatus {
        *self.status.read().await
    }

    pub async fn set_status(&self, status: InstanceStatus) {
        *self.status.write().await = status;
    }

    pub async fn qr_code(&self) -> Option<String> {
        self.qr_code.read().await.clone()
    }

    pub async fn set_qr_code(&self, code: Option<String>) {
        *self.qr_code.write().await = code;
    }

    pub async fn pairing_code(&self) -> Option<String> {
        self.pairing_code.read().await.clone()
    }

    pub async fn set_pairing_code(&self, code: Option<String>) {
        *self.pairing_code.write().await = code;
    }

    /// Clears both credential artifacts. Only one may ever be live, and
    /// every issuance or close path funnels through here.
    pub async fn clear_artifacts(&self) {
        *self.qr_code.write().await = None;
        *self.pairing_code.write().await = None;
    }

    pub async fn phone_number(&self) -> Option<String> {
        self.phone_number.read().await.clone()
    }

    pub async fn set_phone_number(&self, phone: Option<String>) {
        *self.phone_number.write().await = phone;
    }

    pub async fn last_disconnect(&self) -> Option<DisconnectReason> {
        *self.last_disconnect.read().await
    }

    pub async fn set_last_disconnect(&self, reason: Option<DisconnectReason>) {
        *self.last_disconnect.write().await = reason;
    }

    pub fn is_ready(&self) -> bool {
        self.app_state_ready.load(Ordering::Acquire)
    }

    /// Marks app state ready and wakes the readiness gate. Only waiters
    /// registered right now are woken; no permit is stored, so a gate for a
    /// later connection never consumes a wakeup meant for an earlier one.
    pub fn mark_ready(&self) {
        self.app_state_ready.store(true, Ordering::Release);
        self.ready_notify.notify_waiters();
    }

    pub fn reset_ready(&self) {
        self.app_state_ready.store(false, Ordering::Release);
    }

    pub async fn ready_notified(&self) {
        self.ready_notify.notified().await;
    }
}

/// Handle used by the command surface to talk to a running session task.
#[derive(Clone)]
pub struct SessionHandle {
    pub commands: mpsc::Sender<SessionCommand>,
    pub shared: Arc<SessionShared>,
}

impl SessionHandle {
    pub fn new(commands: mpsc::Sender<SessionCommand>, shared: Arc<SessionShared>) -> Self {
        Self { commands, shared }
    }

    pub async fn send(&self, command: SessionCommand) -> Result<(), GatewayError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| GatewayError::ChannelClosed)
    }
}

/// Map of instance id to live session handle.
#[derive(Clone, Default)]
pub struct InstanceRegistry {
    inner: Arc<RwLock<HashMap<String, SessionHandle>>>,
}

impl InstanceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, id: &str, handle: SessionHandle) {
        self.inner.write().await.insert(id.to_owned(), handle);
    }

    /// Absence is not an error; callers decide what it means.
    pub async fn get(&self, id: &str) -> Option<SessionHandle> {
        self.inner.read().await.get(id).cloned()
    }

    pub async fn remove(&self, id: &str) -> Option<SessionHandle> {
        self.inner.write().await.remove(id)
    }

    pub async fn count(&self) -> usize {
        self.inner.read().await.len()
    }
}
