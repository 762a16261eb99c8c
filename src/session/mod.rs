pub mod runner;

use std::{sync::Arc, time::Duration};

use tokio::sync::{mpsc, oneshot};

use crate::{
    config::Config,
    error::GatewayError,
    pipeline::Reconciler,
    registry::{SessionHandle, SessionShared},
    store::Store,
    transport::TransportConnector,
    webhook::WebhookDispatcher,
};

/// Timing and retry knobs for one session task.
#[derive(Debug, Clone)]
pub struct SessionTunables {
    pub max_reconnect_attempts: u32,
    pub reconnect_interval: Duration,
    pub ready_timeout: Duration,
    pub pairing_ready_wait: Duration,
}

impl From<&Config> for SessionTunables {
    fn from(config: &Config) -> Self {
        Self {
            max_reconnect_attempts: config.max_reconnect_attempts,
            reconnect_interval: config.reconnect_interval,
            ready_timeout: config.ready_timeout,
            pairing_ready_wait: config.pairing_ready_wait,
        }
    }
}

/// Commands accepted by a session runner task.
pub enum SessionCommand {
    /// (Re)establishes the transport connection, tearing down any stale
    /// link first. `fresh` also discards the persisted credential blob so
    /// the transport performs a new handshake.
    Connect { fresh: bool },
    /// Requests a numeric pairing code bound to a phone number.
    RequestPairingCode {
        phone_number: String,
        reply: oneshot::Sender<Result<String, GatewayError>>,
    },
    /// Sends a text message through the live session.
    SendText {
        to: String,
        body: String,
        reply: oneshot::Sender<Result<String, GatewayError>>,
    },
    /// Marks a chat read on the transport and resets its unread counter.
    MarkChatRead {
        chat_id: String,
        reply: oneshot::Sender<Result<(), GatewayError>>,
    },
    /// Logs the session out and purges its credentials.
    Logout {
        reply: oneshot::Sender<Result<(), GatewayError>>,
    },
    /// Stops the runner task, logging out first if live. Acknowledged so
    /// callers can sequence durable writes after the task is gone.
    Shutdown { reply: oneshot::Sender<()> },
}

/// Everything a runner task needs, owned for the task's lifetime.
pub struct SessionContext {
    pub instance_id: String,
    pub shared: Arc<SessionShared>,
    pub store: Arc<dyn Store>,
    pub connector: Arc<dyn TransportConnector>,
    pub webhooks: WebhookDispatcher,
    pub reconciler: Reconciler,
    pub tunables: SessionTunables,
}

/// Starts a runner task for one instance and returns its handle.
pub fn spawn(
    instance_id: String,
    store: Arc<dyn Store>,
    connector: Arc<dyn TransportConnector>,
    webhooks: WebhookDispatcher,
    reconciler: Reconciler,
    tunables: SessionTunables,
) -> SessionHandle {
    let (tx, rx) = mpsc::channel(64);
    let shared = Arc::new(SessionShared::new());

    let ctx = SessionContext {
        instance_id,
        shared: shared.clone(),
        store,
        connector,
        webhooks,
        reconciler,
        tunables,
    };
    tokio::spawn(runner::run(ctx, rx));

    SessionHandle::new(tx, shared)
}
