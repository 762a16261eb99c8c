#![allow(dead_code)]

use std::{
    collections::VecDeque,
    sync::{
        Arc, Mutex, RwLock,
        atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use wagate::{
    pipeline::Reconciler,
    service::Gateway,
    session::SessionTunables,
    store::{InMemoryStore, Store},
    transport::{
        ChatModify, GroupMetadata, TransportConnector, TransportEvent, TransportFault,
        TransportLink, TransportSession,
    },
    webhook::{HttpPoster, WebhookDispatcher, WebhookError},
};

/// Scripted transport session. Tests drive its behavior through the
/// builder-ish setters and inspect the recorded calls afterwards.
pub struct FakeSession {
    jid: RwLock<Option<String>>,
    pairing_code: RwLock<Option<String>>,
    pairing_not_ready: AtomicU32,
    next_message: AtomicU64,
    metadata: RwLock<Option<GroupMetadata>>,
    pub sent: Mutex<Vec<(String, String)>>,
    pub chat_ops: Mutex<Vec<(String, ChatModify)>>,
    pub metadata_fetches: AtomicU32,
    pub logout_calls: AtomicU32,
}

impl Default for FakeSession {
    fn default() -> Self {
        Self {
            jid: RwLock::new(None),
            pairing_code: RwLock::new(None),
            pairing_not_ready: AtomicU32::new(0),
            next_message: AtomicU64::new(1),
            metadata: RwLock::new(None),
            sent: Mutex::new(Vec::new()),
            chat_ops: Mutex::new(Vec::new()),
            metadata_fetches: AtomicU32::new(0),
            logout_calls: AtomicU32::new(0),
        }
    }
}

impl FakeSession {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_jid(&self, jid: &str) {
        *self.jid.write().unwrap() = Some(jid.to_owned());
    }

    pub fn set_pairing_code(&self, code: &str) {
        *self.pairing_code.write().unwrap() = Some(code.to_owned());
    }

    /// Makes the next `count` pairing requests fail with `NotReady`.
    pub fn set_pairing_not_ready(&self, count: u32) {
        self.pairing_not_ready.store(count, Ordering::SeqCst);
    }

    pub fn set_group_metadata(&self, metadata: GroupMetadata) {
        *self.metadata.write().unwrap() = Some(metadata);
    }
}

#[async_trait]
impl TransportSession for FakeSession {
    fn authenticated_jid(&self) -> Option<String> {
        self.jid.read().unwrap().clone()
    }

    async fn send_text(&self, jid: &str, body: &str) -> Result<String, TransportFault> {
        let id = self.next_message.fetch_add(1, Ordering::SeqCst);
        self.sent
            .lock()
            .unwrap()
            .push((jid.to_owned(), body.to_owned()));
        Ok(format!("msg-{id}"))
    }

    async fn chat_modify(&self, jid: &str, op: ChatModify) -> Result<(), TransportFault> {
        self.chat_ops.lock().unwrap().push((jid.to_owned(), op));
        Ok(())
    }

    async fn group_metadata(&self, group_id: &str) -> Result<GroupMetadata, TransportFault> {
        self.metadata_fetches.fetch_add(1, Ordering::SeqCst);
        self.metadata
            .read()
            .unwrap()
            .clone()
            .ok_or_else(|| TransportFault::Protocol(format!("no metadata for {group_id}")))
    }

    async fn request_pairing_code(&self, _phone_number: &str) -> Result<String, TransportFault> {
        let pending = self.pairing_not_ready.load(Ordering::SeqCst);
        if pending > 0 {
            self.pairing_not_ready.store(pending - 1, Ordering::SeqCst);
            return Err(TransportFault::NotReady);
        }
        self.pairing_code
            .read()
            .unwrap()
            .clone()
            .ok_or_else(|| TransportFault::Protocol("pairing unsupported".to_owned()))
    }

    async fn logout(&self) -> Result<(), TransportFault> {
        self.logout_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Handed to the test each time the connector produces a link; lets the
/// test push transport events into the runner.
pub struct LinkControl {
    pub events: mpsc::Sender<TransportEvent>,
    pub session: Arc<FakeSession>,
}

pub enum ConnectOutcome {
    /// Connection attempt fails outright.
    Refuse,
    /// Connection succeeds with this scripted session.
    Accept(Arc<FakeSession>),
}

/// Connector that replays queued outcomes; an empty queue accepts with a
/// fresh default session.
pub struct FakeConnector {
    plans: Mutex<VecDeque<ConnectOutcome>>,
    births: mpsc::UnboundedSender<LinkControl>,
    pub connect_calls: AtomicU32,
    pub last_credentials: Mutex<Option<Option<Vec<u8>>>>,
}

impl FakeConnector {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<LinkControl>) {
        let (births, born) = mpsc::unbounded_channel();
        let connector = Arc::new(Self {
            plans: Mutex::new(VecDeque::new()),
            births,
            connect_calls: AtomicU32::new(0),
            last_credentials: Mutex::new(None),
        });
        (connector, born)
    }

    pub fn plan(&self, outcome: ConnectOutcome) {
        self.plans.lock().unwrap().push_back(outcome);
    }

    pub fn connects(&self) -> u32 {
        self.connect_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TransportConnector for FakeConnector {
    async fn connect(
        &self,
        _instance_id: &str,
        credentials: Option<Vec<u8>>,
    ) -> Result<TransportLink, TransportFault> {
        self.connect_calls.fetch_add(1, Ordering::SeqCst);
        *self.last_credentials.lock().unwrap() = Some(credentials);

        let outcome = self
            .plans
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| ConnectOutcome::Accept(FakeSession::new()));
        match outcome {
            ConnectOutcome::Refuse => {
                Err(TransportFault::Unavailable("scripted refusal".to_owned()))
            }
            ConnectOutcome::Accept(session) => {
                let (tx, rx) = mpsc::channel(64);
                let _ = self.births.send(LinkControl {
                    events: tx,
                    session: session.clone(),
                });
                Ok(TransportLink {
                    session,
                    events: rx,
                })
            }
        }
    }
}

/// Records every webhook delivery; can be flipped into failure mode.
#[derive(Default)]
pub struct CapturingPoster {
    pub posts: Mutex<Vec<(String, Value)>>,
    pub fail: AtomicBool,
}

impl CapturingPoster {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn posted(&self) -> Vec<(String, Value)> {
        self.posts.lock().unwrap().clone()
    }

    /// Events with the given label, in delivery order.
    pub fn events_named(&self, label: &str) -> Vec<Value> {
        self.posted()
            .into_iter()
            .filter(|(_, payload)| payload["event"] == label)
            .map(|(_, payload)| payload)
            .collect()
    }
}

#[async_trait]
impl HttpPoster for CapturingPoster {
    async fn post_json(&self, url: &str, payload: &Value) -> Result<(), WebhookError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(WebhookError::Post("scripted failure".to_owned()));
        }
        self.posts
            .lock()
            .unwrap()
            .push((url.to_owned(), payload.clone()));
        Ok(())
    }
}

/// Fully wired gateway over in-memory storage and scripted transport.
pub struct Harness {
    pub store: Arc<InMemoryStore>,
    pub gateway: Gateway,
    pub connector: Arc<FakeConnector>,
    pub births: mpsc::UnboundedReceiver<LinkControl>,
    pub poster: Arc<CapturingPoster>,
}

pub fn tunables() -> SessionTunables {
    SessionTunables {
        max_reconnect_attempts: 2,
        reconnect_interval: Duration::from_millis(50),
        ready_timeout: Duration::from_millis(200),
        pairing_ready_wait: Duration::from_millis(500),
    }
}

pub fn harness() -> Harness {
    let store = Arc::new(InMemoryStore::new());
    let dyn_store: Arc<dyn Store> = store.clone();
    let (connector, births) = FakeConnector::new();
    let poster = CapturingPoster::new();
    let webhooks = WebhookDispatcher::new(dyn_store.clone(), poster.clone());
    let reconciler = Reconciler::new(dyn_store.clone(), webhooks.clone());
    let gateway = Gateway::new(
        dyn_store,
        connector.clone(),
        webhooks,
        reconciler,
        tunables(),
        Duration::from_secs(3),
    );
    Harness {
        store,
        gateway,
        connector,
        births,
        poster,
    }
}

/// Lets queued runner work and detached webhook tasks settle.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(20)).await;
}
