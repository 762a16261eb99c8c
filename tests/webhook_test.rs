mod common;

use std::sync::{Arc, atomic::Ordering};

use common::fakes::{CapturingPoster, settle};
use serde_json::json;
use wagate::{
    events::{EventKind, GatewayEvent},
    store::{InMemoryStore, InstanceRecord, Store},
    webhook::WebhookDispatcher,
};

async fn dispatcher_with_url(
    url: Option<&str>,
) -> (WebhookDispatcher, Arc<CapturingPoster>) {
    let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
    let record = InstanceRecord::new(
        "inst-1".into(),
        "main".into(),
        None,
        url.map(ToOwned::to_owned),
    );
    store.upsert_instance(&record).await.unwrap();

    let poster = CapturingPoster::new();
    (WebhookDispatcher::new(store, poster.clone()), poster)
}

#[tokio::test]
async fn envelope_carries_event_instance_data_and_timestamp() {
    let (dispatcher, poster) = dispatcher_with_url(Some("http://hooks.test/wh")).await;

    dispatcher
        .emit(
            "inst-1",
            GatewayEvent::new(EventKind::MessageReceived, json!({ "body": "hi" })),
        )
        .await;
    settle().await;

    let posts = poster.posted();
    assert_eq!(posts.len(), 1);
    let (url, payload) = &posts[0];
    assert_eq!(url, "http://hooks.test/wh");
    assert_eq!(payload["event"], "message.received");
    assert_eq!(payload["instanceId"], "inst-1");
    assert_eq!(payload["data"]["body"], "hi");
    assert!(payload["timestamp"].is_string());
}

#[tokio::test]
async fn no_configured_url_means_no_delivery() {
    let (dispatcher, poster) = dispatcher_with_url(None).await;

    dispatcher
        .emit(
            "inst-1",
            GatewayEvent::new(EventKind::SessionStatus, json!({ "status": "connected" })),
        )
        .await;
    settle().await;

    assert!(poster.posted().is_empty());
}

#[tokio::test]
async fn unknown_instance_means_no_delivery() {
    let (dispatcher, poster) = dispatcher_with_url(Some("http://hooks.test/wh")).await;

    dispatcher
        .emit(
            "ghost",
            GatewayEvent::new(EventKind::SessionStatus, json!({ "status": "connected" })),
        )
        .await;
    settle().await;

    assert!(poster.posted().is_empty());
}

#[tokio::test]
async fn delivery_failure_never_reaches_the_caller() {
    let (dispatcher, poster) = dispatcher_with_url(Some("http://hooks.test/wh")).await;
    poster.fail.store(true, Ordering::SeqCst);

    dispatcher
        .emit(
            "inst-1",
            GatewayEvent::new(EventKind::MessageAck, json!({ "ack": 3 })),
        )
        .await;
    settle().await;

    // One attempt, swallowed; follow-up events still go out.
    poster.fail.store(false, Ordering::SeqCst);
    dispatcher
        .emit(
            "inst-1",
            GatewayEvent::new(EventKind::MessageAck, json!({ "ack": 4 })),
        )
        .await;
    settle().await;

    let posts = poster.posted();
    assert_eq!(posts.len(), 1);
    assert_eq!(posts[0].1["data"]["ack"], 4);
}
