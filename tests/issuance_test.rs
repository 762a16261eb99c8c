mod common;

use common::fakes::{ConnectOutcome, FakeSession, harness, settle};
use wagate::{error::GatewayError, transport::TransportEvent};

#[tokio::test(start_paused = true)]
async fn qr_code_is_returned_once_the_transport_issues_it() {
    let mut h = harness();
    let instance = h
        .gateway
        .provision("main".into(), None, None)
        .await
        .unwrap();
    let link = h.births.recv().await.unwrap();

    link.events
        .send(TransportEvent::QrCode { code: "QR-1".into() })
        .await
        .unwrap();
    settle().await;

    assert_eq!(h.gateway.get_qr(&instance.id).await.unwrap(), "QR-1");

    let snapshot = h.gateway.get_status(&instance.id).await.unwrap();
    assert_eq!(snapshot.status, "awaiting_qr");
    assert_eq!(snapshot.qr_code.as_deref(), Some("QR-1"));
}

#[tokio::test(start_paused = true)]
async fn qr_request_times_out_when_nothing_arrives() {
    let mut h = harness();
    let instance = h
        .gateway
        .provision("main".into(), None, None)
        .await
        .unwrap();
    let _link = h.births.recv().await.unwrap();
    settle().await;

    let error = h.gateway.get_qr(&instance.id).await.unwrap_err();
    assert!(matches!(error, GatewayError::Timeout(_)));
}

#[tokio::test(start_paused = true)]
async fn qr_request_on_a_connected_instance_forces_a_fresh_handshake() {
    let mut h = harness();
    let instance = h
        .gateway
        .provision("main".into(), None, None)
        .await
        .unwrap();
    let link = h.births.recv().await.unwrap();
    link.events
        .send(TransportEvent::Open {
            jid: "111@s.whatsapp.net".into(),
        })
        .await
        .unwrap();
    link.events
        .send(TransportEvent::CredsUpdate {
            blob: b"creds".to_vec(),
        })
        .await
        .unwrap();
    settle().await;

    let gateway = h.gateway.clone();
    let id = instance.id.clone();
    let qr_task = tokio::spawn(async move { gateway.get_qr(&id).await });

    // The live authenticated link is torn down and replaced.
    let relink = h.births.recv().await.unwrap();
    relink
        .events
        .send(TransportEvent::QrCode { code: "QR-9".into() })
        .await
        .unwrap();

    assert_eq!(qr_task.await.unwrap().unwrap(), "QR-9");
    assert!(
        wagate::store::Store::fetch_session_blob(h.store.as_ref(), &instance.id)
            .await
            .unwrap()
            .is_none()
    );
}

#[tokio::test(start_paused = true)]
async fn authentication_while_waiting_for_a_qr_fails_fast() {
    let mut h = harness();
    let instance = h
        .gateway
        .provision("main".into(), None, None)
        .await
        .unwrap();
    let link = h.births.recv().await.unwrap();
    link.events.send(TransportEvent::Connecting).await.unwrap();
    settle().await;

    let gateway = h.gateway.clone();
    let id = instance.id.clone();
    let qr_task = tokio::spawn(async move { gateway.get_qr(&id).await });

    // The handshake completes before any QR is issued.
    link.events
        .send(TransportEvent::Open {
            jid: "111@s.whatsapp.net".into(),
        })
        .await
        .unwrap();

    let error = qr_task.await.unwrap().unwrap_err();
    assert!(matches!(error, GatewayError::AlreadyConnected(_)));
}

#[tokio::test(start_paused = true)]
async fn unknown_instance_is_not_found() {
    let h = harness();
    let error = h.gateway.get_qr("ghost").await.unwrap_err();
    assert!(matches!(error, GatewayError::NotFound(_)));
}

#[tokio::test(start_paused = true)]
async fn pairing_code_retries_until_the_transport_is_ready() {
    let mut h = harness();
    let session = FakeSession::new();
    session.set_pairing_code("ABCD-1234");
    session.set_pairing_not_ready(2);
    h.connector.plan(ConnectOutcome::Accept(session));

    let instance = h
        .gateway
        .provision("main".into(), None, None)
        .await
        .unwrap();
    let _link = h.births.recv().await.unwrap();
    settle().await;

    let code = h
        .gateway
        .request_pairing_code(&instance.id, "+1 555 1234567")
        .await
        .unwrap();
    assert_eq!(code, "ABCD-1234");

    let snapshot = h.gateway.get_status(&instance.id).await.unwrap();
    assert_eq!(snapshot.status, "awaiting_pairing");
    assert_eq!(snapshot.pairing_code.as_deref(), Some("ABCD-1234"));
    assert!(snapshot.qr_code.is_none());
}

#[tokio::test(start_paused = true)]
async fn pairing_request_on_an_authenticated_session_is_a_conflict() {
    let mut h = harness();
    let session = FakeSession::new();
    session.set_jid("111@s.whatsapp.net");
    h.connector.plan(ConnectOutcome::Accept(session));

    let instance = h
        .gateway
        .provision("main".into(), None, None)
        .await
        .unwrap();
    let _link = h.births.recv().await.unwrap();
    settle().await;

    let error = h
        .gateway
        .request_pairing_code(&instance.id, "5551234567")
        .await
        .unwrap_err();
    assert!(matches!(error, GatewayError::AlreadyConnected(_)));
}

#[tokio::test(start_paused = true)]
async fn a_new_qr_invalidates_an_outstanding_pairing_code() {
    let mut h = harness();
    let session = FakeSession::new();
    session.set_pairing_code("ABCD-1234");
    h.connector.plan(ConnectOutcome::Accept(session));

    let instance = h
        .gateway
        .provision("main".into(), None, None)
        .await
        .unwrap();
    let link = h.births.recv().await.unwrap();
    settle().await;

    h.gateway
        .request_pairing_code(&instance.id, "5551234567")
        .await
        .unwrap();

    link.events
        .send(TransportEvent::QrCode { code: "QR-2".into() })
        .await
        .unwrap();
    settle().await;

    // Only one credential artifact may be live at a time.
    let snapshot = h.gateway.get_status(&instance.id).await.unwrap();
    assert_eq!(snapshot.qr_code.as_deref(), Some("QR-2"));
    assert!(snapshot.pairing_code.is_none());
}
