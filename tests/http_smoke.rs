mod common;

use axum::{
    body::{Body, to_bytes},
    http::{Request, StatusCode, header},
};
use common::fakes::harness;
use serde_json::{Value, json};
use tower::ServiceExt;

use wagate::http::router;

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn health_reports_up() {
    let h = harness();
    let app = router(h.gateway);

    let response = app
        .oneshot(
            Request::builder()
                .uri("/health")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["success"], true);
    assert_eq!(body["data"]["status"], "up");
}

#[tokio::test]
async fn create_then_fetch_instance_round_trips() {
    let h = harness();
    let app = router(h.gateway);

    let created = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/instance")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(
                    json!({ "name": "main", "webhookUrl": "http://hooks.test/wh" }).to_string(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(created.status(), StatusCode::OK);
    let created = body_json(created).await;
    assert_eq!(created["success"], true);
    let id = created["data"]["id"].as_str().unwrap().to_owned();

    let fetched = app
        .oneshot(
            Request::builder()
                .uri(format!("/instance/{id}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(fetched.status(), StatusCode::OK);
    let fetched = body_json(fetched).await;
    assert_eq!(fetched["data"]["name"], "main");
    assert_eq!(fetched["data"]["webhookUrl"], "http://hooks.test/wh");
}

#[tokio::test]
async fn unknown_instance_is_404_with_error_envelope() {
    let h = harness();
    let app = router(h.gateway);

    let response = app
        .oneshot(
            Request::builder()
                .uri("/instance/ghost")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body = body_json(response).await;
    assert_eq!(body["success"], false);
    assert!(body["error"].is_string());
}

#[tokio::test]
async fn send_text_without_a_connection_is_409() {
    let h = harness();
    let app = router(h.gateway.clone());

    let instance = h.gateway.provision("main".into(), None, None).await.unwrap();

    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(format!("/instance/{}/send-text", instance.id))
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(json!({ "to": "222", "body": "hi" }).to_string()))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::CONFLICT);
}

#[tokio::test]
async fn soft_delete_deactivates_and_hides_the_instance() {
    let h = harness();
    let app = router(h.gateway.clone());

    let instance = h.gateway.provision("main".into(), None, None).await.unwrap();

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri(format!("/instance/{}", instance.id))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let listed = app
        .oneshot(
            Request::builder()
                .uri("/instance")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let listed = body_json(listed).await;
    assert_eq!(listed["data"].as_array().unwrap().len(), 0);
}
