//! REST surface over the gateway command layer.
//!
//! Thin handlers only: deserialize, call [`Gateway`], wrap in the
//! `{success, data}` envelope. All domain errors come back as
//! [`GatewayError`] and turn into their mapped status codes.

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::trace::TraceLayer;

use crate::{error::GatewayError, service::{Gateway, InstanceUpdate}};

#[derive(Debug, Serialize)]
struct Envelope<T: Serialize> {
    success: bool,
    data: T,
}

fn ok<T: Serialize>(data: T) -> Json<Envelope<T>> {
    Json(Envelope {
        success: true,
        data,
    })
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateInstanceRequest {
    name: String,
    phone_number: Option<String>,
    webhook_url: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PairingCodeRequest {
    phone_number: String,
}

#[derive(Debug, Deserialize)]
struct SendTextRequest {
    to: String,
    body: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MarkReadRequest {
    chat_id: String,
}

#[derive(Debug, Deserialize, Default)]
struct RemoveQuery {
    #[serde(default)]
    hard: bool,
}

pub fn router(gateway: Gateway) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/instance", post(create_instance).get(list_instances))
        .route(
            "/instance/:id",
            get(get_instance).put(update_instance).delete(remove_instance),
        )
        .route("/instance/:id/qr", get(get_qr))
        .route("/instance/:id/pairing-code", post(pairing_code))
        .route("/instance/:id/restart", post(restart))
        .route("/instance/:id/logout", post(logout))
        .route("/instance/:id/send-text", post(send_text))
        .route("/instance/:id/chats", get(list_chats))
        .route("/instance/:id/chats/read", post(mark_chat_read))
        .layer(TraceLayer::new_for_http())
        .with_state(gateway)
}

async fn health() -> Json<Envelope<serde_json::Value>> {
    ok(json!({ "status": "up" }))
}

async fn create_instance(
    State(gateway): State<Gateway>,
    Json(request): Json<CreateInstanceRequest>,
) -> Result<impl axum::response::IntoResponse, GatewayError> {
    let snapshot = gateway
        .provision(request.name, request.phone_number, request.webhook_url)
        .await?;
    Ok(ok(snapshot))
}

async fn list_instances(
    State(gateway): State<Gateway>,
) -> Result<impl axum::response::IntoResponse, GatewayError> {
    Ok(ok(gateway.list_instances().await?))
}

async fn get_instance(
    State(gateway): State<Gateway>,
    Path(id): Path<String>,
) -> Result<impl axum::response::IntoResponse, GatewayError> {
    Ok(ok(gateway.get_status(&id).await?))
}

async fn update_instance(
    State(gateway): State<Gateway>,
    Path(id): Path<String>,
    Json(update): Json<InstanceUpdate>,
) -> Result<impl axum::response::IntoResponse, GatewayError> {
    Ok(ok(gateway.update_instance(&id, update).await?))
}

async fn remove_instance(
    State(gateway): State<Gateway>,
    Path(id): Path<String>,
    Query(query): Query<RemoveQuery>,
) -> Result<impl axum::response::IntoResponse, GatewayError> {
    gateway.remove(&id, query.hard).await?;
    Ok(ok(json!({ "removed": id, "hard": query.hard })))
}

async fn get_qr(
    State(gateway): State<Gateway>,
    Path(id): Path<String>,
) -> Result<impl axum::response::IntoResponse, GatewayError> {
    let code = gateway.get_qr(&id).await?;
    Ok(ok(json!({ "qrCode": code })))
}

async fn pairing_code(
    State(gateway): State<Gateway>,
    Path(id): Path<String>,
    Json(request): Json<PairingCodeRequest>,
) -> Result<impl axum::response::IntoResponse, GatewayError> {
    let code = gateway
        .request_pairing_code(&id, &request.phone_number)
        .await?;
    Ok(ok(json!({ "pairingCode": code })))
}

async fn restart(
    State(gateway): State<Gateway>,
    Path(id): Path<String>,
) -> Result<impl axum::response::IntoResponse, GatewayError> {
    gateway.restart(&id).await?;
    Ok(ok(json!({ "restarting": id })))
}

async fn logout(
    State(gateway): State<Gateway>,
    Path(id): Path<String>,
) -> Result<impl axum::response::IntoResponse, GatewayError> {
    gateway.logout(&id).await?;
    Ok(ok(json!({ "loggedOut": id })))
}

async fn send_text(
    State(gateway): State<Gateway>,
    Path(id): Path<String>,
    Json(request): Json<SendTextRequest>,
) -> Result<impl axum::response::IntoResponse, GatewayError> {
    let message_id = gateway.send_text(&id, &request.to, &request.body).await?;
    Ok(ok(json!({ "messageId": message_id })))
}

async fn list_chats(
    State(gateway): State<Gateway>,
    Path(id): Path<String>,
) -> Result<impl axum::response::IntoResponse, GatewayError> {
    Ok(ok(gateway.list_chats(&id).await?))
}

async fn mark_chat_read(
    State(gateway): State<Gateway>,
    Path(id): Path<String>,
    Json(request): Json<MarkReadRequest>,
) -> Result<impl axum::response::IntoResponse, GatewayError> {
    gateway.mark_chat_read(&id, &request.chat_id).await?;
    Ok(ok(json!({ "chatId": request.chat_id, "read": true })))
}
