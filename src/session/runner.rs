//! Per-instance session task.
//!
//! Owns the live transport link and drives the connection state machine:
//! transport events move the instance through its lifecycle, recoverable
//! closes feed the bounded reconnection loop, and everything else is handed
//! to the reconciliation pipeline. The durable store is a mirror; in-memory
//! registry state stays authoritative even when persistence fails.

use std::{sync::Arc, time::Duration};

use serde_json::json;
use tokio::{sync::mpsc, time::Instant};

use crate::{
    error::GatewayError,
    events::{EventKind, GatewayEvent},
    session::{SessionCommand, SessionContext},
    store::InstanceStatus,
    transport::{ChatModify, DisconnectReason, TransportEvent, TransportFault, TransportSession},
};

pub(crate) struct Live {
    pub session: Arc<dyn TransportSession>,
    pub events: mpsc::Receiver<TransportEvent>,
}

enum Flow {
    Continue,
    Stop,
}

/// Main task loop for a single instance.
pub async fn run(ctx: SessionContext, mut commands: mpsc::Receiver<SessionCommand>) {
    let mut live: Option<Live> = None;
    let mut reconnect_attempts: u32 = 0;
    let mut pairing_flow = false;

    loop {
        if let Some(mut link) = live.take() {
            tokio::select! {
                maybe_command = commands.recv() => {
                    live = Some(link);
                    let Some(command) = maybe_command else {
                        break;
                    };
                    if let Flow::Stop = handle_command(
                        &ctx,
                        &mut live,
                        &mut reconnect_attempts,
                        &mut pairing_flow,
                        command,
                    )
                    .await
                    {
                        break;
                    }
                }
                maybe_event = link.events.recv() => {
                    // A dropped stream is a close without a reason node.
                    let event = maybe_event.unwrap_or(TransportEvent::Closed {
                        reason: DisconnectReason::ConnectionClosed,
                    });
                    match event {
                        TransportEvent::Closed { reason } => {
                            drop(link);
                            handle_close(&ctx, reason, &mut pairing_flow).await;
                            if reason.is_terminal() {
                                reconnect_attempts = 0;
                            } else {
                                loop {
                                    match try_reconnect(&ctx, &mut commands, &mut reconnect_attempts)
                                        .await
                                    {
                                        ReconnectOutcome::Connected(relink) => {
                                            live = Some(relink);
                                            break;
                                        }
                                        ReconnectOutcome::GaveUp => break,
                                        ReconnectOutcome::Stopped => return,
                                        ReconnectOutcome::Interrupted(command) => {
                                            if let Flow::Stop = handle_command(
                                                &ctx,
                                                &mut live,
                                                &mut reconnect_attempts,
                                                &mut pairing_flow,
                                                command,
                                            )
                                            .await
                                            {
                                                return;
                                            }
                                            if live.is_some() {
                                                break;
                                            }
                                            // A logout while backing off makes the
                                            // disconnect terminal; stop retrying.
                                            if matches!(
                                                ctx.shared.last_disconnect().await,
                                                Some(reason) if reason.is_terminal()
                                            ) {
                                                reconnect_attempts = 0;
                                                break;
                                            }
                                        }
                                    }
                                }
                            }
                        }
                        other => {
                            handle_event(&ctx, &link, other, &mut reconnect_attempts, &mut pairing_flow).await;
                            live = Some(link);
                        }
                    }
                }
            }
            continue;
        }

        let Some(command) = commands.recv().await else {
            break;
        };
        if let Flow::Stop = handle_command(
            &ctx,
            &mut live,
            &mut reconnect_attempts,
            &mut pairing_flow,
            command,
        )
        .await
        {
            break;
        }
    }
}

async fn handle_command(
    ctx: &SessionContext,
    live: &mut Option<Live>,
    reconnect_attempts: &mut u32,
    pairing_flow: &mut bool,
    command: SessionCommand,
) -> Flow {
    match command {
        SessionCommand::Connect { fresh } => {
            *pairing_flow = false;
            *reconnect_attempts = 0;
            // Stale links are dropped, not gracefully closed; the caller is
            // asking for this instance to start over.
            *live = None;
            if fresh {
                purge_credentials(ctx).await;
            }
            ctx.shared.clear_artifacts().await;
            *live = connect_once(ctx).await;
            Flow::Continue
        }
        SessionCommand::RequestPairingCode {
            phone_number,
            reply,
        } => {
            if live.is_none() {
                // Pairing always starts from a clean handshake.
                purge_credentials(ctx).await;
                ctx.shared.clear_artifacts().await;
                *live = connect_once(ctx).await;
            }
            *pairing_flow = true;
            let result = request_pairing_code(ctx, live, &phone_number).await;
            let _ = reply.send(result);
            Flow::Continue
        }
        SessionCommand::SendText { to, body, reply } => {
            let result = send_text(ctx, live, &to, &body).await;
            let _ = reply.send(result);
            Flow::Continue
        }
        SessionCommand::MarkChatRead { chat_id, reply } => {
            let result = mark_chat_read(ctx, live, &chat_id).await;
            let _ = reply.send(result);
            Flow::Continue
        }
        SessionCommand::Logout { reply } => {
            let result = logout(ctx, live).await;
            let _ = reply.send(result);
            Flow::Continue
        }
        SessionCommand::Shutdown { reply } => {
            if live.is_some() {
                let _ = logout(ctx, live).await;
            }
            let _ = reply.send(());
            Flow::Stop
        }
    }
}

async fn handle_event(
    ctx: &SessionContext,
    link: &Live,
    event: TransportEvent,
    reconnect_attempts: &mut u32,
    pairing_flow: &mut bool,
) {
    match event {
        TransportEvent::Connecting => {
            ctx.shared.set_status(InstanceStatus::Connecting).await;
            mirror_instance(ctx).await;
            emit_status(ctx, json!({ "status": "connecting" })).await;
        }
        TransportEvent::QrCode { code } => {
            let status = if *pairing_flow {
                InstanceStatus::AwaitingPairing
            } else {
                InstanceStatus::AwaitingQr
            };
            // Only one credential artifact may be alive at a time.
            ctx.shared.clear_artifacts().await;
            ctx.shared.set_qr_code(Some(code.clone())).await;
            ctx.shared.set_status(status).await;
            mirror_instance(ctx).await;
            tracing::info!(instance = %ctx.instance_id, "qr code issued");
            emit_status(
                ctx,
                json!({ "status": status.as_str(), "qrCode": code }),
            )
            .await;
        }
        TransportEvent::Open { jid } => {
            *reconnect_attempts = 0;
            *pairing_flow = false;
            let phone = phone_from_jid(&jid);
            ctx.shared.clear_artifacts().await;
            ctx.shared.set_phone_number(Some(phone.clone())).await;
            ctx.shared.set_status(InstanceStatus::Connected).await;
            ctx.shared.set_last_disconnect(None).await;
            mirror_instance(ctx).await;
            tracing::info!(instance = %ctx.instance_id, phone = %phone, "connection open");
            emit_status(
                ctx,
                json!({ "status": "connected", "phoneNumber": phone }),
            )
            .await;
            spawn_ready_gate(ctx);
        }
        TransportEvent::CredsUpdate { blob } => {
            if let Err(error) = ctx.store.upsert_session_blob(&ctx.instance_id, &blob).await {
                tracing::warn!(instance = %ctx.instance_id, error = %error, "credential snapshot not persisted");
            }
        }
        TransportEvent::HistorySync { chats, is_latest } => {
            ctx.reconciler.sync_chats(&ctx.instance_id, &chats).await;
            if is_latest && !ctx.shared.is_ready() {
                ctx.shared.mark_ready();
                tracing::info!(instance = %ctx.instance_id, "history fully synced, app state ready");
            }
        }
        other => {
            ctx.reconciler
                .apply(&ctx.instance_id, Some(&link.session), other)
                .await;
        }
    }
}

async fn handle_close(ctx: &SessionContext, reason: DisconnectReason, pairing_flow: &mut bool) {
    *pairing_flow = false;
    // Any close invalidates outstanding QR/pairing artifacts.
    ctx.shared.clear_artifacts().await;
    ctx.shared.set_status(InstanceStatus::Disconnected).await;
    ctx.shared.set_last_disconnect(Some(reason)).await;
    ctx.shared.reset_ready();
    mirror_instance(ctx).await;

    if reason.is_terminal() {
        tracing::info!(instance = %ctx.instance_id, "terminal disconnect, purging credentials");
        purge_credentials(ctx).await;
    } else {
        tracing::warn!(instance = %ctx.instance_id, reason = reason.as_str(), "connection closed");
    }

    emit_status(
        ctx,
        json!({ "status": "disconnected", "reason": reason.as_str() }),
    )
    .await;
}

enum ReconnectOutcome {
    Connected(Live),
    GaveUp,
    /// A command arrived during backoff; the caller handles it and decides
    /// whether to resume.
    Interrupted(SessionCommand),
    /// Command channel closed; the task must exit.
    Stopped,
}

/// Bounded reconnection loop. The counter is shared with the caller so
/// consecutive recoverable closes accumulate; only a successful `open`
/// or an explicit connect command resets it. The backoff sleep races the
/// command channel so callers are never stalled behind it.
async fn try_reconnect(
    ctx: &SessionContext,
    commands: &mut mpsc::Receiver<SessionCommand>,
    attempts: &mut u32,
) -> ReconnectOutcome {
    while *attempts < ctx.tunables.max_reconnect_attempts {
        tokio::select! {
            _ = tokio::time::sleep(ctx.tunables.reconnect_interval) => {}
            maybe_command = commands.recv() => {
                return match maybe_command {
                    Some(command) => ReconnectOutcome::Interrupted(command),
                    None => ReconnectOutcome::Stopped,
                };
            }
        }
        *attempts += 1;
        tracing::info!(
            instance = %ctx.instance_id,
            attempt = *attempts,
            max = ctx.tunables.max_reconnect_attempts,
            "reconnecting after backoff"
        );
        if let Some(live) = connect_once(ctx).await {
            return ReconnectOutcome::Connected(live);
        }
    }
    tracing::warn!(instance = %ctx.instance_id, "reconnect ceiling reached, staying disconnected");
    ReconnectOutcome::GaveUp
}

async fn connect_once(ctx: &SessionContext) -> Option<Live> {
    let credentials = match ctx.store.fetch_session_blob(&ctx.instance_id).await {
        Ok(blob) => blob,
        Err(error) => {
            tracing::warn!(instance = %ctx.instance_id, error = %error, "credential load failed, starting fresh");
            None
        }
    };

    match ctx.connector.connect(&ctx.instance_id, credentials).await {
        Ok(link) => Some(Live {
            session: link.session,
            events: link.events,
        }),
        Err(error) => {
            tracing::warn!(instance = %ctx.instance_id, error = %error, "transport connect failed");
            ctx.shared.set_status(InstanceStatus::Disconnected).await;
            mirror_instance(ctx).await;
            None
        }
    }
}

async fn request_pairing_code(
    ctx: &SessionContext,
    live: &Option<Live>,
    phone_number: &str,
) -> Result<String, GatewayError> {
    let Some(link) = live.as_ref() else {
        return Err(GatewayError::NotConnected(ctx.instance_id.clone()));
    };
    if link.session.authenticated_jid().is_some() {
        return Err(GatewayError::AlreadyConnected(ctx.instance_id.clone()));
    }

    let clean = phone_number.trim().trim_start_matches('+').to_owned();
    let deadline = Instant::now() + ctx.tunables.pairing_ready_wait;
    loop {
        match link.session.request_pairing_code(&clean).await {
            Ok(code) => {
                ctx.shared.clear_artifacts().await;
                ctx.shared.set_pairing_code(Some(code.clone())).await;
                ctx.shared.set_status(InstanceStatus::AwaitingPairing).await;
                mirror_instance(ctx).await;
                tracing::info!(instance = %ctx.instance_id, phone = %clean, "pairing code issued");
                emit_status(
                    ctx,
                    json!({ "status": "awaiting_pairing", "pairingCode": code }),
                )
                .await;
                return Ok(code);
            }
            Err(TransportFault::NotReady) if Instant::now() < deadline => {
                tokio::time::sleep(Duration::from_millis(250)).await;
            }
            Err(TransportFault::NotReady) => {
                return Err(GatewayError::Timeout(format!(
                    "pairing code for {}",
                    ctx.instance_id
                )));
            }
            Err(fault) => return Err(GatewayError::Transport(fault)),
        }
    }
}

async fn send_text(
    ctx: &SessionContext,
    live: &Option<Live>,
    to: &str,
    body: &str,
) -> Result<String, GatewayError> {
    let Some(link) = live.as_ref() else {
        return Err(not_connected(ctx).await);
    };
    if link.session.authenticated_jid().is_none() {
        return Err(not_connected(ctx).await);
    }

    let jid = if to.contains('@') {
        to.to_owned()
    } else {
        format!("{to}@s.whatsapp.net")
    };
    let message_id = link
        .session
        .send_text(&jid, body)
        .await
        .map_err(GatewayError::Transport)?;
    ctx.reconciler
        .record_outbound(&ctx.instance_id, &jid, &message_id, body)
        .await;
    Ok(message_id)
}

async fn mark_chat_read(
    ctx: &SessionContext,
    live: &Option<Live>,
    chat_id: &str,
) -> Result<(), GatewayError> {
    let Some(link) = live.as_ref() else {
        return Err(not_connected(ctx).await);
    };
    link.session
        .chat_modify(chat_id, ChatModify::MarkRead)
        .await
        .map_err(GatewayError::Transport)?;
    ctx.reconciler
        .reset_unread(&ctx.instance_id, chat_id)
        .await
        .map_err(GatewayError::Persistence)
}

async fn logout(ctx: &SessionContext, live: &mut Option<Live>) -> Result<(), GatewayError> {
    if let Some(link) = live.take() {
        if let Err(error) = link.session.logout().await {
            tracing::warn!(instance = %ctx.instance_id, error = %error, "transport logout failed");
        }
    }
    ctx.shared.clear_artifacts().await;
    ctx.shared.set_status(InstanceStatus::Disconnected).await;
    ctx.shared
        .set_last_disconnect(Some(DisconnectReason::LoggedOut))
        .await;
    ctx.shared.reset_ready();
    purge_credentials(ctx).await;
    mirror_instance(ctx).await;
    emit_status(
        ctx,
        json!({ "status": "disconnected", "reason": "logged_out" }),
    )
    .await;
    Ok(())
}

async fn not_connected(ctx: &SessionContext) -> GatewayError {
    match ctx.shared.last_disconnect().await {
        Some(reason) if reason.is_terminal() => {
            GatewayError::TerminalDisconnect(ctx.instance_id.clone())
        }
        _ => GatewayError::NotConnected(ctx.instance_id.clone()),
    }
}

async fn purge_credentials(ctx: &SessionContext) {
    if let Err(error) = ctx.store.delete_session_blob(&ctx.instance_id).await {
        tracing::warn!(instance = %ctx.instance_id, error = %error, "credential purge failed");
    }
}

/// Race between the history-sync-complete signal and a fixed deadline.
/// Whichever wins marks the instance ready; the deadline path logs a
/// warning because history-dependent features may be incomplete.
fn spawn_ready_gate(ctx: &SessionContext) {
    let shared = ctx.shared.clone();
    let instance = ctx.instance_id.clone();
    let deadline = ctx.tunables.ready_timeout;
    tokio::spawn(async move {
        if shared.is_ready() {
            return;
        }
        tokio::select! {
            _ = shared.ready_notified() => {}
            _ = tokio::time::sleep(deadline) => {
                if !shared.is_ready() {
                    shared.mark_ready();
                    tracing::warn!(instance = %instance, "history sync incomplete at deadline, marking app state ready");
                }
            }
        }
    });
}

/// Mirrors registry state into the durable store. Failures are logged and
/// swallowed; the registry stays authoritative for live behavior.
async fn mirror_instance(ctx: &SessionContext) {
    let mut record = match ctx.store.fetch_instance(&ctx.instance_id).await {
        Ok(Some(record)) => record,
        Ok(None) => return,
        Err(error) => {
            tracing::warn!(instance = %ctx.instance_id, error = %error, "instance fetch failed, durable mirror lagging");
            return;
        }
    };

    record.status = ctx.shared.status().await;
    record.qr_code = ctx.shared.qr_code().await;
    record.pairing_code = ctx.shared.pairing_code().await;
    if let Some(phone) = ctx.shared.phone_number().await {
        record.phone_number = Some(phone);
    }

    if let Err(error) = ctx.store.upsert_instance(&record).await {
        tracing::warn!(instance = %ctx.instance_id, error = %error, "status persist failed, durable mirror lagging");
    }
}

async fn emit_status(ctx: &SessionContext, data: serde_json::Value) {
    ctx.webhooks
        .emit(
            &ctx.instance_id,
            GatewayEvent::new(EventKind::SessionStatus, data),
        )
        .await;
}

fn phone_from_jid(jid: &str) -> String {
    let local = jid.split('@').next().unwrap_or(jid);
    local.split(':').next().unwrap_or(local).to_owned()
}
