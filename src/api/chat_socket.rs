use std::collections::HashMap;
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use warp::ws::{Message, WebSocket};

use super::AppContext;
use crate::chat::{
    ClientAction, ConnectionId, DetachOutcome, Identity, MessageOrigin, RoomHandle, Section,
    MAX_TEXT_LENGTH,
};
use crate::error::{CoordinatorError, Result};
use crate::lifecycle::TimerKind;

/// Connection gateway for a room's chat socket. Runs the per-connection
/// state machine: resolve the room from the query string, attach, resolve
/// identity, then relay actions until the socket closes.
pub async fn handle_chat_socket(
    websocket: WebSocket,
    query: HashMap<String, String>,
    ctx: Arc<AppContext>,
) {
    let (mut ws_sender, mut ws_receiver) = websocket.split();

    let Some(room_id) = query.get("room_id").cloned() else {
        let _ = ws_sender
            .send(Message::close_with(4000u16, "Missing room_id.".to_string()))
            .await;
        return;
    };
    // No email means a read-only visitor connection.
    let email = query.get("email").cloned().filter(|e| !e.is_empty());

    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    let sender_task = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            if let Err(e) = ws_sender.send(message).await {
                tracing::debug!(error = %e, "Failed to send chat frame");
                break;
            }
        }
    });

    let connection_id = ctx.registry.next_connection_id();
    let handle = match ctx.registry.attach(&room_id, connection_id, tx.clone()).await {
        Ok(handle) => handle,
        Err(e) => {
            tracing::warn!(room_id = %room_id, error = %e, "Chat attach rejected");
            let _ = tx.send(Message::close_with(e.close_code(), e.to_string()));
            drop(tx);
            let _ = sender_task.await;
            return;
        }
    };
    tracing::info!(room_id = %room_id, connection_id, "Chat connection attached");

    // Someone is back; the room is no longer idle.
    if let Some(meeting_id) = handle.meeting_id.as_deref() {
        ctx.lifecycle.cancel(TimerKind::IdleSession, meeting_id).await;
    }

    let identity = resolve_identity(&ctx, &handle, connection_id, email).await;

    let mut close_frame: Option<(u16, String)> = None;
    while let Some(result) = ws_receiver.next().await {
        let message = match result {
            Ok(message) => message,
            Err(e) => {
                tracing::debug!(room_id = %room_id, error = %e, "Chat socket error");
                break;
            }
        };
        if message.is_close() {
            break;
        }
        if message.is_ping() || message.is_pong() {
            continue;
        }
        if message.is_binary() {
            close_frame = Some((4000, "Binary frames are not supported.".to_string()));
            break;
        }
        let Ok(text) = message.to_str() else {
            continue;
        };
        if let Err(e) =
            dispatch_action(&ctx, &handle, connection_id, identity.as_ref(), text).await
        {
            tracing::warn!(room_id = %room_id, connection_id, error = %e, "Action rejected");
            close_frame = Some((e.close_code(), e.to_string()));
            break;
        }
    }

    if let Some((code, reason)) = close_frame {
        let _ = tx.send(Message::close_with(code, reason));
    }

    cleanup(&ctx, &handle, connection_id, identity).await;
    // Dropping the last sender lets the pump drain any close frame before
    // exiting.
    drop(tx);
    let _ = sender_task.await;
    tracing::info!(room_id = %room_id, connection_id, "Chat connection closed");
}

/// Looks up the display name for an authenticated connection and announces
/// the refreshed roster. Visitors stay anonymous and read-only.
async fn resolve_identity(
    ctx: &Arc<AppContext>,
    handle: &Arc<RoomHandle>,
    connection_id: ConnectionId,
    email: Option<String>,
) -> Option<Identity> {
    let email = email?;
    let name = match ctx.storage.get_user(&email).await {
        Ok(Some(name)) => name,
        Ok(None) => email.clone(),
        Err(e) => {
            tracing::warn!(email = %email, error = %e, "User lookup failed");
            email.clone()
        }
    };
    let identity = Identity {
        name,
        email: email.clone(),
    };
    ctx.registry
        .bind_identity(handle, connection_id, identity.clone())
        .await;

    if let Err(e) = ctx
        .storage
        .set_participant_online(&handle.room_id, &email, true)
        .await
    {
        tracing::warn!(room_id = %handle.room_id, error = %e, "Failed to mark participant online");
    }
    if let Err(e) = ctx.registry.notify_participants_updated(handle).await {
        tracing::warn!(room_id = %handle.room_id, error = %e, "Failed to broadcast roster");
    }
    Some(identity)
}

async fn dispatch_action(
    ctx: &Arc<AppContext>,
    handle: &Arc<RoomHandle>,
    connection_id: ConnectionId,
    identity: Option<&Identity>,
    text: &str,
) -> Result<()> {
    let action: ClientAction = serde_json::from_str(text)
        .map_err(|e| CoordinatorError::protocol(format!("unparseable action: {e}")))?;
    let Some(identity) = identity else {
        return Err(CoordinatorError::protocol(
            "Read-only connections cannot send actions.",
        ));
    };

    match action {
        ClientAction::StartTyping => {
            ctx.registry
                .relay_typing(handle, connection_id, &identity.email, true)
                .await;
            Ok(())
        }
        ClientAction::StopTyping => {
            ctx.registry
                .relay_typing(handle, connection_id, &identity.email, false)
                .await;
            Ok(())
        }
        ClientAction::SendText { content } => {
            if content.chars().count() > MAX_TEXT_LENGTH {
                return Err(CoordinatorError::validation(format!(
                    "Message exceeds the {MAX_TEXT_LENGTH} character limit."
                )));
            }
            ctx.registry
                .append_and_broadcast(
                    handle,
                    &identity.email,
                    vec![Section::text(content)],
                    MessageOrigin::User,
                )
                .await?;
            Ok(())
        }
        ClientAction::MakeChoice {
            message_id,
            content_index,
            choice_index,
        } => {
            ctx.registry
                .resolve_choice(handle, &identity.email, message_id, content_index, choice_index)
                .await
        }
    }
}

async fn cleanup(
    ctx: &Arc<AppContext>,
    handle: &Arc<RoomHandle>,
    connection_id: ConnectionId,
    identity: Option<Identity>,
) {
    let outcome = ctx.registry.detach(handle, connection_id).await;

    if let Some(identity) = &identity {
        if let Err(e) = ctx
            .storage
            .set_participant_online(&handle.room_id, &identity.email, false)
            .await
        {
            tracing::warn!(room_id = %handle.room_id, error = %e, "Failed to mark participant offline");
        }
    }

    match outcome {
        DetachOutcome::RoomEmpty => {
            // Only a meeting that is still live and has no one left inside
            // it counts as idle; people on the call keep the room alive even
            // with every chat socket closed.
            if let Some(meeting_id) = handle.meeting_id.as_deref() {
                if !handle.meeting_expired()
                    && ctx.attendance.attendee_count(meeting_id).await == 0
                {
                    ctx.lifecycle
                        .arm(
                            TimerKind::IdleSession,
                            meeting_id,
                            &handle.room_id,
                            ctx.timeouts.idle_session,
                        )
                        .await;
                }
            }
        }
        DetachOutcome::StillOccupied => {
            if identity.is_some() {
                if let Err(e) = ctx.registry.notify_participants_updated(handle).await {
                    tracing::warn!(room_id = %handle.room_id, error = %e, "Failed to broadcast roster");
                }
            }
        }
    }
}
