use std::collections::HashMap;
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use serde_json::json;
use tokio::sync::mpsc;
use warp::ws::{Message, WebSocket};

use super::AppContext;
use crate::queue::{AdmitTask, QueueClient};

/// Admission websocket. The connection lives only as long as the wait: the
/// worker answers with a terminal `{room_id, ...}` frame and closes it.
pub async fn handle_queue_socket(
    websocket: WebSocket,
    query: HashMap<String, String>,
    ctx: Arc<AppContext>,
) {
    let (mut ws_sender, mut ws_receiver) = websocket.split();

    let (name, email) = match (query.get("name"), query.get("email")) {
        (Some(name), Some(email)) if !name.is_empty() && !email.is_empty() => {
            (name.clone(), email.clone())
        }
        _ => {
            let _ = ws_sender
                .send(Message::close_with(
                    4000u16,
                    "Missing name or email.".to_string(),
                ))
                .await;
            return;
        }
    };

    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    let sender_task = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            if ws_sender.send(message).await.is_err() {
                break;
            }
        }
    });

    let client = QueueClient::new(tx);
    let position = match ctx
        .queue
        .enqueue(AdmitTask {
            name,
            email: email.clone(),
            client: client.clone(),
        })
        .await
    {
        Ok(position) => position,
        Err(e) => {
            tracing::info!(email = %email, error = %e, "Queue entry rejected");
            client.close(e.close_code(), "This email is already in queue.");
            let _ = sender_task.await;
            return;
        }
    };
    tracing::info!(email = %email, position, "Queued for admission");
    client.send_json(&json!({ "order": position }));

    // Nothing meaningful arrives from the client while waiting; the read
    // loop only detects abandonment.
    while let Some(result) = ws_receiver.next().await {
        match result {
            Ok(message) if message.is_close() => break,
            Ok(_) => continue,
            Err(_) => break,
        }
    }
    client.mark_closed();
    sender_task.abort();
    tracing::debug!(email = %email, "Queue socket closed");
}
