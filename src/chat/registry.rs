use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, Mutex};
use warp::ws::Message;

use super::message::{ChatMessage, Section, ServerEvent, AGENT_SENDER, SYSTEM_SENDER};
use crate::agent::{Agent, AgentFactory, ChatEventKind, RoomSender};
use crate::error::{CoordinatorError, Result};
use crate::storage::Storage;

pub type ConnectionId = u64;

/// Resolved identity of a connection, bound after the async lookup completes.
#[derive(Debug, Clone)]
pub struct Identity {
    pub name: String,
    pub email: String,
}

/// One participant row as broadcast to clients and handed to the agent.
#[derive(Debug, Clone, Serialize)]
pub struct RosterEntry {
    pub name: String,
    pub email: String,
    pub is_online: bool,
}

/// Who authored an appended entry. Agent- and system-originated entries do
/// not trigger the agent's own history callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageOrigin {
    User,
    Agent,
    System,
}

struct RoomState {
    history: Vec<ChatMessage>,
    connections: HashMap<ConnectionId, mpsc::UnboundedSender<Message>>,
    identities: HashMap<ConnectionId, Identity>,
}

impl RoomState {
    /// Serializes once and fans out, skipping `exclude`. Sends to dead
    /// sockets are best-effort and ignored.
    fn broadcast(&self, event: &ServerEvent, exclude: Option<ConnectionId>) {
        let payload = match serde_json::to_string(event) {
            Ok(p) => p,
            Err(e) => {
                tracing::error!(error = %e, "Failed to serialize broadcast event");
                return;
            }
        };
        for (id, sender) in &self.connections {
            if Some(*id) == exclude {
                continue;
            }
            let _ = sender.send(Message::text(payload.clone()));
        }
    }

    /// Fail-loud path: the room is no longer trustworthy for writes, so
    /// every client is told to go away.
    fn close_all(&mut self, code: u16, reason: &str) {
        for sender in self.connections.values() {
            let _ = sender.send(Message::close_with(code, reason.to_string()));
        }
        self.connections.clear();
        self.identities.clear();
    }
}

/// One active room. `state` guards every compound read-modify-write so two
/// near-simultaneous events cannot interleave history mutations; operations
/// on different rooms proceed fully in parallel.
pub struct RoomHandle {
    pub room_id: String,
    pub meeting_id: Option<String>,
    /// Flips when lifecycle teardown reclaims the meeting while the room is
    /// still attached.
    meeting_expired: AtomicBool,
    /// Set exactly once, on whichever path empties the room first, so the
    /// agent's close callback cannot fire twice for one handle.
    evicted: AtomicBool,
    agent: Arc<dyn Agent>,
    state: Mutex<RoomState>,
}

impl RoomHandle {
    pub fn meeting_expired(&self) -> bool {
        self.meeting_expired.load(Ordering::SeqCst)
    }
}

/// Outcome of removing a connection from a room.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetachOutcome {
    /// Last connection left; the in-memory entry has been evicted.
    RoomEmpty,
    StillOccupied,
}

/// The authoritative map from room id to live room state. Rooms are
/// rehydrated from storage on first attach and evicted once empty; the
/// durable row outlives the in-memory entry.
pub struct RoomRegistry {
    rooms: Mutex<HashMap<String, Arc<RoomHandle>>>,
    storage: Arc<dyn Storage>,
    agent_factory: Arc<dyn AgentFactory>,
    next_connection_id: AtomicU64,
    /// Handed to `RoomSender`s so agents can reach back into the registry
    /// without keeping it alive.
    weak_self: Weak<RoomRegistry>,
}

impl RoomRegistry {
    pub fn new(storage: Arc<dyn Storage>, agent_factory: Arc<dyn AgentFactory>) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            rooms: Mutex::new(HashMap::new()),
            storage,
            agent_factory,
            next_connection_id: AtomicU64::new(1),
            weak_self: weak.clone(),
        })
    }

    pub fn next_connection_id(&self) -> ConnectionId {
        self.next_connection_id.fetch_add(1, Ordering::Relaxed)
    }

    pub async fn get(&self, room_id: &str) -> Option<Arc<RoomHandle>> {
        let rooms = self.rooms.lock().await;
        rooms.get(room_id).cloned()
    }

    /// Attaches a connection, rehydrating the room (and constructing its
    /// agent from saved state) if no in-memory entry exists. The registry
    /// map lock is held across the load so concurrent first-attaches for the
    /// same room cannot race to construct two agents.
    pub async fn attach(
        &self,
        room_id: &str,
        connection_id: ConnectionId,
        sender: mpsc::UnboundedSender<Message>,
    ) -> Result<Arc<RoomHandle>> {
        let handle = {
            let mut rooms = self.rooms.lock().await;
            match rooms.get(room_id) {
                Some(handle) => handle.clone(),
                None => {
                    let record = self
                        .storage
                        .load_room(room_id)
                        .await?
                        .ok_or_else(|| CoordinatorError::RoomNotFound(room_id.to_string()))?;

                    let room_sender =
                        RoomSender::new(self.weak_self.clone(), room_id.to_string());
                    let agent = self.agent_factory.create(
                        room_id,
                        record.condition,
                        &record.history,
                        room_sender,
                        record.agent_state,
                    );
                    let handle = Arc::new(RoomHandle {
                        room_id: room_id.to_string(),
                        meeting_id: record.meeting_id,
                        meeting_expired: AtomicBool::new(record.meeting_expired),
                        evicted: AtomicBool::new(false),
                        agent,
                        state: Mutex::new(RoomState {
                            history: record.history,
                            connections: HashMap::new(),
                            identities: HashMap::new(),
                        }),
                    });
                    rooms.insert(room_id.to_string(), handle.clone());
                    tracing::info!(room_id = %room_id, "Rehydrated room into registry");
                    handle
                }
            }
        };

        {
            let mut state = handle.state.lock().await;
            // The snapshot goes out before the connection can observe any
            // broadcast, so the client always starts from a consistent prefix.
            if let Ok(snapshot) = serde_json::to_string(&state.history) {
                let _ = sender.send(Message::text(snapshot));
            }
            state.connections.insert(connection_id, sender);
        }

        Ok(handle)
    }

    /// Binds the resolved identity of a connection.
    pub async fn bind_identity(
        &self,
        handle: &Arc<RoomHandle>,
        connection_id: ConnectionId,
        identity: Identity,
    ) {
        let mut state = handle.state.lock().await;
        state.identities.insert(connection_id, identity);
    }

    /// Removes a connection. On the last detach the room entry is evicted
    /// from the registry (not from durable storage) and the agent is told
    /// the room closed.
    pub async fn detach(
        &self,
        handle: &Arc<RoomHandle>,
        connection_id: ConnectionId,
    ) -> DetachOutcome {
        let empty = {
            let mut state = handle.state.lock().await;
            state.connections.remove(&connection_id);
            state.identities.remove(&connection_id);
            state.connections.is_empty()
        };

        if empty {
            let mut rooms = self.rooms.lock().await;
            rooms.remove(&handle.room_id);
            drop(rooms);
            if !handle.evicted.swap(true, Ordering::SeqCst) {
                tracing::info!(room_id = %handle.room_id, "Last connection left, evicting room");
                let agent = handle.agent.clone();
                tokio::spawn(async move {
                    agent.on_room_close().await;
                });
            }
            DetachOutcome::RoomEmpty
        } else {
            DetachOutcome::StillOccupied
        }
    }

    /// Re-queries the full participant roster, broadcasts it, and notifies
    /// the agent. Always the full roster: role and online status of *other*
    /// participants may have changed as well.
    pub async fn notify_participants_updated(&self, handle: &Arc<RoomHandle>) -> Result<()> {
        let roster: Vec<RosterEntry> = self
            .storage
            .list_participants(&handle.room_id)
            .await?
            .into_iter()
            .map(|p| RosterEntry {
                name: p.name,
                email: p.email,
                is_online: p.is_online,
            })
            .collect();

        {
            let state = handle.state.lock().await;
            state.broadcast(
                &ServerEvent::ParticipantsUpdated {
                    participants: roster.clone(),
                },
                None,
            );
        }

        let agent = handle.agent.clone();
        tokio::spawn(async move {
            agent.on_participants_updated(&roster).await;
        });
        Ok(())
    }

    /// Appends an entry, persists the full history, and broadcasts the
    /// finalized entry, all inside one critical section per room. A failed
    /// persist forcibly closes every connection in the room instead of
    /// silently dropping the update.
    pub async fn append_and_broadcast(
        &self,
        handle: &Arc<RoomHandle>,
        sender_label: &str,
        sections: Vec<Section>,
        origin: MessageOrigin,
    ) -> Result<ChatMessage> {
        let (message, history_snapshot) = {
            let mut state = handle.state.lock().await;
            let message = ChatMessage {
                message_id: state.history.len(),
                sender: sender_label.to_string(),
                timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
                content: sections,
            };
            state.history.push(message.clone());

            if let Err(e) = self
                .storage
                .save_history(&handle.room_id, &state.history)
                .await
            {
                tracing::error!(room_id = %handle.room_id, error = %e, "History save failed, disconnecting room");
                state.close_all(4000, "Chat room is not writable.");
                drop(state);
                self.evict(&handle.room_id).await;
                return Err(e);
            }

            state.broadcast(
                &ServerEvent::SendMessage {
                    message: message.clone(),
                },
                None,
            );
            (message, state.history.clone())
        };

        if origin == MessageOrigin::User {
            let agent = handle.agent.clone();
            tokio::spawn(async move {
                agent
                    .on_chat_history_updated(&history_snapshot, ChatEventKind::SendText, Value::Null)
                    .await;
            });
        }

        tracing::debug!(
            room_id = %handle.room_id,
            message_id = message.message_id,
            sender = %message.sender,
            "Appended chat entry"
        );
        Ok(message)
    }

    /// Resolves a multiple-choice prompt in place. Setting the same value
    /// again is a no-op success; any out-of-range index or conflicting
    /// re-resolution is a validation error that closes the caller's
    /// connection.
    pub async fn resolve_choice(
        &self,
        handle: &Arc<RoomHandle>,
        email: &str,
        message_id: usize,
        content_index: usize,
        choice_index: usize,
    ) -> Result<()> {
        let history_snapshot = {
            let mut state = handle.state.lock().await;

            let section = state
                .history
                .get_mut(message_id)
                .and_then(|entry| entry.content.get_mut(content_index));
            let Some(Section::Choices {
                value,
                choice_index: existing,
            }) = section
            else {
                return Err(CoordinatorError::validation(
                    "A combination of `message_id`, `content_index`, and `choice_index` is invalid.",
                ));
            };
            if choice_index >= value.len() {
                return Err(CoordinatorError::validation(
                    "A combination of `message_id`, `content_index`, and `choice_index` is invalid.",
                ));
            }
            match existing {
                Some(current) if *current == choice_index => return Ok(()),
                Some(_) => {
                    return Err(CoordinatorError::validation(
                        "This choice has already been resolved with a different value.",
                    ));
                }
                None => *existing = Some(choice_index),
            }

            if let Err(e) = self
                .storage
                .save_history(&handle.room_id, &state.history)
                .await
            {
                tracing::error!(room_id = %handle.room_id, error = %e, "History save failed, disconnecting room");
                state.close_all(4000, "Chat room is not writable.");
                drop(state);
                self.evict(&handle.room_id).await;
                return Err(e);
            }

            state.broadcast(
                &ServerEvent::MakeChoice {
                    sender: email.to_string(),
                    message_id,
                    content_index,
                    choice_index,
                },
                None,
            );
            state.history.clone()
        };

        let agent = handle.agent.clone();
        let email = email.to_string();
        tokio::spawn(async move {
            agent
                .on_user_makes_choice(message_id, content_index, choice_index, &email)
                .await;
            agent
                .on_chat_history_updated(
                    &history_snapshot,
                    ChatEventKind::MakeChoice,
                    serde_json::json!({
                        "message_id": message_id,
                        "content_index": content_index,
                        "choice_index": choice_index,
                        "sender": email,
                    }),
                )
                .await;
        });
        Ok(())
    }

    /// Typing indicators are relayed to the other connections in the room
    /// and never persisted.
    pub async fn relay_typing(
        &self,
        handle: &Arc<RoomHandle>,
        from: ConnectionId,
        sender_email: &str,
        typing: bool,
    ) {
        let event = if typing {
            ServerEvent::StartTyping {
                sender: sender_email.to_string(),
            }
        } else {
            ServerEvent::StopTyping {
                sender: sender_email.to_string(),
            }
        };
        let state = handle.state.lock().await;
        state.broadcast(&event, Some(from));
    }

    /// Agent-facing send: appends as "AI" without re-notifying the agent.
    pub(crate) async fn agent_send(&self, room_id: &str, sections: Vec<Section>) -> Result<usize> {
        let handle = self
            .get(room_id)
            .await
            .ok_or_else(|| CoordinatorError::RoomNotFound(room_id.to_string()))?;
        let message = self
            .append_and_broadcast(&handle, AGENT_SENDER, sections, MessageOrigin::Agent)
            .await?;
        Ok(message.message_id)
    }

    pub(crate) async fn agent_typing(&self, room_id: &str, typing: bool) -> Result<()> {
        let handle = self
            .get(room_id)
            .await
            .ok_or_else(|| CoordinatorError::RoomNotFound(room_id.to_string()))?;
        let event = if typing {
            ServerEvent::StartTyping {
                sender: AGENT_SENDER.to_string(),
            }
        } else {
            ServerEvent::StopTyping {
                sender: AGENT_SENDER.to_string(),
            }
        };
        let state = handle.state.lock().await;
        state.broadcast(&event, None);
        Ok(())
    }

    pub(crate) async fn save_agent_state(&self, room_id: &str, state: Value) -> Result<()> {
        self.storage.save_agent_state(room_id, state).await
    }

    /// Forwards grader results for a solved question to the room's agent.
    pub async fn question_passed(
        &self,
        room_id: &str,
        question_id: &str,
        title: &str,
        results: Value,
    ) -> Result<()> {
        let handle = self
            .get(room_id)
            .await
            .ok_or_else(|| CoordinatorError::RoomNotFound(room_id.to_string()))?;
        let agent = handle.agent.clone();
        let question_id = question_id.to_string();
        let title = title.to_string();
        tokio::spawn(async move {
            agent.on_question_passed(&question_id, &title, &results).await;
        });
        Ok(())
    }

    /// Called by lifecycle teardown: tells remaining connections and the
    /// room's agent, and appends a durable system notice that the backing
    /// meeting is gone.
    pub async fn meeting_closed(&self, room_id: &str, meeting_id: &str) {
        let Some(handle) = self.get(room_id).await else {
            return;
        };
        handle.meeting_expired.store(true, Ordering::SeqCst);
        {
            let state = handle.state.lock().await;
            state.broadcast(
                &ServerEvent::MeetingClosed {
                    meeting_id: meeting_id.to_string(),
                },
                None,
            );
        }
        let notice = Section::text(
            "The meeting for this room has automatically closed due to inactivity. \
             If this is unintentional, please start a new session from the home page.",
        );
        if let Err(e) = self
            .append_and_broadcast(&handle, SYSTEM_SENDER, vec![notice], MessageOrigin::System)
            .await
        {
            tracing::warn!(room_id = %room_id, error = %e, "Failed to record meeting-closed notice");
        }

        let agent = handle.agent.clone();
        let meeting_id = meeting_id.to_string();
        tokio::spawn(async move {
            agent.on_meeting_closed(&meeting_id).await;
        });
    }

    async fn evict(&self, room_id: &str) {
        let mut rooms = self.rooms.lock().await;
        rooms.remove(room_id);
    }
}
