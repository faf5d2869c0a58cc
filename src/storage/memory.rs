use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;

use super::{HalfVacantRoom, NewRoom, ParticipantRecord, RoomRecord, Storage};
use crate::chat::ChatMessage;
use crate::error::{CoordinatorError, Result};

#[derive(Debug, Clone)]
struct StoredRoom {
    history: Vec<ChatMessage>,
    condition: u32,
    meeting_id: Option<String>,
    meeting_host: Option<String>,
    meeting_expired: bool,
    is_full: bool,
    agent_state: Option<Value>,
    workspace_token: String,
}

#[derive(Debug, Clone)]
struct StoredParticipant {
    email: String,
    is_online: bool,
    join_url: Option<String>,
    registrant_id: Option<String>,
}

#[derive(Default)]
struct Inner {
    /// Insertion order doubles as creation order for `half_vacant_rooms`.
    room_order: Vec<String>,
    rooms: HashMap<String, StoredRoom>,
    users: HashMap<String, String>,
    participants: HashMap<String, Vec<StoredParticipant>>,
}

/// In-process implementation of the persistence boundary. The production
/// deployment swaps this for a relational backend behind the same trait.
#[derive(Default)]
pub struct InMemoryStorage {
    inner: Mutex<Inner>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Test hook: seed a room row directly, bypassing admission.
    pub async fn insert_room_record(&self, record: RoomRecord) {
        let mut inner = self.inner.lock().await;
        inner.room_order.push(record.room_id.clone());
        inner.rooms.insert(
            record.room_id.clone(),
            StoredRoom {
                history: record.history,
                condition: record.condition,
                meeting_id: record.meeting_id,
                meeting_host: record.meeting_host,
                meeting_expired: record.meeting_expired,
                is_full: record.is_full,
                agent_state: record.agent_state,
                workspace_token: record.workspace_token,
            },
        );
    }
}

#[async_trait]
impl Storage for InMemoryStorage {
    async fn load_room(&self, room_id: &str) -> Result<Option<RoomRecord>> {
        let inner = self.inner.lock().await;
        Ok(inner.rooms.get(room_id).map(|room| RoomRecord {
            room_id: room_id.to_string(),
            history: room.history.clone(),
            condition: room.condition,
            meeting_id: room.meeting_id.clone(),
            meeting_host: room.meeting_host.clone(),
            meeting_expired: room.meeting_expired,
            is_full: room.is_full,
            workspace_token: room.workspace_token.clone(),
            agent_state: room.agent_state.clone(),
        }))
    }

    async fn create_room(&self, room: NewRoom) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.rooms.contains_key(&room.room_id) {
            return Err(CoordinatorError::internal(format!(
                "room {} already exists",
                room.room_id
            )));
        }
        inner.room_order.push(room.room_id.clone());
        inner.rooms.insert(
            room.room_id.clone(),
            StoredRoom {
                history: Vec::new(),
                condition: room.condition,
                meeting_id: Some(room.meeting_id),
                meeting_host: Some(room.meeting_host),
                meeting_expired: false,
                is_full: false,
                agent_state: None,
                workspace_token: room.workspace_token,
            },
        );
        Ok(())
    }

    async fn save_history(&self, room_id: &str, history: &[ChatMessage]) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let room = inner
            .rooms
            .get_mut(room_id)
            .ok_or_else(|| CoordinatorError::persistence(format!("room {room_id} not found")))?;
        room.history = history.to_vec();
        Ok(())
    }

    async fn save_agent_state(&self, room_id: &str, state: Value) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let room = inner
            .rooms
            .get_mut(room_id)
            .ok_or_else(|| CoordinatorError::persistence(format!("room {room_id} not found")))?;
        room.agent_state = Some(state);
        Ok(())
    }

    async fn upsert_user(&self, email: &str, name: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.users.insert(email.to_string(), name.to_string());
        Ok(())
    }

    async fn get_user(&self, email: &str) -> Result<Option<String>> {
        let inner = self.inner.lock().await;
        Ok(inner.users.get(email).cloned())
    }

    async fn add_participant(
        &self,
        room_id: &str,
        email: &str,
        join_url: &str,
        registrant_id: &str,
    ) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner
            .participants
            .entry(room_id.to_string())
            .or_default()
            .push(StoredParticipant {
                email: email.to_string(),
                is_online: true,
                join_url: Some(join_url.to_string()),
                registrant_id: Some(registrant_id.to_string()),
            });
        Ok(())
    }

    async fn set_participant_online(
        &self,
        room_id: &str,
        email: &str,
        online: bool,
    ) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if let Some(rows) = inner.participants.get_mut(room_id) {
            for row in rows.iter_mut().filter(|r| r.email == email) {
                row.is_online = online;
            }
        }
        Ok(())
    }

    async fn set_all_offline(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        for rows in inner.participants.values_mut() {
            for row in rows.iter_mut() {
                row.is_online = false;
            }
        }
        Ok(())
    }

    async fn list_participants(&self, room_id: &str) -> Result<Vec<ParticipantRecord>> {
        let inner = self.inner.lock().await;
        let rows = inner.participants.get(room_id).cloned().unwrap_or_default();
        Ok(rows
            .into_iter()
            .map(|row| ParticipantRecord {
                name: inner.users.get(&row.email).cloned().unwrap_or_default(),
                email: row.email,
                is_online: row.is_online,
                join_url: row.join_url,
                registrant_id: row.registrant_id,
            })
            .collect())
    }

    async fn half_vacant_rooms(&self) -> Result<Vec<HalfVacantRoom>> {
        let inner = self.inner.lock().await;
        let mut result = Vec::new();
        for room_id in &inner.room_order {
            let Some(room) = inner.rooms.get(room_id) else {
                continue;
            };
            if room.meeting_expired {
                continue;
            }
            let (Some(meeting_id), Some(meeting_host)) = (&room.meeting_id, &room.meeting_host)
            else {
                continue;
            };
            let rows = inner.participants.get(room_id).cloned().unwrap_or_default();
            if rows.len() >= 2 {
                continue;
            }
            result.push(HalfVacantRoom {
                room_id: room_id.clone(),
                meeting_id: meeting_id.clone(),
                meeting_host: meeting_host.clone(),
                emails: rows.iter().map(|r| r.email.clone()).collect(),
                online_count: rows.iter().filter(|r| r.is_online).count(),
            });
        }
        Ok(result)
    }

    async fn room_count(&self) -> Result<usize> {
        let inner = self.inner.lock().await;
        Ok(inner.rooms.len())
    }

    async fn room_id_for_meeting(&self, meeting_id: &str) -> Result<Option<String>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .rooms
            .iter()
            .find(|(_, room)| room.meeting_id.as_deref() == Some(meeting_id))
            .map(|(id, _)| id.clone()))
    }

    async fn mark_room_full(&self, room_id: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if let Some(room) = inner.rooms.get_mut(room_id) {
            room.is_full = true;
        }
        Ok(())
    }

    async fn mark_meeting_expired(&self, room_id: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if let Some(room) = inner.rooms.get_mut(room_id) {
            room.meeting_expired = true;
        }
        Ok(())
    }

    async fn clear_meeting_links(&self, room_id: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if let Some(rows) = inner.participants.get_mut(room_id) {
            for row in rows.iter_mut() {
                row.join_url = None;
            }
        }
        Ok(())
    }
}
