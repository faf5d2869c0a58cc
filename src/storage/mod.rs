use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::chat::ChatMessage;
use crate::error::Result;

pub mod memory;

pub use memory::InMemoryStorage;

/// Durable view of a room, rehydrated when a connection returns to a room
/// that has no in-memory entry.
#[derive(Debug, Clone)]
pub struct RoomRecord {
    pub room_id: String,
    pub history: Vec<ChatMessage>,
    /// Experimental-condition assignment carried by the room row.
    pub condition: u32,
    pub meeting_id: Option<String>,
    pub meeting_host: Option<String>,
    pub meeting_expired: bool,
    pub is_full: bool,
    pub workspace_token: String,
    pub agent_state: Option<Value>,
}

/// Row inserted when the admission queue creates a room.
#[derive(Debug, Clone)]
pub struct NewRoom {
    pub room_id: String,
    pub meeting_id: String,
    pub meeting_host: String,
    pub workspace_token: String,
    pub condition: u32,
    pub starter_code: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParticipantRecord {
    pub email: String,
    pub name: String,
    pub is_online: bool,
    pub join_url: Option<String>,
    pub registrant_id: Option<String>,
}

/// Projection used by the admission worker: a room that still has fewer than
/// two participant rows and a live meeting.
#[derive(Debug, Clone)]
pub struct HalfVacantRoom {
    pub room_id: String,
    pub meeting_id: String,
    pub meeting_host: String,
    pub emails: Vec<String>,
    pub online_count: usize,
}

/// Persistence boundary. The relational backend is an external collaborator;
/// the coordinator only depends on this contract. Any failed save during an
/// active broadcast forcibly disconnects the room's clients.
#[async_trait]
pub trait Storage: Send + Sync {
    async fn load_room(&self, room_id: &str) -> Result<Option<RoomRecord>>;

    async fn create_room(&self, room: NewRoom) -> Result<()>;

    /// Replace-whole semantics: the full history is written each time.
    async fn save_history(&self, room_id: &str, history: &[ChatMessage]) -> Result<()>;

    async fn save_agent_state(&self, room_id: &str, state: Value) -> Result<()>;

    async fn upsert_user(&self, email: &str, name: &str) -> Result<()>;

    async fn get_user(&self, email: &str) -> Result<Option<String>>;

    async fn add_participant(
        &self,
        room_id: &str,
        email: &str,
        join_url: &str,
        registrant_id: &str,
    ) -> Result<()>;

    async fn set_participant_online(&self, room_id: &str, email: &str, online: bool)
        -> Result<()>;

    /// Startup reset: nobody is online before the first connection arrives.
    async fn set_all_offline(&self) -> Result<()>;

    async fn list_participants(&self, room_id: &str) -> Result<Vec<ParticipantRecord>>;

    /// Rooms with fewer than two participants and a non-expired meeting,
    /// oldest first.
    async fn half_vacant_rooms(&self) -> Result<Vec<HalfVacantRoom>>;

    /// Total number of room rows ever created. Drives the round-robin
    /// condition assignment for new rooms.
    async fn room_count(&self) -> Result<usize>;

    async fn room_id_for_meeting(&self, meeting_id: &str) -> Result<Option<String>>;

    async fn mark_room_full(&self, room_id: &str) -> Result<()>;

    async fn mark_meeting_expired(&self, room_id: &str) -> Result<()>;

    /// Null out the stored meeting join links after a meeting is torn down.
    async fn clear_meeting_links(&self, room_id: &str) -> Result<()>;
}
