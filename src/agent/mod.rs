use std::sync::{Arc, Weak};

use async_trait::async_trait;
use serde_json::Value;

use crate::chat::registry::{RoomRegistry, RosterEntry};
use crate::chat::{ChatMessage, Section};
use crate::error::{CoordinatorError, Result};

/// Which inbound action produced a chat-history update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatEventKind {
    SendText,
    MakeChoice,
}

/// Callback contract between the coordinator and the mentoring agent bound
/// 1:1 with a room. The real agent lives outside this crate; the coordinator
/// only ever talks to it through this trait.
///
/// Callbacks run on spawned tasks so an agent that sleeps or calls external
/// APIs never holds up a room's critical section.
#[async_trait]
pub trait Agent: Send + Sync {
    /// The freshly-queried roster, not a delta: online/offline status of
    /// *other* participants may have changed too.
    async fn on_participants_updated(&self, roster: &[RosterEntry]);

    /// Not invoked for entries the agent itself sent.
    async fn on_chat_history_updated(
        &self,
        history: &[ChatMessage],
        kind: ChatEventKind,
        detail: Value,
    );

    async fn on_user_makes_choice(
        &self,
        message_id: usize,
        content_index: usize,
        choice_index: usize,
        email: &str,
    );

    async fn on_question_passed(&self, question_id: &str, title: &str, results: &Value);

    /// Called when a lifecycle timer tears down the room's backing meeting.
    /// The room itself stays usable; only the meeting is gone.
    async fn on_meeting_closed(&self, meeting_id: &str);

    /// Called when the last connection leaves and the in-memory room entry
    /// is about to be evicted.
    async fn on_room_close(&self);
}

/// Constructs the agent for a room at attach/creation time. `saved_state` is
/// the agent state persisted by a previous incarnation of the same room.
pub trait AgentFactory: Send + Sync {
    fn create(
        &self,
        room_id: &str,
        condition: u32,
        history: &[ChatMessage],
        sender: RoomSender,
        saved_state: Option<Value>,
    ) -> Arc<dyn Agent>;
}

/// The agent's path back into its room: appends go through the same
/// append/broadcast/persist critical section as user messages.
#[derive(Clone)]
pub struct RoomSender {
    registry: Weak<RoomRegistry>,
    room_id: String,
}

impl RoomSender {
    pub(crate) fn new(registry: Weak<RoomRegistry>, room_id: String) -> Self {
        Self { registry, room_id }
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    /// Appends an agent-authored entry and returns its message id.
    pub async fn send(&self, sections: Vec<Section>) -> Result<usize> {
        let registry = self
            .registry
            .upgrade()
            .ok_or_else(|| CoordinatorError::internal("registry dropped"))?;
        registry.agent_send(&self.room_id, sections).await
    }

    pub async fn send_typing_status(&self, typing: bool) -> Result<()> {
        let registry = self
            .registry
            .upgrade()
            .ok_or_else(|| CoordinatorError::internal("registry dropped"))?;
        registry.agent_typing(&self.room_id, typing).await
    }

    /// Persists the agent's serialized state; it is handed back to the
    /// factory when the room is next rehydrated.
    pub async fn save_state(&self, state: Value) -> Result<()> {
        let registry = self
            .registry
            .upgrade()
            .ok_or_else(|| CoordinatorError::internal("registry dropped"))?;
        registry.save_agent_state(&self.room_id, state).await
    }
}

/// Agent that ignores every event. Used when the coordinator runs without a
/// mentoring bot, and by tests that only exercise the coordinator.
pub struct NoopAgent;

#[async_trait]
impl Agent for NoopAgent {
    async fn on_participants_updated(&self, _roster: &[RosterEntry]) {}

    async fn on_chat_history_updated(
        &self,
        _history: &[ChatMessage],
        _kind: ChatEventKind,
        _detail: Value,
    ) {
    }

    async fn on_user_makes_choice(
        &self,
        _message_id: usize,
        _content_index: usize,
        _choice_index: usize,
        _email: &str,
    ) {
    }

    async fn on_question_passed(&self, _question_id: &str, _title: &str, _results: &Value) {}

    async fn on_meeting_closed(&self, _meeting_id: &str) {}

    async fn on_room_close(&self) {}
}

pub struct NoopAgentFactory;

impl AgentFactory for NoopAgentFactory {
    fn create(
        &self,
        room_id: &str,
        condition: u32,
        _history: &[ChatMessage],
        _sender: RoomSender,
        _saved_state: Option<Value>,
    ) -> Arc<dyn Agent> {
        tracing::debug!(room_id = %room_id, condition, "Creating no-op agent");
        Arc::new(NoopAgent)
    }
}
