use serde::{Deserialize, Serialize};

/// Upper bound on the text payload of a single chat message.
pub const MAX_TEXT_LENGTH: usize = 4096;

/// Sender value used for coordinator-generated entries.
pub const SYSTEM_SENDER: &str = "system";

/// Sender value used for agent-generated entries.
pub const AGENT_SENDER: &str = "AI";

/// One block of a chat entry. A message is an ordered list of sections so a
/// single entry can mix prose with a multiple-choice prompt.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Section {
    Text {
        value: String,
    },
    Choices {
        value: Vec<String>,
        /// Index into `value` once a participant resolves the prompt.
        /// Immutable after it is first set.
        #[serde(skip_serializing_if = "Option::is_none")]
        choice_index: Option<usize>,
    },
}

impl Section {
    pub fn text(value: impl Into<String>) -> Self {
        Section::Text {
            value: value.into(),
        }
    }

    pub fn choices(values: Vec<String>) -> Self {
        Section::Choices {
            value: values,
            choice_index: None,
        }
    }
}

/// One persisted entry of a room's transcript. `message_id` is the entry's
/// index in the history at append time and is never reused.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub message_id: usize,
    pub sender: String,
    pub timestamp: String,
    pub content: Vec<Section>,
}

/// Inbound chat-socket frames. Anything that fails to deserialize into this
/// enum is a protocol violation and closes the connection.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case", deny_unknown_fields)]
pub enum ClientAction {
    StartTyping,
    StopTyping,
    SendText {
        content: String,
    },
    MakeChoice {
        message_id: usize,
        content_index: usize,
        choice_index: usize,
    },
}

/// Outbound chat-socket frames, fanned out to every connection in a room.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ServerEvent {
    SendMessage {
        #[serde(flatten)]
        message: ChatMessage,
    },
    MakeChoice {
        sender: String,
        message_id: usize,
        content_index: usize,
        choice_index: usize,
    },
    StartTyping {
        sender: String,
    },
    StopTyping {
        sender: String,
    },
    ParticipantsUpdated {
        participants: Vec<super::registry::RosterEntry>,
    },
    MeetingClosed {
        meeting_id: String,
    },
    Error {
        message: String,
    },
}
