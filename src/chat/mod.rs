pub mod message;
pub mod registry;

pub use message::{ChatMessage, ClientAction, Section, ServerEvent, MAX_TEXT_LENGTH};
pub use registry::{
    ConnectionId, DetachOutcome, Identity, MessageOrigin, RoomHandle, RoomRegistry, RosterEntry,
};
