use std::collections::{HashMap, HashSet};

use tokio::sync::Mutex;

/// Live attendee sets per external meeting, fed by the meeting provider's
/// webhook events. The coordinator only cares about the transition to and
/// from zero attendees.
#[derive(Default)]
pub struct AttendanceTracker {
    meetings: Mutex<HashMap<String, HashSet<String>>>,
}

impl AttendanceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records an attendee joining. Returns the new attendee count.
    pub async fn participant_joined(&self, meeting_id: &str, registrant_id: &str) -> usize {
        let mut meetings = self.meetings.lock().await;
        let attendees = meetings.entry(meeting_id.to_string()).or_default();
        attendees.insert(registrant_id.to_string());
        attendees.len()
    }

    /// Records an attendee leaving. Returns the remaining attendee count.
    /// Unknown registrants are ignored (duplicate webhook deliveries).
    pub async fn participant_left(&self, meeting_id: &str, registrant_id: &str) -> usize {
        let mut meetings = self.meetings.lock().await;
        let Some(attendees) = meetings.get_mut(meeting_id) else {
            return 0;
        };
        attendees.remove(registrant_id);
        let remaining = attendees.len();
        if remaining == 0 {
            meetings.remove(meeting_id);
        }
        remaining
    }

    pub async fn attendee_count(&self, meeting_id: &str) -> usize {
        let meetings = self.meetings.lock().await;
        meetings.get(meeting_id).map(|a| a.len()).unwrap_or(0)
    }
}
