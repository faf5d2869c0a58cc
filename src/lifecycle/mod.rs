use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::chat::RoomRegistry;
use crate::error::Result;
use crate::meeting::{HostPool, MeetingProvider};
use crate::storage::Storage;

/// Which reclamation deadline a timer tracks. At most one timer per
/// (meeting, kind) pair is ever live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    /// Armed at room creation, cancelled when a second participant is
    /// admitted. Reclaims meetings nobody ever paired into.
    UnusedMeeting,
    /// Armed when the last chat connection leaves a room with a live
    /// meeting, cancelled when anyone attaches again.
    IdleSession,
    /// Armed when the meeting's live attendance drops to zero, cancelled
    /// when anyone joins the meeting again.
    EmptyMeeting,
}

/// Owns the reclamation timers and the teardown they trigger. Arming an
/// already-armed timer replaces it; cancelling an absent one is a no-op, so
/// callers never need to know whether a timer is currently pending.
pub struct LifecycleManager {
    timers: Mutex<HashMap<(String, TimerKind), JoinHandle<()>>>,
    registry: Arc<RoomRegistry>,
    storage: Arc<dyn Storage>,
    pool: Arc<HostPool>,
    meetings: Arc<dyn MeetingProvider>,
    /// Timer tasks hold a weak reference so a dropped manager silently
    /// disarms everything still pending.
    weak_self: Weak<LifecycleManager>,
}

impl LifecycleManager {
    pub fn new(
        registry: Arc<RoomRegistry>,
        storage: Arc<dyn Storage>,
        pool: Arc<HostPool>,
        meetings: Arc<dyn MeetingProvider>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            timers: Mutex::new(HashMap::new()),
            registry,
            storage,
            pool,
            meetings,
            weak_self: weak.clone(),
        })
    }

    /// Starts (or restarts) a timer that tears the meeting down after
    /// `delay` unless cancelled first.
    pub async fn arm(&self, kind: TimerKind, meeting_id: &str, room_id: &str, delay: Duration) {
        let manager = self.weak_self.clone();
        let meeting = meeting_id.to_string();
        let room = room_id.to_string();
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(manager) = manager.upgrade() else {
                return;
            };
            tracing::info!(
                meeting_id = %meeting,
                room_id = %room,
                kind = ?kind,
                "Reclamation timer fired"
            );
            // Deregister before teardown so cancel_all only aborts siblings,
            // not the task running it.
            {
                let mut timers = manager.timers.lock().await;
                timers.remove(&(meeting.clone(), kind));
            }
            manager.teardown(&meeting, &room).await;
        });

        let mut timers = self.timers.lock().await;
        if let Some(previous) = timers.insert((meeting_id.to_string(), kind), task) {
            previous.abort();
        }
        tracing::debug!(meeting_id = %meeting_id, kind = ?kind, delay_secs = delay.as_secs(), "Armed timer");
    }

    /// Cancels a pending timer. Safe to call whether or not one is armed.
    pub async fn cancel(&self, kind: TimerKind, meeting_id: &str) {
        let mut timers = self.timers.lock().await;
        if let Some(task) = timers.remove(&(meeting_id.to_string(), kind)) {
            task.abort();
            tracing::debug!(meeting_id = %meeting_id, kind = ?kind, "Cancelled timer");
        }
    }

    async fn cancel_all(&self, meeting_id: &str) {
        let mut timers = self.timers.lock().await;
        timers.retain(|(id, _), task| {
            if id.as_str() == meeting_id {
                task.abort();
                false
            } else {
                true
            }
        });
    }

    /// Full reclamation: end the external meeting, scrub its traces from
    /// storage, free the host slot, and notify the room. External-API
    /// failures are logged and do not block reclaiming the slot.
    pub async fn teardown(&self, meeting_id: &str, room_id: &str) {
        self.cancel_all(meeting_id).await;

        if let Err(e) = self.meetings.end_meeting(meeting_id).await {
            tracing::warn!(meeting_id = %meeting_id, error = %e, "Failed to end meeting");
        }
        if let Err(e) = self.meetings.delete_meeting(meeting_id).await {
            tracing::warn!(meeting_id = %meeting_id, error = %e, "Failed to delete meeting");
        }

        if let Err(e) = self.scrub_storage(meeting_id, room_id).await {
            tracing::error!(room_id = %room_id, error = %e, "Failed to record meeting teardown");
        }

        self.pool.release_meeting(meeting_id).await;
        self.registry.meeting_closed(room_id, meeting_id).await;
        tracing::info!(meeting_id = %meeting_id, room_id = %room_id, "Meeting torn down");
    }

    async fn scrub_storage(&self, _meeting_id: &str, room_id: &str) -> Result<()> {
        self.storage.mark_meeting_expired(room_id).await?;
        self.storage.clear_meeting_links(room_id).await?;
        Ok(())
    }

    #[cfg(test)]
    pub(crate) async fn pending_count(&self) -> usize {
        let timers = self.timers.lock().await;
        timers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::NoopAgentFactory;
    use crate::error::Result;
    use crate::meeting::Registrant;
    use crate::storage::InMemoryStorage;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct FakeMeetings {
        ended: AtomicUsize,
        deleted: AtomicUsize,
    }

    #[async_trait]
    impl MeetingProvider for FakeMeetings {
        async fn create_meeting(&self, _host: &str, _room_id: &str) -> Result<String> {
            Ok("m1".to_string())
        }
        async fn add_registrant(
            &self,
            _meeting_id: &str,
            _display_name: &str,
            _email: &str,
        ) -> Result<Registrant> {
            Ok(Registrant {
                join_url: "https://join".to_string(),
                registrant_id: "reg-1".to_string(),
            })
        }
        async fn end_meeting(&self, _meeting_id: &str) -> Result<()> {
            self.ended.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        async fn delete_meeting(&self, _meeting_id: &str) -> Result<()> {
            self.deleted.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Fixture {
        manager: Arc<LifecycleManager>,
        storage: Arc<InMemoryStorage>,
        pool: Arc<HostPool>,
        meetings: Arc<FakeMeetings>,
    }

    async fn fixture() -> Fixture {
        let storage = Arc::new(InMemoryStorage::new());
        let registry = RoomRegistry::new(storage.clone(), Arc::new(NoopAgentFactory));
        let pool = Arc::new(HostPool::new(vec!["host1".to_string()]));
        let meetings = Arc::new(FakeMeetings::default());
        let manager = LifecycleManager::new(
            registry,
            storage.clone(),
            pool.clone(),
            meetings.clone(),
        );
        Fixture {
            manager,
            storage,
            pool,
            meetings,
        }
    }

    fn new_room(room_id: &str, meeting_id: &str) -> crate::storage::NewRoom {
        crate::storage::NewRoom {
            room_id: room_id.to_string(),
            meeting_id: meeting_id.to_string(),
            meeting_host: "host1".to_string(),
            workspace_token: String::new(),
            condition: 0,
            starter_code: String::new(),
        }
    }

    #[tokio::test]
    async fn test_timer_fires_and_tears_down() {
        let f = fixture().await;
        f.storage.create_room(new_room("r1", "m1")).await.unwrap();
        f.pool.bind("host1", "m1").await.unwrap();

        f.manager
            .arm(TimerKind::UnusedMeeting, "m1", "r1", Duration::from_millis(20))
            .await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(f.meetings.ended.load(Ordering::SeqCst), 1);
        assert_eq!(f.meetings.deleted.load(Ordering::SeqCst), 1);
        assert_eq!(f.pool.bound_count().await, 0);
        let record = f.storage.load_room("r1").await.unwrap().unwrap();
        assert!(record.meeting_expired);
        assert_eq!(f.manager.pending_count().await, 0);
    }

    #[tokio::test]
    async fn test_cancel_prevents_teardown() {
        let f = fixture().await;
        f.storage.create_room(new_room("r1", "m1")).await.unwrap();

        f.manager
            .arm(TimerKind::IdleSession, "m1", "r1", Duration::from_millis(30))
            .await;
        f.manager.cancel(TimerKind::IdleSession, "m1").await;
        tokio::time::sleep(Duration::from_millis(80)).await;

        assert_eq!(f.meetings.ended.load(Ordering::SeqCst), 0);
        let record = f.storage.load_room("r1").await.unwrap().unwrap();
        assert!(!record.meeting_expired);
    }

    #[tokio::test]
    async fn test_cancel_without_armed_timer_is_noop() {
        let f = fixture().await;
        f.manager.cancel(TimerKind::EmptyMeeting, "ghost").await;
        assert_eq!(f.manager.pending_count().await, 0);
    }

    #[tokio::test]
    async fn test_rearming_replaces_previous_timer() {
        let f = fixture().await;
        f.storage.create_room(new_room("r1", "m1")).await.unwrap();

        f.manager
            .arm(TimerKind::EmptyMeeting, "m1", "r1", Duration::from_millis(10))
            .await;
        f.manager
            .arm(TimerKind::EmptyMeeting, "m1", "r1", Duration::from_secs(60))
            .await;
        tokio::time::sleep(Duration::from_millis(60)).await;

        // The short timer was replaced before it could fire
        assert_eq!(f.meetings.ended.load(Ordering::SeqCst), 0);
        assert_eq!(f.manager.pending_count().await, 1);
    }

    #[tokio::test]
    async fn test_teardown_cancels_sibling_timers() {
        let f = fixture().await;
        f.storage.create_room(new_room("r1", "m1")).await.unwrap();

        f.manager
            .arm(TimerKind::IdleSession, "m1", "r1", Duration::from_secs(60))
            .await;
        f.manager
            .arm(TimerKind::EmptyMeeting, "m1", "r1", Duration::from_millis(10))
            .await;
        tokio::time::sleep(Duration::from_millis(60)).await;

        assert_eq!(f.meetings.ended.load(Ordering::SeqCst), 1);
        assert_eq!(f.manager.pending_count().await, 0);
    }
}
