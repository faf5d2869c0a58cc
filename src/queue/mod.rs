use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::{Mutex, Notify};
use warp::ws::Message;

use crate::chat::RoomRegistry;
use crate::error::{CoordinatorError, Result};
use crate::lifecycle::{LifecycleManager, TimerKind};
use crate::meeting::{HostPool, MeetingProvider, WorkspaceProvider};
use crate::storage::Storage;

/// Write half of a queued websocket connection. The reader side flips
/// `closed` when the socket goes away so the worker can skip or abandon the
/// entry without ever blocking on it.
#[derive(Clone)]
pub struct QueueClient {
    sender: tokio::sync::mpsc::UnboundedSender<Message>,
    closed: Arc<AtomicBool>,
}

impl QueueClient {
    pub fn new(sender: tokio::sync::mpsc::UnboundedSender<Message>) -> Self {
        Self {
            sender,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn is_open(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
    }

    pub fn mark_closed(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn send_json(&self, value: &serde_json::Value) {
        let _ = self.sender.send(Message::text(value.to_string()));
    }

    pub fn close(&self, code: u16, reason: &str) {
        let _ = self.sender.send(Message::close_with(code, reason.to_string()));
        self.mark_closed();
    }
}

/// One waiting user.
pub struct AdmitTask {
    pub name: String,
    pub email: String,
    pub client: QueueClient,
}

/// FIFO admission queue. Entries are appended by the gateway and consumed
/// one at a time by a single worker, which is what makes pairing decisions
/// and slot allocation race-free.
pub struct AdmissionQueue {
    tasks: Mutex<VecDeque<AdmitTask>>,
    notify: Notify,
}

impl AdmissionQueue {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            tasks: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
        })
    }

    /// Appends a task and returns its 1-based queue position. A live entry
    /// with the same email is rejected.
    pub async fn enqueue(&self, task: AdmitTask) -> Result<usize> {
        let mut tasks = self.tasks.lock().await;
        if tasks
            .iter()
            .any(|t| t.email == task.email && t.client.is_open())
        {
            return Err(CoordinatorError::DuplicateQueueEntry(task.email));
        }
        tasks.push_back(task);
        let position = tasks.len();
        self.notify.notify_one();
        Ok(position)
    }

    /// Pops the head of the queue, waiting for one to arrive. Remaining
    /// entries are told their new positions.
    async fn pop(&self) -> AdmitTask {
        loop {
            {
                let mut tasks = self.tasks.lock().await;
                if let Some(task) = tasks.pop_front() {
                    for (i, waiting) in tasks.iter().enumerate() {
                        waiting.client.send_json(&json!({ "order": i + 1 }));
                    }
                    return task;
                }
            }
            self.notify.notified().await;
        }
    }

    pub async fn len(&self) -> usize {
        self.tasks.lock().await.len()
    }
}

/// The serial consumer of the admission queue. Exactly one instance runs;
/// every pairing decision and host-slot allocation happens on this task.
pub struct AdmissionWorker {
    queue: Arc<AdmissionQueue>,
    storage: Arc<dyn Storage>,
    pool: Arc<HostPool>,
    meetings: Arc<dyn MeetingProvider>,
    workspaces: Arc<dyn WorkspaceProvider>,
    lifecycle: Arc<LifecycleManager>,
    registry: Arc<RoomRegistry>,
    poll_interval: Duration,
    unused_timeout: Duration,
    starter_code: String,
}

impl AdmissionWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        queue: Arc<AdmissionQueue>,
        storage: Arc<dyn Storage>,
        pool: Arc<HostPool>,
        meetings: Arc<dyn MeetingProvider>,
        workspaces: Arc<dyn WorkspaceProvider>,
        lifecycle: Arc<LifecycleManager>,
        registry: Arc<RoomRegistry>,
        poll_interval: Duration,
        unused_timeout: Duration,
        starter_code: String,
    ) -> Self {
        Self {
            queue,
            storage,
            pool,
            meetings,
            workspaces,
            lifecycle,
            registry,
            poll_interval,
            unused_timeout,
            starter_code,
        }
    }

    pub async fn run(self) {
        tracing::info!("Admission worker started");
        loop {
            let task = self.queue.pop().await;
            if !task.client.is_open() {
                tracing::debug!(email = %task.email, "Skipping abandoned queue entry");
                continue;
            }
            if let Err(e) = self.admit(&task).await {
                tracing::error!(email = %task.email, error = %e, "Admission failed");
                task.client.close(1011, "Failed to start a session.");
            }
        }
    }

    async fn admit(&self, task: &AdmitTask) -> Result<()> {
        self.storage.upsert_user(&task.email, &task.name).await?;

        for room in self.storage.half_vacant_rooms().await? {
            if room.emails.len() == 1 && room.emails[0] == task.email {
                // Re-entry into a room the user is already alone in.
                tracing::info!(email = %task.email, room_id = %room.room_id, "User already holds a room");
                task.client.send_json(&json!({
                    "room_id": room.room_id,
                    "is_new_room": false,
                    "already_in_room": true,
                }));
                task.client.close(1000, "Admitted");
                return Ok(());
            }
            if room.online_count > 0 && room.emails.len() == 1 && room.emails[0] != task.email {
                return self.join_existing(task, &room).await;
            }
        }

        self.create_room(task).await
    }

    /// Pairs the user into a half-vacant room whose occupant is online.
    async fn join_existing(
        &self,
        task: &AdmitTask,
        room: &crate::storage::HalfVacantRoom,
    ) -> Result<()> {
        let registrant = self
            .meetings
            .add_registrant(
                &room.meeting_id,
                &task.name,
                &format!("user2-{}@pairup.dev", room.meeting_id),
            )
            .await?;
        self.storage
            .add_participant(
                &room.room_id,
                &task.email,
                &registrant.join_url,
                &registrant.registrant_id,
            )
            .await?;
        self.storage.mark_room_full(&room.room_id).await?;

        // The meeting is no longer at risk of going unused.
        self.lifecycle
            .cancel(TimerKind::UnusedMeeting, &room.meeting_id)
            .await;

        if let Some(handle) = self.registry.get(&room.room_id).await {
            if let Err(e) = self.registry.notify_participants_updated(&handle).await {
                tracing::warn!(room_id = %room.room_id, error = %e, "Failed to broadcast roster");
            }
        }

        tracing::info!(email = %task.email, room_id = %room.room_id, "Paired into existing room");
        task.client.send_json(&json!({
            "room_id": room.room_id,
            "is_new_room": false,
            "already_in_room": false,
        }));
        task.client.close(1000, "Admitted");
        Ok(())
    }

    /// Provisions a brand-new room, waiting for a free host slot first.
    async fn create_room(&self, task: &AdmitTask) -> Result<()> {
        let host = loop {
            if let Some(host) = self.pool.find_free().await {
                break host;
            }
            // Position zero means "at the front, waiting for capacity".
            task.client.send_json(&json!({ "order": 0 }));
            tokio::time::sleep(self.poll_interval).await;
            if !task.client.is_open() {
                tracing::debug!(email = %task.email, "Waiter left before a slot freed up");
                return Ok(());
            }
        };

        let room_id = uuid::Uuid::new_v4().simple().to_string();
        let workspace_token = self.workspaces.create_workspace(&room_id).await?;
        let meeting_id = self.meetings.create_meeting(&host, &room_id).await?;

        // Bind only after the meeting exists; a provisioning failure above
        // must not leak the slot.
        self.pool.bind(&host, &meeting_id).await?;

        if let Err(e) = self
            .finish_room(task, &room_id, &host, &meeting_id, workspace_token)
            .await
        {
            self.pool.release_meeting(&meeting_id).await;
            return Err(e);
        }

        self.lifecycle
            .arm(
                TimerKind::UnusedMeeting,
                &meeting_id,
                &room_id,
                self.unused_timeout,
            )
            .await;

        tracing::info!(email = %task.email, room_id = %room_id, meeting_id = %meeting_id, "Created room");
        task.client.send_json(&json!({
            "room_id": room_id,
            "is_new_room": true,
            "already_in_room": false,
        }));
        task.client.close(1000, "Admitted");
        Ok(())
    }

    async fn finish_room(
        &self,
        task: &AdmitTask,
        room_id: &str,
        host: &str,
        meeting_id: &str,
        workspace_token: String,
    ) -> Result<()> {
        // Experimental condition cycles with total room count.
        let condition = (self.storage.room_count().await? % 4) as u32;
        self.storage
            .create_room(crate::storage::NewRoom {
                room_id: room_id.to_string(),
                meeting_id: meeting_id.to_string(),
                meeting_host: host.to_string(),
                workspace_token,
                condition,
                starter_code: self.starter_code.clone(),
            })
            .await?;

        let registrant = self
            .meetings
            .add_registrant(
                meeting_id,
                &task.name,
                &format!("user1-{meeting_id}@pairup.dev"),
            )
            .await?;
        self.storage
            .add_participant(
                room_id,
                &task.email,
                &registrant.join_url,
                &registrant.registrant_id,
            )
            .await?;

        if let Err(e) = self
            .workspaces
            .seed_starter_content(room_id, &self.starter_code)
            .await
        {
            // Starter content is a convenience, not a prerequisite.
            tracing::warn!(room_id = %room_id, error = %e, "Failed to seed starter content");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::NoopAgentFactory;
    use crate::meeting::Registrant;
    use crate::storage::InMemoryStorage;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::mpsc;

    #[derive(Default)]
    struct FakeMeetings {
        created: AtomicUsize,
    }

    #[async_trait]
    impl MeetingProvider for FakeMeetings {
        async fn create_meeting(&self, _host: &str, _room_id: &str) -> Result<String> {
            let n = self.created.fetch_add(1, Ordering::SeqCst);
            Ok(format!("meeting-{n}"))
        }
        async fn add_registrant(
            &self,
            meeting_id: &str,
            _display_name: &str,
            email: &str,
        ) -> Result<Registrant> {
            Ok(Registrant {
                join_url: format!("https://join/{meeting_id}"),
                registrant_id: format!("reg-{email}"),
            })
        }
        async fn end_meeting(&self, _meeting_id: &str) -> Result<()> {
            Ok(())
        }
        async fn delete_meeting(&self, _meeting_id: &str) -> Result<()> {
            Ok(())
        }
    }

    struct FakeWorkspaces;

    #[async_trait]
    impl WorkspaceProvider for FakeWorkspaces {
        async fn create_workspace(&self, _room_id: &str) -> Result<String> {
            Ok("workspace-token".to_string())
        }
        async fn seed_starter_content(&self, _room_id: &str, _code: &str) -> Result<()> {
            Ok(())
        }
    }

    struct Fixture {
        queue: Arc<AdmissionQueue>,
        storage: Arc<InMemoryStorage>,
        pool: Arc<HostPool>,
        lifecycle: Arc<LifecycleManager>,
    }

    fn spawn_worker(hosts: Vec<&str>) -> Fixture {
        let queue = AdmissionQueue::new();
        let storage = Arc::new(InMemoryStorage::new());
        let pool = Arc::new(HostPool::new(
            hosts.into_iter().map(String::from).collect(),
        ));
        let meetings = Arc::new(FakeMeetings::default());
        let registry = RoomRegistry::new(storage.clone(), Arc::new(NoopAgentFactory));
        let lifecycle = LifecycleManager::new(
            registry.clone(),
            storage.clone(),
            pool.clone(),
            meetings.clone(),
        );
        let worker = AdmissionWorker::new(
            queue.clone(),
            storage.clone(),
            pool.clone(),
            meetings,
            Arc::new(FakeWorkspaces),
            lifecycle.clone(),
            registry,
            Duration::from_millis(10),
            Duration::from_secs(120),
            String::new(),
        );
        tokio::spawn(worker.run());
        Fixture {
            queue,
            storage,
            pool,
            lifecycle,
        }
    }

    fn client() -> (QueueClient, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (QueueClient::new(tx), rx)
    }

    async fn recv_json(rx: &mut mpsc::UnboundedReceiver<Message>) -> serde_json::Value {
        loop {
            let frame = tokio::time::timeout(Duration::from_secs(1), rx.recv())
                .await
                .expect("timed out waiting for frame")
                .expect("channel closed");
            if frame.is_close() {
                continue;
            }
            return serde_json::from_str(frame.to_str().unwrap()).unwrap();
        }
    }

    #[tokio::test]
    async fn test_duplicate_email_rejected() {
        let queue = AdmissionQueue::new();
        let (c1, _rx1) = client();
        let (c2, _rx2) = client();

        let position = queue
            .enqueue(AdmitTask {
                name: "Alice".to_string(),
                email: "a@x.dev".to_string(),
                client: c1,
            })
            .await
            .unwrap();
        assert_eq!(position, 1);

        let err = queue
            .enqueue(AdmitTask {
                name: "Alice again".to_string(),
                email: "a@x.dev".to_string(),
                client: c2,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, CoordinatorError::DuplicateQueueEntry(_)));
    }

    #[tokio::test]
    async fn test_first_user_gets_new_room() {
        let f = spawn_worker(vec!["host1"]);
        let (c, mut rx) = client();
        f.queue
            .enqueue(AdmitTask {
                name: "Alice".to_string(),
                email: "a@x.dev".to_string(),
                client: c,
            })
            .await
            .unwrap();

        let response = recv_json(&mut rx).await;
        assert_eq!(response["is_new_room"], true);
        assert_eq!(response["already_in_room"], false);
        let room_id = response["room_id"].as_str().unwrap();

        // Slot bound, room durable, participant registered
        assert_eq!(f.pool.bound_count().await, 1);
        let record = f.storage.load_room(room_id).await.unwrap().unwrap();
        assert_eq!(record.condition, 0);
        let participants = f.storage.list_participants(room_id).await.unwrap();
        assert_eq!(participants.len(), 1);
        assert_eq!(participants[0].email, "a@x.dev");
    }

    #[tokio::test]
    async fn test_second_user_pairs_into_half_vacant_room() {
        let f = spawn_worker(vec!["host1"]);
        let (c1, mut rx1) = client();
        f.queue
            .enqueue(AdmitTask {
                name: "Alice".to_string(),
                email: "a@x.dev".to_string(),
                client: c1,
            })
            .await
            .unwrap();
        let first = recv_json(&mut rx1).await;
        let room_id = first["room_id"].as_str().unwrap().to_string();
        // A fresh room sits behind its unused-meeting deadline
        assert_eq!(f.lifecycle.pending_count().await, 1);

        let (c2, mut rx2) = client();
        f.queue
            .enqueue(AdmitTask {
                name: "Bob".to_string(),
                email: "b@x.dev".to_string(),
                client: c2,
            })
            .await
            .unwrap();
        let second = recv_json(&mut rx2).await;
        assert_eq!(second["room_id"], room_id.as_str());
        assert_eq!(second["is_new_room"], false);
        assert_eq!(second["already_in_room"], false);

        let record = f.storage.load_room(&room_id).await.unwrap().unwrap();
        assert!(record.is_full);
        assert_eq!(f.pool.bound_count().await, 1);
        // Pairing defused the unused-meeting timer
        assert_eq!(f.lifecycle.pending_count().await, 0);
    }

    #[tokio::test]
    async fn test_returning_user_reclaims_own_room() {
        let f = spawn_worker(vec!["host1"]);
        let (c1, mut rx1) = client();
        f.queue
            .enqueue(AdmitTask {
                name: "Alice".to_string(),
                email: "a@x.dev".to_string(),
                client: c1,
            })
            .await
            .unwrap();
        let first = recv_json(&mut rx1).await;
        let room_id = first["room_id"].as_str().unwrap().to_string();

        let (c2, mut rx2) = client();
        f.queue
            .enqueue(AdmitTask {
                name: "Alice".to_string(),
                email: "a@x.dev".to_string(),
                client: c2,
            })
            .await
            .unwrap();
        let again = recv_json(&mut rx2).await;
        assert_eq!(again["room_id"], room_id.as_str());
        assert_eq!(again["already_in_room"], true);

        // No second room or registrant was created
        assert_eq!(f.storage.room_count().await.unwrap(), 1);
        assert_eq!(f.pool.bound_count().await, 1);
    }

    #[tokio::test]
    async fn test_exhausted_pool_reports_position_zero() {
        let f = spawn_worker(vec!["host1"]);

        // Occupy the only slot with a full room so the next user can't pair in.
        let (c1, mut rx1) = client();
        f.queue
            .enqueue(AdmitTask {
                name: "Alice".to_string(),
                email: "a@x.dev".to_string(),
                client: c1,
            })
            .await
            .unwrap();
        let first = recv_json(&mut rx1).await;
        let room_id = first["room_id"].as_str().unwrap().to_string();
        f.storage.set_all_offline().await.unwrap();
        f.storage.mark_room_full(&room_id).await.unwrap();
        f.storage
            .add_participant(&room_id, "b@x.dev", "url", "reg-b")
            .await
            .unwrap();

        let (c3, mut rx3) = client();
        f.queue
            .enqueue(AdmitTask {
                name: "Cara".to_string(),
                email: "c@x.dev".to_string(),
                client: c3.clone(),
            })
            .await
            .unwrap();

        let waiting = recv_json(&mut rx3).await;
        assert_eq!(waiting["order"], 0);

        // Abandoning the socket ends the wait without consuming a slot
        c3.mark_closed();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(f.pool.bound_count().await, 1);
        assert_eq!(f.queue.len().await, 0);
    }

    #[tokio::test]
    async fn test_condition_cycles_with_room_count() {
        let f = spawn_worker(vec!["h1", "h2", "h3", "h4", "h5"]);
        let mut conditions = Vec::new();
        for i in 0..5 {
            let (c, mut rx) = client();
            f.queue
                .enqueue(AdmitTask {
                    name: format!("User {i}"),
                    email: format!("u{i}@x.dev"),
                    client: c,
                })
                .await
                .unwrap();
            let response = recv_json(&mut rx).await;
            let room_id = response["room_id"].as_str().unwrap();
            // Make the room full and offline so the next user gets a new one
            f.storage.mark_room_full(room_id).await.unwrap();
            f.storage
                .add_participant(room_id, "filler@x.dev", "url", "reg-f")
                .await
                .unwrap();
            f.storage.set_all_offline().await.unwrap();
            let record = f.storage.load_room(room_id).await.unwrap().unwrap();
            conditions.push(record.condition);
        }
        assert_eq!(conditions, vec![0, 1, 2, 3, 0]);
    }
}
