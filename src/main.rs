use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use pairup_server::agent::NoopAgentFactory;
use pairup_server::api::{self, AppContext};
use pairup_server::chat::RoomRegistry;
use pairup_server::config::Config;
use pairup_server::lifecycle::LifecycleManager;
use pairup_server::meeting::{
    AttendanceTracker, HostPool, HttpMeetingProvider, HttpWorkspaceProvider,
};
use pairup_server::queue::{AdmissionQueue, AdmissionWorker};
use pairup_server::storage::{InMemoryStorage, Storage};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::from_env();

    let storage: Arc<dyn Storage> = Arc::new(InMemoryStorage::new());
    // Presence flags are meaningless across a restart.
    if let Err(e) = storage.set_all_offline().await {
        tracing::error!(error = %e, "Failed to reset participant presence");
    }

    let registry = RoomRegistry::new(storage.clone(), Arc::new(NoopAgentFactory));
    let pool = Arc::new(HostPool::new(config.meeting.hosts.clone()));
    let meetings = Arc::new(HttpMeetingProvider::new(&config.meeting));
    let workspaces = Arc::new(HttpWorkspaceProvider::new(&config.workspace));
    let lifecycle = LifecycleManager::new(
        registry.clone(),
        storage.clone(),
        pool.clone(),
        meetings.clone(),
    );
    let attendance = Arc::new(AttendanceTracker::new());
    let queue = AdmissionQueue::new();

    let worker = AdmissionWorker::new(
        queue.clone(),
        storage.clone(),
        pool.clone(),
        meetings,
        workspaces,
        lifecycle.clone(),
        registry.clone(),
        config.timeouts.queue_poll,
        config.timeouts.unused_meeting,
        config.workspace.starter_code.clone(),
    );
    tokio::spawn(worker.run());

    let ctx = Arc::new(AppContext {
        registry,
        storage,
        lifecycle,
        queue,
        attendance,
        timeouts: config.timeouts.clone(),
    });

    tracing::info!(
        host_slots = pool.capacity(),
        "Starting room session coordinator"
    );
    warp::serve(api::routes(ctx)).run(config.bind_address()).await;
}
