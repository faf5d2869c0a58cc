pub mod chat_socket;
pub mod queue_socket;

use std::collections::HashMap;
use std::sync::Arc;

use serde::Deserialize;
use warp::Filter;

use crate::chat::RoomRegistry;
use crate::config::TimeoutConfig;
use crate::lifecycle::{LifecycleManager, TimerKind};
use crate::meeting::AttendanceTracker;
use crate::queue::AdmissionQueue;
use crate::storage::Storage;

/// Shared handles every route needs.
pub struct AppContext {
    pub registry: Arc<RoomRegistry>,
    pub storage: Arc<dyn Storage>,
    pub lifecycle: Arc<LifecycleManager>,
    pub queue: Arc<AdmissionQueue>,
    pub attendance: Arc<AttendanceTracker>,
    pub timeouts: TimeoutConfig,
}

/// Assembles the full route tree: the two websocket endpoints, the internal
/// webhooks, and the health check.
pub fn routes(
    ctx: Arc<AppContext>,
) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
    chat_socket_route(ctx.clone())
        .or(queue_socket_route(ctx.clone()))
        .or(meeting_webhook_route(ctx.clone()))
        .or(question_passed_route(ctx))
        .or(health_route())
}

fn chat_socket_route(
    ctx: Arc<AppContext>,
) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
    warp::path!("chat" / "socket")
        .and(warp::ws())
        .and(warp::query::<HashMap<String, String>>())
        .and(with_context(ctx))
        .map(
            |ws: warp::ws::Ws, query: HashMap<String, String>, ctx: Arc<AppContext>| {
                ws.on_upgrade(move |websocket| {
                    chat_socket::handle_chat_socket(websocket, query, ctx)
                })
            },
        )
}

fn queue_socket_route(
    ctx: Arc<AppContext>,
) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
    warp::path!("queue" / "socket")
        .and(warp::ws())
        .and(warp::query::<HashMap<String, String>>())
        .and(with_context(ctx))
        .map(
            |ws: warp::ws::Ws, query: HashMap<String, String>, ctx: Arc<AppContext>| {
                ws.on_upgrade(move |websocket| {
                    queue_socket::handle_queue_socket(websocket, query, ctx)
                })
            },
        )
}

#[derive(Debug, Deserialize)]
struct MeetingWebhook {
    event: String,
    meeting_id: String,
    participant_id: String,
}

/// Internal webhook fed by the meeting provider's participant events. Joins
/// defuse the empty-meeting timer; the last leave arms it.
fn meeting_webhook_route(
    ctx: Arc<AppContext>,
) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
    warp::path!("webhooks" / "meeting")
        .and(warp::post())
        .and(warp::body::json())
        .and(with_context(ctx))
        .then(|payload: MeetingWebhook, ctx: Arc<AppContext>| async move {
            handle_meeting_webhook(payload, ctx).await
        })
}

async fn handle_meeting_webhook(
    payload: MeetingWebhook,
    ctx: Arc<AppContext>,
) -> warp::reply::WithStatus<warp::reply::Json> {
    let meeting_id = payload.meeting_id.as_str();
    match payload.event.as_str() {
        "participant_joined" => {
            let count = ctx
                .attendance
                .participant_joined(meeting_id, &payload.participant_id)
                .await;
            ctx.lifecycle
                .cancel(TimerKind::EmptyMeeting, meeting_id)
                .await;
            tracing::debug!(meeting_id = %meeting_id, attendees = count, "Participant joined meeting");
        }
        "participant_left" => {
            let remaining = ctx
                .attendance
                .participant_left(meeting_id, &payload.participant_id)
                .await;
            tracing::debug!(meeting_id = %meeting_id, attendees = remaining, "Participant left meeting");
            if remaining == 0 {
                match ctx.storage.room_id_for_meeting(meeting_id).await {
                    Ok(Some(room_id)) => {
                        ctx.lifecycle
                            .arm(
                                TimerKind::EmptyMeeting,
                                meeting_id,
                                &room_id,
                                ctx.timeouts.empty_meeting,
                            )
                            .await;
                    }
                    Ok(None) => {
                        tracing::warn!(meeting_id = %meeting_id, "Webhook for unknown meeting");
                    }
                    Err(e) => {
                        tracing::error!(meeting_id = %meeting_id, error = %e, "Room lookup failed");
                    }
                }
            }
        }
        other => {
            tracing::debug!(event = %other, "Ignoring meeting webhook event");
        }
    }
    warp::reply::with_status(
        warp::reply::json(&serde_json::json!({ "status": "ok" })),
        warp::http::StatusCode::OK,
    )
}

#[derive(Debug, Deserialize)]
struct QuestionPassedPayload {
    room_id: String,
    question_id: String,
    title: String,
    results: serde_json::Value,
}

/// Internal webhook forwarding grader results to the room's agent.
fn question_passed_route(
    ctx: Arc<AppContext>,
) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
    warp::path!("webhooks" / "question-passed")
        .and(warp::post())
        .and(warp::body::json())
        .and(with_context(ctx))
        .then(
            |payload: QuestionPassedPayload, ctx: Arc<AppContext>| async move {
                match ctx
                    .registry
                    .question_passed(
                        &payload.room_id,
                        &payload.question_id,
                        &payload.title,
                        payload.results,
                    )
                    .await
                {
                    Ok(()) => warp::reply::with_status(
                        warp::reply::json(&serde_json::json!({ "status": "ok" })),
                        warp::http::StatusCode::OK,
                    ),
                    Err(e) => {
                        tracing::warn!(room_id = %payload.room_id, error = %e, "Question-passed delivery failed");
                        warp::reply::with_status(
                            warp::reply::json(&serde_json::json!({ "error": e.to_string() })),
                            warp::http::StatusCode::NOT_FOUND,
                        )
                    }
                }
            },
        )
}

fn health_route() -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
    warp::path!("health").and(warp::get()).map(|| {
        warp::reply::json(&serde_json::json!({
            "status": "healthy",
            "service": "pairup-server",
        }))
    })
}

fn with_context(
    ctx: Arc<AppContext>,
) -> impl Filter<Extract = (Arc<AppContext>,), Error = std::convert::Infallible> + Clone {
    warp::any().map(move || ctx.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::NoopAgentFactory;
    use crate::meeting::{HostPool, MeetingProvider, Registrant};
    use crate::storage::InMemoryStorage;
    use async_trait::async_trait;
    use std::time::Duration;

    struct FakeMeetings;

    #[async_trait]
    impl MeetingProvider for FakeMeetings {
        async fn create_meeting(&self, _host: &str, _room_id: &str) -> crate::error::Result<String> {
            Ok("m1".to_string())
        }
        async fn add_registrant(
            &self,
            _meeting_id: &str,
            _display_name: &str,
            _email: &str,
        ) -> crate::error::Result<Registrant> {
            Ok(Registrant {
                join_url: "https://join".to_string(),
                registrant_id: "reg-1".to_string(),
            })
        }
        async fn end_meeting(&self, _meeting_id: &str) -> crate::error::Result<()> {
            Ok(())
        }
        async fn delete_meeting(&self, _meeting_id: &str) -> crate::error::Result<()> {
            Ok(())
        }
    }

    async fn context() -> (Arc<AppContext>, Arc<InMemoryStorage>) {
        let storage = Arc::new(InMemoryStorage::new());
        let registry = RoomRegistry::new(storage.clone(), Arc::new(NoopAgentFactory));
        let pool = Arc::new(HostPool::new(vec!["host1".to_string()]));
        let lifecycle = LifecycleManager::new(
            registry.clone(),
            storage.clone(),
            pool,
            Arc::new(FakeMeetings),
        );
        let ctx = Arc::new(AppContext {
            registry,
            storage: storage.clone(),
            lifecycle,
            queue: AdmissionQueue::new(),
            attendance: Arc::new(AttendanceTracker::new()),
            timeouts: TimeoutConfig {
                unused_meeting: Duration::from_secs(120),
                idle_session: Duration::from_secs(30),
                empty_meeting: Duration::from_secs(60),
                queue_poll: Duration::from_secs(3),
            },
        });
        (ctx, storage)
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let (ctx, _storage) = context().await;
        let response = warp::test::request()
            .method("GET")
            .path("/health")
            .reply(&routes(ctx))
            .await;
        assert_eq!(response.status(), 200);
        let body: serde_json::Value = serde_json::from_slice(response.body()).unwrap();
        assert_eq!(body["status"], "healthy");
    }

    #[tokio::test]
    async fn test_meeting_webhook_tracks_attendance() {
        let (ctx, storage) = context().await;
        storage
            .create_room(crate::storage::NewRoom {
                room_id: "r1".to_string(),
                meeting_id: "m1".to_string(),
                meeting_host: "host1".to_string(),
                workspace_token: String::new(),
                condition: 0,
                starter_code: String::new(),
            })
            .await
            .unwrap();

        let filter = routes(ctx.clone());
        let response = warp::test::request()
            .method("POST")
            .path("/webhooks/meeting")
            .json(&serde_json::json!({
                "event": "participant_joined",
                "meeting_id": "m1",
                "participant_id": "reg-a",
            }))
            .reply(&filter)
            .await;
        assert_eq!(response.status(), 200);
        assert_eq!(ctx.attendance.attendee_count("m1").await, 1);

        let response = warp::test::request()
            .method("POST")
            .path("/webhooks/meeting")
            .json(&serde_json::json!({
                "event": "participant_left",
                "meeting_id": "m1",
                "participant_id": "reg-a",
            }))
            .reply(&filter)
            .await;
        assert_eq!(response.status(), 200);
        assert_eq!(ctx.attendance.attendee_count("m1").await, 0);
    }

    #[tokio::test]
    async fn test_question_passed_unknown_room_is_404() {
        let (ctx, _storage) = context().await;
        let response = warp::test::request()
            .method("POST")
            .path("/webhooks/question-passed")
            .json(&serde_json::json!({
                "room_id": "ghost",
                "question_id": "q1",
                "title": "Two Sum",
                "results": {"passed": true},
            }))
            .reply(&routes(ctx))
            .await;
        assert_eq!(response.status(), 404);
    }
}
