pub mod attendance;
pub mod pool;

pub use attendance::AttendanceTracker;
pub use pool::HostPool;

use async_trait::async_trait;
use futures::SinkExt;
use serde::Deserialize;
use serde_json::json;
use tokio_tungstenite::tungstenite::Message as WsMessage;

use crate::config::{MeetingConfig, WorkspaceConfig};
use crate::error::{CoordinatorError, Result};

/// Join credentials issued when a participant is registered for a meeting.
#[derive(Debug, Clone)]
pub struct Registrant {
    pub join_url: String,
    pub registrant_id: String,
}

/// External video-meeting API. Implementations are expected to be cheap to
/// clone behind an Arc and safe to call concurrently.
#[async_trait]
pub trait MeetingProvider: Send + Sync {
    /// Creates a meeting on the given host account. Returns the meeting id.
    async fn create_meeting(&self, host: &str, room_id: &str) -> Result<String>;

    /// Registers a participant and returns their personal join credentials.
    async fn add_registrant(
        &self,
        meeting_id: &str,
        display_name: &str,
        email: &str,
    ) -> Result<Registrant>;

    /// Ends a running meeting. Already-ended meetings are not an error.
    async fn end_meeting(&self, meeting_id: &str) -> Result<()>;

    /// Deletes the meeting record so the host slot is truly reusable.
    async fn delete_meeting(&self, meeting_id: &str) -> Result<()>;
}

/// Collaborative-workspace API used to provision the shared editor for a
/// room and seed it with starter content.
#[async_trait]
pub trait WorkspaceProvider: Send + Sync {
    /// Creates a workspace user for the room and returns its API token.
    async fn create_workspace(&self, room_id: &str) -> Result<String>;

    /// Writes the starter content into the room's shared editor.
    async fn seed_starter_content(&self, room_id: &str, code: &str) -> Result<()>;
}

#[derive(Deserialize)]
struct CreateMeetingResponse {
    id: serde_json::Value,
}

#[derive(Deserialize)]
struct AddRegistrantResponse {
    join_url: String,
    registrant_id: String,
}

/// Zoom-style REST implementation of the meeting API.
pub struct HttpMeetingProvider {
    client: reqwest::Client,
    api_base: String,
    api_token: String,
}

impl HttpMeetingProvider {
    pub fn new(config: &MeetingConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_base: config.api_base.clone(),
            api_token: config.api_token.clone(),
        }
    }
}

#[async_trait]
impl MeetingProvider for HttpMeetingProvider {
    async fn create_meeting(&self, host: &str, room_id: &str) -> Result<String> {
        let response = self
            .client
            .post(format!("{}/users/{}/meetings", self.api_base, host))
            .bearer_auth(&self.api_token)
            .json(&json!({
                "topic": "Pair programming session",
                "agenda": room_id,
                "type": 2,
                "settings": {
                    "approval_type": 0,
                    "registrants_email_notification": false,
                    "waiting_room": false,
                    "join_before_host": true,
                },
            }))
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(CoordinatorError::provisioning(format!(
                "meeting creation on {host} failed with {status}: {body}"
            )));
        }

        let created: CreateMeetingResponse = response.json().await?;
        // The provider returns a numeric id; everything downstream treats it
        // as an opaque string.
        let meeting_id = match created.id {
            serde_json::Value::String(s) => s,
            other => other.to_string(),
        };
        tracing::info!(host = %host, meeting_id = %meeting_id, "Created meeting");
        Ok(meeting_id)
    }

    async fn add_registrant(
        &self,
        meeting_id: &str,
        display_name: &str,
        email: &str,
    ) -> Result<Registrant> {
        let response = self
            .client
            .post(format!(
                "{}/meetings/{}/registrants",
                self.api_base, meeting_id
            ))
            .bearer_auth(&self.api_token)
            .json(&json!({
                "first_name": display_name,
                "last_name": "-",
                "email": email,
                "auto_approve": true,
            }))
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(CoordinatorError::provisioning(format!(
                "registrant creation for meeting {meeting_id} failed with {status}: {body}"
            )));
        }

        let registrant: AddRegistrantResponse = response.json().await?;
        Ok(Registrant {
            join_url: registrant.join_url,
            registrant_id: registrant.registrant_id,
        })
    }

    async fn end_meeting(&self, meeting_id: &str) -> Result<()> {
        let response = self
            .client
            .put(format!("{}/meetings/{}/status", self.api_base, meeting_id))
            .bearer_auth(&self.api_token)
            .json(&json!({ "action": "end" }))
            .send()
            .await?;

        // 404 means the meeting already ended on its own.
        if !response.status().is_success() && response.status() != reqwest::StatusCode::NOT_FOUND {
            return Err(CoordinatorError::provisioning(format!(
                "ending meeting {meeting_id} failed with {}",
                response.status()
            )));
        }
        Ok(())
    }

    async fn delete_meeting(&self, meeting_id: &str) -> Result<()> {
        let response = self
            .client
            .delete(format!("{}/meetings/{}", self.api_base, meeting_id))
            .bearer_auth(&self.api_token)
            .send()
            .await?;

        if !response.status().is_success() && response.status() != reqwest::StatusCode::NOT_FOUND {
            return Err(CoordinatorError::provisioning(format!(
                "deleting meeting {meeting_id} failed with {}",
                response.status()
            )));
        }
        Ok(())
    }
}

/// JupyterHub-style REST implementation of the workspace API, with starter
/// content pushed over the collaborative editor's websocket.
pub struct HttpWorkspaceProvider {
    client: reqwest::Client,
    api_base: String,
    api_token: String,
    editor_ws_base: String,
}

impl HttpWorkspaceProvider {
    pub fn new(config: &WorkspaceConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_base: config.api_base.clone(),
            api_token: config.api_token.clone(),
            editor_ws_base: config.editor_ws_base.clone(),
        }
    }
}

#[derive(Deserialize)]
struct CreateTokenResponse {
    token: String,
}

#[async_trait]
impl WorkspaceProvider for HttpWorkspaceProvider {
    async fn create_workspace(&self, room_id: &str) -> Result<String> {
        let response = self
            .client
            .post(format!("{}/users/{}", self.api_base, room_id))
            .bearer_auth(&self.api_token)
            .send()
            .await?;

        // 409 means the workspace user already exists, which is fine.
        if !response.status().is_success() && response.status() != reqwest::StatusCode::CONFLICT {
            return Err(CoordinatorError::provisioning(format!(
                "workspace creation for {room_id} failed with {}",
                response.status()
            )));
        }

        let response = self
            .client
            .post(format!("{}/users/{}/tokens", self.api_base, room_id))
            .bearer_auth(&self.api_token)
            .json(&json!({ "note": "room session" }))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(CoordinatorError::provisioning(format!(
                "workspace token for {room_id} failed with {}",
                response.status()
            )));
        }

        let token: CreateTokenResponse = response.json().await?;
        Ok(token.token)
    }

    async fn seed_starter_content(&self, room_id: &str, code: &str) -> Result<()> {
        if code.is_empty() {
            return Ok(());
        }

        let url = format!("{}/{}", self.editor_ws_base, room_id);
        let (mut ws, _) = tokio_tungstenite::connect_async(&url)
            .await
            .map_err(|e| CoordinatorError::provisioning(format!("editor connect failed: {e}")))?;

        // Revision 0 insert against a fresh document.
        let edit = json!({
            "Edit": {
                "revision": 0,
                "operation": [code],
            }
        });
        ws.send(WsMessage::Text(edit.to_string()))
            .await
            .map_err(|e| CoordinatorError::provisioning(format!("editor seed failed: {e}")))?;
        ws.close(None).await.ok();
        tracing::debug!(room_id = %room_id, "Seeded starter content");
        Ok(())
    }
}
