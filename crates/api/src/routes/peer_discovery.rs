use axum::{
    Json,
    extract::{Query, State, rejection::{JsonRejection, QueryRejection}},
};
use rendezvous_services::model::{PeerRegistration, Registration};
use serde::Deserialize;
use tracing::{info, warn};

use crate::{error::ApiError, state::AppState};

#[derive(Debug, Deserialize)]
pub struct MeetingQuery {
    #[serde(rename = "meetingId")]
    pub meeting_id: Option<String>,
}

impl MeetingQuery {
    fn require(self) -> Result<String, ApiError> {
        self.meeting_id
            .filter(|id| !id.trim().is_empty())
            .ok_or_else(|| ApiError::BadRequest("meetingId is required".to_string()))
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterPeerRequest {
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub user_name: Option<String>,
    #[serde(default)]
    pub user_email: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnregisterPeerRequest {
    #[serde(default)]
    pub user_id: Option<String>,
}

fn require_peer_id(user_id: Option<String>) -> Result<String, ApiError> {
    user_id
        .filter(|id| !id.trim().is_empty())
        .ok_or_else(|| ApiError::BadRequest("userId is required".to_string()))
}

/// Registers or heartbeats a peer and returns everyone else in the meeting.
pub async fn register(
    State(state): State<AppState>,
    query: Result<Query<MeetingQuery>, QueryRejection>,
    body: Result<Json<RegisterPeerRequest>, JsonRejection>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let Query(query) = query?;
    let meeting_id = query.require()?;
    let Json(body) = body?;
    let peer_id = require_peer_id(body.user_id)?;
    let user_name = body.user_name.unwrap_or_default();
    let user_email = body.user_email.filter(|e| !e.trim().is_empty());

    if let Some(email) = user_email.as_deref() {
        let admission = state
            .directory
            .validate_participant(&meeting_id, Some(email))
            .await?;
        if !admission.is_allowed {
            return Err(ApiError::Forbidden(
                admission
                    .reason
                    .unwrap_or_else(|| "Not allowed to join this meeting".to_string()),
            ));
        }
    }

    let mut registration = PeerRegistration::new(peer_id.clone(), user_name.clone());
    if let Some(email) = user_email.clone() {
        registration = registration.with_contact(email);
    }
    let Registration { roster, is_new } = state.store.upsert_peer(&meeting_id, registration).await?;

    if is_new {
        info!(%meeting_id, %peer_id, "Peer registered");
        if let Err(e) = state
            .directory
            .add_participant(&meeting_id, user_email.as_deref(), &user_name)
            .await
        {
            warn!(%meeting_id, %peer_id, %e, "Failed to record participant");
        }
    }

    Ok(Json(serde_json::json!({
        "success": true,
        "peers": roster.peers,
        "totalPeers": roster.count,
    })))
}

pub async fn lookup(
    State(state): State<AppState>,
    query: Result<Query<MeetingQuery>, QueryRejection>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let Query(query) = query?;
    let meeting_id = query.require()?;
    let roster = state.store.lookup(&meeting_id).await?;

    Ok(Json(serde_json::json!({
        "success": true,
        "peers": roster.peers,
        "totalPeers": roster.count,
    })))
}

pub async fn unregister(
    State(state): State<AppState>,
    query: Result<Query<MeetingQuery>, QueryRejection>,
    body: Result<Json<UnregisterPeerRequest>, JsonRejection>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let Query(query) = query?;
    let meeting_id = query.require()?;
    let Json(body) = body?;
    let peer_id = require_peer_id(body.user_id)?;

    let removed = state.store.unregister(&meeting_id, &peer_id).await?;
    let message = if removed {
        info!(%meeting_id, %peer_id, "Peer unregistered");
        "Peer removed"
    } else {
        "Peer not registered"
    };

    Ok(Json(serde_json::json!({
        "success": true,
        "message": message,
    })))
}
