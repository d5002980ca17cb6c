use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Serialize;
use tracing::{debug, info};

use crate::model::MeetingId;

/// Answer from the meeting-participant authorization check.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Admission {
    pub is_allowed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl Admission {
    pub fn allowed() -> Self {
        Self {
            is_allowed: true,
            reason: None,
        }
    }

    pub fn denied(reason: impl Into<String>) -> Self {
        Self {
            is_allowed: false,
            reason: Some(reason.into()),
        }
    }
}

/// External meeting/participant document store. The signaling core asks it
/// who may join and tells it who did; it never owns that data.
#[async_trait]
pub trait MeetingDirectory: Send + Sync + 'static {
    async fn validate_participant(
        &self,
        meeting_id: &str,
        contact_handle: Option<&str>,
    ) -> anyhow::Result<Admission>;

    async fn add_participant(
        &self,
        meeting_id: &str,
        contact_handle: Option<&str>,
        display_name: &str,
    ) -> anyhow::Result<()>;
}

/// Admits everyone. Roster writes are only logged.
#[derive(Debug, Default, Clone, Copy)]
pub struct OpenDirectory;

#[async_trait]
impl MeetingDirectory for OpenDirectory {
    async fn validate_participant(
        &self,
        _meeting_id: &str,
        _contact_handle: Option<&str>,
    ) -> anyhow::Result<Admission> {
        Ok(Admission::allowed())
    }

    async fn add_participant(
        &self,
        meeting_id: &str,
        contact_handle: Option<&str>,
        display_name: &str,
    ) -> anyhow::Result<()> {
        debug!(%meeting_id, ?contact_handle, %display_name, "Participant joined");
        Ok(())
    }
}

/// Static allow-lists per meeting. Meetings without a list admit everyone.
/// Handles compare case-insensitively.
pub struct AllowListDirectory {
    allowed: HashMap<MeetingId, HashSet<String>>,
    joined: DashMap<MeetingId, HashSet<String>>,
}

impl AllowListDirectory {
    pub fn new(allowed: HashMap<MeetingId, Vec<String>>) -> Self {
        let allowed = allowed
            .into_iter()
            .map(|(meeting, handles)| {
                let handles = handles.into_iter().map(|h| h.trim().to_lowercase()).collect();
                (meeting, handles)
            })
            .collect();
        Self {
            allowed,
            joined: DashMap::new(),
        }
    }

    /// Contact handles recorded as having joined a meeting.
    pub fn participants(&self, meeting_id: &str) -> Vec<String> {
        let mut handles: Vec<String> = self
            .joined
            .get(meeting_id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        handles.sort();
        handles
    }
}

#[async_trait]
impl MeetingDirectory for AllowListDirectory {
    async fn validate_participant(
        &self,
        meeting_id: &str,
        contact_handle: Option<&str>,
    ) -> anyhow::Result<Admission> {
        let Some(list) = self.allowed.get(meeting_id) else {
            return Ok(Admission::allowed());
        };
        let Some(handle) = contact_handle.map(|h| h.trim().to_lowercase()) else {
            return Ok(Admission::denied(
                "This meeting requires an invited email address",
            ));
        };
        if list.contains(&handle) {
            Ok(Admission::allowed())
        } else {
            info!(%meeting_id, %handle, "Participant refused by allow-list");
            Ok(Admission::denied("You are not invited to this meeting"))
        }
    }

    async fn add_participant(
        &self,
        meeting_id: &str,
        contact_handle: Option<&str>,
        display_name: &str,
    ) -> anyhow::Result<()> {
        if let Some(handle) = contact_handle {
            self.joined
                .entry(meeting_id.to_string())
                .or_default()
                .insert(handle.trim().to_lowercase());
        }
        debug!(%meeting_id, ?contact_handle, %display_name, "Participant recorded");
        Ok(())
    }
}
