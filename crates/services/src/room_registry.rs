use std::collections::HashSet;

use dashmap::DashMap;
use serde::Serialize;
use tracing::debug;

use crate::model::{MeetingId, PeerRecord};

/// Server-assigned id of one push connection (one WebSocket).
pub type ConnectionId = String;

/// A push-binding participant: one connection inside one meeting.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub connection_id: ConnectionId,
    pub meeting_id: MeetingId,
    #[serde(flatten)]
    pub peer: PeerRecord,
    pub audio_enabled: bool,
    pub video_enabled: bool,
    pub screen_sharing: bool,
}

/// Someone who left, and who is still in the room to be told.
#[derive(Debug, Clone)]
pub struct Departure {
    pub participant: Participant,
    pub remaining: Vec<ConnectionId>,
}

#[derive(Debug, Clone)]
pub struct JoinOutcome {
    /// Everyone already in the meeting, excluding the joiner.
    pub existing: Vec<Participant>,
    /// Set when the connection was in another meeting and got moved.
    pub previous: Option<Departure>,
}

/// Roster for the push binding.
///
/// Two explicit tables: `ConnectionId -> Participant` and
/// `MeetingId -> {ConnectionId}`. Removal always touches the connection
/// table first and the meeting index second; no guard on one map is held
/// while the other is locked.
pub struct RoomRegistry {
    connections: DashMap<ConnectionId, Participant>,
    meetings: DashMap<MeetingId, HashSet<ConnectionId>>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self {
            connections: DashMap::new(),
            meetings: DashMap::new(),
        }
    }

    pub fn join(&self, connection_id: &str, meeting_id: &str, peer: PeerRecord) -> JoinOutcome {
        let previous = match self.meeting_of(connection_id) {
            Some(current) if current == meeting_id => {
                // Re-join of the same meeting only refreshes the record.
                if let Some(mut participant) = self.connections.get_mut(connection_id) {
                    participant.peer = peer;
                }
                return JoinOutcome {
                    existing: self.others(meeting_id, connection_id),
                    previous: None,
                };
            }
            Some(_) => self.leave(connection_id),
            None => None,
        };

        let existing = self.others(meeting_id, connection_id);

        self.connections.insert(
            connection_id.to_string(),
            Participant {
                connection_id: connection_id.to_string(),
                meeting_id: meeting_id.to_string(),
                peer,
                audio_enabled: true,
                video_enabled: true,
                screen_sharing: false,
            },
        );
        self.meetings
            .entry(meeting_id.to_string())
            .or_default()
            .insert(connection_id.to_string());

        debug!(%meeting_id, %connection_id, existing = existing.len(), "Connection joined meeting");
        JoinOutcome { existing, previous }
    }

    /// Removes the connection. Step one drops the participant record, step
    /// two drops it from the meeting index (and the index entry when empty).
    pub fn leave(&self, connection_id: &str) -> Option<Departure> {
        let (_, participant) = self.connections.remove(connection_id)?;
        let meeting_id = participant.meeting_id.clone();

        let remaining: Vec<ConnectionId> = match self.meetings.get_mut(&meeting_id) {
            Some(mut members) => {
                members.remove(connection_id);
                members.iter().cloned().collect()
            }
            None => Vec::new(),
        };
        if remaining.is_empty() {
            self.meetings.remove_if(&meeting_id, |_, members| members.is_empty());
        }

        debug!(%meeting_id, %connection_id, remaining = remaining.len(), "Connection left meeting");
        Some(Departure {
            participant,
            remaining,
        })
    }

    pub fn meeting_of(&self, connection_id: &str) -> Option<MeetingId> {
        self.connections
            .get(connection_id)
            .map(|p| p.meeting_id.clone())
    }

    pub fn participant(&self, connection_id: &str) -> Option<Participant> {
        self.connections.get(connection_id).map(|p| p.clone())
    }

    /// Connection ids in a meeting.
    pub fn members(&self, meeting_id: &str) -> Vec<ConnectionId> {
        self.meetings
            .get(meeting_id)
            .map(|members| members.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Participants in a meeting other than `except`.
    pub fn others(&self, meeting_id: &str, except: &str) -> Vec<Participant> {
        let mut others: Vec<Participant> = self
            .members(meeting_id)
            .into_iter()
            .filter(|cid| cid != except)
            .filter_map(|cid| self.participant(&cid))
            .collect();
        others.sort_by(|a, b| a.peer.joined_at.cmp(&b.peer.joined_at));
        others
    }

    pub fn update_media(&self, connection_id: &str, audio: bool, video: bool) -> Option<Participant> {
        let mut participant = self.connections.get_mut(connection_id)?;
        participant.audio_enabled = audio;
        participant.video_enabled = video;
        Some(participant.clone())
    }

    pub fn set_screen_sharing(&self, connection_id: &str, sharing: bool) -> Option<Participant> {
        let mut participant = self.connections.get_mut(connection_id)?;
        participant.screen_sharing = sharing;
        Some(participant.clone())
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn meeting_count(&self) -> usize {
        self.meetings.len()
    }
}

impl Default for RoomRegistry {
    fn default() -> Self {
        Self::new()
    }
}
