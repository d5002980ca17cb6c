use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Opaque key partitioning all presence and event state.
pub type MeetingId = String;

/// Transport-level identifier handed out by the WebRTC library.
pub type PeerId = String;

/// Builds a time-prefixed random id, e.g. `1718000000000-V1StGXR8`.
pub fn generate_id(now: DateTime<Utc>) -> String {
    format!("{}-{}", now.timestamp_millis(), nanoid::nanoid!(8))
}

// ============================================
// Presence
// ============================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerRecord {
    pub peer_id: PeerId,
    #[serde(rename = "userName")]
    pub display_name: String,
    #[serde(rename = "userEmail", default, skip_serializing_if = "Option::is_none")]
    pub contact_handle: Option<String>,
    pub joined_at: DateTime<Utc>,
    #[serde(rename = "lastSeen")]
    pub last_seen_at: DateTime<Utc>,
}

impl PeerRecord {
    pub fn is_stale(&self, now: DateTime<Utc>, window: Duration) -> bool {
        now - self.last_seen_at > window
    }
}

/// What a peer supplies when it registers or heartbeats.
#[derive(Debug, Clone)]
pub struct PeerRegistration {
    pub peer_id: PeerId,
    pub display_name: String,
    pub contact_handle: Option<String>,
}

impl PeerRegistration {
    pub fn new(peer_id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            peer_id: peer_id.into(),
            display_name: display_name.into(),
            contact_handle: None,
        }
    }

    pub fn with_contact(mut self, handle: impl Into<String>) -> Self {
        self.contact_handle = Some(handle.into());
        self
    }

    /// Produces the stored record. `joined_at` survives re-registration.
    pub fn into_record(self, joined_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> PeerRecord {
        PeerRecord {
            peer_id: self.peer_id,
            display_name: self.display_name,
            contact_handle: self.contact_handle,
            joined_at: joined_at.unwrap_or(now),
            last_seen_at: now,
        }
    }
}

/// A roster as observed by one caller.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Roster {
    pub peers: Vec<PeerRecord>,
    pub count: usize,
}

impl Roster {
    /// Sorts by join time so every caller sees the same order.
    pub fn from_peers(mut peers: Vec<PeerRecord>) -> Self {
        peers.sort_by(|a, b| {
            a.joined_at
                .cmp(&b.joined_at)
                .then_with(|| a.peer_id.cmp(&b.peer_id))
        });
        let count = peers.len();
        Self { peers, count }
    }

    pub fn contains(&self, peer_id: &str) -> bool {
        self.peers.iter().any(|p| p.peer_id == peer_id)
    }
}

/// Result of an upsert: the caller's roster and whether the caller had no
/// live record before this write.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Registration {
    pub roster: Roster,
    pub is_new: bool,
}

// ============================================
// Chat
// ============================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: String,
    pub author_name: String,
    pub body: String,
    pub sent_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_preview: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewChatMessage {
    #[serde(default)]
    pub id: Option<String>,
    pub author_name: String,
    pub body: String,
    #[serde(default)]
    pub sent_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub reply_to_id: Option<String>,
    #[serde(default)]
    pub reply_preview: Option<String>,
}

impl NewChatMessage {
    pub fn new(author_name: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            author_name: author_name.into(),
            body: body.into(),
            ..Default::default()
        }
    }

    pub fn into_message(self, now: DateTime<Utc>) -> ChatMessage {
        ChatMessage {
            id: self.id.filter(|id| !id.is_empty()).unwrap_or_else(|| generate_id(now)),
            author_name: self.author_name,
            body: self.body,
            sent_at: self.sent_at.unwrap_or(now),
            reply_to_id: self.reply_to_id,
            reply_preview: self.reply_preview,
        }
    }
}

/// Returns everything stored after `since_id`, ordered by `sent_at`.
///
/// `messages` must be in append order. The cursor is located in that order,
/// since `sent_at` is client-supplied and may run behind earlier messages.
/// An unknown `since_id` (evicted or never seen) yields the full list so the
/// caller can re-merge by id.
pub fn messages_since(mut messages: Vec<ChatMessage>, since_id: Option<&str>) -> Vec<ChatMessage> {
    let mut out = match since_id.and_then(|since| messages.iter().position(|m| m.id == since)) {
        Some(pos) => messages.split_off(pos + 1),
        None => messages,
    };
    out.sort_by(|a, b| a.sent_at.cmp(&b.sent_at));
    out
}

// ============================================
// Polls
// ============================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PollOption {
    pub id: String,
    pub text: String,
    #[serde(default)]
    pub voters: Vec<String>,
}

impl PollOption {
    pub fn vote_count(&self) -> usize {
        self.voters.len()
    }
}

/// Wire shape of a poll. Voter lists are derived from [`PollRecord`] votes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Poll {
    pub id: String,
    pub question: String,
    pub options: Vec<PollOption>,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
}

impl Poll {
    pub fn total_votes(&self) -> usize {
        self.options.iter().map(PollOption::vote_count).sum()
    }

    pub fn option(&self, option_id: &str) -> Option<&PollOption> {
        self.options.iter().find(|o| o.id == option_id)
    }

    /// The option this voter currently backs, if any.
    pub fn choice_of(&self, voter_key: &str) -> Option<&str> {
        self.options
            .iter()
            .find(|o| o.voters.iter().any(|v| v == voter_key))
            .map(|o| o.id.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PollChoice {
    pub id: String,
    pub text: String,
}

/// Poll as stored: the question and options, without votes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PollRecord {
    pub id: String,
    pub question: String,
    pub options: Vec<PollChoice>,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
}

impl PollRecord {
    pub fn has_option(&self, option_id: &str) -> bool {
        self.options.iter().any(|o| o.id == option_id)
    }

    /// Joins the record with a `voter -> option` map. A voter can only ever
    /// land in one option because the map holds one entry per voter.
    pub fn with_votes(&self, votes: &HashMap<String, String>) -> Poll {
        let options = self
            .options
            .iter()
            .map(|choice| {
                let mut voters: Vec<String> = votes
                    .iter()
                    .filter(|(_, option_id)| **option_id == choice.id)
                    .map(|(voter, _)| voter.clone())
                    .collect();
                voters.sort();
                PollOption {
                    id: choice.id.clone(),
                    text: choice.text.clone(),
                    voters,
                }
            })
            .collect();

        Poll {
            id: self.id.clone(),
            question: self.question.clone(),
            options,
            created_by: self.created_by.clone(),
            created_at: self.created_at,
        }
    }

    /// Splits a full poll (e.g. from a poll heartbeat) back into record and
    /// votes. A voter listed under several options keeps the first.
    pub fn from_poll(poll: &Poll) -> (Self, HashMap<String, String>) {
        let mut votes = HashMap::new();
        for option in &poll.options {
            for voter in &option.voters {
                votes.entry(voter.clone()).or_insert_with(|| option.id.clone());
            }
        }
        let record = Self {
            id: poll.id.clone(),
            question: poll.question.clone(),
            options: poll
                .options
                .iter()
                .map(|o| PollChoice {
                    id: o.id.clone(),
                    text: o.text.clone(),
                })
                .collect(),
            created_by: poll.created_by.clone(),
            created_at: poll.created_at,
        };
        (record, votes)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewPollOption {
    #[serde(default)]
    pub id: Option<String>,
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewPoll {
    #[serde(default)]
    pub id: Option<String>,
    pub question: String,
    pub options: Vec<NewPollOption>,
    pub created_by: String,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

impl NewPoll {
    pub fn new(question: impl Into<String>, options: &[&str], created_by: impl Into<String>) -> Self {
        Self {
            id: None,
            question: question.into(),
            options: options
                .iter()
                .map(|text| NewPollOption {
                    id: None,
                    text: (*text).to_string(),
                })
                .collect(),
            created_by: created_by.into(),
            created_at: None,
        }
    }

    pub fn into_record(self, now: DateTime<Utc>) -> PollRecord {
        let options = self
            .options
            .into_iter()
            .enumerate()
            .map(|(idx, o)| PollChoice {
                id: o.id.filter(|id| !id.is_empty()).unwrap_or_else(|| format!("opt-{}", idx)),
                text: o.text,
            })
            .collect();
        PollRecord {
            id: self.id.filter(|id| !id.is_empty()).unwrap_or_else(|| generate_id(now)),
            question: self.question,
            options,
            created_by: self.created_by,
            created_at: self.created_at.unwrap_or(now),
        }
    }
}

/// Result of a vote call. Unknown poll or option is reported, not raised.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum VoteOutcome {
    Recorded,
    Moved { from: String },
    Unchanged,
    UnknownPoll,
    UnknownOption,
}

impl VoteOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Recorded | Self::Moved { .. } | Self::Unchanged)
    }

    /// Machine-readable code for a refused vote, carried in error bodies.
    pub fn rejection_code(&self) -> Option<&'static str> {
        match self {
            Self::UnknownPoll => Some("unknown_poll"),
            Self::UnknownOption => Some("unknown_option"),
            _ => None,
        }
    }

    pub fn from_rejection_code(code: &str) -> Option<Self> {
        match code {
            "unknown_poll" => Some(Self::UnknownPoll),
            "unknown_option" => Some(Self::UnknownOption),
            _ => None,
        }
    }

    /// Classifies a write given the option the voter held before it.
    pub fn from_previous(previous: Option<String>, option_id: &str) -> Self {
        match previous {
            None => Self::Recorded,
            Some(prev) if prev == option_id => Self::Unchanged,
            Some(prev) => Self::Moved { from: prev },
        }
    }
}

// ============================================
// Hand raises and reactions
// ============================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandRaise {
    pub peer_id: PeerId,
    pub user_name: String,
    pub raised_at: DateTime<Utc>,
    pub refreshed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reaction {
    pub id: String,
    pub emoji: String,
    pub author_name: String,
    pub sent_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewReaction {
    #[serde(default)]
    pub id: Option<String>,
    pub emoji: String,
    pub author_name: String,
    #[serde(default)]
    pub sent_at: Option<DateTime<Utc>>,
}

impl NewReaction {
    pub fn new(emoji: impl Into<String>, author_name: impl Into<String>) -> Self {
        Self {
            emoji: emoji.into(),
            author_name: author_name.into(),
            ..Default::default()
        }
    }

    pub fn into_reaction(self, now: DateTime<Utc>) -> Reaction {
        Reaction {
            id: self.id.filter(|id| !id.is_empty()).unwrap_or_else(|| generate_id(now)),
            emoji: self.emoji,
            author_name: self.author_name,
            sent_at: self.sent_at.unwrap_or(now),
        }
    }
}

/// A reaction plus the server time it arrived. Retention is measured from
/// arrival so client clock skew cannot extend or cut it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredReaction {
    pub received_at: DateTime<Utc>,
    pub reaction: Reaction,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(id: &str, secs: i64) -> ChatMessage {
        let base = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        ChatMessage {
            id: id.to_string(),
            author_name: "ann".to_string(),
            body: id.to_string(),
            sent_at: base + Duration::seconds(secs),
            reply_to_id: None,
            reply_preview: None,
        }
    }

    #[test]
    fn messages_since_orders_by_sent_at() {
        let out = messages_since(vec![msg("b", 2), msg("a", 1), msg("c", 3)], None);
        let ids: Vec<_> = out.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }

    #[test]
    fn messages_since_skips_through_cursor() {
        let out = messages_since(vec![msg("a", 1), msg("b", 2), msg("c", 3)], Some("a"));
        let ids: Vec<_> = out.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "c"]);
    }

    #[test]
    fn messages_since_uses_append_order_for_cursor() {
        // "late" was appended after "a" but carries an older timestamp.
        let out = messages_since(vec![msg("a", 5), msg("late", 1), msg("b", 6)], Some("a"));
        let ids: Vec<_> = out.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["late", "b"]);
    }

    #[test]
    fn messages_since_unknown_cursor_returns_all() {
        let out = messages_since(vec![msg("a", 1), msg("b", 2)], Some("gone"));
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn rejection_codes_map_back_to_outcomes() {
        for outcome in [VoteOutcome::UnknownPoll, VoteOutcome::UnknownOption] {
            let code = outcome.rejection_code().unwrap();
            assert_eq!(VoteOutcome::from_rejection_code(code), Some(outcome));
        }
        assert_eq!(VoteOutcome::Unchanged.rejection_code(), None);
        assert_eq!(VoteOutcome::from_rejection_code("nope"), None);
    }

    #[test]
    fn poll_record_assigns_option_ids() {
        let record = NewPoll::new("Lunch?", &["pizza", "sushi"], "ann").into_record(Utc::now());
        assert_eq!(record.options[0].id, "opt-0");
        assert_eq!(record.options[1].id, "opt-1");
        assert!(!record.id.is_empty());
    }

    #[test]
    fn from_poll_keeps_first_option_for_double_listed_voter() {
        let record = NewPoll::new("Q", &["a", "b"], "ann").into_record(Utc::now());
        let mut poll = record.with_votes(&HashMap::new());
        poll.options[0].voters.push("bob".into());
        poll.options[1].voters.push("bob".into());

        let (_, votes) = PollRecord::from_poll(&poll);
        assert_eq!(votes.get("bob").map(String::as_str), Some("opt-0"));
        assert_eq!(record.with_votes(&votes).total_votes(), 1);
    }

    #[test]
    fn vote_outcome_classification() {
        assert_eq!(VoteOutcome::from_previous(None, "a"), VoteOutcome::Recorded);
        assert_eq!(
            VoteOutcome::from_previous(Some("a".into()), "a"),
            VoteOutcome::Unchanged
        );
        assert_eq!(
            VoteOutcome::from_previous(Some("a".into()), "b"),
            VoteOutcome::Moved { from: "a".into() }
        );
    }

    #[test]
    fn peer_record_wire_names() {
        let now = Utc::now();
        let record = PeerRegistration::new("p1", "Ann")
            .with_contact("ann@example.com")
            .into_record(None, now);
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["peerId"], "p1");
        assert_eq!(json["userName"], "Ann");
        assert_eq!(json["userEmail"], "ann@example.com");
        assert!(json.get("lastSeen").is_some());
    }
}
