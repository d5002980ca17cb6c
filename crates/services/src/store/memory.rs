use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::debug;

use super::{
    RetentionPolicy, SignalStore, StoreResult, require, validate_message, validate_poll,
    validate_reaction,
};
use crate::clock::Clock;
use crate::model::{
    ChatMessage, HandRaise, MeetingId, NewChatMessage, NewPoll, NewReaction, PeerId, PeerRecord,
    PeerRegistration, Poll, PollRecord, Reaction, Registration, Roster, StoredReaction,
    VoteOutcome, messages_since,
};

/// A poll plus its `voter -> option` map.
struct PollEntry {
    record: PollRecord,
    votes: HashMap<String, String>,
}

impl PollEntry {
    fn snapshot(&self) -> Poll {
        self.record.with_votes(&self.votes)
    }
}

/// Chat, polls, hands and reactions of one meeting.
struct EventBucket {
    messages: VecDeque<ChatMessage>,
    polls: Vec<PollEntry>,
    hands: HashMap<PeerId, HandRaise>,
    reactions: VecDeque<StoredReaction>,
    touched_at: DateTime<Utc>,
}

impl EventBucket {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            messages: VecDeque::new(),
            polls: Vec::new(),
            hands: HashMap::new(),
            reactions: VecDeque::new(),
            touched_at: now,
        }
    }

    fn sweep_hands(&mut self, now: DateTime<Utc>, policy: &RetentionPolicy) {
        self.hands
            .retain(|_, hand| now - hand.refreshed_at <= policy.hand_raise_ttl);
    }

    fn sweep_reactions(&mut self, now: DateTime<Utc>, policy: &RetentionPolicy) {
        while let Some(front) = self.reactions.front() {
            if now - front.received_at > policy.reaction_ttl {
                self.reactions.pop_front();
            } else {
                break;
            }
        }
    }
}

/// Process-local store. Each meeting bucket lives behind one dashmap shard
/// lock, so every operation on a bucket is applied atomically.
///
/// State is not shared between processes; run the Redis backend when more
/// than one instance serves the same meetings.
pub struct MemoryStore {
    presence: DashMap<MeetingId, HashMap<PeerId, PeerRecord>>,
    events: DashMap<MeetingId, EventBucket>,
    policy: RetentionPolicy,
    clock: Arc<dyn Clock>,
}

impl MemoryStore {
    pub fn new(policy: RetentionPolicy, clock: Arc<dyn Clock>) -> Self {
        Self {
            presence: DashMap::new(),
            events: DashMap::new(),
            policy,
            clock,
        }
    }

    fn sweep_presence(&self, peers: &mut HashMap<PeerId, PeerRecord>, now: DateTime<Utc>) {
        let window = self.policy.eviction_window;
        peers.retain(|peer_id, record| {
            let keep = !record.is_stale(now, window);
            if !keep {
                debug!(%peer_id, "Evicting stale peer");
            }
            keep
        });
    }

    /// Runs `f` against the meeting's event bucket, creating it if needed.
    fn with_events<T>(&self, meeting_id: &str, f: impl FnOnce(&mut EventBucket, DateTime<Utc>) -> T) -> T {
        let now = self.clock.now();
        let mut bucket = self
            .events
            .entry(meeting_id.to_string())
            .or_insert_with(|| EventBucket::new(now));
        bucket.touched_at = now;
        f(&mut bucket, now)
    }
}

#[async_trait]
impl SignalStore for MemoryStore {
    async fn upsert_peer(&self, meeting_id: &str, peer: PeerRegistration) -> StoreResult<Registration> {
        require("meetingId", meeting_id)?;
        require("peerId", &peer.peer_id)?;

        let now = self.clock.now();
        let mut peers = self.presence.entry(meeting_id.to_string()).or_default();
        self.sweep_presence(&mut peers, now);

        let peer_id = peer.peer_id.clone();
        let joined_at = peers.get(&peer_id).map(|p| p.joined_at);
        peers.insert(peer_id.clone(), peer.into_record(joined_at, now));

        let others = peers
            .values()
            .filter(|p| p.peer_id != peer_id)
            .cloned()
            .collect();
        debug!(%meeting_id, %peer_id, total = peers.len(), "Peer registered");
        Ok(Registration {
            roster: Roster::from_peers(others),
            is_new: joined_at.is_none(),
        })
    }

    async fn lookup(&self, meeting_id: &str) -> StoreResult<Roster> {
        require("meetingId", meeting_id)?;

        let now = self.clock.now();
        let (roster, empty) = match self.presence.get_mut(meeting_id) {
            Some(mut peers) => {
                self.sweep_presence(&mut peers, now);
                (
                    Roster::from_peers(peers.values().cloned().collect()),
                    peers.is_empty(),
                )
            }
            None => return Ok(Roster::default()),
        };
        if empty {
            self.presence.remove_if(meeting_id, |_, peers| peers.is_empty());
        }
        Ok(roster)
    }

    async fn unregister(&self, meeting_id: &str, peer_id: &str) -> StoreResult<bool> {
        require("meetingId", meeting_id)?;
        require("peerId", peer_id)?;

        let (removed, empty) = match self.presence.get_mut(meeting_id) {
            Some(mut peers) => {
                let removed = peers.remove(peer_id).is_some();
                (removed, peers.is_empty())
            }
            None => return Ok(false),
        };
        if empty {
            // Only presence goes; the event bucket may still be read once more.
            self.presence.remove_if(meeting_id, |_, peers| peers.is_empty());
        }
        debug!(%meeting_id, %peer_id, removed, "Peer unregistered");
        Ok(removed)
    }

    async fn post_message(&self, meeting_id: &str, message: NewChatMessage) -> StoreResult<ChatMessage> {
        require("meetingId", meeting_id)?;
        validate_message(&message)?;

        let max = self.policy.max_messages;
        Ok(self.with_events(meeting_id, |bucket, now| {
            let message = message.into_message(now);
            if let Some(existing) = bucket.messages.iter().find(|m| m.id == message.id) {
                return existing.clone();
            }
            bucket.messages.push_back(message.clone());
            while bucket.messages.len() > max {
                bucket.messages.pop_front();
            }
            message
        }))
    }

    async fn list_messages(&self, meeting_id: &str, since_id: Option<&str>) -> StoreResult<Vec<ChatMessage>> {
        let messages: Vec<ChatMessage> = self
            .events
            .get(meeting_id)
            .map(|bucket| bucket.messages.iter().cloned().collect())
            .unwrap_or_default();
        Ok(messages_since(messages, since_id))
    }

    async fn create_poll(&self, meeting_id: &str, poll: NewPoll) -> StoreResult<Poll> {
        require("meetingId", meeting_id)?;
        validate_poll(&poll)?;

        let max = self.policy.max_polls;
        Ok(self.with_events(meeting_id, |bucket, now| {
            let record = poll.into_record(now);
            if let Some(existing) = bucket.polls.iter().find(|p| p.record.id == record.id) {
                return existing.snapshot();
            }
            let entry = PollEntry {
                record,
                votes: HashMap::new(),
            };
            let snapshot = entry.snapshot();
            bucket.polls.push(entry);
            evict_oldest_polls(&mut bucket.polls, max);
            snapshot
        }))
    }

    async fn restore_poll(&self, meeting_id: &str, poll: Poll) -> StoreResult<Poll> {
        require("meetingId", meeting_id)?;
        require("poll.id", &poll.id)?;

        let max = self.policy.max_polls;
        Ok(self.with_events(meeting_id, |bucket, _| {
            if let Some(existing) = bucket.polls.iter().find(|p| p.record.id == poll.id) {
                return existing.snapshot();
            }
            let (record, votes) = PollRecord::from_poll(&poll);
            let entry = PollEntry { record, votes };
            let snapshot = entry.snapshot();
            debug!(%meeting_id, poll_id = %poll.id, "Poll restored from heartbeat");
            bucket.polls.push(entry);
            evict_oldest_polls(&mut bucket.polls, max);
            snapshot
        }))
    }

    async fn list_polls(&self, meeting_id: &str) -> StoreResult<Vec<Poll>> {
        Ok(self
            .events
            .get(meeting_id)
            .map(|bucket| bucket.polls.iter().map(PollEntry::snapshot).collect())
            .unwrap_or_default())
    }

    async fn vote(
        &self,
        meeting_id: &str,
        poll_id: &str,
        option_id: &str,
        voter_key: &str,
    ) -> StoreResult<VoteOutcome> {
        require("voterKey", voter_key)?;

        let Some(mut bucket) = self.events.get_mut(meeting_id) else {
            return Ok(VoteOutcome::UnknownPoll);
        };
        let now = self.clock.now();
        let Some(entry) = bucket.polls.iter_mut().find(|p| p.record.id == poll_id) else {
            return Ok(VoteOutcome::UnknownPoll);
        };
        if !entry.record.has_option(option_id) {
            return Ok(VoteOutcome::UnknownOption);
        }
        let previous = entry
            .votes
            .insert(voter_key.to_string(), option_id.to_string());
        bucket.touched_at = now;
        Ok(VoteOutcome::from_previous(previous, option_id))
    }

    async fn raise_hand(
        &self,
        meeting_id: &str,
        peer_id: &str,
        user_name: &str,
        raised: bool,
    ) -> StoreResult<()> {
        require("meetingId", meeting_id)?;
        require("peerId", peer_id)?;

        self.with_events(meeting_id, |bucket, now| {
            if raised {
                let raised_at = bucket
                    .hands
                    .get(peer_id)
                    .map(|h| h.raised_at)
                    .unwrap_or(now);
                bucket.hands.insert(
                    peer_id.to_string(),
                    HandRaise {
                        peer_id: peer_id.to_string(),
                        user_name: user_name.to_string(),
                        raised_at,
                        refreshed_at: now,
                    },
                );
            } else {
                bucket.hands.remove(peer_id);
            }
        });
        Ok(())
    }

    async fn list_raised_hands(&self, meeting_id: &str) -> StoreResult<Vec<HandRaise>> {
        let now = self.clock.now();
        let mut hands: Vec<HandRaise> = match self.events.get_mut(meeting_id) {
            Some(mut bucket) => {
                bucket.sweep_hands(now, &self.policy);
                bucket.hands.values().cloned().collect()
            }
            None => Vec::new(),
        };
        hands.sort_by(|a, b| a.raised_at.cmp(&b.raised_at));
        Ok(hands)
    }

    async fn post_reaction(&self, meeting_id: &str, reaction: NewReaction) -> StoreResult<Reaction> {
        require("meetingId", meeting_id)?;
        validate_reaction(&reaction)?;

        let policy = &self.policy;
        Ok(self.with_events(meeting_id, |bucket, now| {
            let reaction = reaction.into_reaction(now);
            bucket.sweep_reactions(now, policy);
            bucket.reactions.push_back(StoredReaction {
                received_at: now,
                reaction: reaction.clone(),
            });
            while bucket.reactions.len() > policy.max_reactions {
                bucket.reactions.pop_front();
            }
            reaction
        }))
    }

    async fn list_reactions(&self, meeting_id: &str) -> StoreResult<Vec<Reaction>> {
        let now = self.clock.now();
        Ok(match self.events.get_mut(meeting_id) {
            Some(mut bucket) => {
                bucket.sweep_reactions(now, &self.policy);
                bucket.reactions.iter().map(|r| r.reaction.clone()).collect()
            }
            None => Vec::new(),
        })
    }

    async fn sweep_idle(&self) -> StoreResult<usize> {
        let now = self.clock.now();
        let idle = self.policy.idle_bucket_ttl;
        let window = self.policy.eviction_window;

        let before = self.events.len() + self.presence.len();
        self.events.retain(|_, bucket| now - bucket.touched_at <= idle);
        self.presence.retain(|_, peers| {
            peers.retain(|_, record| !record.is_stale(now, window));
            !peers.is_empty()
        });
        let removed = before - (self.events.len() + self.presence.len());
        if removed > 0 {
            debug!(removed, "Swept idle meeting buckets");
        }
        Ok(removed)
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}

fn evict_oldest_polls(polls: &mut Vec<PollEntry>, max: usize) {
    while polls.len() > max {
        let oldest = polls
            .iter()
            .enumerate()
            .min_by_key(|(_, p)| p.record.created_at)
            .map(|(idx, _)| idx);
        match oldest {
            Some(idx) => {
                polls.remove(idx);
            }
            None => break,
        }
    }
}
