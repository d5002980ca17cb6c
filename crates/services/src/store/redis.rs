use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Duration;
use redis::AsyncCommands;
use redis::Script;
use redis::aio::ConnectionManager;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};

use super::{
    RetentionPolicy, SignalStore, StoreResult, require, validate_message, validate_poll,
    validate_reaction,
};
use crate::clock::Clock;
use crate::model::{
    ChatMessage, HandRaise, NewChatMessage, NewPoll, NewReaction, PeerRecord, PeerRegistration,
    Poll, PollRecord, Reaction, Registration, Roster, StoredReaction, VoteOutcome, messages_since,
};

/// Redis-backed store for multi-instance deployments.
///
/// Key layout, all under `{prefix}:{meeting}`:
/// - `:peers`      hash  peerId -> PeerRecord
/// - `:messages`   list  ChatMessage, trimmed to `max_messages`
/// - `:polls`      hash  pollId -> PollRecord
/// - `:votes:{id}` hash  voterKey -> optionId
/// - `:hands`      hash  peerId -> HandRaise
/// - `:reactions`  list  StoredReaction, trimmed to `max_reactions`
///
/// Whole keys carry a native TTL (eviction window for presence, idle TTL for
/// events); individual records are still filtered against the clock on read.
/// Check-and-write steps run as Lua scripts so concurrent writers on other
/// instances cannot interleave with them.
pub struct RedisStore {
    conn: ConnectionManager,
    prefix: String,
    policy: RetentionPolicy,
    clock: Arc<dyn Clock>,
    append_message: Script,
    evict_peers: Script,
}

/// KEYS[1] message list. ARGV: id, json, max, ttl.
/// Returns the stored entry when the id is already present, nil after a push.
const APPEND_MESSAGE_LUA: &str = r#"
local entries = redis.call('LRANGE', KEYS[1], 0, -1)
for _, raw in ipairs(entries) do
  local ok, entry = pcall(cjson.decode, raw)
  if ok and type(entry) == 'table' and entry.id == ARGV[1] then
    return raw
  end
end
redis.call('RPUSH', KEYS[1], ARGV[2])
redis.call('LTRIM', KEYS[1], -tonumber(ARGV[3]), -1)
redis.call('EXPIRE', KEYS[1], ARGV[4])
return false
"#;

/// KEYS[1] peers hash. ARGV: pairs of peerId, json as read.
/// Deletes a field only if it still holds the json that was judged stale.
const EVICT_PEERS_LUA: &str = r#"
local removed = 0
for i = 1, #ARGV, 2 do
  if redis.call('HGET', KEYS[1], ARGV[i]) == ARGV[i + 1] then
    redis.call('HDEL', KEYS[1], ARGV[i])
    removed = removed + 1
  end
end
return removed
"#;

impl RedisStore {
    pub async fn connect(
        url: &str,
        prefix: String,
        policy: RetentionPolicy,
        clock: Arc<dyn Clock>,
    ) -> StoreResult<Self> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        info!(%url, %prefix, "Connected to Redis");
        Ok(Self {
            conn,
            prefix,
            policy,
            clock,
            append_message: Script::new(APPEND_MESSAGE_LUA),
            evict_peers: Script::new(EVICT_PEERS_LUA),
        })
    }

    fn key(&self, meeting_id: &str, suffix: &str) -> String {
        format!("{}:{}:{}", self.prefix, meeting_id, suffix)
    }

    fn votes_key(&self, meeting_id: &str, poll_id: &str) -> String {
        format!("{}:{}:votes:{}", self.prefix, meeting_id, poll_id)
    }

    fn idle_secs(&self) -> i64 {
        ttl_secs(self.policy.idle_bucket_ttl)
    }

    async fn read_hash<T: DeserializeOwned>(&self, key: &str) -> StoreResult<HashMap<String, T>> {
        let mut conn = self.conn.clone();
        let raw: HashMap<String, String> = conn.hgetall(key).await?;
        Ok(raw
            .into_iter()
            .filter_map(|(field, json)| match serde_json::from_str(&json) {
                Ok(value) => Some((field, value)),
                Err(e) => {
                    warn!(%key, %field, %e, "Skipping undecodable hash entry");
                    None
                }
            })
            .collect())
    }

    async fn read_list<T: DeserializeOwned>(&self, key: &str) -> StoreResult<Vec<T>> {
        let mut conn = self.conn.clone();
        let raw: Vec<String> = conn.lrange(key, 0, -1).await?;
        Ok(raw
            .iter()
            .filter_map(|json| match serde_json::from_str(json) {
                Ok(value) => Some(value),
                Err(e) => {
                    warn!(%key, %e, "Skipping undecodable list entry");
                    None
                }
            })
            .collect())
    }

    /// Presence records split into live and stale, each stale one paired with
    /// the json it was read as.
    async fn read_peers(&self, key: &str) -> StoreResult<(Vec<PeerRecord>, Vec<(PeerRecord, String)>)> {
        let mut conn = self.conn.clone();
        let raw: HashMap<String, String> = conn.hgetall(key).await?;
        let now = self.clock.now();
        let mut live = Vec::new();
        let mut stale = Vec::new();
        for (field, json) in raw {
            match serde_json::from_str::<PeerRecord>(&json) {
                Ok(peer) if peer.is_stale(now, self.policy.eviction_window) => stale.push((peer, json)),
                Ok(peer) => live.push(peer),
                Err(e) => warn!(%key, %field, %e, "Skipping undecodable peer record"),
            }
        }
        Ok((live, stale))
    }

    /// Deletes stale records unless a heartbeat replaced them since they were read.
    async fn evict_stale_peers(&self, key: &str, stale: &[(PeerRecord, String)]) -> StoreResult<usize> {
        if stale.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn.clone();
        let mut invocation = self.evict_peers.key(key);
        for (peer, json) in stale {
            invocation.arg(&peer.peer_id).arg(json);
        }
        let removed: usize = invocation.invoke_async(&mut conn).await?;
        Ok(removed)
    }

    /// Pushes onto a capped list and refreshes its TTL in one round trip.
    async fn push_capped<T: Serialize>(&self, key: &str, value: &T, max: usize, ttl: i64) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        let json = serde_json::to_string(value)?;
        let _: () = redis::pipe()
            .atomic()
            .rpush(key, json)
            .ignore()
            .ltrim(key, -(max as isize), -1)
            .ignore()
            .expire(key, ttl)
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn load_poll(&self, meeting_id: &str, record: &PollRecord) -> StoreResult<Poll> {
        let mut conn = self.conn.clone();
        let votes: HashMap<String, String> =
            conn.hgetall(self.votes_key(meeting_id, &record.id)).await?;
        Ok(record.with_votes(&votes))
    }

    /// Inserts a poll record (and optional votes) unless the id exists.
    /// Returns false when the poll was already present.
    async fn insert_poll(
        &self,
        meeting_id: &str,
        record: &PollRecord,
        votes: &HashMap<String, String>,
    ) -> StoreResult<bool> {
        let mut conn = self.conn.clone();
        let polls_key = self.key(meeting_id, "polls");
        let inserted: bool = conn
            .hset_nx(&polls_key, &record.id, serde_json::to_string(record)?)
            .await?;
        if !inserted {
            return Ok(false);
        }

        let votes_key = self.votes_key(meeting_id, &record.id);
        let mut pipe = redis::pipe();
        pipe.expire(&polls_key, self.idle_secs()).ignore();
        if !votes.is_empty() {
            let pairs: Vec<(&String, &String)> = votes.iter().collect();
            pipe.hset_multiple(&votes_key, &pairs[..])
                .ignore()
                .expire(&votes_key, self.idle_secs())
                .ignore();
        }
        let _: () = pipe.query_async(&mut conn).await?;

        self.evict_oldest_polls(meeting_id).await?;
        Ok(true)
    }

    async fn evict_oldest_polls(&self, meeting_id: &str) -> StoreResult<()> {
        let polls_key = self.key(meeting_id, "polls");
        let mut conn = self.conn.clone();
        let len: usize = conn.hlen(&polls_key).await?;
        if len <= self.policy.max_polls {
            return Ok(());
        }

        let mut records: Vec<PollRecord> = self.read_hash(&polls_key).await?.into_values().collect();
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        let excess = records.len().saturating_sub(self.policy.max_polls);
        for record in records.iter().take(excess) {
            let _: () = redis::pipe()
                .hdel(&polls_key, &record.id)
                .ignore()
                .del(self.votes_key(meeting_id, &record.id))
                .ignore()
                .query_async(&mut conn)
                .await?;
            debug!(%meeting_id, poll_id = %record.id, "Evicted oldest poll");
        }
        Ok(())
    }
}

fn ttl_secs(duration: Duration) -> i64 {
    duration.num_seconds().max(1)
}

#[async_trait]
impl SignalStore for RedisStore {
    async fn upsert_peer(&self, meeting_id: &str, peer: PeerRegistration) -> StoreResult<Registration> {
        require("meetingId", meeting_id)?;
        require("peerId", &peer.peer_id)?;

        let now = self.clock.now();
        let key = self.key(meeting_id, "peers");

        let (live, stale) = self.read_peers(&key).await?;
        let evicted = self.evict_stale_peers(&key, &stale).await?;

        let peer_id = peer.peer_id.clone();
        let joined_at = live.iter().find(|p| p.peer_id == peer_id).map(|p| p.joined_at);
        let record = peer.into_record(joined_at, now);

        // HSET counts created fields; a stale field was evicted above.
        let mut conn = self.conn.clone();
        let (created,): (usize,) = redis::pipe()
            .atomic()
            .hset(&key, &peer_id, serde_json::to_string(&record)?)
            .expire(&key, ttl_secs(self.policy.eviction_window))
            .ignore()
            .query_async(&mut conn)
            .await?;

        let others = live.into_iter().filter(|p| p.peer_id != peer_id).collect();
        debug!(%meeting_id, %peer_id, evicted, "Peer registered");
        Ok(Registration {
            roster: Roster::from_peers(others),
            is_new: created > 0,
        })
    }

    async fn lookup(&self, meeting_id: &str) -> StoreResult<Roster> {
        require("meetingId", meeting_id)?;

        let key = self.key(meeting_id, "peers");
        let (live, stale) = self.read_peers(&key).await?;
        self.evict_stale_peers(&key, &stale).await?;
        Ok(Roster::from_peers(live))
    }

    async fn unregister(&self, meeting_id: &str, peer_id: &str) -> StoreResult<bool> {
        require("meetingId", meeting_id)?;
        require("peerId", peer_id)?;

        // Redis deletes the hash itself once its last field is gone.
        let mut conn = self.conn.clone();
        let removed: usize = conn.hdel(self.key(meeting_id, "peers"), peer_id).await?;
        Ok(removed > 0)
    }

    async fn post_message(&self, meeting_id: &str, message: NewChatMessage) -> StoreResult<ChatMessage> {
        require("meetingId", meeting_id)?;
        validate_message(&message)?;

        let key = self.key(meeting_id, "messages");
        let message = message.into_message(self.clock.now());
        let mut conn = self.conn.clone();
        let existing: Option<String> = self
            .append_message
            .key(&key)
            .arg(&message.id)
            .arg(serde_json::to_string(&message)?)
            .arg(self.policy.max_messages)
            .arg(self.idle_secs())
            .invoke_async(&mut conn)
            .await?;
        match existing {
            Some(json) => Ok(serde_json::from_str(&json)?),
            None => Ok(message),
        }
    }

    async fn list_messages(&self, meeting_id: &str, since_id: Option<&str>) -> StoreResult<Vec<ChatMessage>> {
        let stored = self.read_list(&self.key(meeting_id, "messages")).await?;
        Ok(messages_since(stored, since_id))
    }

    async fn create_poll(&self, meeting_id: &str, poll: NewPoll) -> StoreResult<Poll> {
        require("meetingId", meeting_id)?;
        validate_poll(&poll)?;

        let record = poll.into_record(self.clock.now());
        if !self.insert_poll(meeting_id, &record, &HashMap::new()).await? {
            let mut conn = self.conn.clone();
            let existing: Option<String> = conn
                .hget(self.key(meeting_id, "polls"), &record.id)
                .await?;
            if let Some(json) = existing {
                let stored: PollRecord = serde_json::from_str(&json)?;
                return self.load_poll(meeting_id, &stored).await;
            }
        }
        Ok(record.with_votes(&HashMap::new()))
    }

    async fn restore_poll(&self, meeting_id: &str, poll: Poll) -> StoreResult<Poll> {
        require("meetingId", meeting_id)?;
        require("poll.id", &poll.id)?;

        let (record, votes) = PollRecord::from_poll(&poll);
        if self.insert_poll(meeting_id, &record, &votes).await? {
            debug!(%meeting_id, poll_id = %poll.id, "Poll restored from heartbeat");
            return Ok(record.with_votes(&votes));
        }

        let mut conn = self.conn.clone();
        let existing: Option<String> = conn.hget(self.key(meeting_id, "polls"), &poll.id).await?;
        match existing {
            Some(json) => {
                let stored: PollRecord = serde_json::from_str(&json)?;
                self.load_poll(meeting_id, &stored).await
            }
            None => Ok(record.with_votes(&votes)),
        }
    }

    async fn list_polls(&self, meeting_id: &str) -> StoreResult<Vec<Poll>> {
        let records: HashMap<String, PollRecord> =
            self.read_hash(&self.key(meeting_id, "polls")).await?;
        let mut records: Vec<PollRecord> = records.into_values().collect();
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at));

        let mut polls = Vec::with_capacity(records.len());
        for record in &records {
            polls.push(self.load_poll(meeting_id, record).await?);
        }
        Ok(polls)
    }

    async fn vote(
        &self,
        meeting_id: &str,
        poll_id: &str,
        option_id: &str,
        voter_key: &str,
    ) -> StoreResult<VoteOutcome> {
        require("voterKey", voter_key)?;

        let mut conn = self.conn.clone();
        let json: Option<String> = conn.hget(self.key(meeting_id, "polls"), poll_id).await?;
        let Some(json) = json else {
            return Ok(VoteOutcome::UnknownPoll);
        };
        let record: PollRecord = serde_json::from_str(&json)?;
        if !record.has_option(option_id) {
            return Ok(VoteOutcome::UnknownOption);
        }

        // One hash field per voter: the write itself moves the vote.
        let votes_key = self.votes_key(meeting_id, poll_id);
        let (previous,): (Option<String>,) = redis::pipe()
            .atomic()
            .hget(&votes_key, voter_key)
            .hset(&votes_key, voter_key, option_id)
            .ignore()
            .expire(&votes_key, self.idle_secs())
            .ignore()
            .query_async(&mut conn)
            .await?;
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

        let key = self.key(meeting_id, "hands");
        let mut conn = self.conn.clone();
        if !raised {
            let _: () = conn.hdel(&key, peer_id).await?;
            return Ok(());
        }

        let now = self.clock.now();
        let existing: Option<String> = conn.hget(&key, peer_id).await?;
        let raised_at = existing
            .and_then(|json| serde_json::from_str::<HandRaise>(&json).ok())
            .map(|h| h.raised_at)
            .unwrap_or(now);
        let hand = HandRaise {
            peer_id: peer_id.to_string(),
            user_name: user_name.to_string(),
            raised_at,
            refreshed_at: now,
        };
        let _: () = redis::pipe()
            .hset(&key, peer_id, serde_json::to_string(&hand)?)
            .ignore()
            .expire(&key, ttl_secs(self.policy.hand_raise_ttl))
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn list_raised_hands(&self, meeting_id: &str) -> StoreResult<Vec<HandRaise>> {
        let now = self.clock.now();
        let key = self.key(meeting_id, "hands");
        let stored: HashMap<String, HandRaise> = self.read_hash(&key).await?;
        let (mut live, expired): (Vec<HandRaise>, Vec<HandRaise>) = stored
            .into_values()
            .partition(|h| now - h.refreshed_at <= self.policy.hand_raise_ttl);

        if !expired.is_empty() {
            let mut conn = self.conn.clone();
            let ids: Vec<&str> = expired.iter().map(|h| h.peer_id.as_str()).collect();
            let _: () = conn.hdel(&key, ids).await?;
        }
        live.sort_by(|a, b| a.raised_at.cmp(&b.raised_at));
        Ok(live)
    }

    async fn post_reaction(&self, meeting_id: &str, reaction: NewReaction) -> StoreResult<Reaction> {
        require("meetingId", meeting_id)?;
        validate_reaction(&reaction)?;

        let now = self.clock.now();
        let reaction = reaction.into_reaction(now);
        let stored = StoredReaction {
            received_at: now,
            reaction: reaction.clone(),
        };
        self.push_capped(
            &self.key(meeting_id, "reactions"),
            &stored,
            self.policy.max_reactions,
            ttl_secs(self.policy.reaction_ttl),
        )
        .await?;
        Ok(reaction)
    }

    async fn list_reactions(&self, meeting_id: &str) -> StoreResult<Vec<Reaction>> {
        let now = self.clock.now();
        let stored: Vec<StoredReaction> = self.read_list(&self.key(meeting_id, "reactions")).await?;
        Ok(stored
            .into_iter()
            .filter(|r| now - r.received_at <= self.policy.reaction_ttl)
            .map(|r| r.reaction)
            .collect())
    }

    fn backend_name(&self) -> &'static str {
        "redis"
    }
}
