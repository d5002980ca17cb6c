pub mod memory;
pub mod redis;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Duration;
use rendezvous_config::{EventSettings, PresenceSettings, Settings, StoreBackend};
use thiserror::Error;
use tracing::info;

use crate::clock::Clock;
use crate::model::{
    ChatMessage, HandRaise, NewChatMessage, NewPoll, NewReaction, PeerRegistration, Poll,
    Reaction, Registration, Roster, VoteOutcome,
};

pub use self::memory::MemoryStore;
pub use self::redis::RedisStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Validation: {0}")]
    Validation(String),
    #[error("Redis error: {0}")]
    Redis(#[from] ::redis::RedisError),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// How long each kind of ephemeral state lives.
#[derive(Debug, Clone)]
pub struct RetentionPolicy {
    /// Max gap between heartbeats before a peer drops out of the roster.
    pub eviction_window: Duration,
    pub hand_raise_ttl: Duration,
    pub reaction_ttl: Duration,
    pub max_messages: usize,
    pub max_polls: usize,
    pub max_reactions: usize,
    /// Event buckets with no writes for this long are dropped.
    pub idle_bucket_ttl: Duration,
}

impl RetentionPolicy {
    pub fn from_settings(presence: &PresenceSettings, events: &EventSettings) -> Self {
        Self {
            eviction_window: Duration::seconds(presence.eviction_window_secs as i64),
            hand_raise_ttl: Duration::seconds(events.hand_raise_ttl_secs as i64),
            reaction_ttl: Duration::seconds(events.reaction_ttl_secs as i64),
            max_messages: events.max_messages.max(1),
            max_polls: events.max_polls.max(1),
            max_reactions: events.max_reactions.max(1),
            idle_bucket_ttl: Duration::seconds(events.idle_bucket_ttl_secs as i64),
        }
    }
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self::from_settings(&PresenceSettings::default(), &EventSettings::default())
    }
}

/// Presence Store and Ephemeral Event Store behind one narrow interface.
///
/// Every operation is scoped to a single meeting and costs O(bucket size).
/// Reads of unknown meetings return empty results, never errors.
#[async_trait]
pub trait SignalStore: Send + Sync + 'static {
    /// Upserts the caller and returns the roster without it.
    async fn register(&self, meeting_id: &str, peer: PeerRegistration) -> StoreResult<Roster> {
        Ok(self.upsert_peer(meeting_id, peer).await?.roster)
    }

    /// Like [`register`](Self::register), and also reports whether this write
    /// created the caller's live record. Exactly one of several concurrent
    /// first registrations sees `is_new`.
    async fn upsert_peer(&self, meeting_id: &str, peer: PeerRegistration) -> StoreResult<Registration>;

    async fn lookup(&self, meeting_id: &str) -> StoreResult<Roster>;

    /// Returns whether a record was removed.
    async fn unregister(&self, meeting_id: &str, peer_id: &str) -> StoreResult<bool>;

    /// Appends a message. A message whose id is already stored is returned
    /// as-is and not appended twice.
    async fn post_message(&self, meeting_id: &str, message: NewChatMessage) -> StoreResult<ChatMessage>;

    async fn list_messages(&self, meeting_id: &str, since_id: Option<&str>) -> StoreResult<Vec<ChatMessage>>;

    async fn create_poll(&self, meeting_id: &str, poll: NewPoll) -> StoreResult<Poll>;

    /// Re-inserts a poll (votes included) only when the store no longer has it.
    async fn restore_poll(&self, meeting_id: &str, poll: Poll) -> StoreResult<Poll>;

    async fn list_polls(&self, meeting_id: &str) -> StoreResult<Vec<Poll>>;

    async fn vote(
        &self,
        meeting_id: &str,
        poll_id: &str,
        option_id: &str,
        voter_key: &str,
    ) -> StoreResult<VoteOutcome>;

    /// `raised = true` inserts or refreshes; `raised = false` removes at once.
    async fn raise_hand(
        &self,
        meeting_id: &str,
        peer_id: &str,
        user_name: &str,
        raised: bool,
    ) -> StoreResult<()>;

    async fn list_raised_hands(&self, meeting_id: &str) -> StoreResult<Vec<HandRaise>>;

    async fn post_reaction(&self, meeting_id: &str, reaction: NewReaction) -> StoreResult<Reaction>;

    async fn list_reactions(&self, meeting_id: &str) -> StoreResult<Vec<Reaction>>;

    /// Drops idle meeting buckets. Returns how many were removed.
    async fn sweep_idle(&self) -> StoreResult<usize> {
        Ok(0)
    }

    fn backend_name(&self) -> &'static str;
}

/// Builds the store selected by `store.backend`.
pub async fn build_store(
    settings: &Settings,
    clock: Arc<dyn Clock>,
) -> anyhow::Result<Arc<dyn SignalStore>> {
    let policy = RetentionPolicy::from_settings(&settings.presence, &settings.events);
    let store: Arc<dyn SignalStore> = match settings.store.backend {
        StoreBackend::Memory => Arc::new(MemoryStore::new(policy, clock)),
        StoreBackend::Redis => Arc::new(
            RedisStore::connect(
                &settings.redis.url,
                settings.store.key_prefix.clone(),
                policy,
                clock,
            )
            .await?,
        ),
    };
    info!(backend = store.backend_name(), "Signal store ready");
    Ok(store)
}

// ============================================
// Shared validation
// ============================================

pub(crate) fn require(field: &str, value: &str) -> StoreResult<()> {
    if value.trim().is_empty() {
        return Err(StoreError::Validation(format!("{} is required", field)));
    }
    Ok(())
}

pub(crate) fn validate_message(message: &NewChatMessage) -> StoreResult<()> {
    require("message.body", &message.body)?;
    require("message.authorName", &message.author_name)
}

pub(crate) fn validate_poll(poll: &NewPoll) -> StoreResult<()> {
    require("poll.question", &poll.question)?;
    if poll.options.len() < 2 {
        return Err(StoreError::Validation(
            "poll needs at least two options".to_string(),
        ));
    }
    if poll.options.iter().any(|o| o.text.trim().is_empty()) {
        return Err(StoreError::Validation(
            "poll option text is required".to_string(),
        ));
    }
    let mut ids: Vec<&str> = poll.options.iter().filter_map(|o| o.id.as_deref()).collect();
    let given = ids.len();
    ids.sort_unstable();
    ids.dedup();
    if ids.len() != given {
        return Err(StoreError::Validation(
            "poll option ids must be unique".to_string(),
        ));
    }
    Ok(())
}

pub(crate) fn validate_reaction(reaction: &NewReaction) -> StoreResult<()> {
    require("reaction.emoji", &reaction.emoji)
}
