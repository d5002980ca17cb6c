use std::collections::HashSet;
use std::time::Duration;

use rendezvous_services::model::{ChatMessage, Poll, Reaction};
use tokio::time::Instant;

/// Chat as the user sees it: each message id once, in `sentAt` order.
#[derive(Debug, Default)]
pub struct MessageLog {
    messages: Vec<ChatMessage>,
    seen: HashSet<String>,
}

impl MessageLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merges messages, skipping ids already present. Returns how many were new.
    pub fn merge(&mut self, incoming: impl IntoIterator<Item = ChatMessage>) -> usize {
        let mut added = 0;
        for message in incoming {
            if self.seen.insert(message.id.clone()) {
                self.messages.push(message);
                added += 1;
            }
        }
        if added > 0 {
            self.messages
                .sort_by(|a, b| a.sent_at.cmp(&b.sent_at).then_with(|| a.id.cmp(&b.id)));
        }
        added
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    /// Cursor for the next incremental fetch.
    pub fn last_id(&self) -> Option<&str> {
        self.messages.last().map(|m| m.id.as_str())
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

/// Polls with optimistic local votes. A local vote shows immediately and is
/// overwritten by the next server snapshot, whatever that snapshot says.
#[derive(Debug, Default)]
pub struct PollBoard {
    polls: Vec<Poll>,
}

impl PollBoard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn replace_snapshot(&mut self, polls: Vec<Poll>) {
        self.polls = polls;
    }

    /// Adds or replaces one poll, keeping position when it already exists.
    pub fn upsert(&mut self, poll: Poll) {
        match self.polls.iter_mut().find(|p| p.id == poll.id) {
            Some(existing) => *existing = poll,
            None => self.polls.push(poll),
        }
    }

    /// Moves `voter_key` to `option_id` locally. Returns the option the voter
    /// held before, or `None` if the poll or option is unknown here.
    pub fn apply_local_vote(
        &mut self,
        poll_id: &str,
        option_id: &str,
        voter_key: &str,
    ) -> Option<Option<String>> {
        let poll = self.polls.iter_mut().find(|p| p.id == poll_id)?;
        if !poll.options.iter().any(|o| o.id == option_id) {
            return None;
        }
        let previous = poll.choice_of(voter_key).map(str::to_string);
        for option in &mut poll.options {
            option.voters.retain(|v| v != voter_key);
            if option.id == option_id {
                option.voters.push(voter_key.to_string());
            }
        }
        Some(previous)
    }

    pub fn polls(&self) -> &[Poll] {
        &self.polls
    }

    pub fn poll(&self, poll_id: &str) -> Option<&Poll> {
        self.polls.iter().find(|p| p.id == poll_id)
    }
}

/// Floating reactions. Each reaction id is shown once for `display_for`.
#[derive(Debug)]
pub struct ReactionOverlay {
    display_for: Duration,
    visible: Vec<(Instant, Reaction)>,
    seen: HashSet<String>,
}

impl ReactionOverlay {
    pub const DISPLAY_DURATION: Duration = Duration::from_secs(3);

    pub fn new(display_for: Duration) -> Self {
        Self {
            display_for,
            visible: Vec::new(),
            seen: HashSet::new(),
        }
    }

    /// Ingests the server's current reaction list. Returns the newly shown ones.
    pub fn ingest(&mut self, reactions: Vec<Reaction>, now: Instant) -> Vec<Reaction> {
        let current: HashSet<String> = reactions.iter().map(|r| r.id.clone()).collect();
        let mut shown = Vec::new();
        for reaction in reactions {
            if self.seen.insert(reaction.id.clone()) {
                self.visible.push((now + self.display_for, reaction.clone()));
                shown.push(reaction);
            }
        }
        // Ids the server has dropped cannot come back.
        let visible_ids: HashSet<&str> = self.visible.iter().map(|(_, r)| r.id.as_str()).collect();
        self.seen
            .retain(|id| current.contains(id) || visible_ids.contains(id.as_str()));
        self.prune(now);
        shown
    }

    /// Shows a reaction we sent ourselves without waiting for a poll.
    pub fn show_local(&mut self, reaction: Reaction, now: Instant) {
        if self.seen.insert(reaction.id.clone()) {
            self.visible.push((now + self.display_for, reaction));
        }
    }

    pub fn visible(&mut self, now: Instant) -> Vec<Reaction> {
        self.prune(now);
        self.visible.iter().map(|(_, r)| r.clone()).collect()
    }

    fn prune(&mut self, now: Instant) {
        self.visible.retain(|(until, _)| *until > now);
    }
}

impl Default for ReactionOverlay {
    fn default() -> Self {
        Self::new(Self::DISPLAY_DURATION)
    }
}
