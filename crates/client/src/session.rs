use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use rendezvous_services::model::{
    ChatMessage, HandRaise, NewChatMessage, NewPoll, NewReaction, Poll, Reaction, VoteOutcome,
};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::calls::CallManager;
use crate::discovery::{DiscoveryAgent, DiscoveryConfig, DiscoveryState};
use crate::error::SessionError;
use crate::media::{MediaConstraints, MediaDevices, PeerEndpoint, acquire_with_fallback};
use crate::transport::SignalingTransport;
use crate::views::{MessageLog, PollBoard, ReactionOverlay};

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub discovery: DiscoveryConfig,
    pub event_poll_interval: Duration,
    pub hand_raise_heartbeat: Duration,
    pub poll_heartbeat: Duration,
    pub reaction_display: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            discovery: DiscoveryConfig::default(),
            event_poll_interval: Duration::from_secs(1),
            hand_raise_heartbeat: Duration::from_secs(10),
            poll_heartbeat: Duration::from_secs(10),
            reaction_display: ReactionOverlay::DISPLAY_DURATION,
        }
    }
}

struct Views {
    messages: MessageLog,
    polls: PollBoard,
    reactions: ReactionOverlay,
    hands: Vec<HandRaise>,
}

struct Shared {
    transport: Arc<dyn SignalingTransport>,
    meeting_id: String,
    peer_id: String,
    user_name: String,
    views: Mutex<Views>,
    hand_raised: AtomicBool,
    /// Last known copy of each poll this client created.
    own_polls: Mutex<HashMap<String, Poll>>,
}

/// One user's presence in one meeting: discovery, calls, and the polled
/// chat, poll, reaction and hand-raise views.
pub struct MeetingSession {
    shared: Arc<Shared>,
    discovery: DiscoveryAgent,
    media: MediaConstraints,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl MeetingSession {
    /// Acquires media (degrading if needed), joins discovery and starts the
    /// event loops. A media failure here is fatal only to this join.
    pub async fn join(
        transport: Arc<dyn SignalingTransport>,
        endpoint: Arc<dyn PeerEndpoint>,
        devices: &dyn MediaDevices,
        meeting_id: &str,
        user_name: &str,
        contact_handle: Option<&str>,
        config: SessionConfig,
    ) -> Result<Self, SessionError> {
        let (stream, media) = acquire_with_fallback(devices).await?;

        let discovery = DiscoveryAgent::new(transport.clone(), endpoint, config.discovery.clone());
        let joined = match discovery
            .join(meeting_id, user_name, contact_handle, stream.clone())
            .await
        {
            Ok(joined) => joined,
            Err(e) => {
                stream.stop_all();
                return Err(e);
            }
        };

        let shared = Arc::new(Shared {
            transport,
            meeting_id: meeting_id.to_string(),
            peer_id: joined.peer_id,
            user_name: user_name.to_string(),
            views: Mutex::new(Views {
                messages: MessageLog::new(),
                polls: PollBoard::new(),
                reactions: ReactionOverlay::new(config.reaction_display),
                hands: Vec::new(),
            }),
            hand_raised: AtomicBool::new(false),
            own_polls: Mutex::new(HashMap::new()),
        });
        refresh_events(&shared).await;

        let (shutdown, shutdown_rx) = watch::channel(false);
        let tasks = vec![
            tokio::spawn(every(
                config.event_poll_interval,
                shutdown_rx.clone(),
                shared.clone(),
                |shared| async move { refresh_events(&shared).await },
            )),
            tokio::spawn(every(
                config.hand_raise_heartbeat,
                shutdown_rx.clone(),
                shared.clone(),
                |shared| async move { refresh_hand(&shared).await },
            )),
            tokio::spawn(every(
                config.poll_heartbeat,
                shutdown_rx,
                shared.clone(),
                |shared| async move { refresh_own_polls(&shared).await },
            )),
        ];

        info!(%meeting_id, peer_id = %shared.peer_id, ?media, "Meeting session started");
        Ok(Self {
            shared,
            discovery,
            media,
            shutdown,
            tasks: Mutex::new(tasks),
        })
    }

    pub fn meeting_id(&self) -> &str {
        &self.shared.meeting_id
    }

    pub fn peer_id(&self) -> &str {
        &self.shared.peer_id
    }

    /// Devices the session joined with after any fallback.
    pub fn media(&self) -> MediaConstraints {
        self.media
    }

    pub fn discovery_state(&self) -> DiscoveryState {
        self.discovery.state()
    }

    pub fn calls(&self) -> &CallManager {
        self.discovery.calls()
    }

    pub async fn send_message(
        &self,
        body: &str,
        reply_to: Option<&ChatMessage>,
    ) -> Result<ChatMessage, SessionError> {
        let mut message = NewChatMessage::new(&self.shared.user_name, body);
        if let Some(parent) = reply_to {
            message.reply_to_id = Some(parent.id.clone());
            message.reply_preview = Some(parent.body.chars().take(80).collect());
        }
        let sent = self
            .shared
            .transport
            .post_message(&self.shared.meeting_id, message)
            .await?;
        self.shared
            .views
            .lock()
            .messages
            .merge(std::iter::once(sent.clone()));
        Ok(sent)
    }

    pub async fn send_reaction(&self, emoji: &str) -> Result<Reaction, SessionError> {
        let reaction = self
            .shared
            .transport
            .post_reaction(
                &self.shared.meeting_id,
                NewReaction::new(emoji, &self.shared.user_name),
            )
            .await?;
        self.shared
            .views
            .lock()
            .reactions
            .show_local(reaction.clone(), Instant::now());
        Ok(reaction)
    }

    /// Raises or lowers our hand. While raised it is re-sent on the hand
    /// heartbeat so the server TTL never drops it.
    pub async fn set_hand_raised(&self, raised: bool) -> Result<(), SessionError> {
        self.shared.hand_raised.store(raised, Ordering::Release);
        let hands = self
            .shared
            .transport
            .raise_hand(
                &self.shared.meeting_id,
                &self.shared.peer_id,
                &self.shared.user_name,
                raised,
            )
            .await?;
        self.shared.views.lock().hands = hands;
        Ok(())
    }

    pub async fn create_poll(&self, question: &str, options: &[&str]) -> Result<Poll, SessionError> {
        let poll = self
            .shared
            .transport
            .create_poll(
                &self.shared.meeting_id,
                NewPoll::new(question, options, &self.shared.user_name),
            )
            .await?;
        self.shared
            .own_polls
            .lock()
            .insert(poll.id.clone(), poll.clone());
        self.shared.views.lock().polls.upsert(poll.clone());
        Ok(poll)
    }

    /// Votes optimistically; the next snapshot shows the server's view.
    pub async fn vote(&self, poll_id: &str, option_id: &str) -> Result<VoteOutcome, SessionError> {
        let previous = self
            .shared
            .views
            .lock()
            .polls
            .apply_local_vote(poll_id, option_id, &self.shared.user_name)
            .flatten();
        let outcome = self
            .shared
            .transport
            .vote(
                &self.shared.meeting_id,
                poll_id,
                option_id,
                &self.shared.user_name,
                previous.as_deref(),
            )
            .await?;
        if !outcome.is_applied() {
            warn!(%poll_id, %option_id, ?outcome, "Vote not applied, poll may have been lost");
        }
        Ok(outcome)
    }

    /// Runs one event poll now instead of waiting for the next tick.
    pub async fn refresh(&self) {
        refresh_events(&self.shared).await;
    }

    pub fn messages(&self) -> Vec<ChatMessage> {
        self.shared.views.lock().messages.messages().to_vec()
    }

    pub fn polls(&self) -> Vec<Poll> {
        self.shared.views.lock().polls.polls().to_vec()
    }

    pub fn visible_reactions(&self) -> Vec<Reaction> {
        self.shared.views.lock().reactions.visible(Instant::now())
    }

    pub fn raised_hands(&self) -> Vec<HandRaise> {
        self.shared.views.lock().hands.clone()
    }

    /// Stops every loop, lowers our hand, unregisters and hangs up.
    pub async fn leave(&self) -> Result<(), SessionError> {
        self.stop_loops();
        if self.shared.hand_raised.swap(false, Ordering::AcqRel) {
            if let Err(e) = self
                .shared
                .transport
                .raise_hand(
                    &self.shared.meeting_id,
                    &self.shared.peer_id,
                    &self.shared.user_name,
                    false,
                )
                .await
            {
                warn!(%e, "Could not lower hand on leave");
            }
        }
        self.discovery.leave().await
    }

    fn stop_loops(&self) {
        let _ = self.shutdown.send(true);
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}

impl Drop for MeetingSession {
    fn drop(&mut self) {
        self.stop_loops();
    }
}

/// Runs `tick` on a fixed cadence until shutdown. Each loop owns its timer,
/// so a slow tick in one loop never shifts another.
async fn every<F, Fut>(period: Duration, mut shutdown: watch::Receiver<bool>, shared: Arc<Shared>, tick: F)
where
    F: Fn(Arc<Shared>) -> Fut,
    Fut: Future<Output = ()>,
{
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
            _ = ticker.tick() => tick(shared.clone()).await,
        }
    }
    debug!(meeting_id = %shared.meeting_id, "Session loop stopped");
}

async fn refresh_events(shared: &Shared) {
    let meeting_id = &shared.meeting_id;
    let transport = &shared.transport;

    let since = shared
        .views
        .lock()
        .messages
        .last_id()
        .map(str::to_string);
    match transport.list_messages(meeting_id, since.as_deref()).await {
        Ok(messages) => {
            let added = shared.views.lock().messages.merge(messages);
            if added > 0 {
                debug!(%meeting_id, added, "New chat messages");
            }
        }
        Err(e) => warn!(%meeting_id, %e, "Message poll failed"),
    }

    match transport.list_polls(meeting_id).await {
        Ok(polls) => {
            {
                let mut own = shared.own_polls.lock();
                for poll in &polls {
                    if let Some(copy) = own.get_mut(&poll.id) {
                        *copy = poll.clone();
                    }
                }
            }
            shared.views.lock().polls.replace_snapshot(polls);
        }
        Err(e) => warn!(%meeting_id, %e, "Poll list failed"),
    }

    match transport.list_reactions(meeting_id).await {
        Ok(reactions) => {
            shared
                .views
                .lock()
                .reactions
                .ingest(reactions, Instant::now());
        }
        Err(e) => warn!(%meeting_id, %e, "Reaction poll failed"),
    }

    match transport.list_raised_hands(meeting_id).await {
        Ok(hands) => shared.views.lock().hands = hands,
        Err(e) => warn!(%meeting_id, %e, "Hand list failed"),
    }
}

async fn refresh_hand(shared: &Shared) {
    if !shared.hand_raised.load(Ordering::Acquire) {
        return;
    }
    if let Err(e) = shared
        .transport
        .raise_hand(&shared.meeting_id, &shared.peer_id, &shared.user_name, true)
        .await
    {
        warn!(meeting_id = %shared.meeting_id, %e, "Hand raise heartbeat failed");
    }
}

/// Re-sends our polls so a server that lost them gets them back.
async fn refresh_own_polls(shared: &Shared) {
    let polls: Vec<Poll> = shared.own_polls.lock().values().cloned().collect();
    for poll in polls {
        let poll_id = poll.id.clone();
        if let Err(e) = shared.transport.restore_poll(&shared.meeting_id, poll).await {
            warn!(meeting_id = %shared.meeting_id, %poll_id, %e, "Poll heartbeat failed");
        }
    }
}
