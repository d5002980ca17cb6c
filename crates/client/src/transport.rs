use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder};
use rendezvous_services::SignalStore;
use rendezvous_services::model::{
    ChatMessage, HandRaise, NewChatMessage, NewPoll, NewReaction, PeerRecord, PeerRegistration,
    Poll, Reaction, Roster, VoteOutcome,
};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::json;
use tracing::debug;

use crate::error::TransportError;

pub type TransportResult<T> = Result<T, TransportError>;

/// Presence and event operations as seen from a client. Implemented over
/// HTTP polling and directly over an in-process store.
#[async_trait]
pub trait SignalingTransport: Send + Sync + 'static {
    /// Registers or heartbeats; the roster excludes the caller.
    async fn register(&self, meeting_id: &str, peer: &PeerRegistration) -> TransportResult<Roster>;

    async fn lookup(&self, meeting_id: &str) -> TransportResult<Roster>;

    async fn unregister(&self, meeting_id: &str, peer_id: &str) -> TransportResult<()>;

    async fn post_message(&self, meeting_id: &str, message: NewChatMessage) -> TransportResult<ChatMessage>;

    async fn list_messages(&self, meeting_id: &str, since_id: Option<&str>) -> TransportResult<Vec<ChatMessage>>;

    async fn create_poll(&self, meeting_id: &str, poll: NewPoll) -> TransportResult<Poll>;

    async fn restore_poll(&self, meeting_id: &str, poll: Poll) -> TransportResult<Poll>;

    async fn list_polls(&self, meeting_id: &str) -> TransportResult<Vec<Poll>>;

    async fn vote(
        &self,
        meeting_id: &str,
        poll_id: &str,
        option_id: &str,
        voter_key: &str,
        previous_vote: Option<&str>,
    ) -> TransportResult<VoteOutcome>;

    /// Returns the raised hands after the change.
    async fn raise_hand(
        &self,
        meeting_id: &str,
        peer_id: &str,
        user_name: &str,
        raised: bool,
    ) -> TransportResult<Vec<HandRaise>>;

    async fn list_raised_hands(&self, meeting_id: &str) -> TransportResult<Vec<HandRaise>>;

    async fn post_reaction(&self, meeting_id: &str, reaction: NewReaction) -> TransportResult<Reaction>;

    async fn list_reactions(&self, meeting_id: &str) -> TransportResult<Vec<Reaction>>;
}

// ============================================
// HTTP pull binding
// ============================================

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RosterResponse {
    peers: Vec<PeerRecord>,
    total_peers: usize,
}

impl From<RosterResponse> for Roster {
    fn from(r: RosterResponse) -> Self {
        Roster {
            peers: r.peers,
            count: r.total_peers,
        }
    }
}

#[derive(Deserialize)]
struct MessageResponse {
    message: ChatMessage,
}

#[derive(Deserialize)]
struct MessagesResponse {
    messages: Vec<ChatMessage>,
}

#[derive(Deserialize)]
struct PollResponse {
    poll: Poll,
}

#[derive(Deserialize)]
struct PollsResponse {
    polls: Vec<Poll>,
}

#[derive(Deserialize)]
struct VoteResponse {
    vote: VoteOutcome,
}

#[derive(Deserialize)]
struct HandsResponse {
    hands: Vec<HandRaise>,
}

#[derive(Deserialize)]
struct ReactionResponse {
    reaction: Reaction,
}

#[derive(Deserialize)]
struct ReactionsResponse {
    reactions: Vec<Reaction>,
}

#[derive(Deserialize)]
struct ErrorBody {
    error: String,
    #[serde(default)]
    code: Option<String>,
}

/// Pull binding over `/peer-discovery` and `/signal`.
#[derive(Clone)]
pub struct HttpTransport {
    client: Client,
    base_url: String,
}

impl HttpTransport {
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

    pub fn new(base_url: impl Into<String>) -> TransportResult<Self> {
        Self::with_timeout(base_url, Self::DEFAULT_TIMEOUT)
    }

    /// Every request is bounded by `timeout` so a hung server cannot stall
    /// a heartbeat loop.
    pub fn with_timeout(base_url: impl Into<String>, timeout: Duration) -> TransportResult<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.client
            .request(method, format!("{}{}", self.base_url, path))
    }

    async fn send<T: DeserializeOwned>(&self, request: RequestBuilder) -> TransportResult<T> {
        let resp = request.send().await?;
        let status = resp.status();
        if !status.is_success() {
            let (error, code) = match resp.json::<ErrorBody>().await {
                Ok(body) => (body.error, body.code),
                Err(_) => (status.canonical_reason().unwrap_or("error").to_string(), None),
            };
            debug!(%status, %error, ?code, "Signaling request refused");
            return Err(TransportError::Status {
                status: status.as_u16(),
                error,
                code,
            });
        }
        Ok(resp.json::<T>().await?)
    }

    fn peer_discovery(&self, method: Method, meeting_id: &str) -> RequestBuilder {
        self.request(method, "/peer-discovery")
            .query(&[("meetingId", meeting_id)])
    }

    fn signal(&self, method: Method, room_id: &str) -> RequestBuilder {
        self.request(method, "/signal").query(&[("roomId", room_id)])
    }
}

#[async_trait]
impl SignalingTransport for HttpTransport {
    async fn register(&self, meeting_id: &str, peer: &PeerRegistration) -> TransportResult<Roster> {
        let body = json!({
            "userId": peer.peer_id,
            "userName": peer.display_name,
            "userEmail": peer.contact_handle,
        });
        let resp: RosterResponse = self
            .send(self.peer_discovery(Method::POST, meeting_id).json(&body))
            .await?;
        Ok(resp.into())
    }

    async fn lookup(&self, meeting_id: &str) -> TransportResult<Roster> {
        let resp: RosterResponse = self
            .send(self.peer_discovery(Method::GET, meeting_id))
            .await?;
        Ok(resp.into())
    }

    async fn unregister(&self, meeting_id: &str, peer_id: &str) -> TransportResult<()> {
        let _: serde_json::Value = self
            .send(
                self.peer_discovery(Method::DELETE, meeting_id)
                    .json(&json!({ "userId": peer_id })),
            )
            .await?;
        Ok(())
    }

    async fn post_message(&self, meeting_id: &str, message: NewChatMessage) -> TransportResult<ChatMessage> {
        let resp: MessageResponse = self
            .send(
                self.signal(Method::POST, meeting_id)
                    .json(&json!({ "message": message })),
            )
            .await?;
        Ok(resp.message)
    }

    async fn list_messages(&self, meeting_id: &str, since_id: Option<&str>) -> TransportResult<Vec<ChatMessage>> {
        let mut request = self
            .signal(Method::GET, meeting_id)
            .query(&[("type", "messages")]);
        if let Some(since_id) = since_id {
            request = request.query(&[("sinceId", since_id)]);
        }
        let resp: MessagesResponse = self.send(request).await?;
        Ok(resp.messages)
    }

    async fn create_poll(&self, meeting_id: &str, poll: NewPoll) -> TransportResult<Poll> {
        let resp: PollResponse = self
            .send(
                self.signal(Method::POST, meeting_id)
                    .json(&json!({ "type": "poll", "poll": poll })),
            )
            .await?;
        Ok(resp.poll)
    }

    async fn restore_poll(&self, meeting_id: &str, poll: Poll) -> TransportResult<Poll> {
        let resp: PollResponse = self
            .send(
                self.signal(Method::POST, meeting_id)
                    .json(&json!({ "type": "pollHeartbeat", "poll": poll })),
            )
            .await?;
        Ok(resp.poll)
    }

    async fn list_polls(&self, meeting_id: &str) -> TransportResult<Vec<Poll>> {
        let resp: PollsResponse = self
            .send(
                self.signal(Method::GET, meeting_id)
                    .query(&[("type", "polls")]),
            )
            .await?;
        Ok(resp.polls)
    }

    async fn vote(
        &self,
        meeting_id: &str,
        poll_id: &str,
        option_id: &str,
        voter_key: &str,
        previous_vote: Option<&str>,
    ) -> TransportResult<VoteOutcome> {
        let body = json!({
            "type": "pollVote",
            "pollId": poll_id,
            "optionId": option_id,
            "previousVote": previous_vote,
            "userName": voter_key,
        });
        match self
            .send::<VoteResponse>(self.signal(Method::POST, meeting_id).json(&body))
            .await
        {
            Ok(resp) => Ok(resp.vote),
            Err(e) => {
                let refused = e.code().and_then(VoteOutcome::from_rejection_code);
                refused.ok_or(e)
            }
        }
    }

    async fn raise_hand(
        &self,
        meeting_id: &str,
        peer_id: &str,
        user_name: &str,
        raised: bool,
    ) -> TransportResult<Vec<HandRaise>> {
        let body = json!({
            "handRaise": {
                "peerId": peer_id,
                "userName": user_name,
                "isRaised": raised,
            }
        });
        let resp: HandsResponse = self
            .send(self.signal(Method::POST, meeting_id).json(&body))
            .await?;
        Ok(resp.hands)
    }

    async fn list_raised_hands(&self, meeting_id: &str) -> TransportResult<Vec<HandRaise>> {
        let resp: HandsResponse = self
            .send(
                self.signal(Method::GET, meeting_id)
                    .query(&[("type", "hands")]),
            )
            .await?;
        Ok(resp.hands)
    }

    async fn post_reaction(&self, meeting_id: &str, reaction: NewReaction) -> TransportResult<Reaction> {
        let resp: ReactionResponse = self
            .send(
                self.signal(Method::POST, meeting_id)
                    .json(&json!({ "reaction": reaction })),
            )
            .await?;
        Ok(resp.reaction)
    }

    async fn list_reactions(&self, meeting_id: &str) -> TransportResult<Vec<Reaction>> {
        let resp: ReactionsResponse = self.send(self.signal(Method::GET, meeting_id)).await?;
        Ok(resp.reactions)
    }
}

// ============================================
// In-process binding
// ============================================

/// Calls a store directly. Used for single-process setups and tests.
#[derive(Clone)]
pub struct LocalTransport {
    store: Arc<dyn SignalStore>,
}

impl LocalTransport {
    pub fn new(store: Arc<dyn SignalStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl SignalingTransport for LocalTransport {
    async fn register(&self, meeting_id: &str, peer: &PeerRegistration) -> TransportResult<Roster> {
        Ok(self.store.register(meeting_id, peer.clone()).await?)
    }

    async fn lookup(&self, meeting_id: &str) -> TransportResult<Roster> {
        Ok(self.store.lookup(meeting_id).await?)
    }

    async fn unregister(&self, meeting_id: &str, peer_id: &str) -> TransportResult<()> {
        self.store.unregister(meeting_id, peer_id).await?;
        Ok(())
    }

    async fn post_message(&self, meeting_id: &str, message: NewChatMessage) -> TransportResult<ChatMessage> {
        Ok(self.store.post_message(meeting_id, message).await?)
    }

    async fn list_messages(&self, meeting_id: &str, since_id: Option<&str>) -> TransportResult<Vec<ChatMessage>> {
        Ok(self.store.list_messages(meeting_id, since_id).await?)
    }

    async fn create_poll(&self, meeting_id: &str, poll: NewPoll) -> TransportResult<Poll> {
        Ok(self.store.create_poll(meeting_id, poll).await?)
    }

    async fn restore_poll(&self, meeting_id: &str, poll: Poll) -> TransportResult<Poll> {
        Ok(self.store.restore_poll(meeting_id, poll).await?)
    }

    async fn list_polls(&self, meeting_id: &str) -> TransportResult<Vec<Poll>> {
        Ok(self.store.list_polls(meeting_id).await?)
    }

    async fn vote(
        &self,
        meeting_id: &str,
        poll_id: &str,
        option_id: &str,
        voter_key: &str,
        _previous_vote: Option<&str>,
    ) -> TransportResult<VoteOutcome> {
        Ok(self
            .store
            .vote(meeting_id, poll_id, option_id, voter_key)
            .await?)
    }

    async fn raise_hand(
        &self,
        meeting_id: &str,
        peer_id: &str,
        user_name: &str,
        raised: bool,
    ) -> TransportResult<Vec<HandRaise>> {
        self.store
            .raise_hand(meeting_id, peer_id, user_name, raised)
            .await?;
        Ok(self.store.list_raised_hands(meeting_id).await?)
    }

    async fn list_raised_hands(&self, meeting_id: &str) -> TransportResult<Vec<HandRaise>> {
        Ok(self.store.list_raised_hands(meeting_id).await?)
    }

    async fn post_reaction(&self, meeting_id: &str, reaction: NewReaction) -> TransportResult<Reaction> {
        Ok(self.store.post_reaction(meeting_id, reaction).await?)
    }

    async fn list_reactions(&self, meeting_id: &str) -> TransportResult<Vec<Reaction>> {
        Ok(self.store.list_reactions(meeting_id).await?)
    }
}
