use axum::{
    Json,
    extract::{Query, State, rejection::{JsonRejection, QueryRejection}},
    http::StatusCode,
};
use rendezvous_services::model::{NewChatMessage, NewPoll, NewReaction, Poll, VoteOutcome};
use serde::Deserialize;
use serde_json::Value;

use crate::{
    error::ApiError,
    state::AppState,
    ws::{
        dispatcher::{broadcast_to_meeting, event},
        protocol::{HandRaiseRequest, PollVoteRequest},
    },
};

#[derive(Debug, Deserialize)]
pub struct SignalQuery {
    #[serde(rename = "roomId")]
    pub room_id: Option<String>,
    #[serde(rename = "type")]
    pub kind: Option<String>,
    #[serde(rename = "sinceId")]
    pub since_id: Option<String>,
}

impl SignalQuery {
    fn room(&self) -> Result<String, ApiError> {
        self.room_id
            .clone()
            .filter(|id| !id.trim().is_empty())
            .ok_or_else(|| ApiError::BadRequest("roomId is required".to_string()))
    }
}

/// Bodies carrying a `type` discriminator.
#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum TypedSignal {
    #[serde(rename = "poll")]
    Poll { poll: NewPoll },
    #[serde(rename = "pollVote")]
    PollVote(PollVoteRequest),
    #[serde(rename = "pollHeartbeat")]
    PollHeartbeat { poll: Poll },
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HandRaiseBody {
    hand_raise: HandRaiseRequest,
}

#[derive(Debug)]
pub enum SignalRequest {
    Message(NewChatMessage),
    Reaction(NewReaction),
    HandRaise(HandRaiseRequest),
    Poll(NewPoll),
    PollVote(PollVoteRequest),
    PollHeartbeat(Poll),
}

/// Classifies a POST body by which key it carries.
pub fn parse_signal(body: Value) -> Result<SignalRequest, ApiError> {
    let malformed = |e: serde_json::Error| ApiError::BadRequest(format!("Malformed signal: {}", e));

    if body.get("type").is_some() {
        let typed: TypedSignal = serde_json::from_value(body).map_err(malformed)?;
        return Ok(match typed {
            TypedSignal::Poll { poll } => SignalRequest::Poll(poll),
            TypedSignal::PollVote(vote) => SignalRequest::PollVote(vote),
            TypedSignal::PollHeartbeat { poll } => SignalRequest::PollHeartbeat(poll),
        });
    }
    if let Some(message) = body.get("message") {
        let message = serde_json::from_value(message.clone()).map_err(malformed)?;
        return Ok(SignalRequest::Message(message));
    }
    if let Some(reaction) = body.get("reaction") {
        let reaction = serde_json::from_value(reaction.clone()).map_err(malformed)?;
        return Ok(SignalRequest::Reaction(reaction));
    }
    if body.get("handRaise").is_some() {
        let HandRaiseBody { hand_raise } = serde_json::from_value(body).map_err(malformed)?;
        return Ok(SignalRequest::HandRaise(hand_raise));
    }
    Err(ApiError::BadRequest(
        "Expected one of message, reaction, handRaise or a typed poll body".to_string(),
    ))
}

/// Applies an event mutation and returns the updated collection. Each
/// mutation is also pushed to WebSocket members of the meeting.
pub async fn post(
    State(state): State<AppState>,
    query: Result<Query<SignalQuery>, QueryRejection>,
    body: Result<Json<Value>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    let Query(query) = query?;
    let room_id = query.room()?;
    let Json(body) = body?;
    let store = &state.store;

    match parse_signal(body)? {
        SignalRequest::Message(message) => {
            let message = store.post_message(&room_id, message).await?;
            let frame = event("chat-message", serde_json::json!({ "message": message }));
            broadcast_to_meeting(&state, &room_id, None, &frame).await;
            let messages = store.list_messages(&room_id, None).await?;
            Ok(Json(serde_json::json!({
                "success": true,
                "message": message,
                "messages": messages,
            })))
        }
        SignalRequest::Reaction(reaction) => {
            let reaction = store.post_reaction(&room_id, reaction).await?;
            let frame = event("reaction", serde_json::json!({ "reaction": reaction }));
            broadcast_to_meeting(&state, &room_id, None, &frame).await;
            let reactions = store.list_reactions(&room_id).await?;
            Ok(Json(serde_json::json!({
                "success": true,
                "reaction": reaction,
                "reactions": reactions,
            })))
        }
        SignalRequest::HandRaise(request) => {
            let peer_id = request
                .peer_id
                .filter(|id| !id.trim().is_empty())
                .ok_or_else(|| ApiError::BadRequest("handRaise.peerId is required".to_string()))?;
            let user_name = request.user_name.unwrap_or_default();
            store
                .raise_hand(&room_id, &peer_id, &user_name, request.is_raised)
                .await?;
            let frame = event(
                "hand-raised",
                serde_json::json!({
                    "peerId": peer_id,
                    "userName": user_name,
                    "isRaised": request.is_raised,
                }),
            );
            broadcast_to_meeting(&state, &room_id, None, &frame).await;
            let hands = store.list_raised_hands(&room_id).await?;
            Ok(Json(serde_json::json!({
                "success": true,
                "hands": hands,
            })))
        }
        SignalRequest::Poll(poll) => {
            let poll = store.create_poll(&room_id, poll).await?;
            let frame = event("poll-created", serde_json::json!({ "poll": poll }));
            broadcast_to_meeting(&state, &room_id, None, &frame).await;
            let polls = store.list_polls(&room_id).await?;
            Ok(Json(serde_json::json!({
                "success": true,
                "poll": poll,
                "polls": polls,
            })))
        }
        SignalRequest::PollVote(request) => {
            let outcome = store
                .vote(&room_id, &request.poll_id, &request.option_id, &request.user_name)
                .await?;
            if let Some(code) = outcome.rejection_code() {
                let message = match outcome {
                    VoteOutcome::UnknownOption => "Poll option not found",
                    _ => "Poll not found",
                };
                return Err(ApiError::Coded {
                    status: StatusCode::NOT_FOUND,
                    code,
                    message: message.to_string(),
                });
            }
            let polls = store.list_polls(&room_id).await?;
            let poll = polls.iter().find(|p| p.id == request.poll_id);
            let frame = event(
                "poll-vote",
                serde_json::json!({
                    "pollId": request.poll_id,
                    "optionId": request.option_id,
                    "userName": request.user_name,
                    "vote": outcome,
                    "poll": poll,
                }),
            );
            broadcast_to_meeting(&state, &room_id, None, &frame).await;
            Ok(Json(serde_json::json!({
                "success": true,
                "vote": outcome,
                "polls": polls,
            })))
        }
        SignalRequest::PollHeartbeat(poll) => {
            let poll = store.restore_poll(&room_id, poll).await?;
            let polls = store.list_polls(&room_id).await?;
            Ok(Json(serde_json::json!({
                "success": true,
                "poll": poll,
                "polls": polls,
            })))
        }
    }
}

/// Reads one collection: `hands`, `messages` (with optional `sinceId`),
/// `polls`, or reactions for anything else.
pub async fn list(
    State(state): State<AppState>,
    query: Result<Query<SignalQuery>, QueryRejection>,
) -> Result<Json<Value>, ApiError> {
    let Query(query) = query?;
    let room_id = query.room()?;
    let store = &state.store;

    let body = match query.kind.as_deref() {
        Some("hands") => serde_json::json!({
            "success": true,
            "hands": store.list_raised_hands(&room_id).await?,
        }),
        Some("messages") => serde_json::json!({
            "success": true,
            "messages": store.list_messages(&room_id, query.since_id.as_deref()).await?,
        }),
        Some("polls") => serde_json::json!({
            "success": true,
            "polls": store.list_polls(&room_id).await?,
        }),
        _ => serde_json::json!({
            "success": true,
            "reactions": store.list_reactions(&room_id).await?,
        }),
    };
    Ok(Json(body))
}
