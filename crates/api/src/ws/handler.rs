use axum::{
    extract::{State, WebSocketUpgrade, ws::{Message, WebSocket}},
    response::Response,
};
use futures::{SinkExt, StreamExt};
use rendezvous_services::model::PeerRegistration;
use rendezvous_services::room_registry::Departure;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::dispatcher::{self, event};
use super::protocol::{ClientEvent, HandRaiseRequest, JoinMeeting, MediaState, PollVoteRequest};
use crate::state::AppState;

pub async fn ws_upgrade(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let connection_id = Uuid::new_v4().to_string();
    info!(%connection_id, "WebSocket connected");

    let (sender, mut receiver) = socket.split();
    let sender = Arc::new(Mutex::new(sender));

    state.ws_storage.add(connection_id.clone(), sender.clone());

    let connected = event("connected", serde_json::json!({ "connectionId": connection_id }));
    dispatcher::send_to_connection(&state.ws_storage, &connection_id, &connected).await;

    while let Some(msg) = receiver.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                handle_client_message(&state, &connection_id, &text).await;
            }
            Ok(Message::Ping(data)) => {
                let mut guard = sender.lock().await;
                let _ = guard.send(Message::Pong(data)).await;
            }
            Ok(Message::Close(_)) => {
                break;
            }
            Err(e) => {
                warn!(%connection_id, %e, "WebSocket error");
                break;
            }
            _ => {}
        }
    }

    state.ws_storage.remove(&connection_id);
    if let Some(departure) = state.rooms.leave(&connection_id) {
        announce_departure(&state, &departure).await;
    }

    info!(%connection_id, "WebSocket disconnected");
}

async fn handle_client_message(state: &AppState, connection_id: &str, text: &str) {
    let parsed: ClientEvent = match serde_json::from_str(text) {
        Ok(event) => event,
        Err(e) => {
            debug!(%connection_id, %e, "Unparseable WS frame");
            send_error(state, connection_id, "Malformed message").await;
            return;
        }
    };

    match parsed {
        ClientEvent::Ping => {
            dispatcher::send_to_connection(&state.ws_storage, connection_id, &serde_json::json!({ "type": "pong" }))
                .await;
        }
        ClientEvent::JoinMeeting(join) => handle_join(state, connection_id, join).await,
        ClientEvent::LeaveMeeting => {
            if let Some(departure) = state.rooms.leave(connection_id) {
                announce_departure(state, &departure).await;
            }
        }
        ClientEvent::ChatMessage(message) => {
            let Some(meeting_id) = joined_meeting(state, connection_id).await else {
                return;
            };
            match state.store.post_message(&meeting_id, message).await {
                Ok(message) => {
                    let frame = event("chat-message", serde_json::json!({ "message": message }));
                    dispatcher::broadcast_to_meeting(state, &meeting_id, None, &frame).await;
                }
                Err(e) => send_error(state, connection_id, &e.to_string()).await,
            }
        }
        ClientEvent::Reaction(reaction) => {
            let Some(meeting_id) = joined_meeting(state, connection_id).await else {
                return;
            };
            match state.store.post_reaction(&meeting_id, reaction).await {
                Ok(reaction) => {
                    let frame = event("reaction", serde_json::json!({ "reaction": reaction }));
                    dispatcher::broadcast_to_meeting(state, &meeting_id, None, &frame).await;
                }
                Err(e) => send_error(state, connection_id, &e.to_string()).await,
            }
        }
        ClientEvent::HandRaised(request) => handle_hand_raised(state, connection_id, request).await,
        ClientEvent::PollCreated(poll) => {
            let Some(meeting_id) = joined_meeting(state, connection_id).await else {
                return;
            };
            match state.store.create_poll(&meeting_id, poll).await {
                Ok(poll) => {
                    let frame = event("poll-created", serde_json::json!({ "poll": poll }));
                    dispatcher::broadcast_to_meeting(state, &meeting_id, None, &frame).await;
                }
                Err(e) => send_error(state, connection_id, &e.to_string()).await,
            }
        }
        ClientEvent::PollVote(request) => handle_poll_vote(state, connection_id, request).await,
        ClientEvent::MediaStateChange(media) => handle_media_state(state, connection_id, media).await,
        ClientEvent::StartScreenShare => handle_screen_share(state, connection_id, true).await,
        ClientEvent::StopScreenShare => handle_screen_share(state, connection_id, false).await,
    }
}

async fn handle_join(state: &AppState, connection_id: &str, join: JoinMeeting) {
    if join.meeting_id.trim().is_empty() || join.user_id.trim().is_empty() {
        send_error(state, connection_id, "meetingId and userId are required").await;
        return;
    }

    let admission = match state
        .directory
        .validate_participant(&join.meeting_id, join.user_email.as_deref())
        .await
    {
        Ok(admission) => admission,
        Err(e) => {
            warn!(%connection_id, meeting_id = %join.meeting_id, %e, "Directory check failed");
            send_error(state, connection_id, "Could not verify meeting access").await;
            return;
        }
    };
    if !admission.is_allowed {
        info!(%connection_id, meeting_id = %join.meeting_id, "Join denied");
        let frame = event("join-denied", serde_json::json!({ "reason": admission.reason }));
        dispatcher::send_to_connection(&state.ws_storage, connection_id, &frame).await;
        return;
    }

    let mut registration = PeerRegistration::new(&join.user_id, &join.user_name);
    if let Some(email) = join.user_email.as_deref() {
        registration = registration.with_contact(email);
    }
    let record = registration.into_record(None, state.clock.now());

    let outcome = state.rooms.join(connection_id, &join.meeting_id, record);
    if let Some(previous) = &outcome.previous {
        announce_departure(state, previous).await;
    }

    let existing = event(
        "existing-participants",
        serde_json::json!({ "participants": outcome.existing }),
    );
    dispatcher::send_to_connection(&state.ws_storage, connection_id, &existing).await;

    // Late joiners catch up on the meeting's ephemeral state.
    let snapshot = meeting_snapshot(state, &join.meeting_id).await;
    dispatcher::send_to_connection(&state.ws_storage, connection_id, &snapshot).await;

    if let Some(participant) = state.rooms.participant(connection_id) {
        let joined = event("user-joined", serde_json::json!({ "participant": participant }));
        dispatcher::broadcast_to_meeting(state, &join.meeting_id, Some(connection_id), &joined).await;
    }

    if let Err(e) = state
        .directory
        .add_participant(&join.meeting_id, join.user_email.as_deref(), &join.user_name)
        .await
    {
        warn!(%connection_id, meeting_id = %join.meeting_id, %e, "Failed to record participant");
    }
}

async fn meeting_snapshot(state: &AppState, meeting_id: &str) -> serde_json::Value {
    let messages = state.store.list_messages(meeting_id, None).await.unwrap_or_default();
    let polls = state.store.list_polls(meeting_id).await.unwrap_or_default();
    let hands = state.store.list_raised_hands(meeting_id).await.unwrap_or_default();
    event(
        "meeting-state",
        serde_json::json!({
            "messages": messages,
            "polls": polls,
            "hands": hands,
        }),
    )
}

async fn handle_hand_raised(state: &AppState, connection_id: &str, request: HandRaiseRequest) {
    let Some(participant) = state.rooms.participant(connection_id) else {
        send_error(state, connection_id, "Join a meeting first").await;
        return;
    };
    let peer_id = participant.peer.peer_id.clone();
    let user_name = request
        .user_name
        .unwrap_or_else(|| participant.peer.display_name.clone());

    if let Err(e) = state
        .store
        .raise_hand(&participant.meeting_id, &peer_id, &user_name, request.is_raised)
        .await
    {
        send_error(state, connection_id, &e.to_string()).await;
        return;
    }

    let frame = event(
        "hand-raised",
        serde_json::json!({
            "peerId": peer_id,
            "userName": user_name,
            "isRaised": request.is_raised,
        }),
    );
    dispatcher::broadcast_to_meeting(state, &participant.meeting_id, None, &frame).await;
}

async fn handle_poll_vote(state: &AppState, connection_id: &str, request: PollVoteRequest) {
    let Some(meeting_id) = joined_meeting(state, connection_id).await else {
        return;
    };
    let outcome = match state
        .store
        .vote(&meeting_id, &request.poll_id, &request.option_id, &request.user_name)
        .await
    {
        Ok(outcome) => outcome,
        Err(e) => {
            send_error(state, connection_id, &e.to_string()).await;
            return;
        }
    };
    if !outcome.is_applied() {
        send_error(state, connection_id, "Poll or option not found").await;
        return;
    }

    let poll = state
        .store
        .list_polls(&meeting_id)
        .await
        .unwrap_or_default()
        .into_iter()
        .find(|p| p.id == request.poll_id);
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
    dispatcher::broadcast_to_meeting(state, &meeting_id, None, &frame).await;
}

async fn handle_media_state(state: &AppState, connection_id: &str, media: MediaState) {
    let Some(participant) = state
        .rooms
        .update_media(connection_id, media.audio_enabled, media.video_enabled)
    else {
        send_error(state, connection_id, "Join a meeting first").await;
        return;
    };
    let frame = event(
        "media-state-change",
        serde_json::json!({
            "connectionId": connection_id,
            "peerId": participant.peer.peer_id,
            "audioEnabled": participant.audio_enabled,
            "videoEnabled": participant.video_enabled,
        }),
    );
    dispatcher::broadcast_to_meeting(state, &participant.meeting_id, Some(connection_id), &frame).await;
}

async fn handle_screen_share(state: &AppState, connection_id: &str, sharing: bool) {
    let Some(participant) = state.rooms.set_screen_sharing(connection_id, sharing) else {
        send_error(state, connection_id, "Join a meeting first").await;
        return;
    };
    let kind = if sharing {
        "start-screen-share"
    } else {
        "stop-screen-share"
    };
    let frame = event(
        kind,
        serde_json::json!({
            "connectionId": connection_id,
            "peerId": participant.peer.peer_id,
            "userName": participant.peer.display_name,
        }),
    );
    dispatcher::broadcast_to_meeting(state, &participant.meeting_id, Some(connection_id), &frame).await;
}

async fn announce_departure(state: &AppState, departure: &Departure) {
    let participant = &departure.participant;
    let frame = event(
        "user-left",
        serde_json::json!({
            "connectionId": participant.connection_id,
            "peerId": participant.peer.peer_id,
            "userName": participant.peer.display_name,
        }),
    );
    dispatcher::broadcast(&state.ws_storage, &departure.remaining, &frame).await;
}

/// Meeting of a connection, or an error frame back to it when it has none.
async fn joined_meeting(state: &AppState, connection_id: &str) -> Option<String> {
    let meeting_id = state.rooms.meeting_of(connection_id);
    if meeting_id.is_none() {
        send_error(state, connection_id, "Join a meeting first").await;
    }
    meeting_id
}

async fn send_error(state: &AppState, connection_id: &str, message: &str) {
    let frame = event("error", serde_json::json!({ "message": message }));
    dispatcher::send_to_connection(&state.ws_storage, connection_id, &frame).await;
}
