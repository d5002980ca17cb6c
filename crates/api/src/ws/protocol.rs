use rendezvous_services::model::{NewChatMessage, NewPoll, NewReaction};
use serde::Deserialize;

/// Frames a client sends over the push binding, as `{type, data}`.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", content = "data")]
#[serde(rename_all = "kebab-case")]
pub enum ClientEvent {
    JoinMeeting(JoinMeeting),
    LeaveMeeting,
    ChatMessage(NewChatMessage),
    Reaction(NewReaction),
    HandRaised(HandRaiseRequest),
    PollCreated(NewPoll),
    PollVote(PollVoteRequest),
    MediaStateChange(MediaState),
    StartScreenShare,
    StopScreenShare,
    Ping,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinMeeting {
    pub meeting_id: String,
    pub user_id: String,
    #[serde(default)]
    pub user_name: String,
    #[serde(default)]
    pub user_email: Option<String>,
}

/// Shared by the push event and the `handRaise` pull body.
/// The hand always belongs to the sending connection; a `peerId` in the
/// payload is ignored.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandRaiseRequest {
    #[serde(default)]
    pub user_name: Option<String>,
    pub is_raised: bool,
}

/// `previousVote` is accepted for compatibility; the store derives it.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PollVoteRequest {
    pub poll_id: String,
    pub option_id: String,
    pub user_name: String,
    #[serde(default)]
    pub previous_vote: Option<String>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaState {
    pub audio_enabled: bool,
    pub video_enabled: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_join_meeting() {
        let frame = r#"{"type":"join-meeting","data":{"meetingId":"room1","userId":"p1","userName":"Ann"}}"#;
        let ClientEvent::JoinMeeting(join) = serde_json::from_str(frame).unwrap() else {
            panic!("wrong variant");
        };
        assert_eq!(join.meeting_id, "room1");
        assert_eq!(join.user_id, "p1");
        assert!(join.user_email.is_none());
    }

    #[test]
    fn parses_unit_events_without_data() {
        let event: ClientEvent = serde_json::from_str(r#"{"type":"leave-meeting"}"#).unwrap();
        assert!(matches!(event, ClientEvent::LeaveMeeting));
        let event: ClientEvent = serde_json::from_str(r#"{"type":"start-screen-share"}"#).unwrap();
        assert!(matches!(event, ClientEvent::StartScreenShare));
    }

    #[test]
    fn parses_poll_vote_with_previous_vote() {
        let frame = r#"{"type":"poll-vote","data":{"pollId":"p","optionId":"opt-1","userName":"Ann","previousVote":"opt-0"}}"#;
        let ClientEvent::PollVote(vote) = serde_json::from_str(frame).unwrap() else {
            panic!("wrong variant");
        };
        assert_eq!(vote.option_id, "opt-1");
        assert_eq!(vote.previous_vote.as_deref(), Some("opt-0"));
    }

    #[test]
    fn rejects_unknown_event() {
        assert!(serde_json::from_str::<ClientEvent>(r#"{"type":"typing","data":{}}"#).is_err());
    }
}
