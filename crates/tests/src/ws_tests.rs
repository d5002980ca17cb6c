use crate::fixtures::test_app::TestApp;
use serde_json::json;
use std::time::Duration;

const QUIET: Duration = Duration::from_millis(300);

#[tokio::test]
async fn join_lists_existing_and_announces_newcomer() {
    let app = TestApp::spawn().await;
    let mut ann = app.ws().await;
    let mut bob = app.ws().await;

    let existing = ann.join("m1", "peer-a", "Ann").await;
    assert!(existing["participants"].as_array().unwrap().is_empty());

    let existing = bob.join("m1", "peer-b", "Bob").await;
    let participants = existing["participants"].as_array().unwrap();
    assert_eq!(participants.len(), 1);
    assert_eq!(participants[0]["peerId"], "peer-a");
    assert_eq!(participants[0]["userName"], "Ann");

    let joined = ann.expect("user-joined").await;
    assert_eq!(joined["participant"]["peerId"], "peer-b");
    assert_eq!(joined["participant"]["connectionId"], bob.connection_id.as_str());

    // The joiner is not told about itself.
    bob.expect_none("user-joined", QUIET).await;
}

#[tokio::test]
async fn joiner_receives_current_meeting_state() {
    let app = TestApp::spawn().await;
    app.post_signal("m1", json!({ "message": { "authorName": "Ann", "body": "earlier" } }))
        .await;

    let mut bob = app.ws().await;
    bob.send(
        "join-meeting",
        json!({ "meetingId": "m1", "userId": "peer-b", "userName": "Bob" }),
    )
    .await;
    let state = bob.expect("meeting-state").await;
    assert_eq!(state["messages"][0]["body"], "earlier");
    assert!(state["polls"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn chat_is_pushed_to_every_member() {
    let app = TestApp::spawn().await;
    let mut ann = app.ws().await;
    let mut bob = app.ws().await;
    ann.join("m1", "peer-a", "Ann").await;
    bob.join("m1", "peer-b", "Bob").await;

    ann.send("chat-message", json!({ "authorName": "Ann", "body": "hi all" }))
        .await;

    let pushed = bob.expect("chat-message").await;
    assert_eq!(pushed["message"]["body"], "hi all");
    let echoed = ann.expect("chat-message").await;
    assert_eq!(echoed["message"]["id"], pushed["message"]["id"]);

    // Pushed writes land in the same store the pull binding reads.
    let (_, body) = app.get_signal("m1", Some("messages")).await;
    assert_eq!(body["messages"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn pull_writes_fan_out_to_push_members() {
    let app = TestApp::spawn().await;
    let mut ann = app.ws().await;
    ann.join("m1", "peer-a", "Ann").await;

    app.post_signal(
        "m1",
        json!({ "handRaise": { "peerId": "peer-z", "userName": "Zed", "isRaised": true } }),
    )
    .await;

    let raised = ann.expect("hand-raised").await;
    assert_eq!(raised["peerId"], "peer-z");
    assert_eq!(raised["isRaised"], true);
}

#[tokio::test]
async fn pushed_hand_raise_belongs_to_the_sender() {
    let app = TestApp::spawn().await;
    let mut ann = app.ws().await;
    let mut bob = app.ws().await;
    ann.join("m1", "peer-a", "Ann").await;
    bob.join("m1", "peer-b", "Bob").await;

    bob.send("hand-raised", json!({ "peerId": "peer-a", "isRaised": true }))
        .await;

    let raised = ann.expect("hand-raised").await;
    assert_eq!(raised["peerId"], "peer-b");
    assert_eq!(raised["userName"], "Bob");

    let (_, body) = app.get_signal("m1", Some("hands")).await;
    let hands = body["hands"].as_array().unwrap();
    assert_eq!(hands.len(), 1);
    assert_eq!(hands[0]["peerId"], "peer-b");
}

#[tokio::test]
async fn poll_vote_is_pushed_with_updated_poll() {
    let app = TestApp::spawn().await;
    let mut ann = app.ws().await;
    ann.join("m1", "peer-a", "Ann").await;

    ann.send(
        "poll-created",
        json!({
            "question": "Ship it?",
            "options": [{ "id": "y", "text": "Yes" }, { "id": "n", "text": "No" }],
            "createdBy": "Ann",
        }),
    )
    .await;
    let created = ann.expect("poll-created").await;
    let poll_id = created["poll"]["id"].as_str().unwrap().to_string();

    ann.send(
        "poll-vote",
        json!({ "pollId": poll_id, "optionId": "y", "userName": "Ann" }),
    )
    .await;
    let vote = ann.expect("poll-vote").await;
    assert_eq!(vote["vote"]["outcome"], "recorded");
    assert_eq!(vote["poll"]["options"][0]["voters"], json!(["Ann"]));
}

#[tokio::test]
async fn media_state_goes_to_others_only() {
    let app = TestApp::spawn().await;
    let mut ann = app.ws().await;
    let mut bob = app.ws().await;
    ann.join("m1", "peer-a", "Ann").await;
    bob.join("m1", "peer-b", "Bob").await;
    ann.expect("user-joined").await;

    ann.send(
        "media-state-change",
        json!({ "audioEnabled": false, "videoEnabled": true }),
    )
    .await;

    let change = bob.expect("media-state-change").await;
    assert_eq!(change["peerId"], "peer-a");
    assert_eq!(change["audioEnabled"], false);
    ann.expect_none("media-state-change", QUIET).await;

    ann.send("start-screen-share", json!(null)).await;
    let share = bob.expect("start-screen-share").await;
    assert_eq!(share["userName"], "Ann");
}

#[tokio::test]
async fn disconnect_announces_departure() {
    let app = TestApp::spawn().await;
    let mut ann = app.ws().await;
    let mut bob = app.ws().await;
    ann.join("m1", "peer-a", "Ann").await;
    bob.join("m1", "peer-b", "Bob").await;

    bob.close().await;

    let left = ann.expect("user-left").await;
    assert_eq!(left["peerId"], "peer-b");
    assert_eq!(left["userName"], "Bob");

    let (_, health) = app.send_json(app.client.get(app.url("/health"))).await;
    assert_eq!(health["connections"], 1);
    assert_eq!(health["meetings"], 1);
}

#[tokio::test]
async fn explicit_leave_announces_departure() {
    let app = TestApp::spawn().await;
    let mut ann = app.ws().await;
    let mut bob = app.ws().await;
    ann.join("m1", "peer-a", "Ann").await;
    bob.join("m1", "peer-b", "Bob").await;

    bob.send("leave-meeting", json!(null)).await;
    let left = ann.expect("user-left").await;
    assert_eq!(left["peerId"], "peer-b");

    // Bob no longer receives the meeting's traffic.
    ann.send("chat-message", json!({ "authorName": "Ann", "body": "still here?" }))
        .await;
    bob.expect_none("chat-message", QUIET).await;
}

#[tokio::test]
async fn actions_before_join_are_errors() {
    let app = TestApp::spawn().await;
    let mut ann = app.ws().await;

    ann.send("chat-message", json!({ "authorName": "Ann", "body": "hello?" }))
        .await;
    let error = ann.expect("error").await;
    assert!(error["message"].as_str().unwrap().contains("Join"));

    ann.send("whiteboard-stroke", json!({})).await;
    let error = ann.expect("error").await;
    assert_eq!(error["message"], "Malformed message");
}

#[tokio::test]
async fn ping_gets_pong() {
    let app = TestApp::spawn().await;
    let mut ann = app.ws().await;
    ann.send("ping", json!(null)).await;
    let frame = ann.next_frame(Duration::from_secs(5)).await.unwrap();
    assert_eq!(frame["type"], "pong");
}

#[tokio::test]
async fn allow_list_denies_uninvited_join() {
    let app = TestApp::spawn_with_settings(|s| {
        s.directory
            .allowed
            .insert("board".to_string(), vec!["ann@example.com".to_string()]);
    })
    .await;
    let mut eve = app.ws().await;

    eve.send(
        "join-meeting",
        json!({
            "meetingId": "board",
            "userId": "peer-e",
            "userName": "Eve",
            "userEmail": "eve@example.com",
        }),
    )
    .await;
    let denied = eve.expect("join-denied").await;
    assert!(denied["reason"].as_str().is_some());
    assert_eq!(app.lookup("board").await.1["totalPeers"], 0);
}
