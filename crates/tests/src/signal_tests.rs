use crate::fixtures::test_app::TestApp;
use chrono::Duration;
use rendezvous_client::SignalingTransport;
use rendezvous_services::model::VoteOutcome;
use serde_json::json;

async fn create_poll(app: &TestApp, room: &str) -> serde_json::Value {
    let (status, body) = app
        .post_signal(
            room,
            json!({
                "type": "poll",
                "poll": {
                    "question": "Lunch?",
                    "options": [{ "text": "Pizza" }, { "text": "Sushi" }],
                    "createdBy": "Ann",
                },
            }),
        )
        .await;
    assert_eq!(status, 200, "poll create failed: {}", body);
    body["poll"].clone()
}

async fn vote(app: &TestApp, room: &str, poll_id: &str, option_id: &str, user: &str) -> (u16, serde_json::Value) {
    app.post_signal(
        room,
        json!({
            "type": "pollVote",
            "pollId": poll_id,
            "optionId": option_id,
            "userName": user,
            "previousVote": null,
        }),
    )
    .await
}

#[tokio::test]
async fn message_post_returns_full_log_and_dedups_by_id() {
    let app = TestApp::spawn().await;
    let message = json!({ "message": { "id": "m-1", "authorName": "Ann", "body": "hello" } });

    let (status, body) = app.post_signal("r1", message.clone()).await;
    assert_eq!(status, 200);
    assert_eq!(body["success"], true);
    assert_eq!(body["message"]["id"], "m-1");
    assert_eq!(body["messages"].as_array().unwrap().len(), 1);

    // A retried delivery of the same message is stored once.
    let (_, body) = app.post_signal("r1", message).await;
    assert_eq!(body["messages"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn messages_since_cursor() {
    let app = TestApp::spawn().await;
    for (id, text) in [("m-1", "one"), ("m-2", "two"), ("m-3", "three")] {
        app.post_signal("r1", json!({ "message": { "id": id, "authorName": "Ann", "body": text } }))
            .await;
        app.clock.advance(Duration::milliseconds(10));
    }

    let (status, body) = app
        .send_json(app.client.get(app.url("/signal?roomId=r1&type=messages&sinceId=m-1")))
        .await;
    assert_eq!(status, 200);
    let bodies: Vec<&str> = body["messages"]
        .as_array()
        .unwrap()
        .iter()
        .map(|m| m["body"].as_str().unwrap())
        .collect();
    assert_eq!(bodies, vec!["two", "three"]);

    // Unknown cursor falls back to the whole log.
    let (_, body) = app
        .send_json(app.client.get(app.url("/signal?roomId=r1&type=messages&sinceId=gone")))
        .await;
    assert_eq!(body["messages"].as_array().unwrap().len(), 3);
}

#[tokio::test]
async fn reply_preview_survives_the_round_trip() {
    let app = TestApp::spawn().await;
    app.post_signal(
        "r1",
        json!({ "message": {
            "id": "m-2", "authorName": "Bob", "body": "agreed",
            "replyToId": "m-1", "replyPreview": "shall we ship"
        } }),
    )
    .await;

    let (_, body) = app.get_signal("r1", Some("messages")).await;
    assert_eq!(body["messages"][0]["replyToId"], "m-1");
    assert_eq!(body["messages"][0]["replyPreview"], "shall we ship");
}

#[tokio::test]
async fn empty_message_body_is_rejected() {
    let app = TestApp::spawn().await;
    let (status, body) = app
        .post_signal("r1", json!({ "message": { "authorName": "Ann", "body": "  " } }))
        .await;
    assert_eq!(status, 400);
    assert_eq!(body["success"], false);

    let (_, body) = app.get_signal("r1", Some("messages")).await;
    assert!(body["messages"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn poll_vote_is_idempotent_and_can_move() {
    let app = TestApp::spawn().await;
    let poll = create_poll(&app, "r1").await;
    let poll_id = poll["id"].as_str().unwrap();
    assert_eq!(poll["options"][0]["voters"], json!([]));

    let (status, body) = vote(&app, "r1", poll_id, "opt-0", "Bob").await;
    assert_eq!(status, 200);
    assert_eq!(body["vote"]["outcome"], "recorded");

    let (_, body) = vote(&app, "r1", poll_id, "opt-0", "Bob").await;
    assert_eq!(body["vote"]["outcome"], "unchanged");
    assert_eq!(body["polls"][0]["options"][0]["voters"], json!(["Bob"]));

    let (_, body) = vote(&app, "r1", poll_id, "opt-1", "Bob").await;
    assert_eq!(body["vote"]["outcome"], "moved");
    assert_eq!(body["vote"]["from"], "opt-0");
    assert_eq!(body["polls"][0]["options"][0]["voters"], json!([]));
    assert_eq!(body["polls"][0]["options"][1]["voters"], json!(["Bob"]));
}

#[tokio::test]
async fn vote_on_unknown_poll_or_option_is_not_found() {
    let app = TestApp::spawn().await;
    let (status, body) = vote(&app, "r1", "missing", "opt-0", "Bob").await;
    assert_eq!(status, 404);
    assert_eq!(body["error"], "Poll not found");
    assert_eq!(body["code"], "unknown_poll");

    let poll = create_poll(&app, "r1").await;
    let (status, body) = vote(&app, "r1", poll["id"].as_str().unwrap(), "opt-9", "Bob").await;
    assert_eq!(status, 404);
    assert_eq!(body["error"], "Poll option not found");
    assert_eq!(body["code"], "unknown_option");
}

#[tokio::test]
async fn http_transport_reads_refused_vote_codes() {
    let app = TestApp::spawn().await;
    let transport = app.transport();

    let outcome = transport
        .vote("r1", "missing", "opt-0", "Bob", None)
        .await
        .unwrap();
    assert_eq!(outcome, VoteOutcome::UnknownPoll);

    let poll = create_poll(&app, "r1").await;
    let outcome = transport
        .vote("r1", poll["id"].as_str().unwrap(), "opt-9", "Bob", None)
        .await
        .unwrap();
    assert_eq!(outcome, VoteOutcome::UnknownOption);
}

#[tokio::test]
async fn poll_heartbeat_restores_evicted_poll() {
    let app = TestApp::spawn_with_settings(|s| s.events.idle_bucket_ttl_secs = 60).await;
    let poll = create_poll(&app, "r1").await;
    let (_, voted) = vote(&app, "r1", poll["id"].as_str().unwrap(), "opt-1", "Bob").await;
    let last_known = voted["polls"][0].clone();

    app.clock.advance(Duration::seconds(120));
    app.store.sweep_idle().await.unwrap();
    let (_, body) = app.get_signal("r1", Some("polls")).await;
    assert!(body["polls"].as_array().unwrap().is_empty());

    let (status, body) = app
        .post_signal("r1", json!({ "type": "pollHeartbeat", "poll": last_known }))
        .await;
    assert_eq!(status, 200);
    assert_eq!(body["polls"].as_array().unwrap().len(), 1);
    assert_eq!(body["poll"]["options"][1]["voters"], json!(["Bob"]));
}

#[tokio::test]
async fn hand_raise_lower_and_expiry() {
    let app = TestApp::spawn().await;
    let raise = |peer: &str, raised: bool| {
        json!({ "handRaise": { "peerId": peer, "userName": peer.to_uppercase(), "isRaised": raised } })
    };

    let (status, body) = app.post_signal("r1", raise("p1", true)).await;
    assert_eq!(status, 200);
    assert_eq!(body["hands"][0]["peerId"], "p1");

    app.post_signal("r1", raise("p2", true)).await;
    let (_, body) = app.post_signal("r1", raise("p1", false)).await;
    let hands = body["hands"].as_array().unwrap();
    assert_eq!(hands.len(), 1);
    assert_eq!(hands[0]["peerId"], "p2");

    // No refresh within the TTL lowers the hand.
    app.clock.advance(Duration::seconds(31));
    let (_, body) = app.get_signal("r1", Some("hands")).await;
    assert!(body["hands"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn hand_raise_without_peer_id_is_rejected() {
    let app = TestApp::spawn().await;
    let (status, _) = app
        .post_signal("r1", json!({ "handRaise": { "isRaised": true } }))
        .await;
    assert_eq!(status, 400);
}

#[tokio::test]
async fn reactions_are_the_default_read_and_expire() {
    let app = TestApp::spawn().await;
    let (status, body) = app
        .post_signal("r1", json!({ "reaction": { "emoji": "🎉", "authorName": "Ann" } }))
        .await;
    assert_eq!(status, 200);
    assert_eq!(body["reaction"]["emoji"], "🎉");

    let (_, body) = app.get_signal("r1", None).await;
    assert_eq!(body["reactions"].as_array().unwrap().len(), 1);

    app.clock.advance(Duration::seconds(11));
    let (_, body) = app.get_signal("r1", None).await;
    assert!(body["reactions"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn malformed_requests_are_bad_requests() {
    let app = TestApp::spawn().await;

    let (status, body) = app.post_signal("r1", json!({ "whiteboard": {} })).await;
    assert_eq!(status, 400);
    assert_eq!(body["success"], false);

    let (status, _) = app
        .send_json(app.client.get(app.url("/signal?type=messages")))
        .await;
    assert_eq!(status, 400);

    let (status, _) = app
        .send_json(
            app.client
                .post(app.url("/signal?roomId=r1"))
                .header("content-type", "application/json")
                .body("{not json"),
        )
        .await;
    assert_eq!(status, 400);
}

#[tokio::test]
async fn rooms_are_isolated() {
    let app = TestApp::spawn().await;
    app.post_signal("r1", json!({ "message": { "authorName": "Ann", "body": "only here" } }))
        .await;

    let (_, body) = app.get_signal("r2", Some("messages")).await;
    assert!(body["messages"].as_array().unwrap().is_empty());
}
