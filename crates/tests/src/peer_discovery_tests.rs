use crate::fixtures::test_app::TestApp;
use chrono::Duration;

fn peer_ids(body: &serde_json::Value) -> Vec<String> {
    body["peers"]
        .as_array()
        .unwrap()
        .iter()
        .map(|p| p["peerId"].as_str().unwrap().to_string())
        .collect()
}

#[tokio::test]
async fn health_reports_backend() {
    let app = TestApp::spawn().await;
    let (status, body) = app.send_json(app.client.get(app.url("/health"))).await;
    assert_eq!(status, 200);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["store"], "memory");
}

#[tokio::test]
async fn register_returns_everyone_but_the_caller() {
    let app = TestApp::spawn().await;

    let (status, body) = app.register("m1", "peer-a", "Ann").await;
    assert_eq!(status, 200);
    assert_eq!(body["success"], true);
    assert_eq!(body["totalPeers"], 0);

    let (_, body) = app.register("m1", "peer-b", "Bob").await;
    assert_eq!(peer_ids(&body), vec!["peer-a"]);
    assert_eq!(body["peers"][0]["userName"], "Ann");
    assert_eq!(body["totalPeers"], 1);

    // Heartbeat from A sees B, not itself.
    let (_, body) = app.register("m1", "peer-a", "Ann").await;
    assert_eq!(peer_ids(&body), vec!["peer-b"]);
}

#[tokio::test]
async fn lookup_lists_all_live_peers_in_join_order() {
    let app = TestApp::spawn().await;
    app.register("m1", "peer-a", "Ann").await;
    app.clock.advance(Duration::seconds(1));
    app.register("m1", "peer-b", "Bob").await;
    app.register("other", "peer-c", "Cid").await;

    let (status, body) = app.lookup("m1").await;
    assert_eq!(status, 200);
    assert_eq!(peer_ids(&body), vec!["peer-a", "peer-b"]);
    assert_eq!(body["totalPeers"], 2);
}

#[tokio::test]
async fn lookup_of_unknown_meeting_is_empty() {
    let app = TestApp::spawn().await;
    let (status, body) = app.lookup("nobody-here").await;
    assert_eq!(status, 200);
    assert_eq!(body["totalPeers"], 0);
    assert!(body["peers"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn silent_peer_is_evicted_after_window() {
    let app = TestApp::spawn().await;
    app.register("m1", "peer-a", "Ann").await;
    app.register("m1", "peer-b", "Bob").await;

    app.clock.advance(Duration::seconds(10));
    app.register("m1", "peer-b", "Bob").await;
    app.clock.advance(Duration::seconds(6));

    // A last heartbeat 16s ago, B 6s ago.
    let (_, body) = app.lookup("m1").await;
    assert_eq!(peer_ids(&body), vec!["peer-b"]);
}

#[tokio::test]
async fn unregister_removes_peer_and_is_idempotent() {
    let app = TestApp::spawn().await;
    app.register("m1", "peer-a", "Ann").await;
    app.register("m1", "peer-b", "Bob").await;

    let delete = |user_id: &'static str| {
        app.client
            .delete(app.url("/peer-discovery?meetingId=m1"))
            .json(&serde_json::json!({ "userId": user_id }))
    };

    let (status, body) = app.send_json(delete("peer-a")).await;
    assert_eq!(status, 200);
    assert_eq!(body["message"], "Peer removed");

    let (status, body) = app.send_json(delete("peer-a")).await;
    assert_eq!(status, 200);
    assert_eq!(body["message"], "Peer not registered");

    let (_, body) = app.lookup("m1").await;
    assert_eq!(peer_ids(&body), vec!["peer-b"]);
}

#[tokio::test]
async fn missing_meeting_id_is_rejected() {
    let app = TestApp::spawn().await;

    let (status, body) = app.send_json(app.client.get(app.url("/peer-discovery"))).await;
    assert_eq!(status, 400);
    assert_eq!(body["success"], false);
    assert!(body["error"].as_str().unwrap().contains("meetingId"));

    let (status, _) = app.register("", "peer-a", "Ann").await;
    assert_eq!(status, 400);
}

#[tokio::test]
async fn missing_user_id_is_rejected() {
    let app = TestApp::spawn().await;
    let (status, body) = app
        .send_json(
            app.client
                .post(app.url("/peer-discovery?meetingId=m1"))
                .json(&serde_json::json!({ "userName": "Ann" })),
        )
        .await;
    assert_eq!(status, 400);
    assert!(body["error"].as_str().unwrap().contains("userId"));

    let (_, body) = app.lookup("m1").await;
    assert_eq!(body["totalPeers"], 0);
}

#[tokio::test]
async fn api_prefix_serves_the_same_routes() {
    let app = TestApp::spawn().await;
    app.register("m1", "peer-a", "Ann").await;

    let (status, body) = app
        .send_json(app.client.get(app.url("/api/peer-discovery?meetingId=m1")))
        .await;
    assert_eq!(status, 200);
    assert_eq!(peer_ids(&body), vec!["peer-a"]);
}

#[tokio::test]
async fn allow_list_refuses_uninvited_email() {
    let app = TestApp::spawn_with_settings(|s| {
        s.directory
            .allowed
            .insert("board".to_string(), vec!["ann@example.com".to_string()]);
    })
    .await;

    let register = |email: &'static str, user_id: &'static str| {
        app.client
            .post(app.url("/peer-discovery?meetingId=board"))
            .json(&serde_json::json!({
                "userId": user_id,
                "userName": "Someone",
                "userEmail": email,
            }))
    };

    let (status, body) = app.send_json(register("eve@example.com", "peer-e")).await;
    assert_eq!(status, 403);
    assert_eq!(body["success"], false);

    let (status, _) = app.send_json(register("Ann@example.com", "peer-a")).await;
    assert_eq!(status, 200);

    let (_, body) = app.lookup("board").await;
    assert_eq!(peer_ids(&body), vec!["peer-a"]);
}
