use crate::fixtures::test_app::TestApp;
use chrono::Duration as ChronoDuration;
use rendezvous_client::{
    DiscoveryConfig, DiscoveryState, MeetingSession, SessionConfig, SignalingTransport,
    loopback::{FakeDevices, LoopbackNetwork},
};
use std::sync::Arc;
use std::time::Duration;

fn fast_config() -> SessionConfig {
    SessionConfig {
        discovery: DiscoveryConfig {
            discovery_interval: Duration::from_millis(100),
            heartbeat_interval: Duration::from_millis(200),
            max_jitter: Duration::ZERO,
        },
        event_poll_interval: Duration::from_millis(100),
        hand_raise_heartbeat: Duration::from_millis(200),
        poll_heartbeat: Duration::from_millis(200),
        reaction_display: Duration::from_secs(3),
    }
}

async fn join(app: &TestApp, net: &Arc<LoopbackNetwork>, id: &str, name: &str) -> MeetingSession {
    let transport: Arc<dyn SignalingTransport> = Arc::new(app.transport());
    MeetingSession::join(
        transport,
        net.endpoint_with_id(id),
        &FakeDevices::default(),
        "standup",
        name,
        None,
        fast_config(),
    )
    .await
    .expect("join failed")
}

/// Polls `check` every 50ms for up to 5s.
async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    check()
}

#[tokio::test]
async fn two_clients_discover_and_connect_over_http() {
    let app = TestApp::spawn().await;
    let net = LoopbackNetwork::new();

    let ann = join(&app, &net, "peer-a", "Ann").await;
    let bob = join(&app, &net, "peer-b", "Bob").await;
    assert_eq!(ann.discovery_state(), DiscoveryState::Active);

    assert!(
        eventually(|| {
            ann.calls().remote_streams().contains_key("peer-b")
                && bob.calls().remote_streams().contains_key("peer-a")
        })
        .await,
        "peers never connected"
    );

    // Several discovery ticks later each side still tracks exactly one call.
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(ann.calls().tracked_peers(), vec!["peer-b".to_string()]);
    assert_eq!(bob.calls().tracked_peers(), vec!["peer-a".to_string()]);

    let (_, body) = app.lookup("standup").await;
    assert_eq!(body["totalPeers"], 2);
}

#[tokio::test]
async fn chat_and_votes_converge_between_clients() {
    let app = TestApp::spawn().await;
    let net = LoopbackNetwork::new();
    let ann = join(&app, &net, "peer-a", "Ann").await;
    let bob = join(&app, &net, "peer-b", "Bob").await;

    let sent = ann.send_message("hello bob", None).await.unwrap();
    let poll = ann.create_poll("Ship it?", &["yes", "no"]).await.unwrap();
    bob.vote(&poll.id, "opt-0").await.unwrap();
    ann.vote(&poll.id, "opt-1").await.unwrap();

    ann.refresh().await;
    bob.refresh().await;

    let bob_messages = bob.messages();
    assert_eq!(bob_messages.len(), 1);
    assert_eq!(bob_messages[0].id, sent.id);

    let ann_view = ann.polls();
    let bob_view = bob.polls();
    assert_eq!(ann_view, bob_view);
    assert_eq!(ann_view[0].options[0].voters, vec!["Bob".to_string()]);
    assert_eq!(ann_view[0].options[1].voters, vec!["Ann".to_string()]);
}

#[tokio::test]
async fn stale_registration_is_never_dialed() {
    let app = TestApp::spawn().await;
    let net = LoopbackNetwork::new();

    // A tab that vanished without unregistering.
    app.register("standup", "peer-ghost", "Ghost").await;
    app.clock.advance(ChronoDuration::seconds(16));

    let bob = join(&app, &net, "peer-b", "Bob").await;
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert!(bob.calls().tracked_peers().is_empty());
    assert_eq!(net.calls_placed(), 0);

    let (_, body) = app.lookup("standup").await;
    assert_eq!(body["totalPeers"], 1);
    assert_eq!(body["peers"][0]["peerId"], "peer-b");
}

#[tokio::test]
async fn leaving_unregisters_and_ends_the_call() {
    let app = TestApp::spawn().await;
    let net = LoopbackNetwork::new();
    let ann = join(&app, &net, "peer-a", "Ann").await;
    let bob = join(&app, &net, "peer-b", "Bob").await;
    assert!(eventually(|| ann.calls().remote_streams().contains_key("peer-b")).await);

    ann.set_hand_raised(true).await.unwrap();
    ann.leave().await.unwrap();

    let (_, body) = app.lookup("standup").await;
    assert_eq!(body["totalPeers"], 1);
    assert_eq!(body["peers"][0]["peerId"], "peer-b");

    let (_, body) = app.get_signal("standup", Some("hands")).await;
    assert!(body["hands"].as_array().unwrap().is_empty());

    assert!(
        eventually(|| bob.calls().tracked_peers().is_empty()).await,
        "bob still tracks a call to a departed peer"
    );
}
